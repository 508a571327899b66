//! Binary Gearman wire protocol.
//!
//! Every packet is a 12-byte header (4-byte magic, 4-byte big-endian
//! command code, 4-byte big-endian payload length) followed by the
//! payload. Payload arguments are separated by NUL bytes; the last
//! argument is unterminated and may itself contain NULs, so splitting
//! is arity-aware per command.

pub mod packet;

pub use packet::{
    split_args, Command, Packet, PacketHeader, ProtocolError, HEADER_LEN, MAX_PAYLOAD_LEN,
    REQ_MAGIC, RES_MAGIC,
};
