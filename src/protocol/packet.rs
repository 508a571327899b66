use thiserror::Error;

/// Magic prefix on packets sent by clients and workers.
pub const REQ_MAGIC: [u8; 4] = *b"\0REQ";
/// Magic prefix on packets sent by the broker.
pub const RES_MAGIC: [u8; 4] = *b"\0RES";

pub const HEADER_LEN: usize = 12;

/// Payloads above this are treated as an unrecoverable framing error.
pub const MAX_PAYLOAD_LEN: usize = 16 * 1024 * 1024;

#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("bad packet magic {0:?}")]
    BadMagic([u8; 4]),

    #[error("unknown command code {0}")]
    UnknownCommand(u32),

    #[error("payload length {0} exceeds limit")]
    PayloadTooLarge(usize),

    #[error("command {cmd:?} expects {expected} arguments, got {got}")]
    WrongArgumentCount {
        cmd: Command,
        expected: usize,
        got: usize,
    },

    #[error("argument is not valid UTF-8")]
    InvalidUtf8,
}

/// Gearman command codes. Values are fixed by the protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum Command {
    CanDo = 1,
    CantDo = 2,
    ResetAbilities = 3,
    PreSleep = 4,
    Noop = 6,
    SubmitJob = 7,
    JobCreated = 8,
    GrabJob = 9,
    NoJob = 10,
    JobAssign = 11,
    WorkStatus = 12,
    WorkComplete = 13,
    WorkFail = 14,
    SubmitJobBg = 18,
    SubmitJobHigh = 21,
    SetClientId = 22,
    CanDoTimeout = 23,
    WorkException = 25,
    WorkData = 28,
    WorkWarning = 29,
    GrabJobUniq = 30,
    JobAssignUniq = 31,
    SubmitJobHighBg = 32,
    SubmitJobLow = 33,
    SubmitJobLowBg = 34,
}

impl Command {
    pub fn from_code(code: u32) -> Result<Self, ProtocolError> {
        let cmd = match code {
            1 => Command::CanDo,
            2 => Command::CantDo,
            3 => Command::ResetAbilities,
            4 => Command::PreSleep,
            6 => Command::Noop,
            7 => Command::SubmitJob,
            8 => Command::JobCreated,
            9 => Command::GrabJob,
            10 => Command::NoJob,
            11 => Command::JobAssign,
            12 => Command::WorkStatus,
            13 => Command::WorkComplete,
            14 => Command::WorkFail,
            18 => Command::SubmitJobBg,
            21 => Command::SubmitJobHigh,
            22 => Command::SetClientId,
            23 => Command::CanDoTimeout,
            25 => Command::WorkException,
            28 => Command::WorkData,
            29 => Command::WorkWarning,
            30 => Command::GrabJobUniq,
            31 => Command::JobAssignUniq,
            32 => Command::SubmitJobHighBg,
            33 => Command::SubmitJobLow,
            34 => Command::SubmitJobLowBg,
            other => return Err(ProtocolError::UnknownCommand(other)),
        };
        Ok(cmd)
    }

    pub fn code(self) -> u32 {
        self as u32
    }

    /// Fixed argument count for request packets the broker accepts.
    /// The last argument absorbs any remaining NUL bytes.
    pub fn request_arity(self) -> usize {
        match self {
            Command::CanDo | Command::CantDo | Command::SetClientId => 1,
            Command::CanDoTimeout => 2,
            Command::ResetAbilities
            | Command::PreSleep
            | Command::Noop
            | Command::GrabJob
            | Command::GrabJobUniq => 0,
            Command::SubmitJob
            | Command::SubmitJobBg
            | Command::SubmitJobHigh
            | Command::SubmitJobHighBg
            | Command::SubmitJobLow
            | Command::SubmitJobLowBg => 3,
            Command::WorkStatus => 3,
            Command::WorkComplete
            | Command::WorkData
            | Command::WorkWarning
            | Command::WorkException => 2,
            Command::WorkFail => 1,
            // Response-only commands carry no request arity; treat any
            // payload as a single opaque argument.
            Command::JobCreated | Command::NoJob | Command::JobAssign | Command::JobAssignUniq => 1,
        }
    }

    pub fn is_submit(self) -> bool {
        matches!(
            self,
            Command::SubmitJob
                | Command::SubmitJobBg
                | Command::SubmitJobHigh
                | Command::SubmitJobHighBg
                | Command::SubmitJobLow
                | Command::SubmitJobLowBg
        )
    }

    pub fn is_background_submit(self) -> bool {
        matches!(
            self,
            Command::SubmitJobBg | Command::SubmitJobHighBg | Command::SubmitJobLowBg
        )
    }
}

impl std::fmt::Display for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Decoded 12-byte packet header.
#[derive(Debug, Clone, Copy)]
pub struct PacketHeader {
    pub magic: [u8; 4],
    pub code: u32,
    pub payload_len: usize,
}

impl PacketHeader {
    pub fn parse(buf: &[u8; HEADER_LEN]) -> Result<Self, ProtocolError> {
        let magic = [buf[0], buf[1], buf[2], buf[3]];
        if magic != REQ_MAGIC && magic != RES_MAGIC {
            return Err(ProtocolError::BadMagic(magic));
        }
        let code = u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]);
        let payload_len = u32::from_be_bytes([buf[8], buf[9], buf[10], buf[11]]) as usize;
        if payload_len > MAX_PAYLOAD_LEN {
            return Err(ProtocolError::PayloadTooLarge(payload_len));
        }
        Ok(Self {
            magic,
            code,
            payload_len,
        })
    }
}

/// A decoded request packet.
#[derive(Debug, Clone)]
pub struct Packet {
    pub cmd: Command,
    pub args: Vec<Vec<u8>>,
}

impl Packet {
    /// Decode a request payload for `cmd`, splitting it into the
    /// command's fixed argument count.
    pub fn decode(cmd: Command, payload: &[u8]) -> Result<Self, ProtocolError> {
        let args = split_args(payload, cmd.request_arity());
        if args.len() != cmd.request_arity() {
            return Err(ProtocolError::WrongArgumentCount {
                cmd,
                expected: cmd.request_arity(),
                got: args.len(),
            });
        }
        Ok(Self { cmd, args })
    }

    /// Borrow argument `idx` as UTF-8.
    pub fn str_arg(&self, idx: usize) -> Result<&str, ProtocolError> {
        std::str::from_utf8(&self.args[idx]).map_err(|_| ProtocolError::InvalidUtf8)
    }
}

/// Split a payload into up to `arity` NUL-separated fields. The last
/// field keeps any remaining bytes, NULs included. A payload with too
/// few separators yields fewer fields, which `Packet::decode` rejects.
pub fn split_args(payload: &[u8], arity: usize) -> Vec<Vec<u8>> {
    if arity == 0 {
        return Vec::new();
    }
    let mut args = Vec::with_capacity(arity);
    let mut rest = payload;
    for _ in 0..arity - 1 {
        match rest.iter().position(|&b| b == 0) {
            Some(pos) => {
                args.push(rest[..pos].to_vec());
                rest = &rest[pos + 1..];
            }
            None => break,
        }
    }
    args.push(rest.to_vec());
    args
}

/// Encode a broker-to-peer packet (`\0RES` magic).
pub fn encode_response(cmd: Command, args: &[&[u8]]) -> Vec<u8> {
    encode(RES_MAGIC, cmd, args)
}

/// Encode a peer-to-broker packet (`\0REQ` magic). Used by tests and
/// by client tooling.
pub fn encode_request(cmd: Command, args: &[&[u8]]) -> Vec<u8> {
    encode(REQ_MAGIC, cmd, args)
}

fn encode(magic: [u8; 4], cmd: Command, args: &[&[u8]]) -> Vec<u8> {
    let payload_len = if args.is_empty() {
        0
    } else {
        args.iter().map(|a| a.len()).sum::<usize>() + args.len() - 1
    };
    let mut buf = Vec::with_capacity(HEADER_LEN + payload_len);
    buf.extend_from_slice(&magic);
    buf.extend_from_slice(&cmd.code().to_be_bytes());
    buf.extend_from_slice(&(payload_len as u32).to_be_bytes());
    for (i, arg) in args.iter().enumerate() {
        if i > 0 {
            buf.push(0);
        }
        buf.extend_from_slice(arg);
    }
    buf
}
