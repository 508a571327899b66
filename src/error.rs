use thiserror::Error;

use crate::protocol::ProtocolError;

#[derive(Error, Debug)]
pub enum GearmanError {
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("broker event loop is gone")]
    BrokerUnavailable,

    #[error("broker dropped the reply channel")]
    ReplyDropped,
}

pub type Result<T> = std::result::Result<T, GearmanError>;
