//! Driver error types

use dce_ipc::{ChannelId, IpcError};
use thiserror::Error;

use crate::fsm::DceState;
use crate::wait::WaitKind;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DceError {
    #[error("Timed out waiting for {0:?}")]
    Timeout(WaitKind),

    #[error("Wait for {0:?} interrupted")]
    Interrupted(WaitKind),

    #[error("{0:?} round trip already in flight")]
    Busy(WaitKind),

    #[error("Remote unit aborted")]
    Aborted,

    #[error("Operation not valid in state {0:?}")]
    InvalidState(DceState),

    #[error("Shared memory allocation failed: {0}")]
    Alloc(IpcError),

    #[error("IVC error: {0}")]
    Ipc(#[from] IpcError),

    #[error("IVC channel {0} did not establish")]
    LinkDown(ChannelId),

    #[error("Log buffer not initialized")]
    NoLogBuffer,

    #[error("Remote unit reported status {0:#x}")]
    Remote(u32),

    #[error("Malformed message: {0}")]
    Protocol(String),

    #[error("Invalid configuration: {0}")]
    Config(String),
}

impl From<bincode::Error> for DceError {
    fn from(e: bincode::Error) -> Self {
        DceError::Protocol(e.to_string())
    }
}

pub type Result<T> = core::result::Result<T, DceError>;
