//! Host <-> DCE message formats
//!
//! # Mailbox words
//!
//! Host to DCE, on the `to_remote` mailbox:
//!
//! ```text
//!  31   28 27  24 23                   4 3   0
//! +-------+------+----------------------+-----+
//! | (tag) | cmd  |        arg           | seq |
//! +-------+------+----------------------+-----+
//! ```
//!
//! DCE to host, on the `from_remote` mailbox:
//!
//! ```text
//!  31   28 27  24 23    16 15            0
//! +-------+------+--------+---------------+
//! | (tag) | code |  aux   |     value     |
//! +-------+------+--------+---------------+
//! ```
//!
//! # IVC envelopes
//!
//! Admin requests/replies and log control messages travel as `bincode`
//! envelopes in IVC frames. Admin payloads are opaque bytes.

use bitflags::bitflags;
use dce_ipc::ChannelId;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{DceError, Result};

/// Bootstrap protocol version announced by the host
pub const PROTOCOL_VERSION: u32 = 1;

/// IVC channel carrying admin requests
pub const ADMIN_CHANNEL: ChannelId = 0;
/// IVC channel carrying log control messages
pub const LOG_CHANNEL: ChannelId = 1;

bitflags! {
    /// Bits of the shared boot status semaphore
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct BootStatus: u32 {
        /// Host has routed notifications and released the DCE
        const HOST_READY = 1 << 0;
        /// Set by the DCE firmware once booted
        const FW_BOOTED = 1 << 1;
    }
}

/// Abort reasons raised by the host itself
pub mod abort_reason {
    /// The DCE never announced SC7 exit
    pub const SC7_EXIT_TIMEOUT: u16 = 0xfe01;
}

/// Admin command codes understood by every firmware
pub mod admin_cmd {
    pub const ECHO: u32 = 0x1;
    pub const GET_VERSION: u32 = 0x2;
}

/// Status values shared by all replies
pub mod status {
    pub const OK: u32 = 0;
    pub const UNSUPPORTED: u32 = 0x1;
    pub const INVALID: u32 = 0x2;
}

/// Host -> DCE mailbox command
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum HostCmd {
    /// Release the DCE; it answers with BootComplete
    Boot = 0x1,
    Version = 0x2,
    SelectChannel = 0x3,
    /// IOVA page frame number of the selected channel
    SetAddr = 0x4,
    SetFrames = 0x5,
    SetFrameSize = 0x6,
    ChannelInit = 0x7,
    /// End of bootstrap; further bootstrap commands are refused
    Lock = 0x8,
    /// IVC attention, `arg` is the channel id
    Doorbell = 0x9,
    EnterSc7 = 0xa,
}

impl HostCmd {
    pub fn from_raw(raw: u8) -> Option<Self> {
        Some(match raw {
            0x1 => HostCmd::Boot,
            0x2 => HostCmd::Version,
            0x3 => HostCmd::SelectChannel,
            0x4 => HostCmd::SetAddr,
            0x5 => HostCmd::SetFrames,
            0x6 => HostCmd::SetFrameSize,
            0x7 => HostCmd::ChannelInit,
            0x8 => HostCmd::Lock,
            0x9 => HostCmd::Doorbell,
            0xa => HostCmd::EnterSc7,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HostWord {
    pub cmd: HostCmd,
    pub arg: u32,
    pub seq: u8,
}

impl HostWord {
    pub const ARG_MAX: u32 = 0xf_ffff;

    pub fn new(cmd: HostCmd, arg: u32, seq: u8) -> Result<Self> {
        if arg > Self::ARG_MAX {
            return Err(DceError::Protocol(format!(
                "{:?} argument {:#x} does not fit in 20 bits",
                cmd, arg
            )));
        }
        Ok(Self {
            cmd,
            arg,
            seq: seq & 0xf,
        })
    }

    /// Doorbell word for an IVC channel
    pub fn doorbell(channel: ChannelId) -> u32 {
        HostWord {
            cmd: HostCmd::Doorbell,
            arg: channel as u32 & Self::ARG_MAX,
            seq: 0,
        }
        .encode()
    }

    pub fn encode(&self) -> u32 {
        ((self.cmd as u32) << 24) | ((self.arg & Self::ARG_MAX) << 4) | u32::from(self.seq & 0xf)
    }

    pub fn decode(raw: u32) -> Result<Self> {
        let cmd = HostCmd::from_raw(((raw >> 24) & 0xf) as u8)
            .ok_or_else(|| DceError::Protocol(format!("unknown host command word {:#010x}", raw)))?;
        Ok(Self {
            cmd,
            arg: (raw >> 4) & Self::ARG_MAX,
            seq: (raw & 0xf) as u8,
        })
    }
}

/// DCE -> host notification code
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum RemoteCode {
    BootComplete = 0x1,
    /// `aux` = status, `value` = sequence
    BootCmdAck = 0x2,
    /// IVC attention, `aux` = channel id
    Ivc = 0x3,
    Sc7Entered = 0x4,
    Sc7Exit = 0x5,
    /// `aux` = status, `value` = sequence
    LogReady = 0x6,
    /// `value` = reason
    Abort = 0x7,
    CrashLog = 0x8,
    LogOverflow = 0x9,
}

impl RemoteCode {
    pub fn from_raw(raw: u8) -> Option<Self> {
        Some(match raw {
            0x1 => RemoteCode::BootComplete,
            0x2 => RemoteCode::BootCmdAck,
            0x3 => RemoteCode::Ivc,
            0x4 => RemoteCode::Sc7Entered,
            0x5 => RemoteCode::Sc7Exit,
            0x6 => RemoteCode::LogReady,
            0x7 => RemoteCode::Abort,
            0x8 => RemoteCode::CrashLog,
            0x9 => RemoteCode::LogOverflow,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RemoteWord {
    pub code: RemoteCode,
    pub aux: u8,
    pub value: u16,
}

impl RemoteWord {
    pub const fn new(code: RemoteCode, aux: u8, value: u16) -> Self {
        Self { code, aux, value }
    }

    pub fn encode(&self) -> u32 {
        ((self.code as u32) << 24) | (u32::from(self.aux) << 16) | u32::from(self.value)
    }

    pub fn decode(raw: u32) -> Result<Self> {
        let code = RemoteCode::from_raw(((raw >> 24) & 0xf) as u8)
            .ok_or_else(|| DceError::Protocol(format!("unknown notification word {:#010x}", raw)))?;
        Ok(Self {
            code,
            aux: (raw >> 16) as u8,
            value: raw as u16,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdminMessage {
    pub seq: u16,
    pub cmd: u32,
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdminReply {
    pub seq: u16,
    pub status: u32,
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogOp {
    /// Log buffer location and size, header included
    Init { iova: u64, size: u32 },
    Clear,
    SetLevel(u32),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogControl {
    pub seq: u16,
    pub op: LogOp,
}

/// Serialize an envelope for an IVC frame
pub fn encode<T: Serialize>(msg: &T) -> Result<Vec<u8>> {
    Ok(bincode::serialize(msg)?)
}

/// Deserialize an envelope from a (zero padded) IVC frame
pub fn decode<T: DeserializeOwned>(frame: &[u8]) -> Result<T> {
    Ok(bincode::deserialize(frame)?)
}
