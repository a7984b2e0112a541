//! Driver configuration
//!
//! Every tunable of the control plane lives here: round-trip timeouts,
//! which HSP resources the host and the DCE use, IVC channel geometry and
//! the log buffer. All sections default, so a TOML file only needs the
//! values it changes:
//!
//! ```toml
//! [timeouts]
//! admin_ms = 1000
//!
//! [log]
//! level = 4
//! ```

use std::time::Duration;

use dce_hsp::{HspInstance, IrqLine, MailboxId, SemaphoreId};
use dce_ipc::Geometry;
use serde::{Deserialize, Serialize};

use crate::error::{DceError, Result};

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DceConfig {
    pub timeouts: Timeouts,
    pub hsp: HspConfig,
    pub admin: ChannelConfig,
    pub log: LogConfig,
    pub iova: IovaConfig,
}

/// Round-trip bounds, in milliseconds
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Timeouts {
    pub boot_ms: u64,
    pub boot_cmd_ms: u64,
    pub ivc_reset_ms: u64,
    pub admin_ms: u64,
    pub sc7_enter_ms: u64,
    pub sc7_exit_ms: u64,
    pub log_ms: u64,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            boot_ms: 1000,
            boot_cmd_ms: 200,
            ivc_reset_ms: 500,
            admin_ms: 500,
            sc7_enter_ms: 500,
            sc7_exit_ms: 1000,
            log_ms: 200,
        }
    }
}

impl Timeouts {
    pub fn boot(&self) -> Duration {
        Duration::from_millis(self.boot_ms)
    }

    pub fn boot_cmd(&self) -> Duration {
        Duration::from_millis(self.boot_cmd_ms)
    }

    pub fn ivc_reset(&self) -> Duration {
        Duration::from_millis(self.ivc_reset_ms)
    }

    pub fn admin(&self) -> Duration {
        Duration::from_millis(self.admin_ms)
    }

    pub fn sc7_enter(&self) -> Duration {
        Duration::from_millis(self.sc7_enter_ms)
    }

    pub fn sc7_exit(&self) -> Duration {
        Duration::from_millis(self.sc7_exit_ms)
    }

    pub fn log(&self) -> Duration {
        Duration::from_millis(self.log_ms)
    }
}

/// HSP resources shared with the DCE, as raw indices
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HspConfig {
    pub instance: usize,
    /// Host -> DCE mailbox (boot commands and doorbells)
    pub to_remote: usize,
    /// DCE -> host mailbox (notifications)
    pub from_remote: usize,
    /// Boot status semaphore
    pub status_semaphore: usize,
    /// Line the host takes DCE interrupts on
    pub host_line: u8,
    /// Line the DCE takes host interrupts on
    pub remote_line: u8,
    /// Lines whose INT_IE state is saved across SC7
    pub owned_lines: Vec<u8>,
}

impl Default for HspConfig {
    fn default() -> Self {
        Self {
            instance: 0,
            to_remote: 0,
            from_remote: 1,
            status_semaphore: 0,
            host_line: 0,
            remote_line: 1,
            owned_lines: vec![0],
        }
    }
}

impl HspConfig {
    pub fn instance(&self) -> Result<HspInstance> {
        HspInstance::from_index(self.instance)
            .ok_or_else(|| DceError::Config(format!("no HSP instance {}", self.instance)))
    }

    pub fn to_remote(&self) -> Result<MailboxId> {
        mailbox(self.to_remote)
    }

    pub fn from_remote(&self) -> Result<MailboxId> {
        mailbox(self.from_remote)
    }

    pub fn status_semaphore(&self) -> Result<SemaphoreId> {
        SemaphoreId::from_index(self.status_semaphore).ok_or_else(|| {
            DceError::Config(format!("no shared semaphore {}", self.status_semaphore))
        })
    }

    pub fn host_line(&self) -> Result<IrqLine> {
        line(self.host_line)
    }

    pub fn remote_line(&self) -> Result<IrqLine> {
        line(self.remote_line)
    }

    pub fn owned_lines(&self) -> Result<Vec<IrqLine>> {
        self.owned_lines.iter().map(|&n| line(n)).collect()
    }
}

fn mailbox(index: usize) -> Result<MailboxId> {
    MailboxId::from_index(index).ok_or_else(|| DceError::Config(format!("no shared mailbox {}", index)))
}

fn line(n: u8) -> Result<IrqLine> {
    IrqLine::new(n).ok_or_else(|| DceError::Config(format!("no interrupt line {}", n)))
}

/// IVC channel geometry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelConfig {
    pub nframes: u32,
    pub frame_size: u32,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            nframes: 8,
            frame_size: 256,
        }
    }
}

impl ChannelConfig {
    pub fn geometry(&self) -> Geometry {
        Geometry::new(self.nframes, self.frame_size)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    pub channel: ChannelConfig,
    /// Shared log buffer size, header included
    pub buffer_size: usize,
    /// Log level handed to the DCE at init
    pub level: u32,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            channel: ChannelConfig {
                nframes: 4,
                frame_size: 64,
            },
            buffer_size: 16 * 1024,
            level: 3,
        }
    }
}

/// Device address window for shared memory
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IovaConfig {
    pub base: u64,
    pub size: u64,
}

impl Default for IovaConfig {
    fn default() -> Self {
        Self {
            base: 0x8000_0000,
            size: 0x10_0000,
        }
    }
}

impl DceConfig {
    /// Check that every index and geometry is usable
    pub fn validate(&self) -> Result<()> {
        self.hsp.instance()?;
        let to = self.hsp.to_remote()?;
        let from = self.hsp.from_remote()?;
        if to == from {
            return Err(DceError::Config("to_remote and from_remote must differ".into()));
        }
        self.hsp.status_semaphore()?;
        if self.hsp.host_line()? == self.hsp.remote_line()? {
            return Err(DceError::Config("host_line and remote_line must differ".into()));
        }
        let host_line = self.hsp.host_line()?;
        if !self.hsp.owned_lines()?.contains(&host_line) {
            // Notifications arrive on it, so SC7 exit would never be seen
            return Err(DceError::Config(format!(
                "owned_lines must include host_line {}",
                self.hsp.host_line
            )));
        }

        for (name, channel) in [("admin", &self.admin), ("log", &self.log.channel)] {
            channel
                .geometry()
                .validate()
                .map_err(|e| DceError::Config(format!("{} channel: {}", name, e)))?;
        }
        if self.log.buffer_size <= crate::logbuf::HEADER_SIZE {
            return Err(DceError::Config("log buffer smaller than its header".into()));
        }
        Ok(())
    }
}
