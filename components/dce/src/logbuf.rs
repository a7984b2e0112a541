//! Shared DCE log buffer
//!
//! The DCE writes its log into a circular region that follows a fixed
//! 32-byte header. The header layout must match the firmware bit for bit:
//!
//! ```text
//! +0x00 version        u32
//! +0x04 header_size    u32
//! +0x08 active         u32   (DCE only: non-zero while logging is live)
//! +0x0c encoded        u32
//! +0x10 bytes_written  u64   (total, never wraps)
//! +0x18 circ_size      u32
//! +0x1c level          u32
//! ```
//!
//! The host writes the header once at init and otherwise only reads it.
//! Clearing and level changes are requested from the DCE over the log
//! channel.

use std::mem::{offset_of, size_of};
use std::sync::{Mutex, MutexGuard};

use dce_ipc::{SharedRegion, TracePoint};
use static_assertions::const_assert_eq;

use crate::error::{DceError, Result};
use crate::fsm::Event;
use crate::protocol::{LogOp, LOG_CHANNEL};
use crate::{Dce, Shared};

/// Header format version
pub const LOG_VERSION: u32 = 1;

pub const HEADER_SIZE: usize = 32;

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LogBufferHeader {
    pub version: u32,
    pub header_size: u32,
    pub active: u32,
    pub encoded: u32,
    pub bytes_written: u64,
    pub circ_size: u32,
    pub level: u32,
}

const_assert_eq!(size_of::<LogBufferHeader>(), HEADER_SIZE);
const_assert_eq!(offset_of!(LogBufferHeader, version), 0x00);
const_assert_eq!(offset_of!(LogBufferHeader, header_size), 0x04);
const_assert_eq!(offset_of!(LogBufferHeader, active), 0x08);
const_assert_eq!(offset_of!(LogBufferHeader, encoded), 0x0c);
const_assert_eq!(offset_of!(LogBufferHeader, bytes_written), 0x10);
const_assert_eq!(offset_of!(LogBufferHeader, circ_size), 0x18);
const_assert_eq!(offset_of!(LogBufferHeader, level), 0x1c);

impl LogBufferHeader {
    /// Header for a fresh buffer of `buffer_size` bytes, header included
    pub fn new(buffer_size: usize, level: u32) -> Self {
        Self {
            version: LOG_VERSION,
            header_size: HEADER_SIZE as u32,
            active: 0,
            encoded: 0,
            bytes_written: 0,
            circ_size: (buffer_size.saturating_sub(HEADER_SIZE) & !3) as u32,
            level,
        }
    }

    pub fn read(region: &SharedRegion) -> Self {
        Self {
            version: region.load_u32(offset_of!(LogBufferHeader, version)),
            header_size: region.load_u32(offset_of!(LogBufferHeader, header_size)),
            active: region.load_u32(offset_of!(LogBufferHeader, active)),
            encoded: region.load_u32(offset_of!(LogBufferHeader, encoded)),
            bytes_written: region.load_u64(offset_of!(LogBufferHeader, bytes_written)),
            circ_size: region.load_u32(offset_of!(LogBufferHeader, circ_size)),
            level: region.load_u32(offset_of!(LogBufferHeader, level)),
        }
    }

    pub fn write(&self, region: &SharedRegion) {
        region.store_u32(offset_of!(LogBufferHeader, version), self.version);
        region.store_u32(offset_of!(LogBufferHeader, header_size), self.header_size);
        region.store_u32(offset_of!(LogBufferHeader, active), self.active);
        region.store_u32(offset_of!(LogBufferHeader, encoded), self.encoded);
        region.store_u64(offset_of!(LogBufferHeader, bytes_written), self.bytes_written);
        region.store_u32(offset_of!(LogBufferHeader, circ_size), self.circ_size);
        region.store_u32(offset_of!(LogBufferHeader, level), self.level);
    }
}

/// Bytes drained from the log since the previous read
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LogRead {
    pub data: Vec<u8>,
    /// Bytes overwritten by the DCE before the host got to them
    pub lost: u64,
}

/// Host view of the shared log buffer
#[derive(Debug)]
pub struct LogBuffer {
    region: SharedRegion,
    drained: u64,
    lost: u64,
}

impl LogBuffer {
    /// Take ownership of `region` and write the initial header
    pub fn init(region: SharedRegion, level: u32) -> Self {
        region.fill_zero(0, region.len());
        LogBufferHeader::new(region.len(), level).write(&region);
        Self {
            region,
            drained: 0,
            lost: 0,
        }
    }

    pub fn region(&self) -> &SharedRegion {
        &self.region
    }

    pub fn header(&self) -> LogBufferHeader {
        LogBufferHeader::read(&self.region)
    }

    /// The DCE is currently writing to the buffer
    pub fn is_active(&self) -> bool {
        self.header().active != 0
    }

    /// Total bytes lost to wrap-around since init
    pub fn lost(&self) -> u64 {
        self.lost
    }

    /// Forget the drain position, after the DCE cleared the buffer
    pub fn rewind(&mut self) {
        self.drained = 0;
    }

    /// Copy out everything written since the previous drain
    pub fn drain(&mut self) -> LogRead {
        let header = self.header();
        let circ = u64::from(header.circ_size);
        if circ == 0 {
            return LogRead::default();
        }

        if header.bytes_written < self.drained {
            // Cleared behind our back
            self.drained = 0;
        }

        let mut pending = header.bytes_written - self.drained;
        let mut lost = 0;
        if pending > circ {
            lost = pending - circ;
            pending = circ;
            log::warn!("dce log: {} bytes overwritten before drain", lost);
        }

        let start = header.bytes_written - pending;
        let mut data = vec![0u8; pending as usize];
        let pos = (start % circ) as usize;
        let first = (circ as usize - pos).min(data.len());
        self.region.copy_out(HEADER_SIZE + pos, &mut data[..first]);
        self.region.copy_out(HEADER_SIZE, &mut data[first..]);

        self.drained = header.bytes_written;
        self.lost += lost;
        LogRead { data, lost }
    }
}

/// Append `data` as the DCE does: circular payload first, then the counter
pub fn append(region: &SharedRegion, data: &[u8]) {
    let header = LogBufferHeader::read(region);
    let circ = header.circ_size as usize;
    if circ == 0 {
        return;
    }

    let mut written = header.bytes_written;
    // Only the tail can survive a write longer than the buffer
    let skip = data.len().saturating_sub(circ);
    written += skip as u64;

    for chunk in data[skip..].chunks(circ) {
        let pos = (written % circ as u64) as usize;
        let first = (circ - pos).min(chunk.len());
        region.copy_in(HEADER_SIZE + pos, &chunk[..first]);
        region.copy_in(HEADER_SIZE, &chunk[first..]);
        written += chunk.len() as u64;
    }

    region.store_u64(offset_of!(LogBufferHeader, bytes_written), written);
}

/// Host-side owner of the (optional) log buffer
#[derive(Debug, Default)]
pub(crate) struct LogManager {
    buffer: Mutex<Option<LogBuffer>>,
    /// Regions handed to the DCE without a definite answer; the DCE may
    /// still write into them, so they stay allocated until deinit
    parked: Mutex<Vec<SharedRegion>>,
}

impl LogManager {
    pub fn lock(&self) -> MutexGuard<'_, Option<LogBuffer>> {
        self.buffer.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn park(&self, region: SharedRegion) {
        log::warn!("dce log: parking buffer at {:#x} until deinit", region.iova());
        self.parked
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(region);
    }

    pub fn take_parked(&self) -> Vec<SharedRegion> {
        std::mem::take(&mut *self.parked.lock().unwrap_or_else(|e| e.into_inner()))
    }

    /// Emit everything undrained at error level, one line per record
    pub fn dump(&self) {
        let mut guard = self.lock();
        let Some(buffer) = guard.as_mut() else {
            log::error!("dce crash: no log buffer to dump");
            return;
        };

        let read = buffer.drain();
        if read.lost > 0 {
            log::error!("dce crash: {} earlier bytes lost", read.lost);
        }
        for line in String::from_utf8_lossy(&read.data).lines() {
            log::error!("dce crash: {}", line);
        }
    }
}

impl Shared {
    fn log_request(&self, op: LogOp) -> Result<()> {
        self.round_trip(Event::LogRequested { op }, self.config.timeouts.log())?;
        self.emit(LOG_CHANNEL, TracePoint::WaitComplete);
        match self.fsm.take_log_status() {
            Some(0) => Ok(()),
            Some(status) => Err(DceError::Remote(u32::from(status))),
            None => Err(DceError::Protocol(format!("{:?} acknowledged without status", op))),
        }
    }
}

impl Dce {
    /// Allocate the shared log buffer and hand it to the DCE
    ///
    /// Replaces any earlier buffer once the DCE has acknowledged the switch.
    /// If the DCE refuses, the new region is freed and the earlier buffer
    /// stays in place. Without an answer (timeout, STOP, ABORT) the DCE may
    /// already be writing into the new region, so it is kept allocated until
    /// [`Dce::deinit`].
    pub fn init_log_buffer(&self) -> Result<()> {
        let s = &self.shared;
        let _guard = s.request_lock();
        if !s.fsm.is_operating() {
            return Err(s.not_operating());
        }

        let config = &s.config.log;
        let region = s.iova.allocate(config.buffer_size).map_err(DceError::Alloc)?;
        let iova = region.iova();
        let op = LogOp::Init {
            iova,
            size: region.len() as u32,
        };
        let buffer = LogBuffer::init(region, config.level);

        match s.log_request(op) {
            Ok(()) => {
                if let Some(old) = s.logs.lock().replace(buffer) {
                    s.iova.free(old.region());
                }
                log::info!("dce log: buffer at {:#x}", iova);
                Ok(())
            }
            Err(e @ DceError::Remote(_)) => {
                s.iova.free(buffer.region());
                Err(e)
            }
            Err(e) => {
                s.logs.park(buffer.region().clone());
                Err(e)
            }
        }
    }

    /// Have the DCE discard everything logged so far
    pub fn clear_log_buffer(&self) -> Result<()> {
        let s = &self.shared;
        let _guard = s.request_lock();
        if s.logs.lock().is_none() {
            return Err(DceError::NoLogBuffer);
        }
        s.log_request(LogOp::Clear)?;
        if let Some(buffer) = s.logs.lock().as_mut() {
            buffer.rewind();
        }
        Ok(())
    }

    pub fn set_log_level(&self, level: u32) -> Result<()> {
        let s = &self.shared;
        let _guard = s.request_lock();
        if s.logs.lock().is_none() {
            return Err(DceError::NoLogBuffer);
        }
        s.log_request(LogOp::SetLevel(level))
    }

    /// The DCE is currently logging into the shared buffer
    pub fn is_log_active(&self) -> bool {
        self.shared
            .logs
            .lock()
            .as_ref()
            .is_some_and(LogBuffer::is_active)
    }

    /// Drain everything the DCE logged since the last read
    pub fn read_log(&self) -> Result<LogRead> {
        self.shared
            .logs
            .lock()
            .as_mut()
            .map(LogBuffer::drain)
            .ok_or(DceError::NoLogBuffer)
    }

    pub fn log_header(&self) -> Option<LogBufferHeader> {
        self.shared.logs.lock().as_ref().map(LogBuffer::header)
    }

    /// LOG_OVERFLOW notifications since the last start
    pub fn log_overflow_count(&self) -> u64 {
        self.shared.fsm.overflow_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn buffer(size: usize) -> LogBuffer {
        LogBuffer::init(SharedRegion::new(0x9000_0000, size), 3)
    }

    #[test]
    fn test_initial_header() {
        let log = buffer(HEADER_SIZE + 64);
        let header = log.header();
        assert_eq!(header.version, LOG_VERSION);
        assert_eq!(header.header_size, 32);
        assert_eq!(header.circ_size, 64);
        assert_eq!(header.level, 3);
        assert_eq!(header.bytes_written, 0);
        assert!(!log.is_active());
    }

    #[test]
    fn test_header_word_positions() {
        let region = SharedRegion::new(0, HEADER_SIZE);
        LogBufferHeader {
            version: 1,
            header_size: 2,
            active: 3,
            encoded: 4,
            bytes_written: 0x0000_0006_0000_0005,
            circ_size: 7,
            level: 8,
        }
        .write(&region);

        let words: Vec<u32> = (0..8).map(|i| region.load_u32(i * 4)).collect();
        assert_eq!(words, vec![1, 2, 3, 4, 5, 6, 7, 8]);
    }

    #[test]
    fn test_drain_incremental() {
        let mut log = buffer(HEADER_SIZE + 64);
        append(log.region(), b"boot ok\n");
        assert_eq!(log.drain().data, b"boot ok\n");
        assert!(log.drain().data.is_empty());

        append(log.region(), b"abc");
        append(log.region(), b"def");
        assert_eq!(log.drain().data, b"abcdef");
    }

    #[test]
    fn test_drain_across_wrap() {
        let mut log = buffer(HEADER_SIZE + 16);
        append(log.region(), b"0123456789");
        log.drain();
        append(log.region(), b"abcdefghij");

        let read = log.drain();
        assert_eq!(read.data, b"abcdefghij");
        assert_eq!(read.lost, 0);
    }

    #[test]
    fn test_overrun_is_reported() {
        let mut log = buffer(HEADER_SIZE + 16);
        append(log.region(), b"0123456789abcdefXYZ");

        let read = log.drain();
        assert_eq!(read.lost, 3);
        assert_eq!(read.data, b"3456789abcdefXYZ");
        assert_eq!(log.lost(), 3);
    }

    #[test]
    fn test_cleared_buffer_restarts_drain() {
        let mut log = buffer(HEADER_SIZE + 64);
        append(log.region(), b"older");
        log.drain();

        // DCE clears: counter back to zero
        log.region().store_u64(offset_of!(LogBufferHeader, bytes_written), 0);
        append(log.region(), b"new");
        assert_eq!(log.drain().data, b"new");
    }
}
