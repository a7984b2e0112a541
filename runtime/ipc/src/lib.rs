//! Inter-VM Communication (IVC) - shared-memory message transport
//!
//! # Purpose
//! Carries admin requests/replies and log control messages between the host
//! and the DCE over rings of fixed-size frames in IOVA-mapped shared memory,
//! with HSP mailboxes as doorbells.
//!
//! # Integration Points
//! - Depends on: HSP layer (doorbells), an [`IovaAllocator`] (shared memory)
//! - Provides to: the DCE driver (admin and log conversations)
//!
//! # Architecture
//! Each channel region holds two single-producer/single-consumer queues, one
//! per direction. A queue is a small header followed by `nframes` frames:
//!
//! ```text
//! +0x00  write_count   (producer)
//! +0x04  state         (producer: ESTABLISHED / SYNC / ACK)
//! +0x40  read_count    (consumer)
//! +0x80  frame[0] .. frame[nframes - 1]
//! ```
//!
//! Counters are free running; occupancy is `write_count - read_count`
//! (wrapping) and never exceeds `nframes`. Either side may restart a channel
//! with the three-way SYNC/ACK/ESTABLISHED handshake, which zeroes both
//! sides' counters before traffic resumes.
//!
//! The host's tx queue sits at the start of the region; the DCE sees the same
//! region with the queues swapped.

use std::sync::Arc;

use dce_hsp::{Hsp, HspInstance, MailboxId};
use thiserror::Error;

pub mod broker;
pub mod region;
pub mod trace;

pub use broker::{ChannelBroker, ChannelState};
pub use region::{align_up, pages_needed, IovaAllocator, IovaPool, SharedRegion, PAGE_SIZE};
pub use trace::{Cursors, LogTraceSink, TraceEvent, TracePoint, TraceSink};

/// Channel identifier
pub type ChannelId = usize;

/// IPC error types
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum IpcError {
    #[error("Channel full (capacity: {capacity} frames)")]
    ChannelFull { capacity: u32 },

    #[error("Channel empty")]
    ChannelEmpty,

    #[error("Channel not established")]
    NotEstablished,

    #[error("Frame of {len} bytes exceeds frame size {frame_size}")]
    FrameTooLarge { len: usize, frame_size: u32 },

    #[error("Invalid geometry: {0}")]
    InvalidGeometry(&'static str),

    #[error("Out of IOVA space (requested: {requested} bytes)")]
    OutOfMemory { requested: usize },

    #[error("Queue counters corrupted (write: {write}, read: {read})")]
    Corrupted { write: u32, read: u32 },

    #[error("Channel {0} already exists")]
    ChannelExists(ChannelId),

    #[error("Channel {0} not found")]
    ChannelNotFound(ChannelId),

    #[error("No free channels (max: {max})")]
    NoFreeChannels { max: usize },
}

pub type Result<T> = core::result::Result<T, IpcError>;

const WRITE_COUNT: usize = 0x00;
const STATE: usize = 0x04;
const READ_COUNT: usize = 0x40;

/// Queue header size; frames start here
pub const QUEUE_HEADER_SIZE: usize = 0x80;

/// Frame count and size of a channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Geometry {
    pub nframes: u32,
    pub frame_size: u32,
}

impl Geometry {
    pub const fn new(nframes: u32, frame_size: u32) -> Self {
        Self { nframes, frame_size }
    }

    /// Frame count must be a power of two (counters wrap at 2^32) and frames
    /// must be whole words
    pub fn validate(&self) -> Result<()> {
        if self.nframes == 0 || !self.nframes.is_power_of_two() {
            return Err(IpcError::InvalidGeometry("frame count must be a power of 2"));
        }
        if self.frame_size == 0 || self.frame_size % 4 != 0 {
            return Err(IpcError::InvalidGeometry("frame size must be a non-zero multiple of 4"));
        }
        Ok(())
    }

    /// Bytes used by one direction
    pub const fn queue_size(&self) -> usize {
        QUEUE_HEADER_SIZE + self.nframes as usize * self.frame_size as usize
    }

    /// Bytes needed for both directions
    pub const fn region_size(&self) -> usize {
        2 * self.queue_size()
    }
}

/// Which end of the channel this handle drives
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Host,
    Remote,
}

/// Reset handshake state, as stored in a queue header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum IvcState {
    Established = 0,
    Sync = 1,
    Ack = 2,
}

impl IvcState {
    fn from_raw(raw: u32) -> Option<Self> {
        match raw {
            0 => Some(IvcState::Established),
            1 => Some(IvcState::Sync),
            2 => Some(IvcState::Ack),
            _ => None,
        }
    }
}

/// HSP mailbox used to get the peer's attention
#[derive(Debug, Clone)]
pub struct Doorbell {
    hsp: Hsp,
    instance: HspInstance,
    mailbox: MailboxId,
    value: u32,
}

impl Doorbell {
    pub fn new(hsp: Hsp, instance: HspInstance, mailbox: MailboxId, value: u32) -> Self {
        Self {
            hsp,
            instance,
            mailbox,
            value,
        }
    }

    /// Ring the doorbell
    ///
    /// If the peer has not drained the previous ring yet the two are
    /// coalesced; the peer always rescans the whole queue. Returns whether
    /// a new value was written.
    pub fn ring(&self) -> bool {
        if self.hsp.mailbox_is_full(self.instance, self.mailbox) {
            log::trace!("doorbell {:?} still full, coalescing", self.mailbox);
            return false;
        }
        self.hsp.mailbox_write(self.value, self.instance, self.mailbox);
        true
    }
}

/// One end of an IVC channel
///
/// Mutating operations take `&mut self`: a queue has exactly one producer
/// and one consumer, so callers sharing a handle must serialize it.
pub struct IvcChannel {
    id: ChannelId,
    region: SharedRegion,
    geometry: Geometry,
    side: Side,
    tx_base: usize,
    rx_base: usize,
    doorbell: Option<Doorbell>,
    trace: Arc<dyn TraceSink>,
}

impl IvcChannel {
    /// Bind a channel handle to `region`
    ///
    /// # Errors
    /// Invalid geometry, or a region too small to hold both queues.
    pub fn new(
        id: ChannelId,
        region: SharedRegion,
        geometry: Geometry,
        side: Side,
        doorbell: Option<Doorbell>,
        trace: Arc<dyn TraceSink>,
    ) -> Result<Self> {
        geometry.validate()?;
        if region.len() < geometry.region_size() {
            return Err(IpcError::InvalidGeometry("region too small for channel"));
        }

        let q = geometry.queue_size();
        let (tx_base, rx_base) = match side {
            Side::Host => (0, q),
            Side::Remote => (q, 0),
        };

        Ok(Self {
            id,
            region,
            geometry,
            side,
            tx_base,
            rx_base,
            doorbell,
            trace,
        })
    }

    pub fn id(&self) -> ChannelId {
        self.id
    }

    pub fn geometry(&self) -> Geometry {
        self.geometry
    }

    pub fn side(&self) -> Side {
        self.side
    }

    pub fn region(&self) -> &SharedRegion {
        &self.region
    }

    /// Zero this side's counters and mark the tx queue as needing a reset
    pub fn init(&mut self) {
        self.region.store_u32(self.tx_base + WRITE_COUNT, 0);
        self.region.store_u32(self.rx_base + READ_COUNT, 0);
        self.region.store_u32(self.tx_base + STATE, IvcState::Sync as u32);
        self.emit(TracePoint::ChannelInitComplete);
    }

    /// Start the reset handshake and notify the peer
    pub fn reset(&mut self) {
        self.region.store_u32(self.tx_base + STATE, IvcState::Sync as u32);
        self.emit(TracePoint::ResetTriggered);
        self.notify();
    }

    /// Advance the reset handshake after a notification from the peer
    ///
    /// Returns `true` once the channel is established.
    pub fn notified(&mut self) -> bool {
        let peer = IvcState::from_raw(self.region.load_u32(self.rx_base + STATE));
        let ours = self.local_state();

        match (ours, peer) {
            // Peer restarted: drop everything and acknowledge
            (_, Some(IvcState::Sync)) => {
                self.zero_counters();
                self.set_state(IvcState::Ack);
                self.notify();
            }
            // We restarted and the peer has acknowledged
            (Some(IvcState::Sync), Some(IvcState::Ack)) => {
                self.zero_counters();
                self.set_state(IvcState::Established);
                self.emit(TracePoint::ResetComplete);
                self.notify();
            }
            // We acknowledged and the peer has moved on
            (Some(IvcState::Ack), Some(IvcState::Ack | IvcState::Established)) => {
                self.set_state(IvcState::Established);
                self.emit(TracePoint::ResetComplete);
                self.notify();
            }
            _ => {}
        }

        self.is_established()
    }

    pub fn is_established(&self) -> bool {
        self.local_state() == Some(IvcState::Established)
    }

    /// Room for at least one more frame
    pub fn can_write(&self) -> bool {
        self.is_established() && self.tx_pending() < self.geometry.nframes
    }

    /// At least one frame waiting to be read
    pub fn can_read(&self) -> bool {
        self.is_established() && self.rx_pending() > 0
    }

    /// Frames queued in the rx direction
    pub fn rx_pending(&self) -> u32 {
        let c = self.cursors();
        c.rx_write.wrapping_sub(c.rx_read)
    }

    /// Frames queued in the tx direction and not yet consumed by the peer
    pub fn tx_pending(&self) -> u32 {
        let c = self.cursors();
        c.tx_write.wrapping_sub(c.tx_read)
    }

    /// Copy one frame into the tx queue without ringing the doorbell
    ///
    /// Shorter payloads are zero padded to the frame size.
    pub fn write_frame(&mut self, data: &[u8]) -> Result<()> {
        self.emit(TracePoint::SendIssued);

        if !self.is_established() {
            return Err(IpcError::NotEstablished);
        }
        if data.len() > self.geometry.frame_size as usize {
            return Err(IpcError::FrameTooLarge {
                len: data.len(),
                frame_size: self.geometry.frame_size,
            });
        }

        let write = self.region.load_u32(self.tx_base + WRITE_COUNT);
        let read = self.region.load_u32(self.tx_base + READ_COUNT);
        let pending = write.wrapping_sub(read);
        if pending > self.geometry.nframes {
            return Err(IpcError::Corrupted { write, read });
        }
        if pending == self.geometry.nframes {
            return Err(IpcError::ChannelFull {
                capacity: self.geometry.nframes,
            });
        }

        let offset = self.frame_offset(self.tx_base, write);
        self.region.write_bytes(offset, data);
        let tail = data.len().next_multiple_of(4);
        self.region
            .fill_zero(offset + tail, self.geometry.frame_size as usize - tail);

        // Publish the frame
        self.region
            .store_u32(self.tx_base + WRITE_COUNT, write.wrapping_add(1));

        self.emit(TracePoint::SendComplete);
        Ok(())
    }

    /// Write one frame and ring the doorbell
    pub fn send(&mut self, data: &[u8]) -> Result<()> {
        self.write_frame(data)?;
        self.notify();
        Ok(())
    }

    /// Take the oldest frame out of the rx queue
    ///
    /// The returned buffer is always `frame_size` bytes long. If the peer was
    /// blocked on a full queue it is notified that space is available.
    pub fn read_frame(&mut self) -> Result<Vec<u8>> {
        self.emit(TracePoint::ReceiveIssued);

        if !self.is_established() {
            return Err(IpcError::NotEstablished);
        }

        let write = self.region.load_u32(self.rx_base + WRITE_COUNT);
        let read = self.region.load_u32(self.rx_base + READ_COUNT);
        let pending = write.wrapping_sub(read);
        if pending > self.geometry.nframes {
            return Err(IpcError::Corrupted { write, read });
        }
        if pending == 0 {
            return Err(IpcError::ChannelEmpty);
        }

        let mut frame = vec![0u8; self.geometry.frame_size as usize];
        self.region
            .read_bytes(self.frame_offset(self.rx_base, read), &mut frame);

        // Release the slot back to the producer
        self.region
            .store_u32(self.rx_base + READ_COUNT, read.wrapping_add(1));

        self.emit(TracePoint::ReceiveComplete);

        if pending == self.geometry.nframes {
            self.notify();
        }
        Ok(frame)
    }

    /// Ring the doorbell, if this channel has one
    pub fn notify(&self) {
        if let Some(doorbell) = &self.doorbell {
            doorbell.ring();
        }
    }

    /// Counter snapshot, from this side's point of view
    pub fn cursors(&self) -> Cursors {
        Cursors {
            tx_write: self.region.load_u32(self.tx_base + WRITE_COUNT),
            tx_read: self.region.load_u32(self.tx_base + READ_COUNT),
            rx_write: self.region.load_u32(self.rx_base + WRITE_COUNT),
            rx_read: self.region.load_u32(self.rx_base + READ_COUNT),
        }
    }

    /// Emit a trace event for this channel
    pub fn emit(&self, point: TracePoint) {
        self.trace.record(&TraceEvent {
            point,
            channel: self.id,
            cursors: self.cursors(),
        });
    }

    fn local_state(&self) -> Option<IvcState> {
        IvcState::from_raw(self.region.load_u32(self.tx_base + STATE))
    }

    fn set_state(&self, state: IvcState) {
        self.region.store_u32(self.tx_base + STATE, state as u32);
    }

    fn zero_counters(&self) {
        self.region.store_u32(self.tx_base + WRITE_COUNT, 0);
        self.region.store_u32(self.rx_base + READ_COUNT, 0);
    }

    fn frame_offset(&self, base: usize, count: u32) -> usize {
        let index = (count % self.geometry.nframes) as usize;
        base + QUEUE_HEADER_SIZE + index * self.geometry.frame_size as usize
    }
}

impl core::fmt::Debug for IvcChannel {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("IvcChannel")
            .field("id", &self.id)
            .field("side", &self.side)
            .field("geometry", &self.geometry)
            .field("established", &self.is_established())
            .field("cursors", &self.cursors())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    const GEOMETRY: Geometry = Geometry::new(4, 64);

    #[derive(Default)]
    struct Collect(Mutex<Vec<TracePoint>>);

    impl TraceSink for Collect {
        fn record(&self, event: &TraceEvent) {
            self.0.lock().unwrap().push(event.point);
        }
    }

    fn pair() -> (IvcChannel, IvcChannel) {
        let region = SharedRegion::new(0x8000_0000, GEOMETRY.region_size());
        let sink: Arc<dyn TraceSink> = Arc::new(LogTraceSink);
        let host = IvcChannel::new(0, region.clone(), GEOMETRY, Side::Host, None, sink.clone()).unwrap();
        let remote = IvcChannel::new(0, region, GEOMETRY, Side::Remote, None, sink).unwrap();
        (host, remote)
    }

    fn establish(host: &mut IvcChannel, remote: &mut IvcChannel) {
        host.init();
        remote.init();
        host.reset();
        // Without doorbells each side is told about the other by hand
        for _ in 0..4 {
            remote.notified();
            host.notified();
        }
        assert!(host.is_established());
        assert!(remote.is_established());
    }

    #[test]
    fn test_geometry_validation() {
        assert!(Geometry::new(4, 64).validate().is_ok());
        assert!(Geometry::new(3, 64).validate().is_err());
        assert!(Geometry::new(0, 64).validate().is_err());
        assert!(Geometry::new(4, 62).validate().is_err());
        assert_eq!(Geometry::new(4, 64).queue_size(), 0x80 + 256);
    }

    #[test]
    fn test_region_too_small() {
        let region = SharedRegion::new(0, 64);
        let result = IvcChannel::new(0, region, GEOMETRY, Side::Host, None, Arc::new(LogTraceSink));
        assert!(matches!(result, Err(IpcError::InvalidGeometry(_))));
    }

    #[test]
    fn test_traffic_requires_handshake() {
        let (mut host, _remote) = pair();
        host.init();
        assert_eq!(host.write_frame(b"early"), Err(IpcError::NotEstablished));
        assert_eq!(host.read_frame(), Err(IpcError::NotEstablished));
    }

    #[test]
    fn test_frames_flow_both_ways() {
        let (mut host, mut remote) = pair();
        establish(&mut host, &mut remote);

        host.write_frame(b"ping").unwrap();
        assert!(remote.can_read());
        let frame = remote.read_frame().unwrap();
        assert_eq!(frame.len(), 64);
        assert_eq!(&frame[..4], b"ping");
        assert!(frame[4..].iter().all(|&b| b == 0));

        remote.write_frame(b"pong").unwrap();
        assert_eq!(&host.read_frame().unwrap()[..4], b"pong");
        assert_eq!(host.read_frame(), Err(IpcError::ChannelEmpty));
    }

    #[test]
    fn test_full_queue_never_overwrites() {
        let (mut host, mut remote) = pair();
        establish(&mut host, &mut remote);

        for i in 0..GEOMETRY.nframes {
            host.write_frame(&[i as u8; 4]).unwrap();
        }
        assert!(!host.can_write());
        assert_eq!(
            host.write_frame(b"over"),
            Err(IpcError::ChannelFull { capacity: 4 })
        );
        assert_eq!(host.tx_pending(), GEOMETRY.nframes);

        // FIFO order is preserved
        for i in 0..GEOMETRY.nframes {
            assert_eq!(remote.read_frame().unwrap()[0], i as u8);
        }
        assert!(host.can_write());
    }

    #[test]
    fn test_counters_wrap() {
        let (mut host, mut remote) = pair();
        establish(&mut host, &mut remote);

        for i in 0..(GEOMETRY.nframes * 5 + 1) {
            host.write_frame(&i.to_le_bytes()).unwrap();
            let frame = remote.read_frame().unwrap();
            assert_eq!(u32::from_le_bytes(frame[..4].try_into().unwrap()), i);
        }
        assert_eq!(host.tx_pending(), 0);
    }

    #[test]
    fn test_oversized_frame_rejected() {
        let (mut host, mut remote) = pair();
        establish(&mut host, &mut remote);
        let big = [0u8; 65];
        assert!(matches!(
            host.write_frame(&big),
            Err(IpcError::FrameTooLarge { len: 65, frame_size: 64 })
        ));
    }

    #[test]
    fn test_peer_restart_zeroes_cursors() {
        let (mut host, mut remote) = pair();
        establish(&mut host, &mut remote);

        host.write_frame(b"stale").unwrap();
        host.write_frame(b"stale").unwrap();

        // Remote restarts the channel
        remote.reset();
        assert!(!host.notified());
        assert_eq!(host.cursors().tx_write, 0);
        for _ in 0..4 {
            remote.notified();
            host.notified();
        }
        assert!(host.is_established() && remote.is_established());
        assert_eq!(remote.rx_pending(), 0);
        assert_eq!(remote.read_frame(), Err(IpcError::ChannelEmpty));
    }

    #[test]
    fn test_trace_points() {
        let region = SharedRegion::new(0, GEOMETRY.region_size());
        let sink = Arc::new(Collect::default());
        let mut host =
            IvcChannel::new(3, region.clone(), GEOMETRY, Side::Host, None, sink.clone()).unwrap();
        let mut remote =
            IvcChannel::new(3, region, GEOMETRY, Side::Remote, None, Arc::new(LogTraceSink)).unwrap();
        establish(&mut host, &mut remote);
        host.write_frame(b"x").unwrap();

        let points = sink.0.lock().unwrap().clone();
        assert_eq!(points[0], TracePoint::ChannelInitComplete);
        assert_eq!(points[1], TracePoint::ResetTriggered);
        assert!(points.contains(&TracePoint::ResetComplete));
        assert_eq!(&points[points.len() - 2..], &[TracePoint::SendIssued, TracePoint::SendComplete]);
    }
}
