//! Channel trace points
//!
//! Structured events emitted at well-defined points of a channel's life,
//! carrying the channel identity and cursor state. They are consumed by an
//! external diagnostics collector; [`LogTraceSink`] simply forwards them to
//! the `log` facade.

use crate::ChannelId;

/// Where in the channel protocol an event was emitted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TracePoint {
    ChannelInitComplete,
    ResetTriggered,
    ResetComplete,
    SendIssued,
    SendComplete,
    ReceiveIssued,
    ReceiveComplete,
    WaitComplete,
}

/// Snapshot of both queues' counters, host view
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Cursors {
    pub tx_write: u32,
    pub tx_read: u32,
    pub rx_write: u32,
    pub rx_read: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TraceEvent {
    pub point: TracePoint,
    pub channel: ChannelId,
    pub cursors: Cursors,
}

/// Receiver of channel trace events
///
/// Called inline from channel operations, so implementations must be quick
/// and must not call back into the channel.
pub trait TraceSink: Send + Sync {
    fn record(&self, event: &TraceEvent);
}

/// Forwards trace events to `log::trace!`
#[derive(Debug, Default, Clone, Copy)]
pub struct LogTraceSink;

impl TraceSink for LogTraceSink {
    fn record(&self, event: &TraceEvent) {
        log::trace!(
            "ivc[{}] {:?} tx w={} r={} rx w={} r={}",
            event.channel,
            event.point,
            event.cursors.tx_write,
            event.cursors.tx_read,
            event.cursors.rx_write,
            event.cursors.rx_read,
        );
    }
}
