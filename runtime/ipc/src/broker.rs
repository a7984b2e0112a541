//! Channel Broker - IVC channel bookkeeping
//!
//! Owns the shared-memory regions behind every IVC channel the host has
//! set up with the DCE. Establishing a channel allocates its region from the
//! platform's [`IovaAllocator`], binds a host-side [`IvcChannel`] to it and
//! records it under its id; closing frees the region again.
//!
//! The broker does not talk to the DCE. Telling the firmware where a channel
//! lives (boot commands) and running the reset handshake are the driver's job;
//! the broker only tracks how far each channel has got.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use crate::region::{IovaAllocator, SharedRegion};
use crate::trace::TraceSink;
use crate::{ChannelId, Doorbell, Geometry, IpcError, IvcChannel, Result, Side};

/// Channel state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    /// Memory allocated, peer not yet told or handshake pending
    Establishing,
    /// Handshake complete, traffic may flow
    Active,
    /// Torn down by a reset or a firmware abort; must be re-established
    Closed,
}

/// Channel metadata
#[derive(Debug, Clone)]
pub struct Channel {
    pub id: ChannelId,
    pub state: ChannelState,
    pub geometry: Geometry,
    pub region: SharedRegion,
    pub ivc: Arc<Mutex<IvcChannel>>,
}

/// Channel Broker - manages IVC channels
pub struct ChannelBroker {
    /// All known channels
    channels: BTreeMap<ChannelId, Channel>,
    /// Shared-memory source
    allocator: Arc<dyn IovaAllocator>,
    /// Maximum channels
    max_channels: usize,
    /// Sink for channel trace points
    trace: Arc<dyn TraceSink>,
}

impl ChannelBroker {
    /// Create a new channel broker
    ///
    /// # Arguments
    /// * `allocator` - Source of device-visible memory
    /// * `max_channels` - Maximum number of concurrent channels
    /// * `trace` - Receives trace points of every channel established here
    pub fn new(
        allocator: Arc<dyn IovaAllocator>,
        max_channels: usize,
        trace: Arc<dyn TraceSink>,
    ) -> Self {
        Self {
            channels: BTreeMap::new(),
            allocator,
            max_channels,
            trace,
        }
    }

    /// Allocate and initialize the host end of channel `id`
    ///
    /// The channel starts in [`ChannelState::Establishing`]; the caller
    /// marks it active once the reset handshake completes.
    pub fn establish_channel(
        &mut self,
        id: ChannelId,
        geometry: Geometry,
        doorbell: Option<Doorbell>,
    ) -> Result<Arc<Mutex<IvcChannel>>> {
        if self.channels.contains_key(&id) {
            return Err(IpcError::ChannelExists(id));
        }
        if self.channels.len() >= self.max_channels {
            return Err(IpcError::NoFreeChannels {
                max: self.max_channels,
            });
        }
        geometry.validate()?;

        let region = self.allocator.allocate(geometry.region_size())?;
        let mut ivc = match IvcChannel::new(
            id,
            region.clone(),
            geometry,
            Side::Host,
            doorbell,
            self.trace.clone(),
        ) {
            Ok(ivc) => ivc,
            Err(e) => {
                self.allocator.free(&region);
                return Err(e);
            }
        };
        ivc.init();

        log::debug!(
            "broker: channel {} at {:#x} ({} x {} bytes)",
            id,
            region.iova(),
            geometry.nframes,
            geometry.frame_size
        );

        let ivc = Arc::new(Mutex::new(ivc));
        self.channels.insert(
            id,
            Channel {
                id,
                state: ChannelState::Establishing,
                geometry,
                region,
                ivc: ivc.clone(),
            },
        );
        Ok(ivc)
    }

    /// Get channel information
    pub fn get_channel(&self, id: ChannelId) -> Option<&Channel> {
        self.channels.get(&id)
    }

    /// Host end of channel `id`
    pub fn ivc(&self, id: ChannelId) -> Option<Arc<Mutex<IvcChannel>>> {
        self.channels.get(&id).map(|c| c.ivc.clone())
    }

    /// Update channel state
    pub fn set_channel_state(&mut self, id: ChannelId, state: ChannelState) -> Result<()> {
        self.channels
            .get_mut(&id)
            .map(|c| c.state = state)
            .ok_or(IpcError::ChannelNotFound(id))
    }

    pub fn channel_state(&self, id: ChannelId) -> Option<ChannelState> {
        self.channels.get(&id).map(|c| c.state)
    }

    /// Mark every channel closed without releasing memory
    ///
    /// Used when the firmware has gone away; the regions stay allocated so
    /// the channels can be re-established in place.
    pub fn close_all(&mut self) {
        for channel in self.channels.values_mut() {
            channel.state = ChannelState::Closed;
        }
    }

    /// Close a channel and free its region
    pub fn close_channel(&mut self, id: ChannelId) -> Result<()> {
        let channel = self
            .channels
            .remove(&id)
            .ok_or(IpcError::ChannelNotFound(id))?;
        self.allocator.free(&channel.region);
        log::debug!("broker: channel {} closed", id);
        Ok(())
    }

    /// Close every channel and free all regions
    pub fn release_all(&mut self) {
        let ids: Vec<ChannelId> = self.channels.keys().copied().collect();
        for id in ids {
            // Ids come from the map itself
            let _ = self.close_channel(id);
        }
    }

    /// List channel ids
    pub fn list_channels(&self) -> Vec<ChannelId> {
        self.channels.keys().copied().collect()
    }
}

impl core::fmt::Debug for ChannelBroker {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ChannelBroker")
            .field("channels", &self.list_channels())
            .field("max_channels", &self.max_channels)
            .finish()
    }
}
