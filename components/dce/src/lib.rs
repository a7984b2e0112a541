//! DCE Control Plane
//!
//! Host-side driver for the DCE, the display controller's companion
//! processor. It boots the DCE over HSP mailbox commands, brings up two IVC
//! channels (admin and log) in shared memory, runs request/reply
//! conversations over them, sequences SC7 suspend/resume and surfaces DCE
//! failures.
//!
//! # Purpose
//! One [`Dce`] per DCE instance. Callers on any thread issue requests; the
//! platform's interrupt context delivers notifications; both meet in the
//! protocol state machine ([`fsm::Fsm`]), which is the only place state
//! changes.
//!
//! # Integration Points
//! - Depends on: `dce-hsp` (mailboxes, semaphores, interrupt enables),
//!   `dce-ipc` (IVC channels and shared memory), a [`Platform`] for
//!   interrupt routing, IOVA allocation and PM notification
//! - Provides to: display stack clients (admin requests, log control,
//!   power transitions)
//!
//! # Architecture
//! ```text
//!   caller threads                         interrupt context
//!        |                                        |
//!   Dce::admin_request ...                  isr::service
//!        |  post *_REQUESTED                      |  post *_RECEIVED
//!        v                                        v
//!   +-----------------------  Fsm  ------------------------+
//!   |  (state, event) -> handler, one lock                 |
//!   +------------------------------------------------------+
//!        |  arm / signal                  |  Dispatch
//!        v                                v
//!   WaitRegistry                   HSP mailbox / IVC frames
//! ```
//!
//! A round trip arms a wait slot and dispatches under the FSM lock, then
//! blocks on the slot with the lock released. Round trips are serialized by
//! a request lock: a second caller queues behind the first.
//!
//! # Lifecycle
//! [`Dce::init`] allocates and wires everything, [`Dce::start`] boots the
//! DCE and establishes the channels, [`Dce::stop`] quiesces (and recovers
//! from ABORT), [`Dce::deinit`] releases all resources.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use dce_hsp::{Hsp, HspInstance, IeBits, IrqLine, MailboxId, SemaphoreId};
use dce_ipc::{ChannelBroker, Doorbell, IovaAllocator, IvcChannel, TracePoint, TraceSink};

pub mod config;
pub mod error;
pub mod fsm;
pub mod isr;
pub mod logbuf;
pub mod pm;
pub mod protocol;
pub mod wait;

#[cfg(feature = "sim")]
pub mod sim;

pub use config::DceConfig;
pub use dce_ipc::{ChannelId, ChannelState};
pub use error::{DceError, Result};
pub use fsm::{DceState, Event, Outstanding, PostOutcome};
pub use isr::{IrqHandler, IrqRegistrar};
pub use logbuf::LogRead;
pub use pm::{LogPmNotifier, PmNotifier};
pub use protocol::{AdminReply, LogOp};
pub use wait::{SlotState, WaitKind};

use fsm::{Dispatch, Fsm};
use logbuf::LogManager;
use pm::PowerSnapshot;
use protocol::{
    AdminMessage, BootStatus, HostCmd, HostWord, LogControl, ADMIN_CHANNEL, LOG_CHANNEL,
    PROTOCOL_VERSION,
};
use wait::{Ticket, WaitRegistry};

/// Services the driver needs from the platform
#[derive(Clone)]
pub struct Platform {
    pub hsp: Hsp,
    pub irq: Arc<dyn IrqRegistrar>,
    pub iova: Arc<dyn IovaAllocator>,
    pub pm: Arc<dyn PmNotifier>,
    pub trace: Arc<dyn TraceSink>,
}

/// Resolved HSP resources
#[derive(Debug, Clone)]
pub(crate) struct Wiring {
    pub instance: HspInstance,
    pub to_remote: MailboxId,
    pub from_remote: MailboxId,
    pub status: SemaphoreId,
    pub host_line: IrqLine,
    pub owned_lines: Vec<IrqLine>,
}

impl Wiring {
    fn resolve(config: &DceConfig) -> Result<Self> {
        let hsp = &config.hsp;
        Ok(Self {
            instance: hsp.instance()?,
            to_remote: hsp.to_remote()?,
            from_remote: hsp.from_remote()?,
            status: hsp.status_semaphore()?,
            host_line: hsp.host_line()?,
            owned_lines: hsp.owned_lines()?,
        })
    }
}

const CHANNEL_BITS: u8 = (1 << ADMIN_CHANNEL) | (1 << LOG_CHANNEL);

/// Which IVC channels have finished the reset handshake
#[derive(Debug, Default)]
pub(crate) struct Links {
    up: Mutex<u8>,
    changed: Condvar,
}

impl Links {
    fn lock(&self) -> MutexGuard<'_, u8> {
        self.up.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn mark(&self, id: ChannelId) {
        let mut up = self.lock();
        if *up & (1 << id) == 0 {
            *up |= 1 << id;
            log::debug!("dce: channel {} established", id);
            self.changed.notify_all();
        }
    }

    pub fn clear(&self) {
        *self.lock() = 0;
    }

    /// Bitmask of established channels, once all of `mask` are up or the
    /// timeout passes
    fn wait_for(&self, mask: u8, timeout: Duration) -> u8 {
        let deadline = Instant::now() + timeout;
        let mut up = self.lock();
        while *up & mask != mask {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            up = self
                .changed
                .wait_timeout(up, deadline - now)
                .unwrap_or_else(|e| e.into_inner())
                .0;
        }
        *up
    }
}

/// Outgoing side of the FSM: HSP words and IVC frames
struct HwDispatch {
    hsp: Hsp,
    wiring: Wiring,
    admin: Arc<Mutex<IvcChannel>>,
    log_channel: Arc<Mutex<IvcChannel>>,
    logs: Arc<LogManager>,
    ivc_live: Arc<AtomicBool>,
}

impl HwDispatch {
    /// Post a command word to the DCE
    ///
    /// A doorbell still sitting in the mailbox is superseded: the DCE
    /// rescans its channels on every word.
    fn send_word(&self, word: HostWord) -> Result<()> {
        let (inst, mbox) = (self.wiring.instance, self.wiring.to_remote);
        // Not atomic against a doorbell rung from the interrupt path between
        // this check and the write; a command lost that way times out.
        if let Some(pending) = self.hsp.mailbox_value(inst, mbox) {
            match HostWord::decode(pending) {
                Ok(w) if w.cmd == HostCmd::Doorbell => {
                    log::trace!("dce: {:?} supersedes pending doorbell", word.cmd);
                }
                _ => {
                    return Err(DceError::Protocol(format!(
                        "command mailbox still holds {:#010x}",
                        pending
                    )))
                }
            }
        }
        self.hsp.mailbox_write(word.encode(), inst, mbox);
        Ok(())
    }

    fn send_frame(channel: &Mutex<IvcChannel>, frame: &[u8]) -> Result<()> {
        let mut ivc = channel.lock().unwrap_or_else(|e| e.into_inner());
        ivc.send(frame)?;
        Ok(())
    }
}

impl Dispatch for HwDispatch {
    fn enable_events(&self) -> Result<()> {
        let w = &self.wiring;
        // Anything left over from a previous life is meaningless now
        self.hsp.mailbox_clear(w.instance, w.from_remote);
        self.hsp
            .mailbox_set_full_interrupt_enable(true, w.instance, w.from_remote);
        self.hsp
            .interrupt_enable_update(IeBits::full(w.from_remote), true, w.instance, w.host_line);
        Ok(())
    }

    fn kick_boot(&self) -> Result<()> {
        let w = &self.wiring;
        self.hsp
            .semaphore_set(BootStatus::HOST_READY.bits(), w.instance, w.status);
        self.send_word(HostWord::new(HostCmd::Boot, PROTOCOL_VERSION, 0)?)
    }

    fn send_boot_cmd(&self, word: HostWord) -> Result<()> {
        self.send_word(word)
    }

    fn send_admin(&self, msg: &AdminMessage) -> Result<()> {
        Self::send_frame(&self.admin, &protocol::encode(msg)?)
    }

    fn send_sc7_enter(&self) -> Result<()> {
        self.send_word(HostWord::new(HostCmd::EnterSc7, 0, 0)?)
    }

    fn send_log(&self, msg: &LogControl) -> Result<()> {
        Self::send_frame(&self.log_channel, &protocol::encode(msg)?)
    }

    fn dump_crash_log(&self) {
        self.logs.dump();
    }

    fn quiesce(&self) {
        let w = &self.wiring;
        self.ivc_live.store(false, Ordering::Release);
        self.hsp
            .interrupt_enable_update(IeBits::full(w.from_remote), false, w.instance, w.host_line);
        self.hsp
            .mailbox_set_full_interrupt_enable(false, w.instance, w.from_remote);
        self.hsp.mailbox_clear(w.instance, w.from_remote);
        self.hsp
            .semaphore_clear(BootStatus::HOST_READY.bits(), w.instance, w.status);
    }
}

/// State shared between caller threads and the interrupt path
pub(crate) struct Shared {
    pub config: DceConfig,
    pub wiring: Wiring,
    pub hsp: Hsp,
    pub fsm: Fsm,
    pub waits: Arc<WaitRegistry>,
    pub broker: Mutex<ChannelBroker>,
    pub admin: Arc<Mutex<IvcChannel>>,
    pub log_channel: Arc<Mutex<IvcChannel>>,
    pub logs: Arc<LogManager>,
    pub links: Links,
    pub ivc_live: Arc<AtomicBool>,
    pub snapshot: Mutex<Option<PowerSnapshot>>,
    requests: Mutex<()>,
    pub iova: Arc<dyn IovaAllocator>,
    pub irq: Arc<dyn IrqRegistrar>,
    pub pm: Arc<dyn PmNotifier>,
}

impl Shared {
    /// Serialize round trips
    pub fn request_lock(&self) -> MutexGuard<'_, ()> {
        self.requests.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn broker(&self) -> MutexGuard<'_, ChannelBroker> {
        self.broker.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn channel(&self, id: ChannelId) -> &Arc<Mutex<IvcChannel>> {
        if id == LOG_CHANNEL {
            &self.log_channel
        } else {
            &self.admin
        }
    }

    pub fn emit(&self, id: ChannelId, point: TracePoint) {
        self.channel(id)
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .emit(point);
    }

    /// Post a request event and wait for its reply
    pub fn round_trip(&self, event: Event, timeout: Duration) -> Result<()> {
        let ticket = match self.fsm.post_event(event)? {
            PostOutcome::Armed(ticket) => ticket,
            _ => return Err(self.not_operating()),
        };
        self.wait(&ticket, timeout)
    }

    /// Wait on an armed slot, cleaning up after a timeout
    pub fn wait(&self, ticket: &Ticket, timeout: Duration) -> Result<()> {
        match self.waits.wait(ticket, timeout) {
            Err(DceError::Timeout(kind)) => {
                self.fsm.request_timed_out(kind);
                Err(DceError::Timeout(kind))
            }
            Err(DceError::Interrupted(_)) if self.fsm.state() == DceState::Abort => {
                Err(DceError::Aborted)
            }
            other => other,
        }
    }

    pub fn not_operating(&self) -> DceError {
        match self.fsm.state() {
            DceState::Abort => DceError::Aborted,
            state => DceError::InvalidState(state),
        }
    }

    fn boot_cmd(&self, cmd: HostCmd, arg: u32) -> Result<()> {
        self.round_trip(
            Event::BootCmdMsgRequested { cmd, arg },
            self.config.timeouts.boot_cmd(),
        )?;
        match self.fsm.take_boot_cmd_status() {
            Some(0) => Ok(()),
            Some(status) => {
                log::error!("dce: {:?} refused with status {:#x}", cmd, status);
                Err(DceError::Remote(u32::from(status)))
            }
            None => Err(DceError::Protocol(format!("{:?} acknowledged without status", cmd))),
        }
    }

    /// Describe both channels to the DCE over the bootstrap mailbox
    fn bootstrap(&self) -> Result<()> {
        self.boot_cmd(HostCmd::Version, PROTOCOL_VERSION)?;

        for id in [ADMIN_CHANNEL, LOG_CHANNEL] {
            let (iova, geometry) = {
                let mut ivc = self.channel(id).lock().unwrap_or_else(|e| e.into_inner());
                ivc.init();
                (ivc.region().iova(), ivc.geometry())
            };
            let pfn = u32::try_from(iova >> 12)
                .map_err(|_| DceError::Config(format!("channel {} above addressable IOVA", id)))?;

            self.boot_cmd(HostCmd::SelectChannel, id as u32)?;
            self.boot_cmd(HostCmd::SetAddr, pfn)?;
            self.boot_cmd(HostCmd::SetFrames, geometry.nframes)?;
            self.boot_cmd(HostCmd::SetFrameSize, geometry.frame_size)?;
            self.boot_cmd(HostCmd::ChannelInit, 0)?;
        }

        self.boot_cmd(HostCmd::Lock, 0)
    }

    /// STOP the FSM and put every channel back to closed
    fn halt(&self) -> Result<()> {
        self.fsm.post_event(Event::Stop)?;
        self.links.clear();
        self.broker().close_all();
        self.snapshot
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(buffer) = self.logs.lock().as_mut() {
            buffer.rewind();
        }
        Ok(())
    }

    /// Run the IVC reset handshake on both channels
    fn bring_up_links(&self) -> Result<()> {
        self.links.clear();
        self.ivc_live.store(true, Ordering::Release);
        for id in [ADMIN_CHANNEL, LOG_CHANNEL] {
            self.channel(id)
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .reset();
        }

        let up = self
            .links
            .wait_for(CHANNEL_BITS, self.config.timeouts.ivc_reset());
        let mut broker = self.broker();
        for id in [ADMIN_CHANNEL, LOG_CHANNEL] {
            if up & (1 << id) == 0 {
                log::error!("dce: channel {} reset handshake timed out", id);
                return Err(DceError::LinkDown(id));
            }
            self.emit(id, TracePoint::WaitComplete);
            broker.set_channel_state(id, ChannelState::Active)?;
        }
        Ok(())
    }
}

/// Handle to one DCE
pub struct Dce {
    shared: Arc<Shared>,
}

impl Dce {
    /// Allocate channels, wire the FSM and install the interrupt handler
    ///
    /// Nothing is sent to the DCE until [`Dce::start`].
    pub fn init(config: DceConfig, platform: Platform) -> Result<Self> {
        config.validate()?;
        let wiring = Wiring::resolve(&config)?;
        let hsp = platform.hsp.clone();

        let mut broker = ChannelBroker::new(platform.iova.clone(), 2, platform.trace.clone());
        let doorbell = |id: ChannelId| {
            Doorbell::new(
                hsp.clone(),
                wiring.instance,
                wiring.to_remote,
                HostWord::doorbell(id),
            )
        };
        let admin = broker
            .establish_channel(ADMIN_CHANNEL, config.admin.geometry(), Some(doorbell(ADMIN_CHANNEL)))
            .map_err(DceError::Alloc)?;
        let log_channel = match broker.establish_channel(
            LOG_CHANNEL,
            config.log.channel.geometry(),
            Some(doorbell(LOG_CHANNEL)),
        ) {
            Ok(ivc) => ivc,
            Err(e) => {
                broker.release_all();
                return Err(DceError::Alloc(e));
            }
        };

        let logs = Arc::new(LogManager::default());
        let ivc_live = Arc::new(AtomicBool::new(false));
        let dispatch = Arc::new(HwDispatch {
            hsp: hsp.clone(),
            wiring: wiring.clone(),
            admin: admin.clone(),
            log_channel: log_channel.clone(),
            logs: logs.clone(),
            ivc_live: ivc_live.clone(),
        });
        let waits = Arc::new(WaitRegistry::new());
        let fsm = Fsm::new(waits.clone(), dispatch);

        let shared = Arc::new(Shared {
            config,
            wiring,
            hsp,
            fsm,
            waits,
            broker: Mutex::new(broker),
            admin,
            log_channel,
            logs,
            links: Links::default(),
            ivc_live,
            snapshot: Mutex::new(None),
            requests: Mutex::new(()),
            iova: platform.iova,
            irq: platform.irq,
            pm: platform.pm,
        });

        let weak = Arc::downgrade(&shared);
        shared.irq.attach(
            shared.wiring.instance,
            shared.wiring.host_line,
            Box::new(move || {
                if let Some(shared) = weak.upgrade() {
                    isr::service(&shared);
                }
            }),
        );

        log::info!(
            "dce: initialized on {:?} (to_remote {:?}, from_remote {:?})",
            shared.wiring.instance,
            shared.wiring.to_remote,
            shared.wiring.from_remote
        );
        Ok(Self { shared })
    }

    /// Boot the DCE, run the bootstrap exchange and establish both channels
    ///
    /// Returns once the driver is in the operating state. A no-op if it
    /// already is. A failure after the boot handshake quiesces the link
    /// again, so the next call reruns the whole sequence; if the DCE aborted
    /// meanwhile it stays in ABORT until [`Dce::stop`].
    pub fn start(&self) -> Result<()> {
        let s = &self.shared;
        let _guard = s.request_lock();
        if s.fsm.is_operating() {
            log::debug!("dce: already started");
            return Ok(());
        }

        match s.fsm.post_event(Event::Start)? {
            PostOutcome::Handled(DceState::BootWait) => {}
            _ => return Err(s.not_operating()),
        }
        let started = s
            .round_trip(Event::BootCompleteRequested, s.config.timeouts.boot())
            .and_then(|()| s.bootstrap())
            .and_then(|()| s.bring_up_links());
        if let Err(e) = started {
            log::error!("dce: start failed: {}", e);
            if s.fsm.state() != DceState::Abort {
                if let Err(halt) = s.halt() {
                    log::warn!("dce: quiesce after failed start: {}", halt);
                }
            }
            return Err(e);
        }

        log::info!("dce: started");
        Ok(())
    }

    /// Quiesce the DCE link and return to IDLE
    ///
    /// Valid from any state, including ABORT. Blocked callers are woken with
    /// [`DceError::Interrupted`]. Channels and the log buffer stay allocated;
    /// [`Dce::start`] reuses them.
    pub fn stop(&self) -> Result<()> {
        self.shared.halt()
    }

    /// Stop and release every resource
    pub fn deinit(self) {
        if let Err(e) = self.stop() {
            log::warn!("dce: stop during deinit: {}", e);
        }
        let s = &self.shared;
        s.irq.detach(s.wiring.instance, s.wiring.host_line);
        if let Some(buffer) = s.logs.lock().take() {
            s.iova.free(buffer.region());
        }
        for region in s.logs.take_parked() {
            s.iova.free(&region);
        }
        s.broker().release_all();
        log::info!("dce: deinitialized");
    }

    /// Feed an event to the state machine
    ///
    /// For adjacent subsystems that observe DCE activity on their own. A
    /// request event posted here arms its wait slot like any other; the
    /// caller owns the returned ticket.
    pub fn post_event(&self, event: Event) -> Result<PostOutcome> {
        self.shared.fsm.post_event(event)
    }

    /// Send an admin request and wait for the matching reply
    ///
    /// # Errors
    /// [`DceError::Remote`] carries a non-zero reply status.
    pub fn admin_request(&self, cmd: u32, payload: &[u8]) -> Result<AdminReply> {
        let s = &self.shared;
        let _guard = s.request_lock();
        s.round_trip(
            Event::AdminIpcMsgRequested {
                cmd,
                payload: payload.to_vec(),
            },
            s.config.timeouts.admin(),
        )?;
        s.emit(ADMIN_CHANNEL, TracePoint::WaitComplete);

        let reply = s
            .fsm
            .take_admin_reply()
            .ok_or_else(|| DceError::Protocol("admin reply lost".into()))?;
        if reply.status != protocol::status::OK {
            return Err(DceError::Remote(reply.status));
        }
        Ok(reply)
    }

    pub fn state(&self) -> DceState {
        self.shared.fsm.state()
    }

    /// IDLE with the DCE booted
    pub fn is_operating(&self) -> bool {
        self.shared.fsm.is_operating()
    }

    pub fn outstanding(&self) -> Outstanding {
        self.shared.fsm.outstanding()
    }

    pub fn slot_state(&self, kind: WaitKind) -> SlotState {
        self.shared.waits.state(kind)
    }

    /// Reason code of the last ABORT
    pub fn abort_reason(&self) -> Option<u16> {
        self.shared.fsm.abort_reason()
    }

    /// The firmware reports itself booted in the status semaphore
    pub fn firmware_booted(&self) -> bool {
        let w = &self.shared.wiring;
        BootStatus::from_bits_retain(self.shared.hsp.semaphore_get_state(w.instance, w.status))
            .contains(BootStatus::FW_BOOTED)
    }

    pub fn channel_state(&self, id: ChannelId) -> Option<ChannelState> {
        self.shared.broker().channel_state(id)
    }

    pub fn config(&self) -> &DceConfig {
        &self.shared.config
    }
}

impl core::fmt::Debug for Dce {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Dce")
            .field("fsm", &self.shared.fsm)
            .field("wiring", &self.shared.wiring)
            .finish_non_exhaustive()
    }
}
