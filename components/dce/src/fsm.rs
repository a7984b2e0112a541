//! FSM Core - the DCE protocol state machine
//!
//! # Purpose
//! Sole authority for the DCE's protocol state. Every change goes through
//! [`Fsm::post_event`], which holds one lock across the whole
//! lookup/handle/update cycle, so transitions are totally ordered no matter
//! whether they come from a caller thread or the interrupt path.
//!
//! # Architecture
//! The transition table is a `match` over `(state, event)` resolving to a
//! [`Handler`]. Pairs the table does not map resolve to `Handler::Ignore`:
//! replies routinely race a caller giving up, so an unexpected event is
//! logged, never fatal.
//!
//! ```text
//!            START              BOOT_COMPLETE_RECEIVED
//!   IDLE ------------> BOOT_WAIT ---------------------> IDLE (booted)
//!
//!   IDLE (booted) --*_REQUESTED--> *_WFI --*_RECEIVED / timeout--> IDLE
//!   IDLE (booted) --SC7_ENTER_REQUESTED--> SC7_ENTER_WFI
//!                 --SC7_ENTERED_RECEIVED--> SC7_ENTERED
//!                 --SC7_EXIT_RECEIVED--> IDLE
//!
//!   any --ABORT_RECEIVED / CRASH_LOG_RECEIVED--> ABORT
//!   any --STOP--> IDLE (not booted)
//! ```
//!
//! The operating state is IDLE with the booted flag set. ABORT accepts
//! nothing but STOP.
//!
//! # Integration Points
//! - Depends on: [`WaitRegistry`] (round trips), a [`Dispatch`] (outgoing
//!   messages)
//! - Provides to: the driver front end and the interrupt path

use std::sync::{Arc, Mutex, MutexGuard};

use bitflags::bitflags;

use crate::error::{DceError, Result};
use crate::protocol::{AdminMessage, AdminReply, HostCmd, HostWord, LogControl, LogOp};
use crate::wait::{Ticket, WaitKind, WaitRegistry};

/// Protocol state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DceState {
    Idle,
    BootWait,
    BootCmdWfi,
    AdminWfi,
    Sc7EnterWfi,
    Sc7Entered,
    LogReadyWfi,
    Abort,
}

impl DceState {
    pub const ALL: [DceState; 8] = [
        DceState::Idle,
        DceState::BootWait,
        DceState::BootCmdWfi,
        DceState::AdminWfi,
        DceState::Sc7EnterWfi,
        DceState::Sc7Entered,
        DceState::LogReadyWfi,
        DceState::Abort,
    ];

    /// State a caller sits in while a round trip of `kind` is in flight
    pub const fn waiting_for(kind: WaitKind) -> DceState {
        match kind {
            WaitKind::BootComplete => DceState::BootWait,
            WaitKind::BootCmd => DceState::BootCmdWfi,
            WaitKind::Admin => DceState::AdminWfi,
            WaitKind::Sc7 => DceState::Sc7EnterWfi,
            WaitKind::Log => DceState::LogReadyWfi,
        }
    }
}

// One mask bit per wait kind
static_assertions::const_assert!(WaitKind::COUNT <= 8);

bitflags! {
    /// Round trips currently in flight
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct Outstanding: u8 {
        const BOOT_COMPLETE = 1 << 0;
        const BOOT_CMD = 1 << 1;
        const ADMIN = 1 << 2;
        const SC7 = 1 << 3;
        const LOG = 1 << 4;
    }
}

impl From<WaitKind> for Outstanding {
    fn from(kind: WaitKind) -> Self {
        Outstanding::from_bits_retain(1 << kind.index())
    }
}

/// Event vocabulary, with per-event payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Start,
    BootCompleteRequested,
    BootCompleteReceived,
    BootCmdMsgRequested { cmd: HostCmd, arg: u32 },
    BootCmdMsgReceived { seq: u8, status: u8 },
    AdminIpcMsgRequested { cmd: u32, payload: Vec<u8> },
    AdminIpcMsgReceived { reply: AdminReply },
    Sc7EnterRequested,
    Sc7EnteredReceived,
    Sc7ExitReceived,
    LogRequested { op: LogOp },
    LogReadyReceived { seq: u16, status: u8 },
    AbortReceived { reason: u16 },
    CrashLogReceived,
    LogOverflowReceived,
    Stop,
}

impl Event {
    pub fn name(&self) -> &'static str {
        match self {
            Event::Start => "START",
            Event::BootCompleteRequested => "BOOT_COMPLETE_REQUESTED",
            Event::BootCompleteReceived => "BOOT_COMPLETE_RECEIVED",
            Event::BootCmdMsgRequested { .. } => "BOOT_CMD_MSG_REQUESTED",
            Event::BootCmdMsgReceived { .. } => "BOOT_CMD_MSG_RECEIVED",
            Event::AdminIpcMsgRequested { .. } => "ADMIN_IPC_MSG_REQUESTED",
            Event::AdminIpcMsgReceived { .. } => "ADMIN_IPC_MSG_RECEIVED",
            Event::Sc7EnterRequested => "SC7_ENTER_REQUESTED",
            Event::Sc7EnteredReceived => "SC7_ENTERED_RECEIVED",
            Event::Sc7ExitReceived => "SC7_EXIT_RECEIVED",
            Event::LogRequested { .. } => "LOG_REQUESTED",
            Event::LogReadyReceived { .. } => "LOG_READY_RECEIVED",
            Event::AbortReceived { .. } => "ABORT_RECEIVED",
            Event::CrashLogReceived => "CRASH_LOG_RECEIVED",
            Event::LogOverflowReceived => "LOG_OVERFLOW_RECEIVED",
            Event::Stop => "STOP",
        }
    }
}

/// Result of a successful [`Fsm::post_event`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PostOutcome {
    /// Transition taken; the new state
    Handled(DceState),
    /// A round trip was armed and dispatched; wait on the ticket
    Armed(Ticket),
    /// No transition for this (state, event) pair
    Ignored,
}

/// Outgoing side effects of transitions
///
/// Implementations run with the FSM lock held and must not block for
/// longer than a register write or an IVC frame copy.
pub trait Dispatch: Send + Sync {
    /// START: route DCE notifications to the host
    fn enable_events(&self) -> Result<()>;
    /// BOOT_COMPLETE_REQUESTED: release the DCE
    fn kick_boot(&self) -> Result<()>;
    fn send_boot_cmd(&self, word: HostWord) -> Result<()>;
    fn send_admin(&self, msg: &AdminMessage) -> Result<()>;
    fn send_sc7_enter(&self) -> Result<()>;
    fn send_log(&self, msg: &LogControl) -> Result<()>;
    /// CRASH_LOG_RECEIVED: dump whatever the DCE logged
    fn dump_crash_log(&self);
    /// STOP: stop routing notifications
    fn quiesce(&self);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Handler {
    EnableEvents,
    ArmBoot,
    BootComplete,
    Request(WaitKind),
    Reply(WaitKind),
    Sc7Entered,
    Sc7Exit,
    Late(WaitKind),
    Abort,
    CrashLog,
    LogOverflow,
    Stop,
    Reject,
    Ignore,
}

fn lookup(state: DceState, booted: bool, event: &Event) -> Handler {
    use DceState::*;

    match (state, event) {
        (_, Event::Stop) => Handler::Stop,
        (Abort, _) => Handler::Reject,

        (_, Event::AbortReceived { .. }) => Handler::Abort,
        (_, Event::CrashLogReceived) => Handler::CrashLog,
        (_, Event::LogOverflowReceived) => Handler::LogOverflow,

        (Idle, Event::Start) if !booted => Handler::EnableEvents,
        (BootWait, Event::BootCompleteRequested) => Handler::ArmBoot,
        (BootWait, Event::BootCompleteReceived) => Handler::BootComplete,

        (Idle, Event::BootCmdMsgRequested { .. }) if booted => Handler::Request(WaitKind::BootCmd),
        (Idle, Event::AdminIpcMsgRequested { .. }) if booted => Handler::Request(WaitKind::Admin),
        (Idle, Event::Sc7EnterRequested) if booted => Handler::Request(WaitKind::Sc7),
        (Idle, Event::LogRequested { .. }) if booted => Handler::Request(WaitKind::Log),

        (BootCmdWfi, Event::BootCmdMsgReceived { .. }) => Handler::Reply(WaitKind::BootCmd),
        (AdminWfi, Event::AdminIpcMsgReceived { .. }) => Handler::Reply(WaitKind::Admin),
        (LogReadyWfi, Event::LogReadyReceived { .. }) => Handler::Reply(WaitKind::Log),
        (Sc7EnterWfi, Event::Sc7EnteredReceived) => Handler::Sc7Entered,
        (Sc7Entered, Event::Sc7ExitReceived) => Handler::Sc7Exit,

        // Replies whose caller already gave up
        (_, Event::BootCmdMsgReceived { .. }) => Handler::Late(WaitKind::BootCmd),
        (_, Event::AdminIpcMsgReceived { .. }) => Handler::Late(WaitKind::Admin),
        (_, Event::LogReadyReceived { .. }) => Handler::Late(WaitKind::Log),
        (_, Event::Sc7EnteredReceived) => Handler::Late(WaitKind::Sc7),

        _ => Handler::Ignore,
    }
}

#[derive(Debug, Default)]
struct Replies {
    boot_cmd_status: Option<u8>,
    admin: Option<AdminReply>,
    log_status: Option<u8>,
}

#[derive(Debug)]
struct FsmInner {
    state: DceState,
    booted: bool,
    outstanding: Outstanding,
    replies: Replies,
    overflows: u64,
    abort_reason: Option<u16>,
}

impl FsmInner {
    fn new() -> Self {
        Self {
            state: DceState::Idle,
            booted: false,
            outstanding: Outstanding::empty(),
            replies: Replies::default(),
            overflows: 0,
            abort_reason: None,
        }
    }
}

/// The protocol state machine of one DCE
pub struct Fsm {
    inner: Mutex<FsmInner>,
    waits: Arc<WaitRegistry>,
    dispatch: Arc<dyn Dispatch>,
}

impl Fsm {
    pub fn new(waits: Arc<WaitRegistry>, dispatch: Arc<dyn Dispatch>) -> Self {
        Self {
            inner: Mutex::new(FsmInner::new()),
            waits,
            dispatch,
        }
    }

    fn lock(&self) -> MutexGuard<'_, FsmInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn waits(&self) -> &WaitRegistry {
        &self.waits
    }

    /// Process one event
    ///
    /// # Errors
    /// - [`DceError::Aborted`] for anything but STOP once in ABORT
    /// - a request whose slot is busy or whose dispatch failed; nothing is
    ///   left armed in that case
    pub fn post_event(&self, event: Event) -> Result<PostOutcome> {
        let mut inner = self.lock();
        let handler = lookup(inner.state, inner.booted, &event);
        log::trace!("fsm: {} in {:?} -> {:?}", event.name(), inner.state, handler);

        match handler {
            Handler::EnableEvents => {
                self.dispatch.enable_events()?;
                inner.state = DceState::BootWait;
            }
            Handler::ArmBoot => {
                let ticket = self.arm(&mut inner, WaitKind::BootComplete)?;
                if let Err(e) = self.dispatch.kick_boot() {
                    self.disarm(&mut inner, WaitKind::BootComplete, DceState::BootWait);
                    return Err(e);
                }
                return Ok(PostOutcome::Armed(ticket));
            }
            Handler::BootComplete => {
                inner.booted = true;
                inner.state = DceState::Idle;
                inner.outstanding.remove(WaitKind::BootComplete.into());
                self.waits.signal(WaitKind::BootComplete, None);
                log::info!("fsm: DCE booted");
            }
            Handler::Request(kind) => {
                let ticket = self.arm(&mut inner, kind)?;
                if let Err(e) = self.dispatch_request(event, &ticket) {
                    self.disarm(&mut inner, kind, DceState::Idle);
                    return Err(e);
                }
                return Ok(PostOutcome::Armed(ticket));
            }
            Handler::Reply(kind) => return Ok(self.reply(&mut inner, kind, event)),
            Handler::Sc7Entered => {
                inner.state = DceState::Sc7Entered;
                inner.outstanding.remove(WaitKind::Sc7.into());
                self.waits.signal(WaitKind::Sc7, None);
            }
            Handler::Sc7Exit => {
                inner.state = DceState::Idle;
                inner.outstanding.remove(WaitKind::Sc7.into());
                self.waits.signal(WaitKind::Sc7, None);
                log::info!("fsm: DCE resumed from SC7");
            }
            Handler::Late(kind) => {
                // Untagged notifications cannot be matched to a round trip
                if let Some(seq) = reply_seq(&event) {
                    self.waits.signal(kind, Some(seq));
                }
                log::debug!("fsm: stale {} in {:?}", event.name(), inner.state);
                return Ok(PostOutcome::Ignored);
            }
            Handler::Abort => {
                let reason = match event {
                    Event::AbortReceived { reason } => reason,
                    _ => 0,
                };
                Self::enter_abort(&mut inner, &self.waits, reason);
            }
            Handler::CrashLog => {
                log::error!("fsm: DCE crashed, dumping log");
                self.dispatch.dump_crash_log();
                Self::enter_abort(&mut inner, &self.waits, 0);
            }
            Handler::LogOverflow => {
                inner.overflows += 1;
                log::warn!("fsm: DCE log overflow (#{})", inner.overflows);
            }
            Handler::Stop => {
                self.dispatch.quiesce();
                self.waits.reset_all();
                *inner = FsmInner::new();
                log::info!("fsm: stopped");
            }
            Handler::Reject => return Err(DceError::Aborted),
            Handler::Ignore => {
                log::warn!("fsm: ignoring {} in {:?}", event.name(), inner.state);
                return Ok(PostOutcome::Ignored);
            }
        }

        Ok(PostOutcome::Handled(inner.state))
    }

    fn arm(&self, inner: &mut FsmInner, kind: WaitKind) -> Result<Ticket> {
        let ticket = self.waits.arm(kind, true)?;
        inner.outstanding.insert(kind.into());
        inner.state = DceState::waiting_for(kind);
        Ok(ticket)
    }

    fn disarm(&self, inner: &mut FsmInner, kind: WaitKind, back_to: DceState) {
        self.waits.reset(kind);
        inner.outstanding.remove(kind.into());
        inner.state = back_to;
    }

    fn dispatch_request(&self, event: Event, ticket: &Ticket) -> Result<()> {
        let seq = ticket.seq();
        match event {
            Event::BootCmdMsgRequested { cmd, arg } => {
                self.dispatch.send_boot_cmd(HostWord::new(cmd, arg, seq as u8)?)
            }
            Event::AdminIpcMsgRequested { cmd, payload } => self.dispatch.send_admin(&AdminMessage {
                seq: seq as u16,
                cmd,
                payload,
            }),
            Event::Sc7EnterRequested => self.dispatch.send_sc7_enter(),
            Event::LogRequested { op } => self.dispatch.send_log(&LogControl {
                seq: seq as u16,
                op,
            }),
            other => Err(DceError::Protocol(format!("{} is not a request", other.name()))),
        }
    }

    fn reply(&self, inner: &mut FsmInner, kind: WaitKind, event: Event) -> PostOutcome {
        let name = event.name();
        if !self.waits.signal(kind, reply_seq(&event)) {
            // Answer to an older round trip; keep waiting for ours
            log::debug!("fsm: stale {} in {:?}", name, inner.state);
            return PostOutcome::Ignored;
        }

        match event {
            Event::BootCmdMsgReceived { status, .. } => inner.replies.boot_cmd_status = Some(status),
            Event::AdminIpcMsgReceived { reply } => inner.replies.admin = Some(reply),
            Event::LogReadyReceived { status, .. } => inner.replies.log_status = Some(status),
            _ => {}
        }
        inner.outstanding.remove(kind.into());
        inner.state = DceState::Idle;
        PostOutcome::Handled(DceState::Idle)
    }

    fn enter_abort(inner: &mut FsmInner, waits: &WaitRegistry, reason: u16) {
        log::error!("fsm: {:?} -> ABORT (reason {:#x})", inner.state, reason);
        inner.state = DceState::Abort;
        inner.abort_reason = Some(reason);
        inner.outstanding = Outstanding::empty();
        waits.interrupt_all();
    }

    /// Return to the operating state after the caller's wait for `kind`
    /// timed out
    ///
    /// The slot itself stays stale so a late reply cannot complete the next
    /// round trip.
    pub fn request_timed_out(&self, kind: WaitKind) {
        let mut inner = self.lock();
        inner.outstanding.remove(kind.into());
        if inner.state == DceState::waiting_for(kind) {
            log::warn!("fsm: {:?} round trip timed out in {:?}", kind, inner.state);
            inner.state = DceState::Idle;
        }
    }

    /// Arm the SC7 slot for the DCE-initiated exit notification
    pub fn arm_resume(&self) -> Result<Ticket> {
        let mut inner = self.lock();
        match inner.state {
            DceState::Sc7Entered => {
                let ticket = self.waits.arm(WaitKind::Sc7, true)?;
                inner.outstanding.insert(WaitKind::Sc7.into());
                Ok(ticket)
            }
            DceState::Abort => Err(DceError::Aborted),
            state => Err(DceError::InvalidState(state)),
        }
    }

    /// Host-detected fatal condition
    pub fn abort(&self, reason: u16) {
        let mut inner = self.lock();
        if inner.state != DceState::Abort {
            Self::enter_abort(&mut inner, &self.waits, reason);
        }
    }

    pub fn state(&self) -> DceState {
        self.lock().state
    }

    pub fn is_booted(&self) -> bool {
        self.lock().booted
    }

    /// IDLE with the DCE booted
    pub fn is_operating(&self) -> bool {
        let inner = self.lock();
        inner.state == DceState::Idle && inner.booted
    }

    pub fn outstanding(&self) -> Outstanding {
        self.lock().outstanding
    }

    pub fn overflow_count(&self) -> u64 {
        self.lock().overflows
    }

    pub fn abort_reason(&self) -> Option<u16> {
        self.lock().abort_reason
    }

    pub fn take_boot_cmd_status(&self) -> Option<u8> {
        self.lock().replies.boot_cmd_status.take()
    }

    pub fn take_admin_reply(&self) -> Option<AdminReply> {
        self.lock().replies.admin.take()
    }

    pub fn take_log_status(&self) -> Option<u8> {
        self.lock().replies.log_status.take()
    }
}

fn reply_seq(event: &Event) -> Option<u32> {
    match event {
        Event::BootCmdMsgReceived { seq, .. } => Some(u32::from(*seq)),
        Event::AdminIpcMsgReceived { reply } => Some(u32::from(reply.seq)),
        Event::LogReadyReceived { seq, .. } => Some(u32::from(*seq)),
        _ => None,
    }
}

impl core::fmt::Debug for Fsm {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let inner = self.lock();
        f.debug_struct("Fsm")
            .field("state", &inner.state)
            .field("booted", &inner.booted)
            .field("outstanding", &inner.outstanding)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wait::SlotState;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    #[derive(Default)]
    struct Recorder {
        sent: Mutex<Vec<String>>,
        fail: AtomicBool,
    }

    impl Recorder {
        fn push(&self, what: String) -> Result<()> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(DceError::Protocol("dispatch failed".into()));
            }
            self.sent.lock().unwrap().push(what);
            Ok(())
        }

        fn last(&self) -> String {
            self.sent.lock().unwrap().last().cloned().unwrap_or_default()
        }
    }

    impl Dispatch for Recorder {
        fn enable_events(&self) -> Result<()> {
            self.push("enable".into())
        }
        fn kick_boot(&self) -> Result<()> {
            self.push("boot".into())
        }
        fn send_boot_cmd(&self, word: HostWord) -> Result<()> {
            self.push(format!("cmd {:?} seq {}", word.cmd, word.seq))
        }
        fn send_admin(&self, msg: &AdminMessage) -> Result<()> {
            self.push(format!("admin {} seq {}", msg.cmd, msg.seq))
        }
        fn send_sc7_enter(&self) -> Result<()> {
            self.push("sc7".into())
        }
        fn send_log(&self, msg: &LogControl) -> Result<()> {
            self.push(format!("log {:?}", msg.op))
        }
        fn dump_crash_log(&self) {
            let _ = self.push("dump".into());
        }
        fn quiesce(&self) {
            let _ = self.push("quiesce".into());
        }
    }

    fn fsm() -> (Fsm, Arc<Recorder>) {
        let recorder = Arc::new(Recorder::default());
        (Fsm::new(Arc::new(WaitRegistry::new()), recorder.clone()), recorder)
    }

    fn booted() -> (Fsm, Arc<Recorder>) {
        let (fsm, recorder) = fsm();
        fsm.post_event(Event::Start).unwrap();
        fsm.post_event(Event::BootCompleteRequested).unwrap();
        fsm.post_event(Event::BootCompleteReceived).unwrap();
        assert!(fsm.is_operating());
        (fsm, recorder)
    }

    fn armed(outcome: PostOutcome) -> Ticket {
        match outcome {
            PostOutcome::Armed(ticket) => ticket,
            other => panic!("expected a round trip, got {:?}", other),
        }
    }

    #[test]
    fn test_boot_sequence() {
        let (fsm, recorder) = fsm();
        assert_eq!(fsm.state(), DceState::Idle);

        assert_eq!(
            fsm.post_event(Event::Start).unwrap(),
            PostOutcome::Handled(DceState::BootWait)
        );
        let ticket = armed(fsm.post_event(Event::BootCompleteRequested).unwrap());
        assert_eq!(recorder.last(), "boot");
        assert_eq!(fsm.outstanding(), Outstanding::BOOT_COMPLETE);

        fsm.post_event(Event::BootCompleteReceived).unwrap();
        fsm.waits().wait(&ticket, Duration::from_millis(10)).unwrap();
        assert!(fsm.is_operating());
        assert!(fsm.outstanding().is_empty());
    }

    #[test]
    fn test_requests_need_boot() {
        let (fsm, _) = fsm();
        let outcome = fsm
            .post_event(Event::AdminIpcMsgRequested {
                cmd: 1,
                payload: vec![],
            })
            .unwrap();
        assert_eq!(outcome, PostOutcome::Ignored);
        assert_eq!(fsm.state(), DceState::Idle);
    }

    #[test]
    fn test_admin_round_trip() {
        let (fsm, recorder) = booted();
        let ticket = armed(
            fsm.post_event(Event::AdminIpcMsgRequested {
                cmd: 7,
                payload: b"hi".to_vec(),
            })
            .unwrap(),
        );
        assert_eq!(fsm.state(), DceState::AdminWfi);
        assert_eq!(recorder.last(), format!("admin 7 seq {}", ticket.seq()));

        let reply = AdminReply {
            seq: ticket.seq() as u16,
            status: 0,
            payload: b"ok".to_vec(),
        };
        fsm.post_event(Event::AdminIpcMsgReceived { reply: reply.clone() })
            .unwrap();
        fsm.waits().wait(&ticket, Duration::from_millis(10)).unwrap();

        assert_eq!(fsm.take_admin_reply(), Some(reply));
        assert!(fsm.is_operating());
        assert_eq!(fsm.waits().state(WaitKind::Admin), SlotState::Idle);
    }

    #[test]
    fn test_reply_with_wrong_seq_keeps_waiting() {
        let (fsm, _) = booted();
        let ticket = armed(
            fsm.post_event(Event::LogRequested { op: LogOp::Clear })
                .unwrap(),
        );
        let wrong = (ticket.seq() as u16).wrapping_add(1);
        assert_eq!(
            fsm.post_event(Event::LogReadyReceived { seq: wrong, status: 0 })
                .unwrap(),
            PostOutcome::Ignored
        );
        assert_eq!(fsm.state(), DceState::LogReadyWfi);
        assert_eq!(fsm.outstanding(), Outstanding::LOG);
    }

    #[test]
    fn test_busy_kind_is_rejected() {
        let (fsm, _) = booted();
        fsm.waits().arm(WaitKind::Admin, true).unwrap();
        assert_eq!(
            fsm.post_event(Event::AdminIpcMsgRequested {
                cmd: 1,
                payload: vec![],
            }),
            Err(DceError::Busy(WaitKind::Admin))
        );
        assert!(fsm.is_operating());
        assert!(fsm.outstanding().is_empty());
    }

    #[test]
    fn test_failed_dispatch_leaves_nothing_armed() {
        let (fsm, recorder) = booted();
        recorder.fail.store(true, Ordering::SeqCst);

        assert!(fsm.post_event(Event::Sc7EnterRequested).is_err());
        assert!(fsm.is_operating());
        assert!(fsm.outstanding().is_empty());
        assert_eq!(fsm.waits().state(WaitKind::Sc7), SlotState::Idle);
    }

    #[test]
    fn test_timeout_returns_to_operating_state() {
        let (fsm, _) = booted();
        let ticket = armed(
            fsm.post_event(Event::BootCmdMsgRequested {
                cmd: HostCmd::Version,
                arg: 1,
            })
            .unwrap(),
        );
        assert!(fsm.waits().wait(&ticket, Duration::from_millis(5)).is_err());
        fsm.request_timed_out(WaitKind::BootCmd);

        assert!(fsm.is_operating());
        assert!(fsm.outstanding().is_empty());
        assert_eq!(fsm.waits().state(WaitKind::BootCmd), SlotState::Stale);
    }

    #[test]
    fn test_stale_boot_cmd_ack_does_not_satisfy_new_request() {
        let (fsm, _) = booted();
        let request = Event::BootCmdMsgRequested {
            cmd: HostCmd::Version,
            arg: 1,
        };

        let old = armed(fsm.post_event(request.clone()).unwrap());
        assert!(fsm.waits().wait(&old, Duration::from_millis(10)).is_err());
        fsm.request_timed_out(WaitKind::BootCmd);

        let new = armed(fsm.post_event(request).unwrap());
        fsm.post_event(Event::BootCmdMsgReceived {
            seq: old.seq() as u8,
            status: 0,
        })
        .unwrap();

        assert_eq!(
            fsm.waits().wait(&new, Duration::from_millis(10)),
            Err(DceError::Timeout(WaitKind::BootCmd))
        );
    }

    #[test]
    fn test_sc7_cycle() {
        let (fsm, recorder) = booted();
        let enter = armed(fsm.post_event(Event::Sc7EnterRequested).unwrap());
        assert_eq!(recorder.last(), "sc7");

        fsm.post_event(Event::Sc7EnteredReceived).unwrap();
        fsm.waits().wait(&enter, Duration::from_millis(10)).unwrap();
        assert_eq!(fsm.state(), DceState::Sc7Entered);

        // Nothing but the exit is accepted while suspended
        assert_eq!(
            fsm.post_event(Event::AdminIpcMsgRequested {
                cmd: 1,
                payload: vec![]
            })
            .unwrap(),
            PostOutcome::Ignored
        );

        let exit = fsm.arm_resume().unwrap();
        assert_eq!(fsm.outstanding(), Outstanding::SC7);
        fsm.post_event(Event::Sc7ExitReceived).unwrap();
        fsm.waits().wait(&exit, Duration::from_millis(10)).unwrap();
        assert!(fsm.is_operating());
        assert!(fsm.outstanding().is_empty());
    }

    #[test]
    fn test_abort_is_terminal() {
        let (fsm, _) = booted();
        fsm.post_event(Event::AbortReceived { reason: 0x42 })
            .unwrap();
        assert_eq!(fsm.state(), DceState::Abort);
        assert_eq!(fsm.abort_reason(), Some(0x42));

        for event in [
            Event::Start,
            Event::BootCompleteReceived,
            Event::AdminIpcMsgRequested {
                cmd: 1,
                payload: vec![],
            },
            Event::Sc7ExitReceived,
            Event::LogOverflowReceived,
            Event::AbortReceived { reason: 1 },
        ] {
            assert_eq!(fsm.post_event(event), Err(DceError::Aborted));
            assert_eq!(fsm.state(), DceState::Abort);
        }
        assert_eq!(fsm.arm_resume(), Err(DceError::Aborted));

        fsm.post_event(Event::Stop).unwrap();
        assert_eq!(fsm.state(), DceState::Idle);
        assert!(!fsm.is_booted());
    }

    #[test]
    fn test_crash_log_dumps_then_aborts() {
        let (fsm, recorder) = booted();
        let ticket = armed(
            fsm.post_event(Event::AdminIpcMsgRequested {
                cmd: 1,
                payload: vec![],
            })
            .unwrap(),
        );

        fsm.post_event(Event::CrashLogReceived).unwrap();
        assert_eq!(recorder.last(), "dump");
        assert_eq!(fsm.state(), DceState::Abort);
        assert!(fsm.outstanding().is_empty());
        assert_eq!(
            fsm.waits().wait(&ticket, Duration::from_millis(10)),
            Err(DceError::Interrupted(WaitKind::Admin))
        );
    }

    #[test]
    fn test_log_overflow_counts_in_any_live_state() {
        let (fsm, _) = booted();
        fsm.post_event(Event::LogOverflowReceived).unwrap();
        fsm.post_event(Event::Sc7EnterRequested).unwrap();
        fsm.post_event(Event::LogOverflowReceived).unwrap();
        assert_eq!(fsm.overflow_count(), 2);
        assert_eq!(fsm.state(), DceState::Sc7EnterWfi);
    }

    #[test]
    fn test_outstanding_never_names_an_idle_slot() {
        let (fsm, _) = fsm();
        let events = [
            Event::Start,
            Event::BootCompleteRequested,
            Event::BootCompleteReceived,
            Event::AdminIpcMsgRequested {
                cmd: 1,
                payload: vec![],
            },
            Event::AdminIpcMsgReceived {
                reply: AdminReply {
                    seq: 1,
                    status: 0,
                    payload: vec![],
                },
            },
            Event::LogRequested {
                op: LogOp::SetLevel(2),
            },
            Event::LogReadyReceived { seq: 1, status: 0 },
            Event::Sc7EnterRequested,
            Event::Sc7EnteredReceived,
            Event::Sc7ExitReceived,
            Event::LogOverflowReceived,
            Event::BootCmdMsgRequested {
                cmd: HostCmd::Lock,
                arg: 0,
            },
            Event::BootCmdMsgReceived { seq: 1, status: 0 },
            Event::AbortReceived { reason: 0 },
            Event::Stop,
        ];

        // Deterministic pseudo-random walk over the vocabulary
        let mut seed: u32 = 0x2545_f491;
        for _ in 0..2000 {
            seed ^= seed << 13;
            seed ^= seed >> 17;
            seed ^= seed << 5;
            let event = events[seed as usize % events.len()].clone();
            let _ = fsm.post_event(event);

            assert!(DceState::ALL.contains(&fsm.state()));
            for kind in WaitKind::ALL {
                if fsm.outstanding().contains(kind.into()) {
                    assert_ne!(fsm.waits().state(kind), SlotState::Idle, "{:?}", kind);
                }
            }
            if fsm.state() == DceState::Abort {
                assert!(fsm.outstanding().is_empty());
            }
        }
    }
}
