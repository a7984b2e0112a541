//! Simulated DCE firmware
//!
//! Runs the DCE side of the protocol against the mock HSP register file so
//! the whole control plane can be driven on a development host: it answers
//! boot and bootstrap commands, builds its ends of the IVC channels from the
//! IOVA window, serves admin and log requests and plays along with SC7.
//!
//! Words arriving on the DCE's interrupt line are forwarded to a worker
//! thread over a `crossbeam` channel; the handler itself never blocks, since
//! it shares the delivery thread with the host's interrupt handler.
//!
//! [`Fault`] injects the failure modes the host must survive.

use std::collections::BTreeMap;
use std::mem::offset_of;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender};
use dce_hsp::mock::MockRegs;
use dce_hsp::{Hsp, HspInstance, IeBits, IrqLine, MailboxId, SemaphoreId};
use dce_ipc::{
    ChannelId, Doorbell, Geometry, IovaAllocator, IovaPool, IvcChannel, LogTraceSink, Side,
    SharedRegion, TraceSink,
};

use crate::config::DceConfig;
use crate::error::{DceError, Result};
use crate::isr::{IrqHandler, IrqRegistrar};
use crate::logbuf::{self, LogBufferHeader, LOG_VERSION};
use crate::pm::{LogPmNotifier, PmNotifier};
use crate::protocol::{
    self, admin_cmd, status, AdminMessage, AdminReply, BootStatus, HostCmd, HostWord, LogControl,
    LogOp, RemoteCode, RemoteWord, LOG_CHANNEL, PROTOCOL_VERSION,
};
use crate::{Dce, Platform};

/// How long the firmware waits for the host to drain a notification
const DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

/// Poll period while suspended
const SUSPEND_POLL: Duration = Duration::from_millis(1);

impl IrqRegistrar for MockRegs {
    fn attach(&self, instance: HspInstance, line: IrqLine, handler: IrqHandler) {
        MockRegs::attach(self, instance, line, handler);
    }

    fn detach(&self, instance: HspInstance, line: IrqLine) {
        MockRegs::detach(self, instance, line);
    }
}

/// Failure modes of the simulated firmware
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Fault {
    /// Send ABORT with this reason now
    Abort(u16),
    /// Log these lines, then announce a crash
    Crash(String),
    /// Send LOG_OVERFLOW now
    Overflow,
    /// Swallow the next `n` replies
    DropReplies(usize),
    /// Hold every reply back this long
    DelayReplies(Duration),
    /// Never announce SC7 exit
    NoResume,
    /// Ignore the boot command
    HangBoot,
}

#[derive(Debug, Default)]
struct Behaviour {
    drop_replies: usize,
    delay: Option<Duration>,
    no_resume: bool,
    hang_boot: bool,
}

enum Msg {
    Word(u32),
    Inject(Fault),
    Log(String),
    Shutdown,
}

struct Pending {
    pfn: u32,
    nframes: u32,
    frame_size: u32,
}

struct Firmware {
    hsp: Hsp,
    instance: HspInstance,
    from_remote: MailboxId,
    status: SemaphoreId,
    host_line: IrqLine,
    iova: Arc<dyn IovaAllocator>,
    trace: Arc<dyn TraceSink>,
    behaviour: Arc<Mutex<Behaviour>>,
    suspended: Arc<AtomicBool>,
    power_lost: Arc<AtomicBool>,

    locked: bool,
    selected: Option<ChannelId>,
    pending: BTreeMap<ChannelId, Pending>,
    channels: BTreeMap<ChannelId, IvcChannel>,
    log: Option<SharedRegion>,
}

impl Firmware {
    fn behaviour(&self) -> MutexGuard<'_, Behaviour> {
        self.behaviour.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn run(mut self, rx: Receiver<Msg>) {
        loop {
            let msg = if self.suspended.load(Ordering::Acquire) {
                self.poll_resume();
                match rx.recv_timeout(SUSPEND_POLL) {
                    Ok(msg) => msg,
                    Err(RecvTimeoutError::Timeout) => continue,
                    Err(RecvTimeoutError::Disconnected) => break,
                }
            } else {
                match rx.recv() {
                    Ok(msg) => msg,
                    Err(_) => break,
                }
            };

            match msg {
                Msg::Word(raw) => self.on_word(raw),
                Msg::Inject(fault) => self.inject(fault),
                Msg::Log(text) => self.append_log(&text),
                Msg::Shutdown => break,
            }
        }
        log::trace!("sim: firmware exiting");
    }

    fn on_word(&mut self, raw: u32) {
        let word = match HostWord::decode(raw) {
            Ok(word) => word,
            Err(e) => {
                log::warn!("sim: {}", e);
                return;
            }
        };
        // Only a fresh boot reaches a powered-down unit
        if self.suspended.load(Ordering::Acquire) && word.cmd != HostCmd::Boot {
            log::debug!("sim: {:?} while powered down", word.cmd);
            return;
        }
        log::trace!("sim: {:?}", word);

        match word.cmd {
            HostCmd::Boot => self.boot(),
            HostCmd::Doorbell => {}
            HostCmd::EnterSc7 => self.enter_sc7(),
            _ => {
                let st = self.bootstrap(word);
                self.reply(RemoteWord::new(RemoteCode::BootCmdAck, st, u16::from(word.seq)));
            }
        }
        self.service_channels();
    }

    fn boot(&mut self) {
        if self.behaviour().hang_boot {
            log::debug!("sim: hanging in boot");
            return;
        }
        self.suspended.store(false, Ordering::Release);
        self.power_lost.store(false, Ordering::Release);
        self.locked = false;
        self.selected = None;
        self.pending.clear();
        self.channels.clear();
        self.log = None;
        self.hsp
            .semaphore_set(BootStatus::FW_BOOTED.bits(), self.instance, self.status);
        self.notify(RemoteWord::new(RemoteCode::BootComplete, 0, 0));
    }

    fn bootstrap(&mut self, word: HostWord) -> u8 {
        if self.locked {
            return status::INVALID as u8;
        }
        let st = match word.cmd {
            HostCmd::Version if word.arg == PROTOCOL_VERSION => status::OK,
            HostCmd::Version => status::UNSUPPORTED,
            HostCmd::SelectChannel => {
                let id = word.arg as ChannelId;
                self.pending.entry(id).or_insert(Pending {
                    pfn: 0,
                    nframes: 0,
                    frame_size: 0,
                });
                self.selected = Some(id);
                status::OK
            }
            HostCmd::SetAddr | HostCmd::SetFrames | HostCmd::SetFrameSize => {
                match self.selected.and_then(|id| self.pending.get_mut(&id)) {
                    Some(p) => {
                        match word.cmd {
                            HostCmd::SetAddr => p.pfn = word.arg,
                            HostCmd::SetFrames => p.nframes = word.arg,
                            _ => p.frame_size = word.arg,
                        }
                        status::OK
                    }
                    None => status::INVALID,
                }
            }
            HostCmd::ChannelInit => {
                if self.open_selected() {
                    status::OK
                } else {
                    status::INVALID
                }
            }
            HostCmd::Lock => {
                self.locked = true;
                status::OK
            }
            _ => status::INVALID,
        };
        st as u8
    }

    fn open_selected(&mut self) -> bool {
        let Some(id) = self.selected else { return false };
        let Some(p) = self.pending.get(&id) else { return false };
        let Some(region) = self.iova.lookup(u64::from(p.pfn) << 12) else {
            log::warn!("sim: channel {} at unmapped pfn {:#x}", id, p.pfn);
            return false;
        };

        let doorbell = Doorbell::new(
            self.hsp.clone(),
            self.instance,
            self.from_remote,
            RemoteWord::new(RemoteCode::Ivc, id as u8, 0).encode(),
        );
        let geometry = Geometry::new(p.nframes, p.frame_size);
        match IvcChannel::new(id, region, geometry, Side::Remote, Some(doorbell), self.trace.clone()) {
            Ok(mut ivc) => {
                ivc.init();
                self.channels.insert(id, ivc);
                true
            }
            Err(e) => {
                log::warn!("sim: channel {}: {}", id, e);
                false
            }
        }
    }

    fn service_channels(&mut self) {
        let mut inbox = Vec::new();
        for (&id, ivc) in self.channels.iter_mut() {
            ivc.notified();
            while ivc.can_read() {
                match ivc.read_frame() {
                    Ok(frame) => inbox.push((id, frame)),
                    Err(e) => {
                        log::warn!("sim: channel {}: {}", id, e);
                        break;
                    }
                }
            }
        }

        for (id, frame) in inbox {
            if id == LOG_CHANNEL {
                self.on_log_control(&frame);
            } else {
                self.on_admin(id, &frame);
            }
        }
    }

    fn on_admin(&mut self, id: ChannelId, frame: &[u8]) {
        let msg: AdminMessage = match protocol::decode(frame) {
            Ok(msg) => msg,
            Err(e) => {
                log::warn!("sim: bad admin frame: {}", e);
                return;
            }
        };
        let (st, payload) = match msg.cmd {
            admin_cmd::ECHO => (status::OK, msg.payload),
            admin_cmd::GET_VERSION => (status::OK, PROTOCOL_VERSION.to_le_bytes().to_vec()),
            _ => (status::UNSUPPORTED, Vec::new()),
        };
        let reply = AdminReply {
            seq: msg.seq,
            status: st,
            payload,
        };
        if !self.hold_reply() {
            return;
        }
        let sent = protocol::encode(&reply).map_err(|e| e.to_string()).and_then(|frame| {
            self.channels
                .get_mut(&id)
                .ok_or_else(|| format!("channel {} gone", id))?
                .send(&frame)
                .map_err(|e| e.to_string())
        });
        if let Err(e) = sent {
            log::warn!("sim: admin reply: {}", e);
        }
    }

    fn on_log_control(&mut self, frame: &[u8]) {
        let msg: LogControl = match protocol::decode(frame) {
            Ok(msg) => msg,
            Err(e) => {
                log::warn!("sim: bad log frame: {}", e);
                return;
            }
        };
        let st = match msg.op {
            LogOp::Init { iova, size } => match self.iova.lookup(iova) {
                Some(region) if region.len() >= size as usize => {
                    let header = LogBufferHeader::read(&region);
                    if header.version == LOG_VERSION {
                        region.store_u32(offset_of!(LogBufferHeader, active), 1);
                        self.log = Some(region);
                        self.append_log("dce: log started\n");
                        status::OK
                    } else {
                        status::INVALID
                    }
                }
                _ => status::INVALID,
            },
            LogOp::Clear => match &self.log {
                Some(region) => {
                    region.store_u64(offset_of!(LogBufferHeader, bytes_written), 0);
                    status::OK
                }
                None => status::INVALID,
            },
            LogOp::SetLevel(level) => match &self.log {
                Some(region) => {
                    region.store_u32(offset_of!(LogBufferHeader, level), level);
                    status::OK
                }
                None => status::INVALID,
            },
        };
        self.reply(RemoteWord::new(RemoteCode::LogReady, st as u8, msg.seq));
    }

    fn enter_sc7(&mut self) {
        if !self.hold_reply() {
            return;
        }
        self.power_lost.store(false, Ordering::Release);
        self.suspended.store(true, Ordering::Release);
        log::debug!("sim: in SC7");
        self.notify(RemoteWord::new(RemoteCode::Sc7Entered, 0, 0));
    }

    /// Back up once power returned and the host restored its lines
    fn poll_resume(&mut self) {
        if !self.power_lost.load(Ordering::Acquire) || self.behaviour().no_resume {
            return;
        }
        let ie = IeBits::from_bits_retain(
            self.hsp.interrupt_enable_read(self.instance, self.host_line),
        );
        if ie.contains(IeBits::full(self.from_remote)) {
            self.suspended.store(false, Ordering::Release);
            self.power_lost.store(false, Ordering::Release);
            log::debug!("sim: leaving SC7");
            self.notify(RemoteWord::new(RemoteCode::Sc7Exit, 0, 0));
        }
    }

    fn inject(&mut self, fault: Fault) {
        match fault {
            Fault::Abort(reason) => self.notify(RemoteWord::new(RemoteCode::Abort, 0, reason)),
            Fault::Crash(text) => {
                self.append_log(&text);
                self.notify(RemoteWord::new(RemoteCode::CrashLog, 0, 0));
            }
            Fault::Overflow => self.notify(RemoteWord::new(RemoteCode::LogOverflow, 0, 0)),
            other => log::warn!("sim: {:?} is not an immediate fault", other),
        }
    }

    fn append_log(&self, text: &str) {
        match &self.log {
            Some(region) => logbuf::append(region, text.as_bytes()),
            None => log::debug!("sim: no log buffer for {:?}", text),
        }
    }

    /// Apply reply faults; false if this reply is dropped
    fn hold_reply(&self) -> bool {
        let delay = {
            let mut behaviour = self.behaviour();
            if behaviour.drop_replies > 0 {
                behaviour.drop_replies -= 1;
                log::debug!("sim: dropping reply");
                return false;
            }
            behaviour.delay
        };
        if let Some(delay) = delay {
            thread::sleep(delay);
        }
        true
    }

    fn reply(&self, word: RemoteWord) {
        if self.hold_reply() {
            self.notify(word);
        }
    }

    /// Post a notification once the host has drained the previous one
    fn notify(&self, word: RemoteWord) {
        let deadline = Instant::now() + DRAIN_TIMEOUT;
        while self.hsp.mailbox_is_full(self.instance, self.from_remote) {
            if Instant::now() >= deadline {
                log::warn!("sim: host never drained, dropping {:?}", word);
                return;
            }
            thread::sleep(Duration::from_micros(100));
        }
        self.hsp
            .mailbox_write(word.encode(), self.instance, self.from_remote);
    }
}

/// The simulated DCE, attached to a mock register file
pub struct RemoteUnit {
    regs: Arc<MockRegs>,
    instance: HspInstance,
    remote_line: IrqLine,
    owned_lines: Vec<IrqLine>,
    tx: Sender<Msg>,
    behaviour: Arc<Mutex<Behaviour>>,
    suspended: Arc<AtomicBool>,
    power_lost: Arc<AtomicBool>,
    worker: Option<JoinHandle<()>>,
}

impl RemoteUnit {
    /// Start the firmware and route its interrupt line
    pub fn attach(regs: Arc<MockRegs>, iova: Arc<dyn IovaAllocator>, config: &DceConfig) -> Result<Self> {
        let hsp = Hsp::new(regs.clone());
        let instance = config.hsp.instance()?;
        let to_remote = config.hsp.to_remote()?;
        let remote_line = config.hsp.remote_line()?;
        let behaviour = Arc::new(Mutex::new(Behaviour::default()));
        let suspended = Arc::new(AtomicBool::new(false));
        let power_lost = Arc::new(AtomicBool::new(false));

        let firmware = Firmware {
            hsp: hsp.clone(),
            instance,
            from_remote: config.hsp.from_remote()?,
            status: config.hsp.status_semaphore()?,
            host_line: config.hsp.host_line()?,
            iova,
            trace: Arc::new(LogTraceSink),
            behaviour: behaviour.clone(),
            suspended: suspended.clone(),
            power_lost: power_lost.clone(),
            locked: false,
            selected: None,
            pending: BTreeMap::new(),
            channels: BTreeMap::new(),
            log: None,
        };

        let (tx, rx) = channel::unbounded();
        let worker = thread::Builder::new()
            .name("dce-sim".into())
            .spawn(move || firmware.run(rx))
            .map_err(|e| DceError::Config(format!("cannot spawn firmware thread: {}", e)))?;

        let forward = tx.clone();
        regs.attach(instance, remote_line, move || {
            if let Some(word) = hsp.mailbox_value(instance, to_remote) {
                hsp.mailbox_clear(instance, to_remote);
                if forward.send(Msg::Word(word)).is_err() {
                    log::warn!("sim: firmware gone, dropping {:#010x}", word);
                }
            }
        });

        let hsp = Hsp::new(regs.clone());
        hsp.mailbox_set_full_interrupt_enable(true, instance, to_remote);
        hsp.interrupt_enable_update(IeBits::full(to_remote), true, instance, remote_line);

        Ok(Self {
            regs,
            instance,
            remote_line,
            owned_lines: config.hsp.owned_lines()?,
            tx,
            behaviour,
            suspended,
            power_lost,
            worker: Some(worker),
        })
    }

    fn behaviour(&self) -> MutexGuard<'_, Behaviour> {
        self.behaviour.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn send(&self, msg: Msg) {
        if self.tx.send(msg).is_err() {
            log::warn!("sim: firmware thread gone");
        }
    }

    pub fn inject(&self, fault: Fault) {
        match fault {
            Fault::DropReplies(n) => self.behaviour().drop_replies = n,
            Fault::DelayReplies(delay) => self.behaviour().delay = Some(delay),
            Fault::NoResume => self.behaviour().no_resume = true,
            Fault::HangBoot => self.behaviour().hang_boot = true,
            immediate => self.send(Msg::Inject(immediate)),
        }
    }

    /// Clear every sticky fault
    pub fn heal(&self) {
        *self.behaviour() = Behaviour::default();
    }

    /// Append to the shared log buffer, as firmware code would
    pub fn log(&self, text: &str) {
        self.send(Msg::Log(text.to_owned()));
    }

    /// Lose the host's interrupt-enable state, as SC7 power-down does
    ///
    /// Only meaningful while the firmware is in SC7; it resumes once the
    /// host has restored its line.
    pub fn power_loss(&self) {
        for &line in &self.owned_lines {
            self.regs.clobber_line(self.instance, line);
        }
        self.power_lost.store(true, Ordering::Release);
    }

    pub fn is_suspended(&self) -> bool {
        self.suspended.load(Ordering::Acquire)
    }
}

impl Drop for RemoteUnit {
    fn drop(&mut self) {
        self.regs.detach(self.instance, self.remote_line);
        let _ = self.tx.send(Msg::Shutdown);
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

/// A driver wired to a simulated DCE
pub struct Bench {
    pub dce: Dce,
    pub remote: RemoteUnit,
    pub regs: Arc<MockRegs>,
    pub iova: Arc<IovaPool>,
}

impl Bench {
    pub fn new(config: DceConfig) -> Result<Self> {
        Self::with_pm(config, Arc::new(LogPmNotifier))
    }

    pub fn with_pm(config: DceConfig, pm: Arc<dyn PmNotifier>) -> Result<Self> {
        config.validate()?;
        let regs = MockRegs::new();
        let iova = Arc::new(IovaPool::new(config.iova.base, config.iova.size).map_err(DceError::Alloc)?);
        let remote = RemoteUnit::attach(regs.clone(), iova.clone(), &config)?;
        let platform = Platform {
            hsp: Hsp::new(regs.clone()),
            irq: regs.clone(),
            iova: iova.clone(),
            pm,
            trace: Arc::new(LogTraceSink),
        };
        let dce = Dce::init(config, platform)?;
        Ok(Self {
            dce,
            remote,
            regs,
            iova,
        })
    }

    pub fn hsp(&self) -> Hsp {
        Hsp::new(self.regs.clone())
    }
}

impl core::fmt::Debug for Bench {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Bench")
            .field("dce", &self.dce)
            .field("suspended", &self.remote.is_suspended())
            .finish_non_exhaustive()
    }
}
