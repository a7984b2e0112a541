//! Mock HSP register file
//!
//! In-memory stand-in for the HSP block so the whole control plane can be
//! exercised on a development host. It emulates the register side effects
//! the protocol relies on:
//!
//! - SET/CLR writes on a shared semaphore update its STATE word
//! - a tagged mailbox whose FULL_IE is set raises the owning interrupt line,
//!   provided the line's INT_IE enables that mailbox
//! - interrupts are level triggered: the line is re-delivered for as long as
//!   a qualifying mailbox stays full after the handler returns
//!
//! Handlers run on a dedicated delivery thread fed through a `crossbeam`
//! channel, never on the thread that wrote the register.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;

use crossbeam::channel::{self, Receiver, Sender};

use crate::layout::{self, Register};
use crate::{HspInstance, HspRegs, IeBits, IrqLine, MailboxId, MBOX_TAG};

/// Consecutive re-deliveries before a stuck line is dropped
const MAX_REDELIVERY: usize = 1024;

type Handler = Arc<dyn Fn() + Send + Sync>;

#[derive(Debug, Clone, Copy)]
struct Delivery {
    instance: HspInstance,
    line: IrqLine,
}

#[derive(Default)]
struct RegFile {
    regs: HashMap<usize, u32>,
    asserted: [[bool; IrqLine::COUNT]; HspInstance::COUNT],
}

impl RegFile {
    fn get(&self, offset: usize) -> u32 {
        self.regs.get(&offset).copied().unwrap_or(0)
    }

    fn pending(&self, instance: HspInstance, line: IrqLine) -> bool {
        let ie = IeBits::from_bits_retain(self.get(layout::int_ie(instance, line)));
        MailboxId::ALL.iter().any(|&id| {
            let full = self.get(layout::mailbox(instance, id, layout::MBOX_DATA)) & MBOX_TAG != 0;
            if full {
                self.get(layout::mailbox(instance, id, layout::MBOX_FULL_IE)) & 1 != 0
                    && ie.contains(IeBits::full(id))
            } else {
                self.get(layout::mailbox(instance, id, layout::MBOX_EMPTY_IE)) & 1 != 0
                    && ie.contains(IeBits::mailbox_empty(id))
            }
        })
    }

    /// Latch every line of `instance` that just became pending
    fn rising(&mut self, instance: HspInstance, handlers: &HashMap<(HspInstance, IrqLine), Handler>) -> Vec<Delivery> {
        let mut out = Vec::new();
        for n in 0..IrqLine::COUNT as u8 {
            let Some(line) = IrqLine::new(n) else { continue };
            if self.asserted[instance.index()][line.index()] {
                continue;
            }
            if handlers.contains_key(&(instance, line)) && self.pending(instance, line) {
                self.asserted[instance.index()][line.index()] = true;
                out.push(Delivery { instance, line });
            }
        }
        out
    }
}

struct Shared {
    file: Mutex<RegFile>,
    handlers: Mutex<HashMap<(HspInstance, IrqLine), Handler>>,
}

impl Shared {
    fn file(&self) -> MutexGuard<'_, RegFile> {
        self.file.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn handlers(&self) -> MutexGuard<'_, HashMap<(HspInstance, IrqLine), Handler>> {
        self.handlers.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// In-memory HSP register file with interrupt delivery
pub struct MockRegs {
    shared: Arc<Shared>,
    tx: Sender<Delivery>,
}

impl MockRegs {
    /// Create a register file with all registers zeroed
    ///
    /// Spawns the interrupt delivery thread; it exits once the register file
    /// is dropped.
    pub fn new() -> Arc<Self> {
        let shared = Arc::new(Shared {
            file: Mutex::new(RegFile::default()),
            handlers: Mutex::new(HashMap::new()),
        });
        let (tx, rx) = channel::unbounded();

        let worker = Arc::clone(&shared);
        thread::Builder::new()
            .name("hsp-irq".into())
            .spawn(move || deliver_loop(worker, rx))
            .map_err(|e| log::error!("hsp mock: failed to spawn delivery thread: {}", e))
            .ok();

        Arc::new(Self { shared, tx })
    }

    /// Route interrupts of `line` on `instance` to `handler`
    ///
    /// Replaces any previous handler. If the line is already pending the
    /// handler runs straight away (on the delivery thread).
    pub fn attach<F>(&self, instance: HspInstance, line: IrqLine, handler: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        let deliveries = {
            let mut handlers = self.shared.handlers();
            handlers.insert((instance, line), Arc::new(handler));
            self.shared.file().rising(instance, &handlers)
        };
        self.send(deliveries);
    }

    /// Stop routing interrupts of `line`
    pub fn detach(&self, instance: HspInstance, line: IrqLine) {
        self.shared.handlers().remove(&(instance, line));
    }

    /// Zero the INT_IE register of `line`, as a power loss would
    pub fn clobber_line(&self, instance: HspInstance, line: IrqLine) {
        self.shared.file().regs.remove(&layout::int_ie(instance, line));
    }

    fn send(&self, deliveries: Vec<Delivery>) {
        for d in deliveries {
            if self.tx.send(d).is_err() {
                log::warn!("hsp mock: delivery thread gone, dropping irq {:?}", d);
            }
        }
    }
}

impl HspRegs for MockRegs {
    fn read(&self, offset: usize) -> u32 {
        let file = self.shared.file();
        match layout::decode(offset) {
            Some(Register::SemaphoreSet(i, id)) | Some(Register::SemaphoreClear(i, id)) => {
                file.get(layout::semaphore(i, id, layout::SEM_STATE))
            }
            _ => file.get(offset),
        }
    }

    fn write(&self, offset: usize, value: u32) {
        let deliveries = {
            let handlers = self.shared.handlers();
            let mut file = self.shared.file();
            let instance = match layout::decode(offset) {
                Some(Register::SemaphoreSet(i, id)) => {
                    let state = layout::semaphore(i, id, layout::SEM_STATE);
                    let old = file.get(state);
                    file.regs.insert(state, old | value);
                    i
                }
                Some(Register::SemaphoreClear(i, id)) => {
                    let state = layout::semaphore(i, id, layout::SEM_STATE);
                    let old = file.get(state);
                    file.regs.insert(state, old & !value);
                    i
                }
                Some(
                    Register::SemaphoreState(i, _)
                    | Register::MailboxData(i, _)
                    | Register::MailboxFullIe(i, _)
                    | Register::MailboxEmptyIe(i, _)
                    | Register::InterruptEnable(i, _),
                ) => {
                    file.regs.insert(offset, value);
                    i
                }
                None => {
                    log::warn!("hsp mock: write to unmapped offset {:#x}", offset);
                    return;
                }
            };
            file.rising(instance, &handlers)
        };
        self.send(deliveries);
    }
}

fn deliver_loop(shared: Arc<Shared>, rx: Receiver<Delivery>) {
    for d in rx.iter() {
        let mut rounds = 0;
        loop {
            let handler = shared.handlers().get(&(d.instance, d.line)).cloned();
            match handler {
                Some(handler) => handler(),
                None => {
                    shared.file().asserted[d.instance.index()][d.line.index()] = false;
                    break;
                }
            }

            let mut file = shared.file();
            rounds += 1;
            if !file.pending(d.instance, d.line) || rounds >= MAX_REDELIVERY {
                if rounds >= MAX_REDELIVERY {
                    log::warn!(
                        "hsp mock: {:?} line {} still pending after {} deliveries",
                        d.instance,
                        d.line.index(),
                        rounds
                    );
                }
                file.asserted[d.instance.index()][d.line.index()] = false;
                break;
            }
        }
    }
    log::trace!("hsp mock: delivery thread exiting");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Hsp;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::{Duration, Instant};

    fn wait_for(mut cond: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(2);
        while Instant::now() < deadline {
            if cond() {
                return true;
            }
            thread::sleep(Duration::from_millis(1));
        }
        false
    }

    #[test]
    fn test_full_interrupt_delivery() {
        let regs = MockRegs::new();
        let hsp = Hsp::new(regs.clone());
        let (inst, mbox) = (HspInstance::Top0, MailboxId::Sm2);
        let line = IrqLine::new(1).unwrap();

        let hits = Arc::new(AtomicUsize::new(0));
        let drain = hsp.clone();
        let seen = Arc::clone(&hits);
        regs.attach(inst, line, move || {
            if drain.mailbox_value(inst, mbox).is_some() {
                drain.mailbox_clear(inst, mbox);
                seen.fetch_add(1, Ordering::SeqCst);
            }
        });

        hsp.mailbox_set_full_interrupt_enable(true, inst, mbox);
        hsp.interrupt_enable_update(IeBits::full(mbox), true, inst, line);

        hsp.mailbox_write(42, inst, mbox);
        assert!(wait_for(|| hits.load(Ordering::SeqCst) == 1));
        assert!(!hsp.mailbox_is_full(inst, mbox));
    }

    #[test]
    fn test_no_delivery_while_line_disabled() {
        let regs = MockRegs::new();
        let hsp = Hsp::new(regs.clone());
        let (inst, mbox) = (HspInstance::Top0, MailboxId::Sm0);
        let line = IrqLine::new(2).unwrap();

        let hits = Arc::new(AtomicUsize::new(0));
        let drain = hsp.clone();
        let seen = Arc::clone(&hits);
        regs.attach(inst, line, move || {
            drain.mailbox_clear(inst, mbox);
            seen.fetch_add(1, Ordering::SeqCst);
        });

        hsp.mailbox_set_full_interrupt_enable(true, inst, mbox);
        hsp.mailbox_write(7, inst, mbox);
        thread::sleep(Duration::from_millis(20));
        assert_eq!(hits.load(Ordering::SeqCst), 0);

        // Enabling the line while the slot is full delivers the pending irq
        hsp.interrupt_enable_update(IeBits::full(mbox), true, inst, line);
        assert!(wait_for(|| hits.load(Ordering::SeqCst) == 1));
    }

    #[test]
    fn test_empty_interrupt_on_drain() {
        let regs = MockRegs::new();
        let hsp = Hsp::new(regs.clone());
        let (inst, mbox) = (HspInstance::Top1, MailboxId::Sm5);
        let line = IrqLine::new(4).unwrap();

        let hits = Arc::new(AtomicUsize::new(0));
        let ack = hsp.clone();
        let seen = Arc::clone(&hits);
        regs.attach(inst, line, move || {
            // Level triggered: acknowledge by masking the empty interrupt
            ack.mailbox_set_empty_interrupt_enable(false, inst, mbox);
            seen.fetch_add(1, Ordering::SeqCst);
        });

        // Armed while full, so nothing fires yet
        hsp.mailbox_write(9, inst, mbox);
        hsp.mailbox_set_empty_interrupt_enable(true, inst, mbox);
        hsp.interrupt_enable_update(IeBits::mailbox_empty(mbox), true, inst, line);
        thread::sleep(Duration::from_millis(20));
        assert_eq!(hits.load(Ordering::SeqCst), 0);

        hsp.mailbox_clear(inst, mbox);
        assert!(wait_for(|| hits.load(Ordering::SeqCst) == 1));
        thread::sleep(Duration::from_millis(20));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_clobber_line() {
        let regs = MockRegs::new();
        let hsp = Hsp::new(regs.clone());
        let line = IrqLine::new(3).unwrap();

        hsp.interrupt_enable_write(0x0f0f, HspInstance::Top1, line);
        regs.clobber_line(HspInstance::Top1, line);
        assert_eq!(hsp.interrupt_enable_read(HspInstance::Top1, line), 0);
    }
}
