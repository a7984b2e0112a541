//! Wait-Condition Registry
//!
//! Turns an interrupt-delivered reply into a synchronous, time-bounded
//! return for the caller that issued the request.
//!
//! ## Design
//!
//! One slot per round-trip kind, indexed by [`WaitKind`]. A slot moves
//! through:
//!
//! ```text
//!   Idle --arm--> Armed --signal--> Signaled --wait returns--> Idle
//!                   |
//!                   +--timeout--> Stale --arm(reset_first)--> Armed
//! ```
//!
//! Every arm bumps the slot's generation. Replies carry the low bits of the
//! generation they answer (their sequence tag), so a reply to an expired
//! round trip cannot complete a newer one.
//!
//! ## Operations
//!
//! - **Arm**: claim the slot for one round trip (non-blocking)
//! - **Wait**: block until signaled, interrupted or timed out
//! - **Signal / Broadcast**: complete the armed round trip, if the tag matches

use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use crate::error::{DceError, Result};

/// Round-trip kinds, one wait slot each
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u8)]
pub enum WaitKind {
    BootComplete = 0,
    BootCmd,
    Admin,
    /// SC7 entry acknowledgement and the DCE-initiated exit
    Sc7,
    Log,
}

impl WaitKind {
    pub const COUNT: usize = 5;
    pub const ALL: [WaitKind; Self::COUNT] = [
        WaitKind::BootComplete,
        WaitKind::BootCmd,
        WaitKind::Admin,
        WaitKind::Sc7,
        WaitKind::Log,
    ];

    #[inline]
    pub const fn index(self) -> usize {
        self as usize
    }

    /// Bits of the generation a reply echoes back
    ///
    /// Boot commands only have room for a 4-bit sequence number.
    pub const fn seq_mask(self) -> u32 {
        match self {
            WaitKind::BootCmd => 0xf,
            _ => 0xffff,
        }
    }
}

/// Observable slot state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    Idle,
    Armed,
    Signaled,
    /// The last wait timed out; a late reply may still arrive
    Stale,
}

/// Claim on one armed round trip
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ticket {
    kind: WaitKind,
    generation: u32,
}

impl Ticket {
    pub fn kind(&self) -> WaitKind {
        self.kind
    }

    /// Sequence tag the reply must carry
    pub fn seq(&self) -> u32 {
        self.generation & self.kind.seq_mask()
    }
}

#[derive(Debug)]
struct SlotInner {
    state: SlotState,
    generation: u32,
    /// Threads blocked in `wait` on this slot
    waiters: u32,
}

struct Slot {
    inner: Mutex<SlotInner>,
    cv: Condvar,
}

impl Slot {
    fn lock(&self) -> MutexGuard<'_, SlotInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Fixed table of wait slots
pub struct WaitRegistry {
    slots: [Slot; WaitKind::COUNT],
}

impl Default for WaitRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl WaitRegistry {
    pub fn new() -> Self {
        Self {
            slots: core::array::from_fn(|_| Slot {
                inner: Mutex::new(SlotInner {
                    state: SlotState::Idle,
                    generation: 0,
                    waiters: 0,
                }),
                cv: Condvar::new(),
            }),
        }
    }

    fn slot(&self, kind: WaitKind) -> &Slot {
        &self.slots[kind.index()]
    }

    /// Claim the slot for a new round trip
    ///
    /// `reset_first` discards whatever an earlier, abandoned round trip left
    /// behind. Without it a completion that arrived after its waiter gave up
    /// is handed to this ticket.
    ///
    /// # Errors
    /// [`DceError::Busy`] if a round trip of this kind is already armed.
    pub fn arm(&self, kind: WaitKind, reset_first: bool) -> Result<Ticket> {
        let mut slot = self.slot(kind).lock();
        match slot.state {
            SlotState::Armed => return Err(DceError::Busy(kind)),
            SlotState::Signaled if !reset_first => {
                log::warn!("wait: {:?} armed over a leftover completion", kind);
                return Ok(Ticket {
                    kind,
                    generation: slot.generation,
                });
            }
            _ => {}
        }

        slot.generation = slot.generation.wrapping_add(1);
        slot.state = SlotState::Armed;
        Ok(Ticket {
            kind,
            generation: slot.generation,
        })
    }

    /// Block until `ticket` completes or `timeout` elapses
    ///
    /// Several threads may wait on the same ticket. A completion satisfies
    /// all of them; the slot returns to idle when the last one leaves.
    ///
    /// # Errors
    /// - [`DceError::Timeout`]: the slot is left [`SlotState::Stale`]
    /// - [`DceError::Interrupted`]: the slot was reset under the waiter
    pub fn wait(&self, ticket: &Ticket, timeout: Duration) -> Result<()> {
        let slot = self.slot(ticket.kind);
        let deadline = Instant::now() + timeout;
        let mut inner = slot.lock();
        inner.waiters += 1;

        let result = loop {
            if inner.generation != ticket.generation {
                break Err(DceError::Interrupted(ticket.kind));
            }
            match inner.state {
                SlotState::Signaled => {
                    if inner.waiters == 1 {
                        inner.state = SlotState::Idle;
                    } else {
                        // Pass a single wake-up on to the next waiter
                        slot.cv.notify_one();
                    }
                    break Ok(());
                }
                SlotState::Armed => {
                    let now = Instant::now();
                    if now >= deadline {
                        if inner.waiters == 1 {
                            inner.state = SlotState::Stale;
                        }
                        log::debug!("wait: {:?} timed out after {:?}", ticket.kind, timeout);
                        break Err(DceError::Timeout(ticket.kind));
                    }
                    inner = slot
                        .cv
                        .wait_timeout(inner, deadline - now)
                        .map(|(guard, _)| guard)
                        .unwrap_or_else(|e| e.into_inner().0);
                }
                SlotState::Idle | SlotState::Stale => {
                    break Err(DceError::Interrupted(ticket.kind));
                }
            }
        };

        inner.waiters -= 1;
        result
    }

    /// [`arm`](Self::arm) then [`wait`](Self::wait)
    pub fn arm_and_wait(&self, kind: WaitKind, timeout: Duration, reset_first: bool) -> Result<()> {
        let ticket = self.arm(kind, reset_first)?;
        self.wait(&ticket, timeout)
    }

    /// Complete the armed round trip of `kind`, waking one waiter
    ///
    /// Further waiters on the same ticket are woken in turn by the first.
    /// `seq` is the reply's sequence tag; `None` matches any round trip.
    /// Returns `true` if an armed round trip was completed. Safe to call
    /// with nobody waiting.
    pub fn signal(&self, kind: WaitKind, seq: Option<u32>) -> bool {
        self.complete(kind, seq, false)
    }

    /// Like [`signal`](Self::signal) but wakes every waiter at once
    pub fn broadcast(&self, kind: WaitKind, seq: Option<u32>) -> bool {
        self.complete(kind, seq, true)
    }

    fn complete(&self, kind: WaitKind, seq: Option<u32>, all: bool) -> bool {
        let slot = self.slot(kind);
        let mut inner = slot.lock();
        let matches = seq.map_or(true, |s| s == inner.generation & kind.seq_mask());

        match inner.state {
            SlotState::Armed if matches => {
                inner.state = SlotState::Signaled;
                drop(inner);
                if all {
                    slot.cv.notify_all();
                } else {
                    slot.cv.notify_one();
                }
                true
            }
            SlotState::Stale if matches => {
                // Waiter already gave up; keep the completion for arm() to judge
                inner.state = SlotState::Signaled;
                log::debug!("wait: late completion for {:?}", kind);
                false
            }
            state => {
                log::debug!("wait: dropping {:?} completion (seq {:?}) in {:?}", kind, seq, state);
                false
            }
        }
    }

    /// Return one slot to idle, failing any waiter with `Interrupted`
    pub fn reset(&self, kind: WaitKind) {
        let slot = self.slot(kind);
        let mut inner = slot.lock();
        inner.state = SlotState::Idle;
        inner.generation = inner.generation.wrapping_add(1);
        drop(inner);
        slot.cv.notify_all();
    }

    /// Fail every armed round trip with `Interrupted`
    pub fn interrupt_all(&self) {
        for kind in WaitKind::ALL {
            if self.state(kind) == SlotState::Armed {
                self.reset(kind);
            }
        }
    }

    /// Return every slot to idle
    pub fn reset_all(&self) {
        for kind in WaitKind::ALL {
            self.reset(kind);
        }
    }

    pub fn state(&self, kind: WaitKind) -> SlotState {
        self.slot(kind).lock().state
    }
}

impl core::fmt::Debug for WaitRegistry {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let mut map = f.debug_map();
        for kind in WaitKind::ALL {
            map.entry(&kind, &self.state(kind));
        }
        map.finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_signal_wakes_waiter() {
        let waits = Arc::new(WaitRegistry::new());
        let ticket = waits.arm(WaitKind::Admin, true).unwrap();

        let signaler = Arc::clone(&waits);
        let seq = ticket.seq();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(10));
            assert!(signaler.signal(WaitKind::Admin, Some(seq)));
        });

        waits.wait(&ticket, Duration::from_secs(2)).unwrap();
        handle.join().unwrap();
        assert_eq!(waits.state(WaitKind::Admin), SlotState::Idle);
    }

    #[test]
    fn test_signal_without_waiter_is_noop() {
        let waits = WaitRegistry::new();
        assert!(!waits.signal(WaitKind::Log, None));
        assert!(!waits.broadcast(WaitKind::Log, None));
        assert_eq!(waits.state(WaitKind::Log), SlotState::Idle);
    }

    #[test]
    fn test_second_arm_is_busy() {
        let waits = WaitRegistry::new();
        waits.arm(WaitKind::BootCmd, true).unwrap();
        assert_eq!(
            waits.arm(WaitKind::BootCmd, true),
            Err(DceError::Busy(WaitKind::BootCmd))
        );
        // Other kinds are independent
        waits.arm(WaitKind::Admin, true).unwrap();
    }

    #[test]
    fn test_wait_is_bounded() {
        let waits = WaitRegistry::new();
        let start = Instant::now();
        let result = waits.arm_and_wait(WaitKind::Sc7, Duration::from_millis(20), true);

        assert_eq!(result, Err(DceError::Timeout(WaitKind::Sc7)));
        assert!(start.elapsed() >= Duration::from_millis(20));
        assert!(start.elapsed() < Duration::from_millis(500));
        assert_eq!(waits.state(WaitKind::Sc7), SlotState::Stale);
    }

    #[test]
    fn test_stale_reply_isolation() {
        let waits = WaitRegistry::new();

        let old = waits.arm(WaitKind::BootCmd, true).unwrap();
        assert!(waits.wait(&old, Duration::from_millis(10)).is_err());

        let new = waits.arm(WaitKind::BootCmd, true).unwrap();
        assert_ne!(new.seq(), old.seq());

        // Reply to the expired round trip arrives late
        assert!(!waits.signal(WaitKind::BootCmd, Some(old.seq())));
        assert_eq!(
            waits.wait(&new, Duration::from_millis(10)),
            Err(DceError::Timeout(WaitKind::BootCmd))
        );
    }

    #[test]
    fn test_late_completion_without_reset() {
        let waits = WaitRegistry::new();

        let old = waits.arm(WaitKind::Log, true).unwrap();
        assert!(waits.wait(&old, Duration::from_millis(5)).is_err());
        waits.signal(WaitKind::Log, Some(old.seq()));
        assert_eq!(waits.state(WaitKind::Log), SlotState::Signaled);

        // Without reset_first the leftover completion satisfies the new wait
        let reused = waits.arm(WaitKind::Log, false).unwrap();
        waits.wait(&reused, Duration::from_millis(5)).unwrap();

        // With it, the leftover is discarded
        let old = waits.arm(WaitKind::Log, true).unwrap();
        assert!(waits.wait(&old, Duration::from_millis(5)).is_err());
        waits.signal(WaitKind::Log, Some(old.seq()));
        let fresh = waits.arm(WaitKind::Log, true).unwrap();
        assert!(waits.wait(&fresh, Duration::from_millis(5)).is_err());
    }

    #[test]
    fn test_interrupt_all() {
        let waits = Arc::new(WaitRegistry::new());
        let ticket = waits.arm(WaitKind::Admin, true).unwrap();

        let interrupter = Arc::clone(&waits);
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(10));
            interrupter.interrupt_all();
        });

        assert_eq!(
            waits.wait(&ticket, Duration::from_secs(2)),
            Err(DceError::Interrupted(WaitKind::Admin))
        );
        handle.join().unwrap();
        assert_eq!(waits.state(WaitKind::Admin), SlotState::Idle);
    }

    #[test]
    fn test_broadcast_completes_every_waiter() {
        let waits = Arc::new(WaitRegistry::new());
        let ticket = waits.arm(WaitKind::Sc7, true).unwrap();

        let waiters: Vec<_> = (0..3)
            .map(|_| {
                let waits = Arc::clone(&waits);
                thread::spawn(move || waits.wait(&ticket, Duration::from_secs(2)))
            })
            .collect();
        let deadline = Instant::now() + Duration::from_secs(2);
        while waits.slot(WaitKind::Sc7).lock().waiters < 3 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(1));
        }

        let begin = Instant::now();
        assert!(waits.broadcast(WaitKind::Sc7, Some(ticket.seq())));
        for waiter in waiters {
            assert_eq!(waiter.join().unwrap(), Ok(()));
        }
        assert!(begin.elapsed() < Duration::from_secs(1));
        assert_eq!(waits.state(WaitKind::Sc7), SlotState::Idle);
    }

    #[test]
    fn test_signal_reaches_every_waiter_in_turn() {
        let waits = Arc::new(WaitRegistry::new());
        let ticket = waits.arm(WaitKind::Log, true).unwrap();

        let waiters: Vec<_> = (0..2)
            .map(|_| {
                let waits = Arc::clone(&waits);
                thread::spawn(move || waits.wait(&ticket, Duration::from_secs(2)))
            })
            .collect();
        let deadline = Instant::now() + Duration::from_secs(2);
        while waits.slot(WaitKind::Log).lock().waiters < 2 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(1));
        }

        let begin = Instant::now();
        assert!(waits.signal(WaitKind::Log, Some(ticket.seq())));
        for waiter in waiters {
            assert_eq!(waiter.join().unwrap(), Ok(()));
        }
        assert!(begin.elapsed() < Duration::from_secs(1));
        assert_eq!(waits.state(WaitKind::Log), SlotState::Idle);
    }

    #[test]
    fn test_boot_cmd_seq_wraps_at_four_bits() {
        let waits = WaitRegistry::new();
        for _ in 0..20 {
            let ticket = waits.arm(WaitKind::BootCmd, true).unwrap();
            assert!(ticket.seq() <= 0xf);
            assert!(waits.signal(WaitKind::BootCmd, Some(ticket.seq())));
            waits.wait(&ticket, Duration::from_millis(10)).unwrap();
        }
    }
}
