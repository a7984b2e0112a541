//! # Hardware Synchronization Primitives (HSP)
//!
//! Thin abstraction over the two doorbell mechanisms shared between the host
//! and the display controller engine (DCE):
//! - **Shared semaphores**: bit-fields either side can set, clear and poll.
//!   Used as level-triggered status flags (boot status, channel reset).
//! - **Shared mailboxes**: word-sized slots with "full"/"empty" interrupt
//!   enables. Writing tags the value so a real message is never confused
//!   with a zeroed slot.
//!
//! ## Integration Points
//! - Depends on: a raw register backend ([`HspRegs`])
//! - Provides to: the IVC transport (doorbells), the DCE driver (boot
//!   mailbox, status semaphores, interrupt-enable snapshot/restore)
//!
//! ## Backends
//!
//! ```bash
//! # Mock register file (default, any host)
//! cargo test -p dce-hsp
//!
//! # Real hardware: provide an `HspRegs` over the mapped MMIO window
//! cargo build -p dce-hsp --no-default-features
//! ```
//!
//! Every operation here is a single register-width read, write, set or
//! clear. Nothing blocks.

use std::sync::Arc;

use bitflags::bitflags;

pub mod layout;

#[cfg(feature = "mock")]
pub mod mock;

/// Tag bit marking a mailbox slot as full
pub const MBOX_TAG: u32 = 1 << 31;

/// Bits available for a mailbox payload
pub const MBOX_VALUE_MASK: u32 = !MBOX_TAG;

/// HSP block instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u8)]
pub enum HspInstance {
    Top0 = 0,
    Top1 = 1,
}

impl HspInstance {
    pub const COUNT: usize = 2;
    pub const ALL: [HspInstance; Self::COUNT] = [HspInstance::Top0, HspInstance::Top1];

    #[inline]
    pub const fn index(self) -> usize {
        self as usize
    }

    pub fn from_index(index: usize) -> Option<Self> {
        Self::ALL.get(index).copied()
    }
}

/// Shared mailbox within an HSP instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u8)]
pub enum MailboxId {
    Sm0 = 0,
    Sm1,
    Sm2,
    Sm3,
    Sm4,
    Sm5,
    Sm6,
    Sm7,
}

impl MailboxId {
    pub const COUNT: usize = 8;
    pub const ALL: [MailboxId; Self::COUNT] = [
        MailboxId::Sm0,
        MailboxId::Sm1,
        MailboxId::Sm2,
        MailboxId::Sm3,
        MailboxId::Sm4,
        MailboxId::Sm5,
        MailboxId::Sm6,
        MailboxId::Sm7,
    ];

    #[inline]
    pub const fn index(self) -> usize {
        self as usize
    }

    pub fn from_index(index: usize) -> Option<Self> {
        Self::ALL.get(index).copied()
    }
}

/// Shared semaphore within an HSP instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u8)]
pub enum SemaphoreId {
    Ss0 = 0,
    Ss1,
    Ss2,
    Ss3,
}

impl SemaphoreId {
    pub const COUNT: usize = 4;
    pub const ALL: [SemaphoreId; Self::COUNT] =
        [SemaphoreId::Ss0, SemaphoreId::Ss1, SemaphoreId::Ss2, SemaphoreId::Ss3];

    #[inline]
    pub const fn index(self) -> usize {
        self as usize
    }

    pub fn from_index(index: usize) -> Option<Self> {
        Self::ALL.get(index).copied()
    }
}

/// Shared interrupt line of an HSP instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct IrqLine(u8);

impl IrqLine {
    pub const COUNT: usize = 8;

    /// Returns `None` if `n` is not a valid line number
    pub const fn new(n: u8) -> Option<Self> {
        if (n as usize) < Self::COUNT {
            Some(Self(n))
        } else {
            None
        }
    }

    #[inline]
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

// Mailbox full/empty bits have to fit in one INT_IE word
static_assertions::const_assert!(MailboxId::COUNT * 2 <= 32);

bitflags! {
    /// Bit layout of an INT_IE line register
    ///
    /// Bits 0..7 enable the "empty" interrupt of mailbox 0..7, bits 8..15
    /// enable the "full" interrupt.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct IeBits: u32 {
        const EMPTY_MASK = 0x0000_00ff;
        const FULL_MASK = 0x0000_ff00;
        const _ = !0;
    }
}

impl IeBits {
    /// Enable bit for the "full" interrupt of a mailbox
    pub const fn full(id: MailboxId) -> Self {
        Self::from_bits_retain(1 << (8 + id.index()))
    }

    /// Enable bit for the "empty" interrupt of a mailbox
    pub const fn mailbox_empty(id: MailboxId) -> Self {
        Self::from_bits_retain(1 << id.index())
    }
}

/// Raw register access for one HSP block
///
/// This is the seam between the chip-independent operations in [`Hsp`]
/// and whatever backs the registers (MMIO on hardware, an in-memory file in
/// tests). Implementations perform exactly one 32-bit access per call.
pub trait HspRegs: Send + Sync {
    fn read(&self, offset: usize) -> u32;
    fn write(&self, offset: usize, value: u32);
}

/// Chip-independent HSP operations
///
/// Cheap to clone; all clones address the same registers.
#[derive(Clone)]
pub struct Hsp {
    regs: Arc<dyn HspRegs>,
}

impl Hsp {
    pub fn new(regs: Arc<dyn HspRegs>) -> Self {
        Self { regs }
    }

    /// Set bits in a shared semaphore
    pub fn semaphore_set(&self, bits: u32, instance: HspInstance, id: SemaphoreId) {
        self.regs
            .write(layout::semaphore(instance, id, layout::SEM_SET), bits);
    }

    /// Clear bits in a shared semaphore
    pub fn semaphore_clear(&self, bits: u32, instance: HspInstance, id: SemaphoreId) {
        self.regs
            .write(layout::semaphore(instance, id, layout::SEM_CLR), bits);
    }

    /// Read the current bitmask of a shared semaphore
    pub fn semaphore_get_state(&self, instance: HspInstance, id: SemaphoreId) -> u32 {
        self.regs
            .read(layout::semaphore(instance, id, layout::SEM_STATE))
    }

    /// Write a value into a shared mailbox, tagging it as full
    ///
    /// Only the low 31 bits of `value` are carried.
    pub fn mailbox_write(&self, value: u32, instance: HspInstance, id: MailboxId) {
        debug_assert!(value & MBOX_TAG == 0, "mailbox payload overlaps the tag bit");
        self.regs.write(
            layout::mailbox(instance, id, layout::MBOX_DATA),
            (value & MBOX_VALUE_MASK) | MBOX_TAG,
        );
    }

    /// Read the raw mailbox word, tag included
    pub fn mailbox_read(&self, instance: HspInstance, id: MailboxId) -> u32 {
        self.regs
            .read(layout::mailbox(instance, id, layout::MBOX_DATA))
    }

    /// Read the mailbox payload if the slot is tagged full
    pub fn mailbox_value(&self, instance: HspInstance, id: MailboxId) -> Option<u32> {
        let raw = self.mailbox_read(instance, id);
        (raw & MBOX_TAG != 0).then_some(raw & MBOX_VALUE_MASK)
    }

    pub fn mailbox_is_full(&self, instance: HspInstance, id: MailboxId) -> bool {
        self.mailbox_read(instance, id) & MBOX_TAG != 0
    }

    /// Drain a mailbox, marking it empty
    pub fn mailbox_clear(&self, instance: HspInstance, id: MailboxId) {
        self.regs
            .write(layout::mailbox(instance, id, layout::MBOX_DATA), 0);
    }

    /// Control whether a full slot raises an interrupt on the receiving side
    pub fn mailbox_set_full_interrupt_enable(
        &self,
        enable: bool,
        instance: HspInstance,
        id: MailboxId,
    ) {
        self.regs.write(
            layout::mailbox(instance, id, layout::MBOX_FULL_IE),
            u32::from(enable),
        );
    }

    /// Control whether draining a slot raises an interrupt on the sending side
    pub fn mailbox_set_empty_interrupt_enable(
        &self,
        enable: bool,
        instance: HspInstance,
        id: MailboxId,
    ) {
        self.regs.write(
            layout::mailbox(instance, id, layout::MBOX_EMPTY_IE),
            u32::from(enable),
        );
    }

    /// Raw read of an INT_IE line register
    pub fn interrupt_enable_read(&self, instance: HspInstance, line: IrqLine) -> u32 {
        self.regs.read(layout::int_ie(instance, line))
    }

    /// Raw write of an INT_IE line register
    pub fn interrupt_enable_write(&self, value: u32, instance: HspInstance, line: IrqLine) {
        self.regs.write(layout::int_ie(instance, line), value);
    }

    /// Read-modify-write helper to enable or disable bits on a line
    pub fn interrupt_enable_update(
        &self,
        bits: IeBits,
        enable: bool,
        instance: HspInstance,
        line: IrqLine,
    ) {
        let mut current = IeBits::from_bits_retain(self.interrupt_enable_read(instance, line));
        current.set(bits, enable);
        log::trace!(
            "hsp: {:?} line {} ie -> {:#010x}",
            instance,
            line.index(),
            current.bits()
        );
        self.interrupt_enable_write(current.bits(), instance, line);
    }
}

impl core::fmt::Debug for Hsp {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Hsp").finish_non_exhaustive()
    }
}
