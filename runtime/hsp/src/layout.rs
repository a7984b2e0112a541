//! HSP Register Layout
//!
//! Chip-specific register map for the Hardware Synchronization Primitives
//! block. Everything above this module addresses registers through the
//! helpers here, so a different chip only has to swap this file.
//!
//! ```text
//! instance base   = instance * 0x10_0000
//! mailbox k       = base + 0x1_0000 + k * 0x8000
//!     +0x0 DATA      (bit 31 = TAG)
//!     +0x4 FULL_IE
//!     +0x8 EMPTY_IE
//! semaphore k     = base + 0x5_0000 + k * 0x1_0000
//!     +0x0 STATE
//!     +0x4 SET
//!     +0x8 CLR
//! irq line n      = base + 0x100 + n * 4   (INT_IE)
//! ```

use crate::{HspInstance, IrqLine, MailboxId, SemaphoreId};

/// Stride between HSP instances
pub const INSTANCE_STRIDE: usize = 0x10_0000;

/// Offset of shared mailbox 0 inside an instance
pub const MBOX_BASE: usize = 0x1_0000;
/// Stride between shared mailboxes
pub const MBOX_STRIDE: usize = 0x8000;

/// Offset of shared semaphore 0 inside an instance
pub const SEM_BASE: usize = 0x5_0000;
/// Stride between shared semaphores
pub const SEM_STRIDE: usize = 0x1_0000;

/// Offset of INT_IE line 0 inside an instance
pub const INT_IE_BASE: usize = 0x100;

pub const MBOX_DATA: usize = 0x0;
pub const MBOX_FULL_IE: usize = 0x4;
pub const MBOX_EMPTY_IE: usize = 0x8;

pub const SEM_STATE: usize = 0x0;
pub const SEM_SET: usize = 0x4;
pub const SEM_CLR: usize = 0x8;

// Mailbox and semaphore windows must not run into each other
static_assertions::const_assert!(MBOX_BASE + MailboxId::COUNT * MBOX_STRIDE <= SEM_BASE);
static_assertions::const_assert!(SEM_BASE + SemaphoreId::COUNT * SEM_STRIDE <= INSTANCE_STRIDE);
static_assertions::const_assert!(INT_IE_BASE + IrqLine::COUNT * 4 <= MBOX_BASE);

/// Base offset of an HSP instance
#[inline]
pub const fn instance_base(instance: HspInstance) -> usize {
    instance.index() * INSTANCE_STRIDE
}

/// Offset of a register inside a shared mailbox
#[inline]
pub const fn mailbox(instance: HspInstance, id: MailboxId, reg: usize) -> usize {
    instance_base(instance) + MBOX_BASE + id.index() * MBOX_STRIDE + reg
}

/// Offset of a register inside a shared semaphore
#[inline]
pub const fn semaphore(instance: HspInstance, id: SemaphoreId, reg: usize) -> usize {
    instance_base(instance) + SEM_BASE + id.index() * SEM_STRIDE + reg
}

/// Offset of an interrupt-enable line register
#[inline]
pub const fn int_ie(instance: HspInstance, line: IrqLine) -> usize {
    instance_base(instance) + INT_IE_BASE + line.index() * 4
}

/// A decoded register offset
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Register {
    MailboxData(HspInstance, MailboxId),
    MailboxFullIe(HspInstance, MailboxId),
    MailboxEmptyIe(HspInstance, MailboxId),
    SemaphoreState(HspInstance, SemaphoreId),
    SemaphoreSet(HspInstance, SemaphoreId),
    SemaphoreClear(HspInstance, SemaphoreId),
    InterruptEnable(HspInstance, IrqLine),
}

/// Decode a raw offset back into the register it names
///
/// Returns `None` for offsets that fall between registers.
pub fn decode(offset: usize) -> Option<Register> {
    let instance = HspInstance::from_index(offset / INSTANCE_STRIDE)?;
    let local = offset % INSTANCE_STRIDE;

    if local >= SEM_BASE {
        let rel = local - SEM_BASE;
        let id = SemaphoreId::from_index(rel / SEM_STRIDE)?;
        return match rel % SEM_STRIDE {
            SEM_STATE => Some(Register::SemaphoreState(instance, id)),
            SEM_SET => Some(Register::SemaphoreSet(instance, id)),
            SEM_CLR => Some(Register::SemaphoreClear(instance, id)),
            _ => None,
        };
    }

    if local >= MBOX_BASE {
        let rel = local - MBOX_BASE;
        let id = MailboxId::from_index(rel / MBOX_STRIDE)?;
        return match rel % MBOX_STRIDE {
            MBOX_DATA => Some(Register::MailboxData(instance, id)),
            MBOX_FULL_IE => Some(Register::MailboxFullIe(instance, id)),
            MBOX_EMPTY_IE => Some(Register::MailboxEmptyIe(instance, id)),
            _ => None,
        };
    }

    if local >= INT_IE_BASE && (local - INT_IE_BASE) % 4 == 0 {
        let n = (local - INT_IE_BASE) / 4;
        if n >= IrqLine::COUNT {
            return None;
        }
        let line = IrqLine::new(n as u8)?;
        return Some(Register::InterruptEnable(instance, line));
    }

    None
}
