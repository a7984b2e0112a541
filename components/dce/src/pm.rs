//! Power Sequencer - SC7 entry and exit
//!
//! SC7 powers the DCE down with the rest of the SoC. The interrupt-enable
//! lines this driver owns do not survive that, so their raw values are
//! captured when suspend is requested and written back verbatim on resume,
//! before the DCE announces it is back.

use dce_hsp::{Hsp, HspInstance, IrqLine};

use crate::error::{DceError, Result};
use crate::fsm::{DceState, Event};
use crate::protocol::abort_reason;
use crate::Dce;

/// Host power-management hook
///
/// Told when the DCE fails to come back from SC7. No retry is attempted;
/// what happens next is the platform's decision.
pub trait PmNotifier: Send + Sync {
    fn remote_unresponsive(&self, reason: &str);
}

/// Reports through the `log` facade only
#[derive(Debug, Default, Clone, Copy)]
pub struct LogPmNotifier;

impl PmNotifier for LogPmNotifier {
    fn remote_unresponsive(&self, reason: &str) {
        log::error!("pm: DCE unresponsive: {}", reason);
    }
}

/// Saved INT_IE configuration, valid for one suspend/resume cycle
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PowerSnapshot {
    instance: HspInstance,
    lines: Vec<(IrqLine, u32)>,
}

impl PowerSnapshot {
    pub fn capture(hsp: &Hsp, instance: HspInstance, lines: &[IrqLine]) -> Self {
        let lines = lines
            .iter()
            .map(|&line| (line, hsp.interrupt_enable_read(instance, line)))
            .collect();
        Self { instance, lines }
    }

    pub fn restore(&self, hsp: &Hsp) {
        for &(line, value) in &self.lines {
            log::debug!("pm: restore {:?} line {} = {:#010x}", self.instance, line.index(), value);
            hsp.interrupt_enable_write(value, self.instance, line);
        }
    }

    pub fn lines(&self) -> &[(IrqLine, u32)] {
        &self.lines
    }
}

impl Dce {
    /// Ask the DCE to enter SC7 and wait until it has
    ///
    /// The owned interrupt-enable lines are captured first and kept only if
    /// the DCE confirms. On timeout the driver returns to the operating
    /// state and the suspend is refused.
    pub fn enter_suspend(&self) -> Result<()> {
        let s = &self.shared;
        let _guard = s.request_lock();
        let snapshot = PowerSnapshot::capture(&s.hsp, s.wiring.instance, &s.wiring.owned_lines);

        s.round_trip(Event::Sc7EnterRequested, s.config.timeouts.sc7_enter())?;
        if s.fsm.state() != DceState::Sc7Entered {
            return Err(s.not_operating());
        }

        *s.snapshot.lock().unwrap_or_else(|e| e.into_inner()) = Some(snapshot);
        log::info!("pm: DCE in SC7");
        Ok(())
    }

    /// Restore the saved line configuration and wait for the DCE to
    /// announce SC7 exit
    ///
    /// If it never does, the PM notifier is told and the driver aborts.
    pub fn exit_resume(&self) -> Result<()> {
        let s = &self.shared;
        let _guard = s.request_lock();
        let ticket = s.fsm.arm_resume()?;

        match s.snapshot.lock().unwrap_or_else(|e| e.into_inner()).take() {
            Some(snapshot) => snapshot.restore(&s.hsp),
            None => log::warn!("pm: resuming without a saved line configuration"),
        }

        match s.waits.wait(&ticket, s.config.timeouts.sc7_exit()) {
            Ok(()) => {
                log::info!("pm: DCE resumed");
                Ok(())
            }
            Err(DceError::Timeout(kind)) => {
                s.pm.remote_unresponsive("no SC7 exit notification");
                s.fsm.abort(abort_reason::SC7_EXIT_TIMEOUT);
                Err(DceError::Timeout(kind))
            }
            Err(DceError::Interrupted(_)) if s.fsm.state() == DceState::Abort => {
                Err(DceError::Aborted)
            }
            Err(e) => Err(e),
        }
    }

    /// A suspend snapshot is being held for the next resume
    pub fn has_power_snapshot(&self) -> bool {
        self.shared
            .snapshot
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .is_some()
    }
}
