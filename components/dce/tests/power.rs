//! SC7 power sequencing against the simulated DCE

use std::sync::{Arc, Mutex};

use dce::protocol::{abort_reason, admin_cmd};
use dce::sim::{Bench, Fault};
use dce::{DceConfig, DceError, DceState, PmNotifier, WaitKind};
use dce_hsp::{HspInstance, IrqLine};

#[derive(Default)]
struct RecordingPm {
    reasons: Mutex<Vec<String>>,
}

impl PmNotifier for RecordingPm {
    fn remote_unresponsive(&self, reason: &str) {
        self.reasons.lock().unwrap().push(reason.to_owned());
    }
}

fn config() -> DceConfig {
    let mut config = DceConfig::default();
    config.timeouts.sc7_enter_ms = 200;
    config.timeouts.sc7_exit_ms = 300;
    config.hsp.owned_lines = vec![0, 3];
    config
}

fn host_line(n: u8) -> IrqLine {
    IrqLine::new(n).unwrap()
}

#[test]
fn test_resume_restores_interrupt_enables() {
    let bench = Bench::new(config()).unwrap();
    bench.dce.start().unwrap();

    let hsp = bench.hsp();
    let inst = HspInstance::Top0;
    // Something else owns bits on the second line too
    hsp.interrupt_enable_write(0x0000_0f00, inst, host_line(3));
    let before: Vec<u32> = [0, 3]
        .iter()
        .map(|&n| hsp.interrupt_enable_read(inst, host_line(n)))
        .collect();
    assert_ne!(before[0], 0);

    bench.dce.enter_suspend().unwrap();
    assert_eq!(bench.dce.state(), DceState::Sc7Entered);
    assert!(bench.dce.has_power_snapshot());
    assert!(bench.remote.is_suspended());

    bench.remote.power_loss();
    assert_eq!(hsp.interrupt_enable_read(inst, host_line(0)), 0);
    assert_eq!(hsp.interrupt_enable_read(inst, host_line(3)), 0);

    bench.dce.exit_resume().unwrap();
    let after: Vec<u32> = [0, 3]
        .iter()
        .map(|&n| hsp.interrupt_enable_read(inst, host_line(n)))
        .collect();
    assert_eq!(after, before);
    assert!(bench.dce.is_operating());
    assert!(!bench.dce.has_power_snapshot());

    let reply = bench.dce.admin_request(admin_cmd::ECHO, b"awake").unwrap();
    assert_eq!(reply.payload, b"awake");
}

#[test]
fn test_requests_refused_while_suspended() {
    let bench = Bench::new(config()).unwrap();
    bench.dce.start().unwrap();
    bench.dce.enter_suspend().unwrap();

    assert_eq!(
        bench.dce.admin_request(admin_cmd::ECHO, b"x"),
        Err(DceError::InvalidState(DceState::Sc7Entered))
    );
    assert_eq!(
        bench.dce.enter_suspend(),
        Err(DceError::InvalidState(DceState::Sc7Entered))
    );
}

#[test]
fn test_suspend_refused_when_dce_silent() {
    let bench = Bench::new(config()).unwrap();
    bench.dce.start().unwrap();
    bench.remote.inject(Fault::DropReplies(1));

    assert_eq!(
        bench.dce.enter_suspend(),
        Err(DceError::Timeout(WaitKind::Sc7))
    );
    assert!(bench.dce.is_operating());
    assert!(!bench.dce.has_power_snapshot());
    assert!(!bench.remote.is_suspended());
}

#[test]
fn test_resume_needs_prior_suspend() {
    let bench = Bench::new(config()).unwrap();
    bench.dce.start().unwrap();
    assert_eq!(
        bench.dce.exit_resume(),
        Err(DceError::InvalidState(DceState::Idle))
    );
}

#[test]
fn test_missing_exit_notifies_pm_and_aborts() {
    let pm = Arc::new(RecordingPm::default());
    let bench = Bench::with_pm(config(), pm.clone()).unwrap();
    bench.dce.start().unwrap();
    bench.remote.inject(Fault::NoResume);

    bench.dce.enter_suspend().unwrap();
    bench.remote.power_loss();
    assert_eq!(
        bench.dce.exit_resume(),
        Err(DceError::Timeout(WaitKind::Sc7))
    );

    assert_eq!(pm.reasons.lock().unwrap().len(), 1);
    assert_eq!(bench.dce.state(), DceState::Abort);
    assert_eq!(bench.dce.abort_reason(), Some(abort_reason::SC7_EXIT_TIMEOUT));

    // Recovery is a full restart
    bench.remote.heal();
    bench.dce.stop().unwrap();
    bench.dce.start().unwrap();
    assert!(bench.dce.is_operating());
}
