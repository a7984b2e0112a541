//! Event reception - the DCE interrupt path
//!
//! Runs on whatever context the platform delivers the host's HSP line on.
//! Each invocation drains the notification mailbox, turns the word into a
//! `*_RECEIVED` event, then services the IVC channels (handshake progress
//! and reply frames). Everything funnels into [`Fsm::post_event`], so the
//! interrupt path is ordered with caller threads by the FSM lock.
//!
//! [`Fsm::post_event`]: crate::fsm::Fsm::post_event

use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};

use dce_hsp::{HspInstance, IrqLine};
use dce_ipc::{ChannelId, IvcChannel};

use crate::error::DceError;
use crate::fsm::Event;
use crate::protocol::{self, AdminReply, RemoteCode, RemoteWord, ADMIN_CHANNEL};
use crate::Shared;

/// Interrupt handler installed on an HSP line
pub type IrqHandler = Box<dyn Fn() + Send + Sync>;

/// Platform interrupt registration
pub trait IrqRegistrar: Send + Sync {
    /// Route `line` to `handler`, replacing any previous handler
    fn attach(&self, instance: HspInstance, line: IrqLine, handler: IrqHandler);
    fn detach(&self, instance: HspInstance, line: IrqLine);
}

/// Map a DCE notification to its event
///
/// IVC attention carries no event of its own; the channels are serviced
/// after every notification anyway.
pub fn event_for(word: RemoteWord) -> Option<Event> {
    Some(match word.code {
        RemoteCode::BootComplete => Event::BootCompleteReceived,
        RemoteCode::BootCmdAck => Event::BootCmdMsgReceived {
            seq: (word.value & 0xf) as u8,
            status: word.aux,
        },
        RemoteCode::Ivc => return None,
        RemoteCode::Sc7Entered => Event::Sc7EnteredReceived,
        RemoteCode::Sc7Exit => Event::Sc7ExitReceived,
        RemoteCode::LogReady => Event::LogReadyReceived {
            seq: word.value,
            status: word.aux,
        },
        RemoteCode::Abort => Event::AbortReceived { reason: word.value },
        RemoteCode::CrashLog => Event::CrashLogReceived,
        RemoteCode::LogOverflow => Event::LogOverflowReceived,
    })
}

/// Service one interrupt
pub(crate) fn service(shared: &Shared) {
    let wiring = &shared.wiring;
    let Some(raw) = shared.hsp.mailbox_value(wiring.instance, wiring.from_remote) else {
        return;
    };
    // Free the slot before anything else so the DCE can post the next word
    shared.hsp.mailbox_clear(wiring.instance, wiring.from_remote);

    match RemoteWord::decode(raw) {
        Ok(word) => {
            log::trace!("isr: {:?}", word);
            if let Some(event) = event_for(word) {
                post(shared, event);
            }
        }
        Err(e) => log::warn!("isr: {}", e),
    }

    if shared.ivc_live.load(Ordering::Acquire) {
        service_channel(shared, ADMIN_CHANNEL, &shared.admin);
        service_channel(shared, protocol::LOG_CHANNEL, &shared.log_channel);
    }
}

fn service_channel(shared: &Shared, id: ChannelId, channel: &Arc<Mutex<IvcChannel>>) {
    let mut frames = Vec::new();
    {
        let mut ivc = channel.lock().unwrap_or_else(|e| e.into_inner());
        if ivc.notified() {
            shared.links.mark(id);
        }
        while ivc.can_read() {
            match ivc.read_frame() {
                Ok(frame) => frames.push(frame),
                Err(e) => {
                    log::warn!("isr: channel {}: {}", id, e);
                    break;
                }
            }
        }
    }

    // Channel lock released: posting may dispatch on this channel
    for frame in frames {
        if id != ADMIN_CHANNEL {
            log::debug!("isr: unexpected frame on channel {}", id);
            continue;
        }
        match protocol::decode::<AdminReply>(&frame) {
            Ok(reply) => post(shared, Event::AdminIpcMsgReceived { reply }),
            Err(e) => log::warn!("isr: bad admin reply: {}", e),
        }
    }
}

fn post(shared: &Shared, event: Event) {
    let name = event.name();
    match shared.fsm.post_event(event) {
        Ok(_) => {}
        Err(DceError::Aborted) => log::debug!("isr: {} dropped, DCE aborted", name),
        Err(e) => log::warn!("isr: {} failed: {}", name, e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_boot_cmd_ack_mapping() {
        let word = RemoteWord::new(RemoteCode::BootCmdAck, 3, 0x1a);
        assert_eq!(
            event_for(word),
            Some(Event::BootCmdMsgReceived { seq: 0xa, status: 3 })
        );
    }

    #[test]
    fn test_ivc_attention_has_no_event() {
        assert_eq!(event_for(RemoteWord::new(RemoteCode::Ivc, 0, 0)), None);
    }

    #[test]
    fn test_failure_codes() {
        assert_eq!(
            event_for(RemoteWord::new(RemoteCode::Abort, 0, 0x55)),
            Some(Event::AbortReceived { reason: 0x55 })
        );
        assert_eq!(
            event_for(RemoteWord::new(RemoteCode::CrashLog, 0, 0)),
            Some(Event::CrashLogReceived)
        );
        assert_eq!(
            event_for(RemoteWord::new(RemoteCode::LogOverflow, 0, 0)),
            Some(Event::LogOverflowReceived)
        );
    }
}
