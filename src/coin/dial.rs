use super::leg::OutboundLeg;
use super::{CallResult, CoinCall, CoinError, FinalDisposition};
use crate::host::{Channel, ChannelRef, ControlFrame, Frame, HangupCause};
use anyhow::Result;
use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};

pub enum DialOutcome {
    /// Far end answered and media formats are compatible.
    Answered(OutboundLeg),
    /// Call did not complete; result and final disposition are already set.
    Terminal,
}

/// Suppresses repeats of the same progress indication.
#[derive(Debug, Default)]
pub struct IndicationRelay {
    last: Option<ControlFrame>,
}

impl IndicationRelay {
    pub fn should_forward(&mut self, control: ControlFrame) -> bool {
        if self.last == Some(control) {
            return false;
        }
        self.last = Some(control);
        true
    }
}

/// Copy identity and dialplan state from the caller to the new channel.
///
/// Variables prefixed `__` are inherited unchanged so they keep
/// propagating; a single `_` is inherited once, with the prefix stripped.
pub fn prepare_outbound(caller: &dyn Channel, callee: &dyn Channel) {
    callee.set_caller_id(caller.caller_id());
    callee.set_redirecting(caller.redirecting());
    callee.set_dial_context(&caller.context());
    callee.set_forwards(caller.forwards().saturating_sub(1));
    for (name, value) in caller.vars() {
        if name.starts_with("__") {
            callee.set_var(&name, &value);
        } else if let Some(stripped) = name.strip_prefix('_') {
            if !stripped.is_empty() {
                callee.set_var(stripped, &value);
            }
        }
    }
}

enum Progress {
    Answered,
    Busy,
    Congestion,
    NoAnswer,
    CallerHangup,
}

async fn relay_until_answer(call: &CoinCall, callee: &ChannelRef) -> Progress {
    let caller = &call.caller;
    let config = call.config();
    let deadline = config.answer_timeout().map(|t| Instant::now() + t);
    let mut relay = IndicationRelay::default();
    let mut early_media_tried = false;

    loop {
        if caller.is_hungup() {
            return Progress::CallerHangup;
        }
        if let Some(deadline) = deadline {
            if Instant::now() >= deadline {
                info!(call_id = %call.id, "no answer before timeout");
                return Progress::NoAnswer;
            }
        }

        tokio::select! {
            frame = caller.read() => match frame {
                None | Some(Frame::Control(ControlFrame::Hangup)) => {
                    return Progress::CallerHangup;
                }
                Some(frame) if frame.is_relayed_media() => {
                    if let Err(e) = callee.write(frame).await {
                        debug!(call_id = %call.id, "relay to callee failed: {}", e);
                    }
                }
                Some(frame) => {
                    debug!(call_id = %call.id, ?frame, "dropping frame from caller");
                }
            },
            frame = callee.read() => match frame {
                None => return Progress::NoAnswer,
                Some(Frame::Control(control)) => match control {
                    ControlFrame::Answer => return Progress::Answered,
                    ControlFrame::Busy => return Progress::Busy,
                    ControlFrame::Congestion => return Progress::Congestion,
                    ControlFrame::Hangup => return Progress::NoAnswer,
                    ControlFrame::Ringing | ControlFrame::Progress | ControlFrame::Proceeding => {
                        if relay.should_forward(control) {
                            if let Err(e) = caller.indicate(control).await {
                                debug!(call_id = %call.id, ?control, "indication failed: {}", e);
                            }
                        }
                        if !early_media_tried && control != ControlFrame::Proceeding {
                            early_media_tried = true;
                            try_early_media(call, callee).await;
                        }
                    }
                    other => {
                        debug!(call_id = %call.id, control = ?other, "ignoring control frame");
                    }
                },
                Some(frame) if frame.is_relayed_media() => {
                    if let Err(e) = caller.write(frame).await {
                        debug!(call_id = %call.id, "relay to caller failed: {}", e);
                    }
                }
                Some(frame) => {
                    debug!(call_id = %call.id, ?frame, "dropping frame from callee");
                }
            },
            _ = sleep(config.relay_poll()) => {}
        }
    }
}

async fn try_early_media(call: &CoinCall, callee: &ChannelRef) {
    if call.caller.has_media_hooks() || callee.has_media_hooks() {
        debug!(call_id = %call.id, "media hooks present, no early bridge");
        return;
    }
    match call
        .services
        .host
        .early_bridge(&call.caller, callee)
        .await
    {
        Ok(bridged) => debug!(call_id = %call.id, bridged, "early media bridge"),
        Err(e) => debug!(call_id = %call.id, "early media bridge failed: {}", e),
    }
}

/// Originate the outgoing leg and relay progress until answer or failure.
///
/// A caller hangup before answer is returned as [`CoinError::Hangup`].
pub async fn dial(call: &CoinCall) -> Result<DialOutcome> {
    let caller = &call.caller;
    let options = &call.options;
    let target = options.dial_target();

    if caller.forwards() == 0 {
        warn!(call_id = %call.id, %target, "forwarding limit reached, not dialing");
        call.shared
            .terminate(CallResult::Failure, FinalDisposition::Return);
        return Ok(DialOutcome::Terminal);
    }

    let callee = match call
        .services
        .host
        .request_channel(&options.tech, &options.resource, &caller.topology(), caller)
        .await
    {
        Ok(callee) => callee,
        Err(e) => {
            warn!(call_id = %call.id, %target, "unable to create channel: {}", e);
            call.shared
                .terminate(CallResult::Failure, FinalDisposition::Return);
            return Ok(DialOutcome::Terminal);
        }
    };
    prepare_outbound(caller.as_ref(), callee.as_ref());
    let leg = OutboundLeg::new(callee);

    if let Err(e) = leg.channel().call(&options.resource).await {
        warn!(call_id = %call.id, %target, "unable to call: {}", e);
        leg.hangup().await;
        call.shared
            .terminate(CallResult::Failure, FinalDisposition::Return);
        return Ok(DialOutcome::Terminal);
    }
    info!(call_id = %call.id, %target, channel = %leg.channel().name(), "dialing");

    let (result, cause) = match relay_until_answer(call, leg.channel()).await {
        Progress::Answered => {
            leg.channel().set_hangup_cause(HangupCause::NormalClearing);
            caller.set_hangup_cause(HangupCause::NormalClearing);
            let host = &call.services.host;
            if let Err(e) = host.make_compatible(caller, leg.channel()).await {
                warn!(call_id = %call.id, "media formats incompatible: {}", e);
                leg.hangup().await;
                call.shared
                    .terminate(CallResult::Failure, FinalDisposition::Return);
                return Err(CoinError::Host(e.to_string()).into());
            }
            info!(call_id = %call.id, %target, "answered");
            return Ok(DialOutcome::Answered(leg));
        }
        Progress::CallerHangup => {
            info!(call_id = %call.id, "caller abandoned before answer");
            leg.hangup().await;
            call.shared
                .terminate(CallResult::CallerAbort, FinalDisposition::Return);
            return Err(CoinError::Hangup(caller.name()).into());
        }
        Progress::Busy => (CallResult::Busy, HangupCause::UserBusy),
        Progress::Congestion => (CallResult::Congestion, HangupCause::Congestion),
        Progress::NoAnswer => (CallResult::NoAnswer, HangupCause::NoAnswer),
    };
    info!(call_id = %call.id, %target, %result, "call not completed");
    caller.set_hangup_cause(cause);
    leg.hangup().await;
    call.shared.terminate(result, FinalDisposition::Return);
    Ok(DialOutcome::Terminal)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::memory::MemoryChannel;
    use crate::host::{CallerId, Redirecting};

    #[test]
    fn test_indication_relay_suppresses_repeats() {
        let mut relay = IndicationRelay::default();
        let forwarded: Vec<_> = [
            ControlFrame::Ringing,
            ControlFrame::Ringing,
            ControlFrame::Progress,
            ControlFrame::Ringing,
        ]
        .into_iter()
        .filter(|c| relay.should_forward(*c))
        .collect();
        assert_eq!(
            forwarded,
            vec![
                ControlFrame::Ringing,
                ControlFrame::Progress,
                ControlFrame::Ringing
            ]
        );
    }

    #[test]
    fn test_prepare_outbound() {
        let caller = MemoryChannel::new("DAHDI/1-1")
            .with_caller_id("5551234", "PAYPHONE")
            .with_redirecting(Redirecting {
                from: Some("5550000".to_string()),
                reason: Some("unconditional".to_string()),
                count: 1,
            })
            .with_forwards(5)
            .with_var("__ACCOUNT", "7")
            .with_var("_ONCE", "1")
            .with_var("LOCAL", "x")
            .with_var("_", "ignored");
        let callee = MemoryChannel::new("SIP/far");
        prepare_outbound(&caller, &callee);

        assert_eq!(
            callee.caller_id(),
            CallerId {
                number: Some("5551234".to_string()),
                name: Some("PAYPHONE".to_string()),
            }
        );
        assert_eq!(callee.redirecting().count, 1);
        assert_eq!(callee.forwards(), 4);
        assert_eq!(callee.dial_context().as_deref(), Some("default"));
        assert_eq!(callee.get_var("__ACCOUNT").as_deref(), Some("7"));
        assert_eq!(callee.get_var("ONCE").as_deref(), Some("1"));
        assert!(callee.get_var("_ONCE").is_none());
        assert!(callee.get_var("LOCAL").is_none());
        assert_eq!(callee.vars().len(), 2);
    }
}
