use super::dial::{dial, DialOutcome};
use super::leg::BridgedLeg;
use super::options::period_budget;
use super::session::{
    get_overtime_deposit, join_with_timeout, spawn_callee_leave_hook, JoinOutcome,
    OvertimeOutcome,
};
use super::verifier::ground_test;
use super::{
    CallResult, CoinCall, CoinCallRegistry, CoinError, CoinOptions, CoinServices, Disposition,
    FinalDisposition, VAR_COLLECTED, VAR_FINAL_DISPOSITION, VAR_REASON, VAR_RESULT,
};
use crate::event::CoinEvent;
use crate::host::{BridgeKind, BridgeOptions, BridgeRef, ChannelRef, ChannelState};
use anyhow::Result;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{timeout, Instant};
use tracing::{debug, error, info, warn};

/// What the invoking dialplan sees once the application returns.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CallSummary {
    pub call_id: String,
    pub result: CallResult,
    pub end_reason: CallResult,
    pub final_disposition: FinalDisposition,
    pub collected: u32,
    pub answered: bool,
}

/// The coin call application.
pub struct CoinCallApp {
    services: CoinServices,
}

impl CoinCallApp {
    pub fn new(services: CoinServices) -> Self {
        Self { services }
    }

    pub fn registry(&self) -> &Arc<CoinCallRegistry> {
        &self.services.registry
    }

    /// Run a coin call from the application argument string.
    pub async fn exec(&self, caller: ChannelRef, args: &str) -> Result<CallSummary> {
        match CoinOptions::parse(args, &self.services.config) {
            Ok(options) => self.run(caller, options).await,
            Err(e) => {
                warn!(channel = %caller.name(), args, "{}", e);
                caller.set_var(VAR_RESULT, CallResult::Invalid.as_str());
                caller.set_var(VAR_REASON, CallResult::Invalid.as_str());
                caller.set_var(VAR_FINAL_DISPOSITION, FinalDisposition::None.as_str());
                caller.set_var(VAR_COLLECTED, "0");
                Ok(CallSummary {
                    call_id: uuid::Uuid::new_v4().to_string(),
                    result: CallResult::Invalid,
                    end_reason: CallResult::Invalid,
                    final_disposition: FinalDisposition::None,
                    collected: 0,
                    answered: false,
                })
            }
        }
    }

    /// Drive one call to completion.
    ///
    /// The outcome is always published on the caller channel; an error is
    /// returned afterwards when the call ended abnormally, a caller
    /// abandoning the call before answer included.
    pub async fn run(&self, caller: ChannelRef, options: CoinOptions) -> Result<CallSummary> {
        let call = CoinCall::new(caller, options, self.services.clone());
        let _registration = self.services.registry.register(&call);
        info!(
            call_id = %call.id,
            channel = %call.caller.name(),
            target = %call.options.dial_target(),
            "coin call started"
        );

        let outcome = drive(&call).await;
        match &outcome {
            Ok(()) => {}
            Err(e) if CoinError::is_hangup(e) => {
                info!(call_id = %call.id, "coin call abandoned: {}", e)
            }
            Err(e) => warn!(call_id = %call.id, "coin call failed: {}", e),
        }
        let summary = finish(&call);
        outcome.map(|_| summary)
    }
}

async fn drive(call: &CoinCall) -> Result<()> {
    let options = call.options.clone();

    if options.initial_deposit > 0 {
        let verification = ground_test(call).await?;
        if !verification.is_positive() {
            info!(call_id = %call.id, "no initial deposit");
            call.shared.terminate(
                CallResult::InitialDepositRequired,
                FinalDisposition::Return,
            );
            return Ok(());
        }
        call.shared.lock().credit(options.initial_deposit);
    }

    if options.flags.return_before_dial {
        call.signal(Disposition::Return);
    }
    if options.flags.attach_before_dial {
        call.signal(Disposition::OperatorAttach);
    }

    let leg = match dial(call).await? {
        DialOutcome::Answered(leg) => leg,
        DialOutcome::Terminal => {
            // never answered, nothing to charge for
            call.shared.lock().return_hopper();
            return Ok(());
        }
    };

    if call.caller.state() == ChannelState::Up {
        warn!(call_id = %call.id, "caller already answered, supervision timing is off");
    }
    {
        let mut state = call.shared.lock();
        state.answered_at = Some(Instant::now());
        state.fgc = options.flags.feature_group_c;
    }
    if let Err(e) = call.caller.answer().await {
        leg.hangup().await;
        return Err(e);
    }

    let config = call.config();
    let bridge = call.services.host.create_bridge(BridgeOptions {
        name: format!("coin-{}", call.id),
        kind: BridgeKind::MultiMix,
        internal_sample_rate: config.bridge_sample_rate,
        maximum_sample_rate: config.bridge_sample_rate,
        mixing_interval: Duration::from_millis(config.bridge_mixing_interval_ms),
        transfer_prohibited: true,
    });
    let bridge = match bridge {
        Ok(bridge) => bridge,
        Err(e) => {
            leg.hangup().await;
            return Err(e);
        }
    };

    let (leave_tx, leave_rx) = oneshot::channel();
    let callee = match leg.impart(&bridge, leave_tx).await {
        Ok(callee) => callee,
        Err((leg, e)) => {
            warn!(call_id = %call.id, "unable to bridge callee: {}", e);
            leg.hangup().await;
            bridge.destroy().await;
            return Err(e);
        }
    };
    let hook = spawn_callee_leave_hook(
        call.shared.clone(),
        bridge.clone(),
        call.caller.unique_id(),
        leave_rx,
    );
    info!(call_id = %call.id, callee = %callee.name, bridge = %bridge.id(), "conversation");

    let conversed = converse(call, &bridge, &callee).await;

    if call.shared.lock().final_disposition().is_none() {
        let disposition = call.shared.lock().resolve_final_disposition(Instant::now());
        debug!(call_id = %call.id, %disposition, "final disposition");
    }
    cleanup(call, &bridge, hook).await;
    conversed
}

async fn converse(call: &CoinCall, bridge: &BridgeRef, callee: &BridgedLeg) -> Result<()> {
    let options = &call.options;
    let reserve = call.config().period_reserve_secs;
    let timed = options.initial_period > 0 && !options.flags.feature_group_c;

    if !timed {
        let outcome = join_with_timeout(call, bridge, Duration::ZERO, false).await?;
        if outcome == JoinOutcome::TimerExpired {
            error!(call_id = %call.id, "untimed bridge ended by its timer");
            return Err(anyhow::anyhow!("untimed bridge ended by its timer"));
        }
        return Ok(());
    }

    call.shared.lock().expires_at =
        Some(Instant::now() + Duration::from_secs(u64::from(options.initial_period)));
    let budget = period_budget(options.initial_period, reserve);
    let mut outcome = join_with_timeout(call, bridge, budget, false).await?;

    while outcome == JoinOutcome::TimerExpired {
        match get_overtime_deposit(call, bridge).await? {
            OvertimeOutcome::Deposited => {
                let budget = if options.overtime_period > 0 {
                    call.shared.lock().expires_at = Some(
                        Instant::now() + Duration::from_secs(u64::from(options.overtime_period)),
                    );
                    period_budget(options.overtime_period, reserve)
                } else {
                    call.shared.lock().expires_at = None;
                    Duration::ZERO
                };
                outcome = join_with_timeout(call, bridge, budget, true).await?;
            }
            OvertimeOutcome::Missing => {
                info!(call_id = %call.id, "overtime not paid, disconnecting far end");
                call.shared.lock().settle_overtime_shortfall();
                callee.soft_hangup();
                break;
            }
            OvertimeOutcome::Disconnected => break,
        }
    }
    if outcome.is_disconnect() {
        debug!(call_id = %call.id, ?outcome, "conversation ended");
    }
    Ok(())
}

async fn cleanup(call: &CoinCall, bridge: &BridgeRef, hook: JoinHandle<()>) {
    call.shared.mark_caller_disconnected();
    bridge.destroy().await;
    let hook_wait = call.config().hook_wait();
    match timeout(hook_wait, hook).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!(call_id = %call.id, "leave hook failed: {}", e),
        Err(_) => warn!(
            call_id = %call.id,
            "leave hook still pending after {:?}",
            hook_wait
        ),
    }
}

/// Settle the outcome and publish it on the caller channel.
fn finish(call: &CoinCall) -> CallSummary {
    let caller = &call.caller;
    let caller_gone = caller.is_hungup();
    let (result, end_reason, final_disposition, answered) = {
        let mut state = call.shared.lock();
        // every path leaves both fields set
        state.set_result(if caller_gone {
            CallResult::CallerHangup
        } else {
            CallResult::Failure
        });
        let final_disposition = match state.final_disposition() {
            Some(disposition) => disposition,
            None => state.resolve_final_disposition(Instant::now()),
        };
        (
            state.result().unwrap_or(CallResult::Failure),
            state.end_reason().unwrap_or(CallResult::Failure),
            final_disposition,
            state.is_answered(),
        )
    };

    caller.set_var(VAR_RESULT, result.as_str());
    caller.set_var(VAR_REASON, end_reason.as_str());
    caller.set_var(VAR_FINAL_DISPOSITION, final_disposition.as_str());

    if answered && call.shared.hopper() > 0 {
        if caller_gone {
            // the switch collects on disconnect
            call.shared.lock().collect_hopper();
        } else {
            call.signal(Disposition::Collect);
        }
    }
    let collected = call.shared.collected();
    caller.set_var(VAR_COLLECTED, &collected.to_string());
    info!(
        call_id = %call.id,
        %result,
        %end_reason,
        %final_disposition,
        collected,
        "coin call finished"
    );

    let event = CoinEvent::CallEnd {
        channel: caller.name(),
        unique_id: caller.unique_id(),
        result,
        end_reason,
        final_disposition,
        collected,
        timestamp: crate::get_timestamp(),
    };
    if let Err(e) = call.publisher().publish(event) {
        debug!(call_id = %call.id, "call end not published: {}", e);
    }

    CallSummary {
        call_id: call.id.clone(),
        result,
        end_reason,
        final_disposition,
        collected,
        answered,
    }
}
