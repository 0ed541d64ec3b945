use super::verifier::stuck_coin_test;
use super::wait::{sleep_or_hangup, IntervalTimer};
use super::{CallResult, CoinCall, CoinCallShared, CoinError, Disposition};
use crate::host::{
    BridgeRef, ChannelRef, HostRef, ImpartOptions, JoinOptions, LeaveCause, LeaveEvent,
};
use anyhow::Result;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinOutcome {
    /// Caller was already gone, nothing joined.
    CallerGone,
    /// Callee was already gone, nothing joined.
    CalleeGone,
    TimerExpired,
    CallerHangup,
    /// The callee leave hook pulled the caller out.
    CalleeLeft,
    Removed,
}

impl JoinOutcome {
    pub fn is_disconnect(&self) -> bool {
        !matches!(self, JoinOutcome::TimerExpired | JoinOutcome::Removed)
    }
}

fn mark_caller_hangup(call: &CoinCall) {
    let mut state = call.shared.lock();
    state.caller_disconnected = true;
    state.set_result(CallResult::CallerHangup);
}

/// Put the caller in the bridge until it leaves, or until `timeout` runs
/// out when non-zero.
pub async fn join_with_timeout(
    call: &CoinCall,
    bridge: &BridgeRef,
    timeout: Duration,
    is_overtime: bool,
) -> Result<JoinOutcome> {
    {
        let state = call.shared.lock();
        if state.caller_disconnected {
            return Ok(JoinOutcome::CallerGone);
        }
        if state.callee_disconnected {
            return Ok(JoinOutcome::CalleeGone);
        }
    }
    if call.caller.is_hungup() {
        mark_caller_hangup(call);
        return Ok(JoinOutcome::CallerGone);
    }

    let timer = if timeout.is_zero() {
        None
    } else {
        Some(IntervalTimer::arm(
            bridge.clone(),
            call.caller.unique_id(),
            timeout,
        ))
    };
    debug!(call_id = %call.id, ?timeout, is_overtime, "joining caller to bridge");
    let joined = bridge
        .join(
            call.caller.clone(),
            JoinOptions {
                dtmf_passthrough: true,
            },
        )
        .await;
    let fired = match timer {
        Some(timer) => timer.disarm().await,
        None => false,
    };
    let cause = joined?;

    if cause == LeaveCause::Hangup || call.caller.is_hungup() {
        info!(call_id = %call.id, "caller hung up in bridge");
        mark_caller_hangup(call);
        return Ok(JoinOutcome::CallerHangup);
    }
    if call.shared.lock().callee_disconnected {
        return Ok(JoinOutcome::CalleeLeft);
    }
    if fired {
        return Ok(JoinOutcome::TimerExpired);
    }
    debug!(call_id = %call.id, ?cause, "caller left bridge");
    Ok(JoinOutcome::Removed)
}

/// Watch for the callee leaving the bridge.
///
/// When the callee goes first the call is over: the result becomes
/// CALLEE_HANGUP and the caller is taken out of the bridge.
pub fn spawn_callee_leave_hook(
    shared: CoinCallShared,
    bridge: BridgeRef,
    caller_id: String,
    leave_rx: oneshot::Receiver<LeaveEvent>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let cause = match leave_rx.await {
            Ok(event) => event.cause,
            Err(_) => {
                debug!("callee never entered the bridge");
                return;
            }
        };
        let remove_caller = {
            let mut state = shared.lock();
            state.callee_disconnected = true;
            if state.caller_disconnected {
                false
            } else {
                state.set_result(CallResult::CalleeHangup);
                true
            }
        };
        debug!(?cause, remove_caller, "callee left bridge");
        if remove_caller {
            if let Err(e) = bridge.remove(&caller_id).await {
                debug!("caller not in bridge: {}", e);
            }
        }
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OvertimeOutcome {
    Deposited,
    Missing,
    Disconnected,
}

/// Prompt channel playing the overtime announcement into the bridge.
struct Announcement {
    chan: ChannelRef,
    stop: CancellationToken,
    task: JoinHandle<()>,
}

impl Announcement {
    async fn start(call: &CoinCall, bridge: &BridgeRef) -> Result<Self> {
        let host = call.services.host.clone();
        let chan = host.alloc_announcer(&call.caller).await?;
        let options = ImpartOptions {
            immovable: true,
            solo_listener: true,
            ..Default::default()
        };
        if let Err(e) = bridge.impart(chan.clone(), options).await {
            chan.hangup().await;
            return Err(e);
        }
        let stop = CancellationToken::new();
        let task = tokio::spawn(play_then_idle(
            host,
            chan.clone(),
            call.options.announcement.clone(),
            stop.clone(),
        ));
        info!(call_id = %call.id, channel = %chan.name(), "overtime announcement started");
        Ok(Self { chan, stop, task })
    }

    async fn stop(self, bridge: &BridgeRef) {
        self.stop.cancel();
        self.chan.soft_hangup();
        if let Err(e) = bridge.remove(&self.chan.unique_id()).await {
            debug!(channel = %self.chan.name(), "announcer already out of bridge: {}", e);
        }
        if let Err(e) = self.task.await {
            warn!(channel = %self.chan.name(), "announcement task failed: {}", e);
        }
    }
}

async fn play_then_idle(host: HostRef, chan: ChannelRef, media: String, stop: CancellationToken) {
    tokio::select! {
        _ = stop.cancelled() => return,
        played = host.play(&chan, &media) => {
            if let Err(e) = played {
                debug!(channel = %chan.name(), %media, "announcement not played: {}", e);
            }
        }
    }
    // keep reading so the channel stays serviced until stopped
    loop {
        tokio::select! {
            _ = stop.cancelled() => break,
            frame = chan.read() => {
                if frame.is_none() {
                    break;
                }
            }
        }
    }
}

/// Run a stuck-coin test, mapping a caller hangup to `None`.
async fn test_for_coin(call: &CoinCall) -> Result<Option<bool>> {
    match stuck_coin_test(call).await {
        Ok(verification) => Ok(Some(verification.is_positive())),
        Err(e) if CoinError::is_hangup(&e) => {
            mark_caller_hangup(call);
            Ok(None)
        }
        Err(e) => Err(e),
    }
}

/// Polarity reversal resetting the totalizer. A line already in operator
/// mode is released and attached again so it stays in operator mode.
async fn reverse_polarity(call: &CoinCall) -> Result<(), CoinError> {
    let (first, second) = if call.shared.lock().attached {
        (Disposition::OperatorRelease, Disposition::OperatorAttach)
    } else {
        (Disposition::OperatorAttach, Disposition::OperatorRelease)
    };
    call.signal(first);
    let paused = sleep_or_hangup(call.caller.as_ref(), call.config().reversal_pause()).await;
    call.signal(second);
    paused
}

/// Collect the period that just ended and ask the caller for the next one.
pub async fn get_overtime_deposit(call: &CoinCall, bridge: &BridgeRef) -> Result<OvertimeOutcome> {
    let config = call.config();
    call.signal(Disposition::Collect);

    let outcome = join_with_timeout(call, bridge, config.prompt_window(), true).await?;
    if outcome != JoinOutcome::TimerExpired {
        debug!(call_id = %call.id, ?outcome, "pre-prompt window ended early");
        return Ok(OvertimeOutcome::Disconnected);
    }

    if reverse_polarity(call).await.is_err() {
        mark_caller_hangup(call);
        return Ok(OvertimeOutcome::Disconnected);
    }
    match test_for_coin(call).await? {
        Some(true) => return Ok(credit_overtime(call)),
        Some(false) => {}
        None => return Ok(OvertimeOutcome::Disconnected),
    }

    let announcement = match Announcement::start(call, bridge).await {
        Ok(announcement) => Some(announcement),
        Err(e) => {
            warn!(call_id = %call.id, "unable to start overtime announcement: {}", e);
            None
        }
    };
    let outcome = deposit_window(call, bridge).await;
    if let Some(announcement) = announcement {
        announcement.stop(bridge).await;
    }
    outcome
}

async fn deposit_window(call: &CoinCall, bridge: &BridgeRef) -> Result<OvertimeOutcome> {
    let outcome = join_with_timeout(call, bridge, call.config().prompt_window(), true).await?;
    if outcome != JoinOutcome::TimerExpired {
        debug!(call_id = %call.id, ?outcome, "deposit window ended early");
        return Ok(OvertimeOutcome::Disconnected);
    }
    match test_for_coin(call).await? {
        Some(true) => Ok(credit_overtime(call)),
        Some(false) => {
            info!(call_id = %call.id, "no overtime deposit");
            Ok(OvertimeOutcome::Missing)
        }
        None => Ok(OvertimeOutcome::Disconnected),
    }
}

fn credit_overtime(call: &CoinCall) -> OvertimeOutcome {
    let charge = call.config().overtime_charge_cents;
    call.shared.lock().credit(charge);
    info!(call_id = %call.id, charge, "overtime deposit");
    OvertimeOutcome::Deposited
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coin::tests::common::TestRig;
    use crate::host::memory::MemoryChannel;
    use crate::host::{BridgeKind, BridgeOptions, Channel, Host};
    use tokio::time::{sleep, Instant};

    fn bridge(rig: &TestRig) -> BridgeRef {
        rig.host
            .create_bridge(BridgeOptions {
                name: "session".to_string(),
                kind: BridgeKind::MultiMix,
                internal_sample_rate: 8000,
                maximum_sample_rate: 8000,
                mixing_interval: Duration::from_millis(20),
                transfer_prohibited: true,
            })
            .unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_join_fast_fails_on_disconnected_leg() {
        let rig = TestRig::new();
        let call = rig.call("SIP/1000");
        let bridge = bridge(&rig);
        call.shared.lock().callee_disconnected = true;
        let outcome = join_with_timeout(&call, &bridge, Duration::ZERO, false)
            .await
            .unwrap();
        assert_eq!(outcome, JoinOutcome::CalleeGone);
        call.shared.mark_caller_disconnected();
        let outcome = join_with_timeout(&call, &bridge, Duration::ZERO, false)
            .await
            .unwrap();
        assert_eq!(outcome, JoinOutcome::CallerGone);
        assert!(bridge.participants().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_join_timer_expires() {
        let rig = TestRig::new();
        let call = rig.call("SIP/1000");
        let bridge = bridge(&rig);
        let start = Instant::now();
        let outcome = join_with_timeout(&call, &bridge, Duration::from_secs(30), false)
            .await
            .unwrap();
        assert_eq!(outcome, JoinOutcome::TimerExpired);
        assert_eq!(start.elapsed(), Duration::from_secs(30));
        assert!(call.shared.lock().result().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_caller_hangup_in_bridge_keeps_earlier_result() {
        let rig = TestRig::new();
        let call = rig.call("SIP/1000");
        let bridge = bridge(&rig);
        call.shared.set_result(CallResult::CalleeHangup);
        let caller = rig.caller.clone();
        tokio::spawn(async move {
            sleep(Duration::from_secs(5)).await;
            caller.hangup().await;
        });
        let outcome = join_with_timeout(&call, &bridge, Duration::from_secs(30), false)
            .await
            .unwrap();
        assert_eq!(outcome, JoinOutcome::CallerHangup);
        let state = call.shared.lock();
        assert!(state.caller_disconnected);
        assert_eq!(state.result(), Some(CallResult::CalleeHangup));
    }

    #[tokio::test(start_paused = true)]
    async fn test_leave_hook_removes_caller() {
        let rig = TestRig::new();
        let call = rig.call("SIP/1000");
        let bridge = bridge(&rig);
        let callee: ChannelRef = rig.host.adopt(MemoryChannel::new("SIP/far"));
        let (tx, rx) = oneshot::channel();
        let hook = spawn_callee_leave_hook(
            call.shared.clone(),
            bridge.clone(),
            call.caller.unique_id(),
            rx,
        );
        bridge
            .impart(
                callee.clone(),
                ImpartOptions {
                    leave_notify: Some(tx),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        tokio::spawn(async move {
            sleep(Duration::from_secs(10)).await;
            callee.soft_hangup();
        });
        let outcome = join_with_timeout(&call, &bridge, Duration::ZERO, false)
            .await
            .unwrap();
        assert_eq!(outcome, JoinOutcome::CalleeLeft);
        hook.await.unwrap();
        let state = call.shared.lock();
        assert!(state.callee_disconnected);
        assert_eq!(state.result(), Some(CallResult::CalleeHangup));
    }

    #[tokio::test(start_paused = true)]
    async fn test_leave_hook_after_caller_left() {
        let rig = TestRig::new();
        let call = rig.call("SIP/1000");
        let bridge = bridge(&rig);
        let (tx, rx) = oneshot::channel();
        let hook = spawn_callee_leave_hook(
            call.shared.clone(),
            bridge.clone(),
            call.caller.unique_id(),
            rx,
        );
        call.shared.mark_caller_disconnected();
        tx.send(LeaveEvent {
            unique_id: "far".to_string(),
            cause: LeaveCause::BridgeDestroyed,
        })
        .unwrap();
        hook.await.unwrap();
        let state = call.shared.lock();
        assert!(state.callee_disconnected);
        assert!(state.result().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_leave_hook_ignores_dropped_notification() {
        let rig = TestRig::new();
        let call = rig.call("SIP/1000");
        let bridge = bridge(&rig);
        let (tx, rx) = oneshot::channel::<LeaveEvent>();
        let hook = spawn_callee_leave_hook(
            call.shared.clone(),
            bridge.clone(),
            call.caller.unique_id(),
            rx,
        );
        drop(tx);
        hook.await.unwrap();
        let state = call.shared.lock();
        assert!(!state.callee_disconnected);
        assert!(state.result().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_callee_gone_wins_over_expired_timer() {
        let rig = TestRig::new();
        let call = rig.call("SIP/1000,60,,60");
        let bridge = bridge(&rig);
        let shared = call.shared.clone();
        tokio::spawn(async move {
            sleep(Duration::from_secs(10)).await;
            shared.lock().callee_disconnected = true;
        });
        let outcome = join_with_timeout(&call, &bridge, Duration::from_secs(30), false)
            .await
            .unwrap();
        assert_eq!(outcome, JoinOutcome::CalleeLeft);
        assert!(outcome.is_disconnect());
    }

    #[tokio::test(start_paused = true)]
    async fn test_overtime_deposit_found_first_test() {
        let rig = TestRig::new();
        rig.controller.stuck_replies(&["1"]);
        let call = rig.call("SIP/1000,60,,60");
        let bridge = bridge(&rig);
        let start = Instant::now();
        let outcome = get_overtime_deposit(&call, &bridge).await.unwrap();
        assert_eq!(outcome, OvertimeOutcome::Deposited);
        assert!(start.elapsed() >= Duration::from_millis(30_600));
        assert!(start.elapsed() < Duration::from_secs(32));
        assert_eq!(call.shared.hopper(), 5);
        assert!(!call.shared.lock().attached);
        assert!(rig.host.played().is_empty());
        assert_eq!(
            rig.controller.dispositions(),
            vec![
                Disposition::Collect,
                Disposition::OperatorAttach,
                Disposition::OperatorRelease,
                Disposition::StuckCoinTest,
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_overtime_announcement_then_missing() {
        let rig = TestRig::new();
        rig.controller.stuck_replies(&["0", "0"]);
        let call = rig.call("SIP/1000,60,,60,coin-deposit-now");
        let bridge = bridge(&rig);
        let outcome = get_overtime_deposit(&call, &bridge).await.unwrap();
        assert_eq!(outcome, OvertimeOutcome::Missing);
        assert_eq!(rig.host.played(), vec!["coin-deposit-now".to_string()]);
        let announcer = rig
            .host
            .channels()
            .into_iter()
            .find(|c| c.name().starts_with("Announcer/"))
            .expect("announcer allocated");
        assert!(announcer.is_hungup());
        sleep(Duration::from_millis(10)).await;
        assert!(bridge.participants().is_empty());
        let bridge = rig.host.bridges().pop().unwrap();
        assert!(bridge.history().iter().any(|record| matches!(
            record,
            crate::host::memory::BridgeRecord::Imparted {
                immovable: true,
                solo_listener: true,
                ..
            }
        )));
    }

    #[tokio::test(start_paused = true)]
    async fn test_overtime_reversal_keeps_operator_mode() {
        let rig = TestRig::new();
        rig.controller.stuck_replies(&["1"]);
        let call = rig.call("SIP/1000,60,,60,,a");
        call.signal(Disposition::OperatorAttach);
        let bridge = bridge(&rig);
        let outcome = get_overtime_deposit(&call, &bridge).await.unwrap();
        assert_eq!(outcome, OvertimeOutcome::Deposited);
        assert!(call.shared.lock().attached);
    }

    #[tokio::test(start_paused = true)]
    async fn test_overtime_caller_hangup_in_window() {
        let rig = TestRig::new();
        let call = rig.call("SIP/1000,60,,60");
        let bridge = bridge(&rig);
        let caller = rig.caller.clone();
        tokio::spawn(async move {
            sleep(Duration::from_secs(10)).await;
            caller.hangup().await;
        });
        let outcome = get_overtime_deposit(&call, &bridge).await.unwrap();
        assert_eq!(outcome, OvertimeOutcome::Disconnected);
        assert_eq!(call.shared.lock().result(), Some(CallResult::CallerHangup));
    }
}
