use super::CoinCallShared;
use crate::event::{CoinEvent, EventPublisher};
use crate::host::Channel;
use anyhow::Result;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Control signal for the coin-control hardware.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Disposition {
    Collect,
    Return,
    GroundTest,
    StuckCoinTest,
    OperatorAttach,
    OperatorRelease,
}

impl Disposition {
    pub fn as_str(&self) -> &'static str {
        match self {
            Disposition::Collect => "COLLECT",
            Disposition::Return => "RETURN",
            Disposition::GroundTest => "GROUND_TEST",
            Disposition::StuckCoinTest => "STUCK_COIN_TEST",
            Disposition::OperatorAttach => "OPERATOR_ATTACH",
            Disposition::OperatorRelease => "OPERATOR_RELEASE",
        }
    }
}

impl std::fmt::Display for Disposition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Apply a disposition to the call's accounting and publish it.
///
/// A return or a test leaves the hopper contents to the hardware, so the
/// hopper is emptied either way. Operator attach/release must alternate;
/// anything else is a bug and panics.
pub fn signal(
    call: Option<&CoinCallShared>,
    channel: &dyn Channel,
    disposition: Disposition,
    publisher: &dyn EventPublisher,
) -> Result<()> {
    if let Some(call) = call {
        let mut state = call.lock();
        match disposition {
            Disposition::Collect => state.collect_hopper(),
            Disposition::Return | Disposition::GroundTest | Disposition::StuckCoinTest => {
                state.return_hopper()
            }
            Disposition::OperatorAttach => state.toggle_attached(true),
            Disposition::OperatorRelease => state.toggle_attached(false),
        }
    }
    debug!(channel = %channel.name(), %disposition, "coin disposition");
    publisher.publish(CoinEvent::disposition(channel, disposition))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::MockEventPublisher;
    use crate::host::memory::MemoryChannel;

    fn accepting_publisher(times: usize) -> MockEventPublisher {
        let mut publisher = MockEventPublisher::new();
        publisher.expect_publish().times(times).returning(|_| Ok(()));
        publisher
    }

    #[test]
    fn test_collect_moves_hopper() {
        let chan = MemoryChannel::new("DAHDI/1-1");
        let call = CoinCallShared::new();
        call.lock().credit(25);
        signal(Some(&call), &chan, Disposition::Collect, &accepting_publisher(1)).unwrap();
        let state = call.lock();
        assert_eq!(state.hopper, 0);
        assert_eq!(state.collected, 25);
    }

    #[test]
    fn test_return_and_tests_clear_hopper() {
        let chan = MemoryChannel::new("DAHDI/1-1");
        let call = CoinCallShared::new();
        let publisher = accepting_publisher(3);
        for disposition in [
            Disposition::Return,
            Disposition::GroundTest,
            Disposition::StuckCoinTest,
        ] {
            call.lock().credit(10);
            signal(Some(&call), &chan, disposition, &publisher).unwrap();
            assert_eq!(call.hopper(), 0);
        }
        let state = call.lock();
        assert_eq!(state.collected, 0);
        assert_eq!(state.returned, 30);
        assert_eq!(state.deposited, 30);
    }

    #[test]
    fn test_ledger_balances_across_signals() {
        let chan = MemoryChannel::new("DAHDI/1-1");
        let call = CoinCallShared::new();
        let publisher = accepting_publisher(3);
        call.lock().credit(25);
        signal(Some(&call), &chan, Disposition::Collect, &publisher).unwrap();
        call.lock().credit(5);
        signal(Some(&call), &chan, Disposition::StuckCoinTest, &publisher).unwrap();
        call.lock().credit(5);
        signal(Some(&call), &chan, Disposition::Collect, &publisher).unwrap();
        let state = call.lock();
        assert_eq!(state.collected + state.hopper, state.deposited - state.returned);
        assert_eq!(state.collected, 30);
        assert_eq!(state.returned, 5);
    }

    #[test]
    fn test_attach_release_alternate() {
        let chan = MemoryChannel::new("DAHDI/1-1");
        let call = CoinCallShared::new();
        let publisher = accepting_publisher(4);
        signal(Some(&call), &chan, Disposition::OperatorAttach, &publisher).unwrap();
        assert!(call.lock().attached);
        signal(Some(&call), &chan, Disposition::OperatorRelease, &publisher).unwrap();
        assert!(!call.lock().attached);
        signal(Some(&call), &chan, Disposition::OperatorAttach, &publisher).unwrap();
        signal(Some(&call), &chan, Disposition::OperatorRelease, &publisher).unwrap();
    }

    #[test]
    #[should_panic(expected = "already attached")]
    fn test_double_attach_panics() {
        let chan = MemoryChannel::new("DAHDI/1-1");
        let call = CoinCallShared::new();
        let publisher = accepting_publisher(1);
        signal(Some(&call), &chan, Disposition::OperatorAttach, &publisher).unwrap();
        let _ = signal(Some(&call), &chan, Disposition::OperatorAttach, &publisher);
    }

    #[test]
    #[should_panic(expected = "not attached")]
    fn test_release_without_attach_panics() {
        let chan = MemoryChannel::new("DAHDI/1-1");
        let call = CoinCallShared::new();
        let publisher = MockEventPublisher::new();
        let _ = signal(Some(&call), &chan, Disposition::OperatorRelease, &publisher);
    }

    #[test]
    fn test_publish_failure_is_reported_after_accounting() {
        let chan = MemoryChannel::new("DAHDI/1-1");
        let call = CoinCallShared::new();
        call.lock().credit(25);
        let mut publisher = MockEventPublisher::new();
        publisher
            .expect_publish()
            .withf(|event| {
                matches!(
                    event,
                    CoinEvent::Disposition {
                        disposition: Disposition::Collect,
                        ..
                    }
                )
            })
            .times(1)
            .returning(|_| Err(anyhow::anyhow!("bus down")));
        assert!(signal(Some(&call), &chan, Disposition::Collect, &publisher).is_err());
        assert_eq!(call.collected(), 25);
    }

    #[test]
    fn test_signal_without_call() {
        let chan = MemoryChannel::new("DAHDI/1-1");
        signal(None, &chan, Disposition::OperatorRelease, &accepting_publisher(1)).unwrap();
    }
}
