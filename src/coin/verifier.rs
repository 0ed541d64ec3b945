use super::wait::sleep_or_hangup;
use super::{CoinCall, CoinError, Disposition};
use anyhow::Result;
use tracing::{debug, info};

/// Controller reply to a ground or stuck-coin test.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Verification {
    pub value: u32,
}

impl Verification {
    /// Coins were detected in the hopper.
    pub fn is_positive(&self) -> bool {
        self.value > 0
    }
}

fn parse_reply(value: &str) -> Option<u32> {
    // negative or garbage means the controller has not answered yet
    value.trim().parse::<u32>().ok()
}

/// Issue a test disposition and wait for the controller to report the
/// result in `variable`.
///
/// The variable is checked after each poll interval, so a reply written
/// during interval k is seen at the end of that interval.
pub async fn request_and_wait(
    call: &CoinCall,
    disposition: Disposition,
    variable: &str,
) -> Result<Verification> {
    let config = call.config();
    call.caller.clear_var(variable);
    call.signal(disposition);

    let interval = config.poll_interval();
    for attempt in 0..config.poll_attempts {
        sleep_or_hangup(call.caller.as_ref(), interval).await?;
        if let Some(value) = call.caller.get_var(variable).as_deref().and_then(parse_reply) {
            info!(
                call_id = %call.id,
                %disposition,
                value,
                attempt,
                "coin controller replied"
            );
            return Ok(Verification { value });
        }
    }
    debug!(call_id = %call.id, %disposition, variable, "coin controller did not reply");
    Err(CoinError::VerificationTimeout {
        variable: variable.to_string(),
        waited: interval * config.poll_attempts,
    }
    .into())
}

pub async fn ground_test(call: &CoinCall) -> Result<Verification> {
    let variable = call.config().ground_result_var.clone();
    request_and_wait(call, Disposition::GroundTest, &variable).await
}

pub async fn stuck_coin_test(call: &CoinCall) -> Result<Verification> {
    let variable = call.config().stuck_result_var.clone();
    request_and_wait(call, Disposition::StuckCoinTest, &variable).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coin::{CoinCallRegistry, CoinOptions, CoinServices};
    use crate::config::CoinConfig;
    use crate::event::MockEventPublisher;
    use crate::host::memory::{MemoryChannel, MemoryHost};
    use crate::host::Channel;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::time::{sleep, Instant};

    fn call_on(chan: Arc<MemoryChannel>) -> CoinCall {
        let config = CoinConfig::default();
        let mut publisher = MockEventPublisher::new();
        publisher.expect_publish().returning(|_| Ok(()));
        let services = CoinServices {
            host: Arc::new(MemoryHost::new()),
            publisher: Arc::new(publisher),
            registry: Arc::new(CoinCallRegistry::new()),
            config: Arc::new(config.clone()),
        };
        let options = CoinOptions::parse("SIP/1000", &config).unwrap();
        CoinCall::new(chan, options, services)
    }

    fn reply_after(chan: &Arc<MemoryChannel>, variable: &'static str, after: Duration, value: &'static str) {
        let chan = chan.clone();
        tokio::spawn(async move {
            sleep(after).await;
            chan.set_var(variable, value);
        });
    }

    #[test]
    fn test_parse_reply() {
        assert_eq!(parse_reply("0"), Some(0));
        assert_eq!(parse_reply(" 25 "), Some(25));
        assert_eq!(parse_reply("-1"), None);
        assert_eq!(parse_reply("yes"), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reply_seen_at_end_of_interval() {
        for k in 0..10u64 {
            let chan = Arc::new(MemoryChannel::new("DAHDI/1-1"));
            let call = call_on(chan.clone());
            reply_after(&chan, "COIN_GROUND_RESULT", Duration::from_millis(k * 100 + 50), "1");
            let start = Instant::now();
            let verification = ground_test(&call).await.unwrap();
            assert!(verification.is_positive());
            assert_eq!(start.elapsed(), Duration::from_millis((k + 1) * 100), "k={}", k);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_reply_is_cleared() {
        let chan = Arc::new(MemoryChannel::new("DAHDI/1-1").with_var("COIN_STUCK_RESULT", "3"));
        let call = call_on(chan.clone());
        reply_after(&chan, "COIN_STUCK_RESULT", Duration::from_millis(250), "0");
        let start = Instant::now();
        let verification = stuck_coin_test(&call).await.unwrap();
        assert_eq!(verification.value, 0);
        assert!(!verification.is_positive());
        assert_eq!(start.elapsed(), Duration::from_millis(300));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_after_all_polls() {
        let chan = Arc::new(MemoryChannel::new("DAHDI/1-1"));
        let call = call_on(chan.clone());
        reply_after(&chan, "COIN_GROUND_RESULT", Duration::from_millis(1050), "1");
        let start = Instant::now();
        let err = ground_test(&call).await.unwrap_err();
        assert_eq!(start.elapsed(), Duration::from_millis(1000));
        match err.downcast_ref::<CoinError>() {
            Some(CoinError::VerificationTimeout { variable, waited }) => {
                assert_eq!(variable, "COIN_GROUND_RESULT");
                assert_eq!(*waited, Duration::from_secs(1));
            }
            other => panic!("unexpected error {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_negative_values_ignored() {
        let chan = Arc::new(MemoryChannel::new("DAHDI/1-1"));
        let call = call_on(chan.clone());
        reply_after(&chan, "COIN_GROUND_RESULT", Duration::from_millis(50), "-1");
        reply_after(&chan, "COIN_GROUND_RESULT", Duration::from_millis(450), "2");
        let start = Instant::now();
        let verification = ground_test(&call).await.unwrap();
        assert_eq!(verification.value, 2);
        assert_eq!(start.elapsed(), Duration::from_millis(500));
    }

    #[tokio::test(start_paused = true)]
    async fn test_hangup_ends_wait() {
        let chan = Arc::new(MemoryChannel::new("DAHDI/1-1"));
        let call = call_on(chan.clone());
        let hangup = chan.clone();
        tokio::spawn(async move {
            sleep(Duration::from_millis(250)).await;
            hangup.hangup().await;
        });
        let err = ground_test(&call).await.unwrap_err();
        assert!(CoinError::is_hangup(&err));
    }
}
