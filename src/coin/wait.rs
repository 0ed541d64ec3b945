use super::CoinError;
use crate::host::{BridgeRef, Channel};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Sleep for `duration`, returning early with [`CoinError::Hangup`] when
/// the channel hangs up.
pub async fn sleep_or_hangup(channel: &dyn Channel, duration: Duration) -> Result<(), CoinError> {
    let hangup = channel.cancel_token();
    tokio::select! {
        _ = hangup.cancelled() => Err(CoinError::Hangup(channel.name())),
        _ = sleep(duration) => Ok(()),
    }
}

/// Removes a participant from a bridge when its period runs out.
///
/// Must be disarmed once the participant has left the bridge, otherwise a
/// later join by the same channel could be cut short.
pub struct IntervalTimer {
    token: CancellationToken,
    fired: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

impl IntervalTimer {
    pub fn arm(bridge: BridgeRef, unique_id: String, after: Duration) -> Self {
        let token = CancellationToken::new();
        let fired = Arc::new(AtomicBool::new(false));
        let handle = {
            let token = token.clone();
            let fired = fired.clone();
            tokio::spawn(async move {
                tokio::select! {
                    _ = token.cancelled() => {}
                    _ = sleep(after) => {
                        fired.store(true, Ordering::SeqCst);
                        if let Err(e) = bridge.remove(&unique_id).await {
                            debug!(%unique_id, "interval timer found nothing to remove: {}", e);
                        }
                    }
                }
            })
        };
        Self {
            token,
            fired,
            handle,
        }
    }

    /// Stop the timer and report whether it had already fired.
    pub async fn disarm(self) -> bool {
        self.token.cancel();
        self.handle.await.ok();
        self.fired.load(Ordering::SeqCst)
    }
}
