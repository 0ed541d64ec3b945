//! Runs a coin call against the in-memory host with a scripted far end
//! and a scripted coin controller.

use crate::coin::{CallSummary, CoinCallApp, CoinCallRegistry, CoinServices, Disposition};
use crate::config::{CoinConfig, Config};
use crate::event::{BroadcastPublisher, CoinEvent, EventReceiver};
use crate::host::memory::{FarEndAction, MemoryChannel, MemoryHost, ScriptStep};
use crate::host::Channel;
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::time::sleep;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SimulateConfig {
    /// Application arguments, e.g. `SIP/5551212,60,25,60`.
    pub args: String,
    pub caller_name: String,
    pub caller_number: String,
    /// Far end behavior once the outgoing call is placed.
    pub far_end: Vec<ScriptStep>,
    /// Controller replies to ground tests, consumed in order.
    pub ground_replies: Vec<String>,
    /// Controller replies to stuck-coin tests, consumed in order.
    pub stuck_replies: Vec<String>,
    pub reply_delay_ms: u64,
    /// Hang the caller up this long after the call starts.
    pub caller_hangup_after_secs: Option<u64>,
    pub announcement_secs: u64,
}

impl Default for SimulateConfig {
    fn default() -> Self {
        Self {
            args: "SIP/5551212,60,25,60".to_string(),
            caller_name: "DAHDI/1-1".to_string(),
            caller_number: "5551234".to_string(),
            far_end: vec![
                ScriptStep::new(500, FarEndAction::Ringing),
                ScriptStep::new(3000, FarEndAction::Answer),
                ScriptStep::new(180_000, FarEndAction::Hangup),
            ],
            ground_replies: vec!["1".to_string()],
            stuck_replies: vec!["1".to_string(), "0".to_string(), "0".to_string()],
            reply_delay_ms: 250,
            caller_hangup_after_secs: None,
            announcement_secs: 5,
        }
    }
}

#[derive(Default)]
struct ControllerState {
    ground: VecDeque<String>,
    stuck: VecDeque<String>,
    events: Vec<CoinEvent>,
}

/// Stand-in for the external coin controller: answers test dispositions
/// by setting the reply variable on the channel after a delay.
#[derive(Clone)]
pub struct ScriptedController {
    state: Arc<Mutex<ControllerState>>,
}

impl ScriptedController {
    pub fn spawn(
        host: Arc<MemoryHost>,
        mut events: EventReceiver,
        config: &CoinConfig,
        reply_delay: Duration,
    ) -> Self {
        let controller = Self {
            state: Arc::new(Mutex::new(ControllerState::default())),
        };
        let state = controller.state.clone();
        let ground_var = config.ground_result_var.clone();
        let stuck_var = config.stuck_result_var.clone();
        tokio::spawn(async move {
            loop {
                let event = match events.recv().await {
                    Ok(event) => event,
                    Err(RecvError::Lagged(n)) => {
                        warn!(skipped = n, "controller lagging behind events");
                        continue;
                    }
                    Err(RecvError::Closed) => break,
                };
                let reply = {
                    let mut state = state.lock().unwrap();
                    state.events.push(event.clone());
                    match &event {
                        CoinEvent::Disposition {
                            disposition: Disposition::GroundTest,
                            ..
                        } => state.ground.pop_front().map(|v| (ground_var.clone(), v)),
                        CoinEvent::Disposition {
                            disposition: Disposition::StuckCoinTest,
                            ..
                        } => state.stuck.pop_front().map(|v| (stuck_var.clone(), v)),
                        _ => None,
                    }
                };
                let Some((variable, value)) = reply else {
                    continue;
                };
                let Some(chan) = host.channel(event.unique_id()) else {
                    debug!(unique_id = event.unique_id(), "no channel for reply");
                    continue;
                };
                tokio::spawn(async move {
                    sleep(reply_delay).await;
                    debug!(channel = %chan.name(), %variable, %value, "controller reply");
                    chan.set_var(&variable, &value);
                });
            }
        });
        controller
    }

    pub fn ground_replies<S: AsRef<str>>(&self, replies: &[S]) {
        let mut state = self.state.lock().unwrap();
        state.ground.extend(replies.iter().map(|r| r.as_ref().to_string()));
    }

    pub fn stuck_replies<S: AsRef<str>>(&self, replies: &[S]) {
        let mut state = self.state.lock().unwrap();
        state.stuck.extend(replies.iter().map(|r| r.as_ref().to_string()));
    }

    pub fn events(&self) -> Vec<CoinEvent> {
        self.state.lock().unwrap().events.clone()
    }

    pub fn dispositions(&self) -> Vec<Disposition> {
        self.events()
            .into_iter()
            .filter_map(|event| match event {
                CoinEvent::Disposition { disposition, .. } => Some(disposition),
                _ => None,
            })
            .collect()
    }
}

/// Play the configured scenario through a [`CoinCallApp`].
pub async fn run_simulation(config: &Config) -> Result<CallSummary> {
    let scenario = config.simulate.clone().unwrap_or_default();
    let coin_config = Arc::new(config.coin.clone());

    let host = Arc::new(
        MemoryHost::new().with_play_duration(Duration::from_secs(scenario.announcement_secs)),
    );
    let publisher = Arc::new(BroadcastPublisher::new(64));
    let controller = ScriptedController::spawn(
        host.clone(),
        publisher.subscribe(),
        &coin_config,
        Duration::from_millis(scenario.reply_delay_ms),
    );
    controller.ground_replies(&scenario.ground_replies);
    controller.stuck_replies(&scenario.stuck_replies);

    let app = CoinCallApp::new(CoinServices {
        host: host.clone(),
        publisher,
        registry: Arc::new(CoinCallRegistry::new()),
        config: coin_config,
    });
    let caller = host.adopt(
        MemoryChannel::new(scenario.caller_name.clone())
            .with_caller_id(&scenario.caller_number, "PAYPHONE"),
    );
    if let Some((_, resource)) = scenario.args.split(',').next().and_then(|t| t.split_once('/')) {
        host.add_route(resource, scenario.far_end.clone());
    }
    if let Some(after) = scenario.caller_hangup_after_secs {
        let caller = caller.clone();
        tokio::spawn(async move {
            sleep(Duration::from_secs(after)).await;
            info!(channel = %caller.name(), "caller hangs up");
            caller.hangup().await;
        });
    }

    info!(args = %scenario.args, "simulating coin call");
    let summary = app.exec(caller.clone(), &scenario.args).await;
    for (name, value) in caller.vars() {
        info!(channel = %caller.name(), "{}={}", name, value);
    }
    info!(dispositions = ?controller.dispositions(), "controller saw");
    summary
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coin::{CallResult, FinalDisposition};

    #[tokio::test(start_paused = true)]
    async fn test_default_scenario() {
        let config = Config::default();
        let summary = run_simulation(&config).await.unwrap();
        assert_eq!(summary.result, CallResult::None);
        assert_eq!(summary.end_reason, CallResult::OvertimeDepositRequired);
        assert_eq!(summary.final_disposition, FinalDisposition::Return);
        assert_eq!(summary.collected, 30);
        assert!(summary.answered);
    }

    #[tokio::test(start_paused = true)]
    async fn test_scenario_from_toml() {
        let config: Config = toml::from_str(
            r#"
[simulate]
args = "SIP/5550000,,,,"
ground_replies = []
far_end = [
    { after_ms = 200, action = "ringing" },
    { after_ms = 1000, action = "busy" },
]
"#,
        )
        .unwrap();
        let summary = run_simulation(&config).await.unwrap();
        assert_eq!(summary.result, CallResult::Busy);
        assert_eq!(summary.final_disposition, FinalDisposition::Return);
        assert!(!summary.answered);
    }
}
