use crate::simulate::SimulateConfig;
use anyhow::{Error, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub log_level: Option<String>,
    pub log_file: Option<String>,
    pub coin: CoinConfig,
    pub simulate: Option<SimulateConfig>,
}

/// Timing, charging and variable names used by the coin call controller.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct CoinConfig {
    /// Delay between two polls of a controller reply variable.
    pub poll_interval_ms: u64,
    /// Number of polls before the controller is considered silent.
    pub poll_attempts: u32,
    /// Length of the pre-prompt and post-prompt overtime windows.
    pub prompt_window_secs: u64,
    /// Pause between operator attach and release during a totalizer reset.
    pub reversal_pause_ms: u64,
    /// Charge credited for one overtime period.
    pub overtime_charge_cents: u32,
    /// Largest initial deposit the application accepts.
    pub max_deposit_cents: u32,
    /// Part of every timed period kept back for the overtime windows.
    pub period_reserve_secs: u32,
    /// Smallest accepted non-zero initial or overtime period.
    pub min_period_secs: u32,
    /// Frame wait per iteration of the pre-answer relay loop.
    pub relay_poll_ms: u64,
    /// 0 waits for the far end forever.
    pub answer_timeout_secs: u64,
    /// Upper bound on the wait for the callee leave hook during cleanup.
    pub hook_wait_secs: u64,
    pub ground_result_var: String,
    pub stuck_result_var: String,
    pub default_announcement: String,
    pub bridge_sample_rate: u32,
    pub bridge_mixing_interval_ms: u64,
}

impl Default for CoinConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 100,
            poll_attempts: 10,
            prompt_window_secs: 30,
            reversal_pause_ms: 600,
            overtime_charge_cents: 5,
            max_deposit_cents: 10_000,
            period_reserve_secs: 30,
            min_period_secs: 60,
            relay_poll_ms: 500,
            answer_timeout_secs: 0,
            hook_wait_secs: 5,
            ground_result_var: "COIN_GROUND_RESULT".to_string(),
            stuck_result_var: "COIN_STUCK_RESULT".to_string(),
            default_announcement: "coin-deposit-overtime".to_string(),
            bridge_sample_rate: 8000,
            bridge_mixing_interval_ms: 20,
        }
    }
}

impl CoinConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn prompt_window(&self) -> Duration {
        Duration::from_secs(self.prompt_window_secs)
    }

    pub fn reversal_pause(&self) -> Duration {
        Duration::from_millis(self.reversal_pause_ms)
    }

    pub fn relay_poll(&self) -> Duration {
        Duration::from_millis(self.relay_poll_ms.max(1))
    }

    pub fn answer_timeout(&self) -> Option<Duration> {
        match self.answer_timeout_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        }
    }

    pub fn hook_wait(&self) -> Duration {
        Duration::from_secs(self.hook_wait_secs)
    }

    pub fn validate(&self) -> Result<()> {
        if self.poll_attempts == 0 {
            return Err(anyhow::anyhow!("coin.poll_attempts must be at least 1"));
        }
        // every accepted period must leave time after the reserve is taken off
        if self.min_period_secs <= self.period_reserve_secs {
            return Err(anyhow::anyhow!(
                "coin.min_period_secs ({}) must exceed coin.period_reserve_secs ({})",
                self.min_period_secs,
                self.period_reserve_secs
            ));
        }
        if self.ground_result_var.is_empty() || self.stuck_result_var.is_empty() {
            return Err(anyhow::anyhow!("coin result variable names must not be empty"));
        }
        Ok(())
    }
}

impl Config {
    pub fn load(path: &str) -> Result<Self, Error> {
        let config: Config = toml::from_str(
            &std::fs::read_to_string(path).map_err(|e| anyhow::anyhow!("{}: {}", e, path))?,
        )?;
        config.coin.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_coin_config() {
        let config = CoinConfig::default();
        assert_eq!(config.poll_interval(), Duration::from_millis(100));
        assert_eq!(config.poll_attempts, 10);
        assert_eq!(config.prompt_window(), Duration::from_secs(30));
        assert_eq!(config.overtime_charge_cents, 5);
        assert!(config.answer_timeout().is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_load_partial_config() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
log_level = "debug"

[coin]
prompt_window_secs = 10
ground_result_var = "GROUND"
"#
        )
        .unwrap();
        let config = Config::load(file.path().to_str().unwrap()).unwrap();
        assert_eq!(config.log_level.as_deref(), Some("debug"));
        assert_eq!(config.coin.prompt_window_secs, 10);
        assert_eq!(config.coin.ground_result_var, "GROUND");
        assert_eq!(config.coin.stuck_result_var, "COIN_STUCK_RESULT");
        assert!(config.simulate.is_none());
    }

    #[test]
    fn test_reserve_must_fit_in_min_period() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
[coin]
min_period_secs = 30
period_reserve_secs = 30
"#
        )
        .unwrap();
        let err = Config::load(file.path().to_str().unwrap()).unwrap_err();
        assert!(err.to_string().contains("min_period_secs"));
    }

    #[test]
    fn test_missing_file() {
        let err = Config::load("/nonexistent/coinpbx.toml").unwrap_err();
        assert!(err.to_string().contains("/nonexistent/coinpbx.toml"));
    }
}
