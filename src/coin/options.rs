use super::CoinError;
use crate::config::CoinConfig;
use regex::Regex;
use serde::Serialize;
use std::sync::OnceLock;
use std::time::Duration;

static DIAL_TARGET: OnceLock<Regex> = OnceLock::new();

fn dial_target_regex() -> &'static Regex {
    DIAL_TARGET.get_or_init(|| {
        Regex::new(r"^([A-Za-z][A-Za-z0-9_-]*)/([^\s,]+)$").expect("dial target pattern")
    })
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CoinFlags {
    /// `a`: put the line in operator (toll) mode before dialing.
    pub attach_before_dial: bool,
    /// `f`: coin control is handled by the far end over a Feature Group C trunk.
    pub feature_group_c: bool,
    /// `r`: refund whatever is in the hopper before dialing.
    pub return_before_dial: bool,
}

impl CoinFlags {
    fn parse(s: &str) -> Result<Self, CoinError> {
        let mut flags = CoinFlags::default();
        for c in s.chars() {
            match c {
                'a' => flags.attach_before_dial = true,
                'f' => flags.feature_group_c = true,
                'r' => flags.return_before_dial = true,
                other => {
                    return Err(CoinError::Invalid(format!("unknown option '{}'", other)));
                }
            }
        }
        Ok(flags)
    }
}

/// Immutable per-call configuration parsed from the application arguments:
///
/// `Tech/Resource[,initial_period[,initial_deposit[,overtime_period[,announcement[,options]]]]]`
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CoinOptions {
    pub tech: String,
    pub resource: String,
    /// Seconds, 0 for unlimited.
    pub initial_period: u32,
    /// Cents, 0 when no deposit is required.
    pub initial_deposit: u32,
    /// Seconds, 0 to charge only once.
    pub overtime_period: u32,
    pub announcement: String,
    pub flags: CoinFlags,
}

fn parse_number(field: &str, value: &str) -> Result<u32, CoinError> {
    let value = value.trim();
    if value.is_empty() {
        return Ok(0);
    }
    value
        .parse::<u32>()
        .map_err(|_| CoinError::Invalid(format!("{} '{}' is not a number", field, value)))
}

impl CoinOptions {
    pub fn parse(args: &str, config: &CoinConfig) -> Result<Self, CoinError> {
        let mut fields = args.split(',');
        let target = fields.next().unwrap_or_default().trim();
        if target.is_empty() {
            return Err(CoinError::Invalid("missing dial target".to_string()));
        }
        let captures = dial_target_regex()
            .captures(target)
            .ok_or_else(|| CoinError::Invalid(format!("malformed dial target '{}'", target)))?;

        let initial_period = parse_number("initial period", fields.next().unwrap_or_default())?;
        let initial_deposit = parse_number("initial deposit", fields.next().unwrap_or_default())?;
        let overtime_period = parse_number("overtime period", fields.next().unwrap_or_default())?;
        let announcement = match fields.next().map(str::trim) {
            Some(a) if !a.is_empty() => a.to_string(),
            _ => config.default_announcement.clone(),
        };
        let flags = CoinFlags::parse(fields.next().unwrap_or_default().trim())?;
        if let Some(extra) = fields.next() {
            return Err(CoinError::Invalid(format!("unexpected argument '{}'", extra)));
        }

        let options = Self {
            tech: captures[1].to_string(),
            resource: captures[2].to_string(),
            initial_period,
            initial_deposit,
            overtime_period,
            announcement,
            flags,
        };
        options.validate(config)?;
        Ok(options)
    }

    fn validate(&self, config: &CoinConfig) -> Result<(), CoinError> {
        if self.initial_deposit > config.max_deposit_cents {
            return Err(CoinError::Invalid(format!(
                "initial deposit {} exceeds the maximum of {}",
                self.initial_deposit, config.max_deposit_cents
            )));
        }
        for (field, period) in [
            ("initial period", self.initial_period),
            ("overtime period", self.overtime_period),
        ] {
            if period != 0 && period < config.min_period_secs {
                return Err(CoinError::Invalid(format!(
                    "{} {}s is below the minimum of {}s",
                    field, period, config.min_period_secs
                )));
            }
            if period != 0 && period <= config.period_reserve_secs {
                return Err(CoinError::Invalid(format!(
                    "{} {}s leaves nothing after the {}s reserve",
                    field, period, config.period_reserve_secs
                )));
            }
        }
        Ok(())
    }

    pub fn dial_target(&self) -> String {
        format!("{}/{}", self.tech, self.resource)
    }
}

/// Bridge time for one period: the reserve is spent on the overtime windows.
pub fn period_budget(period_secs: u32, reserve_secs: u32) -> Duration {
    assert!(
        period_secs > reserve_secs,
        "period {}s does not cover the {}s reserve",
        period_secs,
        reserve_secs
    );
    Duration::from_secs(u64::from(period_secs - reserve_secs))
}
