use crate::config::CoinConfig;
use crate::event::EventPublisher;
use crate::host::{ChannelRef, HostRef};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use tracing::debug;

pub mod app;
pub mod dial;
pub mod disposition;
pub mod leg;
pub mod options;
pub mod registry;
pub mod session;
pub mod verifier;
pub mod wait;

#[cfg(test)]
mod tests;

pub use app::{CallSummary, CoinCallApp};
pub use disposition::Disposition;
pub use options::{CoinFlags, CoinOptions};
pub use registry::CoinCallRegistry;

pub const VAR_RESULT: &str = "COIN_RESULT";
pub const VAR_REASON: &str = "COIN_REASON";
pub const VAR_FINAL_DISPOSITION: &str = "COIN_FINALDISP";
pub const VAR_COLLECTED: &str = "COIN_COLLECTED";

#[derive(Debug, Error)]
pub enum CoinError {
    #[error("no reply in {variable} from the coin controller after {waited:?}")]
    VerificationTimeout { variable: String, waited: Duration },
    #[error("{0} hung up")]
    Hangup(String),
    #[error("invalid arguments: {0}")]
    Invalid(String),
    #[error("host: {0}")]
    Host(String),
}

impl CoinError {
    pub fn is_hangup(err: &anyhow::Error) -> bool {
        matches!(err.downcast_ref::<CoinError>(), Some(CoinError::Hangup(_)))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CallResult {
    CallerHangup,
    CallerAbort,
    CalleeHangup,
    NoAnswer,
    InitialDepositRequired,
    OvertimeDepositRequired,
    None,
    Busy,
    Congestion,
    Failure,
    Invalid,
}

impl CallResult {
    pub fn as_str(&self) -> &'static str {
        match self {
            CallResult::CallerHangup => "CALLER_HANGUP",
            CallResult::CallerAbort => "CALLER_ABORT",
            CallResult::CalleeHangup => "CALLEE_HANGUP",
            CallResult::NoAnswer => "NOANSWER",
            CallResult::InitialDepositRequired => "INITIAL_DEPOSIT_REQUIRED",
            CallResult::OvertimeDepositRequired => "OVERTIME_DEPOSIT_REQUIRED",
            CallResult::None => "NONE",
            CallResult::Busy => "BUSY",
            CallResult::Congestion => "CONGESTION",
            CallResult::Failure => "FAILURE",
            CallResult::Invalid => "INVALID",
        }
    }
}

impl std::fmt::Display for CallResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FinalDisposition {
    Collect,
    Return,
    None,
}

impl FinalDisposition {
    pub fn as_str(&self) -> &'static str {
        match self {
            FinalDisposition::Collect => "COLLECT",
            FinalDisposition::Return => "RETURN",
            FinalDisposition::None => "NONE",
        }
    }
}

impl std::fmt::Display for FinalDisposition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Mutable part of a coin call, shared with the callee leave hook.
#[derive(Debug)]
pub struct CoinCallState {
    pub hopper: u32,
    pub collected: u32,
    pub deposited: u32,
    pub returned: u32,
    pub started_at: Instant,
    pub answered_at: Option<Instant>,
    pub expires_at: Option<Instant>,
    pub caller_disconnected: bool,
    pub callee_disconnected: bool,
    pub attached: bool,
    pub fgc: bool,
    result: Option<CallResult>,
    end_reason: Option<CallResult>,
    final_disposition: Option<FinalDisposition>,
}

impl CoinCallState {
    fn new() -> Self {
        Self {
            hopper: 0,
            collected: 0,
            deposited: 0,
            returned: 0,
            started_at: Instant::now(),
            answered_at: None,
            expires_at: None,
            caller_disconnected: false,
            callee_disconnected: false,
            attached: false,
            fgc: false,
            result: None,
            end_reason: None,
            final_disposition: None,
        }
    }

    pub fn result(&self) -> Option<CallResult> {
        self.result
    }

    pub fn end_reason(&self) -> Option<CallResult> {
        self.end_reason
    }

    pub fn final_disposition(&self) -> Option<FinalDisposition> {
        self.final_disposition
    }

    /// First writer wins; the reason follows the result unless already set.
    pub fn set_result(&mut self, result: CallResult) -> bool {
        if let Some(current) = self.result {
            if current != result {
                debug!(%current, ignored = %result, "result already set");
            }
            return false;
        }
        self.result = Some(result);
        if self.end_reason.is_none() {
            self.end_reason = Some(result);
        }
        true
    }

    pub fn set_final_disposition(&mut self, disposition: FinalDisposition) -> bool {
        if let Some(current) = self.final_disposition {
            if current != disposition {
                debug!(%current, ignored = %disposition, "final disposition already set");
            }
            return false;
        }
        self.final_disposition = Some(disposition);
        true
    }

    /// The caller stopped paying: the reason is the missing deposit, the
    /// money outcome is nothing since the hopper was just collected.
    pub fn settle_overtime_shortfall(&mut self) {
        if self.end_reason.is_none() {
            self.end_reason = Some(CallResult::OvertimeDepositRequired);
        }
        self.set_result(CallResult::None);
    }

    pub fn credit(&mut self, cents: u32) {
        self.hopper += cents;
        self.deposited += cents;
        self.check_ledger();
    }

    pub(crate) fn collect_hopper(&mut self) {
        self.collected += self.hopper;
        self.hopper = 0;
        self.check_ledger();
    }

    pub(crate) fn return_hopper(&mut self) {
        self.returned += self.hopper;
        self.hopper = 0;
        self.check_ledger();
    }

    pub(crate) fn toggle_attached(&mut self, attach: bool) {
        if attach {
            assert!(!self.attached, "operator attach while already attached");
        } else {
            assert!(self.attached, "operator release while not attached");
        }
        self.attached = attach;
    }

    fn check_ledger(&self) {
        assert_eq!(
            self.collected + self.hopper + self.returned,
            self.deposited,
            "coin ledger out of balance: {:?}",
            self
        );
    }

    /// Past the paid-up time (or never timed) the coins go back; otherwise
    /// the call ended early inside a paid period and they are kept.
    pub fn resolve_final_disposition(&mut self, now: Instant) -> FinalDisposition {
        let disposition = if self.fgc {
            FinalDisposition::None
        } else {
            match self.expires_at {
                Some(expires_at) if now < expires_at => FinalDisposition::Collect,
                _ => FinalDisposition::Return,
            }
        };
        self.set_final_disposition(disposition);
        self.final_disposition.unwrap_or(disposition)
    }

    pub fn is_answered(&self) -> bool {
        self.answered_at.is_some()
    }
}

#[derive(Clone, Debug)]
pub struct CoinCallShared {
    inner: Arc<Mutex<CoinCallState>>,
}

impl Default for CoinCallShared {
    fn default() -> Self {
        Self::new()
    }
}

impl CoinCallShared {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(CoinCallState::new())),
        }
    }

    pub fn lock(&self) -> MutexGuard<'_, CoinCallState> {
        self.inner.lock().unwrap()
    }

    pub fn set_result(&self, result: CallResult) -> bool {
        self.lock().set_result(result)
    }

    pub fn set_final_disposition(&self, disposition: FinalDisposition) -> bool {
        self.lock().set_final_disposition(disposition)
    }

    pub fn terminate(&self, result: CallResult, disposition: FinalDisposition) {
        let mut state = self.lock();
        state.set_result(result);
        state.set_final_disposition(disposition);
    }

    pub fn mark_caller_disconnected(&self) {
        self.lock().caller_disconnected = true;
    }

    pub fn hopper(&self) -> u32 {
        self.lock().hopper
    }

    pub fn collected(&self) -> u32 {
        self.lock().collected
    }
}

/// Everything a coin call needs from the process around it.
#[derive(Clone)]
pub struct CoinServices {
    pub host: HostRef,
    pub publisher: Arc<dyn EventPublisher>,
    pub registry: Arc<CoinCallRegistry>,
    pub config: Arc<CoinConfig>,
}

/// One coin call; lives for the duration of [`CoinCallApp::run`].
pub struct CoinCall {
    pub id: String,
    pub caller: ChannelRef,
    pub options: Arc<CoinOptions>,
    pub shared: CoinCallShared,
    pub services: CoinServices,
}

impl CoinCall {
    pub fn new(caller: ChannelRef, options: CoinOptions, services: CoinServices) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            caller,
            options: Arc::new(options),
            shared: CoinCallShared::new(),
            services,
        }
    }

    pub fn config(&self) -> &CoinConfig {
        &self.services.config
    }

    pub fn publisher(&self) -> &dyn EventPublisher {
        self.services.publisher.as_ref()
    }

    /// Issue a disposition for this call, logging a failed publish.
    pub fn signal(&self, disposition: Disposition) -> bool {
        match disposition::signal(
            Some(&self.shared),
            self.caller.as_ref(),
            disposition,
            self.publisher(),
        ) {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(call_id = %self.id, %disposition, "disposition not published: {}", e);
                false
            }
        }
    }
}
