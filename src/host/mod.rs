//! Contracts consumed from the switching host.
//!
//! The coin controller never owns channel drivers, media mixing or the
//! event bus; it drives them through these traits. [`memory`] provides an
//! in-process implementation used by tests and the `simulate` command.

use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

pub mod memory;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChannelState {
    #[default]
    Down,
    Reserved,
    OffHook,
    Dialing,
    Ring,
    Ringing,
    Up,
    Busy,
}

impl std::fmt::Display for ChannelState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ChannelState::Down => "Down",
            ChannelState::Reserved => "Rsrvd",
            ChannelState::OffHook => "OffHook",
            ChannelState::Dialing => "Dialing",
            ChannelState::Ring => "Ring",
            ChannelState::Ringing => "Ringing",
            ChannelState::Up => "Up",
            ChannelState::Busy => "Busy",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ControlFrame {
    Hangup,
    Ring,
    Ringing,
    Answer,
    Busy,
    Congestion,
    Progress,
    Proceeding,
    Hold,
    Unhold,
    SrcUpdate,
    ConnectedLine,
    Redirecting,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Control(ControlFrame),
    Dtmf(char),
    Voice(Bytes),
    Video(Bytes),
    Image(Bytes),
    Text(String),
    Null,
}

impl Frame {
    /// Frames relayed verbatim between the two legs before answer.
    pub fn is_relayed_media(&self) -> bool {
        matches!(
            self,
            Frame::Dtmf(_) | Frame::Voice(_) | Frame::Video(_) | Frame::Image(_) | Frame::Text(_)
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HangupCause {
    NormalClearing,
    UserBusy,
    NoAnswer,
    Congestion,
    Failure,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CallerId {
    pub number: Option<String>,
    pub name: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Redirecting {
    pub from: Option<String>,
    pub reason: Option<String>,
    pub count: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaKind {
    Audio,
    Video,
    Image,
    Text,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamDescription {
    pub kind: MediaKind,
    pub formats: Vec<String>,
}

/// Ordered set of media streams a channel carries.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaTopology {
    pub streams: Vec<StreamDescription>,
}

impl MediaTopology {
    pub fn audio(formats: &[&str]) -> Self {
        Self {
            streams: vec![StreamDescription {
                kind: MediaKind::Audio,
                formats: formats.iter().map(|f| f.to_string()).collect(),
            }],
        }
    }

    pub fn audio_formats(&self) -> impl Iterator<Item = &String> {
        self.streams
            .iter()
            .filter(|s| s.kind == MediaKind::Audio)
            .flat_map(|s| s.formats.iter())
    }
}

#[async_trait]
pub trait Channel: Send + Sync {
    fn name(&self) -> String;
    fn unique_id(&self) -> String;
    fn state(&self) -> ChannelState;
    /// Cancelled when the channel is hung up or a soft hangup is requested.
    fn cancel_token(&self) -> CancellationToken;
    fn is_hungup(&self) -> bool {
        self.cancel_token().is_cancelled()
    }

    fn get_var(&self, name: &str) -> Option<String>;
    fn set_var(&self, name: &str, value: &str);
    fn clear_var(&self, name: &str);
    fn vars(&self) -> Vec<(String, String)>;

    fn caller_id(&self) -> CallerId;
    fn set_caller_id(&self, caller_id: CallerId);
    fn redirecting(&self) -> Redirecting;
    fn set_redirecting(&self, redirecting: Redirecting);
    fn forwards(&self) -> u32;
    fn set_forwards(&self, forwards: u32);
    fn context(&self) -> String;
    fn set_dial_context(&self, context: &str);
    fn topology(&self) -> MediaTopology;
    /// Audio hooks or frame hooks attached to the channel.
    fn has_media_hooks(&self) -> bool;
    fn set_hangup_cause(&self, cause: HangupCause);
    fn hangup_cause(&self) -> Option<HangupCause>;

    /// Next frame from the channel, `None` once it has hung up.
    async fn read(&self) -> Option<Frame>;
    async fn write(&self, frame: Frame) -> Result<()>;
    async fn indicate(&self, control: ControlFrame) -> Result<()>;
    /// Place the call without waiting for answer.
    async fn call(&self, resource: &str) -> Result<()>;
    async fn answer(&self) -> Result<()>;
    fn soft_hangup(&self);
    async fn hangup(&self);
}

pub type ChannelRef = Arc<dyn Channel>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BridgeKind {
    /// Two-party native or simple bridging.
    OneToOne,
    /// Software mixing for any number of participants.
    MultiMix,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BridgeOptions {
    pub name: String,
    pub kind: BridgeKind,
    pub internal_sample_rate: u32,
    pub maximum_sample_rate: u32,
    pub mixing_interval: Duration,
    pub transfer_prohibited: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LeaveCause {
    Hangup,
    Removed,
    BridgeDestroyed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaveEvent {
    pub unique_id: String,
    pub cause: LeaveCause,
}

#[derive(Debug, Clone, Default)]
pub struct JoinOptions {
    pub dtmf_passthrough: bool,
}

#[derive(Debug, Default)]
pub struct ImpartOptions {
    pub dtmf_passthrough: bool,
    /// Participant may not be moved or transferred to another bridge.
    pub immovable: bool,
    /// Only the other participants hear this one; it hears nothing.
    pub solo_listener: bool,
    /// Fired once when the participant leaves the bridge for any reason.
    pub leave_notify: Option<oneshot::Sender<LeaveEvent>>,
}

#[async_trait]
pub trait Bridge: Send + Sync {
    fn id(&self) -> String;
    fn options(&self) -> BridgeOptions;
    fn participants(&self) -> Vec<String>;
    /// Block until the channel leaves the bridge.
    async fn join(&self, channel: ChannelRef, options: JoinOptions) -> Result<LeaveCause>;
    /// Add the channel and return immediately; the bridge owns it from now on
    /// and hangs it up when it leaves.
    async fn impart(&self, channel: ChannelRef, options: ImpartOptions) -> Result<()>;
    /// Force a participant out of the bridge.
    async fn remove(&self, unique_id: &str) -> Result<()>;
    async fn destroy(&self);
}

pub type BridgeRef = Arc<dyn Bridge>;

#[async_trait]
pub trait Host: Send + Sync {
    async fn request_channel(
        &self,
        tech: &str,
        resource: &str,
        topology: &MediaTopology,
        requestor: &ChannelRef,
    ) -> Result<ChannelRef>;
    /// Reconcile audio encodings so both channels can exchange media.
    async fn make_compatible(&self, a: &ChannelRef, b: &ChannelRef) -> Result<()>;
    /// Try to pass media directly between two unbridged channels.
    async fn early_bridge(&self, a: &ChannelRef, b: &ChannelRef) -> Result<bool>;
    fn create_bridge(&self, options: BridgeOptions) -> Result<BridgeRef>;
    /// Local channel used to play prompts into a bridge.
    async fn alloc_announcer(&self, requestor: &ChannelRef) -> Result<ChannelRef>;
    /// Play a media reference to completion or until the channel hangs up.
    async fn play(&self, channel: &ChannelRef, media: &str) -> Result<()>;
}

pub type HostRef = Arc<dyn Host>;
