//! In-process host: channels backed by tokio channels, a bridge that only
//! tracks membership, and scripted far ends.

use super::{
    Bridge, BridgeOptions, BridgeRef, CallerId, Channel, ChannelRef, ChannelState, ControlFrame,
    Frame, HangupCause, Host, ImpartOptions, JoinOptions, LeaveCause, LeaveEvent, MediaTopology,
    Redirecting,
};
use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

static CHANNEL_SEQ: AtomicU64 = AtomicU64::new(1);

const SILENCE_ULAW: [u8; 160] = [0xff; 160];

fn next_seq() -> u64 {
    CHANNEL_SEQ.fetch_add(1, Ordering::Relaxed)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FarEndAction {
    Ringing,
    Progress,
    Proceeding,
    Answer,
    Busy,
    Congestion,
    Hangup,
    Voice,
    Dtmf(char),
}

/// One step of a scripted far end; `after_ms` counts from the previous step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScriptStep {
    #[serde(default)]
    pub after_ms: u64,
    pub action: FarEndAction,
}

impl ScriptStep {
    pub fn new(after_ms: u64, action: FarEndAction) -> Self {
        Self { after_ms, action }
    }
}

#[derive(Debug, Default)]
struct MemoryChannelState {
    state: ChannelState,
    vars: HashMap<String, String>,
    caller_id: CallerId,
    redirecting: Redirecting,
    forwards: u32,
    context: String,
    dial_context: Option<String>,
    topology: MediaTopology,
    media_hooks: bool,
    hangup_cause: Option<HangupCause>,
    written: Vec<Frame>,
    indications: Vec<ControlFrame>,
    dialed: Option<String>,
    hungup: bool,
}

pub struct MemoryChannel {
    name: String,
    unique_id: String,
    token: CancellationToken,
    state: Arc<Mutex<MemoryChannelState>>,
    inbox: mpsc::UnboundedSender<Frame>,
    reader: AsyncMutex<mpsc::UnboundedReceiver<Frame>>,
    script: Vec<ScriptStep>,
}

impl MemoryChannel {
    pub fn new(name: impl Into<String>) -> Self {
        let (inbox, reader) = mpsc::unbounded_channel();
        let state = MemoryChannelState {
            forwards: 20,
            context: "default".to_string(),
            topology: MediaTopology::audio(&["ulaw"]),
            ..Default::default()
        };
        Self {
            name: name.into(),
            unique_id: format!("{}.{}", crate::get_timestamp() / 1000, next_seq()),
            token: CancellationToken::new(),
            state: Arc::new(Mutex::new(state)),
            inbox,
            reader: AsyncMutex::new(reader),
            script: Vec::new(),
        }
    }

    pub fn with_state(self, state: ChannelState) -> Self {
        self.state.lock().unwrap().state = state;
        self
    }

    pub fn with_var(self, name: &str, value: &str) -> Self {
        self.set_var(name, value);
        self
    }

    pub fn with_caller_id(self, number: &str, name: &str) -> Self {
        self.state.lock().unwrap().caller_id = CallerId {
            number: Some(number.to_string()),
            name: Some(name.to_string()),
        };
        self
    }

    pub fn with_redirecting(self, redirecting: Redirecting) -> Self {
        self.state.lock().unwrap().redirecting = redirecting;
        self
    }

    pub fn with_forwards(self, forwards: u32) -> Self {
        self.state.lock().unwrap().forwards = forwards;
        self
    }

    pub fn with_topology(self, topology: MediaTopology) -> Self {
        self.state.lock().unwrap().topology = topology;
        self
    }

    pub fn with_media_hooks(self, hooks: bool) -> Self {
        self.state.lock().unwrap().media_hooks = hooks;
        self
    }

    pub fn with_script(mut self, script: Vec<ScriptStep>) -> Self {
        self.script = script;
        self
    }

    /// Queue a frame as if it had arrived from the line.
    pub fn push_frame(&self, frame: Frame) {
        let _ = self.inbox.send(frame);
    }

    pub fn written(&self) -> Vec<Frame> {
        self.state.lock().unwrap().written.clone()
    }

    pub fn indications(&self) -> Vec<ControlFrame> {
        self.state.lock().unwrap().indications.clone()
    }

    pub fn dialed(&self) -> Option<String> {
        self.state.lock().unwrap().dialed.clone()
    }

    pub fn dial_context(&self) -> Option<String> {
        self.state.lock().unwrap().dial_context.clone()
    }

    /// True once the channel was fully hung up, not merely soft hung up.
    pub fn was_hungup(&self) -> bool {
        self.state.lock().unwrap().hungup
    }
}

async fn play_far_end(
    name: String,
    script: Vec<ScriptStep>,
    inbox: mpsc::UnboundedSender<Frame>,
    token: CancellationToken,
    state: Arc<Mutex<MemoryChannelState>>,
) {
    for step in script {
        tokio::select! {
            _ = token.cancelled() => return,
            _ = sleep(Duration::from_millis(step.after_ms)) => {}
        }
        debug!(channel = %name, action = ?step.action, "far end action");
        let frame = match step.action {
            FarEndAction::Ringing => {
                state.lock().unwrap().state = ChannelState::Ringing;
                Frame::Control(ControlFrame::Ringing)
            }
            FarEndAction::Progress => Frame::Control(ControlFrame::Progress),
            FarEndAction::Proceeding => Frame::Control(ControlFrame::Proceeding),
            FarEndAction::Answer => {
                state.lock().unwrap().state = ChannelState::Up;
                Frame::Control(ControlFrame::Answer)
            }
            FarEndAction::Busy => {
                state.lock().unwrap().state = ChannelState::Busy;
                Frame::Control(ControlFrame::Busy)
            }
            FarEndAction::Congestion => Frame::Control(ControlFrame::Congestion),
            FarEndAction::Hangup => {
                {
                    let mut state = state.lock().unwrap();
                    state.state = ChannelState::Down;
                    state.hungup = true;
                }
                token.cancel();
                return;
            }
            FarEndAction::Voice => Frame::Voice(Bytes::from_static(&SILENCE_ULAW)),
            FarEndAction::Dtmf(digit) => Frame::Dtmf(digit),
        };
        if inbox.send(frame).is_err() {
            return;
        }
    }
}

#[async_trait]
impl Channel for MemoryChannel {
    fn name(&self) -> String {
        self.name.clone()
    }

    fn unique_id(&self) -> String {
        self.unique_id.clone()
    }

    fn state(&self) -> ChannelState {
        self.state.lock().unwrap().state
    }

    fn cancel_token(&self) -> CancellationToken {
        self.token.clone()
    }

    fn get_var(&self, name: &str) -> Option<String> {
        self.state.lock().unwrap().vars.get(name).cloned()
    }

    fn set_var(&self, name: &str, value: &str) {
        self.state
            .lock()
            .unwrap()
            .vars
            .insert(name.to_string(), value.to_string());
    }

    fn clear_var(&self, name: &str) {
        self.state.lock().unwrap().vars.remove(name);
    }

    fn vars(&self) -> Vec<(String, String)> {
        let mut vars: Vec<_> = self
            .state
            .lock()
            .unwrap()
            .vars
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        vars.sort();
        vars
    }

    fn caller_id(&self) -> CallerId {
        self.state.lock().unwrap().caller_id.clone()
    }

    fn set_caller_id(&self, caller_id: CallerId) {
        self.state.lock().unwrap().caller_id = caller_id;
    }

    fn redirecting(&self) -> Redirecting {
        self.state.lock().unwrap().redirecting.clone()
    }

    fn set_redirecting(&self, redirecting: Redirecting) {
        self.state.lock().unwrap().redirecting = redirecting;
    }

    fn forwards(&self) -> u32 {
        self.state.lock().unwrap().forwards
    }

    fn set_forwards(&self, forwards: u32) {
        self.state.lock().unwrap().forwards = forwards;
    }

    fn context(&self) -> String {
        self.state.lock().unwrap().context.clone()
    }

    fn set_dial_context(&self, context: &str) {
        self.state.lock().unwrap().dial_context = Some(context.to_string());
    }

    fn topology(&self) -> MediaTopology {
        self.state.lock().unwrap().topology.clone()
    }

    fn has_media_hooks(&self) -> bool {
        self.state.lock().unwrap().media_hooks
    }

    fn set_hangup_cause(&self, cause: HangupCause) {
        self.state.lock().unwrap().hangup_cause = Some(cause);
    }

    fn hangup_cause(&self) -> Option<HangupCause> {
        self.state.lock().unwrap().hangup_cause
    }

    async fn read(&self) -> Option<Frame> {
        if self.token.is_cancelled() {
            return None;
        }
        let mut reader = self.reader.lock().await;
        tokio::select! {
            biased;
            _ = self.token.cancelled() => None,
            frame = reader.recv() => frame,
        }
    }

    async fn write(&self, frame: Frame) -> Result<()> {
        if self.token.is_cancelled() {
            return Err(anyhow::anyhow!("{} is hung up", self.name));
        }
        self.state.lock().unwrap().written.push(frame);
        Ok(())
    }

    async fn indicate(&self, control: ControlFrame) -> Result<()> {
        if self.token.is_cancelled() {
            return Err(anyhow::anyhow!("{} is hung up", self.name));
        }
        self.state.lock().unwrap().indications.push(control);
        Ok(())
    }

    async fn call(&self, resource: &str) -> Result<()> {
        if self.token.is_cancelled() {
            return Err(anyhow::anyhow!("{} is hung up", self.name));
        }
        {
            let mut state = self.state.lock().unwrap();
            state.dialed = Some(resource.to_string());
            state.state = ChannelState::Dialing;
        }
        tokio::spawn(play_far_end(
            self.name.clone(),
            self.script.clone(),
            self.inbox.clone(),
            self.token.clone(),
            self.state.clone(),
        ));
        Ok(())
    }

    async fn answer(&self) -> Result<()> {
        if self.token.is_cancelled() {
            return Err(anyhow::anyhow!("{} is hung up", self.name));
        }
        self.state.lock().unwrap().state = ChannelState::Up;
        Ok(())
    }

    fn soft_hangup(&self) {
        self.token.cancel();
    }

    async fn hangup(&self) {
        {
            let mut state = self.state.lock().unwrap();
            state.state = ChannelState::Down;
            state.hungup = true;
        }
        self.token.cancel();
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BridgeRecord {
    Joined(String),
    Imparted {
        unique_id: String,
        immovable: bool,
        solo_listener: bool,
    },
    Left(String, LeaveCause),
    Destroyed,
}

struct BridgeInner {
    id: String,
    options: BridgeOptions,
    destroyed: CancellationToken,
    participants: Mutex<HashMap<String, CancellationToken>>,
    history: Mutex<Vec<BridgeRecord>>,
    reject_imparts: AtomicBool,
}

impl BridgeInner {
    fn enter(&self, channel: &ChannelRef, record: BridgeRecord) -> Result<CancellationToken> {
        if self.destroyed.is_cancelled() {
            return Err(anyhow::anyhow!("bridge {} is destroyed", self.id));
        }
        let unique_id = channel.unique_id();
        let mut participants = self.participants.lock().unwrap();
        if participants.contains_key(&unique_id) {
            return Err(anyhow::anyhow!(
                "{} is already in bridge {}",
                channel.name(),
                self.id
            ));
        }
        let removal = CancellationToken::new();
        participants.insert(unique_id, removal.clone());
        self.history.lock().unwrap().push(record);
        Ok(removal)
    }

    async fn wait_leave(&self, channel: &ChannelRef, removal: &CancellationToken) -> LeaveCause {
        let hangup = channel.cancel_token();
        tokio::select! {
            biased;
            _ = removal.cancelled() => LeaveCause::Removed,
            _ = hangup.cancelled() => LeaveCause::Hangup,
            _ = self.destroyed.cancelled() => LeaveCause::BridgeDestroyed,
        }
    }

    fn leave(&self, unique_id: &str, cause: LeaveCause) {
        self.participants.lock().unwrap().remove(unique_id);
        self.history
            .lock()
            .unwrap()
            .push(BridgeRecord::Left(unique_id.to_string(), cause));
    }
}

pub struct MemoryBridge {
    inner: Arc<BridgeInner>,
}

impl MemoryBridge {
    pub fn new(options: BridgeOptions) -> Self {
        Self {
            inner: Arc::new(BridgeInner {
                id: format!("bridge-{}", uuid::Uuid::new_v4()),
                options,
                destroyed: CancellationToken::new(),
                participants: Mutex::new(HashMap::new()),
                history: Mutex::new(Vec::new()),
                reject_imparts: AtomicBool::new(false),
            }),
        }
    }

    /// Fail every later impart, as a bridge refusing the technology would.
    pub fn reject_imparts(&self) {
        self.inner.reject_imparts.store(true, Ordering::SeqCst);
    }

    pub fn history(&self) -> Vec<BridgeRecord> {
        self.inner.history.lock().unwrap().clone()
    }

    pub fn is_destroyed(&self) -> bool {
        self.inner.destroyed.is_cancelled()
    }
}

#[async_trait]
impl Bridge for MemoryBridge {
    fn id(&self) -> String {
        self.inner.id.clone()
    }

    fn options(&self) -> BridgeOptions {
        self.inner.options.clone()
    }

    fn participants(&self) -> Vec<String> {
        let mut ids: Vec<_> = self
            .inner
            .participants
            .lock()
            .unwrap()
            .keys()
            .cloned()
            .collect();
        ids.sort();
        ids
    }

    async fn join(&self, channel: ChannelRef, _options: JoinOptions) -> Result<LeaveCause> {
        let unique_id = channel.unique_id();
        let removal = self
            .inner
            .enter(&channel, BridgeRecord::Joined(unique_id.clone()))?;
        let cause = self.inner.wait_leave(&channel, &removal).await;
        self.inner.leave(&unique_id, cause);
        Ok(cause)
    }

    async fn impart(&self, channel: ChannelRef, options: ImpartOptions) -> Result<()> {
        if self.inner.reject_imparts.load(Ordering::SeqCst) {
            return Err(anyhow::anyhow!(
                "bridge {} refused {}",
                self.inner.id,
                channel.name()
            ));
        }
        let unique_id = channel.unique_id();
        let removal = self.inner.enter(
            &channel,
            BridgeRecord::Imparted {
                unique_id: unique_id.clone(),
                immovable: options.immovable,
                solo_listener: options.solo_listener,
            },
        )?;
        let inner = self.inner.clone();
        let leave_notify = options.leave_notify;
        tokio::spawn(async move {
            let cause = inner.wait_leave(&channel, &removal).await;
            inner.leave(&unique_id, cause);
            channel.hangup().await;
            if let Some(notify) = leave_notify {
                notify.send(LeaveEvent { unique_id, cause }).ok();
            }
        });
        Ok(())
    }

    async fn remove(&self, unique_id: &str) -> Result<()> {
        match self.inner.participants.lock().unwrap().get(unique_id) {
            Some(removal) => {
                removal.cancel();
                Ok(())
            }
            None => Err(anyhow::anyhow!(
                "{} is not in bridge {}",
                unique_id,
                self.inner.id
            )),
        }
    }

    async fn destroy(&self) {
        if !self.inner.destroyed.is_cancelled() {
            self.inner.history.lock().unwrap().push(BridgeRecord::Destroyed);
            self.inner.destroyed.cancel();
        }
    }
}

struct Route {
    script: Vec<ScriptStep>,
    topology: Option<MediaTopology>,
}

/// Host whose outbound routes are scripted far ends keyed by resource.
pub struct MemoryHost {
    routes: Mutex<HashMap<String, Route>>,
    channels: Mutex<Vec<Arc<MemoryChannel>>>,
    bridges: Mutex<Vec<Arc<MemoryBridge>>>,
    played: Mutex<Vec<String>>,
    early_bridged: Mutex<Vec<(String, String)>>,
    play_duration: Duration,
    reject_imparts: AtomicBool,
}

impl Default for MemoryHost {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryHost {
    pub fn new() -> Self {
        Self {
            routes: Mutex::new(HashMap::new()),
            channels: Mutex::new(Vec::new()),
            bridges: Mutex::new(Vec::new()),
            played: Mutex::new(Vec::new()),
            early_bridged: Mutex::new(Vec::new()),
            play_duration: Duration::from_secs(5),
            reject_imparts: AtomicBool::new(false),
        }
    }

    pub fn with_play_duration(mut self, duration: Duration) -> Self {
        self.play_duration = duration;
        self
    }

    pub fn add_route(&self, resource: &str, script: Vec<ScriptStep>) {
        self.routes.lock().unwrap().insert(
            resource.to_string(),
            Route {
                script,
                topology: None,
            },
        );
    }

    /// Route whose far end only speaks the given formats.
    pub fn add_route_with_topology(
        &self,
        resource: &str,
        script: Vec<ScriptStep>,
        topology: MediaTopology,
    ) {
        self.routes.lock().unwrap().insert(
            resource.to_string(),
            Route {
                script,
                topology: Some(topology),
            },
        );
    }

    /// Make a channel created outside the host (the caller) visible to lookups.
    pub fn adopt(&self, channel: MemoryChannel) -> Arc<MemoryChannel> {
        let channel = Arc::new(channel);
        self.channels.lock().unwrap().push(channel.clone());
        channel
    }

    pub fn channel(&self, unique_id: &str) -> Option<Arc<MemoryChannel>> {
        self.channels
            .lock()
            .unwrap()
            .iter()
            .find(|c| c.unique_id == unique_id)
            .cloned()
    }

    pub fn channels(&self) -> Vec<Arc<MemoryChannel>> {
        self.channels.lock().unwrap().clone()
    }

    /// Bridges created from now on refuse imparted channels.
    pub fn reject_imparts(&self) {
        self.reject_imparts.store(true, Ordering::SeqCst);
    }

    pub fn bridges(&self) -> Vec<Arc<MemoryBridge>> {
        self.bridges.lock().unwrap().clone()
    }

    pub fn played(&self) -> Vec<String> {
        self.played.lock().unwrap().clone()
    }

    pub fn early_bridged(&self) -> Vec<(String, String)> {
        self.early_bridged.lock().unwrap().clone()
    }
}

#[async_trait]
impl Host for MemoryHost {
    async fn request_channel(
        &self,
        tech: &str,
        resource: &str,
        topology: &MediaTopology,
        requestor: &ChannelRef,
    ) -> Result<ChannelRef> {
        let (script, far_topology) = match self.routes.lock().unwrap().get(resource) {
            Some(route) => (route.script.clone(), route.topology.clone()),
            None => return Err(anyhow::anyhow!("no route to {}/{}", tech, resource)),
        };
        let channel = MemoryChannel::new(format!("{}/{}-{:08x}", tech, resource, next_seq()))
            .with_topology(far_topology.unwrap_or_else(|| topology.clone()))
            .with_script(script);
        debug!(
            requestor = %requestor.name(),
            channel = %channel.name,
            "requested outbound channel"
        );
        let channel = self.adopt(channel);
        Ok(channel)
    }

    async fn make_compatible(&self, a: &ChannelRef, b: &ChannelRef) -> Result<()> {
        let b_topology = b.topology();
        let common = a
            .topology()
            .audio_formats()
            .any(|f| b_topology.audio_formats().any(|g| g == f));
        if common {
            Ok(())
        } else {
            Err(anyhow::anyhow!(
                "no common audio format between {} and {}",
                a.name(),
                b.name()
            ))
        }
    }

    async fn early_bridge(&self, a: &ChannelRef, b: &ChannelRef) -> Result<bool> {
        self.early_bridged
            .lock()
            .unwrap()
            .push((a.unique_id(), b.unique_id()));
        Ok(true)
    }

    fn create_bridge(&self, options: BridgeOptions) -> Result<BridgeRef> {
        let bridge = Arc::new(MemoryBridge::new(options));
        if self.reject_imparts.load(Ordering::SeqCst) {
            bridge.reject_imparts();
        }
        self.bridges.lock().unwrap().push(bridge.clone());
        Ok(bridge)
    }

    async fn alloc_announcer(&self, requestor: &ChannelRef) -> Result<ChannelRef> {
        let channel = MemoryChannel::new(format!("Announcer/{:08x}", next_seq()))
            .with_state(ChannelState::Up)
            .with_topology(requestor.topology());
        let channel = self.adopt(channel);
        Ok(channel)
    }

    async fn play(&self, channel: &ChannelRef, media: &str) -> Result<()> {
        info!(channel = %channel.name(), media, "playing");
        self.played.lock().unwrap().push(media.to_string());
        let hangup = channel.cancel_token();
        tokio::select! {
            _ = hangup.cancelled() => Err(anyhow::anyhow!("{} hung up during playback", channel.name())),
            _ = sleep(self.play_duration) => Ok(()),
        }
    }
}
