use crate::host::{BridgeRef, ChannelRef, ImpartOptions, LeaveEvent};
use anyhow::Result;
use tokio::sync::oneshot;
use tracing::debug;

/// Outgoing channel while the call still owns it.
pub struct OutboundLeg {
    chan: ChannelRef,
}

impl OutboundLeg {
    pub fn new(chan: ChannelRef) -> Self {
        Self { chan }
    }

    pub fn channel(&self) -> &ChannelRef {
        &self.chan
    }

    pub async fn hangup(self) {
        debug!(channel = %self.chan.name(), "hanging up outbound leg");
        self.chan.hangup().await;
    }

    /// Hand the channel to the bridge. From here on the bridge hangs it up
    /// when it leaves; on failure the leg comes back to the caller.
    pub async fn impart(
        self,
        bridge: &BridgeRef,
        leave_notify: oneshot::Sender<LeaveEvent>,
    ) -> Result<BridgedLeg, (OutboundLeg, anyhow::Error)> {
        let options = ImpartOptions {
            dtmf_passthrough: true,
            leave_notify: Some(leave_notify),
            ..Default::default()
        };
        match bridge.impart(self.chan.clone(), options).await {
            Ok(()) => Ok(BridgedLeg {
                unique_id: self.chan.unique_id(),
                name: self.chan.name(),
                chan: self.chan,
            }),
            Err(e) => Err((self, e)),
        }
    }
}

/// Outgoing channel owned by the bridge. It can only be asked to leave.
pub struct BridgedLeg {
    pub unique_id: String,
    pub name: String,
    chan: ChannelRef,
}

impl BridgedLeg {
    pub fn soft_hangup(&self) {
        debug!(channel = %self.name, "soft hangup of bridged leg");
        self.chan.soft_hangup();
    }

    pub fn is_hungup(&self) -> bool {
        self.chan.is_hungup()
    }
}
