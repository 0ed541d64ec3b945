use crate::coin::disposition::Disposition;
use crate::coin::{CallResult, FinalDisposition};
use crate::host::Channel;
use anyhow::Result;
use serde::{Deserialize, Serialize};

/// CoinEvent is published for the external coin controller process.
///
/// The controller answers test dispositions by setting the matching
/// result variable on the channel named in the event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event")]
pub enum CoinEvent {
    #[serde(rename = "CoinDisposition")]
    Disposition {
        channel: String,
        channel_state: String,
        caller_id_num: Option<String>,
        unique_id: String,
        disposition: Disposition,
    },
    #[serde(rename = "CoinCallEnd")]
    CallEnd {
        channel: String,
        unique_id: String,
        result: CallResult,
        end_reason: CallResult,
        final_disposition: FinalDisposition,
        collected: u32,
        timestamp: u64,
    },
}

impl CoinEvent {
    pub fn disposition(channel: &dyn Channel, disposition: Disposition) -> Self {
        CoinEvent::Disposition {
            channel: channel.name(),
            channel_state: channel.state().to_string(),
            caller_id_num: channel.caller_id().number,
            unique_id: channel.unique_id(),
            disposition,
        }
    }

    pub fn unique_id(&self) -> &str {
        match self {
            CoinEvent::Disposition { unique_id, .. } => unique_id,
            CoinEvent::CallEnd { unique_id, .. } => unique_id,
        }
    }
}

/// Fire-and-forget publication of controller events.
#[cfg_attr(test, mockall::automock)]
pub trait EventPublisher: Send + Sync {
    fn publish(&self, event: CoinEvent) -> Result<()>;
}

/// Type alias for the event sender
pub type EventSender = tokio::sync::broadcast::Sender<CoinEvent>;

/// Type alias for the event receiver
pub type EventReceiver = tokio::sync::broadcast::Receiver<CoinEvent>;

pub struct BroadcastPublisher {
    sender: EventSender,
}

impl BroadcastPublisher {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = tokio::sync::broadcast::channel(capacity);
        Self { sender }
    }

    pub fn subscribe(&self) -> EventReceiver {
        self.sender.subscribe()
    }
}

impl EventPublisher for BroadcastPublisher {
    fn publish(&self, event: CoinEvent) -> Result<()> {
        self.sender
            .send(event)
            .map(|_| ())
            .map_err(|e| anyhow::anyhow!("no coin controller listening: {}", e))
    }
}
