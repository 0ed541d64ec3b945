use crate::coin::{CoinCall, CoinCallApp, CoinCallRegistry, CoinOptions, CoinServices};
use crate::config::CoinConfig;
use crate::event::BroadcastPublisher;
use crate::host::memory::{MemoryChannel, MemoryHost, ScriptStep};
use crate::simulate::ScriptedController;
use std::sync::Arc;
use std::time::Duration;

/// Memory host, event bus and coin controller wired around one caller.
pub struct TestRig {
    pub host: Arc<MemoryHost>,
    pub publisher: Arc<BroadcastPublisher>,
    pub registry: Arc<CoinCallRegistry>,
    pub config: CoinConfig,
    pub caller: Arc<MemoryChannel>,
    pub controller: ScriptedController,
}

impl TestRig {
    /// Must be called inside a runtime; the controller runs as a task.
    pub fn new() -> Self {
        Self::with_caller(MemoryChannel::new("DAHDI/1-1").with_caller_id("5551234", "PAYPHONE"))
    }

    pub fn with_caller(caller: MemoryChannel) -> Self {
        let config = CoinConfig::default();
        let host = Arc::new(MemoryHost::new());
        let publisher = Arc::new(BroadcastPublisher::new(64));
        let controller = ScriptedController::spawn(
            host.clone(),
            publisher.subscribe(),
            &config,
            Duration::from_millis(250),
        );
        let caller = host.adopt(caller);
        Self {
            host,
            publisher,
            registry: Arc::new(CoinCallRegistry::new()),
            config,
            caller,
            controller,
        }
    }

    pub fn services(&self) -> CoinServices {
        CoinServices {
            host: self.host.clone(),
            publisher: self.publisher.clone(),
            registry: self.registry.clone(),
            config: Arc::new(self.config.clone()),
        }
    }

    pub fn app(&self) -> CoinCallApp {
        CoinCallApp::new(self.services())
    }

    pub fn call(&self, args: &str) -> CoinCall {
        let options = CoinOptions::parse(args, &self.config).expect("valid arguments");
        CoinCall::new(self.caller.clone(), options, self.services())
    }

    pub fn route(&self, resource: &str, script: Vec<ScriptStep>) {
        self.host.add_route(resource, script);
    }

    /// The outgoing channel created for the call, if any.
    pub fn callee(&self) -> Option<Arc<MemoryChannel>> {
        self.host
            .channels()
            .into_iter()
            .find(|c| c.dialed().is_some())
    }
}
