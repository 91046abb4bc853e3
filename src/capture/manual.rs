use std::sync::Arc;

use crate::capture::hook::{EventSource, HookId, HookSpec, PacketEvent, PacketHook, Verdict};
use crate::capture::registry::HookRegistry;
use crate::error::Result;

/// Event source driven by the caller instead of a capture handle.
///
/// `inject` runs the registered hooks synchronously on the calling thread,
/// which makes it usable for replaying recorded traffic and for tests.
#[derive(Default)]
pub struct ManualEventSource {
    registry: HookRegistry,
}

impl ManualEventSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inject(&self, event: &PacketEvent<'_>) -> Verdict {
        self.registry.dispatch(event)
    }

    pub fn hook_count(&self) -> usize {
        self.registry.len()
    }
}

impl EventSource for ManualEventSource {
    fn name(&self) -> &str {
        "manual"
    }

    fn subscribe(&self, spec: HookSpec, hook: Arc<dyn PacketHook>) -> Result<HookId> {
        self.registry.register(spec, hook)
    }

    fn unsubscribe(&self, id: HookId) -> Result<()> {
        self.registry.unregister(id)
    }
}
