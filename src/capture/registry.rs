use log::{debug, info};
use parking_lot::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::capture::hook::{HookId, HookSpec, PacketEvent, PacketHook, Verdict};
use crate::error::{RegistrationError, Result};
use crate::protocol::ip_family;

struct Registration {
    id: HookId,
    spec: HookSpec,
    hook: Arc<dyn PacketHook>,
}

/// 钩子注册表
///
/// Hooks are kept sorted by priority. Dispatch holds the read lock for the
/// whole walk, so `unregister` (write lock) returns only after every
/// in-flight callback has finished. A hook must not unregister itself from
/// inside its own callback.
pub struct HookRegistry {
    hooks: RwLock<Vec<Registration>>,
    next_id: AtomicU64,
}

impl Default for HookRegistry {
    fn default() -> Self {
        Self {
            hooks: RwLock::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }
}

impl HookRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, spec: HookSpec, hook: Arc<dyn PacketHook>) -> Result<HookId> {
        let mut hooks = self.hooks.write();
        if let Some(existing) = hooks.iter().find(|r| r.spec.conflicts_with(&spec)) {
            return Err(RegistrationError::PriorityConflict {
                priority: spec.priority,
                existing: existing.id.0,
            }
            .into());
        }

        let id = HookId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let position = hooks.partition_point(|r| r.spec.priority <= spec.priority);
        hooks.insert(position, Registration { id, spec, hook });
        info!(
            "registered hook {} for {:?}/{:?} at priority {}",
            id, spec.event_class, spec.family, spec.priority
        );
        Ok(id)
    }

    pub fn unregister(&self, id: HookId) -> Result<()> {
        let mut hooks = self.hooks.write();
        let index = hooks
            .iter()
            .position(|r| r.id == id)
            .ok_or(RegistrationError::UnknownHook(id.0))?;
        hooks.remove(index);
        info!("unregistered hook {}", id);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.hooks.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Runs matching hooks in priority order. The first `Drop` ends the walk.
    pub fn dispatch(&self, event: &PacketEvent<'_>) -> Verdict {
        let hooks = self.hooks.read();
        if hooks.is_empty() {
            return Verdict::Accept;
        }
        let family = ip_family(event.link, event.data);
        for registration in hooks.iter() {
            if registration.spec.event_class != event.class
                || !registration.spec.family.matches(family)
            {
                continue;
            }
            if registration.hook.on_event(event) == Verdict::Drop {
                debug!("hook {} dropped packet", registration.id);
                return Verdict::Drop;
            }
        }
        Verdict::Accept
    }
}
