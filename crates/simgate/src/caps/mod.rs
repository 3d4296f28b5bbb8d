mod event_queue;
mod http;
mod mesh;
mod seed;
mod upload;

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, Weak};

use dashmap::DashMap;
use uuid::Uuid;

use crate::circuit::Circuit;

pub use event_queue::{EVENT_POLL_WAIT, poll_events, translate_event};
pub use http::{CapsState, SessionGrant, SessionRequest, router};
pub use mesh::{MESH_CONTENT_TYPE, fetch_mesh};
pub use seed::{TemplateValues, escape, expand_template, resolve_seed};
pub use upload::{UploadError, begin_upload, complete_upload};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CapsHandler {
    Seed,
    EventQueueGet,
    GetMesh,
    UploadBakedTexture,
    BakedTextureUploader,
}

impl CapsHandler {
    pub fn type_name(self) -> &'static str {
        match self {
            Self::Seed => "Seed",
            Self::EventQueueGet => "EventQueueGet",
            Self::GetMesh => "GetMesh",
            Self::UploadBakedTexture => "UploadBakedTexture",
            Self::BakedTextureUploader => "UploadBakedTextureUploader",
        }
    }

    /// Uploader endpoints are one-shot and may exist several at a time.
    pub fn is_unique_per_circuit(self) -> bool {
        !matches!(self, Self::BakedTextureUploader)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CapsError {
    #[error("capability {cap_type} already registered for circuit {circuit_code}")]
    DuplicateType { cap_type: String, circuit_code: u32 },
    #[error("capability id {0} already registered")]
    DuplicateId(Uuid),
    #[error("circuit {0} is closed")]
    CircuitClosed(u32),
}

#[derive(Debug, Clone)]
pub struct CapabilityRoute {
    pub id: Uuid,
    pub cap_type: String,
    pub handler: CapsHandler,
    pub circuit_code: u32,
    pub circuit: Weak<Circuit>,
}

/// Maps capability ids to the circuit and handler that serve them.
pub trait CapabilityRouter: Send + Sync {
    fn register(&self, route: CapabilityRoute) -> Result<(), CapsError>;

    fn unregister(&self, id: Uuid) -> Option<CapabilityRoute>;

    fn lookup(&self, id: Uuid) -> Option<CapabilityRoute>;

    /// Drops every route owned by the circuit, returning how many were removed.
    fn unregister_circuit(&self, circuit_code: u32) -> usize;
}

#[derive(Debug, Default)]
pub struct CapsRegistry {
    routes: DashMap<Uuid, CapabilityRoute>,
    by_type: DashMap<(u32, String), Uuid>,
}

impl CapsRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

impl CapabilityRouter for CapsRegistry {
    fn register(&self, route: CapabilityRoute) -> Result<(), CapsError> {
        if self.routes.contains_key(&route.id) {
            return Err(CapsError::DuplicateId(route.id));
        }

        if route.handler.is_unique_per_circuit() {
            let key = (route.circuit_code, route.cap_type.clone());
            match self.by_type.entry(key) {
                dashmap::Entry::Occupied(_) => {
                    return Err(CapsError::DuplicateType {
                        cap_type: route.cap_type,
                        circuit_code: route.circuit_code,
                    });
                }
                dashmap::Entry::Vacant(slot) => {
                    slot.insert(route.id);
                }
            }
        }

        self.routes.insert(route.id, route);
        Ok(())
    }

    fn unregister(&self, id: Uuid) -> Option<CapabilityRoute> {
        let (_, route) = self.routes.remove(&id)?;
        self.by_type
            .remove_if(&(route.circuit_code, route.cap_type.clone()), |_, owner| {
                *owner == id
            });
        Some(route)
    }

    fn lookup(&self, id: Uuid) -> Option<CapabilityRoute> {
        self.routes.get(&id).map(|route| route.clone())
    }

    fn unregister_circuit(&self, circuit_code: u32) -> usize {
        let ids: Vec<Uuid> = self
            .routes
            .iter()
            .filter(|route| route.circuit_code == circuit_code)
            .map(|route| route.id)
            .collect();

        ids.iter().filter(|id| self.unregister(**id).is_some()).count()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CapabilityBinding {
    pub id: Uuid,
    pub handler: CapsHandler,
}

/// A circuit's own view of its capabilities, keyed by type name, plus its
/// outstanding uploader ids, oldest first.
#[derive(Debug, Default)]
pub struct CapabilityTable {
    bindings: Mutex<HashMap<String, CapabilityBinding>>,
    uploaders: Mutex<VecDeque<Uuid>>,
}

impl CapabilityTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, cap_type: &str) -> Option<CapabilityBinding> {
        self.bindings
            .lock()
            .ok()
            .and_then(|bindings| bindings.get(cap_type).copied())
    }

    pub fn insert(&self, cap_type: &str, binding: CapabilityBinding) -> Option<CapabilityBinding> {
        self.bindings
            .lock()
            .ok()
            .and_then(|mut bindings| bindings.insert(cap_type.to_string(), binding))
    }

    /// Undoes an `insert`, putting back whatever it replaced.
    pub fn restore(&self, cap_type: &str, previous: Option<CapabilityBinding>) {
        if let Ok(mut bindings) = self.bindings.lock() {
            match previous {
                Some(binding) => {
                    bindings.insert(cap_type.to_string(), binding);
                }
                None => {
                    bindings.remove(cap_type);
                }
            }
        }
    }

    pub fn remove(&self, cap_type: &str) -> Option<CapabilityBinding> {
        self.bindings
            .lock()
            .ok()
            .and_then(|mut bindings| bindings.remove(cap_type))
    }

    pub fn names(&self) -> Vec<String> {
        self.bindings
            .lock()
            .map(|bindings| bindings.keys().cloned().collect())
            .unwrap_or_default()
    }

    pub fn clear(&self) {
        if let Ok(mut bindings) = self.bindings.lock() {
            bindings.clear();
        }
        if let Ok(mut uploaders) = self.uploaders.lock() {
            uploaders.clear();
        }
    }

    /// Records a new uploader and returns the ids that must be retired to
    /// keep at most `limit` outstanding.
    pub fn push_uploader(&self, id: Uuid, limit: usize) -> Vec<Uuid> {
        let Ok(mut uploaders) = self.uploaders.lock() else {
            return Vec::new();
        };
        uploaders.push_back(id);
        let excess = uploaders.len().saturating_sub(limit.max(1));
        uploaders.drain(..excess).collect()
    }

    /// Forgets an uploader. False if it was not outstanding.
    pub fn take_uploader(&self, id: Uuid) -> bool {
        let Ok(mut uploaders) = self.uploaders.lock() else {
            return false;
        };
        match uploaders.iter().position(|pending| *pending == id) {
            Some(index) => uploaders.remove(index).is_some(),
            None => false,
        }
    }

    pub fn uploader_count(&self) -> usize {
        self.uploaders.lock().map(|u| u.len()).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::circuit::testing::test_circuit;

    fn route(circuit_code: u32, handler: CapsHandler) -> CapabilityRoute {
        CapabilityRoute {
            id: Uuid::new_v4(),
            cap_type: handler.type_name().to_string(),
            handler,
            circuit_code,
            circuit: Weak::new(),
        }
    }

    #[test]
    fn test_registry_rejects_duplicate_type() {
        let registry = CapsRegistry::new();
        registry.register(route(1, CapsHandler::GetMesh)).unwrap();

        assert!(matches!(
            registry.register(route(1, CapsHandler::GetMesh)),
            Err(CapsError::DuplicateType { .. })
        ));
        assert!(registry.register(route(2, CapsHandler::GetMesh)).is_ok());
        assert!(registry.register(route(1, CapsHandler::BakedTextureUploader)).is_ok());
        assert!(registry.register(route(1, CapsHandler::BakedTextureUploader)).is_ok());
    }

    #[test]
    fn test_registry_unregister_circuit() {
        let registry = CapsRegistry::new();
        registry.register(route(1, CapsHandler::GetMesh)).unwrap();
        registry.register(route(1, CapsHandler::Seed)).unwrap();
        registry.register(route(2, CapsHandler::Seed)).unwrap();

        assert_eq!(registry.unregister_circuit(1), 2);
        assert_eq!(registry.len(), 1);
        assert!(registry.register(route(1, CapsHandler::Seed)).is_ok());
    }

    #[test]
    fn test_add_capability_rolls_back_on_router_rejection() {
        let (circuit, _, registry) = test_circuit();
        let existing = circuit.capabilities().get("EventQueueGet").unwrap();

        let clash = existing.id;
        let result = circuit.add_capability("GetMesh", clash, CapsHandler::GetMesh);

        assert!(matches!(result, Err(CapsError::DuplicateId(id)) if id == clash));
        assert!(circuit.capabilities().get("GetMesh").is_none());
        assert_eq!(
            registry.lookup(clash).map(|r| r.handler),
            Some(CapsHandler::EventQueueGet)
        );
    }

    #[test]
    fn test_duplicate_type_keeps_previous_binding() {
        let (circuit, _, _) = test_circuit();
        let seed = circuit.capabilities().get("Seed").unwrap();

        let result = circuit.add_capability("Seed", Uuid::new_v4(), CapsHandler::Seed);

        assert!(matches!(result, Err(CapsError::DuplicateType { .. })));
        assert_eq!(circuit.capabilities().get("Seed"), Some(seed));
    }
}
