use std::sync::Arc;

use log::{debug, info};

use super::Circuit;
use crate::caps::CapsError;
use crate::services::Scene;

/// Which scene, if any, a circuit is wired into.
#[derive(Default)]
pub enum Attachment {
    #[default]
    Detached,
    /// Scene capabilities are being registered.
    Attaching,
    Attached(Arc<dyn Scene>),
}

impl Attachment {
    pub fn scene(&self) -> Option<&Arc<dyn Scene>> {
        match self {
            Self::Attached(scene) => Some(scene),
            _ => None,
        }
    }
}

impl Circuit {
    pub fn scene(&self) -> Option<Arc<dyn Scene>> {
        self.attachment
            .lock()
            .ok()
            .and_then(|attachment| attachment.scene().cloned())
    }

    pub fn is_attached(&self) -> bool {
        self.scene().is_some()
    }

    /// Moves the circuit into `scene`, first releasing whatever it was
    /// attached to. On a capability conflict the circuit ends up detached
    /// and the error is returned.
    pub fn attach_scene(&self, scene: Arc<dyn Scene>) -> Result<(), CapsError> {
        let Ok(mut attachment) = self.attachment.lock() else {
            return Err(CapsError::CircuitClosed(self.code()));
        };

        if let Attachment::Attached(previous) =
            std::mem::replace(&mut *attachment, Attachment::Attaching)
        {
            self.release_scene(&previous);
        }

        let mut added = Vec::new();
        for handler in scene.capability_declarations() {
            let cap_type = handler.type_name();
            if let Err(err) = self.add_capability(cap_type, uuid::Uuid::new_v4(), handler) {
                for cap_type in added {
                    self.remove_capability(cap_type);
                }
                *attachment = Attachment::Detached;
                return Err(err);
            }
            added.push(cap_type);
        }

        scene.add_agent(self.agent_id());
        scene.attach_chat_listener(self.agent_id());
        info!(
            "circuit {} attached to scene {}",
            self.code(),
            scene.scene_id()
        );
        *attachment = Attachment::Attached(scene);
        Ok(())
    }

    pub fn detach_scene(&self) -> Option<Arc<dyn Scene>> {
        let mut attachment = self.attachment.lock().ok()?;
        match std::mem::take(&mut *attachment) {
            Attachment::Attached(scene) => {
                self.release_scene(&scene);
                Some(scene)
            }
            _ => None,
        }
    }

    fn release_scene(&self, scene: &Arc<dyn Scene>) {
        for handler in scene.capability_declarations() {
            self.remove_capability(handler.type_name());
        }
        scene.detach_chat_listener(self.agent_id());
        scene.remove_agent(self.agent_id());
        debug!(
            "circuit {} released scene {}",
            self.code(),
            scene.scene_id()
        );
    }
}
