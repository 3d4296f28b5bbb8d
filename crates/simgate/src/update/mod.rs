mod scheduler;

use std::sync::Arc;

use glam::{Quat, Vec3};
use uuid::Uuid;

use crate::net::{MAX_OBJECT_TEXT_BYTES, ObjectData, TerseData, truncate_utf8};

pub use scheduler::{Scheduled, TIME_DILATION_NONE, UpdateScheduler};

pub const PCODE_PRIMITIVE: u8 = 9;
pub const PCODE_AVATAR: u8 = 47;

/// Snapshot of a scene object as the viewer needs to draw it.
#[derive(Debug, Clone, PartialEq)]
pub struct ObjectState {
    pub local_id: u32,
    pub full_id: Uuid,
    pub parent_id: u32,
    pub pcode: u8,
    pub material: u8,
    pub scale: Vec3,
    pub position: Vec3,
    pub velocity: Vec3,
    pub rotation: Quat,
    pub angular_velocity: Vec3,
    pub text: String,
}

impl ObjectState {
    pub fn new(local_id: u32, full_id: Uuid) -> Self {
        Self {
            local_id,
            full_id,
            parent_id: 0,
            pcode: PCODE_PRIMITIVE,
            material: 0,
            scale: Vec3::ONE,
            position: Vec3::ZERO,
            velocity: Vec3::ZERO,
            rotation: Quat::IDENTITY,
            angular_velocity: Vec3::ZERO,
            text: String::new(),
        }
    }

    /// Full description for the wire. Hover text is cut to its wire limit.
    pub fn full_data(&self) -> ObjectData {
        let mut text = self.text.clone();
        truncate_utf8(&mut text, MAX_OBJECT_TEXT_BYTES);
        ObjectData {
            local_id: self.local_id,
            full_id: self.full_id,
            parent_id: self.parent_id,
            pcode: self.pcode,
            material: self.material,
            scale: self.scale.to_array(),
            position: self.position.to_array(),
            velocity: self.velocity.to_array(),
            rotation: self.rotation.to_array(),
            angular_velocity: self.angular_velocity.to_array(),
            text,
        }
    }

    pub fn terse_data(&self) -> TerseData {
        TerseData {
            local_id: self.local_id,
            position: self.position.to_array(),
            velocity: self.velocity.to_array(),
            rotation: self.rotation.to_array(),
            angular_velocity: self.angular_velocity.to_array(),
        }
    }
}

/// One change to an object, as submitted by the scene.
#[derive(Debug, Clone)]
pub struct ObjectUpdate {
    pub local_id: u32,
    /// Bumped by the scene whenever the object's full description changes.
    pub serial: u64,
    pub killed: bool,
    pub physics: bool,
    pub state: Arc<ObjectState>,
}

impl ObjectUpdate {
    pub fn new(state: Arc<ObjectState>, serial: u64) -> Self {
        Self {
            local_id: state.local_id,
            serial,
            killed: false,
            physics: false,
            state,
        }
    }

    pub fn physical(mut self) -> Self {
        self.physics = true;
        self
    }

    pub fn killed(mut self) -> Self {
        self.killed = true;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::{Message, Packet, PacketHeader};

    #[test]
    fn test_long_hover_text_still_fits_a_datagram() {
        let mut state = ObjectState::new(7, Uuid::new_v4());
        state.text = "x".repeat(4000);

        let data = state.full_data();
        assert_eq!(data.text.len(), MAX_OBJECT_TEXT_BYTES);

        let update = Message::ObjectUpdate {
            region_handle: 0,
            time_dilation: TIME_DILATION_NONE,
            objects: vec![data],
        };
        assert!(Packet::new(PacketHeader::new(1, true), update).serialize().is_ok());
    }
}
