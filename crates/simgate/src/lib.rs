pub mod caps;
pub mod circuit;
pub mod config;
pub mod net;
pub mod services;
pub mod update;
pub mod worker;

pub use caps::{CapabilityRouter, CapsError, CapsHandler, CapsRegistry, CapsState};
pub use circuit::{Circuit, CircuitError, CircuitInfo, CircuitState, CloseReason};
pub use config::{CapabilitySetting, CapsConfig, CircuitConfig};
pub use net::{
    DEFAULT_HTTP_PORT, DEFAULT_PORT, DispatchError, DispatcherEvent, Message, MessageKind,
    NetworkStats, Packet, PacketError, PacketHeader, SocketDispatcher,
};
pub use services::{AgentServices, AssetStore, InventoryService, LocalScene, Scene};
pub use update::{ObjectState, ObjectUpdate, Scheduled, UpdateScheduler};
