mod memory;

use std::sync::Arc;

use async_trait::async_trait;
use uuid::Uuid;

use crate::caps::CapsHandler;
use crate::net::{InventoryFolderData, InventoryItemData, Message};

pub use memory::{LocalScene, MemoryAssetStore, MemoryInventory, StaticAgentServices};

pub const ASSET_TYPE_TEXTURE: i8 = 0;
pub const ASSET_TYPE_MESH: i8 = 49;

pub type InventoryItem = InventoryItemData;
pub type InventoryFolder = InventoryFolderData;

#[derive(Debug, Clone, PartialEq)]
pub struct Asset {
    pub id: Uuid,
    pub asset_type: i8,
    pub name: String,
    pub data: Vec<u8>,
    pub temporary: bool,
}

impl Asset {
    pub fn new(id: Uuid, asset_type: i8, data: Vec<u8>) -> Self {
        Self {
            id,
            asset_type,
            name: String::new(),
            data,
            temporary: false,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct FolderContents {
    pub folders: Vec<InventoryFolder>,
    pub items: Vec<InventoryItem>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServiceUrls {
    pub home_uri: String,
    pub inventory_uri: String,
}

#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("{0} not found")]
    NotFound(Uuid),
    #[error("permission denied for {0}")]
    PermissionDenied(Uuid),
    #[error("service unavailable: {0}")]
    Unavailable(String),
}

#[async_trait]
pub trait AssetStore: Send + Sync {
    async fn get(&self, id: Uuid) -> Result<Option<Asset>, ServiceError>;

    async fn store(&self, asset: Asset) -> Result<Uuid, ServiceError>;
}

#[async_trait]
pub trait InventoryService: Send + Sync {
    async fn get_item(&self, owner: Uuid, item_id: Uuid) -> Result<InventoryItem, ServiceError>;

    async fn get_folder_contents(
        &self,
        owner: Uuid,
        folder_id: Uuid,
    ) -> Result<FolderContents, ServiceError>;

    async fn add_item(&self, item: InventoryItem) -> Result<(), ServiceError>;

    async fn update_item(&self, owner: Uuid, item: InventoryItem) -> Result<(), ServiceError>;

    async fn delete_items(&self, owner: Uuid, item_ids: &[Uuid]) -> Result<(), ServiceError>;

    async fn add_folder(&self, owner: Uuid, folder: InventoryFolder) -> Result<(), ServiceError>;

    async fn delete_folders(&self, owner: Uuid, folder_ids: &[Uuid]) -> Result<(), ServiceError>;
}

/// The region a circuit is attached to, as far as the transport cares.
pub trait Scene: Send + Sync {
    fn scene_id(&self) -> Uuid;

    fn grid_position(&self) -> (u32, u32);

    fn region_handle(&self) -> u64 {
        let (x, y) = self.grid_position();
        ((x as u64 * 256) << 32) | (y as u64 * 256)
    }

    fn asset_store(&self) -> Arc<dyn AssetStore>;

    /// Capabilities every agent in this scene receives on attach.
    fn capability_declarations(&self) -> Vec<CapsHandler>;

    fn has_agent(&self, agent_id: Uuid) -> bool;

    fn add_agent(&self, agent_id: Uuid);

    fn remove_agent(&self, agent_id: Uuid);

    fn attach_chat_listener(&self, agent_id: Uuid);

    fn detach_chat_listener(&self, agent_id: Uuid);

    /// Inbound messages the transport does not handle itself.
    fn deliver(&self, agent_id: Uuid, message: Message);
}

pub trait AgentServices: Send + Sync {
    fn home_asset_store(&self, agent_id: Uuid) -> Option<Arc<dyn AssetStore>>;

    fn inventory(&self, agent_id: Uuid) -> Arc<dyn InventoryService>;

    fn service_urls(&self, agent_id: Uuid) -> ServiceUrls;
}
