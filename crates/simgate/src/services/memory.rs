use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, RwLock};

use async_trait::async_trait;
use uuid::Uuid;

use super::{
    AgentServices, Asset, AssetStore, FolderContents, InventoryFolder, InventoryItem,
    InventoryService, Scene, ServiceError, ServiceUrls,
};
use crate::caps::CapsHandler;
use crate::net::Message;

#[derive(Debug, Default)]
pub struct MemoryAssetStore {
    assets: RwLock<HashMap<Uuid, Asset>>,
}

impl MemoryAssetStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, asset: Asset) {
        if let Ok(mut assets) = self.assets.write() {
            assets.insert(asset.id, asset);
        }
    }

    pub fn contains(&self, id: Uuid) -> bool {
        self.assets
            .read()
            .map(|assets| assets.contains_key(&id))
            .unwrap_or(false)
    }

    pub fn len(&self) -> usize {
        self.assets.read().map(|assets| assets.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl AssetStore for MemoryAssetStore {
    async fn get(&self, id: Uuid) -> Result<Option<Asset>, ServiceError> {
        let assets = self
            .assets
            .read()
            .map_err(|_| ServiceError::Unavailable("asset store poisoned".into()))?;
        Ok(assets.get(&id).cloned())
    }

    async fn store(&self, asset: Asset) -> Result<Uuid, ServiceError> {
        let id = asset.id;
        self.insert(asset);
        Ok(id)
    }
}

#[derive(Debug, Default)]
struct InventoryState {
    items: HashMap<Uuid, InventoryItem>,
    folders: HashMap<Uuid, (Uuid, InventoryFolder)>,
}

#[derive(Debug, Default)]
pub struct MemoryInventory {
    state: RwLock<InventoryState>,
}

impl MemoryInventory {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> Result<std::sync::RwLockReadGuard<'_, InventoryState>, ServiceError> {
        self.state
            .read()
            .map_err(|_| ServiceError::Unavailable("inventory poisoned".into()))
    }

    fn write(&self) -> Result<std::sync::RwLockWriteGuard<'_, InventoryState>, ServiceError> {
        self.state
            .write()
            .map_err(|_| ServiceError::Unavailable("inventory poisoned".into()))
    }
}

#[async_trait]
impl InventoryService for MemoryInventory {
    async fn get_item(&self, owner: Uuid, item_id: Uuid) -> Result<InventoryItem, ServiceError> {
        let state = self.read()?;
        let item = state
            .items
            .get(&item_id)
            .ok_or(ServiceError::NotFound(item_id))?;
        if item.owner_id != owner {
            return Err(ServiceError::PermissionDenied(item_id));
        }
        Ok(item.clone())
    }

    async fn get_folder_contents(
        &self,
        owner: Uuid,
        folder_id: Uuid,
    ) -> Result<FolderContents, ServiceError> {
        let state = self.read()?;
        match state.folders.get(&folder_id) {
            Some((folder_owner, _)) if *folder_owner != owner => {
                return Err(ServiceError::PermissionDenied(folder_id));
            }
            Some(_) => {}
            None => return Err(ServiceError::NotFound(folder_id)),
        }

        let folders = state
            .folders
            .values()
            .filter(|(_, folder)| folder.parent_id == folder_id)
            .map(|(_, folder)| folder.clone())
            .collect();
        let items = state
            .items
            .values()
            .filter(|item| item.folder_id == folder_id)
            .cloned()
            .collect();

        Ok(FolderContents { folders, items })
    }

    async fn add_item(&self, item: InventoryItem) -> Result<(), ServiceError> {
        let mut state = self.write()?;
        match state.folders.get(&item.folder_id) {
            Some((owner, _)) if *owner == item.owner_id => {}
            Some(_) => return Err(ServiceError::PermissionDenied(item.folder_id)),
            None => return Err(ServiceError::NotFound(item.folder_id)),
        }
        state.items.insert(item.item_id, item);
        Ok(())
    }

    async fn update_item(&self, owner: Uuid, item: InventoryItem) -> Result<(), ServiceError> {
        let mut state = self.write()?;
        let existing = state
            .items
            .get_mut(&item.item_id)
            .ok_or(ServiceError::NotFound(item.item_id))?;
        if existing.owner_id != owner {
            return Err(ServiceError::PermissionDenied(item.item_id));
        }
        *existing = InventoryItem {
            owner_id: owner,
            ..item
        };
        Ok(())
    }

    async fn delete_items(&self, owner: Uuid, item_ids: &[Uuid]) -> Result<(), ServiceError> {
        let mut state = self.write()?;
        for id in item_ids {
            match state.items.get(id) {
                Some(item) if item.owner_id != owner => {
                    return Err(ServiceError::PermissionDenied(*id));
                }
                Some(_) => {}
                None => return Err(ServiceError::NotFound(*id)),
            }
        }
        for id in item_ids {
            state.items.remove(id);
        }
        Ok(())
    }

    async fn add_folder(&self, owner: Uuid, folder: InventoryFolder) -> Result<(), ServiceError> {
        let mut state = self.write()?;
        if !folder.parent_id.is_nil() {
            match state.folders.get(&folder.parent_id) {
                Some((parent_owner, _)) if *parent_owner != owner => {
                    return Err(ServiceError::PermissionDenied(folder.parent_id));
                }
                Some(_) => {}
                None => return Err(ServiceError::NotFound(folder.parent_id)),
            }
        }
        state.folders.insert(folder.folder_id, (owner, folder));
        Ok(())
    }

    async fn delete_folders(&self, owner: Uuid, folder_ids: &[Uuid]) -> Result<(), ServiceError> {
        let mut state = self.write()?;
        for id in folder_ids {
            match state.folders.get(id) {
                Some((folder_owner, _)) if *folder_owner != owner => {
                    return Err(ServiceError::PermissionDenied(*id));
                }
                Some(_) => {}
                None => return Err(ServiceError::NotFound(*id)),
            }
        }
        for id in folder_ids {
            state.folders.remove(id);
            state.items.retain(|_, item| item.folder_id != *id);
        }
        Ok(())
    }
}

/// Single-region scene backed by in-memory stores.
pub struct LocalScene {
    scene_id: Uuid,
    name: String,
    grid_position: (u32, u32),
    assets: Arc<MemoryAssetStore>,
    declarations: Vec<CapsHandler>,
    agents: RwLock<HashSet<Uuid>>,
    chat_listeners: Mutex<HashSet<Uuid>>,
    delivered: Mutex<Vec<(Uuid, Message)>>,
}

impl LocalScene {
    pub fn new(name: impl Into<String>, grid_position: (u32, u32)) -> Self {
        Self {
            scene_id: Uuid::new_v4(),
            name: name.into(),
            grid_position,
            assets: Arc::new(MemoryAssetStore::new()),
            declarations: vec![CapsHandler::GetMesh, CapsHandler::UploadBakedTexture],
            agents: RwLock::new(HashSet::new()),
            chat_listeners: Mutex::new(HashSet::new()),
            delivered: Mutex::new(Vec::new()),
        }
    }

    pub fn with_declarations(mut self, declarations: Vec<CapsHandler>) -> Self {
        self.declarations = declarations;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn assets(&self) -> &Arc<MemoryAssetStore> {
        &self.assets
    }

    pub fn is_listening(&self, agent_id: Uuid) -> bool {
        self.chat_listeners
            .lock()
            .map(|listeners| listeners.contains(&agent_id))
            .unwrap_or(false)
    }

    pub fn take_delivered(&self) -> Vec<(Uuid, Message)> {
        self.delivered
            .lock()
            .map(|mut delivered| std::mem::take(&mut *delivered))
            .unwrap_or_default()
    }
}

impl Scene for LocalScene {
    fn scene_id(&self) -> Uuid {
        self.scene_id
    }

    fn grid_position(&self) -> (u32, u32) {
        self.grid_position
    }

    fn asset_store(&self) -> Arc<dyn AssetStore> {
        self.assets.clone()
    }

    fn capability_declarations(&self) -> Vec<CapsHandler> {
        self.declarations.clone()
    }

    fn has_agent(&self, agent_id: Uuid) -> bool {
        self.agents
            .read()
            .map(|agents| agents.contains(&agent_id))
            .unwrap_or(false)
    }

    fn add_agent(&self, agent_id: Uuid) {
        if let Ok(mut agents) = self.agents.write() {
            agents.insert(agent_id);
        }
    }

    fn remove_agent(&self, agent_id: Uuid) {
        if let Ok(mut agents) = self.agents.write() {
            agents.remove(&agent_id);
        }
    }

    fn attach_chat_listener(&self, agent_id: Uuid) {
        if let Ok(mut listeners) = self.chat_listeners.lock() {
            listeners.insert(agent_id);
        }
    }

    fn detach_chat_listener(&self, agent_id: Uuid) {
        if let Ok(mut listeners) = self.chat_listeners.lock() {
            listeners.remove(&agent_id);
        }
    }

    fn deliver(&self, agent_id: Uuid, message: Message) {
        if let Ok(mut delivered) = self.delivered.lock() {
            delivered.push((agent_id, message));
        }
    }
}

/// Grid services that are the same for every agent.
pub struct StaticAgentServices {
    home_assets: Option<Arc<dyn AssetStore>>,
    inventory: Arc<dyn InventoryService>,
    urls: ServiceUrls,
}

impl StaticAgentServices {
    pub fn new(
        home_assets: Option<Arc<dyn AssetStore>>,
        inventory: Arc<dyn InventoryService>,
        urls: ServiceUrls,
    ) -> Self {
        Self {
            home_assets,
            inventory,
            urls,
        }
    }
}

impl AgentServices for StaticAgentServices {
    fn home_asset_store(&self, _agent_id: Uuid) -> Option<Arc<dyn AssetStore>> {
        self.home_assets.clone()
    }

    fn inventory(&self, _agent_id: Uuid) -> Arc<dyn InventoryService> {
        self.inventory.clone()
    }

    fn service_urls(&self, _agent_id: Uuid) -> ServiceUrls {
        self.urls.clone()
    }
}
