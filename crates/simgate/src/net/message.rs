use rkyv::{Archive, Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Tier {
    High,
    Medium,
    Low,
}

impl Tier {
    pub const ALL: [Tier; 3] = [Tier::High, Tier::Medium, Tier::Low];

    pub fn index(self) -> usize {
        match self {
            Tier::High => 0,
            Tier::Medium => 1,
            Tier::Low => 2,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Udp,
    EventQueue,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum MessageKind {
    EventOnly = 0,

    StartPingCheck = 1,
    CompletePingCheck = 2,
    AgentUpdate = 4,
    RequestImage = 8,
    ImageData = 9,
    ImagePacket = 10,
    ObjectUpdate = 12,
    ImprovedTerseObjectUpdate = 15,
    KillObject = 16,
    TransferPacket = 17,

    CrossedRegion = 0xFF07,

    UseCircuitCode = 0xFFFF_0003,
    TeleportFinish = 0xFFFF_0045,
    ChatFromViewer = 0xFFFF_0050,
    ImageNotInDatabase = 0xFFFF_0056,
    CreateInventoryItem = 0xFFFF_007E,
    UpdateInventoryItem = 0xFFFF_007F,
    RemoveInventoryItem = 0xFFFF_0083,
    AlertMessage = 0xFFFF_0086,
    EnableSimulator = 0xFFFF_0097,
    TransferRequest = 0xFFFF_0099,
    TransferInfo = 0xFFFF_009A,
    UpdateCreateInventoryItem = 0xFFFF_00A0,
    ScriptRunningReply = 0xFFFF_00F4,
    LogoutRequest = 0xFFFF_00FC,
    LogoutReply = 0xFFFF_00FD,
    CreateInventoryFolder = 0xFFFF_0111,
    RemoveInventoryFolder = 0xFFFF_0114,
    FetchInventoryDescendents = 0xFFFF_0116,
    InventoryDescendents = 0xFFFF_0117,
    FetchInventory = 0xFFFF_0118,
    FetchInventoryReply = 0xFFFF_0119,
    EstablishAgentCommunication = 0xFFFF_0200,
    PacketAck = 0xFFFF_FFFB,
}

impl MessageKind {
    pub fn id(self) -> u32 {
        self as u32
    }

    pub fn from_id(id: u32) -> Option<Self> {
        let kind = match id {
            0 => Self::EventOnly,
            1 => Self::StartPingCheck,
            2 => Self::CompletePingCheck,
            4 => Self::AgentUpdate,
            8 => Self::RequestImage,
            9 => Self::ImageData,
            10 => Self::ImagePacket,
            12 => Self::ObjectUpdate,
            15 => Self::ImprovedTerseObjectUpdate,
            16 => Self::KillObject,
            17 => Self::TransferPacket,
            0xFF07 => Self::CrossedRegion,
            0xFFFF_0003 => Self::UseCircuitCode,
            0xFFFF_0045 => Self::TeleportFinish,
            0xFFFF_0050 => Self::ChatFromViewer,
            0xFFFF_0056 => Self::ImageNotInDatabase,
            0xFFFF_007E => Self::CreateInventoryItem,
            0xFFFF_007F => Self::UpdateInventoryItem,
            0xFFFF_0083 => Self::RemoveInventoryItem,
            0xFFFF_0086 => Self::AlertMessage,
            0xFFFF_0097 => Self::EnableSimulator,
            0xFFFF_0099 => Self::TransferRequest,
            0xFFFF_009A => Self::TransferInfo,
            0xFFFF_00A0 => Self::UpdateCreateInventoryItem,
            0xFFFF_00F4 => Self::ScriptRunningReply,
            0xFFFF_00FC => Self::LogoutRequest,
            0xFFFF_00FD => Self::LogoutReply,
            0xFFFF_0111 => Self::CreateInventoryFolder,
            0xFFFF_0114 => Self::RemoveInventoryFolder,
            0xFFFF_0116 => Self::FetchInventoryDescendents,
            0xFFFF_0117 => Self::InventoryDescendents,
            0xFFFF_0118 => Self::FetchInventory,
            0xFFFF_0119 => Self::FetchInventoryReply,
            0xFFFF_0200 => Self::EstablishAgentCommunication,
            0xFFFF_FFFB => Self::PacketAck,
            _ => return None,
        };
        Some(kind)
    }

    /// Transmit tier, derived from the numeric range the id falls in.
    pub fn tier(self) -> Tier {
        match self.id() {
            1..=0xFE => Tier::High,
            0xFF01..=0xFFFE => Tier::Medium,
            _ => Tier::Low,
        }
    }

    pub fn delivery(self) -> Delivery {
        match self {
            Self::EventOnly
            | Self::ScriptRunningReply
            | Self::TeleportFinish
            | Self::CrossedRegion
            | Self::EnableSimulator
            | Self::EstablishAgentCommunication => Delivery::EventQueue,
            _ => Delivery::Udp,
        }
    }

    pub fn zerocoded(self) -> bool {
        matches!(
            self,
            Self::ObjectUpdate
                | Self::ImprovedTerseObjectUpdate
                | Self::AgentUpdate
                | Self::FetchInventoryDescendents
                | Self::InventoryDescendents
        )
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::EventOnly => "EventOnly",
            Self::StartPingCheck => "StartPingCheck",
            Self::CompletePingCheck => "CompletePingCheck",
            Self::AgentUpdate => "AgentUpdate",
            Self::RequestImage => "RequestImage",
            Self::ImageData => "ImageData",
            Self::ImagePacket => "ImagePacket",
            Self::ObjectUpdate => "ObjectUpdate",
            Self::ImprovedTerseObjectUpdate => "ImprovedTerseObjectUpdate",
            Self::KillObject => "KillObject",
            Self::TransferPacket => "TransferPacket",
            Self::CrossedRegion => "CrossedRegion",
            Self::UseCircuitCode => "UseCircuitCode",
            Self::TeleportFinish => "TeleportFinish",
            Self::ChatFromViewer => "ChatFromViewer",
            Self::ImageNotInDatabase => "ImageNotInDatabase",
            Self::CreateInventoryItem => "CreateInventoryItem",
            Self::UpdateInventoryItem => "UpdateInventoryItem",
            Self::RemoveInventoryItem => "RemoveInventoryItem",
            Self::AlertMessage => "AlertMessage",
            Self::EnableSimulator => "EnableSimulator",
            Self::TransferRequest => "TransferRequest",
            Self::TransferInfo => "TransferInfo",
            Self::UpdateCreateInventoryItem => "UpdateCreateInventoryItem",
            Self::ScriptRunningReply => "ScriptRunningReply",
            Self::LogoutRequest => "LogoutRequest",
            Self::LogoutReply => "LogoutReply",
            Self::CreateInventoryFolder => "CreateInventoryFolder",
            Self::RemoveInventoryFolder => "RemoveInventoryFolder",
            Self::FetchInventoryDescendents => "FetchInventoryDescendents",
            Self::InventoryDescendents => "InventoryDescendents",
            Self::FetchInventory => "FetchInventory",
            Self::FetchInventoryReply => "FetchInventoryReply",
            Self::EstablishAgentCommunication => "EstablishAgentCommunication",
            Self::PacketAck => "PacketAck",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Archive, Serialize, Deserialize)]
pub struct ObjectData {
    pub local_id: u32,
    pub full_id: Uuid,
    pub parent_id: u32,
    pub pcode: u8,
    pub material: u8,
    pub scale: [f32; 3],
    pub position: [f32; 3],
    pub velocity: [f32; 3],
    pub rotation: [f32; 4],
    pub angular_velocity: [f32; 3],
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Archive, Serialize, Deserialize)]
pub struct TerseData {
    pub local_id: u32,
    pub position: [f32; 3],
    pub velocity: [f32; 3],
    pub rotation: [f32; 4],
    pub angular_velocity: [f32; 3],
}

#[derive(Debug, Clone, PartialEq, Archive, Serialize, Deserialize)]
pub struct ImageRequest {
    pub image_id: Uuid,
    pub discard_level: i8,
    pub priority: f32,
    pub packet: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Archive, Serialize, Deserialize)]
pub enum TransferStatus {
    Ok,
    Done,
    Error,
    UnknownSource,
    InsufficientPermissions,
}

#[derive(Debug, Clone, PartialEq, Archive, Serialize, Deserialize)]
pub struct InventoryItemData {
    pub item_id: Uuid,
    pub folder_id: Uuid,
    pub owner_id: Uuid,
    pub asset_id: Uuid,
    pub asset_type: i8,
    pub inv_type: i8,
    pub name: String,
    pub description: String,
    pub permissions: u32,
}

#[derive(Debug, Clone, PartialEq, Archive, Serialize, Deserialize)]
pub struct InventoryFolderData {
    pub folder_id: Uuid,
    pub parent_id: Uuid,
    pub folder_type: i8,
    pub name: String,
}

/// Field limits that keep a page of inventory records, or one object
/// update, inside a single datagram.
pub const MAX_NAME_BYTES: usize = 63;
pub const MAX_DESCRIPTION_BYTES: usize = 127;
pub const MAX_OBJECT_TEXT_BYTES: usize = 254;

/// Cuts `text` to at most `max` bytes without splitting a character.
pub fn truncate_utf8(text: &mut String, max: usize) {
    if text.len() <= max {
        return;
    }
    let mut end = max;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    text.truncate(end);
}

impl InventoryItemData {
    /// Copy with name and description cut to their wire limits.
    pub fn clamped(mut self) -> Self {
        truncate_utf8(&mut self.name, MAX_NAME_BYTES);
        truncate_utf8(&mut self.description, MAX_DESCRIPTION_BYTES);
        self
    }
}

impl InventoryFolderData {
    pub fn clamped(mut self) -> Self {
        truncate_utf8(&mut self.name, MAX_NAME_BYTES);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Archive, Serialize, Deserialize)]
pub enum Message {
    EventOnly {
        name: String,
        body: String,
    },
    StartPingCheck {
        ping_id: u8,
        oldest_unacked: u32,
    },
    CompletePingCheck {
        ping_id: u8,
    },
    AgentUpdate {
        agent_id: Uuid,
        session_id: Uuid,
        body_rotation: [f32; 4],
        camera_center: [f32; 3],
        control_flags: u32,
    },
    RequestImage {
        agent_id: Uuid,
        requests: Vec<ImageRequest>,
    },
    ImageData {
        image_id: Uuid,
        codec: u8,
        size: u32,
        packets: u16,
        data: Vec<u8>,
    },
    ImagePacket {
        image_id: Uuid,
        packet: u16,
        data: Vec<u8>,
    },
    ObjectUpdate {
        region_handle: u64,
        time_dilation: u16,
        objects: Vec<ObjectData>,
    },
    ImprovedTerseObjectUpdate {
        region_handle: u64,
        time_dilation: u16,
        objects: Vec<TerseData>,
    },
    KillObject {
        local_ids: Vec<u32>,
    },
    TransferPacket {
        transfer_id: Uuid,
        channel: i32,
        packet: u32,
        status: TransferStatus,
        data: Vec<u8>,
    },
    CrossedRegion {
        agent_id: Uuid,
        region_handle: u64,
        sim_address: String,
        seed_capability: String,
    },
    UseCircuitCode {
        code: u32,
        session_id: Uuid,
        agent_id: Uuid,
    },
    TeleportFinish {
        agent_id: Uuid,
        region_handle: u64,
        sim_address: String,
        seed_capability: String,
    },
    ChatFromViewer {
        agent_id: Uuid,
        channel: i32,
        chat_type: u8,
        message: String,
    },
    ImageNotInDatabase {
        image_id: Uuid,
    },
    CreateInventoryItem {
        callback_id: u32,
        folder_id: Uuid,
        asset_type: i8,
        inv_type: i8,
        name: String,
        description: String,
    },
    UpdateInventoryItem {
        item: InventoryItemData,
    },
    RemoveInventoryItem {
        item_ids: Vec<Uuid>,
    },
    AlertMessage {
        message: String,
    },
    EnableSimulator {
        region_handle: u64,
        sim_address: String,
    },
    TransferRequest {
        transfer_id: Uuid,
        channel: i32,
        asset_id: Uuid,
        asset_type: i8,
    },
    TransferInfo {
        transfer_id: Uuid,
        channel: i32,
        status: TransferStatus,
        size: u32,
    },
    UpdateCreateInventoryItem {
        callback_id: u32,
        item: InventoryItemData,
    },
    ScriptRunningReply {
        object_id: Uuid,
        item_id: Uuid,
        running: bool,
        mono: bool,
    },
    LogoutRequest {
        agent_id: Uuid,
        session_id: Uuid,
    },
    LogoutReply {
        agent_id: Uuid,
        session_id: Uuid,
    },
    CreateInventoryFolder {
        folder_id: Uuid,
        parent_id: Uuid,
        folder_type: i8,
        name: String,
    },
    RemoveInventoryFolder {
        folder_ids: Vec<Uuid>,
    },
    FetchInventoryDescendents {
        folder_id: Uuid,
        owner_id: Uuid,
        fetch_folders: bool,
        fetch_items: bool,
    },
    InventoryDescendents {
        folder_id: Uuid,
        owner_id: Uuid,
        descendents: u32,
        folders: Vec<InventoryFolderData>,
        items: Vec<InventoryItemData>,
    },
    FetchInventory {
        owner_id: Uuid,
        item_ids: Vec<Uuid>,
    },
    FetchInventoryReply {
        items: Vec<InventoryItemData>,
    },
    EstablishAgentCommunication {
        agent_id: Uuid,
        sim_address: String,
        seed_capability: String,
    },
    PacketAck {
        ids: Vec<u32>,
    },
}

impl Message {
    pub fn kind(&self) -> MessageKind {
        match self {
            Self::EventOnly { .. } => MessageKind::EventOnly,
            Self::StartPingCheck { .. } => MessageKind::StartPingCheck,
            Self::CompletePingCheck { .. } => MessageKind::CompletePingCheck,
            Self::AgentUpdate { .. } => MessageKind::AgentUpdate,
            Self::RequestImage { .. } => MessageKind::RequestImage,
            Self::ImageData { .. } => MessageKind::ImageData,
            Self::ImagePacket { .. } => MessageKind::ImagePacket,
            Self::ObjectUpdate { .. } => MessageKind::ObjectUpdate,
            Self::ImprovedTerseObjectUpdate { .. } => MessageKind::ImprovedTerseObjectUpdate,
            Self::KillObject { .. } => MessageKind::KillObject,
            Self::TransferPacket { .. } => MessageKind::TransferPacket,
            Self::CrossedRegion { .. } => MessageKind::CrossedRegion,
            Self::UseCircuitCode { .. } => MessageKind::UseCircuitCode,
            Self::TeleportFinish { .. } => MessageKind::TeleportFinish,
            Self::ChatFromViewer { .. } => MessageKind::ChatFromViewer,
            Self::ImageNotInDatabase { .. } => MessageKind::ImageNotInDatabase,
            Self::CreateInventoryItem { .. } => MessageKind::CreateInventoryItem,
            Self::UpdateInventoryItem { .. } => MessageKind::UpdateInventoryItem,
            Self::RemoveInventoryItem { .. } => MessageKind::RemoveInventoryItem,
            Self::AlertMessage { .. } => MessageKind::AlertMessage,
            Self::EnableSimulator { .. } => MessageKind::EnableSimulator,
            Self::TransferRequest { .. } => MessageKind::TransferRequest,
            Self::TransferInfo { .. } => MessageKind::TransferInfo,
            Self::UpdateCreateInventoryItem { .. } => MessageKind::UpdateCreateInventoryItem,
            Self::ScriptRunningReply { .. } => MessageKind::ScriptRunningReply,
            Self::LogoutRequest { .. } => MessageKind::LogoutRequest,
            Self::LogoutReply { .. } => MessageKind::LogoutReply,
            Self::CreateInventoryFolder { .. } => MessageKind::CreateInventoryFolder,
            Self::RemoveInventoryFolder { .. } => MessageKind::RemoveInventoryFolder,
            Self::FetchInventoryDescendents { .. } => MessageKind::FetchInventoryDescendents,
            Self::InventoryDescendents { .. } => MessageKind::InventoryDescendents,
            Self::FetchInventory { .. } => MessageKind::FetchInventory,
            Self::FetchInventoryReply { .. } => MessageKind::FetchInventoryReply,
            Self::EstablishAgentCommunication { .. } => MessageKind::EstablishAgentCommunication,
            Self::PacketAck { .. } => MessageKind::PacketAck,
        }
    }

    pub fn alert(message: impl Into<String>) -> Self {
        Self::AlertMessage {
            message: message.into(),
        }
    }
}
