mod directory;
mod dispatcher;
mod events;
mod message;
mod protocol;
mod stats;
mod tracking;
mod transport;

pub use directory::{BindError, CircuitDirectory, DirectoryError};
pub use dispatcher::{DispatchError, SocketDispatcher};
pub use events::DispatcherEvent;
pub use message::{
    Delivery, ImageRequest, InventoryFolderData, InventoryItemData, MAX_DESCRIPTION_BYTES,
    MAX_NAME_BYTES, MAX_OBJECT_TEXT_BYTES, Message, MessageKind, ObjectData, TerseData, Tier,
    TransferStatus, truncate_utf8,
};
pub use protocol::{
    DEFAULT_HTTP_PORT, DEFAULT_PORT, MAX_APPENDED_ACKS, MAX_PACKET_SIZE, MIN_PACKET_SIZE, Packet,
    PacketError, PacketFlags, PacketHeader, sequence_greater_than, zero_decode, zero_encode,
};
pub use stats::{CircuitStats, NetworkStats};
pub use tracking::{PendingAcks, ReceiveTracker, UnackedPacket, UnackedPackets};
pub use transport::{BufferPool, DatagramSink};

#[cfg(test)]
pub(crate) use transport::RecordingSink;
