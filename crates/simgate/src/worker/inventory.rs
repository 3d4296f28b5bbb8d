use log::debug;
use uuid::Uuid;

use super::{WorkerError, chunks, fetch_asset};
use crate::circuit::Circuit;
use crate::net::{Message, TransferStatus};
use crate::services::{InventoryFolder, InventoryItem, ServiceError};

/// Items or folders per reply packet, keeping replies under the MTU.
pub const ITEMS_PER_PACKET: usize = 4;

const PERMISSIONS_ALL: u32 = 0x7FFF_FFFF;

pub async fn process_inventory(circuit: &Circuit, message: Message) -> Result<(), WorkerError> {
    let agent_id = circuit.agent_id();
    let inventory = circuit.services().inventory(agent_id);

    match message {
        Message::TransferRequest {
            transfer_id,
            channel,
            asset_id,
            asset_type,
        } => transfer_asset(circuit, transfer_id, channel, asset_id, asset_type).await,

        Message::FetchInventory { owner_id, item_ids } => {
            if owner_id != agent_id {
                return Err(ServiceError::PermissionDenied(owner_id).into());
            }

            let mut items = Vec::with_capacity(item_ids.len());
            let mut failure = None;
            for item_id in item_ids {
                match inventory.get_item(agent_id, item_id).await {
                    Ok(item) => items.push(item),
                    Err(err) => {
                        failure.get_or_insert(err);
                    }
                }
            }

            for batch in items.chunks(ITEMS_PER_PACKET) {
                let reply = Message::FetchInventoryReply {
                    items: batch.iter().cloned().map(InventoryItem::clamped).collect(),
                };
                circuit.send_message(reply, true).await?;
            }

            match failure {
                Some(err) => Err(err.into()),
                None => Ok(()),
            }
        }

        Message::FetchInventoryDescendents {
            folder_id,
            owner_id,
            fetch_folders,
            fetch_items,
        } => {
            if owner_id != agent_id {
                return Err(ServiceError::PermissionDenied(owner_id).into());
            }

            let contents = inventory.get_folder_contents(agent_id, folder_id).await?;
            let descendents = (contents.folders.len() + contents.items.len()) as u32;
            let folders = if fetch_folders {
                contents.folders
            } else {
                Vec::new()
            };
            let items = if fetch_items {
                contents.items
            } else {
                Vec::new()
            };

            for (folders, items) in descendent_pages(folders, items) {
                let reply = Message::InventoryDescendents {
                    folder_id,
                    owner_id,
                    descendents,
                    folders,
                    items,
                };
                circuit.send_message(reply, true).await?;
            }
            Ok(())
        }

        Message::CreateInventoryItem {
            callback_id,
            folder_id,
            asset_type,
            inv_type,
            name,
            description,
        } => {
            let item = InventoryItem {
                item_id: Uuid::new_v4(),
                folder_id,
                owner_id: agent_id,
                asset_id: Uuid::nil(),
                asset_type,
                inv_type,
                name,
                description,
                permissions: PERMISSIONS_ALL,
            };
            inventory.add_item(item.clone()).await?;
            let reply = Message::UpdateCreateInventoryItem {
                callback_id,
                item: item.clamped(),
            };
            circuit.send_message(reply, true).await?;
            Ok(())
        }

        Message::UpdateInventoryItem { item } => {
            inventory.update_item(agent_id, item).await?;
            Ok(())
        }

        Message::RemoveInventoryItem { item_ids } => {
            inventory.delete_items(agent_id, &item_ids).await?;
            Ok(())
        }

        Message::CreateInventoryFolder {
            folder_id,
            parent_id,
            folder_type,
            name,
        } => {
            let folder = InventoryFolder {
                folder_id,
                parent_id,
                folder_type,
                name,
            };
            inventory.add_folder(agent_id, folder).await?;
            Ok(())
        }

        Message::RemoveInventoryFolder { folder_ids } => {
            inventory.delete_folders(agent_id, &folder_ids).await?;
            Ok(())
        }

        other => Err(WorkerError::Unsupported(other.kind().name())),
    }
}

async fn transfer_asset(
    circuit: &Circuit,
    transfer_id: Uuid,
    channel: i32,
    asset_id: Uuid,
    asset_type: i8,
) -> Result<(), WorkerError> {
    let failed = |status| WorkerError::Transfer {
        transfer_id,
        channel,
        status,
    };

    let asset = match fetch_asset(circuit, asset_id).await {
        Ok(Some(asset)) => asset,
        Ok(None) => return Err(failed(TransferStatus::UnknownSource)),
        Err(ServiceError::PermissionDenied(_)) => {
            return Err(failed(TransferStatus::InsufficientPermissions));
        }
        Err(err) => {
            debug!("transfer {} lookup failed: {}", transfer_id, err);
            return Err(failed(TransferStatus::Error));
        }
    };
    if asset.asset_type != asset_type {
        debug!(
            "transfer {} asked for type {} but asset {} is type {}",
            transfer_id, asset_type, asset_id, asset.asset_type
        );
    }

    let size = u32::try_from(asset.data.len()).map_err(|_| failed(TransferStatus::Error))?;
    circuit
        .send_message(
            Message::TransferInfo {
                transfer_id,
                channel,
                status: TransferStatus::Ok,
                size,
            },
            true,
        )
        .await?;

    let chunk_size = circuit.config().transfer_chunk;
    for chunk in chunks(&asset.data, chunk_size, chunk_size) {
        let status = if chunk.last {
            TransferStatus::Done
        } else {
            TransferStatus::Ok
        };
        let packet = Message::TransferPacket {
            transfer_id,
            channel,
            packet: chunk.index as u32,
            status,
            data: chunk.data.to_vec(),
        };
        circuit.send_message(packet, true).await?;
    }
    Ok(())
}

fn descendent_pages(
    folders: Vec<InventoryFolder>,
    items: Vec<InventoryItem>,
) -> Vec<(Vec<InventoryFolder>, Vec<InventoryItem>)> {
    let mut pages: Vec<(Vec<InventoryFolder>, Vec<InventoryItem>)> = folders
        .chunks(ITEMS_PER_PACKET)
        .map(|batch| {
            let batch = batch.iter().cloned().map(InventoryFolder::clamped).collect();
            (batch, Vec::new())
        })
        .collect();
    pages.extend(
        items
            .chunks(ITEMS_PER_PACKET)
            .map(|batch| {
                let batch = batch.iter().cloned().map(InventoryItem::clamped).collect();
                (Vec::new(), batch)
            }),
    );
    if pages.is_empty() {
        pages.push((Vec::new(), Vec::new()));
    }
    pages
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::circuit::testing::{queued_messages, take_transmit, test_circuit, test_circuit_with};
    use crate::net::{MAX_DESCRIPTION_BYTES, MAX_NAME_BYTES, Packet, PacketHeader};
    use crate::services::{
        Asset, AssetStore, LocalScene, MemoryAssetStore, MemoryInventory, ServiceUrls,
        StaticAgentServices,
    };

    async fn with_root_folder(circuit: &Circuit) -> Uuid {
        let root = Uuid::new_v4();
        process_inventory(
            circuit,
            Message::CreateInventoryFolder {
                folder_id: root,
                parent_id: Uuid::nil(),
                folder_type: 8,
                name: "My Inventory".into(),
            },
        )
        .await
        .unwrap();
        root
    }

    #[tokio::test]
    async fn test_create_item_replies_with_callback() {
        let (circuit, _, _) = test_circuit();
        let mut transmit = take_transmit(&circuit);
        let root = with_root_folder(&circuit).await;

        process_inventory(
            &circuit,
            Message::CreateInventoryItem {
                callback_id: 77,
                folder_id: root,
                asset_type: 7,
                inv_type: 7,
                name: "notecard".into(),
                description: String::new(),
            },
        )
        .await
        .unwrap();

        let sent = queued_messages(&mut transmit);
        assert!(matches!(
            sent.as_slice(),
            [Message::UpdateCreateInventoryItem { callback_id: 77, item }]
                if item.owner_id == circuit.agent_id() && item.folder_id == root
        ));
    }

    #[tokio::test]
    async fn test_fetch_descendents_pages_contents() {
        let (circuit, _, _) = test_circuit();
        let mut transmit = take_transmit(&circuit);
        let root = with_root_folder(&circuit).await;
        for n in 0..6 {
            process_inventory(
                &circuit,
                Message::CreateInventoryItem {
                    callback_id: n,
                    folder_id: root,
                    asset_type: 0,
                    inv_type: 0,
                    name: format!("item {n}"),
                    description: String::new(),
                },
            )
            .await
            .unwrap();
        }
        queued_messages(&mut transmit);

        process_inventory(
            &circuit,
            Message::FetchInventoryDescendents {
                folder_id: root,
                owner_id: circuit.agent_id(),
                fetch_folders: true,
                fetch_items: true,
            },
        )
        .await
        .unwrap();

        let pages: Vec<(u32, usize)> = queued_messages(&mut transmit)
            .into_iter()
            .filter_map(|message| match message {
                Message::InventoryDescendents {
                    descendents, items, ..
                } => Some((descendents, items.len())),
                _ => None,
            })
            .collect();
        assert_eq!(pages, vec![(6, 4), (6, 2)]);
    }

    #[tokio::test]
    async fn test_long_item_fields_are_clamped_to_fit() {
        let (circuit, _, _) = test_circuit();
        let mut transmit = take_transmit(&circuit);
        let root = with_root_folder(&circuit).await;
        for n in 0..4 {
            process_inventory(
                &circuit,
                Message::CreateInventoryItem {
                    callback_id: n,
                    folder_id: root,
                    asset_type: 7,
                    inv_type: 7,
                    name: "n".repeat(500),
                    description: "d".repeat(2000),
                },
            )
            .await
            .unwrap();
        }
        let item_ids: Vec<Uuid> = queued_messages(&mut transmit)
            .into_iter()
            .filter_map(|message| match message {
                Message::UpdateCreateInventoryItem { item, .. } => Some(item.item_id),
                _ => None,
            })
            .collect();
        assert_eq!(item_ids.len(), 4);

        process_inventory(
            &circuit,
            Message::FetchInventory {
                owner_id: circuit.agent_id(),
                item_ids,
            },
        )
        .await
        .unwrap();

        let sent = queued_messages(&mut transmit);
        let [reply @ Message::FetchInventoryReply { items }] = sent.as_slice() else {
            panic!("expected one FetchInventoryReply, got {sent:?}");
        };
        assert_eq!(items.len(), 4);
        assert!(items.iter().all(|item| item.name.len() == MAX_NAME_BYTES
            && item.description.len() == MAX_DESCRIPTION_BYTES));
        let packet = Packet::new(PacketHeader::new(1, true), reply.clone());
        assert!(packet.serialize().is_ok());
    }

    #[tokio::test]
    async fn test_fetch_missing_item_fails_after_reply() {
        let (circuit, _, _) = test_circuit();
        let mut transmit = take_transmit(&circuit);

        let result = process_inventory(
            &circuit,
            Message::FetchInventory {
                owner_id: circuit.agent_id(),
                item_ids: vec![Uuid::new_v4()],
            },
        )
        .await;

        assert!(matches!(
            result,
            Err(WorkerError::Service(ServiceError::NotFound(_)))
        ));
        assert!(queued_messages(&mut transmit).is_empty());
    }

    #[tokio::test]
    async fn test_foreign_owner_rejected() {
        let (circuit, _, _) = test_circuit();

        let result = process_inventory(
            &circuit,
            Message::FetchInventory {
                owner_id: Uuid::new_v4(),
                item_ids: Vec::new(),
            },
        )
        .await;

        assert!(matches!(
            result,
            Err(WorkerError::Service(ServiceError::PermissionDenied(_)))
        ));
    }

    #[tokio::test]
    async fn test_transfer_streams_asset() {
        let home = Arc::new(MemoryAssetStore::new());
        let asset = Asset::new(Uuid::new_v4(), 7, vec![9u8; 2500]);
        home.insert(asset.clone());
        let services = Arc::new(StaticAgentServices::new(
            Some(home as Arc<dyn AssetStore>),
            Arc::new(MemoryInventory::new()),
            ServiceUrls::default(),
        ));
        let (circuit, _, _) = test_circuit_with(services);
        circuit
            .attach_scene(Arc::new(LocalScene::new("a", (1000, 1000))))
            .unwrap();
        let mut transmit = take_transmit(&circuit);
        let transfer_id = Uuid::new_v4();

        process_inventory(
            &circuit,
            Message::TransferRequest {
                transfer_id,
                channel: 2,
                asset_id: asset.id,
                asset_type: 7,
            },
        )
        .await
        .unwrap();

        let sent = queued_messages(&mut transmit);
        assert!(sent.iter().any(|m| matches!(
            m,
            Message::TransferInfo { status: TransferStatus::Ok, size: 2500, .. }
        )));
        let statuses: Vec<TransferStatus> = sent
            .iter()
            .filter_map(|m| match m {
                Message::TransferPacket { status, .. } => Some(*status),
                _ => None,
            })
            .collect();
        assert_eq!(
            statuses,
            vec![TransferStatus::Ok, TransferStatus::Ok, TransferStatus::Done]
        );
    }

    #[tokio::test]
    async fn test_transfer_of_missing_asset() {
        let (circuit, _, _) = test_circuit();

        let result = process_inventory(
            &circuit,
            Message::TransferRequest {
                transfer_id: Uuid::new_v4(),
                channel: 2,
                asset_id: Uuid::new_v4(),
                asset_type: 0,
            },
        )
        .await;

        assert!(matches!(
            result,
            Err(WorkerError::Transfer {
                status: TransferStatus::UnknownSource,
                ..
            })
        ));
    }
}
