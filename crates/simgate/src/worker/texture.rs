use log::{debug, trace};

use super::{WorkerError, chunks, fetch_asset};
use crate::circuit::Circuit;
use crate::net::{ImageRequest, Message};

pub const IMAGE_CODEC_J2C: u8 = 2;

/// Streams one texture as an ImageData header chunk followed by ImagePacket
/// chunks, starting at the packet the client asked for.
pub async fn process_image_request(
    circuit: &Circuit,
    request: ImageRequest,
) -> Result<(), WorkerError> {
    let image_id = request.image_id;
    if request.discard_level < 0 {
        trace!("circuit {} cancelled image {}", circuit.code(), image_id);
        return Ok(());
    }

    let asset = match fetch_asset(circuit, image_id).await {
        Ok(Some(asset)) => asset,
        Ok(None) => return Err(WorkerError::ImageNotFound(image_id)),
        Err(err) => {
            debug!("image {} lookup failed: {}", image_id, err);
            return Err(WorkerError::ImageNotFound(image_id));
        }
    };

    let config = circuit.config();
    let parts = chunks(&asset.data, config.image_first_chunk, config.image_chunk);
    let size = u32::try_from(asset.data.len()).map_err(|_| WorkerError::TooLarge(image_id))?;
    let packets = u16::try_from(parts.total()).map_err(|_| WorkerError::TooLarge(image_id))?;

    for chunk in parts {
        if (chunk.index as u32) < request.packet {
            continue;
        }

        let message = if chunk.index == 0 {
            Message::ImageData {
                image_id,
                codec: IMAGE_CODEC_J2C,
                size,
                packets,
                data: chunk.data.to_vec(),
            }
        } else {
            Message::ImagePacket {
                image_id,
                packet: chunk.index as u16,
                data: chunk.data.to_vec(),
            }
        };
        let reliable = chunk.index == 0;
        circuit.send_message(message, reliable).await?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use uuid::Uuid;

    use super::*;
    use crate::circuit::testing::{queued_messages, take_transmit, test_circuit, test_circuit_with};
    use crate::services::{
        ASSET_TYPE_TEXTURE, Asset, AssetStore, LocalScene, MemoryAssetStore, MemoryInventory, ServiceUrls,
        StaticAgentServices,
    };

    fn request(image_id: Uuid, packet: u32) -> ImageRequest {
        ImageRequest {
            image_id,
            discard_level: 0,
            priority: 1.0,
            packet,
        }
    }

    #[tokio::test]
    async fn test_texture_streamed_in_chunks() {
        let (circuit, _, _) = test_circuit();
        let scene = Arc::new(LocalScene::new("a", (1000, 1000)));
        let texture = Asset::new(Uuid::new_v4(), ASSET_TYPE_TEXTURE, vec![7u8; 2500]);
        scene.assets().insert(texture.clone());
        circuit.attach_scene(scene).unwrap();
        let mut transmit = take_transmit(&circuit);

        process_image_request(&circuit, request(texture.id, 0))
            .await
            .unwrap();

        let sent = queued_messages(&mut transmit);
        assert_eq!(sent.len(), 3);
        assert!(matches!(
            &sent[0],
            Message::ImageData { size: 2500, packets: 3, data, .. } if data.len() == 600
        ));
        assert!(matches!(&sent[1], Message::ImagePacket { packet: 1, data, .. } if data.len() == 1000));
        assert!(matches!(&sent[2], Message::ImagePacket { packet: 2, data, .. } if data.len() == 900));
    }

    #[tokio::test]
    async fn test_texture_resumes_from_packet() {
        let (circuit, _, _) = test_circuit();
        let scene = Arc::new(LocalScene::new("a", (1000, 1000)));
        let texture = Asset::new(Uuid::new_v4(), ASSET_TYPE_TEXTURE, vec![1u8; 2500]);
        scene.assets().insert(texture.clone());
        circuit.attach_scene(scene).unwrap();
        let mut transmit = take_transmit(&circuit);

        process_image_request(&circuit, request(texture.id, 2))
            .await
            .unwrap();

        let sent = queued_messages(&mut transmit);
        assert!(matches!(sent.as_slice(), [Message::ImagePacket { packet: 2, .. }]));
    }

    #[tokio::test]
    async fn test_home_asset_cached_in_scene() {
        let home = Arc::new(MemoryAssetStore::new());
        let texture = Asset::new(Uuid::new_v4(), ASSET_TYPE_TEXTURE, vec![3u8; 100]);
        home.insert(texture.clone());
        let services = Arc::new(StaticAgentServices::new(
            Some(home as Arc<dyn AssetStore>),
            Arc::new(MemoryInventory::new()),
            ServiceUrls::default(),
        ));
        let (circuit, _, _) = test_circuit_with(services);
        let scene = Arc::new(LocalScene::new("a", (1000, 1000)));
        circuit.attach_scene(scene.clone()).unwrap();
        let mut transmit = take_transmit(&circuit);

        process_image_request(&circuit, request(texture.id, 0))
            .await
            .unwrap();

        assert!(scene.assets().contains(texture.id));
        assert!(matches!(
            queued_messages(&mut transmit).as_slice(),
            [Message::ImageData { packets: 1, .. }]
        ));
    }

    #[tokio::test]
    async fn test_missing_texture_reported() {
        let (circuit, _, _) = test_circuit();
        let id = Uuid::new_v4();

        let result = process_image_request(&circuit, request(id, 0)).await;

        assert!(matches!(result, Err(WorkerError::ImageNotFound(missing)) if missing == id));
    }

    #[tokio::test]
    async fn test_negative_discard_cancels() {
        let (circuit, _, _) = test_circuit();
        let mut cancel = request(Uuid::new_v4(), 0);
        cancel.discard_level = -1;

        assert!(process_image_request(&circuit, cancel).await.is_ok());
    }
}
