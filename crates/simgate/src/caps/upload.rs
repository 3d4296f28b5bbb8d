use std::sync::Arc;

use log::info;
use serde_json::{Value, json};
use uuid::Uuid;

use super::{CapabilityRoute, CapsError, CapsHandler};
use crate::config::CapsConfig;
use crate::circuit::Circuit;
use crate::services::{ASSET_TYPE_TEXTURE, Asset, ServiceError};

#[derive(Debug, thiserror::Error)]
pub enum UploadError {
    #[error("circuit has no UploadBakedTexture capability")]
    NotGranted,
    #[error("uploader {0} is unknown or already used")]
    UnknownUploader(Uuid),
    #[error("no scene to store the upload in")]
    NoScene,
    #[error(transparent)]
    Caps(#[from] CapsError),
    #[error(transparent)]
    Service(#[from] ServiceError),
}

/// First phase: mints a one-shot uploader endpoint under the circuit's
/// UploadBakedTexture capability. Past `max_pending_uploads` the oldest
/// unused uploader is retired.
pub fn begin_upload(circuit: &Arc<Circuit>, config: &CapsConfig) -> Result<Value, UploadError> {
    let capability = circuit
        .capabilities()
        .get(CapsHandler::UploadBakedTexture.type_name())
        .ok_or(UploadError::NotGranted)?;

    let uploader = Uuid::new_v4();
    circuit.router().register(CapabilityRoute {
        id: uploader,
        cap_type: CapsHandler::BakedTextureUploader.type_name().to_string(),
        handler: CapsHandler::BakedTextureUploader,
        circuit_code: circuit.code(),
        circuit: Arc::downgrade(circuit),
    })?;
    for retired in circuit
        .capabilities()
        .push_uploader(uploader, config.max_pending_uploads)
    {
        circuit.router().unregister(retired);
    }

    let url = format!(
        "{}/uploader/{}",
        config.capability_url(&capability.id),
        uploader
    );
    Ok(json!({ "state": "upload", "uploader": url }))
}

/// Second phase: stores the payload as a new temporary texture and retires
/// the uploader.
pub async fn complete_upload(
    circuit: &Circuit,
    uploader: Uuid,
    data: Vec<u8>,
) -> Result<Value, UploadError> {
    let owned = circuit.router().lookup(uploader).is_some_and(|route| {
        route.handler == CapsHandler::BakedTextureUploader && route.circuit_code == circuit.code()
    });
    if !owned || circuit.router().unregister(uploader).is_none() {
        return Err(UploadError::UnknownUploader(uploader));
    }
    circuit.capabilities().take_uploader(uploader);

    let scene = circuit.scene().ok_or(UploadError::NoScene)?;
    let mut asset = Asset::new(Uuid::new_v4(), ASSET_TYPE_TEXTURE, data);
    asset.name = "baked texture".to_string();
    asset.temporary = true;

    let size = asset.data.len();
    let asset_id = scene.asset_store().store(asset).await?;
    info!(
        "circuit {} uploaded baked texture {} ({} bytes)",
        circuit.code(),
        asset_id,
        size
    );
    Ok(json!({ "state": "complete", "new_asset": asset_id }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::circuit::testing::test_circuit;
    use crate::services::LocalScene;

    fn uploader_id(response: &Value) -> Uuid {
        let url = response["uploader"].as_str().unwrap();
        url.rsplit('/').next().unwrap().parse().unwrap()
    }

    #[tokio::test]
    async fn test_two_phase_upload() {
        let (circuit, _, _) = test_circuit();
        let scene = Arc::new(LocalScene::new("a", (1000, 1000)));
        circuit.attach_scene(scene.clone()).unwrap();
        let config = CapsConfig::default();

        let started = begin_upload(&circuit, &config).unwrap();
        assert_eq!(started["state"], "upload");
        let uploader = uploader_id(&started);

        let done = complete_upload(&circuit, uploader, vec![5; 64]).await.unwrap();
        assert_eq!(done["state"], "complete");
        let asset_id: Uuid = done["new_asset"].as_str().unwrap().parse().unwrap();
        assert!(scene.assets().contains(asset_id));

        assert!(matches!(
            complete_upload(&circuit, uploader, vec![1]).await,
            Err(UploadError::UnknownUploader(_))
        ));
    }

    #[test]
    fn test_upload_requires_capability() {
        let (circuit, _, _) = test_circuit();
        assert!(matches!(
            begin_upload(&circuit, &CapsConfig::default()),
            Err(UploadError::NotGranted)
        ));
    }

    #[tokio::test]
    async fn test_outstanding_uploaders_are_capped() {
        let (circuit, _, registry) = test_circuit();
        circuit
            .attach_scene(Arc::new(LocalScene::new("a", (1000, 1000))))
            .unwrap();
        let config = CapsConfig {
            max_pending_uploads: 3,
            ..Default::default()
        };
        let baseline = registry.len();

        let uploaders: Vec<Uuid> = (0..10)
            .map(|_| uploader_id(&begin_upload(&circuit, &config).unwrap()))
            .collect();

        assert_eq!(registry.len(), baseline + 3);
        assert_eq!(circuit.capabilities().uploader_count(), 3);
        assert!(matches!(
            complete_upload(&circuit, uploaders[0], vec![1]).await,
            Err(UploadError::UnknownUploader(_))
        ));
        assert!(complete_upload(&circuit, uploaders[9], vec![1]).await.is_ok());
        assert_eq!(circuit.capabilities().uploader_count(), 2);
        assert_eq!(registry.len(), baseline + 2);
    }
}
