use axum::http::StatusCode;
use log::debug;
use uuid::Uuid;

use crate::circuit::Circuit;
use crate::services::ASSET_TYPE_MESH;
use crate::worker::fetch_asset;

pub const MESH_CONTENT_TYPE: &str = "application/vnd.ll.mesh";

/// Raw mesh bytes for `mesh_id`. Anything but a mesh asset that exists is 404.
pub async fn fetch_mesh(circuit: &Circuit, mesh_id: Option<&str>) -> Result<Vec<u8>, StatusCode> {
    let mesh_id = mesh_id
        .and_then(|id| Uuid::parse_str(id).ok())
        .ok_or(StatusCode::NOT_FOUND)?;

    match fetch_asset(circuit, mesh_id).await {
        Ok(Some(asset)) if asset.asset_type == ASSET_TYPE_MESH => Ok(asset.data),
        Ok(_) => Err(StatusCode::NOT_FOUND),
        Err(err) => {
            debug!("mesh {} lookup failed: {}", mesh_id, err);
            Err(StatusCode::NOT_FOUND)
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::circuit::testing::test_circuit;
    use crate::services::{ASSET_TYPE_TEXTURE, Asset, LocalScene};

    #[tokio::test]
    async fn test_mesh_lookup() {
        let (circuit, _, _) = test_circuit();
        let scene = Arc::new(LocalScene::new("a", (1000, 1000)));
        let mesh = Asset::new(Uuid::new_v4(), ASSET_TYPE_MESH, vec![1, 2, 3]);
        let texture = Asset::new(Uuid::new_v4(), ASSET_TYPE_TEXTURE, vec![4]);
        scene.assets().insert(mesh.clone());
        scene.assets().insert(texture.clone());
        circuit.attach_scene(scene).unwrap();

        let mesh_id = mesh.id.to_string();
        let texture_id = texture.id.to_string();
        assert_eq!(fetch_mesh(&circuit, Some(&mesh_id)).await, Ok(vec![1, 2, 3]));
        assert_eq!(
            fetch_mesh(&circuit, Some(&texture_id)).await,
            Err(StatusCode::NOT_FOUND)
        );
        assert_eq!(
            fetch_mesh(&circuit, Some("not-a-uuid")).await,
            Err(StatusCode::NOT_FOUND)
        );
        assert_eq!(fetch_mesh(&circuit, None).await, Err(StatusCode::NOT_FOUND));
    }
}
