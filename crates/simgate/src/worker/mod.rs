mod chunk;
mod inventory;
mod texture;

use std::future::Future;
use std::sync::Arc;

use log::{debug, warn};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::circuit::{Circuit, CircuitError};
use crate::net::{ImageRequest, Message, TransferStatus};
use crate::services::{Asset, ServiceError};

pub use chunk::{Chunk, Chunks, chunk_count, chunks};
pub use inventory::{ITEMS_PER_PACKET, process_inventory};
pub use texture::{IMAGE_CODEC_J2C, process_image_request};

#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error("image {0} not found")]
    ImageNotFound(Uuid),
    #[error("asset {0} is too large to stream")]
    TooLarge(Uuid),
    #[error("transfer {transfer_id} failed: {status:?}")]
    Transfer {
        transfer_id: Uuid,
        channel: i32,
        status: TransferStatus,
    },
    #[error(transparent)]
    Service(#[from] ServiceError),
    #[error("{0} is not handled by this worker")]
    Unsupported(&'static str),
    #[error(transparent)]
    Circuit(#[from] CircuitError),
}

impl WorkerError {
    /// The message that tells the client its request failed, if any.
    pub fn notification(&self) -> Option<Message> {
        match self {
            Self::ImageNotFound(image_id) | Self::TooLarge(image_id) => {
                Some(Message::ImageNotInDatabase {
                    image_id: *image_id,
                })
            }
            Self::Transfer {
                transfer_id,
                channel,
                status,
            } => Some(Message::TransferInfo {
                transfer_id: *transfer_id,
                channel: *channel,
                status: *status,
                size: 0,
            }),
            Self::Service(err) => Some(Message::alert(format!("Inventory request failed: {err}"))),
            Self::Unsupported(_) | Self::Circuit(_) => None,
        }
    }
}

/// Looks an asset up in the attached scene's store first, then in the
/// agent's home store. Home hits are copied into the scene store.
pub async fn fetch_asset(circuit: &Circuit, asset_id: Uuid) -> Result<Option<Asset>, ServiceError> {
    let scene_store = circuit.scene().map(|scene| scene.asset_store());

    if let Some(store) = &scene_store {
        match store.get(asset_id).await {
            Ok(Some(asset)) => return Ok(Some(asset)),
            Ok(None) => {}
            Err(err) => debug!("scene asset lookup for {} failed: {}", asset_id, err),
        }
    }

    let Some(home) = circuit.services().home_asset_store(circuit.agent_id()) else {
        return Ok(None);
    };
    let Some(asset) = home.get(asset_id).await? else {
        return Ok(None);
    };

    if let Some(store) = scene_store {
        if let Err(err) = store.store(asset.clone()).await {
            debug!("caching asset {} in scene failed: {}", asset_id, err);
        }
    }
    Ok(Some(asset))
}

async fn run_worker<J, F, Fut>(
    circuit: Arc<Circuit>,
    mut jobs: mpsc::Receiver<J>,
    name: &'static str,
    process: F,
) where
    F: Fn(Arc<Circuit>, J) -> Fut,
    Fut: Future<Output = Result<(), WorkerError>>,
{
    let cancel = circuit.cancellation();

    loop {
        let job = tokio::select! {
            _ = cancel.cancelled() => break,
            job = jobs.recv() => match job {
                Some(job) => job,
                None => break,
            },
        };

        // Cancellation is only observed between jobs.
        let result = process(circuit.clone(), job).await;

        if let Err(err) = result {
            warn!("circuit {} {} request failed: {}", circuit.code(), name, err);
            if let Some(notice) = err.notification() {
                if let Err(err) = circuit.send_message(notice, true).await {
                    debug!(
                        "circuit {} could not report {} failure: {}",
                        circuit.code(),
                        name,
                        err
                    );
                }
            }
        }
    }

    debug!("circuit {} {} worker stopped", circuit.code(), name);
}

pub async fn run_texture_worker(circuit: Arc<Circuit>, jobs: mpsc::Receiver<ImageRequest>) {
    run_worker(circuit, jobs, "texture", |circuit, request| async move {
        process_image_request(&circuit, request).await
    })
    .await
}

pub async fn run_inventory_worker(circuit: Arc<Circuit>, jobs: mpsc::Receiver<Message>) {
    run_worker(circuit, jobs, "inventory", |circuit, message| async move {
        process_inventory(&circuit, message).await
    })
    .await
}
