use std::collections::HashMap;
use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::{Method, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{any, post};
use axum::{Json, Router};
use log::{debug, info};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{
    CapabilityRouter, CapsHandler, EVENT_POLL_WAIT, MESH_CONTENT_TYPE, UploadError, begin_upload,
    complete_upload, fetch_mesh, poll_events, resolve_seed,
};
use crate::circuit::Circuit;
use crate::config::CapsConfig;
use crate::net::{DirectoryError, DispatchError, SocketDispatcher};
use crate::services::Scene;

/// Shared state behind the capability HTTP server.
#[derive(Clone)]
pub struct CapsState {
    pub router: Arc<dyn CapabilityRouter>,
    pub config: Arc<CapsConfig>,
    /// Needed only for session-open requests.
    pub dispatcher: Option<Arc<SocketDispatcher>>,
    pub scene: Option<Arc<dyn Scene>>,
}

pub fn router(state: CapsState) -> Router {
    Router::new()
        .route("/CAPS/{id}", any(capability))
        .route("/CAPS/{id}/uploader/{uploader}", post(uploader))
        .route("/session", post(open_session))
        .with_state(state)
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SessionRequest {
    pub agent_id: Uuid,
    pub session_id: Uuid,
    pub circuit_code: Option<u32>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SessionGrant {
    pub circuit_code: u32,
    pub seed_capability: String,
}

/// Resolves a capability id to its live circuit. Unknown ids, dropped
/// circuits and closed circuits all look the same to the caller.
fn resolve(state: &CapsState, id: &str) -> Result<(CapsHandler, Arc<Circuit>), StatusCode> {
    let id = Uuid::parse_str(id).map_err(|_| StatusCode::NOT_FOUND)?;
    let route = state.router.lookup(id).ok_or(StatusCode::NOT_FOUND)?;
    let circuit = route
        .circuit
        .upgrade()
        .filter(|circuit| !circuit.is_closed())
        .ok_or(StatusCode::NOT_FOUND)?;
    Ok((route.handler, circuit))
}

fn require(method: &Method, allowed: Method) -> Result<(), StatusCode> {
    if *method == allowed {
        Ok(())
    } else {
        Err(StatusCode::METHOD_NOT_ALLOWED)
    }
}

fn upload_status(err: &UploadError) -> StatusCode {
    match err {
        UploadError::NotGranted | UploadError::UnknownUploader(_) => StatusCode::NOT_FOUND,
        UploadError::NoScene => StatusCode::SERVICE_UNAVAILABLE,
        UploadError::Caps(_) => StatusCode::CONFLICT,
        UploadError::Service(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

async fn capability(
    State(state): State<CapsState>,
    Path(id): Path<String>,
    method: Method,
    Query(query): Query<HashMap<String, String>>,
    body: Bytes,
) -> Result<Response, StatusCode> {
    let (handler, circuit) = resolve(&state, &id)?;

    match handler {
        CapsHandler::Seed => {
            require(&method, Method::POST)?;
            let requested: Vec<String> =
                serde_json::from_slice(&body).map_err(|_| StatusCode::BAD_REQUEST)?;
            let resolved = resolve_seed(&circuit, &state.config, &requested);
            debug!(
                "circuit {} seed resolved {} of {} capabilities",
                circuit.code(),
                resolved.len(),
                requested.len()
            );
            Ok(Json(resolved).into_response())
        }
        CapsHandler::EventQueueGet => {
            require(&method, Method::POST)?;
            let events = poll_events(&circuit, EVENT_POLL_WAIT).await?;
            Ok(Json(events).into_response())
        }
        CapsHandler::GetMesh => {
            require(&method, Method::GET)?;
            let mesh = fetch_mesh(&circuit, query.get("mesh_id").map(String::as_str)).await?;
            Ok(([(header::CONTENT_TYPE, MESH_CONTENT_TYPE)], mesh).into_response())
        }
        CapsHandler::UploadBakedTexture => {
            require(&method, Method::POST)?;
            let started = begin_upload(&circuit, &state.config).map_err(|err| {
                debug!("circuit {} upload refused: {}", circuit.code(), err);
                upload_status(&err)
            })?;
            Ok(Json(started).into_response())
        }
        CapsHandler::BakedTextureUploader => Err(StatusCode::NOT_FOUND),
    }
}

async fn uploader(
    State(state): State<CapsState>,
    Path((id, uploader)): Path<(String, String)>,
    body: Bytes,
) -> Result<Json<serde_json::Value>, StatusCode> {
    let (handler, circuit) = resolve(&state, &id)?;
    if handler != CapsHandler::UploadBakedTexture {
        return Err(StatusCode::NOT_FOUND);
    }
    let uploader = Uuid::parse_str(&uploader).map_err(|_| StatusCode::NOT_FOUND)?;

    let done = complete_upload(&circuit, uploader, body.to_vec())
        .await
        .map_err(|err| {
            debug!("circuit {} upload failed: {}", circuit.code(), err);
            upload_status(&err)
        })?;
    Ok(Json(done))
}

async fn open_session(
    State(state): State<CapsState>,
    Json(request): Json<SessionRequest>,
) -> Result<Json<SessionGrant>, StatusCode> {
    let (Some(dispatcher), Some(scene)) = (&state.dispatcher, &state.scene) else {
        return Err(StatusCode::SERVICE_UNAVAILABLE);
    };

    let circuit = dispatcher
        .open_session(
            request.agent_id,
            request.session_id,
            request.circuit_code,
            scene.clone(),
        )
        .map_err(|err| {
            debug!("session for agent {} refused: {}", request.agent_id, err);
            match err {
                DispatchError::Directory(DirectoryError::DuplicateCode(_)) => StatusCode::CONFLICT,
                DispatchError::Directory(DirectoryError::Full) => StatusCode::SERVICE_UNAVAILABLE,
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            }
        })?;

    let seed = circuit
        .capabilities()
        .get(CapsHandler::Seed.type_name())
        .ok_or(StatusCode::INTERNAL_SERVER_ERROR)?;
    info!(
        "opened circuit {} for agent {}",
        circuit.code(),
        circuit.agent_id()
    );
    Ok(Json(SessionGrant {
        circuit_code: circuit.code(),
        seed_capability: state.config.capability_url(&seed.id),
    }))
}
