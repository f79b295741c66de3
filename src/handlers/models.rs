//! # Model Lifecycle REST Handlers
//!
//! HTTP access to the same lifecycle operations the WebSocket protocol
//! offers, for tooling and quick inspection without holding a socket open.
//!
//! ## Available Endpoints:
//! - `GET /api/v1/model` - current state, idle countdown, configured model
//! - `POST /api/v1/model/load` - start loading (idempotent, asynchronous)
//! - `POST /api/v1/model/unload` - release the model
//!
//! Load completion is observable through `GET /api/v1/model` or any
//! connected WebSocket session's `status` stream.

use crate::error::AppError;
use crate::model::lifecycle::UnloadOutcome;
use crate::model::recognizer::ModelSize;
use crate::state::AppState;
use actix_web::{web, HttpResponse};
use serde_json::json;
use std::sync::Arc;
use tracing::error;

pub async fn model_status(state: web::Data<AppState>) -> Result<HttpResponse, AppError> {
    let snapshot = state.lifecycle.status_snapshot().await;
    let config = state.get_config();
    let size: Option<ModelSize> = config.model.size.parse().ok();

    Ok(HttpResponse::Ok().json(json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "model_state": snapshot.state.as_str(),
        "idle_remaining": snapshot.idle_remaining,
        "configured_model": {
            "size": config.model.size,
            "device": config.model.device,
            "language": config.model.language,
            "download_size_mb": size.map(|s| s.size_mb()),
            "description": size.map(|s| s.description()),
        }
    })))
}

/// Start loading the model. Returns immediately; if a load is already in
/// flight or the model is resident this is a no-op, same as the WebSocket
/// `load_model` message.
pub async fn load_model(state: web::Data<AppState>) -> Result<HttpResponse, AppError> {
    let lifecycle = Arc::clone(&state.lifecycle);
    tokio::spawn(async move {
        if let Err(err) = lifecycle.request_load().await {
            error!(error = %err, "Model load requested over HTTP failed");
        }
    });

    Ok(HttpResponse::Accepted().json(json!({
        "status": "accepted",
        "message": "Load requested; watch status for completion",
        "timestamp": chrono::Utc::now().to_rfc3339()
    })))
}

pub async fn unload_model(state: web::Data<AppState>) -> Result<HttpResponse, AppError> {
    match state.lifecycle.request_unload().await {
        UnloadOutcome::Unloaded => Ok(HttpResponse::Ok().json(json!({
            "status": "success",
            "message": "Model unloaded",
            "timestamp": chrono::Utc::now().to_rfc3339()
        }))),
        UnloadOutcome::LoadInProgress => Ok(HttpResponse::Ok().json(json!({
            "status": "ignored",
            "message": "A load is in progress; unload request ignored",
            "timestamp": chrono::Utc::now().to_rfc3339()
        }))),
        UnloadOutcome::NotLoaded => Err(AppError::ModelUnavailable("Model not loaded".to_string())),
    }
}
