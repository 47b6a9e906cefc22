//! # Transcription Gateway Handlers
//!
//! Each endpoint turns one HTTP request into exactly one call on the worker.
//!
//! ## Available Endpoints:
//! - `GET /transcribe/health` - relay `health_check` to the worker
//! - `POST /transcribe/process` - relay an uploaded audio file as `transcribe_file`
//!
//! Worker results are returned verbatim. Failures come back as the JSON error body
//! described in `error.rs`, with a status that says which side failed.

use crate::error::AppError;
use crate::rpc::{AudioPayload, RpcBridge};
use crate::state::AppState;
use actix_multipart::{Field, Multipart};
use actix_web::{web, HttpResponse};
use futures_util::stream::StreamExt;
use serde::Serialize;
use serde_json::json;
use tracing::info;

pub const HEALTH_CHECK: &str = "health_check";
pub const TRANSCRIBE_FILE: &str = "transcribe_file";

/// Multipart field that must carry the audio file.
pub const AUDIO_FIELD: &str = "audio";

/// `transcribe_file` payload. The audio serializes straight into the published body.
#[derive(Serialize)]
struct TranscribeFile {
    #[serde(rename = "audioBuffer")]
    audio_buffer: AudioPayload,
}

/// Ask the worker whether it is alive.
///
/// ## Endpoint: `GET /transcribe/health`
///
/// ## Responses:
/// - `200` with the worker's payload, e.g. `{"status": "healthy", "service": "transcribe"}`
/// - `504` when the worker did not answer in time (gateway up, worker down or busy)
/// - `503` when the broker connection is unavailable
pub async fn transcribe_health(
    state: web::Data<AppState>,
    bridge: web::Data<RpcBridge>,
) -> Result<HttpResponse, AppError> {
    let timeout = state.get_config().rpc.health_timeout();
    let reply = bridge
        .request(HEALTH_CHECK, &json!({ "message": "check" }), timeout)
        .await?;

    Ok(HttpResponse::Ok().json(reply))
}

/// Transcribe an uploaded audio file.
///
/// ## Endpoint: `POST /transcribe/process`
///
/// ## Request:
/// Multipart form data with exactly one non-empty file field named "audio".
///
/// ## Responses:
/// - `200` with the worker's result, e.g. `{"status": "success", "text": "..."}`
/// - `400` when the field is missing, empty, duplicated or too large (nothing is published)
/// - `502` carrying the worker's error message
/// - `504` / `503` on timeout / broker failure
pub async fn transcribe_process(
    state: web::Data<AppState>,
    bridge: web::Data<RpcBridge>,
    payload: Multipart,
) -> Result<HttpResponse, AppError> {
    let config = state.get_config();
    let audio = read_audio_field(payload, config.rpc.max_upload_bytes).await?;

    info!(bytes = audio.len(), "Relaying audio file to worker");

    let command = TranscribeFile {
        audio_buffer: AudioPayload(audio),
    };
    let reply = bridge
        .request(TRANSCRIBE_FILE, &command, config.rpc.transcribe_timeout())
        .await?;

    Ok(HttpResponse::Ok().json(reply))
}

/// Pull the single `audio` field out of the form, enforcing presence and size.
async fn read_audio_field(mut payload: Multipart, max_bytes: usize) -> Result<Vec<u8>, AppError> {
    let mut audio: Option<Vec<u8>> = None;

    while let Some(item) = payload.next().await {
        let mut field: Field =
            item.map_err(|e| AppError::ValidationError(format!("Multipart error: {}", e)))?;

        let is_audio = field
            .content_disposition()
            .and_then(|cd| cd.get_name())
            .map_or(false, |name| name == AUDIO_FIELD);

        if !is_audio {
            drain(&mut field).await?;
            continue;
        }

        if audio.is_some() {
            return Err(AppError::ValidationError(format!(
                "Expected a single '{}' field",
                AUDIO_FIELD
            )));
        }

        let mut bytes = Vec::new();
        while let Some(chunk) = field.next().await {
            let chunk = chunk.map_err(|e| AppError::ValidationError(format!("Chunk error: {}", e)))?;
            if bytes.len() + chunk.len() > max_bytes {
                return Err(AppError::ValidationError(format!(
                    "File too large (max: {} bytes)",
                    max_bytes
                )));
            }
            bytes.extend_from_slice(&chunk);
        }
        audio = Some(bytes);
    }

    match audio {
        None => Err(AppError::ValidationError("No audio file provided".to_string())),
        Some(bytes) if bytes.is_empty() => {
            Err(AppError::ValidationError("Audio file is empty".to_string()))
        }
        Some(bytes) => Ok(bytes),
    }
}

async fn drain(field: &mut Field) -> Result<(), AppError> {
    while let Some(chunk) = field.next().await {
        chunk.map_err(|e| AppError::ValidationError(format!("Chunk error: {}", e)))?;
    }
    Ok(())
}
