//! Per-endpoint request accounting.
//!
//! Endpoints are keyed by method and route pattern (`POST /transcribe/process`), not the
//! raw URI, so unmatched paths collapse into one `<unmatched>` bucket. Gateway failures
//! (502/503/504) are counted apart from other errors: they mean the worker or the broker
//! let the request down, not the caller or the gateway itself.

use crate::state::{AppState, RequestOutcome};
use actix_web::body::MessageBody;
use actix_web::dev::{ServiceRequest, ServiceResponse};
use actix_web::http::StatusCode;
use actix_web::middleware::Next;
use actix_web::{web, Error};
use std::time::Instant;
use tracing::{debug, error, warn};

const UNMATCHED_ROUTE: &str = "<unmatched>";

/// Wrap with `actix_web::middleware::from_fn(request_metrics)`.
pub async fn request_metrics(
    req: ServiceRequest,
    next: Next<impl MessageBody>,
) -> Result<ServiceResponse<impl MessageBody>, Error> {
    let started = Instant::now();
    let endpoint = format!(
        "{} {}",
        req.method(),
        req.match_pattern().as_deref().unwrap_or(UNMATCHED_ROUTE)
    );
    let state = req.app_data::<web::Data<AppState>>().cloned();

    let result = next.call(req).await;
    let duration_ms = started.elapsed().as_millis() as u64;

    let outcome = match &result {
        Ok(response) => classify(response.status()),
        Err(e) => classify(e.as_response_error().status_code()),
    };

    match outcome {
        RequestOutcome::Upstream => warn!(%endpoint, duration_ms, "Worker call failed"),
        RequestOutcome::Failed => error!(%endpoint, duration_ms, "Request failed inside the gateway"),
        RequestOutcome::Rejected => debug!(%endpoint, duration_ms, "Request rejected"),
        RequestOutcome::Ok => {}
    }

    if let Some(state) = state {
        state.record_request(&endpoint, duration_ms, outcome);
    }

    result
}

fn classify(status: StatusCode) -> RequestOutcome {
    match status {
        StatusCode::BAD_GATEWAY | StatusCode::SERVICE_UNAVAILABLE | StatusCode::GATEWAY_TIMEOUT => {
            RequestOutcome::Upstream
        }
        s if s.is_server_error() => RequestOutcome::Failed,
        s if s.is_client_error() => RequestOutcome::Rejected,
        _ => RequestOutcome::Ok,
    }
}
