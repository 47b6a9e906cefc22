use crate::rpc::RpcBridge;
use crate::state::AppState;
use actix_web::{web, HttpResponse};
use serde_json::json;

/// Gateway self-check. Answers without contacting the worker, so a 200 here with
/// `broker.connected = false` means "gateway up, broker down".
pub async fn health_check(state: web::Data<AppState>, bridge: web::Data<RpcBridge>) -> HttpResponse {
    let config = state.get_config();
    let connected = bridge.is_connected();

    HttpResponse::Ok().json(json!({
        "status": if connected { "healthy" } else { "degraded" },
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "uptime_seconds": state.get_uptime_seconds(),
        "service": {
            "name": env!("CARGO_PKG_NAME"),
            "version": env!("CARGO_PKG_VERSION"),
            "host": config.server.host,
            "port": config.server.port
        },
        "broker": {
            "connected": connected,
            "queue": bridge.destination(),
            "reply_queue": bridge.reply_queue(),
            "in_flight_calls": bridge.pending_count()
        }
    }))
}

pub async fn detailed_metrics(state: web::Data<AppState>, bridge: web::Data<RpcBridge>) -> HttpResponse {
    let metrics = state.get_metrics_snapshot();
    let uptime_seconds = state.get_uptime_seconds();

    let mut endpoint_stats: Vec<_> = metrics
        .endpoint_metrics
        .iter()
        .map(|(endpoint, metric)| {
            json!({
                "endpoint": endpoint,
                "request_count": metric.request_count,
                "error_count": metric.error_count,
                "upstream_error_count": metric.upstream_error_count,
                "error_rate": metric.error_rate(),
                "average_duration_ms": metric.average_duration_ms(),
                "total_duration_ms": metric.total_duration_ms
            })
        })
        .collect();
    endpoint_stats.sort_by(|a, b| a["endpoint"].as_str().cmp(&b["endpoint"].as_str()));

    HttpResponse::Ok().json(json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "uptime_seconds": uptime_seconds,
        "overall": {
            "total_requests": metrics.request_count,
            "total_errors": metrics.error_count,
            "error_rate": if metrics.request_count > 0 {
                metrics.error_count as f64 / metrics.request_count as f64
            } else {
                0.0
            }
        },
        "endpoints": endpoint_stats,
        "rpc": {
            "in_flight_calls": bridge.pending_count(),
            "calls": bridge.stats()
        }
    }))
}
