pub mod root;
pub mod transcribe;

pub use root::*;
pub use transcribe::*;

use crate::health;
use actix_web::web;

/// Route table shared by the server and the handler tests.
///
/// Handlers expect `web::Data<AppState>` and `web::Data<RpcBridge>` to be registered
/// on the `App`.
pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.route("/", web::get().to(greeting))
        .route("/health", web::get().to(health::health_check))
        .route("/metrics", web::get().to(health::detailed_metrics))
        .service(
            web::scope("/transcribe")
                .route("/health", web::get().to(transcribe_health))
                .route("/process", web::post().to(transcribe_process)),
        );
}
