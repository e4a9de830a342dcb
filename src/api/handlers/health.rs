use std::sync::Arc;

use actix_web::web;

use crate::services::capture_service::{BackgroundCapture, CaptureService};

/// Health check with cache and background capture state
pub async fn health_check(
    service: web::Data<Arc<CaptureService>>,
    background: Option<web::Data<Arc<BackgroundCapture>>>,
) -> web::Json<serde_json::Value> {
    let cache = service.cache();
    let background_running = background.map_or(false, |bg| bg.is_running());

    web::Json(serde_json::json!({
        "status": "healthy",
        "version": env!("CARGO_PKG_VERSION"),
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "hostname": gethostname::gethostname().to_string_lossy(),
        "interface": service.source_name(),
        "cache": {
            "populated": cache.is_populated(),
            "age_seconds": cache.age().map(|age| age.as_secs_f64()),
        },
        "background_capture": background_running,
        "build_info": {
            "build_timestamp": option_env!("VERGEN_BUILD_TIMESTAMP").unwrap_or("unknown"),
            "rust_version": option_env!("VERGEN_RUSTC_SEMVER").unwrap_or("unknown"),
            "target": option_env!("VERGEN_CARGO_TARGET_TRIPLE").unwrap_or("unknown"),
        }
    }))
}
