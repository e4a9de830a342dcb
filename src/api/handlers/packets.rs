use std::sync::Arc;

use actix_web::{web, HttpResponse, Responder};
use chrono::{DateTime, Utc};
use log::debug;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::analysis::record::PacketRecord;
use crate::services::capture_service::CaptureService;
use crate::utils::error::AppError;

/// Query parameters for packet retrieval
#[derive(Debug, Deserialize)]
pub struct PacketQueryParams {
    #[serde(default)]
    pub count: Option<usize>,
    #[serde(default)]
    pub cache: Option<bool>,
}

/// Response for a packet listing
#[derive(Debug, Serialize)]
pub struct PacketsResponse<'a> {
    pub packets: &'a [PacketRecord],
    pub count: usize,
    pub timestamp: DateTime<Utc>,
    pub batch_id: Uuid,
    pub cached: bool,
}

/// Get the most recent packets, from the cache while it is fresh
pub async fn get_packets(
    service: web::Data<Arc<CaptureService>>,
    query: web::Query<PacketQueryParams>,
) -> Result<impl Responder, AppError> {
    let requested = query.count.unwrap_or_else(|| service.default_count());
    if requested == 0 {
        return Err(AppError::ValidationError("count must be at least 1".to_string()));
    }
    let count = requested.min(service.max_count());
    let use_cache = query.cache.unwrap_or(true);

    let (batch, cached) = service.get_cached_or_fresh(count, use_cache).await?;
    let packets = batch.first(count);
    debug!(
        "Serving {} packets from batch {} (cached: {})",
        packets.len(),
        batch.batch_id,
        cached
    );

    Ok(HttpResponse::Ok().json(PacketsResponse {
        packets,
        count: packets.len(),
        timestamp: batch.captured_at,
        batch_id: batch.batch_id,
        cached,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use actix_web::{http::StatusCode, test, App};

    use crate::api::routes;
    use crate::services::capture_service::tests::{service_with, test_config, CountingSource};

    #[actix_web::test]
    async fn test_get_packets_defaults() {
        let source = Arc::new(CountingSource::new());
        let service = Arc::new(service_with(source.clone(), &test_config()));
        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(service))
                .configure(routes::configure),
        )
        .await;

        let req = test::TestRequest::get().uri("/api/packets").to_request();
        let body: serde_json::Value = test::call_and_read_body_json(&app, req).await;

        assert_eq!(body["count"], 3);
        assert_eq!(body["cached"], false);
        assert_eq!(body["packets"][0]["id"], 1);
        assert_eq!(body["packets"][0]["layers"]["transport"], "TCP (port 80)");
        assert_eq!(body["packets"][0]["security_assessment"]["risk_level"], "medium");

        // Second call is served from the cache
        let req = test::TestRequest::get().uri("/api/packets?count=2").to_request();
        let body: serde_json::Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["count"], 2);
        assert_eq!(body["cached"], true);
        assert_eq!(source.calls(), 1);
    }

    #[actix_web::test]
    async fn test_count_is_clamped_and_cache_can_be_bypassed() {
        let source = Arc::new(CountingSource::new());
        let service = Arc::new(service_with(source.clone(), &test_config()));
        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(service))
                .configure(routes::configure),
        )
        .await;

        let req = test::TestRequest::get()
            .uri("/api/packets?count=1000&cache=false")
            .to_request();
        let body: serde_json::Value = test::call_and_read_body_json(&app, req).await;

        assert_eq!(body["count"], 10);
        assert_eq!(body["cached"], false);
    }

    #[actix_web::test]
    async fn test_zero_count_is_rejected() {
        let source = Arc::new(CountingSource::new());
        let service = Arc::new(service_with(source.clone(), &test_config()));
        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(service))
                .configure(routes::configure),
        )
        .await;

        let req = test::TestRequest::get().uri("/api/packets?count=0").to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        assert_eq!(source.calls(), 0);
    }

    #[actix_web::test]
    async fn test_capture_failure_is_a_server_error() {
        let source = Arc::new(CountingSource::failing());
        let service = Arc::new(service_with(source, &test_config()));
        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(service))
                .configure(routes::configure),
        )
        .await;

        let req = test::TestRequest::get().uri("/api/packets").to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);

        let body: serde_json::Value = test::read_body_json(resp).await;
        assert_eq!(body["error"], "capture_error");
    }
}
