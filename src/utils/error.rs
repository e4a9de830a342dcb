use thiserror::Error;
use std::io;
use actix_web::{HttpResponse, ResponseError};
use serde::Serialize;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Internal server error: {0}")]
    InternalError(String),

    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("Network capture error: {0}")]
    CaptureError(String),

    #[error("Capture timed out after {0} seconds")]
    CaptureTimeout(u64),

    #[error("Packet decode error: {0}")]
    DecodeError(String),

    #[error("Enrichment unavailable: {0}")]
    EnrichmentError(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("IO error: {0}")]
    IoError(#[from] io::Error),
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<String>,
}

impl ResponseError for AppError {
    fn error_response(&self) -> HttpResponse {
        match self {
            AppError::InternalError(msg) => {
                log::error!("Internal server error: {}", msg);
                HttpResponse::InternalServerError().json(ErrorResponse {
                    error: "internal_error".to_string(),
                    message: "An internal server error occurred".to_string(),
                    details: None,
                })
            }
            AppError::ValidationError(msg) => {
                log::debug!("Validation error: {}", msg);
                HttpResponse::BadRequest().json(ErrorResponse {
                    error: "validation_error".to_string(),
                    message: msg.clone(),
                    details: None,
                })
            }
            AppError::CaptureError(msg) => {
                log::error!("Network capture error: {}", msg);
                HttpResponse::InternalServerError().json(ErrorResponse {
                    error: "capture_error".to_string(),
                    message: "A network capture error occurred".to_string(),
                    details: Some(msg.clone()),
                })
            }
            AppError::CaptureTimeout(secs) => {
                log::warn!("Capture timed out after {}s", secs);
                HttpResponse::GatewayTimeout().json(ErrorResponse {
                    error: "capture_timeout".to_string(),
                    message: "Packet capture did not complete in time".to_string(),
                    details: Some(format!("timeout: {}s", secs)),
                })
            }
            AppError::DecodeError(msg) => {
                log::warn!("Packet decode error: {}", msg);
                HttpResponse::InternalServerError().json(ErrorResponse {
                    error: "decode_error".to_string(),
                    message: "A packet could not be decoded".to_string(),
                    details: Some(msg.clone()),
                })
            }
            AppError::EnrichmentError(msg) => {
                log::debug!("Enrichment unavailable: {}", msg);
                HttpResponse::ServiceUnavailable().json(ErrorResponse {
                    error: "enrichment_unavailable".to_string(),
                    message: "Hostname or geolocation lookup failed".to_string(),
                    details: Some(msg.clone()),
                })
            }
            AppError::ConfigError(msg) => {
                log::error!("Configuration error: {}", msg);
                HttpResponse::InternalServerError().json(ErrorResponse {
                    error: "config_error".to_string(),
                    message: "A configuration error occurred".to_string(),
                    details: Some(msg.clone()),
                })
            }
            AppError::IoError(err) => {
                log::error!("IO error: {}", err);
                HttpResponse::InternalServerError().json(ErrorResponse {
                    error: "io_error".to_string(),
                    message: "An IO error occurred".to_string(),
                    details: Some(err.to_string()),
                })
            }
        }
    }
}

// Utility functions for error conversion
impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::InternalError(err.to_string())
    }
}
