//! src/lib.rs
//! Library crate for the OSI visualizer backend:
//!   • `backend_main()` – capture pipeline, background refresh and REST API
//!   • `start_blocking()` – the same on a freshly built Tokio runtime

pub mod analysis;
pub mod api;
pub mod capture;
pub mod enrichment;
pub mod services;
pub mod utils;

use std::sync::Arc;

use actix_web::{middleware, web, App, HttpServer};
use log::{error, info, warn};

use crate::{
    api::routes,
    capture::{PacketSource, PcapSource},
    services::{BackgroundCapture, CaptureService},
    utils::{config::Config, error::AppError},
};

/// Run the backend until the HTTP server shuts down
pub async fn backend_main(cfg: Config) -> std::io::Result<()> {
    info!("🚀 Starting OSI visualizer backend v{}...", env!("CARGO_PKG_VERSION"));
    cfg.display_summary();

    let source = match create_packet_source(&cfg.network_interface) {
        Ok(source) => {
            info!("✅ Packet capture ready on interface: {}", source.name());
            source
        }
        Err(e) => {
            error!("❌ Network interface setup failed: {}", e);
            return Err(io_err(format!("Network: {}", e)));
        }
    };

    let service = Arc::new(CaptureService::new(source, &cfg));

    let background = if cfg.background_capture {
        let background = Arc::new(BackgroundCapture::new(Arc::clone(&service), &cfg));
        background.start();
        Some(background)
    } else {
        info!("ℹ️  Background capture is disabled. Packets are captured on request.");
        None
    };

    let data_service = web::Data::new(Arc::clone(&service));
    let data_background = background.clone().map(web::Data::new);

    info!("🌐 Starting HTTP server on {}:{}", cfg.server_host, cfg.server_port);

    let server_result = HttpServer::new(move || {
        let mut app = App::new().app_data(data_service.clone());
        if let Some(background) = &data_background {
            app = app.app_data(background.clone());
        }
        app.wrap(middleware::Logger::default())
            .wrap(middleware::Compress::default())
            .wrap(actix_cors::Cors::permissive())
            .wrap(middleware::DefaultHeaders::new()
                .add(("X-OSI-Visualizer-Version", env!("CARGO_PKG_VERSION"))))
            .configure(routes::configure)
    })
    .workers(num_cpus::get())
    .bind((cfg.server_host.as_str(), cfg.server_port))?
    .run()
    .await;

    // Cleanup on server shutdown
    if let Some(background) = background {
        background.stop().await;
    }

    match server_result {
        Ok(_) => {
            info!("✅ Server shutdown gracefully");
            Ok(())
        }
        Err(e) => {
            error!("❌ Server error: {}", e);
            Err(e)
        }
    }
}

/// Open the configured interface, trying common alternatives when it fails
fn create_packet_source(interface: &str) -> Result<Arc<dyn PacketSource>, AppError> {
    match PcapSource::new(interface) {
        Ok(source) => Ok(Arc::new(source)),
        Err(e) => {
            warn!("Failed to open capture on {}: {}", interface, e);

            let alternative_interfaces = ["eth0", "en0", "wlan0", "lo", "lo0"];

            for alt_interface in alternative_interfaces {
                if alt_interface != interface {
                    info!("Trying alternative interface: {}", alt_interface);
                    if let Ok(source) = PcapSource::new(alt_interface) {
                        warn!("✅ Using alternative interface: {}", alt_interface);
                        return Ok(Arc::new(source));
                    }
                }
            }

            Err(AppError::CaptureError("No suitable network interface found".to_string()))
        }
    }
}

/// Helper function for IO errors
fn io_err(msg: impl Into<String>) -> std::io::Error {
    std::io::Error::new(std::io::ErrorKind::Other, msg.into())
}

/// Blocking wrapper around [`backend_main`]
pub fn start_blocking(cfg: Config) -> std::io::Result<()> {
    let rt = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("❌ Failed to create Tokio runtime: {}", e);
            return Err(io_err("Runtime creation failed"));
        }
    };

    rt.block_on(async {
        match backend_main(cfg).await {
            Ok(_) => {
                info!("✅ Backend shutdown gracefully");
                Ok(())
            }
            Err(e) => {
                error!("❌ Backend error: {}", e);
                Err(e)
            }
        }
    })
}
