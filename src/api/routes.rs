use actix_web::web;
use crate::api::handlers;

pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg
        // Health check kept at the root for load balancers
        .route("/health", web::get().to(handlers::health::health_check))
        .service(
            web::scope("/api")
                .route("/health", web::get().to(handlers::health::health_check))
                .route("/packets", web::get().to(handlers::packets::get_packets))
        );
}
