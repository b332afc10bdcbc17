//! Operator status API for the traffic forwarder.
//!
//! Exposes health, the port mapping table, active blocks and detector
//! statistics over HTTP, and lets an operator lift a block early.

use std::io;
use std::net::IpAddr;
use std::sync::Arc;

use actix_web::dev::Server;
use actix_web::{web, App, HttpResponse, HttpServer, Responder};
use log::info;
use serde::Serialize;

use crate::core::{FloodDetector, PortMappingTable};
use crate::models::ApiConfig;

pub struct ApiState {
    pub detector: Arc<FloodDetector>,
    pub mappings: Arc<PortMappingTable>,
}

/// API configuration function for Actix-web
pub fn config(cfg: &mut web::ServiceConfig) {
    cfg.service(
        web::scope("/api/v1")
            .service(web::resource("/health").route(web::get().to(health_check)))
            .service(web::resource("/mappings").route(web::get().to(list_mappings)))
            .service(web::resource("/stats").route(web::get().to(detector_stats)))
            .service(web::resource("/blocked").route(web::get().to(list_blocked)))
            .service(web::resource("/blocked/{ip}").route(web::delete().to(lift_block))),
    );
}

/// Bind the API server; the returned future runs it
pub fn start_api_server(state: ApiState, api: &ApiConfig) -> io::Result<Server> {
    let state = web::Data::new(state);
    info!("Serving status API on {}:{}", api.host, api.port);

    let server = HttpServer::new(move || App::new().app_data(state.clone()).configure(config))
        .workers(1)
        .bind((api.host.as_str(), api.port))?
        .run();
    Ok(server)
}

/// Health check endpoint response
#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

#[derive(Serialize)]
struct ActionResponse {
    status: String,
    message: String,
}

/// Health check endpoint
async fn health_check() -> impl Responder {
    HttpResponse::Ok().json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

async fn list_mappings(state: web::Data<ApiState>) -> impl Responder {
    HttpResponse::Ok().json(state.mappings.as_slice())
}

async fn detector_stats(state: web::Data<ApiState>) -> impl Responder {
    HttpResponse::Ok().json(state.detector.stats())
}

async fn list_blocked(state: web::Data<ApiState>) -> impl Responder {
    HttpResponse::Ok().json(state.detector.blocked_sources())
}

/// Lift an active block
async fn lift_block(state: web::Data<ApiState>, path: web::Path<String>) -> impl Responder {
    let raw = path.into_inner();
    let Ok(ip) = raw.parse::<IpAddr>() else {
        return HttpResponse::BadRequest().json(ActionResponse {
            status: "error".to_string(),
            message: format!("{} is not an IP address", raw),
        });
    };

    if state.detector.unblock(ip) {
        HttpResponse::Ok().json(ActionResponse {
            status: "ok".to_string(),
            message: format!("{} unblocked", ip),
        })
    } else {
        HttpResponse::NotFound().json(ActionResponse {
            status: "error".to_string(),
            message: format!("{} is not blocked", ip),
        })
    }
}
