//! HTTP surface
//!
//! `POST /api/accounting/apply` is what followers call on the active
//! processor. Caller identity arrives already verified in the body; this
//! layer does no authentication of its own.

use crate::service::AccountingService;
use crate::types::{
    ActorAndProject, BulkResponse, Command, CommandEnvelope, ErrorBody, ErrorDetail,
    NotificationId, ProductCategoryId, WalletOwner,
};
use crate::Error;
use actix_web::{error::ResponseError, http::StatusCode, web, HttpResponse};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;

impl ResponseError for Error {
    fn error_response(&self) -> HttpResponse {
        let status_code = self.status_code();
        HttpResponse::build(status_code).json(ErrorBody {
            error: ErrorDetail {
                code: status_code.as_u16(),
                message: self.to_string(),
                kind: self.kind().to_string(),
            },
        })
    }

    fn status_code(&self) -> StatusCode {
        match self {
            Error::UnknownCategory(_) | Error::WalletNotFound(_) | Error::AllocationNotFound(_) => {
                StatusCode::NOT_FOUND
            }
            Error::Forbidden(_) => StatusCode::FORBIDDEN,
            Error::Conflict(_) => StatusCode::CONFLICT,
            Error::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            Error::LeaderUnreachable(_) | Error::Concurrency(_) => StatusCode::SERVICE_UNAVAILABLE,
            Error::Storage(_)
            | Error::Serialization(_)
            | Error::Forwarding(_)
            | Error::Config(_)
            | Error::Io(_)
            | Error::Other(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

type Service = web::Data<Arc<AccountingService>>;

/// Command submitted by a client
#[derive(Debug, Deserialize)]
pub struct SubmitRequest {
    pub actor: ActorAndProject,
    pub command: Command,
}

/// Wallet listing request
#[derive(Debug, Deserialize)]
pub struct WalletsRequest {
    pub actor: ActorAndProject,
    pub owner: WalletOwner,
}

/// Allocation listing request
#[derive(Debug, Deserialize)]
pub struct AllocationsRequest {
    pub actor: ActorAndProject,
    pub owner: WalletOwner,
    pub category: ProductCategoryId,
}

/// Notification acknowledgement
#[derive(Debug, Deserialize)]
pub struct MarkAsReadRequest {
    pub actor: ActorAndProject,
    pub ids: Vec<NotificationId>,
}

/// Health check endpoint
pub async fn health_check(service: Service) -> HttpResponse {
    HttpResponse::Ok().json(json!({
        "status": "healthy",
        "service": "accounting-core",
        "version": env!("CARGO_PKG_VERSION"),
        "leader": service.election().is_leader(),
    }))
}

/// Prometheus scrape endpoint
pub async fn metrics(service: Service) -> Result<HttpResponse, Error> {
    let body = service.metrics().render()?;
    Ok(HttpResponse::Ok()
        .content_type("text/plain; version=0.0.4")
        .body(body))
}

/// Execute a command forwarded by another instance
pub async fn apply(
    service: Service,
    envelope: web::Json<CommandEnvelope>,
) -> Result<HttpResponse, Error> {
    let responses = service.execute_forwarded(envelope.into_inner()).await?;
    Ok(HttpResponse::Ok().json(BulkResponse { responses }))
}

/// Normalize and route a client command
pub async fn submit(
    service: Service,
    request: web::Json<SubmitRequest>,
) -> Result<HttpResponse, Error> {
    let request = request.into_inner();
    let responses = service.apply(&request.actor, request.command).await?;
    Ok(HttpResponse::Ok().json(BulkResponse { responses }))
}

/// Current active processor
pub async fn leader(service: Service) -> Result<HttpResponse, Error> {
    let address = service.retrieve_active_processor_address().await?;
    Ok(HttpResponse::Ok().json(json!({
        "address": address,
        "self": service.election().self_address(),
    })))
}

/// Wallets of an owner
pub async fn wallets(
    service: Service,
    request: web::Json<WalletsRequest>,
) -> Result<HttpResponse, Error> {
    let wallets = service.retrieve_wallets_internal(&request.actor, &request.owner)?;
    Ok(HttpResponse::Ok().json(wallets))
}

/// Allocations of a wallet
pub async fn allocations(
    service: Service,
    request: web::Json<AllocationsRequest>,
) -> Result<HttpResponse, Error> {
    let allocations =
        service.retrieve_allocations_internal(&request.actor, &request.owner, &request.category)?;
    Ok(HttpResponse::Ok().json(allocations))
}

/// Unread notifications of the caller
pub async fn notifications(
    service: Service,
    actor: web::Json<ActorAndProject>,
) -> Result<HttpResponse, Error> {
    let notifications = service.retrieve_notifications(&actor)?;
    Ok(HttpResponse::Ok().json(notifications))
}

/// Acknowledge notifications
pub async fn mark_as_read(
    service: Service,
    request: web::Json<MarkAsReadRequest>,
) -> Result<HttpResponse, Error> {
    let request = request.into_inner();
    let updated = service.mark_as_read(&request.actor, request.ids).await?;
    Ok(HttpResponse::Ok().json(json!({ "updated": updated })))
}

/// Configure routes
pub fn configure_routes(cfg: &mut web::ServiceConfig) {
    cfg.route("/health", web::get().to(health_check))
        .route("/metrics", web::get().to(metrics))
        .service(
            web::scope("/api/accounting")
                .route("/apply", web::post().to(apply))
                .route("/submit", web::post().to(submit))
                .route("/leader", web::get().to(leader))
                .route("/wallets", web::post().to(wallets))
                .route("/allocations", web::post().to(allocations))
                .route("/notifications", web::post().to(notifications))
                .route("/notifications/read", web::post().to(mark_as_read)),
        );
}
