// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Control-plane HTTP server.
//!
//! Long operations answer `202 Accepted` once the task is launched; clients
//! poll `GET /api/v1/apps/{id}` for the resulting states.

use std::sync::Arc;

use axum::extract::{FromRequestParts, Path, Query, State};
use axum::http::request::Parts;
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio::sync::Notify;
use tracing::{debug, error, info};

use crate::apps::{AppService, ConfigureRequest, InstallRequest, UninstallRequest};
use crate::auth::Caller;
use crate::error::Error;
use crate::model::AppRecord;

#[derive(Serialize)]
struct ErrorBody {
    message: String,
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            error!(error = %self, "Request failed");
        } else {
            debug!(status = status.as_u16(), error = %self, "Request rejected");
        }
        (
            status,
            Json(ErrorBody {
                message: self.to_string(),
            }),
        )
            .into_response()
    }
}

#[derive(Deserialize)]
struct TokenQuery {
    access_token: Option<String>,
}

/// Caller resolved from a bearer header or an `access_token` query parameter.
pub struct Authenticated(pub Caller);

impl FromRequestParts<AppService> for Authenticated {
    type Rejection = Error;

    async fn from_request_parts(
        parts: &mut Parts,
        service: &AppService,
    ) -> Result<Self, Self::Rejection> {
        let from_header = parts
            .headers
            .get(header::AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.strip_prefix("Bearer "))
            .map(str::to_string);

        let token = match from_header {
            Some(token) => token,
            None => Query::<TokenQuery>::try_from_uri(&parts.uri)
                .ok()
                .and_then(|Query(q)| q.access_token)
                .ok_or(Error::Unauthorized)?,
        };

        service
            .authenticator()
            .authenticate(&token)
            .await
            .map(Authenticated)
            .ok_or(Error::Unauthorized)
    }
}

#[derive(Serialize)]
struct InstallResponse {
    id: String,
}

#[derive(Serialize)]
struct ListResponse {
    apps: Vec<AppRecord>,
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
}

/// Build the API router.
pub fn router(service: AppService) -> Router {
    Router::new()
        .route("/api/v1/healthcheck", get(healthcheck))
        .route("/api/v1/apps", get(list_apps))
        .route("/api/v1/apps/install", post(install_app))
        .route("/api/v1/apps/{id}", get(get_app))
        .route("/api/v1/apps/{id}/configure", post(configure_app))
        .route("/api/v1/apps/{id}/start", post(start_app))
        .route("/api/v1/apps/{id}/stop", post(stop_app))
        .route("/api/v1/apps/{id}/uninstall", post(uninstall_app))
        .route("/api/v1/apps/{id}/retry", post(retry_app))
        .with_state(service)
}

/// Serve `router` on `listener` until `shutdown` is notified.
pub async fn serve(
    listener: TcpListener,
    router: Router,
    shutdown: Arc<Notify>,
) -> std::io::Result<()> {
    let addr = listener.local_addr()?;
    info!(addr = %addr, "HTTP server listening");

    axum::serve(listener, router)
        .with_graceful_shutdown(async move { shutdown.notified().await })
        .await?;

    info!("HTTP server stopped");
    Ok(())
}

async fn healthcheck() -> Json<HealthResponse> {
    Json(HealthResponse { status: "ok" })
}

async fn list_apps(
    State(service): State<AppService>,
    Authenticated(caller): Authenticated,
) -> Result<Json<ListResponse>, Error> {
    let apps = service.list(&caller).await?;
    Ok(Json(ListResponse { apps }))
}

async fn install_app(
    State(service): State<AppService>,
    Authenticated(caller): Authenticated,
    Json(request): Json<InstallRequest>,
) -> Result<(StatusCode, Json<InstallResponse>), Error> {
    let id = service.install(&caller, request).await?;
    Ok((StatusCode::ACCEPTED, Json(InstallResponse { id })))
}

async fn get_app(
    State(service): State<AppService>,
    Authenticated(caller): Authenticated,
    Path(id): Path<String>,
) -> Result<Json<AppRecord>, Error> {
    Ok(Json(service.get(&caller, &id).await?))
}

async fn configure_app(
    State(service): State<AppService>,
    Authenticated(caller): Authenticated,
    Path(id): Path<String>,
    Json(request): Json<ConfigureRequest>,
) -> Result<StatusCode, Error> {
    service.configure(&caller, &id, request).await?;
    Ok(StatusCode::ACCEPTED)
}

async fn start_app(
    State(service): State<AppService>,
    Authenticated(caller): Authenticated,
    Path(id): Path<String>,
) -> Result<StatusCode, Error> {
    service.start(&caller, &id).await?;
    Ok(StatusCode::ACCEPTED)
}

async fn stop_app(
    State(service): State<AppService>,
    Authenticated(caller): Authenticated,
    Path(id): Path<String>,
) -> Result<StatusCode, Error> {
    service.stop(&caller, &id).await?;
    Ok(StatusCode::ACCEPTED)
}

async fn uninstall_app(
    State(service): State<AppService>,
    Authenticated(caller): Authenticated,
    Path(id): Path<String>,
    Json(request): Json<UninstallRequest>,
) -> Result<StatusCode, Error> {
    service.uninstall(&caller, &id, request).await?;
    Ok(StatusCode::ACCEPTED)
}

async fn retry_app(
    State(service): State<AppService>,
    Authenticated(caller): Authenticated,
    Path(id): Path<String>,
) -> Result<StatusCode, Error> {
    service.retry(&caller, &id).await?;
    Ok(StatusCode::ACCEPTED)
}
