//! axum HTTP surface.
//!
//! Account routes are registered once per configured system, so
//! `/api/confluence-account` and `/api/jira-account` each get their own
//! engine as state.

pub mod error;
pub mod extract;
mod routes;

use crate::portal::Portal;
use anyhow::{Context, Result};
use axum::extract::DefaultBodyLimit;
use axum::routing::{get, post};
use axum::{middleware, Extension, Router};
use selfserve_engine::{ReactivationService, RequestEngine, RequestError, Shutdown};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::info;

use self::error::ApiError;
use self::extract::TrustedProxies;

#[derive(Clone)]
pub struct AppState {
    pub portal: Arc<Portal>,
}

/// State of the routes belonging to one account system.
#[derive(Clone)]
pub struct KindState {
    pub engine: Arc<RequestEngine>,
    pub reactivation: Option<Arc<ReactivationService>>,
}

impl KindState {
    fn reactivation(&self) -> Result<&Arc<ReactivationService>, ApiError> {
        self.reactivation.as_ref().ok_or_else(|| {
            ApiError::Request(RequestError::not_found(
                "Account reactivation is not available for this system",
            ))
        })
    }
}

pub fn router(portal: Arc<Portal>) -> Router {
    let reporting = portal.config.server.error_reporting;
    let body_limit = usize::try_from(portal.config.server.max_form_size).unwrap_or(usize::MAX);

    let mut app = Router::new()
        .route("/api/session", get(routes::session))
        .route("/api/mailinglist", post(routes::mailinglist))
        .route("/api/queue", get(routes::queue))
        .route(
            "/api/confluence-create",
            get(routes::create_space).post(routes::create_space),
        )
        .route("/api/confluence-archive", post(routes::archive_space))
        .route("/api/jira-project-create", post(routes::create_jira_project))
        .route("/api/jira-project-schemes", get(routes::jira_schemes))
        .with_state(AppState {
            portal: portal.clone(),
        });

    for (name, engine) in &portal.engines {
        let state = KindState {
            engine: engine.clone(),
            reactivation: portal.reactivations.get(name).cloned(),
        };
        let mut kind_routes = Router::new()
            .route(
                &format!("/api/{}-account", name),
                get(routes::verify).post(routes::submit),
            )
            .route(
                &format!("/api/{}-exists", name),
                get(routes::exists).post(routes::exists),
            )
            .route(
                &format!("/api/{}-project-blocked", name),
                get(routes::project_blocked).post(routes::project_blocked),
            )
            .route(
                &format!("/api/{}-account-review", name),
                get(routes::review_fetch).post(routes::review_action),
            );
        if state.reactivation.is_some() {
            kind_routes = kind_routes
                .route(
                    &format!("/api/{}-account-activate", name),
                    get(routes::activate).post(routes::activate),
                )
                .route(
                    &format!("/api/{}-account-activate-confirm", name),
                    get(routes::activate_confirm).post(routes::activate_confirm),
                );
        }
        app = app.merge(kind_routes.with_state(state));
    }

    let trusted = TrustedProxies::new(portal.config.server.trusted_proxies.clone());
    app.layer(DefaultBodyLimit::max(body_limit))
        .layer(Extension(trusted))
        .layer(middleware::from_fn_with_state(reporting, error::report_faults))
}

/// Serve until `shutdown` fires.
pub async fn serve(portal: Arc<Portal>, shutdown: Shutdown) -> Result<()> {
    let addr = format!("{}:{}", portal.config.server.bind, portal.config.server.port);
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    info!(addr = %addr, systems = portal.engines.len(), "Selfserve portal listening");

    let app = router(portal).into_make_service_with_connect_info::<SocketAddr>();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.wait().await })
        .await
        .context("HTTP server failed")
}
