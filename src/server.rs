//! HTTP server and sweep scheduler.
//!
//! `serve` wires the whole system together: opens the store, resumes any
//! runs interrupted by the previous process, mounts the webhook router, and
//! drives the sweep scanner on a fixed interval until shutdown.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::Router;
use axum::http::StatusCode;
use axum::routing::get;
use tower_http::cors::CorsLayer;
use tracing::{error, info};

use crate::config::AppConfig;
use crate::db::{DbHandle, Store};
use crate::providers::{
    BillingProvider, GithubHost, HostProvider, HttpBilling, HttpSandbox, SandboxProvider,
};
use crate::trigger::SweepScanner;
use crate::trigger::webhook::{self, WebhookState};
use crate::workflow::Orchestrator;

/// Everything a running process needs, built once from config.
pub struct App {
    pub config: AppConfig,
    pub db: DbHandle,
    pub orchestrator: Arc<Orchestrator>,
    pub scanner: Arc<SweepScanner>,
}

impl App {
    pub fn build(config: AppConfig) -> Result<Self> {
        if let Some(parent) = config.database.path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).context("Failed to create database directory")?;
        }
        let db = DbHandle::new(Store::new(&config.database.path)?);

        let host: Arc<dyn HostProvider> = Arc::new(GithubHost::new(&config.github));
        let sandbox: Arc<dyn SandboxProvider> = Arc::new(HttpSandbox::new(&config.sandbox));
        let billing: Arc<dyn BillingProvider> = Arc::new(HttpBilling::new(&config.billing));

        let orchestrator = Arc::new(Orchestrator::new(
            config.clone(),
            db.clone(),
            Arc::clone(&host),
            sandbox,
            billing,
        ));
        let scanner = Arc::new(SweepScanner::new(db.clone(), Arc::clone(&orchestrator)));

        Ok(Self {
            config,
            db,
            orchestrator,
            scanner,
        })
    }

    pub fn host(&self) -> Arc<dyn HostProvider> {
        Arc::clone(&self.orchestrator.host)
    }
}

pub fn build_router(app: &App) -> Router {
    let state = WebhookState {
        db: app.db.clone(),
        orchestrator: Arc::clone(&app.orchestrator),
        host: app.host(),
        secret: app.config.webhook.secret.clone(),
        mention_command: app.config.webhook.mention_command.clone(),
    };
    webhook::router(state)
        .route("/health", get(health))
        .layer(CorsLayer::permissive())
}

async fn health() -> StatusCode {
    StatusCode::OK
}

/// Run the webhook server plus the periodic sweep scheduler.
pub async fn start_server(config: AppConfig) -> Result<()> {
    let app = App::build(config)?;

    let resumed = app.orchestrator.resume_incomplete().await?;
    if resumed > 0 {
        info!(resumed, "resumed interrupted runs");
    }

    let scheduler = spawn_scheduler(&app);

    let addr = format!("{}:{}", app.config.server.host, app.config.server.port);
    let router = build_router(&app);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;
    println!("codemend running at http://{}", listener.local_addr()?);

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    if let Some(task) = scheduler {
        task.abort();
    }
    println!("Server shut down gracefully.");
    Ok(())
}

/// Periodic sweep loop. Disabled when the interval is zero. The immediate
/// first tick is consumed so a restart doesn't trigger a full sweep.
fn spawn_scheduler(app: &App) -> Option<tokio::task::JoinHandle<()>> {
    let interval_secs = app.config.sweep.interval_secs;
    if interval_secs == 0 {
        info!("sweep scheduler disabled");
        return None;
    }
    let scanner = Arc::clone(&app.scanner);
    Some(tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(interval_secs));
        interval.tick().await;
        loop {
            interval.tick().await;
            match scanner.run_pass().await {
                Ok(report) => {
                    info!(
                        started = report.started.len(),
                        skipped = report.skipped.len(),
                        failed = report.failed.len(),
                        "scheduled sweep pass"
                    );
                }
                Err(e) => {
                    error!(error = %format!("{:#}", e), "scheduled sweep pass failed");
                }
            }
        }
    }))
}

async fn shutdown_signal() {
    tokio::signal::ctrl_c()
        .await
        .expect("Failed to install Ctrl+C handler");
    println!("\nShutting down...");
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    fn test_app() -> App {
        let mut config = AppConfig::default();
        let dir = tempfile::tempdir().unwrap();
        config.database.path = dir.path().join("codemend.db");
        config.webhook.secret = "s3cret".into();
        // Leak the tempdir so the database file outlives this helper.
        std::mem::forget(dir);
        App::build(config).unwrap()
    }

    #[tokio::test]
    async fn test_health_via_full_router() {
        let app = test_app();
        let router = build_router(&app);
        let req = Request::builder()
            .uri("/health")
            .body(Body::empty())
            .unwrap();
        let resp = router.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_webhook_acknowledges_unrecognized_event() {
        use hmac::{Hmac, Mac};
        use http_body_util::BodyExt;
        use sha2::Sha256;

        let app = test_app();
        let router = build_router(&app);

        let body = br#"{"repository":{"full_name":"acme/widgets"}}"#;
        let mut mac = Hmac::<Sha256>::new_from_slice(b"s3cret").unwrap();
        mac.update(body);
        let sig = hex::encode(mac.finalize().into_bytes());

        let req = Request::builder()
            .method("POST")
            .uri("/webhook")
            .header("x-hub-signature-256", format!("sha256={}", sig))
            .header("x-github-event", "push")
            .body(Body::from(body.to_vec()))
            .unwrap();
        let resp = router.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        let value: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(value["status"], "ignored");
    }

    #[tokio::test]
    async fn test_webhook_rejects_unsigned_request() {
        let app = test_app();
        let router = build_router(&app);
        let req = Request::builder()
            .method("POST")
            .uri("/webhook")
            .body(Body::from("{}"))
            .unwrap();
        let resp = router.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    }
}
