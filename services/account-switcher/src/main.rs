//! Kiro Account Switcher
//!
//! Single-binary service that:
//! 1. Loads every credential file in the tokens directory as an account
//! 2. Keeps tokens fresh with a background refresh task, and fails over on its own
//!    when the active account is banned or expired
//! 3. Serves the admin API (switch, refresh, health, delete, failover, events)
//! 4. Exposes `/health` and Prometheus `/metrics`

mod admin;
mod config;
mod metrics;

use anyhow::{Context, Result};
use axum::Router;
use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::get;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpListener;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use kiro_auth::{BanClassifier, CredentialStore, RefreshClient, UsageClient};
use kiro_pool::{
    AccountService, AccountServiceOptions, FailoverSelector, UsageCache, UsageStats,
    spawn_auto_failover_task, spawn_refresh_task,
};
use metrics_exporter_prometheus::PrometheusHandle;

use crate::admin::AdminState;
use crate::config::Config;

/// How long in-flight admin requests may take to finish after a shutdown signal
const DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

/// Shared state for the health and metrics handlers
#[derive(Clone)]
struct AppState {
    service: Arc<AccountService>,
    prometheus: PrometheusHandle,
    started_at: Instant,
}

/// Build the axum router with all routes and shared state.
///
/// Applies a concurrency limit layer based on `max_connections`.
fn build_router(state: AppState, admin: AdminState, max_connections: usize) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .with_state(state)
        .merge(admin::build_admin_router(admin))
        .layer(tower::limit::ConcurrencyLimitLayer::new(max_connections))
}

/// Construct the account service from resolved configuration.
async fn build_service(config: &Config) -> Result<AccountService> {
    let paths = config
        .store_paths()
        .context("failed to resolve store paths")?;
    info!(
        tokens_dir = %paths.tokens_dir.display(),
        current_token = %paths.current_token_path.display(),
        "store paths resolved"
    );

    let timeout = config.provider.timeout();
    let classifier = BanClassifier::new(
        RefreshClient::new(config.provider.token_url.clone(), timeout)
            .context("failed to build token endpoint client")?,
        UsageClient::new(config.provider.usage_url.clone(), timeout)
            .context("failed to build usage endpoint client")?,
    );

    Ok(AccountService::new(
        CredentialStore::new(paths.tokens_dir, paths.current_token_path),
        classifier,
        UsageCache::load(paths.usage_cache_path).await,
        UsageStats::load(paths.usage_stats_path).await,
        AccountServiceOptions {
            batch_delay: config.refresh.batch_delay(),
        },
    ))
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing with JSON output and LOG_LEVEL / RUST_LOG support
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_env("LOG_LEVEL")
                .or_else(|_| EnvFilter::try_from_default_env())
                .unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("starting kiro-account-switcher");

    // Install Prometheus metrics recorder before any metrics are emitted
    let prometheus_handle =
        metrics::install_recorder().context("failed to install Prometheus recorder")?;

    // CLI: simple --config flag parsing
    let args: Vec<String> = std::env::args().collect();
    let cli_config_path = args
        .iter()
        .position(|a| a == "--config")
        .and_then(|i| args.get(i + 1))
        .map(|s| s.as_str());

    let config_path = Config::resolve_path(cli_config_path);
    let explicit = cli_config_path.is_some() || std::env::var_os("CONFIG_PATH").is_some();
    let config = if !explicit && !config_path.exists() {
        info!(path = %config_path.display(), "no configuration file, using defaults");
        Config::default()
    } else {
        info!(path = %config_path.display(), "loading configuration");
        Config::load(&config_path)
            .with_context(|| format!("failed to load config from {}", config_path.display()))?
    };

    info!(
        listen_addr = %config.admin.listen_addr,
        token_url = %config.provider.token_url,
        refresh_enabled = config.refresh.enabled,
        refresh_interval_secs = config.refresh.interval_secs,
        auto_failover = config.failover.auto,
        "configuration loaded"
    );

    let service = Arc::new(build_service(&config).await?);
    let accounts = service
        .load_all()
        .await
        .context("failed to load accounts")?;
    info!(
        accounts = accounts.len(),
        active = accounts
            .iter()
            .find(|a| a.is_active)
            .map(|a| a.id.as_str())
            .unwrap_or("none"),
        "accounts loaded"
    );

    let refresh_handle = config.refresh.enabled.then(|| {
        spawn_refresh_task(
            service.clone(),
            config.refresh.interval(),
            config.refresh.threshold(),
        )
    });

    let selector = Arc::new(FailoverSelector::new(config.failover.debounce()));
    let failover_handle = config.failover.auto.then(|| {
        spawn_auto_failover_task(
            service.clone(),
            selector.clone(),
            config.failover.interval(),
        )
    });
    let app_state = AppState {
        service: service.clone(),
        prometheus: prometheus_handle,
        started_at: Instant::now(),
    };
    let app = build_router(
        app_state,
        AdminState::new(service, selector),
        config.admin.max_connections,
    );

    let listen_addr = config.admin.listen_addr;
    let listener = TcpListener::bind(listen_addr)
        .await
        .with_context(|| format!("failed to bind to {listen_addr}"))?;
    info!(addr = %listen_addr, "accepting requests");

    // Drain timeout starts when the shutdown signal fires, not when the
    // server starts.
    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();

    let server_handle = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async {
                let _ = shutdown_rx.await;
            })
            .await
    });

    shutdown_signal().await;

    if let Some(handle) = refresh_handle {
        handle.abort();
    }
    if let Some(handle) = failover_handle {
        handle.abort();
    }
    let _ = shutdown_tx.send(());

    match tokio::time::timeout(DRAIN_TIMEOUT, server_handle).await {
        Ok(Ok(Ok(()))) => {
            info!("all in-flight requests drained");
        }
        Ok(Ok(Err(e))) => {
            error!(error = %e, "server error during shutdown");
        }
        Ok(Err(e)) => {
            error!(error = %e, "server task panicked");
        }
        Err(_) => {
            warn!(
                drain_timeout_secs = DRAIN_TIMEOUT.as_secs(),
                "drain timeout exceeded, forcing shutdown"
            );
        }
    }

    info!("shutdown complete");
    Ok(())
}

/// Health endpoint: 200 while at least one account is usable, 503 otherwise.
async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    let uptime = state.started_at.elapsed().as_secs();
    let accounts = state.service.accounts().await;
    let usable = accounts
        .iter()
        .filter(|a| !a.is_banned() && !a.is_truly_invalid && a.is_refreshable)
        .count();
    let banned = accounts.iter().filter(|a| a.is_banned()).count();
    let active = accounts.iter().find(|a| a.is_active).map(|a| a.id.clone());

    let (status_code, status) = if usable > 0 {
        (axum::http::StatusCode::OK, "healthy")
    } else {
        (axum::http::StatusCode::SERVICE_UNAVAILABLE, "degraded")
    };
    let body = serde_json::json!({
        "status": status,
        "accounts_total": accounts.len(),
        "accounts_usable": usable,
        "accounts_banned": banned,
        "active_account": active,
        "uptime_seconds": uptime,
    });

    (
        status_code,
        [(axum::http::header::CONTENT_TYPE, "application/json")],
        body.to_string(),
    )
}

/// Prometheus metrics endpoint, text exposition format.
async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    (
        axum::http::StatusCode::OK,
        [(
            axum::http::header::CONTENT_TYPE,
            "text/plain; version=0.0.4; charset=utf-8",
        )],
        state.prometheus.render(),
    )
}

/// Wait for SIGTERM or SIGINT for graceful shutdown.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received SIGINT, shutting down"),
        _ = terminate => info!("received SIGTERM, shutting down"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use chrono::Utc;
    use common::Secret;
    use kiro_auth::CredentialRecord;
    use tower::ServiceExt;

    /// Create a PrometheusHandle for tests without installing a global recorder.
    fn test_prometheus_handle() -> PrometheusHandle {
        let recorder = metrics_exporter_prometheus::PrometheusBuilder::new().build_recorder();
        recorder.handle()
    }

    /// Service over an empty temp store. Provider URLs point at a closed
    /// port; these tests never refresh.
    async fn test_service(dir: &std::path::Path) -> Arc<AccountService> {
        let config = Config::parse(&format!(
            r#"
[store]
data_dir = "{data}"
current_token_path = "{data}/kiro-auth-token.json"

[provider]
token_url = "http://127.0.0.1:9/token"
usage_url = "http://127.0.0.1:9/usage"
timeout_secs = 1
"#,
            data = dir.display()
        ))
        .unwrap();
        Arc::new(build_service(&config).await.unwrap())
    }

    fn test_app(service: Arc<AccountService>) -> Router {
        let state = AppState {
            service: service.clone(),
            prometheus: test_prometheus_handle(),
            started_at: Instant::now(),
        };
        let admin = AdminState::new(service, Arc::new(FailoverSelector::default()));
        build_router(state, admin, 16)
    }

    async fn get_json(app: Router, uri: &str) -> (StatusCode, serde_json::Value) {
        let response = app
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let body = axum::body::to_bytes(response.into_body(), 1024 * 1024)
            .await
            .unwrap();
        (status, serde_json::from_slice(&body).unwrap())
    }

    #[tokio::test]
    async fn health_without_accounts_is_degraded() {
        let dir = tempfile::tempdir().unwrap();
        let service = test_service(dir.path()).await;
        service.load_all().await.unwrap();

        let (status, json) = get_json(test_app(service), "/health").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(json["status"], "degraded");
        assert_eq!(json["accounts_total"], 0);
        assert!(json["uptime_seconds"].is_u64());
    }

    #[tokio::test]
    async fn health_with_usable_account_is_healthy() {
        let dir = tempfile::tempdir().unwrap();
        let service = test_service(dir.path()).await;
        let mut record = CredentialRecord::new("token-a.json", "at_a");
        record.refresh_token = Some(Secret::from("rt_a"));
        record.client_id = Some("cid".into());
        record.client_secret = Some(Secret::from("csec"));
        record.expires_at = Some(Utc::now() + chrono::Duration::hours(1));
        service.store().write(&record).await.unwrap();
        service.load_all().await.unwrap();
        service.switch_to("token-a.json").await.unwrap();

        let (status, json) = get_json(test_app(service), "/health").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["status"], "healthy");
        assert_eq!(json["accounts_usable"], 1);
        assert_eq!(json["active_account"], "token-a.json");
    }

    #[tokio::test]
    async fn metrics_endpoint_returns_prometheus_format() {
        let dir = tempfile::tempdir().unwrap();
        let service = test_service(dir.path()).await;
        let app = test_app(service);

        let response = app
            .oneshot(Request::builder().uri("/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let content_type = response
            .headers()
            .get("content-type")
            .unwrap()
            .to_str()
            .unwrap();
        assert!(content_type.starts_with("text/plain"));
    }

    #[tokio::test]
    async fn admin_routes_merged_into_main_router() {
        let dir = tempfile::tempdir().unwrap();
        let service = test_service(dir.path()).await;
        service.load_all().await.unwrap();

        let (status, json) = get_json(test_app(service), "/accounts").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["accounts"], serde_json::json!([]));
    }

    #[tokio::test]
    async fn concurrency_limit_queues_excess_requests() {
        let dir = tempfile::tempdir().unwrap();
        let service = test_service(dir.path()).await;
        let state = AppState {
            service: service.clone(),
            prometheus: test_prometheus_handle(),
            started_at: Instant::now(),
        };
        let admin = AdminState::new(service, Arc::new(FailoverSelector::default()));
        let app = build_router(state, admin, 1);

        // ConcurrencyLimitLayer queues rather than rejects
        let (a, b) = tokio::join!(
            get_json(app.clone(), "/accounts"),
            get_json(app.clone(), "/accounts")
        );
        assert_eq!(a.0, StatusCode::OK);
        assert_eq!(b.0, StatusCode::OK);
    }
}
