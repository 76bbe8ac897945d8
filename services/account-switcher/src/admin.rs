//! Admin API for account management
//!
//! The collaborator surface: a UI or script reads account snapshots and
//! issues commands here. Token material never leaves the process; every
//! response is built from `AccountView` or an outcome type.
//!
//! Endpoints:
//! - GET    /accounts                   — all accounts, display order
//! - GET    /accounts/active            — the installed account
//! - POST   /accounts/reload            — re-read the store
//! - POST   /accounts/import            — `{path}` copy a credential file into the store
//! - POST   /accounts/health            — health-check every account
//! - POST   /accounts/refresh-expired   — refresh every expired account
//! - DELETE /accounts/banned            — delete banned accounts
//! - DELETE /accounts/exhausted         — delete accounts with no quota left
//! - POST   /accounts/{id}/switch       — make `id` the active account
//! - POST   /accounts/{id}/refresh      — refresh one token
//! - POST   /accounts/{id}/health       — refresh + usage probe for one account
//! - DELETE /accounts/{id}              — delete one account
//! - POST   /failover                   — switch away from the active account
//! - GET    /events                     — server-sent change notifications
//!
//! `{id}` accepts the account id, its label, its email, or the id without `.json`.

use std::convert::Infallible;
use std::path::PathBuf;
use std::sync::Arc;

use axum::Router;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use futures_util::stream::{self, Stream, StreamExt};
use kiro_auth::RefreshOutcome;
use kiro_pool::{AccountService, AccountsChanged, FailoverSelector};
use serde::Deserialize;
use serde_json::json;
use tracing::{info, warn};

use crate::metrics::record_admin_request;

/// Shared state for admin API handlers.
#[derive(Clone)]
pub struct AdminState {
    service: Arc<AccountService>,
    selector: Arc<FailoverSelector>,
}

impl AdminState {
    pub fn new(service: Arc<AccountService>, selector: Arc<FailoverSelector>) -> Self {
        Self { service, selector }
    }
}

/// Build the admin axum router with all account management endpoints.
pub fn build_admin_router(state: AdminState) -> Router {
    Router::new()
        .route("/accounts", get(list_accounts))
        .route("/accounts/active", get(active_account))
        .route("/accounts/reload", post(reload))
        .route("/accounts/import", post(import_account))
        .route("/accounts/health", post(check_all_health))
        .route("/accounts/refresh-expired", post(refresh_expired))
        .route("/accounts/banned", delete(delete_banned))
        .route("/accounts/exhausted", delete(delete_exhausted))
        .route("/accounts/{id}", delete(delete_account))
        .route("/accounts/{id}/switch", post(switch_account))
        .route("/accounts/{id}/refresh", post(refresh_account))
        .route("/accounts/{id}/health", post(check_health))
        .route("/failover", post(failover))
        .route("/events", get(events))
        .with_state(state)
}

fn json_response(route: &'static str, status: StatusCode, body: serde_json::Value) -> Response {
    record_admin_request(route, status.as_u16());
    (
        status,
        [(axum::http::header::CONTENT_TYPE, "application/json")],
        body.to_string(),
    )
        .into_response()
}

fn ok<T: serde::Serialize>(route: &'static str, body: &T) -> Response {
    match serde_json::to_value(body) {
        Ok(value) => json_response(route, StatusCode::OK, value),
        Err(e) => json_response(
            route,
            StatusCode::INTERNAL_SERVER_ERROR,
            json!({ "error": format!("serialization failed: {e}") }),
        ),
    }
}

fn error_response(route: &'static str, e: &kiro_pool::Error) -> Response {
    use kiro_auth::Error as StoreError;
    use kiro_pool::Error;

    let status = match e {
        Error::NotFound(_) | Error::Store(StoreError::NotFound(_)) => StatusCode::NOT_FOUND,
        Error::Store(StoreError::CredentialParse(_) | StoreError::InvalidRecord(_)) => {
            StatusCode::BAD_REQUEST
        }
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    if status == StatusCode::INTERNAL_SERVER_ERROR {
        warn!(route, error = %e, "admin request failed");
    }
    json_response(route, status, json!({ "error": e.to_string() }))
}

/// GET /accounts — all accounts with derived status, tokens never included.
async fn list_accounts(State(state): State<AdminState>) -> Response {
    let accounts = state.service.accounts().await;
    json_response(
        "accounts",
        StatusCode::OK,
        json!({ "accounts": &*accounts }),
    )
}

/// GET /accounts/active — 404 when no stored account matches the installed token.
async fn active_account(State(state): State<AdminState>) -> Response {
    match state.service.active_account().await {
        Some(view) => ok("active", &view),
        None => json_response(
            "active",
            StatusCode::NOT_FOUND,
            json!({ "error": "no active account" }),
        ),
    }
}

/// POST /accounts/reload — pick up files written by other processes.
async fn reload(State(state): State<AdminState>) -> Response {
    match state.service.load_all().await {
        Ok(accounts) => json_response(
            "reload",
            StatusCode::OK,
            json!({ "accounts": &*accounts }),
        ),
        Err(e) => error_response("reload", &e),
    }
}

#[derive(Deserialize)]
struct ImportRequest {
    path: PathBuf,
}

/// POST /accounts/import — copy an external credential file into the store.
async fn import_account(
    State(state): State<AdminState>,
    axum::Json(body): axum::Json<ImportRequest>,
) -> Response {
    match state.service.import(&body.path).await {
        Ok(id) => {
            info!(account_id = %id, "account imported via admin API");
            json_response(
                "import",
                StatusCode::OK,
                json!({ "accountId": id, "status": "imported" }),
            )
        }
        Err(e) => error_response("import", &e),
    }
}

/// POST /accounts/health — batch health check.
async fn check_all_health(State(state): State<AdminState>) -> Response {
    let summary = state.service.check_all_health().await;
    ok("batch_health", &summary)
}

/// POST /accounts/refresh-expired — batch refresh of expired accounts.
async fn refresh_expired(State(state): State<AdminState>) -> Response {
    let summary = state.service.refresh_expired().await;
    ok("refresh_expired", &summary)
}

/// DELETE /accounts/banned
async fn delete_banned(State(state): State<AdminState>) -> Response {
    let deleted = state.service.delete_banned().await;
    json_response("delete_banned", StatusCode::OK, json!({ "deleted": deleted }))
}

/// DELETE /accounts/exhausted
async fn delete_exhausted(State(state): State<AdminState>) -> Response {
    let deleted = state.service.delete_exhausted().await;
    json_response(
        "delete_exhausted",
        StatusCode::OK,
        json!({ "deleted": deleted }),
    )
}

/// DELETE /accounts/{id} — remove the file and every cache entry for it.
async fn delete_account(State(state): State<AdminState>, Path(id): Path<String>) -> Response {
    match state.service.delete_account(&id).await {
        Ok(()) => json_response(
            "delete",
            StatusCode::OK,
            json!({ "accountId": id, "status": "removed" }),
        ),
        Err(e) => error_response("delete", &e),
    }
}

/// POST /accounts/{id}/switch — result carries `success`, never an HTTP error
/// for a refused switch.
async fn switch_account(State(state): State<AdminState>, Path(id): Path<String>) -> Response {
    match state.service.switch_to(&id).await {
        Ok(result) => ok("switch", &result),
        Err(e) => error_response("switch", &e),
    }
}

/// POST /accounts/{id}/refresh
async fn refresh_account(State(state): State<AdminState>, Path(id): Path<String>) -> Response {
    let outcome = match state.service.refresh_token(&id).await {
        Ok(outcome) => outcome,
        Err(e) => return error_response("refresh", &e),
    };
    let body = match outcome {
        RefreshOutcome::Success(token) => json!({
            "success": true,
            "expiresIn": token.expires_in,
        }),
        RefreshOutcome::Failure(failure) => json!({
            "success": false,
            "error": failure.kind.as_str(),
            "message": failure.message,
            "status": failure.status,
            "isBanned": failure.is_banned,
            "isInvalidCredentials": failure.is_invalid_credentials,
            "isRateLimited": failure.is_rate_limited,
        }),
    };
    json_response("refresh", StatusCode::OK, body)
}

/// POST /accounts/{id}/health
async fn check_health(State(state): State<AdminState>, Path(id): Path<String>) -> Response {
    match state.service.check_health(&id).await {
        Ok(report) => ok("health", &report),
        Err(e) => error_response("health", &e),
    }
}

/// POST /failover
async fn failover(State(state): State<AdminState>) -> Response {
    let outcome = state.selector.failover(state.service.as_ref()).await;
    ok("failover", &outcome)
}

fn change_event(change: &AccountsChanged) -> Event {
    let payload = json!({
        "generation": change.generation,
        "accounts": &*change.accounts,
    });
    match Event::default()
        .event("accounts")
        .id(change.generation.to_string())
        .json_data(payload)
    {
        Ok(event) => event,
        Err(e) => {
            warn!(error = %e, "failed to encode change notification");
            Event::default().comment("encode error")
        }
    }
}

/// GET /events — the current list first, then one event per change.
async fn events(State(state): State<AdminState>) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    record_admin_request("events", 200);
    // Subscribe before reading the snapshot so no change falls in between
    let subscription = state.service.subscribe();
    let initial = AccountsChanged {
        generation: 0,
        accounts: state.service.accounts().await,
    };

    let changes = stream::unfold(subscription, |mut subscription| async move {
        let change = subscription.recv().await?;
        Some((change, subscription))
    });
    let stream = stream::once(async move { initial })
        .chain(changes)
        .map(|change| Ok(change_event(&change)));

    Sse::new(stream).keep_alive(KeepAlive::default())
}
