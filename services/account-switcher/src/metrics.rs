//! Prometheus metrics exposition
//!
//! The account pool emits its metrics through the `metrics` facade:
//!
//! - `account_refresh_total` (counter): label `outcome`
//! - `account_switch_total` (counter): label `outcome`
//! - `account_failover_total` (counter): label `outcome`
//! - `account_health_check_total` (counter): label `verdict`
//! - `accounts_loaded` (gauge)
//!
//! This module installs the recorder that renders them on `/metrics`, plus
//! the admin API's own request counter.

use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};

/// Install the Prometheus recorder and return a handle for rendering metrics.
///
/// Must run before the account service emits anything; metrics recorded
/// earlier are dropped.
pub fn install_recorder() -> Result<PrometheusHandle, BuildError> {
    PrometheusBuilder::new().install_recorder()
}

/// Record a completed admin API call.
pub fn record_admin_request(route: &'static str, status: u16) {
    metrics::counter!("admin_requests_total", "route" => route, "status" => status.to_string())
        .increment(1);
}
