//! Provider constants
//!
//! Endpoint templates, defaults and timing windows for the AWS SSO OIDC
//! provider that issues Kiro credentials. Endpoint templates contain a
//! `{region}` placeholder substituted per account.

use std::time::Duration;

/// Region used when a credential record does not name one
pub const DEFAULT_REGION: &str = "us-east-1";

/// OIDC token endpoint (refresh-token grant)
pub const TOKEN_URL_TEMPLATE: &str = "https://oidc.{region}.amazonaws.com/token";

/// Authenticated usage-limits endpoint, also the only reliable ban probe
pub const USAGE_LIMITS_URL_TEMPLATE: &str = "https://codewhisperer.{region}.amazonaws.com/getUsageLimits?origin=AI_EDITOR&resourceType=AGENTIC_REQUEST";

/// Placeholder substituted with the account's region in URL templates
pub const REGION_PLACEHOLDER: &str = "{region}";

/// Lifetime assumed when the token endpoint omits `expiresIn`
pub const DEFAULT_EXPIRES_IN_SECS: u64 = 3600;

/// Longest `expiresIn` accepted from the token endpoint (one year)
pub const MAX_EXPIRES_IN_SECS: u64 = 365 * 24 * 60 * 60;

/// Timeout for refresh and probe calls
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// A token needs a proactive refresh once it expires within this window
pub const REFRESH_BEFORE_EXPIRY_SECS: i64 = 10 * 60;

/// A token is truly unusable only after it has been expired this long
pub const AUTH_TOKEN_INVALIDATION_OFFSET_SECS: i64 = 3 * 60;

/// Defaults written into the installed current-token file
pub const DEFAULT_AUTH_METHOD: &str = "IdC";
pub const DEFAULT_PROVIDER: &str = "BuilderId";

/// OIDC client registrations are valid for 90 days
pub const CLIENT_REGISTRATION_TTL_DAYS: i64 = 90;

/// Default per-account request quota shown until the provider reports one
pub const DEFAULT_USAGE_LIMIT: i64 = 500;

/// 403 reason on the usage endpoint that marks a genuinely banned account
pub const SUSPENDED_REASON: &str = "TEMPORARILY_SUSPENDED";

/// Substring in an OIDC error message that unambiguously signals a ban
pub const ACCESS_NOT_AVAILABLE_SIGNAL: &str = "access not available";

/// User agent sent on the usage probe
pub const PROBE_USER_AGENT: &str = "aws-toolkit-vscode/3.0.0";

/// Credential file naming inside the tokens directory
pub const TOKEN_FILE_PREFIX: &str = "token-";
pub const TOKEN_FILE_SUFFIX: &str = ".json";

/// Expand a `{region}` URL template.
pub fn endpoint_for(template: &str, region: &str) -> String {
    template.replace(REGION_PLACEHOLDER, region)
}
