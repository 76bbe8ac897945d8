//! Account pool for Kiro / AWS SSO OIDC credentials
//!
//! Manages every credential file in the store as one account, keeps their
//! tokens fresh, tracks usage quota and bans per account, and picks a
//! replacement when the active account stops working. The store on disk is
//! the single source of truth; `AccountService` holds the derived view.
//!
//! Account lifecycle:
//! 1. A credential file appears in the tokens directory (import or an external producer)
//! 2. `load_all` picks it up → phase `Loaded`, view built with expiry flags and cached usage
//! 3. `switch_to` refreshes a token inside the refresh-ahead window, then installs it as the
//!    IDE's current token
//! 4. A failed refresh still inside the grace window switches anyway; past it, the switch aborts
//! 5. A ban (refresh denial or suspended usage probe) is recorded in the usage cache and
//!    survives staleness until a healthy re-check clears it
//! 6. `FailoverSelector` moves the active pointer to the next usable account, on request or
//!    from the auto-failover task when the active account is banned or truly invalid
//! 7. Background task refreshes tokens proactively before expiration

pub mod aliases;
pub mod error;
pub mod failover;
pub mod lifecycle;
pub mod outcome;
pub mod refresh;
pub mod service;
pub mod usage_cache;
pub mod usage_stats;
pub mod view;

pub use aliases::AccountKeys;
pub use error::{Error, Result};
pub use failover::{
    FailoverOutcome, FailoverSelector, FailoverTarget, pick_next, spawn_auto_failover_task,
};
pub use lifecycle::{AccountPhase, PhaseEvent};
pub use outcome::{BatchSummary, FailureKind, HealthReport, SwitchResult};
pub use refresh::spawn_refresh_task;
pub use service::{AccountService, AccountServiceOptions, AccountsChanged, AccountsSubscription};
pub use usage_cache::UsageCache;
pub use usage_stats::{UsageStat, UsageStats};
pub use view::AccountView;
