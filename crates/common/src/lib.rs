//! Common types shared by the account switcher crates

mod secret;
mod error;

pub use secret::Secret;
pub use error::{Error, Result};
