//! Command handlers for the nestsync CLI

pub mod config;
pub mod doc;
pub mod serve;
pub mod status;
pub mod sync;

use nestsync_core::StoreError;

/// Attach a next step to the errors a user can act on
pub fn with_hint(err: StoreError) -> anyhow::Error {
    match err.recovery_suggestion() {
        Some(hint) => anyhow::Error::new(err).context(hint),
        None => err.into(),
    }
}
