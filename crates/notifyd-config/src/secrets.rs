//! Single source of truth for runtime secret resolution.
//!
//! Config values stored here come straight from the environment — callers
//! invoke [`resolve_secrets`] once at startup and pass the result into
//! constructors rather than scattering `std::env::var` calls around.
//! `Debug` on [`ResolvedSecrets`] redacts every field; error messages name
//! the env var, never its value.

use anyhow::{Context, Result};

/// Secrets resolved from the environment for one daemon instantiation.
#[derive(Clone)]
pub struct ResolvedSecrets {
    pub store_service_key: String,
    pub delivery_sdk_secret: String,
}

impl std::fmt::Debug for ResolvedSecrets {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResolvedSecrets")
            .field("store_service_key", &"<REDACTED>")
            .field("delivery_sdk_secret", &"<REDACTED>")
            .finish()
    }
}

fn require_env(var_name: &str) -> Result<String> {
    std::env::var(var_name)
        .ok()
        .filter(|v| !v.trim().is_empty())
        .with_context(|| format!("required env var '{var_name}' is not set or empty"))
}

/// Resolve both secrets from the process environment. Fails closed: a
/// missing or blank variable aborts startup rather than running with a
/// partially-configured store or delivery client.
pub fn resolve_secrets() -> Result<ResolvedSecrets> {
    Ok(ResolvedSecrets {
        store_service_key: require_env("STORE_SERVICE_KEY")?,
        delivery_sdk_secret: require_env("DELIVERY_SDK_SECRET")?,
    })
}
