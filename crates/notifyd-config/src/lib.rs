//! notifyd-config
//!
//! Environment-variable-driven configuration for the daemon (spec §6). No
//! YAML/file layering — every recognized variable is read once at startup
//! by [`DaemonConfig::from_env`] and passed down, the same "resolve once,
//! pass to constructors" discipline the secrets module follows.

pub mod secrets;

use anyhow::{Context, Result};
pub use secrets::{resolve_secrets, ResolvedSecrets};

fn env_default(var_name: &str, default: &str) -> String {
    std::env::var(var_name)
        .ok()
        .filter(|v| !v.trim().is_empty())
        .unwrap_or_else(|| default.to_string())
}

fn parse_env_default<T: std::str::FromStr>(var_name: &str, default: T) -> Result<T> {
    match std::env::var(var_name) {
        Ok(v) if !v.trim().is_empty() => v
            .trim()
            .parse()
            .map_err(|_| anyhow::anyhow!("env var '{var_name}' has an invalid value: '{v}'")),
        _ => Ok(default),
    }
}

/// All §6 environment variables, resolved once at boot.
#[derive(Clone, Debug)]
pub struct DaemonConfig {
    pub store_url: String,
    pub delivery_sdk_url: String,
    pub engine_address: String,
    pub engine_task_queue: String,
    /// Empty disables the realtime Subscription Manager (spec §6).
    pub tenant_ids: Vec<String>,
    pub health_port: u16,
    pub log_level: String,
    pub subscription_reconnect_delay_ms: u64,
    pub subscription_max_retries: u32,
    pub scheduled_interval_ms: u64,
    pub scheduled_batch: u32,
    pub secrets: ResolvedSecrets,
}

impl DaemonConfig {
    pub fn from_env() -> Result<Self> {
        let secrets = resolve_secrets().context("resolving daemon secrets")?;

        let store_url = std::env::var("STORE_URL")
            .ok()
            .filter(|v| !v.trim().is_empty())
            .context("required env var 'STORE_URL' is not set or empty")?;
        // [SUPPLEMENT] spec §6 names `DELIVERY_SDK_SECRET` but not the SDK's
        // base URL; the HTTP client can't be built without one, so this daemon
        // recognizes it too, fail-closed like the other endpoint variables.
        let delivery_sdk_url = std::env::var("DELIVERY_SDK_URL")
            .ok()
            .filter(|v| !v.trim().is_empty())
            .context("required env var 'DELIVERY_SDK_URL' is not set or empty")?;
        let engine_address = std::env::var("ENGINE_ADDRESS")
            .ok()
            .filter(|v| !v.trim().is_empty())
            .context("required env var 'ENGINE_ADDRESS' is not set or empty")?;
        let engine_task_queue = std::env::var("ENGINE_TASK_QUEUE")
            .ok()
            .filter(|v| !v.trim().is_empty())
            .context("required env var 'ENGINE_TASK_QUEUE' is not set or empty")?;

        let tenant_ids = std::env::var("DAEMON_TENANT_IDS")
            .unwrap_or_default()
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect();

        Ok(DaemonConfig {
            store_url,
            delivery_sdk_url,
            engine_address,
            engine_task_queue,
            tenant_ids,
            health_port: parse_env_default("DAEMON_HEALTH_PORT", 3001u16)
                .context("parsing DAEMON_HEALTH_PORT")?,
            log_level: env_default("DAEMON_LOG_LEVEL", "info"),
            subscription_reconnect_delay_ms: parse_env_default(
                "SUBSCRIPTION_RECONNECT_DELAY",
                1000u64,
            )
            .context("parsing SUBSCRIPTION_RECONNECT_DELAY")?,
            subscription_max_retries: parse_env_default("SUBSCRIPTION_MAX_RETRIES", 10u32)
                .context("parsing SUBSCRIPTION_MAX_RETRIES")?,
            scheduled_interval_ms: parse_env_default("SCHEDULED_INTERVAL_MS", 60_000u64)
                .context("parsing SCHEDULED_INTERVAL_MS")?,
            scheduled_batch: parse_env_default("SCHEDULED_BATCH", 100u32)
                .context("parsing SCHEDULED_BATCH")?,
            secrets,
        })
    }

    /// C4 is only started when at least one tenant is configured (spec §6).
    pub fn realtime_enabled(&self) -> bool {
        !self.tenant_ids.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    // Environment variables are process-global; serialize tests that mutate them.
    static ENV_LOCK: Mutex<()> = Mutex::new(());

    fn clear_all() {
        for var in [
            "STORE_URL",
            "STORE_SERVICE_KEY",
            "DELIVERY_SDK_SECRET",
            "DELIVERY_SDK_URL",
            "ENGINE_ADDRESS",
            "ENGINE_TASK_QUEUE",
            "DAEMON_TENANT_IDS",
            "DAEMON_HEALTH_PORT",
            "DAEMON_LOG_LEVEL",
            "SUBSCRIPTION_RECONNECT_DELAY",
            "SUBSCRIPTION_MAX_RETRIES",
            "SCHEDULED_INTERVAL_MS",
            "SCHEDULED_BATCH",
        ] {
            std::env::remove_var(var);
        }
    }

    fn set_required() {
        std::env::set_var("STORE_URL", "postgres://localhost/notifyd");
        std::env::set_var("STORE_SERVICE_KEY", "svc-key");
        std::env::set_var("DELIVERY_SDK_SECRET", "sdk-secret");
        std::env::set_var("DELIVERY_SDK_URL", "https://delivery.example.internal");
        std::env::set_var("ENGINE_ADDRESS", "127.0.0.1:7233");
        std::env::set_var("ENGINE_TASK_QUEUE", "notifyd-main");
    }

    #[test]
    fn missing_required_var_fails_closed() {
        let _guard = ENV_LOCK.lock().unwrap();
        clear_all();
        let err = DaemonConfig::from_env().unwrap_err();
        assert!(err.to_string().contains("STORE_SERVICE_KEY") || err.to_string().contains("DELIVERY_SDK_SECRET"));
    }

    #[test]
    fn defaults_apply_when_optional_vars_absent() {
        let _guard = ENV_LOCK.lock().unwrap();
        clear_all();
        set_required();
        let cfg = DaemonConfig::from_env().unwrap();
        assert_eq!(cfg.health_port, 3001);
        assert_eq!(cfg.log_level, "info");
        assert_eq!(cfg.subscription_reconnect_delay_ms, 1000);
        assert_eq!(cfg.subscription_max_retries, 10);
        assert_eq!(cfg.scheduled_interval_ms, 60_000);
        assert_eq!(cfg.scheduled_batch, 100);
        assert!(cfg.tenant_ids.is_empty());
        assert!(!cfg.realtime_enabled());
    }

    #[test]
    fn empty_tenant_ids_disables_realtime() {
        let _guard = ENV_LOCK.lock().unwrap();
        clear_all();
        set_required();
        std::env::set_var("DAEMON_TENANT_IDS", "tenant-a, tenant-b ,,tenant-c");
        let cfg = DaemonConfig::from_env().unwrap();
        assert_eq!(cfg.tenant_ids, vec!["tenant-a", "tenant-b", "tenant-c"]);
        assert!(cfg.realtime_enabled());
    }
}
