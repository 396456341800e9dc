//! notifyd-registry — Workflow Registry (C2)
//!
//! Two indexes, generalized from `mqk-strategy::PluginRegistry`'s single
//! process-global catalogue into a tenant-sliced pair (spec §4.2):
//!
//! - **static**: `workflow_key -> Definition`, populated once at
//!   `initialize_static` and never mutated afterward.
//! - **dynamic**: `(tenant_id, workflow_key) -> Definition`, rebuilt per
//!   tenant by `load_tenant`/`reload_tenant`.
//!
//! `resolve` implements the shadow rule: a tenant's dynamic entry wins over
//! the static entry, but only within that tenant.

use std::collections::HashMap;
use std::sync::Arc;

use dashmap::DashMap;
use notifyd_factory::{DefinitionBuilder, Definition};
use notifyd_schemas::WorkflowConfig;
use sqlx::PgPool;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RegistryStats {
    pub total: usize,
    pub static_count: usize,
    pub dynamic_count: usize,
    pub tenant_count: usize,
}

/// Tenant-sliced workflow registry (spec §4.2).
pub struct WorkflowRegistry {
    static_index: HashMap<String, Arc<dyn Definition>>,
    dynamic_index: DashMap<(String, String), Arc<dyn Definition>>,
    builder: Arc<dyn DefinitionBuilder>,
}

impl WorkflowRegistry {
    pub fn new(builder: Arc<dyn DefinitionBuilder>) -> Self {
        Self {
            static_index: HashMap::new(),
            dynamic_index: DashMap::new(),
            builder,
        }
    }

    /// Populate the static index once at process start. Never call again —
    /// static entries are immutable after this returns (spec §4.2 invariant).
    pub fn register_static(&mut self, key: impl Into<String>, def: Arc<dyn Definition>) {
        self.static_index.insert(key.into(), def);
    }

    /// Insert or overwrite one tenant's dynamic entry, validating `config`
    /// via the Factory first.
    pub fn register_dynamic(
        &self,
        key: &str,
        config: WorkflowConfig,
        tenant_id: &str,
    ) -> Result<(), Vec<notifyd_factory::ValidationError>> {
        let def = self.builder.build(config)?;
        self.dynamic_index
            .insert((tenant_id.to_string(), key.to_string()), def);
        Ok(())
    }

    pub fn unregister(&self, key: &str, tenant_id: Option<&str>) {
        match tenant_id {
            Some(t) => {
                self.dynamic_index.remove(&(t.to_string(), key.to_string()));
            }
            None => {
                // Static entries are "never mutated after initialize_static
                // returns" per spec, so unregister without a tenant is a
                // dynamic-index-only operation scoped to nothing — callers
                // must name a tenant to remove a dynamic entry. No-op here
                // guards against accidentally mutating the static catalogue.
            }
        }
    }

    /// `resolve(key, tenant)`: dynamic shadows static, only within `tenant`
    /// (spec §4.2).
    pub fn resolve(&self, key: &str, tenant_id: Option<&str>) -> Option<Arc<dyn Definition>> {
        if let Some(t) = tenant_id {
            if let Some(def) = self.dynamic_index.get(&(t.to_string(), key.to_string())) {
                return Some(Arc::clone(def.value()));
            }
        }
        self.static_index.get(key).cloned()
    }

    /// Rebuild this tenant's dynamic slice from the store. A load error for
    /// one row is logged and skipped, never aborts the tenant (spec §4.2).
    pub async fn load_tenant(&self, pool: &PgPool, tenant_id: &str) -> anyhow::Result<()> {
        let rows = notifyd_db::list_dynamic_published(pool, tenant_id)
            .await
            .map_err(|e| anyhow::anyhow!("loading dynamic workflows for {tenant_id}: {e}"))?;

        for row in rows {
            let Some(config) = WorkflowConfig::from_workflow(&row) else {
                continue;
            };
            let key = config.workflow_key.clone();
            if let Err(errs) = self.register_dynamic(&key, config, tenant_id) {
                tracing::warn!(
                    tenant_id,
                    workflow_key = %key,
                    errors = ?errs,
                    "skipping invalid dynamic workflow row"
                );
            }
        }
        Ok(())
    }

    /// Drop then reload this tenant's slice only — other tenants are
    /// untouched (spec §4.2).
    pub async fn reload_tenant(&self, pool: &PgPool, tenant_id: &str) -> anyhow::Result<()> {
        self.dynamic_index.retain(|(t, _), _| t != tenant_id);
        self.load_tenant(pool, tenant_id).await
    }

    pub fn stats(&self) -> RegistryStats {
        let dynamic_count = self.dynamic_index.len();
        let tenant_count = self
            .dynamic_index
            .iter()
            .map(|e| e.key().0.clone())
            .collect::<std::collections::HashSet<_>>()
            .len();
        RegistryStats {
            total: self.static_index.len() + dynamic_count,
            static_count: self.static_index.len(),
            dynamic_count,
            tenant_count,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use notifyd_factory::ValidationError;
    use notifyd_schemas::WorkflowKind;
    use serde_json::Value;

    struct Echo(&'static str);
    #[async_trait]
    impl Definition for Echo {
        async fn execute(&self, _tenant_id: &str, _payload: Value) -> anyhow::Result<()> {
            Ok(())
        }
    }

    struct AlwaysBuilds;
    impl DefinitionBuilder for AlwaysBuilds {
        fn build(&self, config: WorkflowConfig) -> Result<Arc<dyn Definition>, Vec<ValidationError>> {
            if config.channels.is_empty() {
                return Err(vec![ValidationError::EmptyChannels]);
            }
            Ok(Arc::new(Echo("dynamic")))
        }
    }

    fn cfg(key: &str) -> WorkflowConfig {
        WorkflowConfig {
            workflow_key: key.into(),
            kind: WorkflowKind::Dynamic,
            channels: vec![notifyd_schemas::Channel::Email],
            email_template_id: Some("t1".into()),
            in_app_template_id: None,
            sms_template_id: None,
            push_template_id: None,
            chat_template_id: None,
            payload_schema: None,
            name: None,
            description: None,
            tags: None,
        }
    }

    #[test]
    fn dynamic_shadows_static_only_within_tenant() {
        let mut reg = WorkflowRegistry::new(Arc::new(AlwaysBuilds));
        reg.register_static("common", Arc::new(Echo("static")));
        reg.register_dynamic("common", cfg("common"), "T").unwrap();

        let for_t = reg.resolve("common", Some("T")).unwrap();
        let for_tenantless = reg.resolve("common", None).unwrap();
        // can't downcast these trait objects to compare identity directly,
        // but the dynamic builder and static registration are distinct Arcs.
        assert!(!Arc::ptr_eq(&for_t, &for_tenantless));
        // a tenant with no dynamic entry still falls back to static.
        assert!(reg.resolve("common", Some("U")).is_some());
    }

    #[test]
    fn unknown_tenant_falls_back_to_static() {
        let mut reg = WorkflowRegistry::new(Arc::new(AlwaysBuilds));
        reg.register_static("common", Arc::new(Echo("static")));
        assert!(reg.resolve("common", Some("unknown-tenant")).is_some());
    }

    #[test]
    fn resolve_without_tenant_never_sees_dynamic() {
        let mut reg = WorkflowRegistry::new(Arc::new(AlwaysBuilds));
        reg.register_static("common", Arc::new(Echo("static")));
        reg.register_dynamic("common", cfg("common"), "T").unwrap();
        assert!(reg.resolve("common", None).is_some());
        assert!(reg.resolve("unregistered", None).is_none());
    }

    #[test]
    fn stats_counts_total_and_tenants() {
        let mut reg = WorkflowRegistry::new(Arc::new(AlwaysBuilds));
        reg.register_static("a", Arc::new(Echo("s")));
        reg.register_dynamic("k1", cfg("k1"), "T1").unwrap();
        reg.register_dynamic("k2", cfg("k2"), "T1").unwrap();
        reg.register_dynamic("k3", cfg("k3"), "T2").unwrap();

        let stats = reg.stats();
        assert_eq!(stats.static_count, 1);
        assert_eq!(stats.dynamic_count, 3);
        assert_eq!(stats.tenant_count, 2);
        assert_eq!(stats.total, 4);
    }

    #[test]
    fn unregister_drops_only_that_tenants_entry() {
        let mut reg = WorkflowRegistry::new(Arc::new(AlwaysBuilds));
        reg.register_dynamic("k", cfg("k"), "T1").unwrap();
        reg.register_dynamic("k", cfg("k"), "T2").unwrap();
        reg.unregister("k", Some("T1"));
        assert!(reg.resolve("k", Some("T1")).is_none());
        assert!(reg.resolve("k", Some("T2")).is_some());
    }

    #[test]
    fn invalid_config_is_rejected_not_registered() {
        let reg = WorkflowRegistry::new(Arc::new(AlwaysBuilds));
        let mut bad = cfg("bad");
        bad.channels.clear();
        assert!(reg.register_dynamic("bad", bad, "T").is_err());
        assert!(reg.resolve("bad", Some("T")).is_none());
    }
}
