use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;

use crate::engine::Engine;
use crate::limits::*;
use crate::notify::NotifyHub;
use crate::reaper::{self, SweepKind};

/// Knobs every tenant engine is created with.
#[derive(Debug, Clone)]
pub struct TenantSettings {
    pub compact_threshold: u64,
    /// Lapsed-interview sweep cadence. Runs several times a day.
    pub sweep_interval: Duration,
    /// Expired-link sweep cadence. Daily by default.
    pub link_sweep_interval: Duration,
    /// Fixed local-time offset from UTC, minutes.
    pub utc_offset_min: i32,
}

impl Default for TenantSettings {
    fn default() -> Self {
        Self {
            compact_threshold: 1000,
            sweep_interval: Duration::from_secs(6 * 3600),
            link_sweep_interval: Duration::from_secs(24 * 3600),
            utc_offset_min: 0,
        }
    }
}

/// Manages per-tenant engines. Each tenant gets its own Engine + WAL +
/// sweeps + compactor. Tenant = database name from the pgwire
/// connection.
pub struct TenantManager {
    engines: DashMap<String, Arc<Engine>>,
    data_dir: PathBuf,
    settings: TenantSettings,
}

impl TenantManager {
    pub fn new(data_dir: PathBuf, settings: TenantSettings) -> Self {
        Self { engines: DashMap::new(), data_dir, settings }
    }

    /// Get or lazily create an engine for the given tenant.
    pub fn get_or_create(&self, tenant: &str) -> std::io::Result<Arc<Engine>> {
        if let Some(engine) = self.engines.get(tenant) {
            return Ok(engine.value().clone());
        }
        if tenant.len() > MAX_TENANT_NAME_LEN {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "tenant name too long",
            ));
        }
        if self.engines.len() >= MAX_TENANTS {
            return Err(std::io::Error::other("too many tenants"));
        }

        // Sanitize tenant name to prevent path traversal
        let safe_name: String = tenant
            .chars()
            .filter(|c| c.is_alphanumeric() || *c == '_' || *c == '-')
            .collect();
        if safe_name.is_empty() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "empty tenant name",
            ));
        }

        let wal_path = self.data_dir.join(format!("{safe_name}.wal"));
        let notify = Arc::new(NotifyHub::new());
        let engine = Arc::new(Engine::new(wal_path, notify, self.settings.utc_offset_min)?);

        // Spawn the recurring jobs for this tenant: the two sweeps plus
        // the WAL compactor.
        tokio::spawn(reaper::run_sweeper(
            engine.clone(),
            SweepKind::Interviews,
            self.settings.sweep_interval,
        ));
        tokio::spawn(reaper::run_sweeper(
            engine.clone(),
            SweepKind::Links,
            self.settings.link_sweep_interval,
        ));
        tokio::spawn(reaper::run_compactor(
            engine.clone(),
            self.settings.compact_threshold,
        ));

        self.engines.insert(tenant.to_string(), engine.clone());
        metrics::gauge!(crate::observability::TENANTS_ACTIVE).set(self.engines.len() as f64);
        Ok(engine)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::*;
    use chrono::NaiveDate;
    use std::fs;
    use ulid::Ulid;

    fn test_data_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("intake_test_tenant").join(name);
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn tm(dir: PathBuf) -> TenantManager {
        TenantManager::new(dir, TenantSettings::default())
    }

    #[tokio::test]
    async fn tenant_isolation() {
        let tm = tm(test_data_dir("isolation"));

        let eng_a = tm.get_or_create("branch_a").unwrap();
        let eng_b = tm.get_or_create("branch_b").unwrap();

        let cid = Ulid::new();
        eng_a
            .upsert_candidate(cid, "Ada".into(), CandidateStatus::InviteSent)
            .await
            .unwrap();

        // Tenant B never heard of this candidate
        assert!(eng_a.get_candidate(cid).await.is_some());
        assert!(eng_b.get_candidate(cid).await.is_none());

        // Nor of their interviews
        let date = NaiveDate::from_ymd_opt(2099, 6, 7).unwrap();
        assert!(eng_b.interviews_on(date).await.is_empty());
    }

    #[tokio::test]
    async fn tenant_lazy_creation() {
        let dir = test_data_dir("lazy");
        let tm = tm(dir.clone());

        let entries: Vec<_> = fs::read_dir(&dir).unwrap().collect();
        assert!(entries.is_empty());

        let _eng = tm.get_or_create("my_branch").unwrap();
        assert!(dir.join("my_branch.wal").exists());
    }

    #[tokio::test]
    async fn tenant_same_engine_returned() {
        let tm = tm(test_data_dir("same_eng"));
        let eng1 = tm.get_or_create("foo").unwrap();
        let eng2 = tm.get_or_create("foo").unwrap();
        assert!(Arc::ptr_eq(&eng1, &eng2));
    }

    #[tokio::test]
    async fn tenant_name_sanitized() {
        let dir = test_data_dir("sanitize");
        let tm = tm(dir.clone());

        // Path traversal attempt lands inside the data dir
        let _eng = tm.get_or_create("../evil").unwrap();
        assert!(dir.join("evil.wal").exists());

        // Nothing left after sanitization
        assert!(tm.get_or_create("../..").is_err());
    }

    #[tokio::test]
    async fn tenant_name_too_long() {
        let tm = tm(test_data_dir("name_too_long"));
        let long_name = "x".repeat(MAX_TENANT_NAME_LEN + 1);
        let err = tm.get_or_create(&long_name).err().unwrap();
        assert!(err.to_string().contains("tenant name too long"));
    }
}
