use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use tracing::info;

use gateway_core::audit::KvAudit;
use gateway_core::cfg::Config;
use gateway_core::devices::{DeviceBackend, MockBackend};
use gateway_core::executor::MacroExecutor;
use gateway_core::progress::ProgressBroadcaster;
use gateway_core::registry::MacroRegistry;
use gateway_core::schedule::{KvScheduleStore, ScheduleRunner, ScheduleStore};
use gateway_core::store::{open_fs, Kv, MemKv};

/// Everything the modules share.
pub struct Gateway {
    pub executor: Arc<MacroExecutor>,
    pub schedules: Arc<dyn ScheduleStore>,
    pub runner: ScheduleRunner,
    pub backend: &'static str,
    pub started: Instant,
}

impl Gateway {
    /// Wire the services from config. `mock` swaps in the offline device
    /// back end and an in-memory store.
    pub fn open(cfg: &Config, base: &Path, mock: bool) -> Result<Self> {
        let registry = load_registry(cfg, base)?;
        if mock {
            let devices = Arc::new(mock_backend(cfg));
            return Ok(Self::assemble(MemKv::new(), registry, devices, "mock", cfg));
        }
        let data_dir = Config::resolve(base, &cfg.data_dir);
        let kv = open_fs(&data_dir).with_context(|| format!("open store {}", data_dir.display()))?;
        let (devices, backend) = live_backend(cfg)?;
        Ok(Self::assemble(kv, registry, devices, backend, cfg))
    }

    fn assemble<K: Kv>(
        kv: K,
        registry: MacroRegistry,
        devices: Arc<dyn DeviceBackend>,
        backend: &'static str,
        cfg: &Config,
    ) -> Self {
        let executor = Arc::new(
            MacroExecutor::new(
                Arc::new(registry),
                devices,
                ProgressBroadcaster::default(),
                Arc::new(KvAudit::new(kv.clone())),
            )
            .with_retry_backoff(Duration::from_millis(cfg.executor.retry_backoff_ms)),
        );
        let schedules: Arc<dyn ScheduleStore> = Arc::new(KvScheduleStore::new(kv));
        let runner = ScheduleRunner::new(schedules.clone(), executor.clone());
        info!(backend, macros = executor.registry().len(), "gateway ready");
        Self { executor, schedules, runner, backend, started: Instant::now() }
    }

    /// In-memory gateway over `catalog` (tests).
    #[cfg(all(test, feature = "web-api"))]
    pub fn in_memory(catalog: &str, devices: Arc<dyn DeviceBackend>) -> Result<Self> {
        let registry = MacroRegistry::parse(catalog)?;
        let mut cfg = Config::default();
        cfg.executor.retry_backoff_ms = 0;
        Ok(Self::assemble(MemKv::new(), registry, devices, "test", &cfg))
    }

    pub fn registry(&self) -> &MacroRegistry { self.executor.registry() }
}

/// Load the catalog named by `macros_path` (relative to `base`).
pub fn load_registry(cfg: &Config, base: &Path) -> Result<MacroRegistry> {
    let path = Config::resolve(base, &cfg.macros_path);
    MacroRegistry::load(&path).with_context(|| format!("load catalog {}", path.display()))
}

#[cfg(feature = "runner-http")]
fn live_backend(cfg: &Config) -> Result<(Arc<dyn DeviceBackend>, &'static str)> {
    let http = gateway_core::devices::HttpBackend::new(cfg.devices.clone())?;
    Ok((Arc::new(http), "http"))
}

#[cfg(not(feature = "runner-http"))]
fn live_backend(cfg: &Config) -> Result<(Arc<dyn DeviceBackend>, &'static str)> {
    tracing::warn!("built without runner-http; device calls go to the mock back end");
    Ok((Arc::new(mock_backend(cfg)), "mock"))
}

fn mock_backend(cfg: &Config) -> MockBackend {
    MockBackend::new(cfg.mock.ha_states.clone()).with_devices(&cfg.devices)
}
