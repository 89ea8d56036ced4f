//! Per-device cache of kernel registries.
//!
//! One registry per (device, data type, architecture), built and loaded on first request and
//! kept until process exit. Devices are partitioned behind an `RwLock`; within a device each
//! key owns a `OnceCell`, so loading one registry never blocks lookups of another.

use std::collections::HashMap;
use std::sync::Arc;

use once_cell::sync::OnceCell;
use parking_lot::{Mutex, RwLock};
use xattn_driver::{CudaDriver, DeviceOrdinal, Driver};

use crate::catalog::Catalog;
use crate::config::DispatchConfig;
use crate::dtype::{DataType, SmVersion};
use crate::error::DispatchError;
use crate::registry::KernelRegistry;
use crate::Result;

type RegistrySlot = Arc<OnceCell<Arc<KernelRegistry>>>;

/// Registries of one device.
#[derive(Default)]
struct DeviceRegistries {
    slots: Mutex<HashMap<(DataType, SmVersion), RegistrySlot>>,
}

impl DeviceRegistries {
    fn slot(&self, data_type: DataType, arch: SmVersion) -> RegistrySlot {
        Arc::clone(self.slots.lock().entry((data_type, arch)).or_default())
    }

    fn loaded(&self) -> usize {
        self.slots.lock().values().filter(|slot| slot.get().is_some()).count()
    }
}

pub struct RegistryCache {
    driver: Arc<dyn Driver>,
    catalog: Catalog,
    config: Arc<DispatchConfig>,
    devices: RwLock<HashMap<DeviceOrdinal, Arc<DeviceRegistries>>>,
}

static PROCESS: OnceCell<Arc<RegistryCache>> = OnceCell::new();

impl RegistryCache {
    pub fn new(driver: Arc<dyn Driver>, catalog: Catalog, config: DispatchConfig) -> Self {
        Self {
            driver,
            catalog,
            config: Arc::new(config),
            devices: RwLock::new(HashMap::new()),
        }
    }

    /// The process-wide cache over libcuda, the linked catalog and the environment config.
    pub fn process() -> Result<Arc<RegistryCache>> {
        PROCESS
            .get_or_try_init(|| {
                let driver: Arc<dyn Driver> = CudaDriver::shared()?;
                let config = DispatchConfig::from_env()?;
                Ok::<_, DispatchError>(Arc::new(RegistryCache::new(driver, Catalog::linked(), config)))
            })
            .map(Arc::clone)
    }

    pub fn driver(&self) -> &Arc<dyn Driver> {
        &self.driver
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    pub fn config(&self) -> &DispatchConfig {
        &self.config
    }

    /// Registry for the calling thread's current device.
    pub fn get_registry(&self, data_type: DataType, arch: SmVersion) -> Result<Arc<KernelRegistry>> {
        let device = self.driver.current_device()?;
        self.get_registry_on(device, data_type, arch)
    }

    /// Registry for `device`. Modules are loaded into the calling thread's current context,
    /// which must belong to `device`.
    pub fn get_registry_on(
        &self,
        device: DeviceOrdinal,
        data_type: DataType,
        arch: SmVersion,
    ) -> Result<Arc<KernelRegistry>> {
        let slot = self.device(device).slot(data_type, arch);
        let registry = slot.get_or_try_init(|| {
            let mut registry = KernelRegistry::new(
                Arc::clone(&self.driver),
                self.catalog.clone(),
                data_type,
                arch,
                Arc::clone(&self.config),
            );
            registry.load()?;
            tracing::info!("Registry for {} on {} ({}) ready with {} kernels", data_type, arch, device, registry.len());
            Ok::<_, DispatchError>(Arc::new(registry))
        })?;
        Ok(Arc::clone(registry))
    }

    fn device(&self, device: DeviceOrdinal) -> Arc<DeviceRegistries> {
        if let Some(regs) = self.devices.read().get(&device) {
            return Arc::clone(regs);
        }
        let mut devices = self.devices.write();
        Arc::clone(devices.entry(device).or_default())
    }

    /// Registries built so far, across all devices.
    pub fn registry_count(&self) -> usize {
        self.devices.read().values().map(|d| d.loaded()).sum()
    }
}

impl std::fmt::Debug for RegistryCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegistryCache")
            .field("catalog", &self.catalog.len())
            .field("registries", &self.registry_count())
            .finish()
    }
}
