//! Core service façade and bootstrap helpers.
//!
//! This crate wires host-provided bridge implementations (remote transport,
//! filesystem, network monitor, device identity) into the sync core. Desktop
//! apps typically enable the `desktop-shims` feature (which depends on
//! `bridge-desktop`) so the filesystem, network monitor and device identity
//! have defaults; mobile hosts inject their own.
//!
//! ```ignore
//! use core_runtime::config::CoreConfig;
//! use core_service::CoreService;
//!
//! let config = CoreConfig::builder()
//!     .database_path("/path/to/library.db")
//!     .data_dir("/path/to/data")
//!     .remote_transport(Arc::new(MyTransport::new()))
//!     .build()?;
//!
//! let core = CoreService::bootstrap(config).await?;
//! core.start_background_maintenance(Duration::from_secs(300)).await;
//! let result = core.orchestrator().perform_intelligent_sync("user-1").await?;
//! ```

pub mod error;

pub use error::{CoreError, Result};

use std::sync::Arc;
use std::time::Duration;

use bridge_traits::sync::DeviceIdentity;
use core_library::db::{create_pool, DatabaseConfig};
use core_runtime::config::CoreConfig;
use core_runtime::events::{EventBus, EventStream};
use core_runtime::logging::init_logging;
use core_sync::{SyncBridges, SyncEngineConfig, SyncOrchestrator};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

struct MaintenanceTask {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

/// Primary façade exposed to host applications.
#[derive(Clone)]
pub struct CoreService {
    orchestrator: Arc<SyncOrchestrator>,
    event_bus: EventBus,
    maintenance: Arc<Mutex<Option<MaintenanceTask>>>,
}

impl CoreService {
    /// Bootstrap with the default engine tunables.
    pub async fn bootstrap(config: CoreConfig) -> Result<Self> {
        Self::bootstrap_with(config, SyncEngineConfig::default()).await
    }

    /// Open the library database, resolve the device identity and build the
    /// engine graph.
    pub async fn bootstrap_with(config: CoreConfig, engine: SyncEngineConfig) -> Result<Self> {
        if let Err(e) = init_logging(config.logging.clone()) {
            // A host that already installed a subscriber keeps it
            debug!(error = %e, "Logging already initialized");
        }

        let pool = create_pool(DatabaseConfig::new(&config.database_path)).await?;
        let event_bus = EventBus::new(config.event_buffer_size);

        let device_identity = match config.device_identity.clone() {
            Some(identity) => identity,
            None => default_device_identity(&config).await?,
        };

        let bridges = SyncBridges {
            clock: config.clock.clone(),
            file_system: config.file_system.clone(),
            transport: config.remote_transport.clone(),
            device_identity,
            network_monitor: config.network_monitor.clone(),
            content_merger: config.content_merger.clone(),
        };

        let orchestrator = SyncOrchestrator::new(
            pool,
            event_bus.clone(),
            bridges,
            &config.data_dir,
            engine,
            config.features,
        )?;

        info!(
            device_id = %orchestrator.device_id(),
            "Core service initialized"
        );

        Ok(Self {
            orchestrator: Arc::new(orchestrator),
            event_bus,
            maintenance: Arc::new(Mutex::new(None)),
        })
    }

    pub fn orchestrator(&self) -> Arc<SyncOrchestrator> {
        Arc::clone(&self.orchestrator)
    }

    /// Stream of every event the engines emit.
    pub fn subscribe(&self) -> EventStream {
        EventStream::new(self.event_bus.subscribe())
    }

    /// Start periodic maintenance; returns false when disabled or already running.
    pub async fn start_background_maintenance(&self, interval: Duration) -> bool {
        let mut slot = self.maintenance.lock().await;
        if slot.is_some() {
            return false;
        }

        let token = CancellationToken::new();
        match self
            .orchestrator
            .spawn_background_maintenance(interval, token.clone())
        {
            Some(handle) => {
                *slot = Some(MaintenanceTask { token, handle });
                true
            }
            None => false,
        }
    }

    /// Stop background maintenance and wait for the task to finish.
    pub async fn shutdown(&self) {
        let task = self.maintenance.lock().await.take();
        if let Some(task) = task {
            task.token.cancel();
            if let Err(e) = task.handle.await {
                warn!(error = %e, "Maintenance task ended abnormally");
            }
        }
        info!("Core service stopped");
    }
}

#[cfg(feature = "desktop-shims")]
async fn default_device_identity(config: &CoreConfig) -> Result<Arc<dyn DeviceIdentity>> {
    let identity = bridge_desktop::DesktopDeviceIdentity::load_or_create(config.file_system.as_ref())
        .await
        .map_err(|e| CoreError::InitializationFailed(e.to_string()))?;
    Ok(Arc::new(identity))
}

#[cfg(not(feature = "desktop-shims"))]
async fn default_device_identity(_config: &CoreConfig) -> Result<Arc<dyn DeviceIdentity>> {
    Err(CoreError::CapabilityMissing {
        capability: "DeviceIdentity".to_string(),
        message: "A stable device id is required for edit locks. \
                 Desktop: enable the 'desktop-shims' feature. \
                 Mobile: inject the platform's device identifier."
            .to_string(),
    })
}
