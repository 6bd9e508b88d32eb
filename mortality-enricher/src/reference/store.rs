use std::sync::{Arc, RwLock};
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::metrics_consts::REFERENCE_REFRESHES;
use crate::reference::loader::{LoadError, ReferenceConfig, ReferenceLoader};
use crate::reference::table::ReferenceData;

/// Holds the reference snapshot currently used for joining.
///
/// Readers take an `Arc` to the whole snapshot, so a micro-batch always joins
/// against one consistent pair of tables even if a refresh lands mid-batch.
#[derive(Debug, Default)]
pub struct ReferenceStore {
    current: RwLock<Arc<ReferenceData>>,
}

impl ReferenceStore {
    pub fn new(data: ReferenceData) -> Self {
        Self {
            current: RwLock::new(Arc::new(data)),
        }
    }

    pub fn snapshot(&self) -> Arc<ReferenceData> {
        let guard = self
            .current
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        Arc::clone(&guard)
    }

    pub fn replace(&self, data: ReferenceData) {
        let mut guard = self
            .current
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *guard = Arc::new(data);
    }
}

/// Load both reference tables. Fails if either one fails.
pub async fn load_reference_data(
    loader: &ReferenceLoader,
    config: &ReferenceConfig,
) -> Result<ReferenceData, LoadError> {
    let hospital = loader.load(&config.hospital).await?;
    let health_category = loader.load(&config.health_category).await?;
    Ok(ReferenceData::new(hospital, health_category))
}

/// Periodically reloads the reference tables into a [`ReferenceStore`].
pub struct ReferenceRefresher {
    loader: ReferenceLoader,
    config: ReferenceConfig,
    store: Arc<ReferenceStore>,
}

impl ReferenceRefresher {
    pub fn new(loader: ReferenceLoader, config: ReferenceConfig, store: Arc<ReferenceStore>) -> Self {
        Self {
            loader,
            config,
            store,
        }
    }

    /// Reload both tables and swap them in. On failure the previous snapshot
    /// stays in place.
    pub async fn refresh_once(&self) -> Result<(), LoadError> {
        match load_reference_data(&self.loader, &self.config).await {
            Ok(data) => {
                self.store.replace(data);
                metrics::counter!(REFERENCE_REFRESHES, "status" => "success").increment(1);
                info!("Reference data refreshed");
                Ok(())
            }
            Err(e) => {
                metrics::counter!(REFERENCE_REFRESHES, "status" => "failure").increment(1);
                warn!(error = ?e, "Reference refresh failed, keeping previous snapshot");
                Err(e)
            }
        }
    }

    /// Refresh on the configured interval until `shutdown` fires. Returns
    /// immediately when refreshing is disabled.
    pub async fn run(self, shutdown: CancellationToken) {
        let Some(period) = self.config.refresh_interval.filter(|p| !p.is_zero()) else {
            info!("Reference refresh disabled");
            return;
        };

        info!(interval_secs = period.as_secs(), "Starting reference refresher");
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Reference refresher shutting down");
                    return;
                }
                _ = ticker.tick() => {
                    if let Err(e) = self.refresh_once().await {
                        debug!(error_type = e.error_type(), "Retrying reference refresh on next tick");
                    }
                }
            }
        }
    }

    pub fn interval(&self) -> Option<Duration> {
        self.config.refresh_interval
    }
}
