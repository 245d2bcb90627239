//! Composition root: builds the store, transports, orchestrator and
//! background tasks from an [`EngineConfig`], and tears them down in order.

use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::accounting::{self, Connectivity, OperationInfo};
use crate::cloud::{CloudClient, HttpCloudClient};
use crate::config::EngineConfig;
use crate::db::{self, DbState};
use crate::error::{EngineError, StoreError, StoreResult};
use crate::migration::{self, ImportReport};
use crate::orchestrator::Orchestrator;
use crate::relay::LanRelay;
use crate::scheduler::Scheduler;

pub struct SyncEngine {
    db: Arc<DbState>,
    orchestrator: Arc<Orchestrator>,
    scheduler: Scheduler,
    unit_name: Option<String>,
    legacy_import: Option<ImportReport>,
}

impl SyncEngine {
    /// Open the store, run the one-time legacy import, wire up the
    /// configured transports and start the background tasks.
    ///
    /// Must be called inside a Tokio runtime.
    pub async fn init(mut config: EngineConfig) -> Result<Self, EngineError> {
        config.validate()?;
        let credentials = config.resolve_credentials()?;
        let timings = config.timings;

        let db = Arc::new(db::init(&config.data_dir)?);

        let legacy_import = match &config.legacy_import_path {
            Some(path) if path.exists() => migration::import_legacy_file(&db, path)?,
            Some(path) => {
                debug!("Legacy export {} not found, skipping import", path.display());
                None
            }
            None => None,
        };

        let scheduler = Scheduler::new();
        let mut orchestrator =
            Orchestrator::new(db.clone(), scheduler.clone(), credentials.terminal_id.as_str())
                .with_cloud_timeout(timings.cloud_timeout())
                .with_ack_check_delay(timings.ack_check_delay());

        if let (Some(cloud), Some(api_key)) = (&config.cloud, credentials.cloud_api_key) {
            let client = HttpCloudClient::new(
                &cloud.base_url,
                api_key,
                &credentials.terminal_id,
                Some(timings.cloud_timeout()),
            )?;
            info!(base_url = client.base_url(), "Cloud sync enabled");
            orchestrator = orchestrator.with_cloud(Arc::new(client));
        }

        if let (Some(relay), Some(secret)) = (&config.relay, credentials.relay_secret) {
            let relay = LanRelay::new(&relay.url, secret, Some(timings.relay_cooldown()))?;
            info!(url = relay.base_url(), "LAN relay enabled");
            orchestrator = orchestrator.with_relay(Arc::new(relay));
        }

        let engine = Self {
            db,
            orchestrator: Arc::new(orchestrator),
            scheduler,
            unit_name: config.unit_name.clone(),
            legacy_import,
        };
        engine.start_background_tasks(&config);

        info!(
            terminal_id = %engine.orchestrator.terminal_id(),
            cloud = engine.orchestrator.has_cloud(),
            relay = engine.orchestrator.relay().is_some(),
            "Sync engine started"
        );
        Ok(engine)
    }

    fn start_background_tasks(&self, config: &EngineConfig) {
        let timings = config.timings;

        if self.orchestrator.has_cloud() {
            let orchestrator = self.orchestrator.clone();
            self.scheduler
                .spawn_repeating("pending_replay", timings.replay_interval(), move || {
                    let orchestrator = orchestrator.clone();
                    async move {
                        match orchestrator.replay_pending().await {
                            Ok(report) if report.remaining > 0 => {
                                debug!(remaining = report.remaining, "Pending writes still queued");
                            }
                            Ok(_) => {}
                            Err(StoreError::Closed) => {}
                            Err(e) => warn!(error = %e, "Pending replay failed"),
                        }
                    }
                });

            // Drain anything left from the previous run without waiting a full period.
            let orchestrator = self.orchestrator.clone();
            self.scheduler.spawn(async move {
                if let Err(e) = orchestrator.replay_pending().await {
                    warn!(error = %e, "Startup replay failed");
                }
            });
        }

        if let Some(relay) = self.orchestrator.relay().cloned() {
            let db = self.db.clone();
            self.scheduler
                .spawn_repeating("relay_pull", timings.relay_pull_interval(), move || {
                    let relay = relay.clone();
                    let db = db.clone();
                    async move {
                        match relay.pull_and_apply(&db).await {
                            Ok(Some(report)) if report.applied + report.rejected + report.failed > 0 => {
                                info!(
                                    applied = report.applied,
                                    rejected = report.rejected,
                                    failed = report.failed,
                                    "Applied relay events"
                                );
                            }
                            Ok(_) => {}
                            Err(StoreError::Closed) => {}
                            Err(e) => warn!(error = %e, "Relay pull failed"),
                        }
                    }
                });
        }
    }

    pub fn orchestrator(&self) -> &Arc<Orchestrator> {
        &self.orchestrator
    }

    pub fn db(&self) -> &Arc<DbState> {
        &self.db
    }

    /// Counts from the legacy import performed by this `init`, if any.
    pub fn legacy_import(&self) -> Option<&ImportReport> {
        self.legacy_import.as_ref()
    }

    pub async fn connectivity(&self) -> Connectivity {
        let cloud = self.orchestrator.cloud();
        let cloud_reachable = match cloud {
            Some(client) => client.is_reachable().await,
            None => false,
        };
        let relay = self.orchestrator.relay();
        Connectivity {
            cloud_configured: cloud.is_some(),
            cloud_reachable,
            lan_configured: relay.is_some(),
            lan_reachable: relay.is_some_and(|r| r.is_reachable()),
        }
    }

    /// Snapshot for status screens. Never fails; store problems show up as
    /// an empty queue.
    pub async fn operation_info(&self) -> OperationInfo {
        let connectivity = self.connectivity().await;
        let unit_name = self.unit_name.as_deref();
        let info = self
            .db
            .with_conn(|conn| Ok(accounting::operation_info(conn, connectivity, unit_name)));
        match info {
            Ok(info) => info,
            Err(e) => {
                warn!(error = %e, "Store unavailable for operation info");
                OperationInfo {
                    mode: connectivity.mode(),
                    queue_size: 0,
                    last_sync_at: None,
                    unit_name: self.unit_name.clone(),
                    local_ip: accounting::local_ip(),
                }
            }
        }
    }

    /// Stop every background task, then close the store. Safe to call twice.
    pub async fn close(&self) -> StoreResult<()> {
        if !self.scheduler.is_shut_down() {
            info!("Stopping sync engine");
        }
        self.scheduler.shutdown().await;
        self.db.close()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::accounting::OperationMode;
    use crate::config::RelayConfig;
    use crate::models::NewOrder;
    use std::path::PathBuf;

    fn temp_dir() -> PathBuf {
        let dir = std::env::temp_dir().join(format!("pos-sync-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn offline_config(dir: &PathBuf) -> EngineConfig {
        EngineConfig {
            terminal_id: Some("t1".into()),
            unit_name: Some("Centro".into()),
            ..EngineConfig::new(dir)
        }
    }

    #[tokio::test]
    async fn test_offline_engine_writes_locally() {
        let dir = temp_dir();
        let engine = SyncEngine::init(offline_config(&dir)).await.unwrap();

        let (order, outcome) = engine
            .orchestrator()
            .create_order(NewOrder::default())
            .await
            .unwrap();
        assert!(!outcome.is_synced());
        assert!(order.pending_sync);

        let info = engine.operation_info().await;
        assert_eq!(info.mode, OperationMode::Offline);
        assert_eq!(info.queue_size, 1);
        assert_eq!(info.unit_name.as_deref(), Some("Centro"));

        engine.close().await.unwrap();
        engine.close().await.unwrap();
        assert!(!engine.db().is_open());
        let _ = std::fs::remove_dir_all(dir);
    }

    #[tokio::test]
    async fn test_init_runs_legacy_import_once() {
        let dir = temp_dir();
        let export = dir.join("legacy.json");
        std::fs::write(&export, r#"{ "carts": [{ "items": [] }] }"#).unwrap();

        let mut config = offline_config(&dir);
        config.legacy_import_path = Some(export.clone());
        let engine = SyncEngine::init(config.clone()).await.unwrap();
        assert_eq!(engine.legacy_import().map(|r| r.carts), Some(1));
        engine.close().await.unwrap();

        let engine = SyncEngine::init(config).await.unwrap();
        assert!(engine.legacy_import().is_none());
        engine.close().await.unwrap();
        let _ = std::fs::remove_dir_all(dir);
    }

    #[tokio::test]
    async fn test_relay_counts_as_lan_until_it_trips() {
        let dir = temp_dir();
        let mut config = offline_config(&dir);
        config.relay = Some(RelayConfig {
            url: "http://127.0.0.1:9".into(),
            secret: Some("shh".into()),
        });
        let engine = SyncEngine::init(config).await.unwrap();
        assert_eq!(engine.operation_info().await.mode, OperationMode::Online);

        // Nothing listens on the discard port, so the pull trips the cool-down.
        let relay = engine.orchestrator().relay().cloned().unwrap();
        assert!(relay.pull(None).await.is_err());
        assert_eq!(engine.operation_info().await.mode, OperationMode::Offline);
        engine.close().await.unwrap();
        let _ = std::fs::remove_dir_all(dir);
    }

    #[tokio::test]
    async fn test_missing_terminal_id_fails_init() {
        let dir = temp_dir();
        let mut config = EngineConfig::new(&dir);
        config.terminal_id = None;
        // Falls back to the OS keyring, which holds nothing for this id in CI.
        if crate::storage::get_credential(crate::storage::KEY_TERMINAL_ID).is_none() {
            assert!(matches!(
                SyncEngine::init(config).await,
                Err(EngineError::Config(_))
            ));
        }
        let _ = std::fs::remove_dir_all(dir);
    }
}
