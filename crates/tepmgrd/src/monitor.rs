//! Monitoring-table installer.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::info;

use crate::error::TepMgrResult;
use crate::store::{Datastore, Transaction};
use crate::tables::tunnel_monitor_path;
use crate::types::{MonitorSettings, NodeId, TunnelMonitorEntry};

/// Installs or removes per-node tunnel monitoring.
///
/// Invoked once per node entering (`enabled = true`) or leaving the meshed
/// set, after the pass commit succeeded.
#[async_trait]
pub trait MonitorTableInstaller: Send + Sync {
    async fn set_monitoring_table(&self, node_id: NodeId, enabled: bool) -> TepMgrResult<()>;
}

/// Writes `TUNNEL_MONITOR|<node>` records for the forwarding layer.
pub struct StoreMonitorInstaller {
    store: Arc<dyn Datastore>,
    settings: MonitorSettings,
}

impl StoreMonitorInstaller {
    pub fn new(store: Arc<dyn Datastore>, settings: MonitorSettings) -> Self {
        Self { store, settings }
    }
}

#[async_trait]
impl MonitorTableInstaller for StoreMonitorInstaller {
    async fn set_monitoring_table(&self, node_id: NodeId, enabled: bool) -> TepMgrResult<()> {
        let mut txn = Transaction::new(self.store.clone());
        let path = tunnel_monitor_path(node_id);
        if enabled {
            txn.merge(
                path,
                &TunnelMonitorEntry {
                    node_id,
                    enabled: self.settings.enabled,
                    protocol: self.settings.protocol,
                    interval_ms: self.settings.interval_ms,
                },
            )?;
        } else {
            txn.delete(path);
        }
        txn.submit().await?;

        info!(node_id, enabled, "monitoring table updated");
        Ok(())
    }
}
