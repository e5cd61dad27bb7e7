//! Engine boundary
//!
//! `SyncEngine` is the request/response surface the shell drives: OBS
//! connection management, role lifecycle (master server / slave link), sync
//! target selection, resync triggers, and introspection. Events flow the
//! other way on the channel handed out by `subscribe_events`. The handle is
//! cloned into every task; there are no global singletons.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::error::{Result, SyncError};
use crate::master::{
    snapshot::build_snapshot, ClientInfo, EventTranslator, MasterServer, SlaveStatus, SyncTargets,
};
use crate::metrics::{MetricsRecorder, PerfMetrics};
use crate::obs::{ObsConnectionConfig, ObsConnectionStatus, ObsGateway};
use crate::protocol::{SyncMessage, SyncMessageType, SyncTargetType};
use crate::settings::{self, AppSettings};
use crate::slave::{Applier, DesyncAlert, DriftDetector, ExpectedState, MasterLink, ReconnectionStatus};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum AppMode {
    Master,
    Slave,
}

/// Push events for the shell
#[derive(Debug, Clone)]
pub enum EngineEvent {
    SlaveConnectionStatus(bool),
    DesyncAlert(DesyncAlert),
}

/// A source known to the local OBS, deduplicated across scenes
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObsSource {
    pub source_name: String,
    pub source_kind: String,
}

struct MasterRole {
    server: Arc<MasterServer>,
    translator: JoinHandle<()>,
    snapshot_pump: JoinHandle<()>,
}

struct SlaveRole {
    link: MasterLink,
    applier: JoinHandle<()>,
    drift: JoinHandle<()>,
    drift_shutdown: watch::Sender<bool>,
    forwarder: JoinHandle<()>,
}

#[derive(Clone)]
pub struct SyncEngine {
    inner: Arc<EngineInner>,
}

struct EngineInner {
    obs: Arc<ObsGateway>,
    targets: SyncTargets,
    metrics: Arc<MetricsRecorder>,
    mode: parking_lot::RwLock<Option<AppMode>>,
    master: tokio::sync::Mutex<Option<MasterRole>>,
    slave: tokio::sync::Mutex<Option<SlaveRole>>,
    events_tx: mpsc::UnboundedSender<EngineEvent>,
    events_rx: parking_lot::Mutex<Option<mpsc::UnboundedReceiver<EngineEvent>>>,
}

impl SyncEngine {
    pub fn new() -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            inner: Arc::new(EngineInner {
                obs: Arc::new(ObsGateway::new()),
                targets: SyncTargets::new(),
                metrics: Arc::new(MetricsRecorder::default()),
                mode: parking_lot::RwLock::new(None),
                master: tokio::sync::Mutex::new(None),
                slave: tokio::sync::Mutex::new(None),
                events_tx,
                events_rx: parking_lot::Mutex::new(Some(events_rx)),
            }),
        }
    }

    /// The shell's event stream; available once
    pub fn subscribe_events(&self) -> Option<mpsc::UnboundedReceiver<EngineEvent>> {
        self.inner.events_rx.lock().take()
    }

    // === OBS connection ===

    pub async fn connect_obs(&self, config: ObsConnectionConfig) -> Result<()> {
        self.inner.obs.connect(config).await
    }

    pub async fn disconnect_obs(&self) -> Result<()> {
        self.inner.obs.disconnect().await;
        Ok(())
    }

    pub async fn get_obs_status(&self) -> ObsConnectionStatus {
        self.inner.obs.status().await
    }

    pub async fn get_obs_sources(&self) -> Result<Vec<ObsSource>> {
        let client = self.inner.obs.client().await?;
        let mut sources: HashMap<String, ObsSource> = HashMap::new();
        for scene in client.list_scenes().await? {
            let items = match client.list_scene_items(&scene).await {
                Ok(items) => items,
                Err(e) => {
                    warn!("Skipping scene {scene} while listing sources: {e}");
                    continue;
                }
            };
            for item in items {
                sources
                    .entry(item.source_name.clone())
                    .or_insert_with(|| ObsSource {
                        source_name: item.source_name.clone(),
                        source_kind: item.input_kind.clone().unwrap_or_else(|| "unknown".into()),
                    });
            }
        }
        Ok(sources.into_values().collect())
    }

    // === Mode and targets ===

    pub fn set_app_mode(&self, mode: AppMode) {
        *self.inner.mode.write() = Some(mode);
    }

    pub fn get_app_mode(&self) -> Option<AppMode> {
        *self.inner.mode.read()
    }

    pub fn set_sync_targets(&self, targets: Vec<SyncTargetType>) {
        info!("Sync targets set to {targets:?}");
        self.inner.targets.replace(targets);
    }

    pub fn get_sync_targets(&self) -> Vec<SyncTargetType> {
        self.inner.targets.get()
    }

    // === Master role ===

    pub async fn start_master_server(&self, port: u16) -> Result<u16> {
        if !self.inner.obs.is_connected().await {
            return Err(SyncError::NotConnected);
        }
        let mut master = self.inner.master.lock().await;
        if master.is_some() {
            return Err(SyncError::Unsupported(
                "master server is already running".to_string(),
            ));
        }

        let server = Arc::new(MasterServer::new(Arc::clone(&self.inner.metrics)));
        let mut snapshot_requests = server
            .take_snapshot_requests()
            .expect("fresh server owns its snapshot queue");
        let bound_port = server.start(port).await?;

        let events = self.inner.obs.client().await?.subscribe_events();
        let translator = EventTranslator::new(
            Arc::clone(&self.inner.obs),
            Arc::clone(&server),
            self.inner.targets.clone(),
        )
        .spawn(events);

        // Serve snapshots to joining and re-requesting slaves
        let obs = Arc::clone(&self.inner.obs);
        let server_for_pump = Arc::clone(&server);
        let snapshot_pump = tokio::spawn(async move {
            while let Some(client_id) = snapshot_requests.recv().await {
                match build_snapshot(&obs).await {
                    Ok(payload) => {
                        let message = match SyncMessage::with_payload(
                            SyncMessageType::StateSync,
                            SyncTargetType::Program,
                            &payload,
                        ) {
                            Ok(message) => message,
                            Err(e) => {
                                warn!("Failed to encode snapshot: {e}");
                                continue;
                            }
                        };
                        if let Err(e) = server_for_pump.send_to(&client_id, message) {
                            warn!("Snapshot for {client_id} not delivered: {e}");
                        } else {
                            info!("Snapshot sent to {client_id}");
                        }
                    }
                    Err(e) => warn!("Failed to build snapshot for {client_id}: {e}"),
                }
            }
        });

        *master = Some(MasterRole {
            server,
            translator,
            snapshot_pump,
        });
        info!("Master role started on port {bound_port}");
        Ok(bound_port)
    }

    pub async fn stop_master_server(&self) -> Result<()> {
        let role = self
            .inner
            .master
            .lock()
            .await
            .take()
            .ok_or(SyncError::NotRunning)?;
        role.server.stop().await?;
        role.translator.abort();
        role.snapshot_pump.abort();
        info!("Master role stopped");
        Ok(())
    }

    pub async fn get_connected_clients_count(&self) -> u32 {
        match self.inner.master.lock().await.as_ref() {
            Some(role) => role.server.connected_count() as u32,
            None => 0,
        }
    }

    pub async fn get_connected_clients_info(&self) -> Vec<ClientInfo> {
        match self.inner.master.lock().await.as_ref() {
            Some(role) => role.server.clients_info(),
            None => Vec::new(),
        }
    }

    pub async fn get_slave_statuses(&self) -> Vec<SlaveStatus> {
        match self.inner.master.lock().await.as_ref() {
            Some(role) => role.server.slave_statuses(),
            None => Vec::new(),
        }
    }

    /// Push a fresh snapshot to every connected slave
    pub async fn resync_all_slaves(&self) -> Result<()> {
        let master = self.inner.master.lock().await;
        let role = master.as_ref().ok_or(SyncError::NotRunning)?;
        let payload = build_snapshot(&self.inner.obs).await?;
        let message = SyncMessage::with_payload(
            SyncMessageType::StateSync,
            SyncTargetType::Program,
            &payload,
        )?;
        role.server.broadcast(message);
        info!("Resync broadcast to all slaves");
        Ok(())
    }

    /// Push a fresh snapshot to one slave
    pub async fn resync_specific_slave(&self, client_id: &str) -> Result<()> {
        let master = self.inner.master.lock().await;
        let role = master.as_ref().ok_or(SyncError::NotRunning)?;
        let payload = build_snapshot(&self.inner.obs).await?;
        let message = SyncMessage::with_payload(
            SyncMessageType::StateSync,
            SyncTargetType::Program,
            &payload,
        )?;
        role.server.send_to(client_id, message)?;
        info!("Resync sent to {client_id}");
        Ok(())
    }

    // === Slave role ===

    pub async fn connect_to_master(&self, host: &str, port: u16) -> Result<()> {
        if !self.inner.obs.is_connected().await {
            return Err(SyncError::NotConnected);
        }
        let mut slave = self.inner.slave.lock().await;
        if slave.is_some() {
            return Err(SyncError::Unsupported(
                "already connected to a master".to_string(),
            ));
        }

        let expected = Arc::new(ExpectedState::new());
        let (status_tx, mut status_rx) = mpsc::unbounded_channel();
        let (link, inbound, outbound) = MasterLink::connect(
            host.to_string(),
            port,
            status_tx,
            Arc::clone(&self.inner.metrics),
        );

        let (alert_tx, mut alert_rx) = mpsc::unbounded_channel();
        let applier = Applier::new(
            Arc::clone(&self.inner.obs),
            Arc::clone(&expected),
            alert_tx.clone(),
        )
        .spawn(inbound);

        let (drift_shutdown, drift_shutdown_rx) = watch::channel(false);
        let drift = DriftDetector::new(
            Arc::clone(&self.inner.obs),
            Arc::clone(&expected),
            alert_tx,
            outbound,
            Arc::clone(&self.inner.metrics),
        )
        .spawn(drift_shutdown_rx);

        // Bridge link status and alerts onto the shell event channel
        let events_tx = self.inner.events_tx.clone();
        let forwarder = tokio::spawn(async move {
            loop {
                tokio::select! {
                    status = status_rx.recv() => match status {
                        Some(connected) => {
                            let _ = events_tx.send(EngineEvent::SlaveConnectionStatus(connected));
                        }
                        None => break,
                    },
                    alert = alert_rx.recv() => match alert {
                        Some(alert) => {
                            let _ = events_tx.send(EngineEvent::DesyncAlert(alert));
                        }
                        None => break,
                    },
                }
            }
        });

        *slave = Some(SlaveRole {
            link,
            applier,
            drift,
            drift_shutdown,
            forwarder,
        });
        info!("Slave role started against {host}:{port}");
        Ok(())
    }

    pub async fn disconnect_from_master(&self) -> Result<()> {
        let role = self
            .inner
            .slave
            .lock()
            .await
            .take()
            .ok_or(SyncError::NotRunning)?;
        let (host, port) = role.link.remote();
        role.link.disconnect();
        let _ = role.drift_shutdown.send(true);
        // The applier and forwarder drain naturally once the link closes
        let _ = tokio::time::timeout(std::time::Duration::from_secs(2), role.applier).await;
        role.drift.abort();
        role.forwarder.abort();
        info!("Disconnected from master {host}:{port}");
        Ok(())
    }

    pub async fn request_resync_from_master(&self) -> Result<()> {
        let slave = self.inner.slave.lock().await;
        let role = slave.as_ref().ok_or(SyncError::NotRunning)?;
        role.link.request_resync()
    }

    pub async fn get_slave_reconnection_status(&self) -> Option<ReconnectionStatus> {
        self.inner
            .slave
            .lock()
            .await
            .as_ref()
            .map(|role| role.link.reconnection_status())
    }

    // === Introspection and settings ===

    pub fn get_performance_metrics(&self) -> PerfMetrics {
        self.inner.metrics.snapshot()
    }

    pub async fn load_settings(&self) -> Result<AppSettings> {
        settings::load().await
    }

    pub async fn save_settings(&self, settings: &AppSettings) -> Result<()> {
        settings::save(settings).await
    }

    pub fn get_app_version(&self) -> &'static str {
        env!("CARGO_PKG_VERSION")
    }

    pub fn get_git_commit(&self) -> &'static str {
        option_env!("GIT_COMMIT").unwrap_or("unknown")
    }

    /// Best-effort LAN address, for display next to the master port
    pub fn local_ip_address(&self) -> Option<String> {
        let socket = std::net::UdpSocket::bind("0.0.0.0:0").ok()?;
        socket.connect("8.8.8.8:80").ok()?;
        Some(socket.local_addr().ok()?.ip().to_string())
    }
}

impl Default for SyncEngine {
    fn default() -> Self {
        Self::new()
    }
}
