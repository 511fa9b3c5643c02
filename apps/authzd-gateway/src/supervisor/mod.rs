//! Tenant process supervisor.
//!
//! One backend process per tenant. `ensure_running` is idempotent: a
//! healthy tenant returns its existing endpoint, anything else allocates a
//! port, spawns the backend and polls its health endpoint until it is
//! ready or the startup timeout expires. A background probe loop tears
//! down backends that stop answering so the next request restarts them.

pub mod ports;
pub mod process;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use thiserror::Error;
use tokio::process::Child;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tonic::transport::Channel;

use authzd_proto::CommandServiceClient;
use authzd_proto::pb::HealthRequest;
use authzd_transport::client::{GrpcClientConfig, connect_with_stack};

use crate::config::SupervisorConfig;
use ports::PortPool;
use process::{spawn_backend, stop_child};

/// Failures surfaced to the router (and onward to HTTP).
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SupervisorError {
    /// The configured port range is exhausted.
    #[error("no free backend ports")]
    CapacityExceeded,

    /// The backend process did not become healthy in time.
    #[error("backend startup failed: {0}")]
    StartupFailed(String),
}

impl SupervisorError {
    #[must_use]
    pub fn wire_kind(&self) -> &'static str {
        match self {
            Self::CapacityExceeded => "CapacityExceeded",
            Self::StartupFailed(_) => "StartupFailed",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TenantStatus {
    Starting,
    Healthy,
    Unhealthy,
    Stopped,
}

/// Gateway-side record of one tenant's backend.
#[derive(Debug, Clone)]
pub struct TenantRecord {
    pub endpoint: String,
    pub port: u16,
    pub pid: Option<u32>,
    pub started_at: Instant,
    pub status: TenantStatus,
    pub last_probe: Option<Instant>,
}

#[derive(Default)]
struct SlotState {
    record: Option<TenantRecord>,
    child: Option<Child>,
    probe_task: Option<tokio::task::JoinHandle<()>>,
}

/// Per-tenant slot; its async mutex serializes startup attempts for that
/// tenant without blocking the registry.
#[derive(Default)]
struct Slot {
    state: Mutex<SlotState>,
}

pub struct Supervisor {
    cfg: SupervisorConfig,
    probe_client_cfg: GrpcClientConfig,
    ports: PortPool,
    slots: Mutex<HashMap<String, Arc<Slot>>>,
    cancel: CancellationToken,
}

async fn probe_health(endpoint: &str, cfg: &GrpcClientConfig) -> bool {
    match connect_with_stack(endpoint, cfg, CommandServiceClient::<Channel>::new).await {
        Ok(mut client) => match client.health_check(HealthRequest {}).await {
            Ok(response) => response.into_inner().healthy,
            Err(_) => false,
        },
        Err(_) => false,
    }
}

impl Supervisor {
    #[must_use]
    pub fn new(cfg: SupervisorConfig, cancel: CancellationToken) -> Arc<Self> {
        let ports = PortPool::new(cfg.port_range_start, cfg.port_range_end);
        let probe_client_cfg = GrpcClientConfig::new("authzd_backend_health")
            .with_connect_timeout(std::time::Duration::from_secs(1))
            .with_rpc_timeout(std::time::Duration::from_secs(2));
        Arc::new(Self {
            cfg,
            probe_client_cfg,
            ports,
            slots: Mutex::new(HashMap::new()),
            cancel,
        })
    }

    async fn slot(&self, tenant: &str) -> Arc<Slot> {
        let mut slots = self.slots.lock().await;
        Arc::clone(slots.entry(tenant.to_owned()).or_default())
    }

    /// Get the endpoint of a healthy backend for `tenant`, starting or
    /// restarting one if needed. Idempotent: N calls for a healthy tenant
    /// return the same endpoint and spawn nothing.
    ///
    /// # Errors
    /// `CapacityExceeded` when no port is free, `StartupFailed` when the
    /// backend does not become healthy within the startup timeout.
    pub async fn ensure_running(self: &Arc<Self>, tenant: &str) -> Result<String, SupervisorError> {
        let slot = self.slot(tenant).await;
        let mut state = slot.state.lock().await;

        // Reap a child that exited behind our back so the restart is
        // immediate instead of waiting for the probe loop to notice.
        let exited = state
            .child
            .as_mut()
            .is_some_and(|child| matches!(child.try_wait(), Ok(Some(_))));
        if exited {
            tracing::warn!(tenant = %tenant, "backend exited outside supervisor control");
            self.teardown_locked(tenant, &mut state, false).await;
        }

        if let Some(record) = &state.record {
            if record.status == TenantStatus::Healthy {
                return Ok(record.endpoint.clone());
            }
        }

        self.start_locked(tenant, &slot, &mut state).await
    }

    async fn start_locked(
        self: &Arc<Self>,
        tenant: &str,
        slot: &Arc<Slot>,
        state: &mut SlotState,
    ) -> Result<String, SupervisorError> {
        let port = self.ports.allocate().ok_or(SupervisorError::CapacityExceeded)?;
        let endpoint = format!("http://127.0.0.1:{port}");

        let child = match spawn_backend(&self.cfg, tenant, port) {
            Ok(child) => child,
            Err(e) => {
                self.ports.release(port);
                return Err(SupervisorError::StartupFailed(e.to_string()));
            }
        };

        state.record = Some(TenantRecord {
            endpoint: endpoint.clone(),
            port,
            pid: child.id(),
            started_at: Instant::now(),
            status: TenantStatus::Starting,
            last_probe: None,
        });
        state.child = Some(child);

        // Poll the health endpoint until ready or the timeout expires.
        let deadline = Instant::now() + self.cfg.startup_timeout();
        let healthy = loop {
            if probe_health(&endpoint, &self.probe_client_cfg).await {
                break true;
            }
            if Instant::now() >= deadline || self.cancel.is_cancelled() {
                break false;
            }
            tokio::time::sleep(self.cfg.startup_poll_interval()).await;
        };

        if !healthy {
            tracing::error!(tenant = %tenant, port, "backend did not become healthy, reaping");
            self.teardown_locked(tenant, state, true).await;
            return Err(SupervisorError::StartupFailed(format!(
                "backend for {tenant} not healthy within {}s",
                self.cfg.startup_timeout_secs
            )));
        }

        if let Some(record) = &mut state.record {
            record.status = TenantStatus::Healthy;
            record.last_probe = Some(Instant::now());
        }
        tracing::info!(tenant = %tenant, %endpoint, "backend healthy");

        state.probe_task = Some(self.spawn_probe_loop(tenant.to_owned(), Arc::clone(slot), port));
        Ok(endpoint)
    }

    fn spawn_probe_loop(
        self: &Arc<Self>,
        tenant: String,
        slot: Arc<Slot>,
        port: u16,
    ) -> tokio::task::JoinHandle<()> {
        let supervisor = Arc::clone(self);
        tokio::spawn(async move {
            let endpoint = format!("http://127.0.0.1:{port}");
            let mut consecutive_failures: u32 = 0;
            loop {
                tokio::select! {
                    () = supervisor.cancel.cancelled() => return,
                    () = tokio::time::sleep(supervisor.cfg.probe_interval()) => {}
                }

                let ok = probe_health(&endpoint, &supervisor.probe_client_cfg).await;
                let mut state = slot.state.lock().await;

                // The slot moved on (stopped or restarted on another
                // port); this loop is stale.
                let current = state.record.as_ref().map(|r| (r.port, r.status));
                if current != Some((port, TenantStatus::Healthy)) {
                    return;
                }

                if let Some(record) = &mut state.record {
                    record.last_probe = Some(Instant::now());
                }

                if ok {
                    consecutive_failures = 0;
                    continue;
                }

                consecutive_failures += 1;
                tracing::warn!(
                    tenant = %tenant,
                    consecutive_failures,
                    "backend health probe failed"
                );
                if consecutive_failures >= supervisor.cfg.probe_failure_threshold {
                    if let Some(record) = &mut state.record {
                        record.status = TenantStatus::Unhealthy;
                    }
                    tracing::error!(tenant = %tenant, "backend unhealthy, tearing down");
                    // Detach our own task handle so teardown does not
                    // abort the running loop from inside itself.
                    state.probe_task = None;
                    supervisor.teardown_locked(&tenant, &mut state, true).await;
                    return;
                }
            }
        })
    }

    /// Stop the child (if any), release its port and mark the record
    /// stopped. Caller holds the slot lock.
    async fn teardown_locked(&self, tenant: &str, state: &mut SlotState, graceful: bool) {
        if let Some(task) = state.probe_task.take() {
            task.abort();
        }
        if let Some(mut child) = state.child.take() {
            if graceful {
                stop_child(&mut child, tenant, self.cfg.stop_grace()).await;
            } else {
                let _ = child.kill().await;
            }
        }
        if let Some(record) = &mut state.record {
            self.ports.release(record.port);
            record.status = TenantStatus::Stopped;
            record.pid = None;
        }
    }

    /// Gracefully stop one tenant's backend and release its port.
    pub async fn stop(&self, tenant: &str) {
        let slot = self.slot(tenant).await;
        let mut state = slot.state.lock().await;
        self.teardown_locked(tenant, &mut state, true).await;
    }

    /// Stop every backend. Called on gateway shutdown; all held ports are
    /// released once the children have terminated.
    pub async fn shutdown(&self) {
        let slots: Vec<(String, Arc<Slot>)> = {
            let slots = self.slots.lock().await;
            slots
                .iter()
                .map(|(tenant, slot)| (tenant.clone(), Arc::clone(slot)))
                .collect()
        };
        for (tenant, slot) in slots {
            let mut state = slot.state.lock().await;
            self.teardown_locked(&tenant, &mut state, true).await;
        }
        tracing::info!(ports_still_held = self.ports.held(), "supervisor shut down");
    }

    /// Current record for a tenant, if the supervisor has seen it.
    pub async fn record(&self, tenant: &str) -> Option<TenantRecord> {
        let slot = self.slot(tenant).await;
        let state = slot.state.lock().await;
        state.record.clone()
    }
}
