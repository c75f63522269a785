mod conflict;
mod error;
mod mutations;
mod queries;
pub mod slot;
#[cfg(test)]
mod tests;

pub use conflict::find_conflicts;
pub use error::{EngineError, EntityKind};
pub use mutations::{AppointmentPatch, ClientDraft, DeletePolicy, NewAppointment, ServiceDraft, TenantDraft};
pub use queries::AppointmentFilter;

use std::future::Future;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot, Mutex, OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock};
use tracing::{info, warn};
use ulid::Ulid;

use crate::model::*;
use crate::notify::NotifyHub;
use crate::wal::Wal;

pub type SharedTenantState = Arc<RwLock<TenantState>>;

const BASE_BACKOFF: Duration = Duration::from_millis(10);

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

/// Background task that owns the WAL and batches appends for group commit.
/// 1. Block until the first Append arrives.
/// 2. Buffer it (no fsync).
/// 3. Drain all immediately available Appends (the batch window).
/// 4. Single flush_sync for the whole batch.
/// 5. Respond to all senders.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            WalCommand::Append { event, response } => {
                let mut batch = vec![(event, response)];
                let mut deferred = None;

                loop {
                    match rx.try_recv() {
                        Ok(WalCommand::Append { event, response }) => {
                            batch.push((event, response));
                        }
                        Ok(other) => {
                            // Commit what we have before compacting or reporting.
                            deferred = Some(other);
                            break;
                        }
                        Err(_) => break,
                    }
                }

                commit_batch(&mut wal, &mut batch);
                if let Some(other) = deferred {
                    handle_non_append(&mut wal, other);
                }
            }
            other => handle_non_append(&mut wal, other),
        }
    }
    info!("WAL writer stopped");
}

fn commit_batch(wal: &mut Wal, batch: &mut Vec<(Event, oneshot::Sender<io::Result<()>>)>) {
    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let flush_start = std::time::Instant::now();
    let result = flush_batch(wal, batch);
    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
        .record(flush_start.elapsed().as_secs_f64());
    if let Err(e) = &result {
        tracing::error!("WAL flush failed for {} event(s): {e}", batch.len());
    }
    respond_batch(batch, &result);
}

fn flush_batch(wal: &mut Wal, batch: &[(Event, oneshot::Sender<io::Result<()>>)]) -> io::Result<()> {
    let mut append_err: Option<io::Error> = None;
    for (event, _) in batch.iter() {
        if let Err(e) = wal.append_buffered(event) {
            append_err = Some(e);
            break;
        }
    }
    // Flush even after an append error so partially buffered bytes don't
    // leak into the next batch; every caller in this batch sees the failure.
    let flush_err = wal.flush_sync().err();
    match (append_err, flush_err) {
        (Some(e), _) | (None, Some(e)) => Err(e),
        (None, None) => Ok(()),
    }
}

fn respond_batch(batch: &mut Vec<(Event, oneshot::Sender<io::Result<()>>)>, result: &io::Result<()>) {
    for (_, tx) in batch.drain(..) {
        let r = match result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result = Wal::write_compact_file(wal.path(), &events)
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { .. } => unreachable!("appends are batched by the caller"),
    }
}

// ── Engine ───────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct SchedulingPolicy {
    /// Last-resort duration when neither the service nor its tenant has one.
    pub default_duration_minutes: Option<u32>,
    /// Bound on each wait for a tenant lock or a WAL queue slot.
    pub store_timeout: Duration,
    pub store_retries: u32,
}

impl Default for SchedulingPolicy {
    fn default() -> Self {
        Self {
            default_duration_minutes: None,
            store_timeout: Duration::from_secs(5),
            store_retries: 2,
        }
    }
}

pub struct Engine {
    pub(super) tenants: DashMap<TenantId, SharedTenantState>,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    pub notify: Arc<NotifyHub>,
    /// Reverse lookup: client/service/appointment id → owning tenant.
    pub(super) owners: DashMap<Ulid, TenantId>,
    /// Held while tenants are registered or removed, and while a compaction
    /// snapshot is taken.
    pub(super) registry: Mutex<()>,
    pub(super) policy: SchedulingPolicy,
}

/// Apply an event to one tenant's state (caller holds the lock).
fn apply_to_tenant(ts: &mut TenantState, event: &Event, owners: &DashMap<Ulid, TenantId>) {
    match event {
        Event::TenantSaved { tenant } => {
            ts.tenant = tenant.clone();
        }
        Event::ClientSaved { client } => {
            owners.insert(client.id, client.tenant_id);
            ts.clients.insert(client.id, client.clone());
        }
        Event::ClientRemoved { id, .. } => {
            ts.clients.remove(id);
            owners.remove(id);
        }
        Event::ServiceSaved { service } => {
            owners.insert(service.id, service.tenant_id);
            ts.services.insert(service.id, service.clone());
        }
        Event::ServiceRemoved { id, .. } => {
            ts.services.remove(id);
            owners.remove(id);
        }
        Event::AppointmentSaved { appointment } => {
            owners.insert(appointment.id, appointment.tenant_id);
            ts.upsert_appointment(appointment.clone());
        }
        Event::Batch { events, .. } => {
            for inner in events {
                apply_to_tenant(ts, inner, owners);
            }
        }
        // Handled at the DashMap level.
        Event::TenantRemoved { .. } => {}
    }
}

impl Engine {
    pub fn new(wal_path: PathBuf, notify: Arc<NotifyHub>, policy: SchedulingPolicy) -> io::Result<Self> {
        let (wal, replay) = Wal::recover(&wal_path)?;
        let events = replay.events;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let engine = Self {
            tenants: DashMap::new(),
            wal_tx,
            notify,
            owners: DashMap::new(),
            registry: Mutex::new(()),
            policy,
        };

        // We're the sole owner of these Arcs, so try_write always succeeds.
        // Never use blocking_write here: this runs inside the runtime.
        for event in &events {
            match event {
                Event::TenantSaved { tenant } => {
                    if let Some(entry) = engine.tenants.get(&tenant.id) {
                        let mut guard = entry.try_write().expect("replay: uncontended write");
                        apply_to_tenant(&mut guard, event, &engine.owners);
                    } else {
                        let ts = TenantState::new(tenant.clone());
                        engine.tenants.insert(tenant.id, Arc::new(RwLock::new(ts)));
                    }
                }
                Event::TenantRemoved { id } => {
                    engine.tenants.remove(id);
                }
                other => {
                    if let Some(tenant_id) = other.tenant_id()
                        && let Some(entry) = engine.tenants.get(&tenant_id)
                    {
                        let ts = entry.clone();
                        let mut guard = ts.try_write().expect("replay: uncontended write");
                        apply_to_tenant(&mut guard, other, &engine.owners);
                    }
                }
            }
        }

        metrics::gauge!(crate::observability::TENANTS_ACTIVE).set(engine.tenants.len() as f64);
        info!(
            "replayed {} WAL event(s) from {}: {} tenant(s)",
            events.len(),
            wal_path.display(),
            engine.tenants.len()
        );
        Ok(engine)
    }

    pub fn policy(&self) -> &SchedulingPolicy {
        &self.policy
    }

    pub fn tenant_state(&self, id: &TenantId) -> Option<SharedTenantState> {
        self.tenants.get(id).map(|e| e.value().clone())
    }

    /// Run `attempt` under `store_timeout`, retrying with exponential backoff.
    /// Only used for waits that are safe to abandon (nothing written yet).
    pub(super) async fn bounded<T, F, Fut>(&self, what: &str, mut attempt: F) -> Result<T, EngineError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = T>,
    {
        let mut backoff = BASE_BACKOFF;
        for n in 0..=self.policy.store_retries {
            if let Ok(value) = tokio::time::timeout(self.policy.store_timeout, attempt()).await {
                return Ok(value);
            }
            metrics::counter!(crate::observability::STORE_TIMEOUTS_TOTAL).increment(1);
            warn!(attempt = n + 1, "{what}: timed out after {:?}", self.policy.store_timeout);
            if n < self.policy.store_retries {
                tokio::time::sleep(backoff).await;
                backoff = backoff.saturating_mul(2);
            }
        }
        Err(EngineError::StoreUnavailable(format!(
            "{what}: timed out after {} attempt(s)",
            self.policy.store_retries + 1
        )))
    }

    pub(super) async fn write_tenant(
        &self,
        tenant_id: TenantId,
    ) -> Result<OwnedRwLockWriteGuard<TenantState>, EngineError> {
        let ts = self
            .tenant_state(&tenant_id)
            .ok_or(EngineError::NotFound(tenant_id))?;
        self.bounded("tenant lock", || ts.clone().write_owned()).await
    }

    pub(super) async fn read_tenant(
        &self,
        tenant_id: TenantId,
    ) -> Result<OwnedRwLockReadGuard<TenantState>, EngineError> {
        let ts = self
            .tenant_state(&tenant_id)
            .ok_or(EngineError::NotFound(tenant_id))?;
        self.bounded("tenant lock", || ts.clone().read_owned()).await
    }

    /// Write event to WAL via the background group-commit writer. Only the
    /// wait for a queue slot is bounded; once enqueued we wait for the fsync.
    async fn wal_append(&self, event: &Event) -> Result<(), EngineError> {
        let permit = self
            .bounded("WAL queue", || self.wal_tx.reserve())
            .await?
            .map_err(|_| EngineError::StoreUnavailable("WAL writer shut down".into()))?;
        let (tx, rx) = oneshot::channel();
        permit.send(WalCommand::Append {
            event: event.clone(),
            response: tx,
        });
        rx.await
            .map_err(|_| EngineError::StoreUnavailable("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::StoreUnavailable(format!("WAL write failed: {e}")))
    }

    /// WAL-append then apply. Memory changes only once the event is durable.
    pub(super) async fn persist_and_apply(
        &self,
        ts: &mut TenantState,
        event: &Event,
    ) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        apply_to_tenant(ts, event, &self.owners);
        Ok(())
    }

    pub(super) fn publish(&self, appointment: &Appointment, change: ChangeKind) {
        self.notify
            .send(appointment.tenant_id, &ChangeNotice::new(appointment, change));
    }
}
