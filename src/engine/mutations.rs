use std::sync::Arc;

use chrono_tz::Tz;
use rust_decimal::Decimal;
use tokio::sync::{oneshot, RwLock};
use tracing::{info, warn};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::conflict::{check_no_conflict, validate_span};
use super::slot::{compute_interval, resolve_duration, shift};
use super::{Engine, EngineError, EntityKind, WalCommand};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TenantDraft {
    pub name: String,
    pub contact: Contact,
    pub timezone: Tz,
    pub default_duration_minutes: Option<u32>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClientDraft {
    pub name: String,
    pub contact: Contact,
    pub address: Address,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServiceDraft {
    pub name: String,
    pub price: Decimal,
    pub duration_minutes: Option<u32>,
    pub description: Option<String>,
}

impl From<&Tenant> for TenantDraft {
    fn from(t: &Tenant) -> Self {
        Self {
            name: t.name.clone(),
            contact: t.contact.clone(),
            timezone: t.timezone,
            default_duration_minutes: t.default_duration_minutes,
        }
    }
}

impl From<&Client> for ClientDraft {
    fn from(c: &Client) -> Self {
        Self {
            name: c.name.clone(),
            contact: c.contact.clone(),
            address: c.address.clone(),
        }
    }
}

impl From<&Service> for ServiceDraft {
    fn from(s: &Service) -> Self {
        Self {
            name: s.name.clone(),
            price: s.price,
            duration_minutes: s.duration_minutes,
            description: s.description.clone(),
        }
    }
}

/// Caller-supplied id doubles as an idempotency key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewAppointment {
    pub id: AppointmentId,
    pub client_id: ClientId,
    pub service_id: ServiceId,
    pub start: Instant,
    pub notes: Option<String>,
}

/// Fields left `None` are unchanged. `notes: Some(None)` clears the notes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AppointmentPatch {
    pub start: Option<Instant>,
    pub service_id: Option<ServiceId>,
    pub client_id: Option<ClientId>,
    pub notes: Option<Option<String>>,
    pub status: Option<AppointmentStatus>,
}

/// What happens to live appointments when their client or service is deleted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum DeletePolicy {
    #[default]
    Block,
    Cascade,
}

// ── Input cleaning ───────────────────────────────────────

fn required_name(what: &str, name: &str) -> Result<String, EngineError> {
    let name = name.trim();
    if name.is_empty() {
        return Err(EngineError::Invalid(format!("{what} name must not be blank")));
    }
    if name.len() > MAX_NAME_LEN {
        return Err(EngineError::LimitExceeded("name too long"));
    }
    Ok(name.to_string())
}

/// Trim; blank becomes `None`.
fn optional_text(
    value: Option<String>,
    max: usize,
    what: &'static str,
) -> Result<Option<String>, EngineError> {
    match value.map(|v| v.trim().to_string()) {
        Some(v) if v.is_empty() => Ok(None),
        Some(v) if v.len() > max => Err(EngineError::LimitExceeded(what)),
        other => Ok(other),
    }
}

fn clean_contact(contact: Contact) -> Result<Contact, EngineError> {
    Ok(Contact {
        phone: optional_text(contact.phone, MAX_FIELD_LEN, "phone too long")?,
        email: optional_text(contact.email, MAX_FIELD_LEN, "email too long")?,
    })
}

fn clean_address(address: Address) -> Result<Address, EngineError> {
    let field = |v| optional_text(v, MAX_FIELD_LEN, "address field too long");
    Ok(Address {
        street: field(address.street)?,
        number: field(address.number)?,
        district: field(address.district)?,
        city: field(address.city)?,
        state: field(address.state)?,
        postal_code: field(address.postal_code)?,
    })
}

fn clean_price(price: Decimal) -> Result<Decimal, EngineError> {
    if price < Decimal::ZERO {
        return Err(EngineError::Invalid(format!("price must not be negative: {price}")));
    }
    Ok(price.round_dp(2))
}

fn clean_duration(minutes: Option<u32>) -> Result<Option<u32>, EngineError> {
    match minutes {
        Some(m) if m == 0 || m > MAX_SERVICE_DURATION_MINUTES => Err(EngineError::InvalidDuration(m)),
        other => Ok(other),
    }
}

fn build_tenant(id: TenantId, draft: TenantDraft) -> Result<Tenant, EngineError> {
    Ok(Tenant {
        id,
        name: required_name("tenant", &draft.name)?,
        contact: clean_contact(draft.contact)?,
        timezone: draft.timezone,
        default_duration_minutes: clean_duration(draft.default_duration_minutes)?,
    })
}

fn build_client(tenant_id: TenantId, id: ClientId, draft: ClientDraft) -> Result<Client, EngineError> {
    Ok(Client {
        id,
        tenant_id,
        name: required_name("client", &draft.name)?,
        contact: clean_contact(draft.contact)?,
        address: clean_address(draft.address)?,
    })
}

fn build_service(tenant_id: TenantId, id: ServiceId, draft: ServiceDraft) -> Result<Service, EngineError> {
    Ok(Service {
        id,
        tenant_id,
        name: required_name("service", &draft.name)?,
        price: clean_price(draft.price)?,
        duration_minutes: clean_duration(draft.duration_minutes)?,
        description: optional_text(draft.description, MAX_TEXT_LEN, "description too long")?,
    })
}

impl Engine {
    // ── Tenants ──────────────────────────────────────────

    pub async fn register_tenant(&self, id: TenantId, draft: TenantDraft) -> Result<Tenant, EngineError> {
        let tenant = build_tenant(id, draft)?;
        let _registry = self.bounded("tenant registry", || self.registry.lock()).await?;

        if self.tenants.contains_key(&id) {
            let guard = self.read_tenant(id).await?;
            return if guard.tenant == tenant {
                Ok(tenant)
            } else {
                Err(EngineError::AlreadyExists(id))
            };
        }
        if self.owners.contains_key(&id) {
            return Err(EngineError::AlreadyExists(id));
        }
        if self.tenants.len() >= MAX_TENANTS {
            return Err(EngineError::LimitExceeded("too many tenants"));
        }

        let event = Event::TenantSaved { tenant: tenant.clone() };
        self.wal_append(&event).await?;
        self.tenants
            .insert(id, Arc::new(RwLock::new(TenantState::new(tenant.clone()))));
        metrics::gauge!(crate::observability::TENANTS_ACTIVE).set(self.tenants.len() as f64);
        info!("registered tenant {id} ({}, {})", tenant.name, tenant.timezone);
        Ok(tenant)
    }

    pub async fn update_tenant(&self, id: TenantId, draft: TenantDraft) -> Result<Tenant, EngineError> {
        self.modify_tenant(id, |current| *current = draft).await
    }

    /// Apply `edit` to the current profile while holding the tenant lock, so
    /// concurrent partial updates of different fields both land.
    pub async fn modify_tenant(
        &self,
        id: TenantId,
        edit: impl FnOnce(&mut TenantDraft),
    ) -> Result<Tenant, EngineError> {
        let mut guard = self.write_tenant(id).await?;
        let mut draft = TenantDraft::from(&guard.tenant);
        edit(&mut draft);
        let tenant = build_tenant(id, draft)?;
        if guard.tenant == tenant {
            return Ok(tenant);
        }
        let event = Event::TenantSaved { tenant: tenant.clone() };
        self.persist_and_apply(&mut guard, &event).await?;
        Ok(tenant)
    }

    /// Only an empty tenant can be removed; appointments are never hard-deleted,
    /// so a tenant with any booking history stays.
    pub async fn remove_tenant(&self, id: TenantId) -> Result<(), EngineError> {
        let _registry = self.bounded("tenant registry", || self.registry.lock()).await?;
        let guard = self.write_tenant(id).await?;
        if !guard.is_empty() {
            return Err(EngineError::TenantNotEmpty(id));
        }
        self.wal_append(&Event::TenantRemoved { id }).await?;
        self.tenants.remove(&id);
        self.notify.remove(&id);
        metrics::gauge!(crate::observability::TENANTS_ACTIVE).set(self.tenants.len() as f64);
        info!("removed tenant {id}");
        Ok(())
    }

    // ── Clients ──────────────────────────────────────────

    pub async fn create_client(
        &self,
        tenant_id: TenantId,
        id: ClientId,
        draft: ClientDraft,
    ) -> Result<Client, EngineError> {
        let client = build_client(tenant_id, id, draft)?;
        let mut guard = self.write_tenant(tenant_id).await?;
        if let Some(existing) = guard.clients.get(&id) {
            return if *existing == client {
                Ok(client)
            } else {
                Err(EngineError::AlreadyExists(id))
            };
        }
        if self.owners.contains_key(&id) {
            return Err(EngineError::AlreadyExists(id));
        }
        if guard.clients.len() >= MAX_CLIENTS_PER_TENANT {
            return Err(EngineError::LimitExceeded("too many clients"));
        }
        let event = Event::ClientSaved { client: client.clone() };
        self.persist_and_apply(&mut guard, &event).await?;
        Ok(client)
    }

    pub async fn update_client(
        &self,
        tenant_id: TenantId,
        id: ClientId,
        draft: ClientDraft,
    ) -> Result<Client, EngineError> {
        self.modify_client(tenant_id, id, |current| *current = draft).await
    }

    /// Read-modify-write of one client under the tenant's write lock.
    pub async fn modify_client(
        &self,
        tenant_id: TenantId,
        id: ClientId,
        edit: impl FnOnce(&mut ClientDraft),
    ) -> Result<Client, EngineError> {
        let mut guard = self.write_tenant(tenant_id).await?;
        let mut draft = guard
            .clients
            .get(&id)
            .map(ClientDraft::from)
            .ok_or(EngineError::NotFound(id))?;
        edit(&mut draft);
        let client = build_client(tenant_id, id, draft)?;
        let event = Event::ClientSaved { client: client.clone() };
        self.persist_and_apply(&mut guard, &event).await?;
        Ok(client)
    }

    /// Returns the appointments cancelled by a cascading delete.
    pub async fn delete_client(
        &self,
        tenant_id: TenantId,
        id: ClientId,
        policy: DeletePolicy,
    ) -> Result<Vec<Appointment>, EngineError> {
        self.delete_entity(tenant_id, EntityKind::Client, id, policy).await
    }

    // ── Services ─────────────────────────────────────────

    pub async fn create_service(
        &self,
        tenant_id: TenantId,
        id: ServiceId,
        draft: ServiceDraft,
    ) -> Result<Service, EngineError> {
        let service = build_service(tenant_id, id, draft)?;
        let mut guard = self.write_tenant(tenant_id).await?;
        if let Some(existing) = guard.services.get(&id) {
            return if *existing == service {
                Ok(service)
            } else {
                Err(EngineError::AlreadyExists(id))
            };
        }
        if self.owners.contains_key(&id) {
            return Err(EngineError::AlreadyExists(id));
        }
        if guard.services.len() >= MAX_SERVICES_PER_TENANT {
            return Err(EngineError::LimitExceeded("too many services"));
        }
        let event = Event::ServiceSaved { service: service.clone() };
        self.persist_and_apply(&mut guard, &event).await?;
        Ok(service)
    }

    /// Existing appointments keep the interval they were booked with.
    pub async fn update_service(
        &self,
        tenant_id: TenantId,
        id: ServiceId,
        draft: ServiceDraft,
    ) -> Result<Service, EngineError> {
        self.modify_service(tenant_id, id, |current| *current = draft).await
    }

    /// Read-modify-write of one service under the tenant's write lock.
    pub async fn modify_service(
        &self,
        tenant_id: TenantId,
        id: ServiceId,
        edit: impl FnOnce(&mut ServiceDraft),
    ) -> Result<Service, EngineError> {
        let mut guard = self.write_tenant(tenant_id).await?;
        let mut draft = guard
            .services
            .get(&id)
            .map(ServiceDraft::from)
            .ok_or(EngineError::NotFound(id))?;
        edit(&mut draft);
        let service = build_service(tenant_id, id, draft)?;
        let event = Event::ServiceSaved { service: service.clone() };
        self.persist_and_apply(&mut guard, &event).await?;
        Ok(service)
    }

    pub async fn delete_service(
        &self,
        tenant_id: TenantId,
        id: ServiceId,
        policy: DeletePolicy,
    ) -> Result<Vec<Appointment>, EngineError> {
        self.delete_entity(tenant_id, EntityKind::Service, id, policy).await
    }

    async fn delete_entity(
        &self,
        tenant_id: TenantId,
        kind: EntityKind,
        id: Ulid,
        policy: DeletePolicy,
    ) -> Result<Vec<Appointment>, EngineError> {
        let mut guard = self.write_tenant(tenant_id).await?;
        let exists = match kind {
            EntityKind::Client => guard.clients.contains_key(&id),
            EntityKind::Service => guard.services.contains_key(&id),
        };
        if !exists {
            return Err(EngineError::NotFound(id));
        }

        let referencing = guard.live_references(&id);
        if !referencing.is_empty() && policy == DeletePolicy::Block {
            warn!("delete of {kind} {id} blocked by {} appointment(s)", referencing.len());
            return Err(EngineError::Referenced {
                kind,
                id,
                appointments: referencing,
            });
        }

        // Cancellations and the removal go to the WAL as one record.
        let cancelled: Vec<Appointment> = referencing
            .iter()
            .filter_map(|appointment_id| guard.appointment(appointment_id))
            .map(|current| Appointment {
                status: AppointmentStatus::Cancelled,
                ..current.clone()
            })
            .collect();
        let mut events: Vec<Event> = cancelled
            .iter()
            .map(|appointment| Event::AppointmentSaved {
                appointment: appointment.clone(),
            })
            .collect();
        events.push(match kind {
            EntityKind::Client => Event::ClientRemoved { id, tenant_id },
            EntityKind::Service => Event::ServiceRemoved { id, tenant_id },
        });
        let event = Event::batch(tenant_id, events);
        self.persist_and_apply(&mut guard, &event).await?;
        for appointment in &cancelled {
            self.publish(appointment, ChangeKind::Cancelled);
        }
        info!("deleted {kind} {id}, cancelled {} appointment(s)", cancelled.len());
        Ok(cancelled)
    }

    // ── Appointments ─────────────────────────────────────

    pub async fn create_appointment(
        &self,
        tenant_id: TenantId,
        new: NewAppointment,
    ) -> Result<Appointment, EngineError> {
        let notes = optional_text(new.notes, MAX_TEXT_LEN, "notes too long")?;
        let mut guard = self.write_tenant(tenant_id).await?;

        if let Some(existing) = guard.appointment(&new.id) {
            let same_request = existing.client_id == new.client_id
                && existing.service_id == new.service_id
                && existing.span.start == new.start
                && existing.notes == notes;
            return if same_request {
                Ok(existing.clone())
            } else {
                Err(EngineError::AlreadyExists(new.id))
            };
        }
        if self.owners.contains_key(&new.id) {
            return Err(EngineError::AlreadyExists(new.id));
        }
        if guard.appointments.len() >= MAX_APPOINTMENTS_PER_TENANT {
            return Err(EngineError::LimitExceeded("too many appointments"));
        }

        self.client_in(&guard, new.client_id)?;
        let service = self.service_in(&guard, new.service_id)?;
        let minutes = resolve_duration(
            service,
            guard.tenant.default_duration_minutes,
            self.policy.default_duration_minutes,
        )?;
        let span = compute_interval(new.start, minutes)?;
        validate_span(&span)?;
        if let Err(e) = check_no_conflict(&guard, &span, None) {
            warn!(tenant = %tenant_id, "booking {} rejected: {e}", new.id);
            return Err(e);
        }

        let appointment = Appointment {
            id: new.id,
            tenant_id,
            client_id: new.client_id,
            service_id: new.service_id,
            span,
            notes,
            status: AppointmentStatus::Open,
        };
        let event = Event::AppointmentSaved {
            appointment: appointment.clone(),
        };
        self.persist_and_apply(&mut guard, &event).await?;
        metrics::counter!(crate::observability::APPOINTMENTS_BOOKED_TOTAL).increment(1);
        self.publish(&appointment, ChangeKind::Booked);
        info!(tenant = %tenant_id, "booked {} {}", appointment.id, appointment.span);
        Ok(appointment)
    }

    /// Atomic multi-field edit. A status equal to the current one is treated
    /// as unchanged, so forms can resend every field.
    pub async fn edit_appointment(
        &self,
        tenant_id: TenantId,
        id: AppointmentId,
        patch: AppointmentPatch,
    ) -> Result<Appointment, EngineError> {
        let mut guard = self.write_tenant(tenant_id).await?;
        self.edit_locked(&mut guard, id, patch).await
    }

    pub async fn reschedule(
        &self,
        tenant_id: TenantId,
        id: AppointmentId,
        start: Instant,
    ) -> Result<Appointment, EngineError> {
        let patch = AppointmentPatch {
            start: Some(start),
            ..Default::default()
        };
        self.edit_appointment(tenant_id, id, patch).await
    }

    pub async fn change_service(
        &self,
        tenant_id: TenantId,
        id: AppointmentId,
        service_id: ServiceId,
    ) -> Result<Appointment, EngineError> {
        let patch = AppointmentPatch {
            service_id: Some(service_id),
            ..Default::default()
        };
        self.edit_appointment(tenant_id, id, patch).await
    }

    pub async fn change_client(
        &self,
        tenant_id: TenantId,
        id: AppointmentId,
        client_id: ClientId,
    ) -> Result<Appointment, EngineError> {
        let patch = AppointmentPatch {
            client_id: Some(client_id),
            ..Default::default()
        };
        self.edit_appointment(tenant_id, id, patch).await
    }

    pub async fn update_notes(
        &self,
        tenant_id: TenantId,
        id: AppointmentId,
        notes: Option<String>,
    ) -> Result<Appointment, EngineError> {
        let patch = AppointmentPatch {
            notes: Some(notes),
            ..Default::default()
        };
        self.edit_appointment(tenant_id, id, patch).await
    }

    /// Strict status change: moving to the current status is rejected,
    /// except for `cancelled`, which makes cancelling idempotent.
    pub async fn transition(
        &self,
        tenant_id: TenantId,
        id: AppointmentId,
        target: AppointmentStatus,
    ) -> Result<Appointment, EngineError> {
        let mut guard = self.write_tenant(tenant_id).await?;
        let current = guard.appointment(&id).cloned().ok_or(EngineError::NotFound(id))?;
        if current.status == target {
            return if target == AppointmentStatus::Cancelled {
                Ok(current)
            } else {
                Err(EngineError::InvalidTransition {
                    id,
                    from: current.status,
                    to: target,
                })
            };
        }
        let patch = AppointmentPatch {
            status: Some(target),
            ..Default::default()
        };
        self.edit_locked(&mut guard, id, patch).await
    }

    pub async fn cancel(&self, tenant_id: TenantId, id: AppointmentId) -> Result<Appointment, EngineError> {
        self.transition(tenant_id, id, AppointmentStatus::Cancelled).await
    }

    async fn edit_locked(
        &self,
        ts: &mut TenantState,
        id: AppointmentId,
        patch: AppointmentPatch,
    ) -> Result<Appointment, EngineError> {
        let current = ts.appointment(&id).cloned().ok_or(EngineError::NotFound(id))?;
        let mut next = current.clone();

        if let Some(notes) = patch.notes {
            next.notes = optional_text(notes, MAX_TEXT_LEN, "notes too long")?;
        }
        if let Some(client_id) = patch.client_id
            && client_id != current.client_id
        {
            self.client_in(ts, client_id)?;
            next.client_id = client_id;
        }

        // Interval edits are judged against the status before this patch.
        let new_service = patch.service_id.filter(|s| *s != current.service_id);
        let new_start = patch.start.filter(|s| *s != current.span.start);
        if new_service.is_some() || new_start.is_some() {
            if current.status.is_terminal() {
                return Err(EngineError::InvalidTransition {
                    id,
                    from: current.status,
                    to: patch.status.unwrap_or(current.status),
                });
            }
            let start = new_start.unwrap_or(current.span.start);
            next.span = match new_service {
                Some(service_id) => {
                    let service = self.service_in(ts, service_id)?;
                    let minutes = resolve_duration(
                        service,
                        ts.tenant.default_duration_minutes,
                        self.policy.default_duration_minutes,
                    )?;
                    next.service_id = service_id;
                    compute_interval(start, minutes)?
                }
                None => shift(&current.span, start)?,
            };
            validate_span(&next.span)?;
        }

        if let Some(target) = patch.status
            && target != current.status
        {
            if !current.status.can_transition_to(target) {
                return Err(EngineError::InvalidTransition {
                    id,
                    from: current.status,
                    to: target,
                });
            }
            next.status = target;
        }

        if next.span != current.span
            && next.status.holds_slot()
            && let Err(e) = check_no_conflict(ts, &next.span, Some(id))
        {
            warn!(tenant = %ts.tenant.id, "edit of {id} rejected: {e}");
            return Err(e);
        }

        if next == current {
            return Ok(current);
        }

        let change = match next.status {
            s if s == current.status => ChangeKind::Edited,
            AppointmentStatus::Cancelled => ChangeKind::Cancelled,
            _ => ChangeKind::StatusChanged,
        };
        let event = Event::AppointmentSaved {
            appointment: next.clone(),
        };
        self.persist_and_apply(ts, &event).await?;
        self.publish(&next, change);
        info!(tenant = %ts.tenant.id, "appointment {id} {change:?}: {} {}", next.status, next.span);
        Ok(next)
    }

    // ── Reference checks ─────────────────────────────────

    pub(super) fn client_in<'a>(&self, ts: &'a TenantState, id: ClientId) -> Result<&'a Client, EngineError> {
        ts.clients
            .get(&id)
            .ok_or_else(|| self.missing_reference(ts, EntityKind::Client, id))
    }

    pub(super) fn service_in<'a>(&self, ts: &'a TenantState, id: ServiceId) -> Result<&'a Service, EngineError> {
        ts.services
            .get(&id)
            .ok_or_else(|| self.missing_reference(ts, EntityKind::Service, id))
    }

    /// Ids owned by another tenant are reported as such; unknown ids are NotFound.
    fn missing_reference(&self, ts: &TenantState, kind: EntityKind, id: Ulid) -> EngineError {
        match self.owners.get(&id) {
            Some(owner) if *owner != ts.tenant.id => EngineError::CrossTenantReference {
                kind,
                id,
                tenant_id: ts.tenant.id,
            },
            _ => EngineError::NotFound(id),
        }
    }
}

impl Engine {
    /// Rewrite the WAL with only the events needed to recreate the current
    /// state. Every tenant is read-locked until the new file is in place, so
    /// no append can land in the old file after the snapshot was taken.
    pub async fn compact_wal(&self) -> Result<usize, EngineError> {
        let _registry = self.bounded("tenant registry", || self.registry.lock()).await?;
        let mut tenant_ids: Vec<TenantId> = self.tenants.iter().map(|e| *e.key()).collect();
        tenant_ids.sort();

        let mut guards = Vec::with_capacity(tenant_ids.len());
        for id in tenant_ids {
            guards.push(self.read_tenant(id).await?);
        }

        let mut events = Vec::new();
        for guard in &guards {
            events.push(Event::TenantSaved {
                tenant: guard.tenant.clone(),
            });
            events.extend(
                guard
                    .clients
                    .values()
                    .map(|client| Event::ClientSaved { client: client.clone() }),
            );
            events.extend(
                guard
                    .services
                    .values()
                    .map(|service| Event::ServiceSaved { service: service.clone() }),
            );
            events.extend(guard.appointments.iter().map(|appointment| Event::AppointmentSaved {
                appointment: appointment.clone(),
            }));
        }
        let count = events.len();

        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| EngineError::StoreUnavailable("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::StoreUnavailable("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::StoreUnavailable(format!("WAL compaction failed: {e}")))?;

        metrics::counter!(crate::observability::WAL_COMPACTIONS_TOTAL).increment(1);
        info!("compacted WAL to {count} event(s)");
        Ok(count)
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}
