use chrono::{NaiveDate, TimeDelta};
use chrono_tz::Tz;

use crate::calendar;
use crate::limits::*;
use crate::model::*;

use super::conflict::{find_conflicts, validate_span};
use super::slot::{compute_interval, resolve_duration};
use super::{Engine, EngineError};

/// Criteria for `list_appointments`. Unset fields match everything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AppointmentFilter {
    pub status: Option<AppointmentStatus>,
    pub client_id: Option<ClientId>,
    pub service_id: Option<ServiceId>,
    /// Keep appointments whose interval reaches past `from`.
    pub from: Option<Instant>,
    /// Keep appointments starting before `to`.
    pub to: Option<Instant>,
}

impl AppointmentFilter {
    pub fn matches(&self, a: &Appointment) -> bool {
        self.status.is_none_or(|s| a.status == s)
            && self.client_id.is_none_or(|c| a.client_id == c)
            && self.service_id.is_none_or(|s| a.service_id == s)
            && self.from.is_none_or(|from| a.span.end > from)
            && self.to.is_none_or(|to| a.span.start < to)
    }
}

impl Engine {
    pub async fn get_tenant(&self, id: TenantId) -> Result<Tenant, EngineError> {
        Ok(self.read_tenant(id).await?.tenant.clone())
    }

    /// All tenants, by name.
    pub async fn list_tenants(&self) -> Result<Vec<Tenant>, EngineError> {
        let ids: Vec<TenantId> = self.tenants.iter().map(|e| *e.key()).collect();
        let mut tenants = Vec::with_capacity(ids.len());
        for id in ids {
            match self.read_tenant(id).await {
                Ok(guard) => tenants.push(guard.tenant.clone()),
                // Removed since we listed the ids.
                Err(EngineError::NotFound(_)) => {}
                Err(e) => return Err(e),
            }
        }
        tenants.sort_by(|a, b| a.name.to_lowercase().cmp(&b.name.to_lowercase()).then(a.id.cmp(&b.id)));
        Ok(tenants)
    }

    pub async fn get_client(&self, tenant_id: TenantId, id: ClientId) -> Result<Client, EngineError> {
        let guard = self.read_tenant(tenant_id).await?;
        guard.clients.get(&id).cloned().ok_or(EngineError::NotFound(id))
    }

    pub async fn list_clients(&self, tenant_id: TenantId) -> Result<Vec<Client>, EngineError> {
        let guard = self.read_tenant(tenant_id).await?;
        let mut clients: Vec<Client> = guard.clients.values().cloned().collect();
        clients.sort_by(|a, b| a.name.to_lowercase().cmp(&b.name.to_lowercase()).then(a.id.cmp(&b.id)));
        Ok(clients)
    }

    pub async fn get_service(&self, tenant_id: TenantId, id: ServiceId) -> Result<Service, EngineError> {
        let guard = self.read_tenant(tenant_id).await?;
        guard.services.get(&id).cloned().ok_or(EngineError::NotFound(id))
    }

    pub async fn list_services(&self, tenant_id: TenantId) -> Result<Vec<Service>, EngineError> {
        let guard = self.read_tenant(tenant_id).await?;
        let mut services: Vec<Service> = guard.services.values().cloned().collect();
        services.sort_by(|a, b| a.name.to_lowercase().cmp(&b.name.to_lowercase()).then(a.id.cmp(&b.id)));
        Ok(services)
    }

    pub async fn get_appointment(
        &self,
        tenant_id: TenantId,
        id: AppointmentId,
    ) -> Result<Appointment, EngineError> {
        let guard = self.read_tenant(tenant_id).await?;
        guard.appointment(&id).cloned().ok_or(EngineError::NotFound(id))
    }

    /// Appointments of every status intersecting the local calendar day
    /// `date` in `tz` (the tenant's timezone by default), ordered by start.
    pub async fn list_day(
        &self,
        tenant_id: TenantId,
        date: NaiveDate,
        tz: Option<Tz>,
    ) -> Result<Vec<Appointment>, EngineError> {
        let guard = self.read_tenant(tenant_id).await?;
        let day = calendar::day_span(date, tz.unwrap_or(guard.tenant.timezone))?;
        validate_span(&day)?;
        Ok(guard.overlapping(&day).cloned().collect())
    }

    pub async fn list_appointments(
        &self,
        tenant_id: TenantId,
        filter: &AppointmentFilter,
    ) -> Result<Vec<Appointment>, EngineError> {
        let guard = self.read_tenant(tenant_id).await?;
        let appointments = match (filter.from, filter.to) {
            (Some(from), Some(to)) => {
                if to <= from {
                    return Err(EngineError::Invalid("range end must be after its start".into()));
                }
                if to - from > TimeDelta::days(MAX_QUERY_WINDOW_DAYS) {
                    return Err(EngineError::LimitExceeded("query window too wide"));
                }
                let range = Span::new(from, to);
                validate_span(&range)?;
                guard
                    .overlapping(&range)
                    .filter(|a| filter.matches(a))
                    .cloned()
                    .collect()
            }
            _ => guard
                .appointments
                .iter()
                .filter(|a| filter.matches(a))
                .cloned()
                .collect(),
        };
        Ok(appointments)
    }

    /// What booking `service_id` at `start` would collide with, without booking.
    /// `exclude` leaves out the appointment being edited.
    pub async fn preview_conflicts(
        &self,
        tenant_id: TenantId,
        service_id: ServiceId,
        start: Instant,
        exclude: Option<AppointmentId>,
    ) -> Result<Vec<Appointment>, EngineError> {
        let guard = self.read_tenant(tenant_id).await?;
        let service = self.service_in(&guard, service_id)?;
        let minutes = resolve_duration(
            service,
            guard.tenant.default_duration_minutes,
            self.policy.default_duration_minutes,
        )?;
        let span = compute_interval(start, minutes)?;
        validate_span(&span)?;
        Ok(find_conflicts(&guard, &span, exclude))
    }
}
