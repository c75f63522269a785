use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, TimeDelta, Utc};
use chrono_tz::Tz;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Instants are always UTC; local calendars are applied at the edges.
pub type Instant = DateTime<Utc>;

pub type TenantId = Ulid;
pub type ClientId = Ulid;
pub type ServiceId = Ulid;
pub type AppointmentId = Ulid;

/// Half-open interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Span {
    pub start: Instant,
    pub end: Instant,
}

impl Span {
    pub fn new(start: Instant, end: Instant) -> Self {
        debug_assert!(start < end, "Span start must be before end");
        Self { start, end }
    }

    pub fn duration(&self) -> TimeDelta {
        self.end - self.start
    }

    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }

    pub fn contains_instant(&self, t: Instant) -> bool {
        self.start <= t && t < self.end
    }
}

impl fmt::Display for Span {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.start.to_rfc3339(), self.end.to_rfc3339())
    }
}

// ── Status lifecycle ─────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AppointmentStatus {
    Open,
    InProgress,
    Completed,
    Cancelled,
}

/// Every allowed `(from, to)` status change. Anything not listed is rejected.
pub const TRANSITIONS: &[(AppointmentStatus, AppointmentStatus)] = &[
    (AppointmentStatus::Open, AppointmentStatus::InProgress),
    (AppointmentStatus::Open, AppointmentStatus::Cancelled),
    (AppointmentStatus::InProgress, AppointmentStatus::Completed),
    (AppointmentStatus::InProgress, AppointmentStatus::Cancelled),
];

impl AppointmentStatus {
    pub const ALL: [AppointmentStatus; 4] = [
        AppointmentStatus::Open,
        AppointmentStatus::InProgress,
        AppointmentStatus::Completed,
        AppointmentStatus::Cancelled,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            AppointmentStatus::Open => "open",
            AppointmentStatus::InProgress => "in_progress",
            AppointmentStatus::Completed => "completed",
            AppointmentStatus::Cancelled => "cancelled",
        }
    }

    /// Accepts the canonical labels and the legacy Portuguese ones
    /// (`aberto`, `em_atendimento`, `concluido`, `cancelado`).
    pub fn parse(label: &str) -> Option<Self> {
        match label.trim().to_lowercase().as_str() {
            "open" | "aberto" => Some(AppointmentStatus::Open),
            "in_progress" | "em_atendimento" => Some(AppointmentStatus::InProgress),
            "completed" | "concluido" | "concluído" => Some(AppointmentStatus::Completed),
            "cancelled" | "canceled" | "cancelado" => Some(AppointmentStatus::Cancelled),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, AppointmentStatus::Completed | AppointmentStatus::Cancelled)
    }

    /// Cancelled appointments no longer occupy their interval.
    pub fn holds_slot(&self) -> bool {
        !matches!(self, AppointmentStatus::Cancelled)
    }

    pub fn can_transition_to(&self, target: AppointmentStatus) -> bool {
        TRANSITIONS.iter().any(|&(from, to)| from == *self && to == target)
    }
}

impl fmt::Display for AppointmentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── Catalog entities ─────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Contact {
    pub phone: Option<String>,
    pub email: Option<String>,
}

/// Free-form postal address, as typed by staff.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Address {
    pub street: Option<String>,
    pub number: Option<String>,
    pub district: Option<String>,
    pub city: Option<String>,
    pub state: Option<String>,
    pub postal_code: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tenant {
    pub id: TenantId,
    pub name: String,
    pub contact: Contact,
    pub timezone: Tz,
    /// Fallback for services whose duration is unknown.
    pub default_duration_minutes: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Client {
    pub id: ClientId,
    pub tenant_id: TenantId,
    pub name: String,
    pub contact: Contact,
    pub address: Address,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Service {
    pub id: ServiceId,
    pub tenant_id: TenantId,
    pub name: String,
    pub price: Decimal,
    /// `None` for legacy records created without a duration.
    pub duration_minutes: Option<u32>,
    pub description: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Appointment {
    pub id: AppointmentId,
    pub tenant_id: TenantId,
    pub client_id: ClientId,
    pub service_id: ServiceId,
    /// Interval snapshotted from the service duration at booking/edit time.
    pub span: Span,
    pub notes: Option<String>,
    pub status: AppointmentStatus,
}

impl Appointment {
    pub fn holds_slot(&self) -> bool {
        self.status.holds_slot()
    }
}

// ── Per-tenant state ─────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct TenantState {
    pub tenant: Tenant,
    pub clients: HashMap<ClientId, Client>,
    pub services: HashMap<ServiceId, Service>,
    /// All appointments (any status), sorted by `span.start`.
    pub appointments: Vec<Appointment>,
    /// Longest interval ever booked in this tenant. Bounds the conflict look-back:
    /// nothing starting earlier than `start - longest_booking` can reach `start`.
    pub longest_booking: TimeDelta,
}

impl TenantState {
    pub fn new(tenant: Tenant) -> Self {
        Self {
            tenant,
            clients: HashMap::new(),
            services: HashMap::new(),
            appointments: Vec::new(),
            longest_booking: TimeDelta::zero(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty() && self.services.is_empty() && self.appointments.is_empty()
    }

    pub fn appointment(&self, id: &AppointmentId) -> Option<&Appointment> {
        self.appointments.iter().find(|a| a.id == *id)
    }

    /// Insert or replace by id, keeping the book sorted by start.
    pub fn upsert_appointment(&mut self, appointment: Appointment) {
        self.remove_appointment(appointment.id);
        self.longest_booking = self.longest_booking.max(appointment.span.duration());
        let pos = self
            .appointments
            .partition_point(|a| a.span.start <= appointment.span.start);
        self.appointments.insert(pos, appointment);
    }

    fn remove_appointment(&mut self, id: AppointmentId) -> Option<Appointment> {
        let pos = self.appointments.iter().position(|a| a.id == id)?;
        Some(self.appointments.remove(pos))
    }

    /// Appointments whose interval intersects `query`, in start order.
    /// Only the slice starting in `[query.start - longest_booking, query.end)` is scanned.
    pub fn overlapping(&self, query: &Span) -> impl Iterator<Item = &Appointment> {
        let earliest = query
            .start
            .checked_sub_signed(self.longest_booking)
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        let left = self.appointments.partition_point(|a| a.span.start < earliest);
        let right = self.appointments.partition_point(|a| a.span.start < query.end);
        let right = right.max(left);
        self.appointments[left..right]
            .iter()
            .filter(move |a| a.span.overlaps(query))
    }

    /// Live (non-terminal) appointments pointing at a client or service.
    pub fn live_references(&self, entity_id: &Ulid) -> Vec<AppointmentId> {
        self.appointments
            .iter()
            .filter(|a| !a.status.is_terminal())
            .filter(|a| a.client_id == *entity_id || a.service_id == *entity_id)
            .map(|a| a.id)
            .collect()
    }
}

/// WAL record format. Every record carries the full new state of the entities
/// it touches, so replaying a record twice is harmless.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    TenantSaved { tenant: Tenant },
    TenantRemoved { id: TenantId },
    ClientSaved { client: Client },
    ClientRemoved { id: ClientId, tenant_id: TenantId },
    ServiceSaved { service: Service },
    ServiceRemoved { id: ServiceId, tenant_id: TenantId },
    AppointmentSaved { appointment: Appointment },
    /// Several changes to one tenant written as a single record: replay sees
    /// all of them or none.
    Batch { tenant_id: TenantId, events: Vec<Event> },
}

impl Event {
    /// One record for `events`; a single event is written as itself.
    pub fn batch(tenant_id: TenantId, mut events: Vec<Event>) -> Event {
        if events.len() == 1
            && let Some(event) = events.pop()
        {
            return event;
        }
        Event::Batch { tenant_id, events }
    }

    /// Owning tenant, or `None` for tenant-level records.
    pub fn tenant_id(&self) -> Option<TenantId> {
        match self {
            Event::TenantSaved { .. } | Event::TenantRemoved { .. } => None,
            Event::ClientSaved { client } => Some(client.tenant_id),
            Event::ServiceSaved { service } => Some(service.tenant_id),
            Event::AppointmentSaved { appointment } => Some(appointment.tenant_id),
            Event::ClientRemoved { tenant_id, .. }
            | Event::ServiceRemoved { tenant_id, .. }
            | Event::Batch { tenant_id, .. } => Some(*tenant_id),
        }
    }
}

// ── Realtime change notices ──────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Booked,
    Edited,
    StatusChanged,
    Cancelled,
}

/// Pushed to LISTENers when an appointment of tenant X changes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeNotice {
    pub tenant_id: TenantId,
    pub appointment_id: AppointmentId,
    pub change: ChangeKind,
    pub status: AppointmentStatus,
    pub start: Instant,
    pub end: Instant,
}

impl ChangeNotice {
    pub fn new(appointment: &Appointment, change: ChangeKind) -> Self {
        Self {
            tenant_id: appointment.tenant_id,
            appointment_id: appointment.id,
            change,
            status: appointment.status,
            start: appointment.span.start,
            end: appointment.span.end,
        }
    }
}
