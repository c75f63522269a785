use std::fmt;

use ulid::Ulid;

use crate::calendar::CalendarError;
use crate::model::{Appointment, AppointmentStatus, Span};

/// Catalog entity an appointment points at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityKind {
    Client,
    Service,
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EntityKind::Client => f.write_str("client"),
            EntityKind::Service => f.write_str("service"),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("not found: {0}")]
    NotFound(Ulid),
    #[error("already exists with different content: {0}")]
    AlreadyExists(Ulid),
    #[error("slot {requested} conflicts with {}", describe_conflicts(.conflicts))]
    SlotConflict {
        requested: Span,
        conflicts: Vec<Appointment>,
    },
    #[error("appointment {id} cannot go from {from} to {to}")]
    InvalidTransition {
        id: Ulid,
        from: AppointmentStatus,
        to: AppointmentStatus,
    },
    #[error("{kind} {id} does not belong to tenant {tenant_id}")]
    CrossTenantReference {
        kind: EntityKind,
        id: Ulid,
        tenant_id: Ulid,
    },
    #[error("service {0} has no duration and no default duration is configured")]
    MissingDuration(Ulid),
    #[error("invalid duration: {0} minutes")]
    InvalidDuration(u32),
    #[error("store unavailable: {0}")]
    StoreUnavailable(String),
    #[error("{kind} {id} is referenced by {} live appointment(s)", .appointments.len())]
    Referenced {
        kind: EntityKind,
        id: Ulid,
        appointments: Vec<Ulid>,
    },
    #[error("tenant {0} still owns clients, services or appointments")]
    TenantNotEmpty(Ulid),
    #[error("invalid input: {0}")]
    Invalid(String),
    #[error(transparent)]
    Calendar(#[from] CalendarError),
    #[error("limit exceeded: {0}")]
    LimitExceeded(&'static str),
}

impl EngineError {
    pub fn sqlstate(&self) -> &'static str {
        match self {
            EngineError::SlotConflict { .. } => "23P01",
            EngineError::InvalidTransition { .. } => "55000",
            EngineError::CrossTenantReference { .. } => "42501",
            EngineError::MissingDuration(_)
            | EngineError::InvalidDuration(_)
            | EngineError::Invalid(_) => "22023",
            EngineError::Calendar(_) => "22008",
            EngineError::StoreUnavailable(_) => "58000",
            EngineError::NotFound(_) => "P0002",
            EngineError::AlreadyExists(_) => "23505",
            EngineError::Referenced { .. } | EngineError::TenantNotEmpty(_) => "23503",
            EngineError::LimitExceeded(_) => "54000",
        }
    }

    /// Rejections caused by the request itself; retrying cannot help.
    pub fn is_rejection(&self) -> bool {
        !matches!(self, EngineError::StoreUnavailable(_))
    }
}

fn describe_conflicts(conflicts: &[Appointment]) -> String {
    conflicts
        .iter()
        .map(|a| format!("{} {}", a.id, a.span))
        .collect::<Vec<_>>()
        .join(", ")
}
