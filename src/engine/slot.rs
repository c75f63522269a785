use chrono::TimeDelta;

use crate::limits::MAX_SERVICE_DURATION_MINUTES;
use crate::model::{Instant, Service, Span};

use super::EngineError;

/// `[start, start + duration)`.
pub fn compute_interval(start: Instant, duration_minutes: u32) -> Result<Span, EngineError> {
    if duration_minutes == 0 || duration_minutes > MAX_SERVICE_DURATION_MINUTES {
        return Err(EngineError::InvalidDuration(duration_minutes));
    }
    let end = start
        .checked_add_signed(TimeDelta::minutes(duration_minutes.into()))
        .ok_or(EngineError::LimitExceeded("timestamp out of range"))?;
    Ok(Span::new(start, end))
}

/// Service duration, else the tenant default, else the global default.
pub fn resolve_duration(
    service: &Service,
    tenant_default: Option<u32>,
    global_default: Option<u32>,
) -> Result<u32, EngineError> {
    service
        .duration_minutes
        .or(tenant_default)
        .or(global_default)
        .ok_or(EngineError::MissingDuration(service.id))
}

/// Same length, new start. Used when an appointment moves without changing service.
pub fn shift(span: &Span, start: Instant) -> Result<Span, EngineError> {
    let end = start
        .checked_add_signed(span.duration())
        .ok_or(EngineError::LimitExceeded("timestamp out of range"))?;
    Ok(Span::new(start, end))
}
