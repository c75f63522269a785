use tracing::debug;

use crate::model::*;

use super::EngineError;

pub(crate) fn validate_span(span: &Span) -> Result<(), EngineError> {
    use crate::limits::*;
    if span.start.timestamp_millis() < MIN_VALID_TIMESTAMP_MS
        || span.end.timestamp_millis() > MAX_VALID_TIMESTAMP_MS
    {
        return Err(EngineError::LimitExceeded("timestamp out of range"));
    }
    Ok(())
}

/// Every live appointment overlapping `span`, ordered by start. `exclude` is
/// the appointment being edited, which never conflicts with itself.
pub fn find_conflicts(
    state: &TenantState,
    span: &Span,
    exclude: Option<AppointmentId>,
) -> Vec<Appointment> {
    let conflicts: Vec<Appointment> = state
        .overlapping(span)
        .filter(|a| a.holds_slot())
        .filter(|a| Some(a.id) != exclude)
        .cloned()
        .collect();
    debug!(
        tenant = %state.tenant.id,
        span = %span,
        lookback_min = state.longest_booking.num_minutes(),
        conflicts = conflicts.len(),
        "conflict scan"
    );
    conflicts
}

pub(crate) fn check_no_conflict(
    state: &TenantState,
    span: &Span,
    exclude: Option<AppointmentId>,
) -> Result<(), EngineError> {
    let conflicts = find_conflicts(state, span, exclude);
    if conflicts.is_empty() {
        return Ok(());
    }
    metrics::counter!(crate::observability::SLOT_CONFLICTS_TOTAL).increment(1);
    Err(EngineError::SlotConflict {
        requested: *span,
        conflicts,
    })
}
