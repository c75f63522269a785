// Bounds on user-controlled input. Everything a client can grow is capped here.

pub const MAX_TENANTS: usize = 10_000;
pub const MAX_CLIENTS_PER_TENANT: usize = 100_000;
pub const MAX_SERVICES_PER_TENANT: usize = 10_000;
pub const MAX_APPOINTMENTS_PER_TENANT: usize = 1_000_000;

pub const MAX_NAME_LEN: usize = 256;
/// Contact and address fields.
pub const MAX_FIELD_LEN: usize = 256;
/// Appointment notes and service descriptions.
pub const MAX_TEXT_LEN: usize = 4096;

/// One service may not occupy more than a day.
pub const MAX_SERVICE_DURATION_MINUTES: u32 = 24 * 60;

/// 1970-01-01T00:00:00Z.
pub const MIN_VALID_TIMESTAMP_MS: i64 = 0;
/// 9999-12-31T23:59:59.999Z.
pub const MAX_VALID_TIMESTAMP_MS: i64 = 253_402_300_799_999;

/// Widest range accepted by `list_appointments`.
pub const MAX_QUERY_WINDOW_DAYS: i64 = 366;

pub const MAX_LISTEN_CHANNELS: usize = 64;
pub const MAX_DAY_WINDOW_DAYS: u32 = 366;
