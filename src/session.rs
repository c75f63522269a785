use ulid::Ulid;

use crate::model::TenantId;

/// Who is on the other end of a connection. Identity comes from the startup
/// packet, after the password check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Cross-tenant, read-only for tenant data; manages tenants.
    Master,
    /// Staff of one company.
    Tenant(TenantId),
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum SessionError {
    #[error("no database given; connect with the tenant id as database name")]
    MissingDatabase,
    #[error("database {0:?} is not a tenant id")]
    InvalidTenant(String),
    #[error("permission denied: {0}")]
    Forbidden(&'static str),
}

impl SessionError {
    pub fn sqlstate(&self) -> &'static str {
        match self {
            SessionError::MissingDatabase | SessionError::InvalidTenant(_) => "3D000",
            SessionError::Forbidden(_) => "42501",
        }
    }
}

impl Role {
    /// `user == master_user` is the master role; anyone else works inside the
    /// tenant named by `database`.
    pub fn resolve(user: Option<&str>, database: Option<&str>, master_user: &str) -> Result<Self, SessionError> {
        if user == Some(master_user) {
            return Ok(Role::Master);
        }
        let database = database.ok_or(SessionError::MissingDatabase)?;
        Ulid::from_string(database.trim())
            .map(Role::Tenant)
            .map_err(|_| SessionError::InvalidTenant(database.to_string()))
    }

    pub fn is_master(&self) -> bool {
        matches!(self, Role::Master)
    }

    /// Tenant whose data a mutation touches. Master never writes tenant data.
    pub fn writable_tenant(&self) -> Result<TenantId, SessionError> {
        match self {
            Role::Tenant(id) => Ok(*id),
            Role::Master => Err(SessionError::Forbidden("master is read-only for tenant data")),
        }
    }

    /// Tenants a read may see. `None` means every tenant (master without a
    /// `tenant_id` filter). A tenant session asking for another tenant is refused.
    pub fn readable_tenant(&self, requested: Option<TenantId>) -> Result<Option<TenantId>, SessionError> {
        match (self, requested) {
            (Role::Master, requested) => Ok(requested),
            (Role::Tenant(own), None) => Ok(Some(*own)),
            (Role::Tenant(own), Some(requested)) if requested == *own => Ok(Some(*own)),
            (Role::Tenant(_), Some(_)) => Err(SessionError::Forbidden("tenant_id of another tenant")),
        }
    }

    pub fn require_master(&self) -> Result<(), SessionError> {
        match self {
            Role::Master => Ok(()),
            Role::Tenant(_) => Err(SessionError::Forbidden("only master manages tenants")),
        }
    }
}
