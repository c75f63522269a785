use async_trait::async_trait;
use pgwire::api::auth::{AuthSource, LoginInfo, Password};
use pgwire::error::PgWireResult;

/// Shared-secret passwords: one for the master user, one for tenant staff.
#[derive(Debug)]
pub struct AgendaAuthSource {
    password: String,
    master_user: String,
    master_password: String,
}

impl AgendaAuthSource {
    pub fn new(password: String, master_user: String, master_password: Option<String>) -> Self {
        let master_password = master_password.unwrap_or_else(|| password.clone());
        Self {
            password,
            master_user,
            master_password,
        }
    }

    fn password_for(&self, user: Option<&str>) -> &str {
        if user.is_some_and(|u| u == self.master_user) {
            &self.master_password
        } else {
            &self.password
        }
    }
}

#[async_trait]
impl AuthSource for AgendaAuthSource {
    async fn get_password(&self, login: &LoginInfo) -> PgWireResult<Password> {
        let expected = self.password_for(login.user().as_deref());
        Ok(Password::new(None, expected.as_bytes().to_vec()))
    }
}
