use async_trait::async_trait;
use pgwire::api::auth::{AuthSource, LoginInfo, Password};
use pgwire::error::PgWireResult;
use ulid::Ulid;

use crate::model::{Principal, Role};

/// One shared password for every login. Identity comes from the user name.
#[derive(Debug)]
pub struct SalonAuthSource {
    password: String,
}

impl SalonAuthSource {
    pub fn new(password: String) -> Self {
        Self { password }
    }
}

#[async_trait]
impl AuthSource for SalonAuthSource {
    async fn get_password(&self, _login: &LoginInfo) -> PgWireResult<Password> {
        Ok(Password::new(None, self.password.as_bytes().to_vec()))
    }
}

/// Parse a login user of the form `<role>:<ulid>`, e.g.
/// `customer:01HV4Z2WQXKJNM8GPQY6VBCDEF`.
pub fn parse_principal(user: &str) -> Result<Principal, String> {
    let (role, id) = user
        .split_once(':')
        .ok_or_else(|| format!("user {user:?} is not <role>:<ulid>"))?;
    let role: Role = role.trim().parse()?;
    let id = Ulid::from_string(id.trim()).map_err(|e| format!("bad user id {id:?}: {e}"))?;
    Ok(Principal::new(role, id))
}
