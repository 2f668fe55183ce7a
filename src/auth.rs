use async_trait::async_trait;
use pgwire::api::auth::{AuthSource, LoginInfo, Password};
use pgwire::error::PgWireResult;

/// One shared password for every user name. The user name a client logs in
/// with is not an identity; booking ownership travels in `user_id` columns.
#[derive(Debug)]
pub struct InnkeeperAuthSource {
    password: String,
}

impl InnkeeperAuthSource {
    pub fn new(password: String) -> Self {
        Self { password }
    }
}

#[async_trait]
impl AuthSource for InnkeeperAuthSource {
    async fn get_password(&self, _login: &LoginInfo) -> PgWireResult<Password> {
        Ok(Password::new(None, self.password.as_bytes().to_vec()))
    }
}
