use async_trait::async_trait;
use pgwire::api::auth::{AuthSource, LoginInfo, Password};
use pgwire::error::{ErrorInfo, PgWireError, PgWireResult};

use crate::limits::MAX_MEMBER_ID_LEN;
use crate::observability;

/// Shared-password auth. The startup `user` doubles as the member id, so
/// it has to be a usable one before the password is even checked.
#[derive(Debug)]
pub struct SeatdAuthSource {
    password: String,
}

impl SeatdAuthSource {
    pub fn new(password: String) -> Self {
        Self { password }
    }
}

fn check_member(user: Option<&str>) -> Result<&str, String> {
    let user = user.map(str::trim).unwrap_or_default();
    if user.is_empty() {
        return Err("a member id is required as the connection user".into());
    }
    if user.len() > MAX_MEMBER_ID_LEN {
        return Err(format!("member id exceeds {MAX_MEMBER_ID_LEN} bytes"));
    }
    Ok(user)
}

#[async_trait]
impl AuthSource for SeatdAuthSource {
    async fn get_password(&self, login: &LoginInfo) -> PgWireResult<Password> {
        if let Err(msg) = check_member(login.user()) {
            metrics::counter!(observability::AUTH_FAILURES_TOTAL).increment(1);
            tracing::warn!("login refused: {msg}");
            return Err(PgWireError::UserError(Box::new(ErrorInfo::new(
                "FATAL".into(),
                "28000".into(),
                msg,
            ))));
        }
        Ok(Password::new(None, self.password.as_bytes().to_vec()))
    }
}
