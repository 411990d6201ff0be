use crate::protocol::{read_userpass, write_userpass_result, AuthMethod};
use crate::utils::error::{ProxyError, Result};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::time::{timeout, Duration};
use tracing::{debug, warn};

/// Bound on how long a client may take to complete the username/password
/// sub-negotiation once it has selected that method.
pub const AUTH_TIMEOUT: Duration = Duration::from_secs(45);

/// Resolved authentication policy for a connection: whether authentication
/// is mandatory and, if so, the single accepted username/password pair.
/// Built from [`crate::config::Config::auth_config`], which folds in
/// environment variable overrides before constructing this.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AuthConfig {
    pub require_auth: bool,
    pub credentials: Option<(String, String)>,
}

/// Negotiates and performs authentication for a single connection.
///
/// Holds only what the negotiation needs: whether authentication is
/// mandatory and, if so, the single accepted credential pair. There is no
/// multi-user database or external identity backend in scope.
pub struct Authenticator {
    config: AuthConfig,
}

impl Authenticator {
    pub fn new(config: AuthConfig) -> Self {
        Self { config }
    }

    /// Select the method to use given what the client offered, per RFC 1928
    /// §3: prefer username/password when credentials are configured and the
    /// client offers it, otherwise fall back to no-auth if that is allowed.
    pub fn negotiate(&self, offered: &[AuthMethod]) -> AuthMethod {
        if self.config.require_auth {
            if offered.contains(&AuthMethod::UserPass) {
                AuthMethod::UserPass
            } else {
                AuthMethod::NoAcceptable
            }
        } else if offered.contains(&AuthMethod::NoAuth) {
            AuthMethod::NoAuth
        } else if offered.contains(&AuthMethod::UserPass) && self.config.credentials.is_some() {
            AuthMethod::UserPass
        } else {
            AuthMethod::NoAcceptable
        }
    }

    /// Run the chosen method to completion. `NoAuth` is a no-op; `UserPass`
    /// reads the sub-negotiation record (bounded by [`AUTH_TIMEOUT`]) and
    /// checks it against the configured credential pair in constant time.
    pub async fn authenticate<S>(&self, stream: &mut S, method: AuthMethod) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        match method {
            AuthMethod::NoAuth => {
                debug!("no authentication required");
                Ok(())
            }
            AuthMethod::UserPass => {
                let (username, password) = timeout(AUTH_TIMEOUT, read_userpass(stream))
                    .await
                    .map_err(|_| ProxyError::AuthFailed("sub-negotiation timed out".to_string()))??;

                let valid = match &self.config.credentials {
                    Some((expected_user, expected_pass)) => {
                        credentials_match(&username, &password, expected_user, expected_pass)
                    }
                    None => false,
                };

                write_userpass_result(stream, valid).await?;

                if valid {
                    debug!(user = %username, "username/password authentication succeeded");
                    Ok(())
                } else {
                    warn!(user = %username, "username/password authentication failed");
                    Err(ProxyError::AuthFailed(format!(
                        "invalid credentials for user: {username}"
                    )))
                }
            }
            other => Err(ProxyError::AuthFailed(format!(
                "unsupported authentication method: {other:?}"
            ))),
        }
    }
}

/// Constant-time comparison of the supplied credentials against the
/// configured pair; avoids leaking match length through early returns.
fn credentials_match(
    given_user: &str,
    given_pass: &str,
    expected_user: &str,
    expected_pass: &str,
) -> bool {
    constant_time_eq(given_user.as_bytes(), expected_user.as_bytes())
        & constant_time_eq(given_pass.as_bytes(), expected_pass.as_bytes())
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff: u8 = 0;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}
