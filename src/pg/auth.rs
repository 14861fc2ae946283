//! Authentication exchange.
//!
//! The digest and the platform negotiate mechanism are collaborators: MD5
//! defaults to the `md5` crate, GSSAPI/SSPI tokens come from a caller
//! supplied [`NegotiateProvider`].

use std::fmt;
use std::sync::Arc;

use super::backend::AuthenticationRequest;
use super::error::{PgError, PgResult};

/// 16-byte MD5 digest function.
pub trait PasswordDigest: Send + Sync {
    fn digest(&self, data: &[u8]) -> [u8; 16];
}

/// Digest backed by the `md5` crate.
#[derive(Debug, Clone, Copy, Default)]
pub struct Md5Digest;

impl PasswordDigest for Md5Digest {
    fn digest(&self, data: &[u8]) -> [u8; 16] {
        md5::compute(data).0
    }
}

/// Challenge/response token source for GSSAPI or SSPI.
pub trait NegotiateProvider: Send + Sync {
    /// First token, sent when the server asks for GSS or SSPI.
    fn initial_token(&self, host: &str) -> PgResult<Vec<u8>>;

    /// Answer to a GSSContinue challenge; `None` ends the exchange.
    fn continue_token(&self, challenge: &[u8]) -> PgResult<Option<Vec<u8>>>;
}

/// What to send back for one authentication request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthResponse {
    Password(String),
    Token(Vec<u8>),
}

/// Credentials for one handshake.
#[derive(Debug, Clone, Copy)]
pub struct Credentials<'a> {
    pub host: &'a str,
    pub user: &'a str,
    pub password: Option<&'a str>,
    pub integrated_security: bool,
}

/// Answers authentication requests using the configured collaborators.
#[derive(Clone)]
pub struct Authenticator {
    digest: Arc<dyn PasswordDigest>,
    negotiate: Option<Arc<dyn NegotiateProvider>>,
}

impl Default for Authenticator {
    fn default() -> Self {
        Self {
            digest: Arc::new(Md5Digest),
            negotiate: None,
        }
    }
}

impl fmt::Debug for Authenticator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Authenticator")
            .field("negotiate", &self.negotiate.is_some())
            .finish()
    }
}

impl Authenticator {
    pub fn with_digest(mut self, digest: Arc<dyn PasswordDigest>) -> Self {
        self.digest = digest;
        self
    }

    pub fn with_negotiate_provider(mut self, provider: Arc<dyn NegotiateProvider>) -> Self {
        self.negotiate = Some(provider);
        self
    }

    /// Produce the reply to `request`, or `None` if nothing is sent.
    pub fn respond(
        &self,
        request: &AuthenticationRequest,
        creds: &Credentials<'_>,
    ) -> PgResult<Option<AuthResponse>> {
        match request {
            AuthenticationRequest::Ok => Ok(None),
            AuthenticationRequest::Cleartext => {
                let password = require_password(creds)?;
                Ok(Some(AuthResponse::Password(password.to_string())))
            }
            AuthenticationRequest::Md5 { salt } => {
                let password = require_password(creds)?;
                Ok(Some(AuthResponse::Password(md5_password(
                    self.digest.as_ref(),
                    creds.user,
                    password,
                    salt,
                ))))
            }
            AuthenticationRequest::Gss | AuthenticationRequest::Sspi => {
                let provider = self.negotiate_provider(creds)?;
                Ok(Some(AuthResponse::Token(provider.initial_token(creds.host)?)))
            }
            AuthenticationRequest::GssContinue { data } => {
                let provider = self.negotiate_provider(creds)?;
                Ok(provider.continue_token(data)?.map(AuthResponse::Token))
            }
            AuthenticationRequest::KerberosV4 => Err(unsupported("Kerberos V4")),
            AuthenticationRequest::KerberosV5 => Err(unsupported("Kerberos V5")),
            AuthenticationRequest::Crypt { .. } => Err(unsupported("crypt")),
            AuthenticationRequest::ScmCredential => Err(unsupported("SCM credential")),
            AuthenticationRequest::Unknown(code) => Err(PgError::Auth(format!(
                "Authentication method {} is not supported",
                code
            ))),
        }
    }

    fn negotiate_provider(&self, creds: &Credentials<'_>) -> PgResult<&Arc<dyn NegotiateProvider>> {
        if !creds.integrated_security {
            return Err(PgError::Auth(
                "Server requested integrated security but it is not enabled".to_string(),
            ));
        }
        self.negotiate.as_ref().ok_or_else(|| {
            PgError::Auth("No negotiate provider configured for integrated security".to_string())
        })
    }
}

fn require_password<'a>(creds: &Credentials<'a>) -> PgResult<&'a str> {
    creds
        .password
        .ok_or_else(|| PgError::Auth("Password required".to_string()))
}

fn unsupported(method: &str) -> PgError {
    PgError::Auth(format!("{} authentication is not supported", method))
}

/// Lowercase hex of a digest.
pub fn to_hex(digest: &[u8]) -> String {
    use std::fmt::Write;
    digest.iter().fold(String::with_capacity(digest.len() * 2), |mut s, b| {
        let _ = write!(s, "{:02x}", b);
        s
    })
}

/// Compute MD5 password hash.
pub fn md5_password(
    digest: &dyn PasswordDigest,
    user: &str,
    password: &str,
    salt: &[u8; 4],
) -> String {
    // MD5(MD5(password + user) + salt)
    let inner = format!("{}{}", password, user);
    let inner_hex = to_hex(&digest.digest(inner.as_bytes()));

    let mut hasher_input = inner_hex.into_bytes();
    hasher_input.extend_from_slice(salt);

    format!("md5{}", to_hex(&digest.digest(&hasher_input)))
}
