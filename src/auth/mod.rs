//! The authentication sub-protocol: cleartext and MD5 passwords plus
//! SASL with SCRAM-SHA-256.
//!
//! The engine feeds every `Authentication*` backend message through
//! [`Authenticator::respond`], which writes the matching frontend
//! response into the outgoing sink and reports when the server accepted
//! the credentials.

mod scram;

pub use scram::{ScramClient, MECHANISM};

use tracing::debug;

use crate::encoding::ClientEncoding;
use crate::error::{Error, Result};
use crate::messages::backend::AuthRequest;
use crate::messages::frontend::FrontendSink;

/// What the engine should do after handling one authentication message.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum AuthEvent {
    /// A response was enqueued (or none was needed); keep reading.
    Continue,
    /// `AuthenticationOk` arrived; the connection is authenticated.
    Done,
}

/// Per-connection authentication state.
pub(crate) struct Authenticator {
    user: String,
    password: Option<String>,
    encoding: ClientEncoding,
    scram: Option<ScramClient>,
}

impl Authenticator {
    pub fn new(user: &str, password: Option<&str>, encoding: ClientEncoding) -> Self {
        Authenticator {
            user: user.to_string(),
            password: password.map(str::to_owned),
            encoding,
            scram: None,
        }
    }

    fn password(&self) -> Result<&str> {
        self.password.as_deref().ok_or(Error::PasswordRequired)
    }

    pub fn respond(&mut self, request: AuthRequest, sink: &mut FrontendSink) -> Result<AuthEvent> {
        match request {
            AuthRequest::Ok => {
                debug!("authentication accepted");
                Ok(AuthEvent::Done)
            }
            AuthRequest::CleartextPassword => {
                let password = self.encoding.encode(self.password()?)?;
                sink.put_password(&password);
                Ok(AuthEvent::Continue)
            }
            AuthRequest::Md5Password { salt } => {
                let digest = md5_password(&self.user, self.password()?, salt);
                sink.put_password(digest.as_bytes());
                Ok(AuthEvent::Continue)
            }
            AuthRequest::Sasl { mechanisms } => {
                if !mechanisms.iter().any(|m| m == MECHANISM) {
                    return Err(Error::AuthMechanismUnsupported(mechanisms.join(", ")));
                }
                let client = ScramClient::new(self.password()?);
                sink.put_sasl_initial_response(MECHANISM, client.client_first().as_bytes());
                self.scram = Some(client);
                Ok(AuthEvent::Continue)
            }
            AuthRequest::SaslContinue(server_first) => {
                let scram = self.scram.as_mut().ok_or_else(|| {
                    Error::Protocol("SASL challenge arrived without an initial response".into())
                })?;
                let client_final = scram.client_final(&server_first)?;
                sink.put_sasl_response(client_final.as_bytes());
                Ok(AuthEvent::Continue)
            }
            AuthRequest::SaslFinal { server_signature } => {
                let scram = self.scram.as_ref().ok_or_else(|| {
                    Error::Protocol("SASL final arrived without an exchange in flight".into())
                })?;
                scram.verify_server_signature(&server_signature)?;
                debug!("SCRAM server signature verified");
                Ok(AuthEvent::Continue)
            }
            unsupported @ (AuthRequest::KerberosV5
            | AuthRequest::ScmCredential
            | AuthRequest::Gss
            | AuthRequest::GssContinue
            | AuthRequest::Sspi) => Err(Error::AuthMechanismUnsupported(
                unsupported.mechanism_name().to_string(),
            )),
        }
    }
}

/// Compute the MD5 password digest as per the PostgreSQL protocol:
/// `"md5" + md5(md5(password + user) + salt)`.
fn md5_password(user: &str, password: &str, salt: [u8; 4]) -> String {
    let inner = format!("{password}{user}");
    let inner_hash = md5::compute(inner.as_bytes());

    let mut outer_input = format!("{inner_hash:x}").into_bytes();
    outer_input.extend_from_slice(&salt);
    let outer_hash = md5::compute(&outer_input);

    format!("md5{outer_hash:x}")
}
