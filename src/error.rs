/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// The error type for engine configuration, connection bring-up,
/// authentication, and query execution.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Bad URI, unknown SSL mode, missing service, malformed pgpass.
    #[error("configuration error: {0}")]
    Config(String),

    /// Socket-level connect failure.
    #[error("connection failed: {0}")]
    ConnectFailed(#[source] std::io::Error),

    /// Server answered `N` to SSLRequest but `sslmode=require`.
    #[error("server refused TLS but sslmode requires it")]
    TlsRefused,

    /// Server answered something other than `S` or `N` to SSLRequest.
    #[error("unexpected SSL response byte 0x{0:02x}")]
    UnexpectedSslResponse(u8),

    /// Server closed the connection while we awaited the SSL response byte.
    #[error("server closed the connection during SSL negotiation")]
    ServerClosedDuringSsl,

    /// Server requested an authentication mechanism we do not implement.
    #[error("unsupported authentication mechanism: {0}")]
    AuthMechanismUnsupported(String),

    /// Password authentication was requested but no password is available.
    #[error("password is required")]
    PasswordRequired,

    /// SCRAM server-first message advertised a bogus iteration count.
    #[error("SCRAM iteration count {0} is out of range")]
    ScramBadIterationCount(u32),

    /// The server's SCRAM signature did not match our expectation.
    #[error("SCRAM server signature mismatch")]
    ScramServerSignatureMismatch,

    /// A backend `ErrorResponse`, surfaced with SQLSTATE and severity.
    #[error("{0}")]
    Server(ServerError),

    /// A second query was attempted while one is already active.
    #[error("a query is already in flight on this connection")]
    Busy,

    /// A second `connect` was attempted on the same engine.
    #[error("engine is already connected")]
    AlreadyConnected,

    /// The connection died with an active query or pending operation.
    #[error("connection closed")]
    Disconnected,

    /// Text could not be represented in the configured client encoding.
    #[error("encoding error: {0}")]
    Encoding(String),

    /// The byte stream violated the PostgreSQL v3 protocol.
    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// A decoded backend `ErrorResponse` (or `NoticeResponse`).
///
/// Always carries the five-character SQLSTATE `code` and the `severity`
/// tag; the remaining fields are present when the server sent them.
///
/// See: <https://www.postgresql.org/docs/current/protocol-error-fields.html>
#[derive(Debug, Clone, Default)]
pub struct ServerError {
    pub severity: String,
    pub code: String,
    pub message: String,
    pub detail: Option<String>,
    pub hint: Option<String>,
    pub position: Option<u32>,
    pub where_: Option<String>,
    pub schema: Option<String>,
    pub table: Option<String>,
    pub column: Option<String>,
    pub constraint: Option<String>,
    pub file: Option<String>,
    pub line: Option<String>,
    pub routine: Option<String>,
}

impl std::fmt::Display for ServerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}: {}", self.severity, self.code, self.message)
    }
}

impl std::error::Error for ServerError {}

impl From<ServerError> for Error {
    fn from(value: ServerError) -> Self {
        Error::Server(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_error_display() {
        let err = ServerError {
            severity: "ERROR".into(),
            code: "22012".into(),
            message: "division by zero".into(),
            ..Default::default()
        };
        assert_eq!(err.to_string(), "[ERROR] 22012: division by zero");
    }

    #[test]
    fn error_sources_io() {
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused");
        let err = Error::ConnectFailed(io);
        assert!(std::error::Error::source(&err).is_some());
    }
}
