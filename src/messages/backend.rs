//! Logic for handling and representing Postgres backend messages.
//!
//! Incoming bytes accumulate in a [`bytes::BytesMut`]; [`extract_message`]
//! consumes one complete frame at a time and decodes it into the sealed
//! [`BackendMessage`] variants the engine dispatches on.

use bytes::{Buf, Bytes, BytesMut};

use crate::error::{Error, Result, ServerError};

/// Maximum allowed frame size from Postgres (1GiB).
///
/// This is an upper bound to prevent misbehaving servers from
/// allocating excessive memory or causing OOMs.
/// See: <https://github.com/postgres/postgres/blob/879c492480d0e9ad8155c4269f95c5e8add41901/src/include/utils/memutils.h#L40>
const MAX_FRAME_SIZE_BYTES: usize = 1 << 30; // 1GiB

/// Postgres backend messages are framed by a 1-byte message code,
/// followed by a u32 length for the rest of the message body.
///
/// The message code identifies the type of message and the structure
/// of its payload.
///
/// See: <https://www.postgresql.org/docs/current/protocol-message-formats.html>
#[repr(transparent)]
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct MessageCode(u8);

impl MessageCode {
    pub const AUTHENTICATION: Self = Self(b'R');
    pub const BACKEND_KEY_DATA: Self = Self(b'K');
    pub const BIND_COMPLETE: Self = Self(b'2');
    pub const CLOSE_COMPLETE: Self = Self(b'3');
    pub const COMMAND_COMPLETE: Self = Self(b'C');
    pub const COPY_DATA: Self = Self(b'd');
    pub const COPY_DONE: Self = Self(b'c');
    pub const COPY_IN_RESPONSE: Self = Self(b'G');
    pub const COPY_OUT_RESPONSE: Self = Self(b'H');
    pub const DATA_ROW: Self = Self(b'D');
    pub const EMPTY_QUERY_RESPONSE: Self = Self(b'I');
    pub const ERROR_RESPONSE: Self = Self(b'E');
    pub const NO_DATA: Self = Self(b'n');
    pub const NOTICE_RESPONSE: Self = Self(b'N');
    pub const NOTIFICATION_RESPONSE: Self = Self(b'A');
    pub const PARAMETER_DESCRIPTION: Self = Self(b't');
    pub const PARAMETER_STATUS: Self = Self(b'S');
    pub const PARSE_COMPLETE: Self = Self(b'1');
    pub const PORTAL_SUSPENDED: Self = Self(b's');
    pub const READY_FOR_QUERY: Self = Self(b'Z');
    pub const ROW_DESCRIPTION: Self = Self(b'T');
}

impl From<u8> for MessageCode {
    fn from(value: u8) -> Self {
        Self(value)
    }
}

impl From<MessageCode> for u8 {
    fn from(value: MessageCode) -> Self {
        value.0
    }
}

impl std::fmt::Display for MessageCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match *self {
            MessageCode::AUTHENTICATION => "Authentication",
            MessageCode::BACKEND_KEY_DATA => "BackendKeyData",
            MessageCode::BIND_COMPLETE => "BindComplete",
            MessageCode::CLOSE_COMPLETE => "CloseComplete",
            MessageCode::COMMAND_COMPLETE => "CommandComplete",
            MessageCode::COPY_DATA => "CopyData",
            MessageCode::COPY_DONE => "CopyDone",
            MessageCode::COPY_IN_RESPONSE => "CopyInResponse",
            MessageCode::COPY_OUT_RESPONSE => "CopyOutResponse",
            MessageCode::DATA_ROW => "DataRow",
            MessageCode::EMPTY_QUERY_RESPONSE => "EmptyQueryResponse",
            MessageCode::ERROR_RESPONSE => "ErrorResponse",
            MessageCode::NO_DATA => "NoData",
            MessageCode::NOTICE_RESPONSE => "NoticeResponse",
            MessageCode::NOTIFICATION_RESPONSE => "NotificationResponse",
            MessageCode::PARAMETER_DESCRIPTION => "ParameterDescription",
            MessageCode::PARAMETER_STATUS => "ParameterStatus",
            MessageCode::PARSE_COMPLETE => "ParseComplete",
            MessageCode::PORTAL_SUSPENDED => "PortalSuspended",
            MessageCode::READY_FOR_QUERY => "ReadyForQuery",
            MessageCode::ROW_DESCRIPTION => "RowDescription",
            _ => "Unknown",
        };
        write!(f, "{name}({})", self.0 as char)
    }
}

impl std::fmt::Debug for MessageCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "MessageCode({})", self.0 as char)
    }
}

/// A decoded backend message.
///
/// The dispatcher matches exhaustively on this enum; codes the engine has
/// no handling for surface as [`BackendMessage::Unknown`] rather than
/// aborting the connection.
#[derive(Debug)]
pub enum BackendMessage {
    Authentication(AuthRequest),
    ParameterStatus { name: String, value: String },
    BackendKeyData { process_id: u32, secret_key: u32 },
    ReadyForQuery { status: u8 },
    RowDescription(RowDescription),
    DataRow(Vec<Option<Bytes>>),
    CommandComplete { tag: String },
    EmptyQueryResponse,
    NoData,
    ParseComplete,
    BindComplete,
    CloseComplete,
    PortalSuspended,
    ErrorResponse(ServerError),
    NoticeResponse(ServerError),
    NotificationResponse { process_id: u32, channel: String, payload: String },
    CopyInResponse,
    CopyOutResponse,
    CopyData(Bytes),
    CopyDone,
    Unknown { code: MessageCode },
}

/// An authentication sub-protocol request (`R` message payloads).
#[derive(Debug)]
pub enum AuthRequest {
    Ok,
    KerberosV5,
    CleartextPassword,
    Md5Password { salt: [u8; 4] },
    ScmCredential,
    Gss,
    GssContinue,
    Sspi,
    Sasl { mechanisms: Vec<String> },
    SaslContinue(ServerFirst),
    SaslFinal { server_signature: String },
}

impl AuthRequest {
    /// Name used in errors and logs for mechanisms we cannot satisfy.
    pub fn mechanism_name(&self) -> &'static str {
        match self {
            AuthRequest::Ok => "AuthenticationOk",
            AuthRequest::KerberosV5 => "KerberosV5",
            AuthRequest::CleartextPassword => "CleartextPassword",
            AuthRequest::Md5Password { .. } => "MD5Password",
            AuthRequest::ScmCredential => "SCMCredential",
            AuthRequest::Gss => "GSS",
            AuthRequest::GssContinue => "GSSContinue",
            AuthRequest::Sspi => "SSPI",
            AuthRequest::Sasl { .. } => "SASL",
            AuthRequest::SaslContinue(_) => "SASLContinue",
            AuthRequest::SaslFinal { .. } => "SASLFinal",
        }
    }
}

/// The parsed SCRAM server-first message from `AuthenticationSASLContinue`.
#[derive(Debug, Clone)]
pub struct ServerFirst {
    /// The verbatim server-first text, needed for the auth message.
    pub message: String,
    /// Combined client+server nonce (`r=`).
    pub nonce: String,
    /// Base64-encoded salt (`s=`).
    pub salt: String,
    /// Iteration count (`i=`).
    pub rounds: u32,
}

/// One column of a `RowDescription`.
#[derive(Debug, Clone)]
pub struct FieldDescription {
    pub name: String,
    pub table_oid: u32,
    pub column_id: u16,
    pub type_oid: u32,
    pub type_len: i16,
    pub type_modifier: i32,
    pub format: u16,
}

/// The shape of the rows an `Execute` or simple query will produce.
#[derive(Debug, Clone, Default)]
pub struct RowDescription {
    pub fields: Vec<FieldDescription>,
}

impl RowDescription {
    /// Index of the column with the given name, if present.
    pub fn column(&self, name: &str) -> Option<usize> {
        self.fields.iter().position(|f| f.name == name)
    }
}

/// Consumes exactly one complete backend frame from `buf`, if available.
///
/// Returns `Ok(None)` when the buffer does not yet hold a full frame;
/// callers keep appending socket reads and retry. Oversized or malformed
/// frames are protocol errors.
pub fn extract_message(buf: &mut BytesMut) -> Result<Option<BackendMessage>> {
    const HEADER: usize = 5; // code byte + u32 length

    if buf.len() < HEADER {
        return Ok(None);
    }

    let code = MessageCode::from(buf[0]);
    let len = u32::from_be_bytes([buf[1], buf[2], buf[3], buf[4]]) as usize;
    if len < 4 {
        return Err(Error::Protocol(format!(
            "frame length {len} is below the protocol minimum"
        )));
    }
    if len > MAX_FRAME_SIZE_BYTES {
        return Err(Error::Protocol(format!(
            "frame size exceeds {MAX_FRAME_SIZE_BYTES}B"
        )));
    }
    if buf.len() < 1 + len {
        return Ok(None);
    }

    buf.advance(HEADER);
    let body = buf.split_to(len - 4).freeze();
    decode(code, body).map(Some)
}

fn decode(code: MessageCode, mut body: Bytes) -> Result<BackendMessage> {
    let msg = match code {
        MessageCode::AUTHENTICATION => BackendMessage::Authentication(decode_auth(body)?),
        MessageCode::PARAMETER_STATUS => {
            let name = read_cstring(&mut body)?;
            let value = read_cstring(&mut body)?;
            BackendMessage::ParameterStatus { name, value }
        }
        MessageCode::BACKEND_KEY_DATA => {
            need(&body, 8)?;
            BackendMessage::BackendKeyData {
                process_id: body.get_u32(),
                secret_key: body.get_u32(),
            }
        }
        MessageCode::READY_FOR_QUERY => {
            need(&body, 1)?;
            BackendMessage::ReadyForQuery { status: body.get_u8() }
        }
        MessageCode::ROW_DESCRIPTION => BackendMessage::RowDescription(decode_row_description(body)?),
        MessageCode::DATA_ROW => BackendMessage::DataRow(decode_data_row(body)?),
        MessageCode::COMMAND_COMPLETE => BackendMessage::CommandComplete {
            tag: read_cstring(&mut body)?,
        },
        MessageCode::EMPTY_QUERY_RESPONSE => BackendMessage::EmptyQueryResponse,
        MessageCode::NO_DATA => BackendMessage::NoData,
        MessageCode::PARSE_COMPLETE => BackendMessage::ParseComplete,
        MessageCode::BIND_COMPLETE => BackendMessage::BindComplete,
        MessageCode::CLOSE_COMPLETE => BackendMessage::CloseComplete,
        MessageCode::PORTAL_SUSPENDED => BackendMessage::PortalSuspended,
        MessageCode::ERROR_RESPONSE => BackendMessage::ErrorResponse(decode_error_fields(body)?),
        MessageCode::NOTICE_RESPONSE => BackendMessage::NoticeResponse(decode_error_fields(body)?),
        MessageCode::NOTIFICATION_RESPONSE => {
            need(&body, 4)?;
            let process_id = body.get_u32();
            let channel = read_cstring(&mut body)?;
            let payload = read_cstring(&mut body)?;
            BackendMessage::NotificationResponse { process_id, channel, payload }
        }
        MessageCode::COPY_IN_RESPONSE => BackendMessage::CopyInResponse,
        MessageCode::COPY_OUT_RESPONSE => BackendMessage::CopyOutResponse,
        MessageCode::COPY_DATA => BackendMessage::CopyData(body),
        MessageCode::COPY_DONE => BackendMessage::CopyDone,
        code => BackendMessage::Unknown { code },
    };
    Ok(msg)
}

fn decode_auth(mut body: Bytes) -> Result<AuthRequest> {
    need(&body, 4)?;
    let auth_code = body.get_u32();
    let req = match auth_code {
        0 => AuthRequest::Ok,
        2 => AuthRequest::KerberosV5,
        3 => AuthRequest::CleartextPassword,
        5 => {
            need(&body, 4)?;
            let mut salt = [0u8; 4];
            body.copy_to_slice(&mut salt);
            AuthRequest::Md5Password { salt }
        }
        6 => AuthRequest::ScmCredential,
        7 => AuthRequest::Gss,
        8 => AuthRequest::GssContinue,
        9 => AuthRequest::Sspi,
        10 => {
            let mechanisms = body
                .split(|b| *b == 0)
                .filter(|m| !m.is_empty())
                .map(|m| String::from_utf8_lossy(m).into_owned())
                .collect();
            AuthRequest::Sasl { mechanisms }
        }
        11 => AuthRequest::SaslContinue(parse_server_first(&body)?),
        12 => {
            let text = std::str::from_utf8(&body)
                .map_err(|e| Error::Protocol(format!("invalid UTF-8 in SASL final: {e}")))?;
            let server_signature = text
                .strip_prefix("v=")
                .ok_or_else(|| Error::Protocol("SASL final message lacks 'v=' field".into()))?
                .to_string();
            AuthRequest::SaslFinal { server_signature }
        }
        code => {
            return Err(Error::Protocol(format!(
                "unexpected authentication request code {code}"
            )))
        }
    };
    Ok(req)
}

fn parse_server_first(body: &[u8]) -> Result<ServerFirst> {
    let message = std::str::from_utf8(body)
        .map_err(|e| Error::Protocol(format!("invalid UTF-8 in SASL continue: {e}")))?
        .to_string();

    let mut nonce = None;
    let mut salt = None;
    let mut rounds = None;
    for part in message.split(',') {
        if let Some(value) = part.strip_prefix("r=") {
            nonce = Some(value.to_string());
        } else if let Some(value) = part.strip_prefix("s=") {
            salt = Some(value.to_string());
        } else if let Some(value) = part.strip_prefix("i=") {
            rounds = Some(value.parse::<u32>().map_err(|e| {
                Error::Protocol(format!("invalid SCRAM iteration count '{value}': {e}"))
            })?);
        }
    }

    Ok(ServerFirst {
        nonce: nonce.ok_or_else(|| Error::Protocol("server-first message lacks nonce".into()))?,
        salt: salt.ok_or_else(|| Error::Protocol("server-first message lacks salt".into()))?,
        rounds: rounds
            .ok_or_else(|| Error::Protocol("server-first message lacks iteration count".into()))?,
        message,
    })
}

fn decode_row_description(mut body: Bytes) -> Result<RowDescription> {
    need(&body, 2)?;
    let count = body.get_u16() as usize;
    let mut fields = Vec::with_capacity(count);
    for _ in 0..count {
        let name = read_cstring(&mut body)?;
        need(&body, 18)?;
        fields.push(FieldDescription {
            name,
            table_oid: body.get_u32(),
            column_id: body.get_u16(),
            type_oid: body.get_u32(),
            type_len: body.get_i16(),
            type_modifier: body.get_i32(),
            format: body.get_u16(),
        });
    }
    Ok(RowDescription { fields })
}

fn decode_data_row(mut body: Bytes) -> Result<Vec<Option<Bytes>>> {
    need(&body, 2)?;
    let count = body.get_u16() as usize;
    let mut values = Vec::with_capacity(count);
    for _ in 0..count {
        need(&body, 4)?;
        let len = body.get_i32();
        if len < 0 {
            values.push(None);
        } else {
            let len = len as usize;
            need(&body, len)?;
            values.push(Some(body.split_to(len)));
        }
    }
    Ok(values)
}

fn decode_error_fields(body: Bytes) -> Result<ServerError> {
    let mut err = ServerError::default();
    let mut rest = body;
    loop {
        if rest.is_empty() || rest[0] == 0 {
            break;
        }
        let tag = rest[0];
        rest.advance(1);
        let value = read_cstring(&mut rest)?;
        match tag {
            b'S' => err.severity = value,
            // 'V' is the non-localized severity; prefer it when present.
            b'V' => err.severity = value,
            b'C' => err.code = value,
            b'M' => err.message = value,
            b'D' => err.detail = Some(value),
            b'H' => err.hint = Some(value),
            b'P' => err.position = value.parse().ok(),
            b'W' => err.where_ = Some(value),
            b's' => err.schema = Some(value),
            b't' => err.table = Some(value),
            b'c' => err.column = Some(value),
            b'n' => err.constraint = Some(value),
            b'F' => err.file = Some(value),
            b'L' => err.line = Some(value),
            b'R' => err.routine = Some(value),
            _ => {}
        }
    }
    Ok(err)
}

/// Reads a null-terminated string from a `Bytes` buffer.
///
/// The returned string excludes the null terminator. Returns an error
/// if no null terminator is found or if the bytes are not valid UTF-8.
pub(crate) fn read_cstring(bytes: &mut Bytes) -> Result<String> {
    let Some(end) = bytes.iter().position(|&b| b == 0) else {
        return Err(Error::Protocol("null terminator missing".into()));
    };

    let raw = bytes.split_to(end + 1);
    String::from_utf8(raw[..end].to_vec())
        .map_err(|e| Error::Protocol(format!("invalid UTF-8 in protocol string: {e}")))
}

fn need(buf: &Bytes, n: usize) -> Result<()> {
    if buf.remaining() < n {
        Err(Error::Protocol(format!(
            "truncated message body: need {n} bytes, have {}",
            buf.remaining()
        )))
    } else {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use bytes::{BufMut, BytesMut};

    use super::*;

    fn frame(code: u8, body: &[u8]) -> BytesMut {
        let mut buf = BytesMut::new();
        buf.put_u8(code);
        buf.put_u32(body.len() as u32 + 4);
        buf.put_slice(body);
        buf
    }

    #[test]
    fn incomplete_frame_yields_none() {
        let mut buf = BytesMut::new();
        buf.put_u8(b'Z');
        buf.put_u32(5);
        assert!(extract_message(&mut buf).unwrap().is_none());
        // Frame completes once the body byte arrives.
        buf.put_u8(b'I');
        let msg = extract_message(&mut buf).unwrap().unwrap();
        assert!(matches!(msg, BackendMessage::ReadyForQuery { status: b'I' }));
        assert!(buf.is_empty());
    }

    #[test]
    fn rejects_oversized_frame() {
        let mut buf = BytesMut::new();
        buf.put_u8(b'D');
        buf.put_u32(MAX_FRAME_SIZE_BYTES as u32 + 1);
        assert!(extract_message(&mut buf).is_err());
    }

    #[test]
    fn decodes_parameter_status() {
        let mut buf = frame(b'S', b"server_version\017.2\0");
        let msg = extract_message(&mut buf).unwrap().unwrap();
        match msg {
            BackendMessage::ParameterStatus { name, value } => {
                assert_eq!(name, "server_version");
                assert_eq!(value, "17.2");
            }
            other => panic!("unexpected message {other:?}"),
        }
    }

    #[test]
    fn decodes_data_row_with_null() {
        let mut body = BytesMut::new();
        body.put_u16(2);
        body.put_i32(1);
        body.put_slice(b"1");
        body.put_i32(-1);
        let mut buf = frame(b'D', &body);
        let msg = extract_message(&mut buf).unwrap().unwrap();
        match msg {
            BackendMessage::DataRow(values) => {
                assert_eq!(values.len(), 2);
                assert_eq!(values[0].as_deref(), Some(&b"1"[..]));
                assert!(values[1].is_none());
            }
            other => panic!("unexpected message {other:?}"),
        }
    }

    #[test]
    fn decodes_error_response_fields() {
        let mut buf = frame(
            b'E',
            b"SERROR\0VERROR\0C22012\0Mdivision by zero\0P8\0\0",
        );
        let msg = extract_message(&mut buf).unwrap().unwrap();
        match msg {
            BackendMessage::ErrorResponse(err) => {
                assert_eq!(err.severity, "ERROR");
                assert_eq!(err.code, "22012");
                assert_eq!(err.message, "division by zero");
                assert_eq!(err.position, Some(8));
            }
            other => panic!("unexpected message {other:?}"),
        }
    }

    #[test]
    fn decodes_sasl_continue() {
        let body = b"\x00\x00\x00\x0br=abc123,s=c2FsdA==,i=4096";
        let mut buf = frame(b'R', body);
        let msg = extract_message(&mut buf).unwrap().unwrap();
        match msg {
            BackendMessage::Authentication(AuthRequest::SaslContinue(first)) => {
                assert_eq!(first.nonce, "abc123");
                assert_eq!(first.salt, "c2FsdA==");
                assert_eq!(first.rounds, 4096);
                assert_eq!(first.message, "r=abc123,s=c2FsdA==,i=4096");
            }
            other => panic!("unexpected message {other:?}"),
        }
    }

    #[test]
    fn decodes_sasl_mechanism_list() {
        let mut buf = frame(b'R', b"\x00\x00\x00\x0aSCRAM-SHA-256\0SCRAM-SHA-256-PLUS\0\0");
        let msg = extract_message(&mut buf).unwrap().unwrap();
        match msg {
            BackendMessage::Authentication(AuthRequest::Sasl { mechanisms }) => {
                assert_eq!(mechanisms, vec!["SCRAM-SHA-256", "SCRAM-SHA-256-PLUS"]);
            }
            other => panic!("unexpected message {other:?}"),
        }
    }

    #[test]
    fn unknown_code_surfaces_without_error() {
        let mut buf = frame(b'!', b"whatever");
        let msg = extract_message(&mut buf).unwrap().unwrap();
        assert!(matches!(msg, BackendMessage::Unknown { .. }));
    }

    #[test]
    fn two_frames_extract_in_order() {
        let mut buf = frame(b'1', b"");
        buf.extend_from_slice(&frame(b'2', b""));
        assert!(matches!(
            extract_message(&mut buf).unwrap().unwrap(),
            BackendMessage::ParseComplete
        ));
        assert!(matches!(
            extract_message(&mut buf).unwrap().unwrap(),
            BackendMessage::BindComplete
        ));
        assert!(extract_message(&mut buf).unwrap().is_none());
    }
}
