//! Logic for building and framing Postgres frontend messages.
//!
//! All outgoing messages are appended to a single [`FrontendSink`] buffer
//! and flushed to the transport once per dispatch tick, so the messages of
//! one query reach the wire in program order.

use bytes::{BufMut, Bytes, BytesMut};

pub const SSL_REQUEST: &[u8] = &[
    0x00, 0x00, 0x00, 0x08, // length: 8
    0x04, 0xD2, 0x16, 0x2F, // code: 80877103
];

/// Protocol version 3.0, encoded with the major version in the upper
/// 16 bits and the minor version in the lower 16 bits.
pub const PROTOCOL_VERSION: u32 = 3 << 16;

/// Postgres frontend messages are framed by a 1 byte message code,
/// followed by a u32 integer delineating the length of the rest of
/// the message.
///
/// The message code identifies the type of message and format of its
/// payload.
///
/// For more information, see the official Postgres docs:
/// <https://www.postgresql.org/docs/current/protocol-message-formats.html>
#[repr(transparent)]
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct MessageCode(u8);

impl MessageCode {
    pub const BIND: Self = Self(b'B');
    pub const CLOSE: Self = Self(b'C');
    pub const COPY_DATA: Self = Self(b'd');
    pub const COPY_DONE: Self = Self(b'c');
    pub const COPY_FAIL: Self = Self(b'f');
    pub const DESCRIBE: Self = Self(b'D');
    pub const EXECUTE: Self = Self(b'E');
    pub const FLUSH: Self = Self(b'H');
    pub const PARSE: Self = Self(b'P');
    pub const PASSWORD_MESSAGE: Self = Self(b'p');
    pub const QUERY: Self = Self(b'Q');
    pub const SASL_RESPONSE: Self = Self(b'p');
    pub const SYNC: Self = Self(b'S');
    pub const TERMINATE: Self = Self(b'X');

    #[inline]
    pub fn frame(self, buf: &mut BytesMut, payload_fn: impl FnOnce(&mut BytesMut)) {
        buf.put_u8(self.0);
        frame(buf, payload_fn);
    }
}

impl From<MessageCode> for u8 {
    fn from(value: MessageCode) -> Self {
        value.0
    }
}

impl std::fmt::Debug for MessageCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "MessageCode({})", self.0 as char)
    }
}

/// Frames a payload with its u32 length prefix, backpatched after the
/// payload closure runs.
#[inline]
pub fn frame(buf: &mut BytesMut, payload_fn: impl FnOnce(&mut BytesMut)) {
    let base = buf.len();
    buf.put_u32(0);

    payload_fn(buf);

    let len = (buf.len() - base) as u32;
    buf[base..base + std::mem::size_of::<u32>()].copy_from_slice(&len.to_be_bytes());
}

#[inline]
pub(crate) fn put_cstring(b: &mut impl BufMut, src: &[u8]) {
    b.put_slice(src);
    b.put_u8(0);
}

/// The outgoing byte sink with buffered message building.
///
/// Provides methods to construct Postgres frontend protocol messages;
/// the transport drains the buffer with a single write per flush.
#[derive(Debug, Default)]
pub struct FrontendSink {
    buf: BytesMut,
}

impl FrontendSink {
    pub fn new() -> Self {
        FrontendSink { buf: BytesMut::new() }
    }

    pub fn with_capacity(capacity: usize) -> Self {
        FrontendSink {
            buf: BytesMut::with_capacity(capacity),
        }
    }

    /// Takes the buffered bytes, leaving the sink empty.
    pub fn take(&mut self) -> Bytes {
        self.buf.split().freeze()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Adds the 8-byte SSLRequest packet.
    pub fn put_ssl_request(&mut self) -> &mut Self {
        self.buf.put_slice(SSL_REQUEST);
        self
    }

    /// Adds the startup packet (no message code byte).
    ///
    /// # Arguments
    ///
    /// * `params` - key/value startup parameters (`user`, `database`, ...)
    pub fn put_startup(&mut self, params: &[(String, String)]) -> &mut Self {
        frame(&mut self.buf, |b| {
            b.put_u32(PROTOCOL_VERSION);
            for (key, val) in params {
                put_cstring(b, key.as_bytes());
                put_cstring(b, val.as_bytes());
            }
            b.put_u8(0);
        });
        self
    }

    /// Adds a cleartext or MD5 password response.
    pub fn put_password(&mut self, password: &[u8]) -> &mut Self {
        MessageCode::PASSWORD_MESSAGE.frame(&mut self.buf, |b| {
            put_cstring(b, password);
        });
        self
    }

    /// Adds a SASLInitialResponse carrying the mechanism name and the
    /// client-first message.
    pub fn put_sasl_initial_response(&mut self, mechanism: &str, data: &[u8]) -> &mut Self {
        MessageCode::SASL_RESPONSE.frame(&mut self.buf, |b| {
            put_cstring(b, mechanism.as_bytes());
            b.put_u32(data.len() as u32);
            b.put_slice(data);
        });
        self
    }

    /// Adds a SASLResponse carrying the client-final message.
    pub fn put_sasl_response(&mut self, data: &[u8]) -> &mut Self {
        MessageCode::SASL_RESPONSE.frame(&mut self.buf, |b| {
            b.put_slice(data);
        });
        self
    }

    /// Adds a simple query message.
    ///
    /// # Arguments
    ///
    /// * `stmt` - SQL statement, already in the client encoding
    pub fn put_query(&mut self, stmt: &[u8]) -> &mut Self {
        MessageCode::QUERY.frame(&mut self.buf, |b| {
            put_cstring(b, stmt);
        });
        self
    }

    /// Adds a Parse message for prepared statement creation.
    ///
    /// # Arguments
    ///
    /// * `name` - Name for the prepared statement (empty for unnamed)
    /// * `stmt` - SQL statement text, already in the client encoding
    /// * `param_types` - OIDs of parameter data types (empty to infer)
    pub fn put_parse(&mut self, name: &[u8], stmt: &[u8], param_types: &[u32]) -> &mut Self {
        MessageCode::PARSE.frame(&mut self.buf, |b| {
            put_cstring(b, name);
            put_cstring(b, stmt);

            b.put_u16(param_types.len() as u16);
            for param_type in param_types {
                b.put_u32(*param_type);
            }
        });
        self
    }

    /// Adds a Bind message with all parameters in text format.
    ///
    /// # Arguments
    ///
    /// * `portal_name` - Name for the portal (empty for unnamed)
    /// * `stmt_name` - Name of the prepared statement to bind
    /// * `params` - Parameter values (None for NULL)
    pub fn put_bind(
        &mut self,
        portal_name: &[u8],
        stmt_name: &[u8],
        params: &[Option<Vec<u8>>],
    ) -> &mut Self {
        MessageCode::BIND.frame(&mut self.buf, |b| {
            put_cstring(b, portal_name);
            put_cstring(b, stmt_name);

            // Zero format codes: all parameters use the default (text).
            b.put_u16(0);

            b.put_u16(params.len() as u16);
            for param in params {
                match param {
                    Some(param) => {
                        b.put_u32(param.len() as u32);
                        b.put_slice(param);
                    }
                    None => {
                        b.put_i32(-1);
                    }
                }
            }

            // Zero result format codes: all columns come back as text.
            b.put_u16(0);
        });
        self
    }

    /// Adds a Describe message.
    ///
    /// # Arguments
    ///
    /// * `describe_kind` - 'S' for statement or 'P' for portal
    /// * `name` - Name of the statement or portal to describe
    pub fn put_describe(&mut self, describe_kind: u8, name: &[u8]) -> &mut Self {
        MessageCode::DESCRIBE.frame(&mut self.buf, |b| {
            b.put_u8(describe_kind);
            put_cstring(b, name);
        });
        self
    }

    /// Adds an Execute message for a bound portal.
    ///
    /// # Arguments
    ///
    /// * `name` - Name of the portal to execute
    /// * `max_rows` - Maximum number of rows to return (0 for unlimited)
    pub fn put_execute(&mut self, name: &[u8], max_rows: u32) -> &mut Self {
        MessageCode::EXECUTE.frame(&mut self.buf, |b| {
            put_cstring(b, name);
            b.put_u32(max_rows);
        });
        self
    }

    /// Adds a Close message.
    ///
    /// # Arguments
    ///
    /// * `close_kind` - 'S' for statement or 'P' for portal
    /// * `name` - Name of the statement or portal to close
    pub fn put_close(&mut self, close_kind: u8, name: &[u8]) -> &mut Self {
        MessageCode::CLOSE.frame(&mut self.buf, |b| {
            b.put_u8(close_kind);
            put_cstring(b, name);
        });
        self
    }

    /// Adds a Sync message to end an extended query protocol sequence.
    pub fn put_sync(&mut self) -> &mut Self {
        MessageCode::SYNC.frame(&mut self.buf, |_| {});
        self
    }

    /// Adds a Flush message to force sending buffered responses.
    pub fn put_flush(&mut self) -> &mut Self {
        MessageCode::FLUSH.frame(&mut self.buf, |_| {});
        self
    }

    /// Adds a CopyData message carrying one chunk of COPY IN payload.
    pub fn put_copy_data(&mut self, data: &[u8]) -> &mut Self {
        MessageCode::COPY_DATA.frame(&mut self.buf, |b| {
            b.put_slice(data);
        });
        self
    }

    /// Adds a CopyDone message ending a COPY IN stream.
    pub fn put_copy_done(&mut self) -> &mut Self {
        MessageCode::COPY_DONE.frame(&mut self.buf, |_| {});
        self
    }

    /// Adds a CopyFail message aborting a COPY IN stream.
    pub fn put_copy_fail(&mut self, reason: &str) -> &mut Self {
        MessageCode::COPY_FAIL.frame(&mut self.buf, |b| {
            put_cstring(b, reason.as_bytes());
        });
        self
    }

    /// Adds a Terminate message for graceful shutdown.
    pub fn put_terminate(&mut self) -> &mut Self {
        MessageCode::TERMINATE.frame(&mut self.buf, |_| {});
        self
    }
}

#[cfg(test)]
mod tests {
    use bytes::Buf;

    use super::*;

    /// Helper macro for asserting a slice or string from the buffer.
    /// Usage: `assert_buf_eq!(sink, b"STMT\0");`
    macro_rules! assert_buf_eq {
        ($sink:expr, $expected:expr) => {{
            let len = $expected.len();
            let got = $sink.buf.copy_to_bytes(len);
            assert_eq!(&$expected[..], &got[..]);
        }};
    }

    #[test]
    fn test_put_ssl_request() {
        let mut sink = FrontendSink::new();
        sink.put_ssl_request();

        assert_eq!(8, sink.buf.get_u32());
        assert_eq!(80877103, sink.buf.get_u32());
    }

    #[test]
    fn test_put_startup() {
        let mut sink = FrontendSink::new();
        sink.put_startup(&[
            ("user".into(), "postgres".into()),
            ("database".into(), "db".into()),
        ]);

        assert_eq!(35, sink.buf.get_u32());
        assert_eq!(PROTOCOL_VERSION, sink.buf.get_u32());
        assert_buf_eq!(sink, b"user\0postgres\0");
        assert_buf_eq!(sink, b"database\0db\0");
        assert_eq!(0, sink.buf.get_u8());
    }

    #[test]
    fn test_put_password() {
        let mut sink = FrontendSink::new();
        sink.put_password(b"secret");

        assert_eq!(b'p', sink.buf.get_u8());
        assert_eq!(11, sink.buf.get_u32());
        assert_buf_eq!(sink, b"secret\0");
    }

    #[test]
    fn test_put_sasl_initial_response() {
        let mut sink = FrontendSink::new();
        sink.put_sasl_initial_response("SCRAM-SHA-256", b"n,,n=,r=abc");

        assert_eq!(b'p', sink.buf.get_u8());
        assert_eq!(4 + 14 + 4 + 11, sink.buf.get_u32());
        assert_buf_eq!(sink, b"SCRAM-SHA-256\0");
        assert_eq!(11, sink.buf.get_u32());
        assert_buf_eq!(sink, b"n,,n=,r=abc");
    }

    #[test]
    fn test_put_query() {
        let mut sink = FrontendSink::new();
        sink.put_query(b"SELECT 1");

        assert_eq!(b'Q', sink.buf.get_u8());
        assert_eq!(13, sink.buf.get_u32());
        assert_buf_eq!(sink, b"SELECT 1\0");
    }

    #[test]
    fn test_put_parse() {
        let mut sink = FrontendSink::new();
        sink.put_parse(b"", b"SELECT $1", &[]);

        assert_eq!(b'P', sink.buf.get_u8());
        assert_eq!(17, sink.buf.get_u32());
        assert_buf_eq!(sink, b"\0");
        assert_buf_eq!(sink, b"SELECT $1\0");
        assert_eq!(0, sink.buf.get_u16());
    }

    #[test]
    fn test_put_bind() {
        let mut sink = FrontendSink::new();
        sink.put_bind(b"", b"", &[Some(b"42".to_vec()), None]);

        assert_eq!(b'B', sink.buf.get_u8());
        assert_eq!(22, sink.buf.get_u32());

        assert_buf_eq!(sink, b"\0");
        assert_buf_eq!(sink, b"\0");

        assert_eq!(0, sink.buf.get_u16());

        assert_eq!(2, sink.buf.get_u16());
        assert_eq!(2, sink.buf.get_u32());
        assert_buf_eq!(sink, b"42");
        assert_eq!(-1, sink.buf.get_i32());

        assert_eq!(0, sink.buf.get_u16());
    }

    #[test]
    fn test_put_describe_portal() {
        let mut sink = FrontendSink::new();
        sink.put_describe(b'P', b"");

        assert_eq!(b'D', sink.buf.get_u8());
        assert_eq!(6, sink.buf.get_u32());
        assert_eq!(b'P', sink.buf.get_u8());
        assert_buf_eq!(sink, b"\0");
    }

    #[test]
    fn test_put_execute() {
        let mut sink = FrontendSink::new();
        sink.put_execute(b"", 0);

        assert_eq!(b'E', sink.buf.get_u8());
        assert_eq!(9, sink.buf.get_u32());
        assert_buf_eq!(sink, b"\0");
        assert_eq!(0, sink.buf.get_u32());
    }

    #[test]
    fn test_put_close_stmt() {
        let mut sink = FrontendSink::new();
        sink.put_close(b'S', b"");

        assert_eq!(b'C', sink.buf.get_u8());
        assert_eq!(6, sink.buf.get_u32());
        assert_eq!(b'S', sink.buf.get_u8());
        assert_buf_eq!(sink, b"\0");
    }

    #[test]
    fn test_put_sync() {
        let mut sink = FrontendSink::new();
        sink.put_sync();

        assert_eq!(b'S', sink.buf.get_u8());
        assert_eq!(4, sink.buf.get_u32());
    }

    #[test]
    fn test_put_copy_data() {
        let mut sink = FrontendSink::new();
        sink.put_copy_data(b"1\tfoo\n");

        assert_eq!(b'd', sink.buf.get_u8());
        assert_eq!(10, sink.buf.get_u32());
        assert_buf_eq!(sink, b"1\tfoo\n");
    }

    #[test]
    fn test_put_terminate() {
        let mut sink = FrontendSink::new();
        sink.put_terminate();

        assert_eq!(b'X', sink.buf.get_u8());
        assert_eq!(4, sink.buf.get_u32());
    }

    #[test]
    fn test_take_drains_buffer() {
        let mut sink = FrontendSink::new();
        sink.put_sync();
        let bytes = sink.take();
        assert_eq!(&bytes[..], &[b'S', 0, 0, 0, 4]);
        assert!(sink.is_empty());
    }

    #[test]
    fn test_pipeline_order_preserved() {
        let mut sink = FrontendSink::new();
        sink.put_parse(b"", b"SELECT 1", &[])
            .put_bind(b"", b"", &[])
            .put_describe(b'P', b"")
            .put_execute(b"", 0)
            .put_close(b'S', b"")
            .put_sync();

        let bytes = sink.take();
        let codes: Vec<u8> = {
            let mut out = Vec::new();
            let mut rest = &bytes[..];
            while !rest.is_empty() {
                out.push(rest[0]);
                let len = u32::from_be_bytes(rest[1..5].try_into().unwrap()) as usize;
                rest = &rest[1 + len..];
            }
            out
        };
        assert_eq!(codes, vec![b'P', b'B', b'D', b'E', b'C', b'S']);
    }
}
