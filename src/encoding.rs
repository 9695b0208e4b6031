//! Client-side text encoding for query parameters and row fields.
//!
//! PostgreSQL negotiates an encoding label during startup
//! (`client_encoding`). UTF-8 is the fast path; the only other supported
//! label family is Latin-1, handled by a strict single-byte codec that
//! refuses unmappable characters rather than substituting them.

use crate::error::{Error, Result};

/// Text encoding applied symmetrically to outgoing parameters and
/// incoming row fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ClientEncoding {
    #[default]
    Utf8,
    Latin1,
}

impl ClientEncoding {
    /// Resolves an encoding label the way PostgreSQL spells them
    /// (`UTF8`, `LATIN1`) or their common aliases.
    pub fn from_label(label: &str) -> Result<Self> {
        let normalized: String = label
            .chars()
            .filter(|c| c.is_ascii_alphanumeric())
            .map(|c| c.to_ascii_uppercase())
            .collect();
        match normalized.as_str() {
            "UTF8" => Ok(ClientEncoding::Utf8),
            "LATIN1" | "ISO88591" => Ok(ClientEncoding::Latin1),
            _ => Err(Error::Config(format!("unknown encoding label '{label}'"))),
        }
    }

    /// The label sent as `client_encoding` in the startup packet.
    pub fn label(self) -> &'static str {
        match self {
            ClientEncoding::Utf8 => "UTF8",
            ClientEncoding::Latin1 => "LATIN1",
        }
    }

    /// Encodes text for the wire. Fails on characters the encoding
    /// cannot represent.
    pub fn encode(self, text: &str) -> Result<Vec<u8>> {
        match self {
            ClientEncoding::Utf8 => Ok(text.as_bytes().to_vec()),
            ClientEncoding::Latin1 => {
                let mut out = Vec::with_capacity(text.len());
                for c in text.chars() {
                    let cp = c as u32;
                    if cp > 0xFF {
                        return Err(Error::Encoding(format!(
                            "character '{c}' (U+{cp:04X}) is not representable in LATIN1"
                        )));
                    }
                    out.push(cp as u8);
                }
                Ok(out)
            }
        }
    }

    /// Decodes wire bytes into text. Fails on invalid byte sequences.
    pub fn decode(self, bytes: &[u8]) -> Result<String> {
        match self {
            ClientEncoding::Utf8 => std::str::from_utf8(bytes)
                .map(str::to_owned)
                .map_err(|e| Error::Encoding(format!("invalid UTF-8 in row data: {e}"))),
            ClientEncoding::Latin1 => Ok(bytes.iter().map(|&b| b as char).collect()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn utf8_round_trip() {
        let enc = ClientEncoding::Utf8;
        for s in ["", "SELECT 1", "héllo wörld", "日本語", "a\u{1F980}b"] {
            assert_eq!(enc.decode(&enc.encode(s).unwrap()).unwrap(), s);
        }
    }

    #[test]
    fn latin1_round_trip() {
        let enc = ClientEncoding::Latin1;
        let s = "café ±µ";
        assert_eq!(enc.decode(&enc.encode(s).unwrap()).unwrap(), s);
    }

    #[test]
    fn latin1_rejects_unmappable() {
        let err = ClientEncoding::Latin1.encode("日本語").unwrap_err();
        assert!(matches!(err, Error::Encoding(_)));
    }

    #[test]
    fn utf8_rejects_invalid_bytes() {
        let err = ClientEncoding::Utf8.decode(&[0xFF, 0xFE]).unwrap_err();
        assert!(matches!(err, Error::Encoding(_)));
    }

    #[test]
    fn labels_resolve_with_aliases() {
        assert_eq!(
            ClientEncoding::from_label("utf-8").unwrap(),
            ClientEncoding::Utf8
        );
        assert_eq!(
            ClientEncoding::from_label("ISO-8859-1").unwrap(),
            ClientEncoding::Latin1
        );
        assert!(ClientEncoding::from_label("EBCDIC").is_err());
    }
}
