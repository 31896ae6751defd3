//! # Wire Codec
//!
//! Serialises a [`BusMessage`] into one self-delimited frame and back.
//!
//! ## Frame Layout
//!
//! ```text
//! STANDARD:  key ETX value LF  key ETX value LF ...  _protocol ETX STANDARD LF  EOT
//! AES:       hex( AES-128-ECB-PKCS7( <STANDARD frame without EOT> ) )           EOT
//! ```
//!
//! The AES body is hex armoured because raw ciphertext can contain the EOT
//! delimiter. The key is generated once per process unless one is supplied.

use crate::message::{BusMessage, ReservedAttribute};
use crate::{EOT, ETX, LF};
use ecb::cipher::block_padding::Pkcs7;
use ecb::cipher::{BlockDecryptMut, BlockEncryptMut, KeyInit};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;
use thiserror::Error;

/// AES-128 key length in bytes.
pub const AES_KEY_LEN: usize = 16;

type Aes128EcbEnc = ecb::Encryptor<aes::Aes128>;
type Aes128EcbDec = ecb::Decryptor<aes::Aes128>;

/// Errors from encoding or decoding frames.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CodecError {
    /// A frame line did not contain exactly one ETX separator.
    #[error("frame corruption at line {line}: expected 1 separator, found {separators}")]
    FrameCorruption { line: usize, separators: usize },

    /// The frame body is not valid UTF-8.
    #[error("frame is not valid UTF-8")]
    InvalidUtf8,

    /// An attribute key or value contains a framing byte.
    #[error("attribute '{key}' contains framing byte 0x{byte:02x}")]
    IllegalByte { key: String, byte: u8 },

    /// The AES body could not be decrypted.
    #[error("frame decryption failed")]
    Decryption,

    /// The AES body is not valid hex.
    #[error("frame armour invalid: {0}")]
    Armour(String),

    /// A frame grew past the configured limit before its EOT arrived.
    #[error("frame exceeds {max} bytes")]
    FrameTooLarge { max: usize },

    /// A `_protocol` value names no known codec.
    #[error("unknown codec '{0}'")]
    UnknownProtocol(String),
}

impl CodecError {
    /// True if the error means the byte stream can no longer be trusted.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Self::IllegalByte { .. } | Self::UnknownProtocol(_))
    }
}

/// The codecs known to the bus, by their wire name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum CodecKind {
    /// Cleartext frames.
    #[default]
    Standard,
    /// AES-128 encrypted frames, hex armoured. Peers that put raw
    /// ciphertext on the wire cannot read these frames.
    Aes,
}

impl CodecKind {
    /// Name carried in `_protocol`.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Standard => "STANDARD",
            Self::Aes => "AES",
        }
    }
}

impl fmt::Display for CodecKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for CodecKind {
    type Err = CodecError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "STANDARD" => Ok(Self::Standard),
            "AES" => Ok(Self::Aes),
            other => Err(CodecError::UnknownProtocol(other.to_string())),
        }
    }
}

/// A decoded frame: the message plus the `_protocol` it was stamped with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedFrame {
    /// Message attributes, without `_protocol`.
    pub message: BusMessage,
    /// Value of `_protocol`, if the sender included one.
    pub protocol: Option<String>,
}

impl DecodedFrame {
    /// Parse `protocol` as a codec name.
    ///
    /// # Errors
    ///
    /// [`CodecError::UnknownProtocol`] if the name is not recognised.
    pub fn codec_kind(&self) -> Result<Option<CodecKind>, CodecError> {
        self.protocol.as_deref().map(str::parse).transpose()
    }
}

fn process_key() -> [u8; AES_KEY_LEN] {
    static KEY: OnceLock<[u8; AES_KEY_LEN]> = OnceLock::new();
    *KEY.get_or_init(|| {
        let mut key = [0u8; AES_KEY_LEN];
        rand::thread_rng().fill_bytes(&mut key);
        key
    })
}

/// Frame encoder/decoder for one codec.
#[derive(Clone)]
pub struct WireCodec {
    kind: CodecKind,
    key: Option<[u8; AES_KEY_LEN]>,
}

impl WireCodec {
    /// Cleartext codec.
    #[must_use]
    pub fn standard() -> Self {
        Self {
            kind: CodecKind::Standard,
            key: None,
        }
    }

    /// AES codec using this process's ephemeral key.
    ///
    /// Only peers in the same process share that key; use
    /// [`WireCodec::aes_with_key`] to talk across processes.
    #[must_use]
    pub fn aes() -> Self {
        Self::aes_with_key(process_key())
    }

    /// AES codec with an explicit key.
    #[must_use]
    pub fn aes_with_key(key: [u8; AES_KEY_LEN]) -> Self {
        Self {
            kind: CodecKind::Aes,
            key: Some(key),
        }
    }

    /// Codec for a kind, AES using the process key.
    #[must_use]
    pub fn new(kind: CodecKind) -> Self {
        match kind {
            CodecKind::Standard => Self::standard(),
            CodecKind::Aes => Self::aes(),
        }
    }

    /// Which codec this is.
    #[must_use]
    pub fn kind(&self) -> CodecKind {
        self.kind
    }

    /// Encode one message into a complete frame, EOT included.
    ///
    /// # Errors
    ///
    /// [`CodecError::IllegalByte`] if any key or value contains ETX, LF or EOT.
    pub fn encode(&self, msg: &BusMessage) -> Result<Vec<u8>, CodecError> {
        self.encode_as(msg, self.kind)
    }

    /// Encode with this codec but stamp `_protocol` with `advertised`.
    ///
    /// Discovery announcements travel as cleartext yet name the data codec
    /// of the service they announce.
    ///
    /// # Errors
    ///
    /// As [`WireCodec::encode`].
    pub fn encode_as(&self, msg: &BusMessage, advertised: CodecKind) -> Result<Vec<u8>, CodecError> {
        let plain = plaintext(msg, advertised)?;
        let mut frame = match self.key {
            Some(key) => {
                let cipher = Aes128EcbEnc::new(&key.into()).encrypt_padded_vec_mut::<Pkcs7>(&plain);
                hex::encode(cipher).into_bytes()
            }
            None => plain,
        };
        frame.push(EOT);
        Ok(frame)
    }

    /// Decode one frame. A trailing EOT is accepted and ignored.
    ///
    /// # Errors
    ///
    /// Any fatal [`CodecError`] when the frame is malformed or cannot be
    /// decrypted.
    pub fn decode(&self, frame: &[u8]) -> Result<DecodedFrame, CodecError> {
        let body = frame.strip_suffix(&[EOT]).unwrap_or(frame);
        match self.key {
            Some(key) => {
                let armoured = body.trim_ascii();
                let cipher =
                    hex::decode(armoured).map_err(|e| CodecError::Armour(e.to_string()))?;
                let plain = Aes128EcbDec::new(&key.into())
                    .decrypt_padded_vec_mut::<Pkcs7>(&cipher)
                    .map_err(|_| CodecError::Decryption)?;
                parse(&plain)
            }
            None => parse(body),
        }
    }
}

impl Default for WireCodec {
    fn default() -> Self {
        Self::standard()
    }
}

impl fmt::Debug for WireCodec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WireCodec")
            .field("kind", &self.kind)
            .field("key", &self.key.map(|_| "<redacted>"))
            .finish()
    }
}

fn check(key: &str, text: &str) -> Result<(), CodecError> {
    match text.bytes().find(|b| matches!(*b, ETX | LF | EOT)) {
        Some(byte) => Err(CodecError::IllegalByte {
            key: key.to_string(),
            byte,
        }),
        None => Ok(()),
    }
}

fn plaintext(msg: &BusMessage, advertised: CodecKind) -> Result<Vec<u8>, CodecError> {
    let protocol = ReservedAttribute::Protocol.name();
    let sorted: BTreeMap<&str, &str> = msg.iter().filter(|(k, _)| *k != protocol).collect();

    let mut out = Vec::with_capacity(64 * (sorted.len() + 1));
    for (key, value) in sorted
        .into_iter()
        .chain(std::iter::once((protocol, advertised.name())))
    {
        check(key, key)?;
        check(key, value)?;
        out.extend_from_slice(key.as_bytes());
        out.push(ETX);
        out.extend_from_slice(value.as_bytes());
        out.push(LF);
    }
    Ok(out)
}

fn parse(body: &[u8]) -> Result<DecodedFrame, CodecError> {
    let text = std::str::from_utf8(body).map_err(|_| CodecError::InvalidUtf8)?;
    let protocol_name = ReservedAttribute::Protocol.name();

    let mut attributes = HashMap::new();
    let mut protocol = None;
    for (index, line) in text.split('\n').enumerate() {
        let line = line.strip_suffix('\r').unwrap_or(line);
        if line.trim().is_empty() {
            continue;
        }
        let separators = line.bytes().filter(|b| *b == ETX).count();
        if separators != 1 {
            return Err(CodecError::FrameCorruption {
                line: index + 1,
                separators,
            });
        }
        let Some((key, value)) = line.split_once(char::from(ETX)) else {
            return Err(CodecError::FrameCorruption {
                line: index + 1,
                separators,
            });
        };
        if key == protocol_name {
            protocol = Some(value.to_string());
        } else {
            attributes.insert(key.to_string(), value.to_string());
        }
    }

    Ok(DecodedFrame {
        message: BusMessage::from_attributes(attributes),
        protocol,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::BusMessageBuilder;

    fn sample() -> BusMessage {
        BusMessageBuilder::new()
            .set_message_id("1")
            .set_message_source("here")
            .set_message_destination("there")
            .set_attribute("price", "10.5")
            .unwrap()
            .build()
    }

    #[test]
    fn test_standard_frame_layout() {
        let msg = BusMessageBuilder::new()
            .set_attribute("a", "1")
            .unwrap()
            .build();
        let frame = WireCodec::standard().encode(&msg).unwrap();
        assert_eq!(frame, b"a\x031\n_protocol\x03STANDARD\n\x04".to_vec());
    }

    #[test]
    fn test_standard_round_trip_strips_protocol() {
        let codec = WireCodec::standard();
        let msg = sample();
        let decoded = codec.decode(&codec.encode(&msg).unwrap()).unwrap();

        assert_eq!(decoded.message, msg);
        assert_eq!(decoded.message.get("_protocol"), None);
        assert_eq!(decoded.protocol.as_deref(), Some("STANDARD"));
        assert_eq!(decoded.codec_kind().unwrap(), Some(CodecKind::Standard));
    }

    #[test]
    fn test_encode_rejects_framing_bytes() {
        let codec = WireCodec::standard();
        for bad in ["a\x03b", "a\nb", "a\x04b"] {
            let msg = BusMessageBuilder::new()
                .set_attribute("k", bad)
                .unwrap()
                .build();
            let err = codec.encode(&msg).unwrap_err();
            assert!(matches!(err, CodecError::IllegalByte { ref key, .. } if key == "k"));
            assert!(!err.is_fatal());
        }
    }

    #[test]
    fn test_line_without_separator_is_corruption() {
        let err = WireCodec::standard()
            .decode(b"_id\x031\ngarbage\n\x04")
            .unwrap_err();
        assert_eq!(
            err,
            CodecError::FrameCorruption {
                line: 2,
                separators: 0
            }
        );
        assert!(err.is_fatal());
    }

    #[test]
    fn test_line_with_two_separators_is_corruption() {
        let err = WireCodec::standard().decode(b"a\x03b\x03c\n").unwrap_err();
        assert!(matches!(
            err,
            CodecError::FrameCorruption { separators: 2, .. }
        ));
    }

    #[test]
    fn test_blank_and_crlf_lines_tolerated() {
        let decoded = WireCodec::standard()
            .decode(b"\n_id\x037\r\n\n_type\x03T\n")
            .unwrap();
        assert_eq!(decoded.message.message_id(), Some("7"));
        assert_eq!(decoded.message.message_type(), Some("T"));
        assert_eq!(decoded.protocol, None);
    }

    #[test]
    fn test_empty_value_round_trips() {
        let codec = WireCodec::standard();
        let msg = BusMessageBuilder::new()
            .set_attribute("note", "")
            .unwrap()
            .build();
        let decoded = codec.decode(&codec.encode(&msg).unwrap()).unwrap();
        assert_eq!(decoded.message.get("note"), Some(""));
    }

    #[test]
    fn test_invalid_utf8() {
        let err = WireCodec::standard().decode(b"a\x03\xff\xfe\n").unwrap_err();
        assert_eq!(err, CodecError::InvalidUtf8);
    }

    #[test]
    fn test_aes_round_trip() {
        let codec = WireCodec::aes_with_key([7u8; AES_KEY_LEN]);
        let msg = sample();
        let frame = codec.encode(&msg).unwrap();

        // Only the terminator is a control byte
        assert_eq!(frame.last(), Some(&EOT));
        assert!(frame[..frame.len() - 1].iter().all(u8::is_ascii_hexdigit));

        let decoded = codec.decode(&frame).unwrap();
        assert_eq!(decoded.message, msg);
        assert_eq!(decoded.protocol.as_deref(), Some("AES"));
    }

    #[test]
    fn test_aes_process_key_is_stable() {
        let msg = sample();
        let frame = WireCodec::aes().encode(&msg).unwrap();
        let decoded = WireCodec::new(CodecKind::Aes).decode(&frame).unwrap();
        assert_eq!(decoded.message, msg);
    }

    #[test]
    fn test_aes_wrong_key_fails() {
        let frame = WireCodec::aes_with_key([1u8; AES_KEY_LEN])
            .encode(&sample())
            .unwrap();
        let err = WireCodec::aes_with_key([2u8; AES_KEY_LEN])
            .decode(&frame)
            .unwrap_err();
        assert!(err.is_fatal());
    }

    #[test]
    fn test_aes_rejects_bad_armour() {
        let err = WireCodec::aes_with_key([1u8; AES_KEY_LEN])
            .decode(b"not hex\x04")
            .unwrap_err();
        assert!(matches!(err, CodecError::Armour(_)));
    }

    #[test]
    fn test_encode_as_advertises_other_codec() {
        let codec = WireCodec::standard();
        let frame = codec.encode_as(&sample(), CodecKind::Aes).unwrap();
        let decoded = codec.decode(&frame).unwrap();
        assert_eq!(decoded.codec_kind().unwrap(), Some(CodecKind::Aes));
    }

    #[test]
    fn test_codec_kind_names() {
        assert_eq!("STANDARD".parse::<CodecKind>().unwrap(), CodecKind::Standard);
        assert_eq!("AES".parse::<CodecKind>().unwrap(), CodecKind::Aes);
        assert_eq!(
            "aes".parse::<CodecKind>().unwrap_err(),
            CodecError::UnknownProtocol("aes".into())
        );
        assert_eq!(CodecKind::Aes.to_string(), "AES");
    }

    #[test]
    fn test_codec_kind_serde_names() {
        #[derive(Deserialize)]
        struct Holder {
            codec: CodecKind,
        }
        let holder: Holder = toml::from_str("codec = \"AES\"").unwrap();
        assert_eq!(holder.codec, CodecKind::Aes);
    }

    #[test]
    fn test_debug_hides_key() {
        let rendered = format!("{:?}", WireCodec::aes_with_key([9u8; AES_KEY_LEN]));
        assert!(rendered.contains("redacted"));
        assert!(!rendered.contains('9'));
    }
}
