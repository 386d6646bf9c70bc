//! Rights-management licence records.
//!
//! Publish licence (inside the transform's primary instance data):
//! ```text
//! [4 bytes: header length (i32 LE), counts itself]
//! [header length - 4 bytes: extra header, preserved verbatim]
//! [length-prefixed UTF-8 licence, padded to 4 bytes]
//! ```
//!
//! Use licence (one `EUL-*` stream per user):
//! ```text
//! [4 bytes: header length (i32 LE), at least 8]
//! [4 bytes: user name byte length (i32 LE)]
//! [header length - 8 bytes: extra header, skipped]
//! [user name: base64 of UTF-16LE "<kind>:<name>", padded to 4 bytes]
//! [length-prefixed UTF-8 licence, padded to 4 bytes]
//! ```

use std::fmt;
use std::io::{Cursor, Read};
use std::str::FromStr;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use cfs_types::wire;
use cfs_types::{StorageError, StorageResult};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Prefix of every use-licence stream name.
pub const USE_LICENSE_PREFIX: &str = "EUL-";

/// Longest licence accepted, in characters.
pub const MAX_LICENSE_CHARS: usize = 1_000_000;

const MAX_LICENSE_BYTES: usize = MAX_LICENSE_CHARS * 4;
const USE_LICENSE_HEADER_LEN: i32 = 8;
const PUBLISH_LICENSE_HEADER_LEN: usize = 4;
const BASE32_ALPHABET: &[u8; 32] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ234567";

/// How a content user was authenticated.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AuthenticationKind {
    Windows,
    Passport,
    WindowsPassport,
    Internal,
}

impl AuthenticationKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Windows => "Windows",
            Self::Passport => "Passport",
            Self::WindowsPassport => "WindowsPassport",
            Self::Internal => "Internal",
        }
    }

    /// Only these kinds can own a stored use licence.
    pub fn can_hold_use_license(self) -> bool {
        matches!(self, Self::Windows | Self::Passport)
    }
}

impl fmt::Display for AuthenticationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AuthenticationKind {
    type Err = StorageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        [
            Self::Windows,
            Self::Passport,
            Self::WindowsPassport,
            Self::Internal,
        ]
        .into_iter()
        .find(|kind| kind.as_str().eq_ignore_ascii_case(s))
        .ok_or_else(|| StorageError::corrupt(format!("unknown authentication kind {s:?}")))
    }
}

/// The user a use licence was issued to.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ContentUser {
    pub name: String,
    pub kind: AuthenticationKind,
}

impl ContentUser {
    pub fn new(name: impl Into<String>, kind: AuthenticationKind) -> Self {
        Self {
            name: name.into(),
            kind,
        }
    }

    /// Same user: equal kind, names compared case-insensitively.
    pub fn matches(&self, other: &ContentUser) -> bool {
        self.kind == other.kind && self.name.to_lowercase() == other.name.to_lowercase()
    }

    /// Base64 of the UTF-16LE text `"<kind>:<name>"`.
    pub fn encode(&self) -> String {
        let text = format!("{}:{}", self.kind, self.name);
        let bytes: Vec<u8> = text.encode_utf16().flat_map(u16::to_le_bytes).collect();
        STANDARD.encode(bytes)
    }

    pub fn decode(encoded: &str) -> StorageResult<Self> {
        let bytes = STANDARD
            .decode(encoded)
            .map_err(|e| StorageError::corrupt(format!("user name is not base64: {e}")))?;
        if bytes.len() % 2 != 0 {
            return Err(StorageError::corrupt("user name has odd UTF-16 length"));
        }
        let units: Vec<u16> = bytes
            .chunks_exact(2)
            .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
            .collect();
        let text = String::from_utf16(&units)
            .map_err(|_| StorageError::corrupt("user name is not valid UTF-16"))?;
        let (kind, name) = text
            .split_once(':')
            .ok_or_else(|| StorageError::corrupt(format!("user name {text:?} has no kind")))?;
        Ok(Self::new(name, kind.parse()?))
    }
}

impl fmt::Display for ContentUser {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind, self.name)
    }
}

/// A publish licence plus the header bytes it was stored with.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub(crate) struct PublishLicense {
    pub extra_header: Vec<u8>,
    pub license: String,
}

fn check_license_len(license: &str) -> StorageResult<()> {
    let chars = license.chars().count();
    if chars > MAX_LICENSE_CHARS {
        return Err(StorageError::Argument(format!(
            "licence of {chars} characters exceeds {MAX_LICENSE_CHARS}"
        )));
    }
    Ok(())
}

fn read_license<R: Read + ?Sized>(reader: &mut R) -> StorageResult<String> {
    let (license, _) = wire::read_utf8_string(reader, MAX_LICENSE_BYTES)?;
    if license.chars().count() > MAX_LICENSE_CHARS {
        return Err(StorageError::corrupt("stored licence exceeds the size limit"));
    }
    Ok(license)
}

impl PublishLicense {
    pub fn encode(&self) -> StorageResult<Vec<u8>> {
        check_license_len(&self.license)?;
        let header_len = i32::try_from(PUBLISH_LICENSE_HEADER_LEN + self.extra_header.len())
            .map_err(|_| StorageError::Argument("publish licence header too large".into()))?;
        let mut out = Vec::new();
        wire::write_i32(&mut out, header_len)?;
        out.extend_from_slice(&self.extra_header);
        wire::write_utf8_string(&mut out, &self.license)?;
        Ok(out)
    }

    pub fn decode<R: Read + ?Sized>(reader: &mut R) -> StorageResult<Self> {
        let header_len = wire::read_length(reader, "publish licence header length")?;
        if header_len < PUBLISH_LICENSE_HEADER_LEN {
            return Err(StorageError::corrupt(format!(
                "publish licence header length {header_len} below {PUBLISH_LICENSE_HEADER_LEN}"
            )));
        }
        let extra_header = wire::read_bytes(
            reader,
            header_len - PUBLISH_LICENSE_HEADER_LEN,
            "publish licence header",
        )?;
        let license = read_license(reader)?;
        Ok(Self {
            extra_header,
            license,
        })
    }
}

/// Serialize a use licence record. Only Windows and Passport users qualify.
pub(crate) fn encode_use_license(user: &ContentUser, license: &str) -> StorageResult<Vec<u8>> {
    if !user.kind.can_hold_use_license() {
        return Err(StorageError::Argument(format!(
            "use licences are stored only for Windows or Passport users, not {}",
            user.kind
        )));
    }
    check_license_len(license)?;
    let name = user.encode();
    let name_len = i32::try_from(name.len())
        .map_err(|_| StorageError::Argument("user name too long".into()))?;

    let mut out = Vec::new();
    wire::write_i32(&mut out, USE_LICENSE_HEADER_LEN)?;
    wire::write_i32(&mut out, name_len)?;
    out.extend_from_slice(name.as_bytes());
    out.resize(out.len() + wire::padding_for(name.len()), 0);
    wire::write_utf8_string(&mut out, license)?;
    Ok(out)
}

pub(crate) fn decode_use_license(bytes: &[u8]) -> StorageResult<(ContentUser, String)> {
    let mut reader = Cursor::new(bytes);
    let header_len = wire::read_length(&mut reader, "use licence header length")?;
    if header_len < USE_LICENSE_HEADER_LEN as usize {
        return Err(StorageError::corrupt(format!(
            "use licence header length {header_len} below {USE_LICENSE_HEADER_LEN}"
        )));
    }
    let name_len = wire::read_length(&mut reader, "user name length")?;
    wire::skip_bytes(
        &mut reader,
        header_len - USE_LICENSE_HEADER_LEN as usize,
        "use licence header",
    )?;
    let name = wire::read_bytes(&mut reader, name_len, "user name")?;
    wire::skip_bytes(&mut reader, wire::padding_for(name_len), "user name padding")?;
    let name = String::from_utf8(name)
        .map_err(|_| StorageError::corrupt("user name is not ASCII base64"))?;
    let user = ContentUser::decode(&name)?;
    let license = read_license(&mut reader)?;
    Ok((user, license))
}

/// A fresh use-licence stream name: the prefix plus 26 base-32 characters.
pub(crate) fn new_use_license_stream_name() -> String {
    let id = Uuid::new_v4();
    format!("{USE_LICENSE_PREFIX}{}", base32(id.as_bytes()))
}

pub fn is_use_license_stream(name: &str) -> bool {
    name.get(..USE_LICENSE_PREFIX.len())
        .is_some_and(|prefix| prefix.eq_ignore_ascii_case(USE_LICENSE_PREFIX))
}

/// Unpadded base-32 (`A-Z2-7`), five bits per character.
fn base32(bytes: &[u8]) -> String {
    let mut out = String::with_capacity((bytes.len() * 8).div_ceil(5));
    let mut buffer = 0u32;
    let mut bits = 0u32;
    for &byte in bytes {
        buffer = (buffer << 8) | u32::from(byte);
        bits += 8;
        while bits >= 5 {
            bits -= 5;
            out.push(char::from(BASE32_ALPHABET[((buffer >> bits) & 0x1F) as usize]));
        }
    }
    if bits > 0 {
        out.push(char::from(BASE32_ALPHABET[((buffer << (5 - bits)) & 0x1F) as usize]));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_name_encoding() {
        let user = ContentUser::new("alice@example.com", AuthenticationKind::Windows);
        let encoded = user.encode();
        let raw = STANDARD.decode(&encoded).unwrap();
        assert_eq!(&raw[..4], &[b'W', 0, b'i', 0]);
        assert_eq!(ContentUser::decode(&encoded).unwrap(), user);
    }

    #[test]
    fn user_match_ignores_name_case() {
        let a = ContentUser::new("Bob", AuthenticationKind::Passport);
        let b = ContentUser::new("bOB", AuthenticationKind::Passport);
        let c = ContentUser::new("Bob", AuthenticationKind::Windows);
        assert!(a.matches(&b));
        assert!(!a.matches(&c));
    }

    #[test]
    fn use_license_layout() {
        let user = ContentUser::new("u", AuthenticationKind::Passport);
        let bytes = encode_use_license(&user, "<XrML/>").unwrap();
        assert_eq!(&bytes[0..4], &8i32.to_le_bytes());
        let name_len = user.encode().len();
        assert_eq!(&bytes[4..8], &(name_len as i32).to_le_bytes());
        assert_eq!((8 + name_len + wire::padding_for(name_len)) % 4, 0);

        let (decoded_user, license) = decode_use_license(&bytes).unwrap();
        assert_eq!(decoded_user, user);
        assert_eq!(license, "<XrML/>");
    }

    #[test]
    fn use_license_extra_header_skipped() {
        let user = ContentUser::new("u", AuthenticationKind::Windows);
        let plain = encode_use_license(&user, "lic").unwrap();
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&12i32.to_le_bytes());
        bytes.extend_from_slice(&plain[4..8]);
        bytes.extend_from_slice(&[0xEE; 4]);
        bytes.extend_from_slice(&plain[8..]);
        let (decoded_user, license) = decode_use_license(&bytes).unwrap();
        assert_eq!(decoded_user, user);
        assert_eq!(license, "lic");
    }

    #[test]
    fn use_license_rejects_other_kinds() {
        for kind in [AuthenticationKind::WindowsPassport, AuthenticationKind::Internal] {
            let err = encode_use_license(&ContentUser::new("x", kind), "lic").unwrap_err();
            assert!(matches!(err, StorageError::Argument(_)));
        }
    }

    #[test]
    fn short_use_license_header_is_corrupt() {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&4i32.to_le_bytes());
        bytes.extend_from_slice(&0i32.to_le_bytes());
        assert!(matches!(
            decode_use_license(&bytes).unwrap_err(),
            StorageError::CorruptFormat(_)
        ));
    }

    #[test]
    fn hostile_lengths_are_corrupt() {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&8i32.to_le_bytes());
        bytes.extend_from_slice(&i32::MAX.to_le_bytes());
        bytes.extend_from_slice(b"dXNlcg==");
        assert!(matches!(
            decode_use_license(&bytes).unwrap_err(),
            StorageError::CorruptFormat(msg) if msg.contains("user name")
        ));

        let mut bytes = Vec::new();
        bytes.extend_from_slice(&i32::MAX.to_le_bytes());
        bytes.extend_from_slice(&[0u8; 12]);
        assert!(matches!(
            PublishLicense::decode(&mut Cursor::new(bytes)).unwrap_err(),
            StorageError::CorruptFormat(msg) if msg.contains("publish licence header")
        ));
    }

    #[test]
    fn publish_license_preserves_extra_header() {
        let record = PublishLicense {
            extra_header: vec![1, 2, 3, 4],
            license: "<publish/>".into(),
        };
        let bytes = record.encode().unwrap();
        assert_eq!(&bytes[0..4], &8i32.to_le_bytes());
        assert_eq!(&bytes[4..8], &[1, 2, 3, 4]);
        assert_eq!(bytes.len() % 4, 0);
        let decoded = PublishLicense::decode(&mut Cursor::new(bytes)).unwrap();
        assert_eq!(decoded, record);
    }

    #[test]
    fn oversize_license_rejected() {
        let record = PublishLicense {
            extra_header: Vec::new(),
            license: "x".repeat(MAX_LICENSE_CHARS + 1),
        };
        assert!(matches!(record.encode().unwrap_err(), StorageError::Argument(_)));
    }

    #[test]
    fn stream_names() {
        let name = new_use_license_stream_name();
        assert_eq!(name.len(), USE_LICENSE_PREFIX.len() + 26);
        assert!(name[4..]
            .bytes()
            .all(|b| b.is_ascii_uppercase() || (b'2'..=b'7').contains(&b)));
        assert!(is_use_license_stream(&name));
        assert!(is_use_license_stream("eul-abc"));
        assert!(!is_use_license_stream("EUL"));
        assert!(!is_use_license_stream("\u{6}Primary"));
    }

    #[test]
    fn base32_known_values() {
        assert_eq!(base32(b"f"), "MY");
        assert_eq!(base32(b"foobar"), "MZXW6YTBOI");
        assert_eq!(base32(&[0u8; 16]).len(), 26);
    }
}
