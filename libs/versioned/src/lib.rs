//! Versioned on-disk record codec.
//!
//! A versioned record is a small header in front of an arbitrary payload:
//!
//! ```text
//! \x00\x00\x02 <semver ascii> \n <payload...>
//! ```
//!
//! Files written before versioning existed carry no header; they decode as
//! the legacy version `0.0.0` with the whole file as payload. The two cases
//! must stay distinct from a record whose header names a version the reader
//! does not understand: legacy records are accepted if their content
//! validates, unknown versions are the caller's error to refuse.

use semver::Version;
use thiserror::Error;

/// Leading magic of a versioned record.
pub const MAGIC: [u8; 3] = [0x00, 0x00, 0x02];

/// The version assigned to records with no header.
pub fn legacy_version() -> Version {
    Version::new(0, 0, 0)
}

/// Errors from decoding a versioned record.
#[derive(Debug, Error)]
pub enum VersionedError {
    /// Header magic present but the version line is unterminated or not
    /// valid ascii semver.
    #[error("malformed version header: {0}")]
    MalformedHeader(String),
}

/// A decoded record: its schema version and raw payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record<'a> {
    pub version: Version,
    pub payload: &'a [u8],
}

/// Encode `payload` under `version`.
pub fn write(version: &Version, payload: &[u8]) -> Vec<u8> {
    let header = version.to_string();
    let mut out = Vec::with_capacity(MAGIC.len() + header.len() + 1 + payload.len());
    out.extend_from_slice(&MAGIC);
    out.extend_from_slice(header.as_bytes());
    out.push(b'\n');
    out.extend_from_slice(payload);
    out
}

/// Decode a record, falling back to [`legacy_version`] when the magic is
/// absent.
pub fn read(bytes: &[u8]) -> Result<Record<'_>, VersionedError> {
    if bytes.len() < MAGIC.len() || bytes[..MAGIC.len()] != MAGIC {
        return Ok(Record {
            version: legacy_version(),
            payload: bytes,
        });
    }

    let rest = &bytes[MAGIC.len()..];
    let newline = rest
        .iter()
        .position(|&b| b == b'\n')
        .ok_or_else(|| VersionedError::MalformedHeader("missing newline".to_string()))?;

    let header = std::str::from_utf8(&rest[..newline])
        .map_err(|_| VersionedError::MalformedHeader("non-ascii version".to_string()))?;
    let version = Version::parse(header)
        .map_err(|e| VersionedError::MalformedHeader(e.to_string()))?;

    Ok(Record {
        version,
        payload: &rest[newline + 1..],
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip() {
        let version = Version::new(1, 0, 0);
        let encoded = write(&version, b"{\"id\":\"10-1\"}");
        let record = read(&encoded).unwrap();
        assert_eq!(record.version, version);
        assert_eq!(record.payload, b"{\"id\":\"10-1\"}");
    }

    #[test]
    fn test_unversioned_is_legacy() {
        let record = read(b"{\"id\":\"10-1\"}").unwrap();
        assert_eq!(record.version, legacy_version());
        assert_eq!(record.payload, b"{\"id\":\"10-1\"}");
    }

    #[test]
    fn test_empty_file_is_legacy() {
        let record = read(b"").unwrap();
        assert_eq!(record.version, legacy_version());
        assert!(record.payload.is_empty());
    }

    #[test]
    fn test_higher_version_survives_decoding() {
        // refusing a too-new schema is the caller's policy, not the codec's
        let encoded = write(&Version::new(2, 1, 0), b"payload");
        let record = read(&encoded).unwrap();
        assert_eq!(record.version, Version::new(2, 1, 0));
    }

    #[test]
    fn test_missing_newline_is_malformed() {
        let mut bytes = MAGIC.to_vec();
        bytes.extend_from_slice(b"1.0.0");
        assert!(matches!(
            read(&bytes),
            Err(VersionedError::MalformedHeader(_))
        ));
    }

    #[test]
    fn test_garbage_version_is_malformed() {
        let mut bytes = MAGIC.to_vec();
        bytes.extend_from_slice(b"not-semver\npayload");
        assert!(matches!(
            read(&bytes),
            Err(VersionedError::MalformedHeader(_))
        ));
    }

    #[test]
    fn test_payload_may_contain_newlines() {
        let encoded = write(&Version::new(1, 0, 0), b"line1\nline2");
        let record = read(&encoded).unwrap();
        assert_eq!(record.payload, b"line1\nline2");
    }
}
