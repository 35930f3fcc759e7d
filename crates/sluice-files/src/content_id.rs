//! UUID-shaped content identifiers.
//!
//! A [`ContentId`] is 16 bytes rendered as lowercase hex in five groups
//! (8-4-4-4-12). It only borrows the UUID syntax: ids derived from content
//! are the first 16 bytes of a digest and carry no version bits.
//!
//! ```
//! use sluice_files::ContentId;
//!
//! let id = ContentId::from_digest(&[0xab; 32]).unwrap();
//! assert_eq!(id.to_string(), "abababab-abab-abab-abab-abababababab");
//! assert_eq!(id.to_string().parse::<ContentId>().unwrap(), id);
//! ```

use crate::error::{FilesError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Content id length in bytes
pub const CONTENT_ID_LEN: usize = 16;

/// Length of the string form
const STRING_LEN: usize = 36;

/// Byte length of each hex group
const GROUPS: [usize; 5] = [4, 2, 2, 2, 6];

/// UUID-shaped identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ContentId([u8; CONTENT_ID_LEN]);

impl ContentId {
    /// Wrap raw id bytes
    pub const fn from_bytes(bytes: [u8; CONTENT_ID_LEN]) -> Self {
        Self(bytes)
    }

    /// Truncate a digest to an id
    ///
    /// # Errors
    ///
    /// Returns [`FilesError::InvalidContentId`] if the digest is shorter than
    /// [`CONTENT_ID_LEN`] bytes.
    pub fn from_digest(digest: &[u8]) -> Result<Self> {
        let bytes = digest
            .get(..CONTENT_ID_LEN)
            .and_then(|prefix| <[u8; CONTENT_ID_LEN]>::try_from(prefix).ok())
            .ok_or_else(|| {
                FilesError::InvalidContentId(format!(
                    "digest of {} bytes is shorter than {}",
                    digest.len(),
                    CONTENT_ID_LEN
                ))
            })?;

        Ok(Self(bytes))
    }

    /// Random version-4 style id, for uploads that do not need content addressing
    ///
    /// # Errors
    ///
    /// Returns [`FilesError::Io`] if the OS random source fails.
    pub fn random() -> Result<Self> {
        let mut bytes = [0u8; CONTENT_ID_LEN];
        getrandom::getrandom(&mut bytes).map_err(|e| std::io::Error::other(e.to_string()))?;

        bytes[6] = (bytes[6] & 0x0f) | 0x40;
        bytes[8] = (bytes[8] & 0x3f) | 0x80;

        Ok(Self(bytes))
    }

    /// Raw id bytes
    pub fn as_bytes(&self) -> &[u8; CONTENT_ID_LEN] {
        &self.0
    }
}

impl fmt::Display for ContentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut offset = 0;
        for (i, len) in GROUPS.iter().enumerate() {
            if i > 0 {
                f.write_str("-")?;
            }
            f.write_str(&hex::encode(&self.0[offset..offset + len]))?;
            offset += len;
        }
        Ok(())
    }
}

impl FromStr for ContentId {
    type Err = FilesError;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = || FilesError::InvalidContentId(s.to_string());

        if s.len() != STRING_LEN {
            return Err(invalid());
        }

        let groups: Vec<&str> = s.split('-').collect();
        if groups.len() != GROUPS.len()
            || groups.iter().zip(GROUPS).any(|(g, len)| g.len() != len * 2)
        {
            return Err(invalid());
        }

        let bytes = hex::decode(groups.concat()).map_err(|_| invalid())?;
        let bytes = <[u8; CONTENT_ID_LEN]>::try_from(bytes.as_slice()).map_err(|_| invalid())?;

        Ok(Self(bytes))
    }
}

impl TryFrom<String> for ContentId {
    type Error = FilesError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<ContentId> for String {
    fn from(id: ContentId) -> Self {
        id.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn is_canonical(s: &str) -> bool {
        s.len() == STRING_LEN
            && s.char_indices().all(|(i, c)| match i {
                8 | 13 | 18 | 23 => c == '-',
                _ => c.is_ascii_digit() || ('a'..='f').contains(&c),
            })
    }

    #[test]
    fn test_display_format() {
        let bytes: [u8; 16] = core::array::from_fn(|i| i as u8);
        let id = ContentId::from_bytes(bytes);
        assert_eq!(id.to_string(), "00010203-0405-0607-0809-0a0b0c0d0e0f");
        assert!(is_canonical(&id.to_string()));
    }

    #[test]
    fn test_from_digest_truncates() {
        let digest = blake3::hash(b"content").as_bytes().to_vec();
        let id = ContentId::from_digest(&digest).unwrap();
        assert_eq!(id.as_bytes()[..], digest[..16]);
    }

    #[test]
    fn test_short_digest_rejected() {
        assert!(matches!(
            ContentId::from_digest(&[0u8; 8]),
            Err(FilesError::InvalidContentId(_))
        ));
    }

    #[test]
    fn test_parse() {
        let id: ContentId = "00010203-0405-0607-0809-0a0b0c0d0e0f".parse().unwrap();
        assert_eq!(id.as_bytes()[15], 0x0f);

        // Uppercase input is accepted, output is always lowercase
        let upper: ContentId = "00010203-0405-0607-0809-0A0B0C0D0E0F".parse().unwrap();
        assert_eq!(upper, id);
    }

    #[test]
    fn test_parse_rejects_malformed() {
        for bad in [
            "",
            "00010203-0405-0607-0809-0a0b0c0d0e0",
            "000102030-405-0607-0809-0a0b0c0d0e0f",
            "00010203x0405-0607-0809-0a0b0c0d0e0f",
            "0001020304050607080900a0b0c0d0e0f000",
            "zz010203-0405-0607-0809-0a0b0c0d0e0f",
        ] {
            assert!(bad.parse::<ContentId>().is_err(), "accepted {bad:?}");
        }
    }

    #[test]
    fn test_random_has_version_bits() {
        let id = ContentId::random().unwrap();
        let s = id.to_string();
        assert!(is_canonical(&s));
        assert_eq!(&s[14..15], "4");
        assert!(matches!(&s[19..20], "8" | "9" | "a" | "b"));
    }

    #[test]
    fn test_random_ids_distinct() {
        let ids: HashSet<ContentId> = (0..1000).map(|_| ContentId::random().unwrap()).collect();
        assert_eq!(ids.len(), 1000);
    }

    #[test]
    fn test_serde_as_string() {
        let id = ContentId::from_bytes([0x11; 16]);
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"11111111-1111-1111-1111-111111111111\"");

        let back: ContentId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);

        assert!(serde_json::from_str::<ContentId>("\"not-an-id\"").is_err());
    }
}
