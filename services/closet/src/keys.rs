//! Storage key naming.
//!
//! Every stored asset lives under a prefix derived from its purpose so that
//! path-prefix access rules hold without a metadata lookup:
//!
//! ```text
//! users/{owner}/closet/{entity}/{token}.{ext}     owner only
//! users/{owner}/profile/{entity}/{token}.{ext}    owner writes, signed-in users read
//! marketplace/listings/{entity}/{token}.{ext}     public read
//! shared/outfits/{entity}/{token}.{ext}           signed-in users read
//! temp/{owner}/{entity}/{token}.{ext}             owner only, swept after a day
//! ```
//!
//! Keys are write-once: the token makes each call produce a fresh key, so a
//! key never names two different photos.

use crate::model::OwnerId;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

const MAX_OBJECT_KEY_LEN: usize = 1024;

/// What an uploaded asset is used for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AssetPurpose {
    Closet,
    Profile,
    MarketplaceListing,
    SharedOutfit,
    Temp,
}

impl AssetPurpose {
    /// Whether keys of this purpose carry the owner id in their prefix
    pub fn is_owner_scoped(&self) -> bool {
        matches!(self, AssetPurpose::Closet | AssetPurpose::Profile | AssetPurpose::Temp)
    }
}

/// A durable, write-once object store key
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ObjectKey(String);

impl ObjectKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether the key sits under `prefix`
    pub fn has_prefix(&self, prefix: &str) -> bool {
        self.0.starts_with(prefix)
    }
}

/// Rejected object key
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid object key `{key}`: {reason}")]
pub struct InvalidKey {
    pub key: String,
    pub reason: &'static str,
}

impl TryFrom<String> for ObjectKey {
    type Error = InvalidKey;

    fn try_from(key: String) -> Result<Self, Self::Error> {
        let reason = if key.is_empty() {
            Some("empty")
        } else if key.len() > MAX_OBJECT_KEY_LEN {
            Some("too long")
        } else if key.starts_with('/') || key.ends_with('/') {
            Some("must not start or end with `/`")
        } else if key.split('/').any(|segment| segment.is_empty() || segment == "..") {
            Some("contains an empty or parent segment")
        } else if key.bytes().any(|b| b.is_ascii_control() || b == b'\\') {
            Some("contains control characters or backslashes")
        } else {
            None
        };

        match reason {
            Some(reason) => Err(InvalidKey { key, reason }),
            None => Ok(Self(key)),
        }
    }
}

impl TryFrom<&str> for ObjectKey {
    type Error = InvalidKey;

    fn try_from(key: &str) -> Result<Self, Self::Error> {
        Self::try_from(key.to_string())
    }
}

impl From<ObjectKey> for String {
    fn from(key: ObjectKey) -> Self {
        key.0
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Per-file uniqueness token: upload time plus a sequence number
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UniqueToken {
    pub millis: i64,
    pub sequence: u64,
}

impl fmt::Display for UniqueToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.millis, self.sequence)
    }
}

/// Build the key for one asset. Pure: the same inputs always give the same key.
pub fn name_key(
    purpose: AssetPurpose,
    owner: &OwnerId,
    entity_id: &str,
    extension: &str,
    token: UniqueToken,
) -> ObjectKey {
    let entity = sanitize_path_component(entity_id);
    let file = format!("{}.{}", token, extension);

    let key = match purpose {
        AssetPurpose::MarketplaceListing => format!("marketplace/listings/{}/{}", entity, file),
        AssetPurpose::SharedOutfit => format!("shared/outfits/{}/{}", entity, file),
        _ => format!("{}{}/{}", owner_prefix(purpose, owner), entity, file),
    };

    ObjectKey(key)
}

/// Listing prefix covering every key of `purpose` that belongs to `owner`.
///
/// Marketplace and shared assets are not owner-namespaced, so their prefix
/// covers every owner.
pub fn owner_prefix(purpose: AssetPurpose, owner: &OwnerId) -> String {
    let owner = escape_owner(owner.as_str());
    match purpose {
        AssetPurpose::Closet => format!("users/{}/closet/", owner),
        AssetPurpose::Profile => format!("users/{}/profile/", owner),
        AssetPurpose::Temp => format!("temp/{}/", owner),
        AssetPurpose::MarketplaceListing => "marketplace/listings/".to_string(),
        AssetPurpose::SharedOutfit => "shared/outfits/".to_string(),
    }
}

/// Extension derived from an original filename, lowercased and path-safe.
/// Files without a usable extension get `bin`.
pub fn file_extension(filename: &str) -> String {
    filename
        .rsplit_once('.')
        .map(|(_, ext)| ext)
        .filter(|ext| !ext.is_empty() && ext.chars().all(|c| c.is_ascii_alphanumeric()))
        .map(|ext| ext.to_ascii_lowercase())
        .unwrap_or_else(|| "bin".to_string())
}

/// Hands out uniqueness tokens and names keys with them
#[derive(Debug, Default)]
pub struct KeyNamer {
    sequence: AtomicU64,
}

impl KeyNamer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Next token; the sequence keeps keys distinct within one millisecond
    pub fn next_token(&self) -> UniqueToken {
        UniqueToken {
            millis: Utc::now().timestamp_millis(),
            sequence: self.sequence.fetch_add(1, Ordering::Relaxed),
        }
    }

    /// Name a fresh key for one file
    pub fn name(
        &self,
        purpose: AssetPurpose,
        owner: &OwnerId,
        entity_id: &str,
        filename: &str,
    ) -> ObjectKey {
        name_key(
            purpose,
            owner,
            entity_id,
            &file_extension(filename),
            self.next_token(),
        )
    }
}

/// Path segment for an owner id. Reversible, so distinct owners never share
/// a namespace: unsafe bytes, and `_` itself, become `_XX` in hex.
fn escape_owner(owner: &str) -> String {
    let mut escaped = String::with_capacity(owner.len());
    for byte in owner.bytes() {
        match byte {
            b'a'..=b'z' | b'A'..=b'Z' | b'0'..=b'9' | b'-' => escaped.push(byte as char),
            _ => escaped.push_str(&format!("_{byte:02X}")),
        }
    }
    escaped
}

/// Sanitize a path component to prevent path traversal
fn sanitize_path_component(component: &str) -> String {
    component
        .chars()
        .map(|c| match c {
            'a'..='z' | 'A'..='Z' | '0'..='9' | '-' | '_' => c,
            _ => '_',
        })
        .collect()
}
