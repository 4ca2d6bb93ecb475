use std::collections::BTreeMap;
use std::fmt;
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;
use std::str::FromStr;

use camino::Utf8PathBuf;
use md5::{Digest, Md5};
use serde::{Deserialize, Serialize};

use crate::error::SyncError;

/// Reserved identifier for the framework form; it may only live under the
/// reserved framework directory.
pub const FRAMEWORK_FORM_ID: &str = "framework";

/// Directory name (under the forms root) reserved for the framework form.
pub const FRAMEWORK_DIR: &str = "framework";

/// Per-item status string recorded for a fully successful operation.
pub const SUCCESS_STATUS: &str = "success";

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FormId(String);

impl FormId {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_framework(&self) -> bool {
        self.0 == FRAMEWORK_FORM_ID
    }
}

impl fmt::Display for FormId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for FormId {
    type Err = SyncError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let normalized = value.trim().to_string();
        let is_valid = !normalized.is_empty()
            && normalized
                .chars()
                .all(|ch| ch.is_ascii_alphanumeric() || matches!(ch, '_' | '-' | '.'));
        if !is_valid {
            return Err(SyncError::InvalidFormId(value.to_string()));
        }
        Ok(Self(normalized))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FormVersion(String);

impl FormVersion {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for FormVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// An md5 content hash, stored as lowercase hex. Servers emit both the bare
/// hex form and the `md5:<hex>` prefixed form; both parse to the same value.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ContentHash(String);

impl ContentHash {
    pub fn as_hex(&self) -> &str {
        &self.0
    }

    pub fn compute(data: &[u8]) -> Self {
        let mut hasher = Md5::new();
        hasher.update(data);
        Self(format!("{:x}", hasher.finalize()))
    }

    pub fn compute_file(path: &Path) -> Result<Self, SyncError> {
        let file = File::open(path).map_err(|err| {
            SyncError::Filesystem(format!("open {}: {err}", path.display()))
        })?;
        let mut reader = BufReader::new(file);
        let mut hasher = Md5::new();
        let mut buf = [0u8; 8192];
        loop {
            let n = reader
                .read(&mut buf)
                .map_err(|err| SyncError::Filesystem(err.to_string()))?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
        }
        Ok(Self(format!("{:x}", hasher.finalize())))
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "md5:{}", self.0)
    }
}

impl FromStr for ContentHash {
    type Err = SyncError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let trimmed = value.trim();
        let hex = trimmed.strip_prefix("md5:").unwrap_or(trimmed);
        let normalized = hex.to_ascii_lowercase();
        let is_valid =
            normalized.len() == 32 && normalized.chars().all(|ch| ch.is_ascii_hexdigit());
        if !is_valid {
            return Err(SyncError::InvalidContentHash(value.to_string()));
        }
        Ok(Self(normalized))
    }
}

/// One form known to the server, as advertised by the listing endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RemoteFormDescriptor {
    pub form_id: FormId,
    pub name: String,
    pub version: Option<FormVersion>,
    pub hash: ContentHash,
    pub download_url: String,
    pub manifest_url: Option<String>,
}

/// One media file advertised by a form's manifest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaFileDescriptor {
    pub filename: String,
    pub hash: ContentHash,
    pub download_url: String,
}

/// Outcome of a listing fetch. The three cases the caller must distinguish:
/// a usable catalog, a credential challenge, and everything else.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FormListing {
    Forms(BTreeMap<FormId, RemoteFormDescriptor>),
    AuthRequired { url: String },
    Failed { message: String },
}

/// Persisted registry entry for one locally installed form.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalFormRecord {
    pub form_id: FormId,
    pub table_id: String,
    pub form_dir: Utf8PathBuf,
    pub version: Option<FormVersion>,
    pub hash: ContentHash,
    pub last_modified: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttachmentFile {
    pub path: Utf8PathBuf,
    pub filename: String,
    pub mime_type: String,
}

/// The files making up one submission: the instance document plus its
/// attachments in upload order. Built fresh per attempt, never cached.
#[derive(Debug, Clone)]
pub struct InstanceFileSet {
    pub instance_file: Utf8PathBuf,
    pub attachments: Vec<AttachmentFile>,
}

/// Per-record results of one upload pipeline run. A partial map (fewer
/// entries than requested records) is a valid outcome after cancellation
/// or an auth challenge.
#[derive(Debug, Clone, Default, Serialize)]
pub struct UploadOutcome {
    pub statuses: BTreeMap<String, String>,
    pub auth_required: Option<String>,
}

impl UploadOutcome {
    pub fn record_success(&mut self, record_id: &str) {
        self.statuses
            .insert(record_id.to_string(), SUCCESS_STATUS.to_string());
    }

    pub fn record_failure(&mut self, record_id: &str, message: impl Into<String>) {
        self.statuses.insert(record_id.to_string(), message.into());
    }

    pub fn is_success(&self, record_id: &str) -> bool {
        self.statuses.get(record_id).map(String::as_str) == Some(SUCCESS_STATUS)
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    #[test]
    fn parse_form_id_valid() {
        let id: FormId = " household_survey.v2 ".parse().unwrap();
        assert_eq!(id.as_str(), "household_survey.v2");
    }

    #[test]
    fn parse_form_id_invalid() {
        let err = "bad/id".parse::<FormId>().unwrap_err();
        assert_matches!(err, SyncError::InvalidFormId(_));
        let err = "".parse::<FormId>().unwrap_err();
        assert_matches!(err, SyncError::InvalidFormId(_));
    }

    #[test]
    fn framework_id_is_reserved() {
        let id: FormId = "framework".parse().unwrap();
        assert!(id.is_framework());
        let other: FormId = "census".parse().unwrap();
        assert!(!other.is_framework());
    }

    #[test]
    fn parse_hash_accepts_prefixed_and_bare_forms() {
        let bare: ContentHash = "D41D8CD98F00B204E9800998ECF8427E".parse().unwrap();
        let prefixed: ContentHash = "md5:d41d8cd98f00b204e9800998ecf8427e".parse().unwrap();
        assert_eq!(bare, prefixed);
        assert_eq!(prefixed.to_string(), "md5:d41d8cd98f00b204e9800998ecf8427e");
    }

    #[test]
    fn parse_hash_invalid() {
        let err = "md5:notahash".parse::<ContentHash>().unwrap_err();
        assert_matches!(err, SyncError::InvalidContentHash(_));
    }

    #[test]
    fn compute_hash_matches_known_digest() {
        // md5("") per RFC 1321.
        let empty = ContentHash::compute(b"");
        assert_eq!(empty.as_hex(), "d41d8cd98f00b204e9800998ecf8427e");
    }

    #[test]
    fn compute_file_hash_matches_in_memory_hash() {
        let temp = tempfile::tempdir().unwrap();
        let path = temp.path().join("logo.png");
        std::fs::write(&path, b"pixels").unwrap();
        assert_eq!(
            ContentHash::compute_file(&path).unwrap(),
            ContentHash::compute(b"pixels")
        );
    }

    #[test]
    fn upload_outcome_success_sentinel() {
        let mut outcome = UploadOutcome::default();
        outcome.record_success("uuid-1");
        outcome.record_failure("uuid-2", "submission returned status 500");
        assert!(outcome.is_success("uuid-1"));
        assert!(!outcome.is_success("uuid-2"));
        assert!(!outcome.is_success("uuid-3"));
    }
}
