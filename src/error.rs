use camino::Utf8PathBuf;
use miette::Diagnostic;
use thiserror::Error;

#[derive(Debug, Error, Diagnostic)]
pub enum SyncError {
    #[error("invalid form id: {0}")]
    InvalidFormId(String),

    #[error("invalid content hash: {0}")]
    InvalidContentHash(String),

    #[error("missing config file formsync.json in current directory")]
    MissingConfig,

    #[error("failed to read config file at {0}")]
    ConfigRead(Utf8PathBuf),

    #[error("failed to parse JSON config: {0}")]
    ConfigParse(String),

    #[error("listing request failed: {0}")]
    ListingHttp(String),

    #[error("listing returned status {status}: {message}")]
    ListingStatus { status: u16, message: String },

    #[error("manifest request failed: {0}")]
    ManifestHttp(String),

    #[error("manifest returned status {status}: {message}")]
    ManifestStatus { status: u16, message: String },

    #[error("form download failed: {0}")]
    DownloadHttp(String),

    #[error("form download returned status {status}: {message}")]
    DownloadStatus { status: u16, message: String },

    #[error("submission request failed: {0}")]
    SubmissionHttp(String),

    #[error("submission returned status {status}: {message}")]
    SubmissionStatus { status: u16, message: String },

    #[error("malformed {document} document: {reason}")]
    XmlShape {
        document: &'static str,
        reason: String,
    },

    #[error("form {0} has no manifest url; media cannot be verified")]
    MissingManifest(String),

    #[error("unparseable definition file at {path}: {reason}")]
    DefinitionParse {
        path: Utf8PathBuf,
        reason: String,
    },

    #[error("staged swap failed for {form_id}: {reason}")]
    SwapFailed { form_id: String, reason: String },

    #[error("record not found in instance store: {0}")]
    RecordNotFound(String),

    #[error("filesystem error: {0}")]
    Filesystem(String),
}
