use std::collections::HashMap;
use std::fs;
use std::ops::Range;

use reqwest::Url;
use tracing::warn;

use crate::domain::{FormId, InstanceFileSet, UploadOutcome};
use crate::error::SyncError;
use crate::http::{OpenRosaTransport, SubmissionBatch};
use crate::task::{CancelFlag, ProgressEvent, ProgressSink};

/// Budget for one multipart POST; exceeding either bound closes the batch
/// and opens the next.
pub const MAX_BATCH_BYTES: u64 = 10_000_000;
pub const MAX_BATCH_FILES: usize = 100;

/// Cache of probe-discovered redirects, keyed by original destination URI.
/// A hit skips the HEAD probe entirely on later records.
#[derive(Debug, Clone, Default)]
pub struct UriRemapCache(HashMap<String, String>);

impl UriRemapCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn resolve(&self, original: &str) -> Option<&str> {
        self.0.get(original).map(String::as_str)
    }

    pub fn remap(&mut self, original: &str, replacement: String) {
        self.0.insert(original.to_string(), replacement);
    }
}

/// External record-store seam: enumerate sendable records, materialize their
/// file sets, and persist per-record terminal status.
pub trait InstanceStore: Send {
    fn pending_records(&self, form_id: &FormId) -> Result<Vec<String>, SyncError>;
    fn build_file_set(&self, form_id: &FormId, record_id: &str)
    -> Result<InstanceFileSet, SyncError>;
    fn set_status(
        &mut self,
        form_id: &FormId,
        record_id: &str,
        submitted: bool,
    ) -> Result<(), SyncError>;
}

/// Upload the given records sequentially. A 401 on any probe aborts the
/// remaining pipeline and surfaces the challenging URI; other per-record
/// failures are recorded and the pipeline moves on. Cancellation returns the
/// outcomes accumulated so far.
pub fn upload_instances<T, S>(
    transport: &T,
    instances: &mut S,
    form_id: &FormId,
    destination: &str,
    record_ids: &[String],
    remap: &mut UriRemapCache,
    sink: &dyn ProgressSink,
    cancel: &CancelFlag,
) -> Result<UploadOutcome, SyncError>
where
    T: OpenRosaTransport + ?Sized,
    S: InstanceStore + ?Sized,
{
    let mut outcome = UploadOutcome::default();
    let total = record_ids.len();

    for (index, record_id) in record_ids.iter().enumerate() {
        if cancel.is_cancelled() {
            return Ok(outcome);
        }
        sink.event(ProgressEvent::step(
            format!("uploading {record_id}"),
            index + 1,
            total,
        ));

        let file_set = match instances.build_file_set(form_id, record_id) {
            Ok(file_set) => file_set,
            Err(err) => {
                outcome.record_failure(record_id, err.to_string());
                instances.set_status(form_id, record_id, false)?;
                continue;
            }
        };

        let target = match remap.resolve(destination) {
            Some(remapped) => remapped.to_string(),
            None => match probe_destination(transport, destination, remap) {
                ProbeDecision::Proceed(url) => url,
                ProbeDecision::AuthRequired(url) => {
                    // No further records are attempted.
                    outcome.auth_required = Some(url);
                    return Ok(outcome);
                }
                ProbeDecision::RecordFailed(message) => {
                    outcome.record_failure(record_id, message);
                    instances.set_status(form_id, record_id, false)?;
                    continue;
                }
            },
        };

        match send_record(transport, &target, &file_set) {
            Ok(()) => {
                outcome.record_success(record_id);
                instances.set_status(form_id, record_id, true)?;
            }
            Err(err) => {
                outcome.record_failure(record_id, err.to_string());
                instances.set_status(form_id, record_id, false)?;
            }
        }
    }

    Ok(outcome)
}

/// Records laid out on disk: `<form_dir>/instances/<record_id>/` holding
/// `submission.xml` plus attachments. A `.submitted` or `.failed` marker file
/// records the terminal status; records without a `.submitted` marker are
/// pending.
#[derive(Debug, Clone)]
pub struct DirInstanceStore {
    store: crate::store::FormsStore,
}

pub const INSTANCE_FILE: &str = "submission.xml";
const SUBMITTED_MARKER: &str = ".submitted";
const FAILED_MARKER: &str = ".failed";

impl DirInstanceStore {
    pub fn new(store: crate::store::FormsStore) -> Self {
        Self { store }
    }

    fn record_dir(&self, form_id: &FormId, record_id: &str) -> camino::Utf8PathBuf {
        self.store
            .form_dir(form_id)
            .join(crate::store::INSTANCES_DIR)
            .join(record_id)
    }
}

impl InstanceStore for DirInstanceStore {
    fn pending_records(&self, form_id: &FormId) -> Result<Vec<String>, SyncError> {
        let instances_dir = self
            .store
            .form_dir(form_id)
            .join(crate::store::INSTANCES_DIR);
        if !instances_dir.as_std_path().exists() {
            return Ok(Vec::new());
        }
        let mut pending = Vec::new();
        let entries = fs::read_dir(instances_dir.as_std_path())
            .map_err(|err| SyncError::Filesystem(err.to_string()))?;
        for entry in entries {
            let entry = entry.map_err(|err| SyncError::Filesystem(err.to_string()))?;
            let path = entry.path();
            if !path.is_dir() {
                continue;
            }
            let Some(record_id) = path.file_name().and_then(|name| name.to_str()) else {
                continue;
            };
            if path.join(INSTANCE_FILE).is_file() && !path.join(SUBMITTED_MARKER).exists() {
                pending.push(record_id.to_string());
            }
        }
        pending.sort();
        Ok(pending)
    }

    fn build_file_set(
        &self,
        form_id: &FormId,
        record_id: &str,
    ) -> Result<InstanceFileSet, SyncError> {
        let dir = self.record_dir(form_id, record_id);
        let instance_file = dir.join(INSTANCE_FILE);
        if !instance_file.as_std_path().is_file() {
            return Err(SyncError::RecordNotFound(record_id.to_string()));
        }

        let mut attachments = Vec::new();
        let entries = fs::read_dir(dir.as_std_path())
            .map_err(|err| SyncError::Filesystem(err.to_string()))?;
        for entry in entries {
            let entry = entry.map_err(|err| SyncError::Filesystem(err.to_string()))?;
            let path = camino::Utf8PathBuf::from_path_buf(entry.path()).map_err(|path| {
                SyncError::Filesystem(format!("non-utf8 path {}", path.display()))
            })?;
            let Some(filename) = path.file_name().map(str::to_string) else {
                continue;
            };
            if !path.as_std_path().is_file()
                || filename == INSTANCE_FILE
                || filename == SUBMITTED_MARKER
                || filename == FAILED_MARKER
            {
                continue;
            }
            attachments.push(crate::domain::AttachmentFile {
                mime_type: mime_for(&filename).to_string(),
                filename,
                path,
            });
        }
        attachments.sort_by(|a, b| a.filename.cmp(&b.filename));

        Ok(InstanceFileSet {
            instance_file,
            attachments,
        })
    }

    fn set_status(
        &mut self,
        form_id: &FormId,
        record_id: &str,
        submitted: bool,
    ) -> Result<(), SyncError> {
        let dir = self.record_dir(form_id, record_id);
        if !dir.as_std_path().is_dir() {
            return Ok(());
        }
        let marker = dir.join(if submitted { SUBMITTED_MARKER } else { FAILED_MARKER });
        fs::write(marker.as_std_path(), b"")
            .map_err(|err| SyncError::Filesystem(err.to_string()))?;
        Ok(())
    }
}

fn mime_for(filename: &str) -> &'static str {
    match filename.rsplit('.').next() {
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("png") => "image/png",
        Some("xml") => "text/xml",
        Some("csv") => "text/csv",
        Some("mp4") => "video/mp4",
        Some("m4a") | Some("mp3") => "audio/mpeg",
        _ => "application/octet-stream",
    }
}

enum ProbeDecision {
    Proceed(String),
    AuthRequired(String),
    RecordFailed(String),
}

fn probe_destination<T: OpenRosaTransport + ?Sized>(
    transport: &T,
    destination: &str,
    remap: &mut UriRemapCache,
) -> ProbeDecision {
    let probe = match transport.head_probe(destination) {
        Ok(probe) => probe,
        Err(err) => return ProbeDecision::RecordFailed(err.to_string()),
    };

    match probe.status {
        401 => ProbeDecision::AuthRequired(destination.to_string()),
        204 => match probe.location {
            Some(location) if same_host(destination, &location) => {
                remap.remap(destination, location.clone());
                ProbeDecision::Proceed(location)
            }
            Some(location) => ProbeDecision::RecordFailed(format!(
                "probe redirected to a different host: {location}"
            )),
            None => ProbeDecision::Proceed(destination.to_string()),
        },
        status if (200..300).contains(&status) => {
            // Some legacy servers answer the probe with a plain 2xx; tolerated
            // for compatibility.
            warn!(status, destination, "probe returned non-204 success status");
            ProbeDecision::Proceed(destination.to_string())
        }
        status => ProbeDecision::RecordFailed(format!("probe returned status {status}")),
    }
}

fn same_host(original: &str, candidate: &str) -> bool {
    match (Url::parse(original), Url::parse(candidate)) {
        (Ok(a), Ok(b)) => a.host_str().is_some() && a.host_str() == b.host_str(),
        _ => false,
    }
}

fn send_record<T: OpenRosaTransport + ?Sized>(
    transport: &T,
    target: &str,
    file_set: &InstanceFileSet,
) -> Result<(), SyncError> {
    let instance_len = file_len(&file_set.instance_file)?;
    let attachment_lens = file_set
        .attachments
        .iter()
        .map(|attachment| file_len(&attachment.path))
        .collect::<Result<Vec<_>, _>>()?;
    let ranges = plan_batches(
        instance_len,
        &attachment_lens,
        MAX_BATCH_BYTES,
        MAX_BATCH_FILES,
    );

    let last = ranges.len() - 1;
    for (index, range) in ranges.iter().enumerate() {
        let batch = SubmissionBatch {
            instance_file: file_set.instance_file.clone(),
            attachments: file_set.attachments[range.clone()].to_vec(),
            incomplete: index < last,
        };
        let status = transport.post_submission(target, &batch)?;
        if !matches!(status, 201 | 202) {
            return Err(SyncError::SubmissionStatus {
                status,
                message: "submission batch rejected".to_string(),
            });
        }
    }
    Ok(())
}

/// Split attachments into index ranges so each batch stays within the byte
/// and file budgets. Every batch re-sends the instance document, so its size
/// counts against every batch; an attachment too large for any budget still
/// gets a batch of its own.
fn plan_batches(
    instance_len: u64,
    attachment_lens: &[u64],
    max_bytes: u64,
    max_files: usize,
) -> Vec<Range<usize>> {
    if attachment_lens.is_empty() {
        return vec![0..0];
    }

    let mut ranges = Vec::new();
    let mut start = 0usize;
    let mut bytes = instance_len;
    let mut files = 1usize;
    for (index, len) in attachment_lens.iter().enumerate() {
        let fits = bytes + len <= max_bytes && files + 1 <= max_files;
        let batch_is_empty = index == start;
        if !fits && !batch_is_empty {
            ranges.push(start..index);
            start = index;
            bytes = instance_len;
            files = 1;
        }
        bytes += len;
        files += 1;
    }
    ranges.push(start..attachment_lens.len());
    ranges
}

fn file_len(path: &camino::Utf8Path) -> Result<u64, SyncError> {
    fs::metadata(path.as_std_path())
        .map(|meta| meta.len())
        .map_err(|err| SyncError::Filesystem(format!("stat {path}: {err}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_attachments_is_a_single_batch() {
        assert_eq!(plan_batches(100, &[], 1000, 10), vec![0..0]);
    }

    #[test]
    fn attachments_within_budget_fit_one_batch() {
        assert_eq!(plan_batches(100, &[200, 200, 200], 1000, 10), vec![0..3]);
    }

    #[test]
    fn byte_budget_splits_batches() {
        // 100 + 400 + 400 fits; the third 400 would overflow 1000.
        assert_eq!(
            plan_batches(100, &[400, 400, 400], 1000, 10),
            vec![0..2, 2..3]
        );
    }

    #[test]
    fn file_budget_splits_batches() {
        // Budget of 3 files per request: instance plus two attachments.
        assert_eq!(
            plan_batches(1, &[1, 1, 1, 1, 1], 1000, 3),
            vec![0..2, 2..4, 4..5]
        );
    }

    #[test]
    fn oversized_attachment_still_gets_its_own_batch() {
        assert_eq!(plan_batches(100, &[5000, 10], 1000, 10), vec![0..1, 1..2]);
    }

    #[test]
    fn remap_cache_round_trips() {
        let mut cache = UriRemapCache::new();
        assert!(cache.resolve("https://a/submit").is_none());
        cache.remap("https://a/submit", "https://a/sub2".to_string());
        assert_eq!(cache.resolve("https://a/submit"), Some("https://a/sub2"));
    }

    #[test]
    fn same_host_requires_matching_hosts() {
        assert!(same_host(
            "https://server.example.org/submission",
            "https://server.example.org/odk/submission"
        ));
        assert!(!same_host(
            "https://server.example.org/submission",
            "https://evil.example.net/submission"
        ));
        assert!(!same_host("not a url", "https://server/submission"));
    }
}
