use std::collections::BTreeMap;
use std::fs;

use camino::{Utf8Path, Utf8PathBuf};
use tracing::warn;

use crate::domain::{ContentHash, FormId, RemoteFormDescriptor, SUCCESS_STATUS};
use crate::error::SyncError;
use crate::fs_util;
use crate::http::OpenRosaTransport;
use crate::openrosa;
use crate::store::{DEFINITION_FILE, FormsStore, INSTANCES_DIR, rename_dir};
use crate::task::{CancelFlag, ProgressEvent, ProgressSink};

/// Result of one stage-and-swap run: a status string per requested form and
/// whether the run reached the end of the form set. `completed` is the
/// publish signal the caller uses to wake the reconciler; a cancelled run
/// leaves it false but its partial status map is still valid.
#[derive(Debug, Clone, serde::Serialize)]
pub struct StageOutcome {
    pub statuses: BTreeMap<FormId, String>,
    pub completed: bool,
}

impl StageOutcome {
    pub fn is_success(&self, form_id: &FormId) -> bool {
        self.statuses.get(form_id).map(String::as_str) == Some(SUCCESS_STATUS)
    }
}

/// Directory-move primitive the promotion runs on; swapped out in tests to
/// fail a chosen move mid-promotion.
type RenameFn = fn(&Utf8Path, &Utf8Path) -> std::io::Result<()>;

/// The three locations one download-and-promote operation touches. The
/// transaction exclusively owns the scratch path until promotion completes;
/// any failure leaves the live path exactly as it was.
struct StagingTransaction {
    form_id: String,
    scratch: Utf8PathBuf,
    live: Utf8PathBuf,
    stale: Utf8PathBuf,
    rename: RenameFn,
}

impl StagingTransaction {
    fn begin(store: &FormsStore, form: &RemoteFormDescriptor) -> Result<Self, SyncError> {
        let scratch = store.allocate_staging_dir(form.form_id.as_str())?;
        let stale = store.allocate_stale_path(form.form_id.as_str())?;
        let live = store.form_dir(&form.form_id);
        Ok(Self {
            form_id: form.form_id.to_string(),
            scratch,
            live,
            stale,
            rename: rename_dir,
        })
    }

    /// Three-move promotion: live → stale, scratch → live, stale/instances →
    /// live/instances. Completed moves are reversed if a later one fails, so
    /// an observer only ever sees the old complete tree or the new one.
    fn promote(self) -> Result<(), SyncError> {
        let had_live = self.live.as_std_path().exists();

        if had_live {
            (self.rename)(&self.live, &self.stale).map_err(|err| {
                self.discard_scratch();
                self.swap_failed(format!("move live aside: {err}"))
            })?;
        }

        if let Err(err) = (self.rename)(&self.scratch, &self.live) {
            if had_live {
                if let Err(undo) = rename_dir(&self.stale, &self.live) {
                    warn!(live = %self.live, error = %undo, "rollback of live directory failed");
                }
            }
            self.discard_scratch();
            return Err(self.swap_failed(format!("promote scratch: {err}")));
        }

        // Completed records survive a form update.
        let stale_instances = self.stale.join(INSTANCES_DIR);
        if had_live && stale_instances.as_std_path().exists() {
            let live_instances = self.live.join(INSTANCES_DIR);
            if let Err(err) = (self.rename)(&stale_instances, &live_instances) {
                if let Err(undo) = rename_dir(&self.live, &self.scratch) {
                    warn!(live = %self.live, error = %undo, "rollback of promoted directory failed");
                }
                if let Err(undo) = rename_dir(&self.stale, &self.live) {
                    warn!(live = %self.live, error = %undo, "rollback of live directory failed");
                }
                self.discard_scratch();
                return Err(self.swap_failed(format!("carry over instances: {err}")));
            }
        }

        Ok(())
    }

    fn swap_failed(&self, reason: String) -> SyncError {
        SyncError::SwapFailed {
            form_id: self.form_id.clone(),
            reason,
        }
    }

    /// Abandon the transaction; the live path has not been touched.
    fn abort(self) {
        self.discard_scratch();
    }

    fn discard_scratch(&self) {
        if self.scratch.as_std_path().exists() {
            if let Err(err) = fs::remove_dir_all(self.scratch.as_std_path()) {
                warn!(scratch = %self.scratch, error = %err, "failed to remove scratch directory");
            }
        }
    }
}

/// Download and atomically install the given forms. Each form gets its own
/// staging transaction; one form's failure never affects another's live
/// directory.
pub fn stage_forms<T: OpenRosaTransport + ?Sized>(
    transport: &T,
    store: &FormsStore,
    forms: &[RemoteFormDescriptor],
    sink: &dyn ProgressSink,
    cancel: &CancelFlag,
) -> Result<StageOutcome, SyncError> {
    store.ensure_roots()?;

    let mut statuses = BTreeMap::new();
    let total = forms.len();
    for (index, form) in forms.iter().enumerate() {
        if cancel.is_cancelled() {
            return Ok(StageOutcome {
                statuses,
                completed: false,
            });
        }
        sink.event(ProgressEvent::step(
            format!("staging {}", form.form_id),
            index + 1,
            total,
        ));
        let status = match stage_one(transport, store, form) {
            Ok(()) => SUCCESS_STATUS.to_string(),
            Err(err) => err.to_string(),
        };
        statuses.insert(form.form_id.clone(), status);
    }

    Ok(StageOutcome {
        statuses,
        completed: true,
    })
}

fn stage_one<T: OpenRosaTransport + ?Sized>(
    transport: &T,
    store: &FormsStore,
    form: &RemoteFormDescriptor,
) -> Result<(), SyncError> {
    // A form with media but no manifest cannot be verified.
    let manifest_url = form
        .manifest_url
        .as_deref()
        .ok_or_else(|| SyncError::MissingManifest(form.form_id.to_string()))?;

    let tx = StagingTransaction::begin(store, form)?;
    match fill_scratch(transport, form, manifest_url, &tx.scratch, &tx.live) {
        Ok(()) => tx.promote(),
        Err(err) => {
            tx.abort();
            Err(err)
        }
    }
}

fn fill_scratch<T: OpenRosaTransport + ?Sized>(
    transport: &T,
    form: &RemoteFormDescriptor,
    manifest_url: &str,
    scratch: &Utf8Path,
    live: &Utf8Path,
) -> Result<(), SyncError> {
    let manifest_xml = transport.fetch_manifest(manifest_url)?;
    let media = openrosa::parse_manifest(&manifest_xml)?;

    for entry in &media {
        // Manifest filenames are server input; reject anything that would
        // resolve outside the scratch directory.
        let relative = fs_util::contained_path(&entry.filename).ok_or_else(|| {
            SyncError::Filesystem(format!(
                "manifest filename path traversal detected: {}",
                entry.filename
            ))
        })?;
        let target = scratch.join(relative);
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent.as_std_path())
                .map_err(|err| SyncError::Filesystem(err.to_string()))?;
        }
        let existing = live.join(relative);
        if hash_matches(&existing, &entry.hash) {
            // Unchanged media is reused from the live copy; hash equality,
            // not timestamp, is the change signal.
            fs::copy(existing.as_std_path(), target.as_std_path())
                .map_err(|err| SyncError::Filesystem(err.to_string()))?;
        } else {
            transport.download_file(&entry.download_url, target.as_std_path())?;
        }
    }

    unpack_archives(scratch)?;

    let definition_target = scratch.join(DEFINITION_FILE);
    let existing_definition = live.join(DEFINITION_FILE);
    if hash_matches(&existing_definition, &form.hash) {
        fs::copy(
            existing_definition.as_std_path(),
            definition_target.as_std_path(),
        )
        .map_err(|err| SyncError::Filesystem(err.to_string()))?;
    } else {
        transport.download_file(&form.download_url, definition_target.as_std_path())?;
    }

    Ok(())
}

fn hash_matches(path: &Utf8Path, expected: &ContentHash) -> bool {
    if !path.as_std_path().is_file() {
        return false;
    }
    match ContentHash::compute_file(path.as_std_path()) {
        Ok(actual) => &actual == expected,
        Err(err) => {
            warn!(path = %path, error = %err, "failed to hash existing file; refetching");
            false
        }
    }
}

fn unpack_archives(scratch: &Utf8Path) -> Result<(), SyncError> {
    let entries = fs::read_dir(scratch.as_std_path())
        .map_err(|err| SyncError::Filesystem(err.to_string()))?;
    for entry in entries {
        let entry = entry.map_err(|err| SyncError::Filesystem(err.to_string()))?;
        let path = entry.path();
        if path.is_file() && fs_util::is_zip_file(&path) {
            fs_util::validate_zip(&path)?;
            fs_util::extract_zip(&path, scratch.as_std_path())?;
            fs::remove_file(&path).map_err(|err| SyncError::Filesystem(err.to_string()))?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    fn transaction_fixture(temp: &tempfile::TempDir, rename: RenameFn) -> StagingTransaction {
        let root = Utf8PathBuf::from_path_buf(temp.path().to_path_buf()).unwrap();
        let store = FormsStore::new(&root);
        store.ensure_roots().unwrap();

        let live = store.forms_root().join("census");
        fs::create_dir_all(live.as_std_path()).unwrap();
        fs::write(live.join(DEFINITION_FILE).as_std_path(), b"old").unwrap();
        let record_dir = live.join(INSTANCES_DIR).join("rec-1");
        fs::create_dir_all(record_dir.as_std_path()).unwrap();
        fs::write(record_dir.join("submission.xml").as_std_path(), b"<data/>").unwrap();

        let scratch = store.allocate_staging_dir("census").unwrap();
        fs::write(scratch.join(DEFINITION_FILE).as_std_path(), b"new").unwrap();
        let stale = store.allocate_stale_path("census").unwrap();

        StagingTransaction {
            form_id: "census".to_string(),
            scratch,
            live,
            stale,
            rename,
        }
    }

    fn fail_scratch_promotion(from: &Utf8Path, to: &Utf8Path) -> std::io::Result<()> {
        if from.as_str().contains("staging") {
            return Err(std::io::Error::other("injected rename failure"));
        }
        rename_dir(from, to)
    }

    fn fail_instance_carry_over(from: &Utf8Path, to: &Utf8Path) -> std::io::Result<()> {
        if from.file_name() == Some(INSTANCES_DIR) {
            return Err(std::io::Error::other("injected rename failure"));
        }
        rename_dir(from, to)
    }

    #[test]
    fn failed_scratch_promotion_restores_the_live_directory() {
        let temp = tempfile::tempdir().unwrap();
        let tx = transaction_fixture(&temp, fail_scratch_promotion);
        let live = tx.live.clone();
        let scratch = tx.scratch.clone();
        let stale = tx.stale.clone();

        let err = tx.promote().unwrap_err();
        assert_matches!(err, SyncError::SwapFailed { .. });

        // Move 1 succeeded and was reversed; the old tree is fully back.
        assert_eq!(fs::read(live.join(DEFINITION_FILE).as_std_path()).unwrap(), b"old");
        assert!(live.join(INSTANCES_DIR).join("rec-1").as_std_path().is_dir());
        assert!(!stale.as_std_path().exists());
        assert!(!scratch.as_std_path().exists());
    }

    #[test]
    fn failed_instance_carry_over_restores_the_live_directory() {
        let temp = tempfile::tempdir().unwrap();
        let tx = transaction_fixture(&temp, fail_instance_carry_over);
        let live = tx.live.clone();
        let scratch = tx.scratch.clone();
        let stale = tx.stale.clone();

        let err = tx.promote().unwrap_err();
        assert_matches!(err, SyncError::SwapFailed { .. });

        // Moves 1 and 2 succeeded and were both reversed; the old tree and
        // its records are back and the new content was discarded.
        assert_eq!(fs::read(live.join(DEFINITION_FILE).as_std_path()).unwrap(), b"old");
        assert_eq!(
            fs::read(
                live.join(INSTANCES_DIR)
                    .join("rec-1")
                    .join("submission.xml")
                    .as_std_path()
            )
            .unwrap(),
            b"<data/>"
        );
        assert!(!stale.as_std_path().exists());
        assert!(!scratch.as_std_path().exists());
    }
}
