use std::cmp::Ordering;
use std::collections::BTreeSet;
use std::fs;

use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::domain::{ContentHash, FormId, FormVersion, LocalFormRecord};
use crate::error::SyncError;
use crate::store::FormsStore;
use crate::task::{CancelFlag, ProgressEvent, ProgressSink};

/// Narrow CRUD surface over the persisted form registry. The reconciler is
/// the only writer; paths are relative to the forms root.
pub trait FormsRegistry: Send {
    fn all(&self) -> Result<Vec<LocalFormRecord>, SyncError>;
    fn by_path(&self, form_dir: &Utf8Path) -> Result<Option<LocalFormRecord>, SyncError>;
    fn by_form_id(&self, form_id: &FormId) -> Result<Vec<LocalFormRecord>, SyncError>;
    fn insert(&mut self, record: LocalFormRecord) -> Result<(), SyncError>;
    fn update(&mut self, record: LocalFormRecord) -> Result<(), SyncError>;
    fn delete_by_path(&mut self, form_dir: &Utf8Path) -> Result<(), SyncError>;
}

/// Shape of `formDef.json` as far as registration is concerned.
#[derive(Debug, Deserialize)]
struct DefinitionFile {
    form_id: String,
    #[serde(default)]
    table_id: Option<String>,
    #[serde(default)]
    version: Option<String>,
}

#[derive(Debug, Clone)]
pub struct FormInfo {
    pub form_id: FormId,
    pub table_id: String,
    pub version: Option<FormVersion>,
}

pub fn parse_definition(path: &Utf8Path) -> Result<FormInfo, SyncError> {
    let content = fs::read_to_string(path.as_std_path()).map_err(|err| {
        SyncError::DefinitionParse {
            path: path.to_path_buf(),
            reason: err.to_string(),
        }
    })?;
    let parsed: DefinitionFile =
        serde_json::from_str(&content).map_err(|err| SyncError::DefinitionParse {
            path: path.to_path_buf(),
            reason: err.to_string(),
        })?;
    let form_id: FormId = parsed
        .form_id
        .parse()
        .map_err(|err: SyncError| SyncError::DefinitionParse {
            path: path.to_path_buf(),
            reason: err.to_string(),
        })?;
    Ok(FormInfo {
        table_id: parsed.table_id.unwrap_or_else(|| form_id.to_string()),
        version: parsed.version.map(FormVersion::new),
        form_id,
    })
}

/// Counts of registry mutations applied in one reconciliation pass. A second
/// pass over an unchanged tree reports all zeroes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileStats {
    pub deleted: usize,
    pub upserted: usize,
    pub quarantined: usize,
}

impl ReconcileStats {
    pub fn mutations(&self) -> usize {
        self.deleted + self.upserted + self.quarantined
    }
}

/// Reconcile the on-disk forms tree with the persisted registry: drop entries
/// whose directory vanished, re-register directories whose definition hash
/// changed, and quarantine directories violating placement or superseded by a
/// newer copy of the same form.
pub fn reconcile<R: FormsRegistry + ?Sized>(
    store: &FormsStore,
    registry: &mut R,
    sink: &dyn ProgressSink,
    cancel: &CancelFlag,
) -> Result<ReconcileStats, SyncError> {
    store.ensure_roots()?;
    let mut stats = ReconcileStats::default();

    let mut to_scan: BTreeSet<Utf8PathBuf> = store.list_form_dirs()?.into_iter().collect();

    // Pass 1: match every registry entry against its backing directory.
    let mut doomed: Vec<Utf8PathBuf> = Vec::new();
    for record in registry.all()? {
        let full_dir = store.forms_root().join(&record.form_dir);
        let definition = FormsStore::definition_path(&full_dir);
        if !definition.as_std_path().is_file() {
            doomed.push(record.form_dir.clone());
            continue;
        }
        match ContentHash::compute_file(definition.as_std_path()) {
            Ok(actual) if actual == record.hash => {
                // Unchanged on disk; nothing to rescan.
                to_scan.remove(&full_dir);
            }
            Ok(_) => {}
            Err(err) => {
                warn!(dir = %full_dir, error = %err, "failed to hash definition; rescanning");
            }
        }
    }
    for form_dir in doomed {
        sink.event(ProgressEvent::message(format!("deregistering {form_dir}")));
        registry.delete_by_path(&form_dir)?;
        stats.deleted += 1;
    }

    // Pass 2: register new or changed directories.
    let total = to_scan.len();
    for (index, dir) in to_scan.into_iter().enumerate() {
        if cancel.is_cancelled() {
            return Ok(stats);
        }
        sink.event(ProgressEvent::step(
            format!("scanning {dir}"),
            index + 1,
            total,
        ));

        let definition = FormsStore::definition_path(&dir);
        let info = match parse_definition(&definition) {
            Ok(info) => info,
            Err(err) => {
                // Unusable either way; an unparseable form is deleted, not
                // quarantined.
                warn!(dir = %dir, error = %err, "deleting form directory with unparseable definition");
                fs::remove_dir_all(dir.as_std_path())
                    .map_err(|err| SyncError::Filesystem(err.to_string()))?;
                continue;
            }
        };

        let rel_dir = relative_dir(store, &dir)?;

        // Placement invariant: the framework id lives only in the framework
        // directory, and nothing else lives there.
        let in_framework_dir = dir == store.framework_dir();
        if info.form_id.is_framework() != in_framework_dir {
            sink.event(ProgressEvent::message(format!(
                "quarantining misplaced {} at {dir}",
                info.form_id
            )));
            registry.delete_by_path(&rel_dir)?;
            store.quarantine_dir(&dir)?;
            stats.quarantined += 1;
            continue;
        }

        // A copy superseded by a strictly newer version elsewhere loses.
        let rivals = registry.by_form_id(&info.form_id)?;
        let mut superseded = false;
        for rival in &rivals {
            if rival.form_dir == rel_dir {
                continue;
            }
            match version_cmp(&rival.version, &info.version) {
                Ordering::Greater => {
                    superseded = true;
                }
                Ordering::Less | Ordering::Equal => {
                    sink.event(ProgressEvent::message(format!(
                        "deregistering superseded {} at {}",
                        rival.form_id, rival.form_dir
                    )));
                    registry.delete_by_path(&rival.form_dir)?;
                    stats.deleted += 1;
                }
            }
        }
        if superseded {
            sink.event(ProgressEvent::message(format!(
                "quarantining superseded {} at {dir}",
                info.form_id
            )));
            registry.delete_by_path(&rel_dir)?;
            store.quarantine_dir(&dir)?;
            stats.quarantined += 1;
            continue;
        }

        let record = LocalFormRecord {
            form_id: info.form_id.clone(),
            table_id: info.table_id.clone(),
            form_dir: rel_dir.clone(),
            version: info.version.clone(),
            hash: ContentHash::compute_file(definition.as_std_path())?,
            last_modified: chrono::Utc::now().to_rfc3339(),
        };
        if registry.by_path(&rel_dir)?.is_some() {
            registry.update(record)?;
        } else {
            registry.insert(record)?;
        }
        stats.upserted += 1;
    }

    Ok(stats)
}

fn relative_dir(store: &FormsStore, dir: &Utf8Path) -> Result<Utf8PathBuf, SyncError> {
    dir.strip_prefix(store.forms_root())
        .map(Utf8Path::to_path_buf)
        .map_err(|_| SyncError::Filesystem(format!("{dir} is outside the forms root")))
}

/// Missing versions sort below any present version.
fn version_cmp(a: &Option<FormVersion>, b: &Option<FormVersion>) -> Ordering {
    match (a, b) {
        (None, None) => Ordering::Equal,
        (None, Some(_)) => Ordering::Less,
        (Some(_), None) => Ordering::Greater,
        (Some(a), Some(b)) => a.cmp(b),
    }
}

/// Registry persisted as a JSON document; the default backing used by the
/// CLI. Mutations are written through immediately.
#[derive(Debug)]
pub struct JsonFileRegistry {
    path: Utf8PathBuf,
    records: Vec<LocalFormRecord>,
}

impl JsonFileRegistry {
    pub fn open(path: Utf8PathBuf) -> Result<Self, SyncError> {
        let records = if path.as_std_path().exists() {
            let content = fs::read_to_string(path.as_std_path())
                .map_err(|err| SyncError::Filesystem(err.to_string()))?;
            serde_json::from_str(&content)
                .map_err(|err| SyncError::Filesystem(format!("registry parse: {err}")))?
        } else {
            Vec::new()
        };
        Ok(Self { path, records })
    }

    fn persist(&self) -> Result<(), SyncError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent.as_std_path())
                .map_err(|err| SyncError::Filesystem(err.to_string()))?;
        }
        let content = serde_json::to_vec_pretty(&self.records)
            .map_err(|err| SyncError::Filesystem(err.to_string()))?;
        let tmp_path = self.path.with_extension("json.tmp");
        fs::write(tmp_path.as_std_path(), &content)
            .map_err(|err| SyncError::Filesystem(err.to_string()))?;
        fs::rename(tmp_path.as_std_path(), self.path.as_std_path())
            .map_err(|err| SyncError::Filesystem(err.to_string()))?;
        Ok(())
    }
}

impl FormsRegistry for JsonFileRegistry {
    fn all(&self) -> Result<Vec<LocalFormRecord>, SyncError> {
        Ok(self.records.clone())
    }

    fn by_path(&self, form_dir: &Utf8Path) -> Result<Option<LocalFormRecord>, SyncError> {
        Ok(self
            .records
            .iter()
            .find(|record| record.form_dir == form_dir)
            .cloned())
    }

    fn by_form_id(&self, form_id: &FormId) -> Result<Vec<LocalFormRecord>, SyncError> {
        Ok(self
            .records
            .iter()
            .filter(|record| &record.form_id == form_id)
            .cloned()
            .collect())
    }

    fn insert(&mut self, record: LocalFormRecord) -> Result<(), SyncError> {
        self.records.push(record);
        self.persist()
    }

    fn update(&mut self, record: LocalFormRecord) -> Result<(), SyncError> {
        if let Some(existing) = self
            .records
            .iter_mut()
            .find(|existing| existing.form_dir == record.form_dir)
        {
            *existing = record;
        } else {
            self.records.push(record);
        }
        self.persist()
    }

    fn delete_by_path(&mut self, form_dir: &Utf8Path) -> Result<(), SyncError> {
        self.records.retain(|record| record.form_dir != form_dir);
        self.persist()
    }
}
