use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::sync::Mutex;

use camino::Utf8PathBuf;

use formsync::domain::{ContentHash, FormId, RemoteFormDescriptor};
use formsync::error::SyncError;
use formsync::http::{OpenRosaTransport, ProbeResponse, SubmissionBatch};
use formsync::stage::stage_forms;
use formsync::store::FormsStore;
use formsync::task::{CancelFlag, NullSink};

/// Transport serving canned manifests and file bodies, counting downloads.
#[derive(Default)]
struct MockTransport {
    manifests: HashMap<String, String>,
    files: HashMap<String, Vec<u8>>,
    fail_urls: Vec<String>,
    downloads: Mutex<Vec<String>>,
}

impl MockTransport {
    fn download_count(&self) -> usize {
        self.downloads.lock().unwrap().len()
    }
}

impl OpenRosaTransport for MockTransport {
    fn fetch_listing(&self, _url: &str) -> Result<String, SyncError> {
        unimplemented!("staging never fetches the listing")
    }

    fn fetch_manifest(&self, url: &str) -> Result<String, SyncError> {
        self.manifests
            .get(url)
            .cloned()
            .ok_or_else(|| SyncError::ManifestHttp(format!("no manifest at {url}")))
    }

    fn download_file(&self, url: &str, destination: &Path) -> Result<(), SyncError> {
        self.downloads.lock().unwrap().push(url.to_string());
        if self.fail_urls.iter().any(|fail| fail == url) {
            return Err(SyncError::DownloadHttp("connection reset".to_string()));
        }
        let body = self
            .files
            .get(url)
            .ok_or_else(|| SyncError::DownloadHttp(format!("no file at {url}")))?;
        fs::write(destination, body).map_err(|err| SyncError::Filesystem(err.to_string()))?;
        Ok(())
    }

    fn head_probe(&self, _url: &str) -> Result<ProbeResponse, SyncError> {
        unimplemented!("staging never probes")
    }

    fn post_submission(&self, _url: &str, _batch: &SubmissionBatch) -> Result<u16, SyncError> {
        unimplemented!("staging never uploads")
    }
}

const DEFINITION: &[u8] = br#"{"form_id": "census", "version": "2"}"#;
const LOGO: &[u8] = b"logo-bytes";

fn manifest_xml(entries: &[(&str, &[u8], &str)]) -> String {
    let body: String = entries
        .iter()
        .map(|(filename, content, url)| {
            format!(
                "<mediaFile><filename>{filename}</filename><hash>{}</hash><downloadUrl>{url}</downloadUrl></mediaFile>",
                ContentHash::compute(content)
            )
        })
        .collect();
    format!(r#"<manifest xmlns="http://openrosa.org/xforms/xformsManifest">{body}</manifest>"#)
}

fn descriptor(definition: &[u8]) -> RemoteFormDescriptor {
    RemoteFormDescriptor {
        form_id: "census".parse().unwrap(),
        name: "Census".to_string(),
        version: Some(formsync::domain::FormVersion::new("2")),
        hash: ContentHash::compute(definition),
        download_url: "https://server/forms/census.xml".to_string(),
        manifest_url: Some("https://server/forms/census/manifest".to_string()),
    }
}

fn store_in(temp: &tempfile::TempDir) -> FormsStore {
    let root = Utf8PathBuf::from_path_buf(temp.path().to_path_buf()).unwrap();
    FormsStore::new(&root)
}

fn basic_transport() -> MockTransport {
    let mut transport = MockTransport::default();
    transport.manifests.insert(
        "https://server/forms/census/manifest".to_string(),
        manifest_xml(&[("logo.png", LOGO, "https://server/media/logo.png")]),
    );
    transport
        .files
        .insert("https://server/media/logo.png".to_string(), LOGO.to_vec());
    transport
        .files
        .insert("https://server/forms/census.xml".to_string(), DEFINITION.to_vec());
    transport
}

#[test]
fn fresh_form_is_staged_and_promoted() {
    let temp = tempfile::tempdir().unwrap();
    let store = store_in(&temp);
    let transport = basic_transport();

    let outcome = stage_forms(
        &transport,
        &store,
        &[descriptor(DEFINITION)],
        &NullSink,
        &CancelFlag::new(),
    )
    .unwrap();

    let id: FormId = "census".parse().unwrap();
    assert!(outcome.is_success(&id), "{:?}", outcome.statuses);
    assert!(outcome.completed);

    let live = store.form_dir(&id);
    assert_eq!(fs::read(live.join("formDef.json").as_std_path()).unwrap(), DEFINITION);
    assert_eq!(fs::read(live.join("logo.png").as_std_path()).unwrap(), LOGO);
    // Scratch directories do not outlive the transaction.
    assert_eq!(fs::read_dir(store.staging_root().as_std_path()).unwrap().count(), 0);
}

#[test]
fn unchanged_files_are_reused_without_network_fetch() {
    let temp = tempfile::tempdir().unwrap();
    let store = store_in(&temp);
    let transport = basic_transport();

    let forms = [descriptor(DEFINITION)];
    stage_forms(&transport, &store, &forms, &NullSink, &CancelFlag::new()).unwrap();
    let first_run = transport.download_count();
    assert_eq!(first_run, 2, "definition and media both fetched on first run");

    // Identical hashes on the second run: everything is copied locally.
    stage_forms(&transport, &store, &forms, &NullSink, &CancelFlag::new()).unwrap();
    assert_eq!(transport.download_count(), first_run);
}

#[test]
fn changed_media_is_refetched() {
    let temp = tempfile::tempdir().unwrap();
    let store = store_in(&temp);
    let transport = basic_transport();
    let forms = [descriptor(DEFINITION)];
    stage_forms(&transport, &store, &forms, &NullSink, &CancelFlag::new()).unwrap();

    // Server now advertises different logo content.
    let mut updated = basic_transport();
    updated.manifests.insert(
        "https://server/forms/census/manifest".to_string(),
        manifest_xml(&[("logo.png", b"new-logo", "https://server/media/logo.png")]),
    );
    updated.files.insert(
        "https://server/media/logo.png".to_string(),
        b"new-logo".to_vec(),
    );
    stage_forms(&updated, &store, &forms, &NullSink, &CancelFlag::new()).unwrap();

    // Only the media changed; the definition was reused locally.
    assert_eq!(
        *updated.downloads.lock().unwrap(),
        vec!["https://server/media/logo.png".to_string()]
    );
    let live = store.form_dir(&"census".parse().unwrap());
    assert_eq!(fs::read(live.join("logo.png").as_std_path()).unwrap(), b"new-logo");
}

#[test]
fn failed_download_leaves_live_directory_untouched() {
    let temp = tempfile::tempdir().unwrap();
    let store = store_in(&temp);
    let forms = [descriptor(DEFINITION)];
    stage_forms(&basic_transport(), &store, &forms, &NullSink, &CancelFlag::new()).unwrap();

    let mut broken = basic_transport();
    broken.manifests.insert(
        "https://server/forms/census/manifest".to_string(),
        manifest_xml(&[("logo.png", b"unreachable", "https://server/media/logo.png")]),
    );
    broken.fail_urls.push("https://server/media/logo.png".to_string());

    let outcome =
        stage_forms(&broken, &store, &forms, &NullSink, &CancelFlag::new()).unwrap();
    let id: FormId = "census".parse().unwrap();
    assert!(!outcome.is_success(&id));

    // Old version still fully in place, scratch cleaned up.
    let live = store.form_dir(&id);
    assert_eq!(fs::read(live.join("formDef.json").as_std_path()).unwrap(), DEFINITION);
    assert_eq!(fs::read(live.join("logo.png").as_std_path()).unwrap(), LOGO);
    assert_eq!(fs::read_dir(store.staging_root().as_std_path()).unwrap().count(), 0);
}

#[test]
fn form_without_manifest_url_fails_that_form() {
    let temp = tempfile::tempdir().unwrap();
    let store = store_in(&temp);
    let mut form = descriptor(DEFINITION);
    form.manifest_url = None;

    let transport = basic_transport();
    let outcome =
        stage_forms(&transport, &store, &[form], &NullSink, &CancelFlag::new()).unwrap();
    let id: FormId = "census".parse().unwrap();
    assert!(outcome.statuses.get(&id).unwrap().contains("no manifest"));
    assert_eq!(transport.download_count(), 0);
}

#[test]
fn instances_survive_a_form_update() {
    let temp = tempfile::tempdir().unwrap();
    let store = store_in(&temp);
    let forms = [descriptor(DEFINITION)];
    stage_forms(&basic_transport(), &store, &forms, &NullSink, &CancelFlag::new()).unwrap();

    let id: FormId = "census".parse().unwrap();
    let record_dir = store.form_dir(&id).join("instances/rec-1");
    fs::create_dir_all(record_dir.as_std_path()).unwrap();
    fs::write(record_dir.join("submission.xml").as_std_path(), b"<data/>").unwrap();

    // New definition version forces a full restage.
    let new_definition: &[u8] = br#"{"form_id": "census", "version": "3"}"#;
    let mut form = descriptor(new_definition);
    form.version = Some(formsync::domain::FormVersion::new("3"));
    let mut transport = basic_transport();
    transport.files.insert(
        "https://server/forms/census.xml".to_string(),
        new_definition.to_vec(),
    );

    let outcome =
        stage_forms(&transport, &store, &[form], &NullSink, &CancelFlag::new()).unwrap();
    assert!(outcome.is_success(&id));

    let live = store.form_dir(&id);
    assert_eq!(
        fs::read(live.join("formDef.json").as_std_path()).unwrap(),
        new_definition
    );
    assert_eq!(
        fs::read(live.join("instances/rec-1/submission.xml").as_std_path()).unwrap(),
        b"<data/>"
    );
}

#[test]
fn manifest_filename_cannot_escape_the_form_directory() {
    let temp = tempfile::tempdir().unwrap();
    let store = store_in(&temp);

    let mut transport = MockTransport::default();
    transport.manifests.insert(
        "https://server/forms/census/manifest".to_string(),
        manifest_xml(&[(
            "../../escaped.txt",
            b"owned",
            "https://server/media/escaped.txt",
        )]),
    );
    transport.files.insert(
        "https://server/media/escaped.txt".to_string(),
        b"owned".to_vec(),
    );
    transport
        .files
        .insert("https://server/forms/census.xml".to_string(), DEFINITION.to_vec());

    let outcome = stage_forms(
        &transport,
        &store,
        &[descriptor(DEFINITION)],
        &NullSink,
        &CancelFlag::new(),
    )
    .unwrap();

    let id: FormId = "census".parse().unwrap();
    assert!(!outcome.is_success(&id));
    assert!(outcome.statuses.get(&id).unwrap().contains("traversal"));
    // Nothing was written outside the scratch directory and nothing was
    // promoted; the hostile entry was rejected before any download.
    assert!(!temp.path().join("escaped.txt").exists());
    assert!(!store.form_dir(&id).as_std_path().exists());
    assert_eq!(transport.download_count(), 0);
    assert_eq!(fs::read_dir(store.staging_root().as_std_path()).unwrap().count(), 0);
}

#[test]
fn cancellation_returns_partial_outcome() {
    let temp = tempfile::tempdir().unwrap();
    let store = store_in(&temp);
    let cancel = CancelFlag::new();
    cancel.cancel();

    let outcome = stage_forms(
        &basic_transport(),
        &store,
        &[descriptor(DEFINITION)],
        &NullSink,
        &cancel,
    )
    .unwrap();
    assert!(outcome.statuses.is_empty());
    assert!(!outcome.completed);
}

#[test]
fn bundled_archives_are_unpacked_in_place() {
    use std::io::Write;

    let temp = tempfile::tempdir().unwrap();
    let store = store_in(&temp);

    let mut zip_bytes = Vec::new();
    {
        let mut writer = zip::ZipWriter::new(std::io::Cursor::new(&mut zip_bytes));
        let options = zip::write::SimpleFileOptions::default();
        writer.start_file("media/banner.png", options).unwrap();
        writer.write_all(b"banner-bytes").unwrap();
        writer.finish().unwrap();
    }

    let mut transport = MockTransport::default();
    transport.manifests.insert(
        "https://server/forms/census/manifest".to_string(),
        manifest_xml(&[("bundle.zip", &zip_bytes, "https://server/media/bundle.zip")]),
    );
    transport
        .files
        .insert("https://server/media/bundle.zip".to_string(), zip_bytes.clone());
    transport
        .files
        .insert("https://server/forms/census.xml".to_string(), DEFINITION.to_vec());

    let outcome = stage_forms(
        &transport,
        &store,
        &[descriptor(DEFINITION)],
        &NullSink,
        &CancelFlag::new(),
    )
    .unwrap();
    let id: FormId = "census".parse().unwrap();
    assert!(outcome.is_success(&id), "{:?}", outcome.statuses);

    let live = store.form_dir(&id);
    assert_eq!(
        fs::read(live.join("media/banner.png").as_std_path()).unwrap(),
        b"banner-bytes"
    );
    assert!(!live.join("bundle.zip").as_std_path().exists());
}
