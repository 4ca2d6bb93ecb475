use std::fs::File;
use std::path::Path;
use std::time::Duration;

use reqwest::blocking::Client;
use reqwest::blocking::multipart::{Form, Part};
use reqwest::header::{AUTHORIZATION, HeaderMap, HeaderValue, LOCATION, USER_AGENT};

use crate::domain::AttachmentFile;
use crate::error::SyncError;

/// Multipart part name the submission endpoint expects for the instance
/// document.
pub const SUBMISSION_PART_NAME: &str = "xml_submission_file";

/// Form field flagging a partial batch with more attachments to follow.
pub const INCOMPLETE_FIELD: &str = "*isIncomplete*";

/// One multipart POST worth of submission content.
#[derive(Debug, Clone)]
pub struct SubmissionBatch {
    pub instance_file: camino::Utf8PathBuf,
    pub attachments: Vec<AttachmentFile>,
    pub incomplete: bool,
}

/// Raw result of a HEAD probe; interpretation (auth, redirect, rejection)
/// belongs to the upload pipeline.
#[derive(Debug, Clone)]
pub struct ProbeResponse {
    pub status: u16,
    pub location: Option<String>,
}

/// Narrow transport seam over the OpenRosa HTTP surface. Every operation in
/// this crate reaches the network only through this trait, so tests can
/// substitute a scripted transport and count fetches.
pub trait OpenRosaTransport: Send + Sync {
    fn fetch_listing(&self, url: &str) -> Result<String, SyncError>;
    fn fetch_manifest(&self, url: &str) -> Result<String, SyncError>;
    fn download_file(&self, url: &str, destination: &Path) -> Result<(), SyncError>;
    fn head_probe(&self, url: &str) -> Result<ProbeResponse, SyncError>;
    fn post_submission(&self, url: &str, batch: &SubmissionBatch) -> Result<u16, SyncError>;
}

#[derive(Clone)]
pub struct OpenRosaHttpClient {
    client: Client,
}

impl OpenRosaHttpClient {
    pub fn new(auth_token: Option<&str>) -> Result<Self, SyncError> {
        let mut headers = HeaderMap::new();
        headers.insert(
            USER_AGENT,
            HeaderValue::from_str(&format!("formsync/{}", env!("CARGO_PKG_VERSION")))
                .map_err(|err| SyncError::Filesystem(err.to_string()))?,
        );
        headers.insert("X-OpenRosa-Version", HeaderValue::from_static("1.0"));
        if let Some(token) = auth_token {
            let token = token.trim();
            if !token.is_empty() {
                headers.insert(
                    AUTHORIZATION,
                    HeaderValue::from_str(&format!("Bearer {token}"))
                        .map_err(|err| SyncError::Filesystem(err.to_string()))?,
                );
            }
        }

        let client = Client::builder()
            .default_headers(headers)
            .timeout(Duration::from_secs(60))
            .build()
            .map_err(|err| SyncError::ListingHttp(err.to_string()))?;

        Ok(Self { client })
    }

    /// One silent retry after a single connection-level failure; a second
    /// consecutive failure propagates. Covers every idempotent request this
    /// client sends (listing and manifest GETs, file downloads, the HEAD
    /// probe); multipart submission POSTs bypass it, and status codes are
    /// never retried here.
    fn send_with_retry<F>(
        &self,
        mut make_req: F,
        map_err: fn(String) -> SyncError,
    ) -> Result<reqwest::blocking::Response, SyncError>
    where
        F: FnMut() -> reqwest::blocking::RequestBuilder,
    {
        match make_req().send() {
            Ok(resp) => Ok(resp),
            Err(err) if is_connection_error(&err) => {
                tracing::debug!(error = %err, "retrying after connection failure");
                make_req().send().map_err(|err| map_err(err.to_string()))
            }
            Err(err) => Err(map_err(err.to_string())),
        }
    }

    fn fetch_text(
        &self,
        url: &str,
        http_err: fn(String) -> SyncError,
        status_err: fn(u16, String) -> SyncError,
    ) -> Result<String, SyncError> {
        let response = self.send_with_retry(|| self.client.get(url), http_err)?;
        let status = response.status().as_u16();
        if !response.status().is_success() {
            let message = response.text().unwrap_or_else(|_| "request failed".to_string());
            return Err(status_err(status, message));
        }
        response.text().map_err(|err| http_err(err.to_string()))
    }
}

impl OpenRosaTransport for OpenRosaHttpClient {
    fn fetch_listing(&self, url: &str) -> Result<String, SyncError> {
        self.fetch_text(url, SyncError::ListingHttp, |status, message| {
            SyncError::ListingStatus { status, message }
        })
    }

    fn fetch_manifest(&self, url: &str) -> Result<String, SyncError> {
        self.fetch_text(url, SyncError::ManifestHttp, |status, message| {
            SyncError::ManifestStatus { status, message }
        })
    }

    fn download_file(&self, url: &str, destination: &Path) -> Result<(), SyncError> {
        let mut response =
            self.send_with_retry(|| self.client.get(url), SyncError::DownloadHttp)?;
        if !response.status().is_success() {
            let status = response.status().as_u16();
            let message = response
                .text()
                .unwrap_or_else(|_| "download failed".to_string());
            return Err(SyncError::DownloadStatus { status, message });
        }
        let mut file =
            File::create(destination).map_err(|err| SyncError::Filesystem(err.to_string()))?;
        std::io::copy(&mut response, &mut file)
            .map_err(|err| SyncError::Filesystem(err.to_string()))?;
        Ok(())
    }

    fn head_probe(&self, url: &str) -> Result<ProbeResponse, SyncError> {
        let response =
            self.send_with_retry(|| self.client.head(url), SyncError::SubmissionHttp)?;
        let location = response
            .headers()
            .get(LOCATION)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string);
        Ok(ProbeResponse {
            status: response.status().as_u16(),
            location,
        })
    }

    fn post_submission(&self, url: &str, batch: &SubmissionBatch) -> Result<u16, SyncError> {
        // Multipart bodies are not replayable, so the connection-level retry
        // does not apply to submission POSTs.
        let form = build_form(batch)?;
        let response = self
            .client
            .post(url)
            .multipart(form)
            .send()
            .map_err(|err| SyncError::SubmissionHttp(err.to_string()))?;
        Ok(response.status().as_u16())
    }
}

fn build_form(batch: &SubmissionBatch) -> Result<Form, SyncError> {
    let instance = Part::file(batch.instance_file.as_std_path())
        .map_err(|err| SyncError::Filesystem(err.to_string()))?
        .mime_str("text/xml")
        .map_err(|err| SyncError::SubmissionHttp(err.to_string()))?;
    let mut form = Form::new().part(SUBMISSION_PART_NAME, instance);
    if batch.incomplete {
        form = form.text(INCOMPLETE_FIELD, "yes");
    }
    for attachment in &batch.attachments {
        let part = Part::file(attachment.path.as_std_path())
            .map_err(|err| SyncError::Filesystem(err.to_string()))?
            .file_name(attachment.filename.clone())
            .mime_str(&attachment.mime_type)
            .map_err(|err| SyncError::SubmissionHttp(err.to_string()))?;
        form = form.part(attachment.filename.clone(), part);
    }
    Ok(form)
}

fn is_connection_error(err: &reqwest::Error) -> bool {
    err.is_timeout() || err.is_connect()
}
