use std::fs;

use camino::Utf8PathBuf;
use serde::{Deserialize, Serialize};

use crate::domain::FormId;
use crate::error::SyncError;

pub const DEFAULT_LISTING_PATH: &str = "/formList";
pub const DEFAULT_SUBMISSION_PATH: &str = "/submission";

#[derive(Debug, Deserialize, Serialize)]
pub struct Config {
    pub server_url: String,
    #[serde(default)]
    pub listing_path: Option<String>,
    #[serde(default)]
    pub submission_path: Option<String>,
    #[serde(default)]
    pub auth_token: Option<String>,
    #[serde(default)]
    pub app_root: Option<String>,
    #[serde(default)]
    pub forms: Vec<FormEntry>,
}

#[derive(Debug, Deserialize, Serialize)]
#[serde(untagged)]
pub enum FormEntry {
    Shorthand(String),
    Detailed(FormEntryObject),
}

#[derive(Debug, Deserialize, Serialize)]
pub struct FormEntryObject {
    pub form_id: String,
    #[serde(default)]
    pub submission_url: Option<String>,
}

#[derive(Debug, Clone)]
pub struct FormSelection {
    pub form_id: FormId,
    pub submission_url: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    pub server_url: String,
    pub listing_path: String,
    pub submission_path: String,
    pub auth_token: Option<String>,
    pub app_root: Utf8PathBuf,
    pub forms: Vec<FormSelection>,
}

impl ResolvedConfig {
    pub fn listing_url(&self) -> String {
        format!("{}{}", self.server_url, self.listing_path)
    }

    pub fn default_submission_url(&self) -> String {
        format!("{}{}", self.server_url, self.submission_path)
    }

    /// Per-form override from config, else the server-wide default.
    pub fn submission_url_for(&self, form_id: &FormId) -> String {
        self.forms
            .iter()
            .find(|entry| &entry.form_id == form_id)
            .and_then(|entry| entry.submission_url.clone())
            .unwrap_or_else(|| self.default_submission_url())
    }
}

pub struct ConfigLoader;

impl ConfigLoader {
    pub fn resolve(path: Option<&str>) -> Result<ResolvedConfig, SyncError> {
        let config_path = match path {
            Some(path) => Utf8PathBuf::from(path),
            None => Utf8PathBuf::from("formsync.json"),
        };

        if path.is_none() && !config_path.as_std_path().exists() {
            return Err(SyncError::MissingConfig);
        }

        let content = fs::read_to_string(config_path.as_std_path())
            .map_err(|_| SyncError::ConfigRead(config_path.clone()))?;
        let config: Config = serde_json::from_str(&content)
            .map_err(|err| SyncError::ConfigParse(err.to_string()))?;

        Self::resolve_config(config)
    }

    pub fn resolve_config(config: Config) -> Result<ResolvedConfig, SyncError> {
        let server_url = config.server_url.trim().trim_end_matches('/').to_string();
        if server_url.is_empty() {
            return Err(SyncError::ConfigParse("server_url is empty".to_string()));
        }

        let forms = config
            .forms
            .into_iter()
            .map(|entry| match entry {
                FormEntry::Shorthand(value) => Ok(FormSelection {
                    form_id: value.parse()?,
                    submission_url: None,
                }),
                FormEntry::Detailed(obj) => Ok(FormSelection {
                    form_id: obj.form_id.parse()?,
                    submission_url: obj.submission_url,
                }),
            })
            .collect::<Result<Vec<_>, SyncError>>()?;

        Ok(ResolvedConfig {
            server_url,
            listing_path: config
                .listing_path
                .unwrap_or_else(|| DEFAULT_LISTING_PATH.to_string()),
            submission_path: config
                .submission_path
                .unwrap_or_else(|| DEFAULT_SUBMISSION_PATH.to_string()),
            auth_token: config.auth_token,
            app_root: Utf8PathBuf::from(
                config.app_root.unwrap_or_else(|| ".formsync".to_string()),
            ),
            forms,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_config_defaults_and_overrides() {
        let config = Config {
            server_url: "https://data.example.org/odk/".to_string(),
            listing_path: None,
            submission_path: None,
            auth_token: Some("tok".to_string()),
            app_root: None,
            forms: vec![
                FormEntry::Shorthand("census".to_string()),
                FormEntry::Detailed(FormEntryObject {
                    form_id: "survey".to_string(),
                    submission_url: Some("https://other.example.org/submit".to_string()),
                }),
            ],
        };

        let resolved = ConfigLoader::resolve_config(config).unwrap();
        assert_eq!(resolved.listing_url(), "https://data.example.org/odk/formList");
        assert_eq!(
            resolved.default_submission_url(),
            "https://data.example.org/odk/submission"
        );

        let census: FormId = "census".parse().unwrap();
        let survey: FormId = "survey".parse().unwrap();
        assert_eq!(
            resolved.submission_url_for(&census),
            "https://data.example.org/odk/submission"
        );
        assert_eq!(
            resolved.submission_url_for(&survey),
            "https://other.example.org/submit"
        );
        assert_eq!(resolved.app_root, Utf8PathBuf::from(".formsync"));
    }

    #[test]
    fn empty_server_url_is_rejected() {
        let config = Config {
            server_url: "  ".to_string(),
            listing_path: None,
            submission_path: None,
            auth_token: None,
            app_root: None,
            forms: Vec::new(),
        };
        assert!(ConfigLoader::resolve_config(config).is_err());
    }
}
