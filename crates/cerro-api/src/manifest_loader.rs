//! Manifest loading with URL-first resolution and local-file fallback.
//!
//! The remote fetch carries its own timeout, independent of request-serving
//! timeouts, and uses conditional GET (`If-None-Match` / `If-Modified-Since`)
//! on refresh so an unchanged manifest costs one cheap round trip.
//!
//! Loading never touches the published route table; callers decide what to
//! do with the outcome (build a new table, or keep serving the old one).

use std::path::Path;

use bytes::Bytes;
use reqwest::header::{ETAG, IF_MODIFIED_SINCE, IF_NONE_MATCH, LAST_MODIFIED};
use reqwest::StatusCode;
use tokio::sync::Mutex;

use cerro_core::manifest::{parse_models, ModelDescriptor};
use cerro_core::{Error, Result};

use crate::config::ManifestConfig;

/// Where a manifest load ultimately came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManifestSource {
    /// Fetched from the configured URL.
    Url,
    /// Read from the local fallback path.
    File,
}

/// A successfully loaded and parsed manifest.
#[derive(Debug)]
pub struct LoadedManifest {
    /// Raw document bytes (fingerprinted by the table build).
    pub bytes: Bytes,
    /// Parsed model descriptors.
    pub models: Vec<ModelDescriptor>,
    /// Which source produced the bytes.
    pub source: ManifestSource,
}

/// Outcome of a load attempt.
#[derive(Debug)]
pub enum LoadOutcome {
    /// The remote source reported the document unchanged (HTTP 304).
    Unchanged,
    /// A manifest was loaded and parsed.
    Loaded(LoadedManifest),
}

#[derive(Debug, Default)]
struct Validators {
    etag: Option<String>,
    last_modified: Option<String>,
}

/// Fetches and parses the manifest document.
#[derive(Debug)]
pub struct ManifestLoader {
    config: ManifestConfig,
    http: reqwest::Client,
    validators: Mutex<Validators>,
}

impl ManifestLoader {
    /// Creates a loader with its own fetch timeout.
    #[must_use]
    pub fn new(config: ManifestConfig) -> Self {
        let timeout = std::time::Duration::from_secs(config.fetch_timeout_secs);
        let http = match reqwest::Client::builder().timeout(timeout).build() {
            Ok(client) => client,
            Err(err) => {
                tracing::warn!(
                    error = %err,
                    "Failed to configure reqwest client; using defaults"
                );
                reqwest::Client::new()
            }
        };

        Self {
            config,
            http,
            validators: Mutex::new(Validators::default()),
        }
    }

    /// Loads the manifest: URL first, local file on any URL failure.
    ///
    /// With `conditional` set, validators from the previous successful
    /// remote fetch are sent and a 304 yields [`LoadOutcome::Unchanged`].
    ///
    /// # Errors
    ///
    /// Returns [`Error::ManifestMalformed`] when a fetched document fails
    /// parsing (after exhausting sources), or [`Error::ManifestUnavailable`]
    /// when every configured source failed to produce a document.
    pub async fn load(&self, conditional: bool) -> Result<LoadOutcome> {
        let mut failures: Vec<Error> = Vec::new();

        if let Some(url) = self.config.url.clone() {
            match self.fetch_remote(&url, conditional).await {
                Ok(None) => {
                    tracing::debug!(url = %url, "manifest not modified (304)");
                    return Ok(LoadOutcome::Unchanged);
                }
                Ok(Some(bytes)) => match parse_models(&bytes) {
                    Ok(models) => {
                        tracing::info!(url = %url, models = models.len(), "manifest fetched");
                        return Ok(LoadOutcome::Loaded(LoadedManifest {
                            bytes,
                            models,
                            source: ManifestSource::Url,
                        }));
                    }
                    Err(err) => {
                        tracing::warn!(url = %url, error = %err, "remote manifest unusable");
                        failures.push(err);
                    }
                },
                Err(err) => {
                    tracing::warn!(url = %url, error = %err, "manifest fetch failed");
                    failures.push(err);
                }
            }
        }

        if let Some(path) = self.config.path.clone() {
            match self.read_local(&path).await {
                Ok(bytes) => match parse_models(&bytes) {
                    Ok(models) => {
                        // Local bytes carry no HTTP validators; drop any
                        // stale ones so the next conditional fetch is
                        // unconditional.
                        *self.validators.lock().await = Validators::default();
                        tracing::info!(path = %path.display(), models = models.len(), "manifest loaded from file");
                        return Ok(LoadOutcome::Loaded(LoadedManifest {
                            bytes,
                            models,
                            source: ManifestSource::File,
                        }));
                    }
                    Err(err) => {
                        tracing::warn!(path = %path.display(), error = %err, "local manifest unusable");
                        failures.push(err);
                    }
                },
                Err(err) => {
                    tracing::warn!(path = %path.display(), error = %err, "local manifest unreadable");
                    failures.push(err);
                }
            }
        }

        Err(combine_failures(failures))
    }

    async fn fetch_remote(&self, url: &str, conditional: bool) -> Result<Option<Bytes>> {
        let mut request = self.http.get(url);
        if conditional {
            let validators = self.validators.lock().await;
            if let Some(etag) = &validators.etag {
                request = request.header(IF_NONE_MATCH, etag);
            }
            if let Some(last_modified) = &validators.last_modified {
                request = request.header(IF_MODIFIED_SINCE, last_modified);
            }
        }

        let response = request
            .send()
            .await
            .map_err(|e| Error::unavailable_with_source(format!("GET {url} failed"), e))?;

        if response.status() == StatusCode::NOT_MODIFIED {
            return Ok(None);
        }
        if !response.status().is_success() {
            return Err(Error::unavailable(format!(
                "GET {url} returned {}",
                response.status()
            )));
        }

        let etag = header_value(&response, ETAG);
        let last_modified = header_value(&response, LAST_MODIFIED);

        let bytes = response
            .bytes()
            .await
            .map_err(|e| Error::unavailable_with_source(format!("GET {url} body read failed"), e))?;

        let mut validators = self.validators.lock().await;
        validators.etag = etag;
        validators.last_modified = last_modified;

        Ok(Some(bytes))
    }

    async fn read_local(&self, path: &Path) -> Result<Bytes> {
        tokio::fs::read(path)
            .await
            .map(Bytes::from)
            .map_err(|e| {
                Error::unavailable_with_source(format!("failed to read {}", path.display()), e)
            })
    }
}

fn header_value(response: &reqwest::Response, name: reqwest::header::HeaderName) -> Option<String> {
    response
        .headers()
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string)
}

fn combine_failures(mut failures: Vec<Error>) -> Error {
    if failures.is_empty() {
        return Error::unavailable("no manifest source configured");
    }
    if failures.len() == 1 {
        return failures.remove(0);
    }
    // A malformed document is the more actionable diagnosis than a generic
    // fetch failure.
    if let Some(pos) = failures
        .iter()
        .position(|e| matches!(e, Error::ManifestMalformed { .. }))
    {
        return failures.remove(pos);
    }
    let messages: Vec<String> = failures.iter().map(ToString::to_string).collect();
    Error::unavailable(messages.join(" | "))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    use tempfile::NamedTempFile;

    fn loader_for(file: &NamedTempFile) -> ManifestLoader {
        ManifestLoader::new(ManifestConfig {
            url: None,
            path: Some(file.path().to_path_buf()),
            ..ManifestConfig::default()
        })
    }

    #[tokio::test]
    async fn loads_from_local_file() {
        let mut file = NamedTempFile::new().expect("create temp file");
        write!(
            file,
            r#"{{"nodes": {{"model.p.m": {{"resource_type": "model", "name": "m", "tags": []}}}}}}"#
        )
        .expect("write manifest");

        let outcome = loader_for(&file).load(false).await.unwrap();
        match outcome {
            LoadOutcome::Loaded(loaded) => {
                assert_eq!(loaded.models.len(), 1);
                assert_eq!(loaded.source, ManifestSource::File);
            }
            LoadOutcome::Unchanged => panic!("first load cannot be unchanged"),
        }
    }

    #[tokio::test]
    async fn malformed_local_file_is_malformed_error() {
        let mut file = NamedTempFile::new().expect("create temp file");
        write!(file, "not json").expect("write");

        let err = loader_for(&file).load(false).await.unwrap_err();
        assert!(matches!(err, Error::ManifestMalformed { .. }), "{err}");
    }

    #[tokio::test]
    async fn missing_everything_is_unavailable() {
        let loader = ManifestLoader::new(ManifestConfig {
            url: None,
            path: Some("/nonexistent/manifest.json".into()),
            ..ManifestConfig::default()
        });
        let err = loader.load(false).await.unwrap_err();
        assert!(matches!(err, Error::ManifestUnavailable { .. }), "{err}");
    }

    #[test]
    fn combine_prefers_malformed_over_unavailable() {
        let combined = combine_failures(vec![
            Error::unavailable("fetch failed"),
            Error::malformed("bad node"),
        ]);
        assert!(matches!(combined, Error::ManifestMalformed { .. }));
    }
}
