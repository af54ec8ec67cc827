//! jobscope -- observe, replay and audit remote agent test jobs.
//!
//! This crate provides the core library for talking to a job backend, polling
//! job status, tailing run artifacts, and rebuilding timelines, playback
//! frames and event logs from what those artifacts contain.

pub mod config;
pub mod observe;
pub mod reconstruct;
pub mod storage;
pub mod transport;

use anyhow::{Context, Result};

use crate::config::{JobscopeConfig, DEFAULT_BASE_URL};
use crate::transport::ApiClient;

/// Pick the backend address: explicit flag, then config file, then the stored
/// preference, then the built-in default.
pub fn resolve_base_url(
    flag: Option<&str>,
    config: &JobscopeConfig,
    store: &storage::KvStore,
) -> Result<String> {
    if let Some(url) = flag.filter(|u| !u.trim().is_empty()) {
        return Ok(url.to_string());
    }
    if let Some(url) = config.backend.base_url.as_deref().filter(|u| !u.trim().is_empty()) {
        return Ok(url.to_string());
    }
    if let Some(url) = storage::prefs::preferred_base_url(store)? {
        return Ok(url);
    }
    Ok(DEFAULT_BASE_URL.to_string())
}

/// Build a client for the resolved backend address.
pub fn connect(
    flag: Option<&str>,
    config: &JobscopeConfig,
    store: &storage::KvStore,
) -> Result<ApiClient> {
    let base_url = resolve_base_url(flag, config, store)?;
    let client = ApiClient::new(&base_url, config.backend.request_timeout())
        .with_context(|| format!("cannot use backend address '{}'", base_url))?;
    tracing::debug!(base_url = %client.base_url(), "backend client ready");
    Ok(client)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base_url_precedence() {
        let dir = tempfile::tempdir().unwrap();
        let pool = storage::open_pool(dir.path().join("state.db").to_str().unwrap()).unwrap();
        let store = storage::KvStore::new(pool);
        let mut config = JobscopeConfig::default();

        assert_eq!(resolve_base_url(None, &config, &store).unwrap(), DEFAULT_BASE_URL);

        storage::prefs::set_preferred_base_url(&store, "http://stored:8000").unwrap();
        assert_eq!(resolve_base_url(None, &config, &store).unwrap(), "http://stored:8000");

        config.backend.base_url = Some("http://configured:8000".into());
        assert_eq!(
            resolve_base_url(None, &config, &store).unwrap(),
            "http://configured:8000"
        );

        assert_eq!(
            resolve_base_url(Some("http://flag:8000"), &config, &store).unwrap(),
            "http://flag:8000"
        );
        assert_eq!(
            resolve_base_url(Some("  "), &config, &store).unwrap(),
            "http://configured:8000"
        );
    }

    #[test]
    fn test_connect_rejects_bad_address() {
        let dir = tempfile::tempdir().unwrap();
        let pool = storage::open_pool(dir.path().join("state.db").to_str().unwrap()).unwrap();
        let store = storage::KvStore::new(pool);
        let config = JobscopeConfig::default();

        let err = connect(Some("ftp://example.com"), &config, &store).err().unwrap();
        assert!(err.to_string().contains("ftp://example.com"));

        let client = connect(Some("http://localhost:9000"), &config, &store).unwrap();
        assert_eq!(client.base_url(), "http://localhost:9000/api/v1");
    }
}
