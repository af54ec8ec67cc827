//! The user's preferred backend address.

use anyhow::Result;

use super::KvStore;
use crate::transport::client::parse_base_url;

pub const BACKEND_BASE_URL_KEY: &str = "backend.base_url";

/// Read the stored backend address, if any.
pub fn preferred_base_url(store: &KvStore) -> Result<Option<String>> {
    Ok(store
        .get(BACKEND_BASE_URL_KEY)?
        .filter(|v| !v.trim().is_empty()))
}

/// Validate and store a backend address. Malformed addresses are rejected
/// before anything is written.
pub fn set_preferred_base_url(store: &KvStore, address: &str) -> Result<()> {
    parse_base_url(address)?;
    store.put(BACKEND_BASE_URL_KEY, address.trim())
}

pub fn clear_preferred_base_url(store: &KvStore) -> Result<()> {
    store.delete(BACKEND_BASE_URL_KEY)
}
