//! Cache key derivation.
//!
//! Keys have the shape `{prefix}:{METHOD}:{path}:{query}` where `query` is the
//! request's query pairs, minus ignored names, sorted by name and
//! form-urlencoded. Keys longer than [`MAX_KEY_LEN`] bytes are replaced by
//! `{prefix}:hash:{sha256 hex}` of the full key.

use sha2::{Digest, Sha256};
use url::form_urlencoded;

use super::CacheConfig;
use crate::Method;

pub const MAX_KEY_LEN: usize = 200;

/// Builds the key for `method path?query`.
pub(crate) fn derive(
    config: &CacheConfig,
    method: &Method,
    path: &str,
    query: &[(String, String)],
) -> String {
    let mut pairs: Vec<&(String, String)> = query
        .iter()
        .filter(|(name, _)| !config.is_ignored(name))
        .collect();
    // Stable: repeated names keep their relative order.
    pairs.sort_by(|a, b| a.0.cmp(&b.0));

    let mut encoded = form_urlencoded::Serializer::new(String::new());
    for (name, value) in pairs {
        encoded.append_pair(name, value);
    }

    let key = format!(
        "{}:{}:{}:{}",
        config.key_prefix,
        method.as_str(),
        path,
        encoded.finish()
    );

    if key.len() > MAX_KEY_LEN {
        let digest = Sha256::digest(key.as_bytes());
        return format!("{}:hash:{}", config.key_prefix, hex::encode(digest));
    }
    key
}
