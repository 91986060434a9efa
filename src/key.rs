//! Storage key derivation.
//!
//! A URL maps to the object key `host + path`. Scheme, userinfo, query and
//! fragment are dropped, so `http://` and `https://` variants of one resource,
//! or two requests differing only in their query string, land on the same key
//! and simply add generations to it.

use crate::event::ParseError;
use crate::models::StorageKey;
use url::Url;

/// Derive the storage key for `raw`.
///
/// The host keeps an explicit non-default port (`localhost:8080/a`). The path
/// is percent-decoded; if the decoded bytes are not UTF-8 the encoded path is
/// used as is. Slashes are left exactly as URL parsing produced them, which
/// means a bare `https://example.com` yields `example.com/`.
///
/// # Errors
///
/// - [`ParseError::InvalidUrl`] when `raw` is not an absolute URL
/// - [`ParseError::MissingHost`] when the URL has no host (`mailto:`, `file:///`)
pub fn derive_key(raw: &str) -> Result<StorageKey, ParseError> {
    let url = Url::parse(raw).map_err(|source| ParseError::InvalidUrl {
        url: raw.to_string(),
        source,
    })?;

    let host = url
        .host_str()
        .filter(|h| !h.is_empty())
        .ok_or_else(|| ParseError::MissingHost {
            url: raw.to_string(),
        })?;

    let path = match urlencoding::decode(url.path()) {
        Ok(decoded) => decoded.into_owned(),
        Err(_) => url.path().to_string(),
    };

    let key = match url.port() {
        Some(port) => format!("{host}:{port}{path}"),
        None => format!("{host}{path}"),
    };
    Ok(StorageKey::new(key))
}
