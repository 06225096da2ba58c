//! Request identity used to address stored responses.

use std::fmt;

/// Identity of a stored request: method plus scope-relative URL.
///
/// Byte-range headers never take part in the identity, so a ranged request
/// for an audio file addresses the same entry as the full request.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RequestKey(String);

impl RequestKey {
    /// Build a key from a method and a URL path (with optional query).
    /// Any fragment is dropped.
    pub fn new(method: &str, url: &str) -> Self {
        let url = url.split('#').next().unwrap_or(url);
        let url = if url.is_empty() { "/" } else { url };
        Self(format!("{}:{}", method.to_ascii_uppercase(), url))
    }

    /// Key for a GET of `path`.
    pub fn get(path: &str) -> Self {
        Self::new("GET", path)
    }

    /// Key for a manifest path such as `./index.html`, resolved against the
    /// scope root.
    pub fn for_manifest_path(path: &str) -> Self {
        Self::get(&resolve_scope_path(path))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The URL part of the key (everything after `METHOD:`).
    pub fn url(&self) -> &str {
        self.0.split_once(':').map(|(_, url)| url).unwrap_or("")
    }

    /// The URL path without its query string.
    pub fn path(&self) -> &str {
        let url = self.url();
        url.split('?').next().unwrap_or(url)
    }
}

impl fmt::Display for RequestKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Resolve a scope-relative path (`./`, `./a/b.css`, `a.js`, `/x`) to an
/// absolute path rooted at `/`.
pub fn resolve_scope_path(path: &str) -> String {
    let trimmed = path.trim();
    let rest = trimmed
        .strip_prefix("./")
        .or_else(|| trimmed.strip_prefix('/'))
        .unwrap_or(if trimmed == "." { "" } else { trimmed });
    format!("/{rest}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn method_is_normalised() {
        assert_eq!(RequestKey::new("get", "/a").as_str(), "GET:/a");
    }

    #[test]
    fn fragment_is_ignored() {
        assert_eq!(RequestKey::get("/index.html#top"), RequestKey::get("/index.html"));
    }

    #[test]
    fn query_is_part_of_identity() {
        assert_ne!(RequestKey::get("/?song=a"), RequestKey::get("/?song=b"));
        assert_eq!(RequestKey::get("/?song=a").path(), "/");
    }

    #[test]
    fn manifest_paths_resolve_against_scope_root() {
        assert_eq!(resolve_scope_path("./"), "/");
        assert_eq!(resolve_scope_path("."), "/");
        assert_eq!(resolve_scope_path("./index.html"), "/index.html");
        assert_eq!(resolve_scope_path("icons/icon-192.png"), "/icons/icon-192.png");
        assert_eq!(resolve_scope_path("/style.css"), "/style.css");
        assert_eq!(
            RequestKey::for_manifest_path("./style.css").as_str(),
            "GET:/style.css"
        );
    }

    #[test]
    fn url_accessor_strips_method() {
        let key = RequestKey::get("/mp3/a.mp3?v=2");
        assert_eq!(key.url(), "/mp3/a.mp3?v=2");
        assert_eq!(key.path(), "/mp3/a.mp3");
    }
}
