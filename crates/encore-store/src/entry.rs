use bytes::Bytes;
use std::time::Instant;
use thiserror::Error;

/// A stored HTTP response. The body is reference-counted, so cloning an entry
/// never copies payload bytes.
#[derive(Clone, Debug)]
pub struct CachedEntry {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
    pub inserted_at: Instant,
}

impl CachedEntry {
    pub fn new(status: u16, headers: Vec<(String, String)>, body: Bytes) -> Self {
        Self {
            status,
            headers,
            body,
            inserted_at: Instant::now(),
        }
    }

    /// Bytes charged against a generation quota: body plus header text.
    pub fn weight(&self) -> usize {
        self.body.len()
            + self
                .headers
                .iter()
                .map(|(k, v)| k.len() + v.len())
                .sum::<usize>()
    }

    /// Look up a header value by case-insensitive name.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// Snapshot of one generation's counters.
#[derive(Clone, Debug, Default)]
pub struct StoreStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub entries: usize,
    pub bytes: usize,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("quota exceeded: {needed} bytes needed, {available} of {quota} available")]
    QuotaExceeded {
        needed: usize,
        available: usize,
        quota: usize,
    },
}
