//! DNS response caching with TTL expiration
//!
//! A byte-budgeted LRU cache keyed on (name, record type). TTLs are
//! clamped to a narrow band: the floor prevents cache churn from
//! aggressive zones, the ceiling keeps entries from outliving a tunnel
//! endpoint move.

use std::hash::{Hash, Hasher};
use std::time::{Duration, Instant};

use hickory_proto::op::{Message, Query, ResponseCode};
use hickory_proto::rr::RecordType;
use lru::LruCache;

/// Default cache budget in bytes
pub const DEFAULT_CAPACITY_BYTES: usize = 4 * 1024 * 1024;

/// Minimum TTL applied to cached responses
pub const MIN_TTL_SECS: u64 = 30;

/// Maximum TTL applied to cached responses
pub const MAX_TTL_SECS: u64 = 300;

/// TTL for cached NXDOMAIN answers
const NEGATIVE_TTL_SECS: u64 = 60;

/// Cache key for DNS queries
#[derive(Debug, Clone, Eq, PartialEq)]
struct CacheKey {
    /// Domain name (lowercased)
    name: String,
    record_type: RecordType,
}

impl Hash for CacheKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.name.hash(state);
        u16::from(self.record_type).hash(state);
    }
}

impl CacheKey {
    fn from_query(query: &Query) -> Self {
        Self {
            name: query.name().to_string().to_lowercase(),
            record_type: query.query_type(),
        }
    }
}

#[derive(Debug)]
struct CacheEntry {
    response: Vec<u8>,
    expires_at: Instant,
}

impl CacheEntry {
    fn is_expired(&self) -> bool {
        Instant::now() >= self.expires_at
    }
}

/// Cache statistics
#[derive(Debug, Clone, Default)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub entries: usize,
    pub used_bytes: usize,
}

/// Byte-budgeted DNS response cache with TTL expiration
pub struct ResponseCache {
    entries: LruCache<CacheKey, CacheEntry>,
    capacity_bytes: usize,
    used_bytes: usize,
    stats: CacheStats,
}

impl ResponseCache {
    /// Create a cache with the given byte budget
    pub fn new(capacity_bytes: usize) -> Self {
        Self {
            entries: LruCache::unbounded(),
            capacity_bytes,
            used_bytes: 0,
            stats: CacheStats::default(),
        }
    }

    /// Look up a cached response for the query.
    ///
    /// The returned bytes carry the *cached* message id; the caller must
    /// patch in the live query's id before replying.
    pub fn get(&mut self, query: &Query) -> Option<Vec<u8>> {
        let key = CacheKey::from_query(query);

        let live = match self.entries.get(&key) {
            Some(entry) if entry.is_expired() => None,
            Some(entry) => Some(entry.response.clone()),
            None => {
                self.stats.misses += 1;
                return None;
            }
        };

        match live {
            Some(response) => {
                self.stats.hits += 1;
                Some(response)
            }
            None => {
                if let Some(old) = self.entries.pop(&key) {
                    self.used_bytes -= old.response.len();
                }
                self.stats.misses += 1;
                self.stats.entries = self.entries.len();
                self.stats.used_bytes = self.used_bytes;
                None
            }
        }
    }

    /// Insert a response, evicting least-recently-used entries until the
    /// byte budget holds. Responses without a usable TTL are not cached.
    pub fn insert(&mut self, query: &Query, response: &[u8]) {
        let ttl = match extract_ttl(response) {
            Some(ttl) => ttl.clamp(MIN_TTL_SECS, MAX_TTL_SECS),
            None => return,
        };

        if response.len() > self.capacity_bytes {
            return;
        }

        let key = CacheKey::from_query(query);
        if let Some(old) = self.entries.pop(&key) {
            self.used_bytes -= old.response.len();
        }

        while self.used_bytes + response.len() > self.capacity_bytes {
            match self.entries.pop_lru() {
                Some((_, evicted)) => {
                    self.used_bytes -= evicted.response.len();
                    self.stats.evictions += 1;
                }
                None => break,
            }
        }

        self.used_bytes += response.len();
        self.entries.put(
            key,
            CacheEntry {
                response: response.to_vec(),
                expires_at: Instant::now() + Duration::from_secs(ttl),
            },
        );
        self.stats.entries = self.entries.len();
        self.stats.used_bytes = self.used_bytes;
    }

    /// Current statistics
    pub fn stats(&self) -> &CacheStats {
        &self.stats
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Minimum TTL across answer and authority records; NXDOMAIN answers get
/// a fixed negative-cache TTL.
fn extract_ttl(response: &[u8]) -> Option<u64> {
    let message = Message::from_vec(response).ok()?;

    let mut min_ttl: Option<u64> = None;
    for record in message.answers().iter().chain(message.name_servers()) {
        let ttl = record.ttl() as u64;
        min_ttl = Some(min_ttl.map_or(ttl, |m| m.min(ttl)));
    }

    if min_ttl.is_none() && message.response_code() == ResponseCode::NXDomain {
        min_ttl = Some(NEGATIVE_TTL_SECS);
    }

    min_ttl
}
