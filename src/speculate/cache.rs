//! Bounded LRU cache of speculative reasoning results.
//!
//! A small recency list over canonical keys plus a map of records. The
//! cache keeps results that missed their own commit (e.g. the user paused
//! and re-spoke) available for a short freshness window so a near-future
//! turn can still reuse them.

use super::canonical::{compatible, shared_word_prefix_len};
use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

/// A completed speculative reasoning result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrainResult {
    /// Canonical form of the input the result was computed for.
    pub canonical: String,
    /// The delta stream exactly as the adapter produced it.
    pub deltas: Vec<String>,
    /// The adapter's final text.
    pub final_text: String,
}

#[derive(Debug)]
struct CacheEntry {
    result: BrainResult,
    inserted_at: Instant,
}

/// Bounded LRU keyed by canonical input.
#[derive(Debug)]
pub struct PrefetchCache {
    entries: HashMap<String, CacheEntry>,
    /// Recency order, most recent at the back.
    order: VecDeque<String>,
    max_entries: usize,
    fresh: Duration,
}

impl PrefetchCache {
    pub fn new(max_entries: usize, fresh: Duration) -> Self {
        Self {
            entries: HashMap::new(),
            order: VecDeque::new(),
            max_entries: max_entries.max(1),
            fresh,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Insert a result, replacing any entry with the same canonical and
    /// evicting the LRU tail when over capacity.
    pub fn store(&mut self, result: BrainResult) {
        let key = result.canonical.clone();
        if self.entries.contains_key(&key) {
            self.order.retain(|k| k != &key);
        }
        self.entries.insert(
            key.clone(),
            CacheEntry {
                result,
                inserted_at: Instant::now(),
            },
        );
        self.order.push_back(key);

        while self.entries.len() > self.max_entries {
            if let Some(oldest) = self.order.pop_front() {
                self.entries.remove(&oldest);
            } else {
                break;
            }
        }
    }

    /// Look up a result for a committed canonical. Exact matches win;
    /// otherwise the progression-compatible entry sharing the longest word
    /// prefix is chosen. Stale entries encountered during the probe are
    /// evicted. A hit is promoted to most-recently-used.
    pub fn probe(&mut self, committed_canonical: &str) -> Option<ProbeHit> {
        self.evict_stale();

        let exact = self.entries.contains_key(committed_canonical);
        let key = if exact {
            committed_canonical.to_owned()
        } else {
            let mut best: Option<(usize, &str)> = None;
            for key in self.entries.keys() {
                if !compatible(key, committed_canonical) {
                    continue;
                }
                let shared = shared_word_prefix_len(key, committed_canonical);
                if best.map_or(true, |(best_shared, _)| shared > best_shared) {
                    best = Some((shared, key.as_str()));
                }
            }
            best?.1.to_owned()
        };

        self.order.retain(|k| k != &key);
        self.order.push_back(key.clone());
        let result = self.entries.get(&key).map(|e| e.result.clone())?;
        Some(ProbeHit {
            exact,
            result,
        })
    }

    fn evict_stale(&mut self) {
        let fresh = self.fresh;
        let now = Instant::now();
        let stale: Vec<String> = self
            .entries
            .iter()
            .filter(|(_, e)| now.duration_since(e.inserted_at) > fresh)
            .map(|(k, _)| k.clone())
            .collect();
        for key in stale {
            self.entries.remove(&key);
            self.order.retain(|k| k != &key);
        }
    }
}

/// A cache probe hit, tagged exact or fuzzy for metrics.
#[derive(Debug, Clone)]
pub struct ProbeHit {
    pub exact: bool,
    pub result: BrainResult,
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;

    fn result(canonical: &str) -> BrainResult {
        BrainResult {
            canonical: canonical.to_owned(),
            deltas: vec!["Sure".to_owned(), ", here".to_owned()],
            final_text: "Sure, here".to_owned(),
        }
    }

    fn cache() -> PrefetchCache {
        PrefetchCache::new(4, Duration::from_secs(90))
    }

    #[test]
    fn store_twice_keeps_single_entry() {
        let mut cache = cache();
        cache.store(result("build api endpoint"));
        cache.store(result("build api endpoint"));
        assert_eq!(cache.len(), 1);
        let hit = cache.probe("build api endpoint").unwrap();
        assert!(hit.exact);
    }

    #[test]
    fn exact_match_wins() {
        let mut cache = cache();
        cache.store(result("build api"));
        cache.store(result("build api endpoint"));
        let hit = cache.probe("build api").unwrap();
        assert!(hit.exact);
        assert_eq!(hit.result.canonical, "build api");
    }

    #[test]
    fn fuzzy_match_with_trailing_correction() {
        let mut cache = cache();
        cache.store(result("build api endpoint with auth middleware"));
        let hit = cache
            .probe("build api endpoint with auth middlewares")
            .unwrap();
        assert!(!hit.exact);
        assert_eq!(hit.result.canonical, "build api endpoint with auth middleware");
    }

    #[test]
    fn divergent_commit_misses() {
        let mut cache = cache();
        cache.store(result("build api endpoint with auth middleware"));
        assert!(cache.probe("build api endpoint for markdown parser").is_none());
    }

    #[test]
    fn capacity_evicts_lru_tail() {
        let mut cache = PrefetchCache::new(2, Duration::from_secs(90));
        cache.store(result("alpha one two three"));
        cache.store(result("beta one two three"));
        // Touch alpha so beta becomes the LRU tail.
        assert!(cache.probe("alpha one two three").is_some());
        cache.store(result("gamma one two three"));
        assert_eq!(cache.len(), 2);
        assert!(cache.probe("beta one two three").is_none());
        assert!(cache.probe("alpha one two three").is_some());
    }

    #[test]
    fn stale_entries_evicted_on_probe() {
        let mut cache = PrefetchCache::new(4, Duration::ZERO);
        cache.store(result("build api endpoint"));
        std::thread::sleep(Duration::from_millis(5));
        assert!(cache.probe("build api endpoint").is_none());
        assert!(cache.is_empty());
    }
}
