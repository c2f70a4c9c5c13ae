//! Per-host leaf certificate cache with single-flight issuance.
//!
//! Concurrent handshakes for the same hostname share one in-flight issuance;
//! every caller receives the same `Arc<LeafCredential>`.

use crate::ca::{CertificateAuthority, LeafCredential};
use crate::error::ProxyError;
use chrono::Utc;
use log::{debug, warn};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::OnceCell;

struct Slot {
    cell: Arc<OnceCell<Arc<LeafCredential>>>,
    last_used: u64,
}

struct CacheState {
    slots: HashMap<String, Slot>,
    tick: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LeafCacheMetrics {
    pub hits: u64,
    pub misses: u64,
    pub entries: usize,
}

pub struct LeafCertificateCache {
    ca: Arc<CertificateAuthority>,
    capacity: usize,
    state: Mutex<CacheState>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl LeafCertificateCache {
    pub fn new(ca: Arc<CertificateAuthority>, capacity: usize) -> Self {
        Self {
            ca,
            capacity: capacity.max(1),
            state: Mutex::new(CacheState {
                slots: HashMap::new(),
                tick: 0,
            }),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    pub fn authority(&self) -> &Arc<CertificateAuthority> {
        &self.ca
    }

    /// Return the cached leaf for `hostname`, issuing it at most once.
    pub async fn get_or_issue(&self, hostname: &str) -> Result<Arc<LeafCredential>, ProxyError> {
        let key = normalize_host(hostname);
        if key.is_empty() {
            return Err(ProxyError::issuance(hostname, "empty hostname"));
        }

        loop {
            let cell = self.slot_for(&key)?;

            if let Some(leaf) = cell.get() {
                if leaf.is_valid_at(Utc::now()) {
                    self.hits.fetch_add(1, Ordering::Relaxed);
                    return Ok(Arc::clone(leaf));
                }
                debug!("Cached leaf for {} expired, reissuing", key);
                self.forget(&key, &cell)?;
                continue;
            }

            let ca = Arc::clone(&self.ca);
            let issue_key = key.clone();
            let result = cell
                .get_or_try_init(|| async move {
                    self.misses.fetch_add(1, Ordering::Relaxed);
                    let leaf = tokio::task::spawn_blocking(move || ca.issue_leaf(&issue_key))
                        .await
                        .map_err(|e| ProxyError::issuance(hostname, e))??;
                    Ok::<_, ProxyError>(Arc::new(leaf))
                })
                .await;

            return match result {
                Ok(leaf) => Ok(Arc::clone(leaf)),
                Err(e) => {
                    // the cell stays empty; drop the slot so the next request starts over
                    warn!("Leaf issuance for {} failed: {}", key, e);
                    self.forget(&key, &cell)?;
                    Err(e)
                }
            };
        }
    }

    pub fn len(&self) -> usize {
        self.state.lock().map(|s| s.slots.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn issuance_count(&self) -> u64 {
        self.ca.issued_count()
    }

    pub fn metrics(&self) -> LeafCacheMetrics {
        LeafCacheMetrics {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            entries: self.len(),
        }
    }

    fn slot_for(&self, key: &str) -> Result<Arc<OnceCell<Arc<LeafCredential>>>, ProxyError> {
        let mut state = self
            .state
            .lock()
            .map_err(|_| ProxyError::issuance(key, "leaf cache lock poisoned"))?;
        state.tick += 1;
        let tick = state.tick;

        if let Some(slot) = state.slots.get_mut(key) {
            slot.last_used = tick;
            return Ok(Arc::clone(&slot.cell));
        }

        if state.slots.len() >= self.capacity {
            evict_least_recent(&mut state);
        }

        let cell = Arc::new(OnceCell::new());
        state.slots.insert(
            key.to_string(),
            Slot {
                cell: Arc::clone(&cell),
                last_used: tick,
            },
        );
        Ok(cell)
    }

    fn forget(&self, key: &str, cell: &Arc<OnceCell<Arc<LeafCredential>>>) -> Result<(), ProxyError> {
        let mut state = self
            .state
            .lock()
            .map_err(|_| ProxyError::issuance(key, "leaf cache lock poisoned"))?;
        if state
            .slots
            .get(key)
            .is_some_and(|slot| Arc::ptr_eq(&slot.cell, cell))
        {
            state.slots.remove(key);
        }
        Ok(())
    }
}

/// Issuances still in flight are never evicted, so their waiters and any
/// later caller keep sharing one cell.
fn evict_least_recent(state: &mut CacheState) {
    let oldest = state
        .slots
        .iter()
        .filter(|(_, slot)| slot.cell.initialized())
        .min_by_key(|(_, slot)| slot.last_used)
        .map(|(key, _)| key.clone());
    if let Some(key) = oldest {
        debug!("Evicting cached leaf for {}", key);
        state.slots.remove(&key);
    }
}

pub fn normalize_host(host: &str) -> String {
    host.trim()
        .trim_start_matches('[')
        .trim_end_matches(']')
        .trim_end_matches('.')
        .to_ascii_lowercase()
}
