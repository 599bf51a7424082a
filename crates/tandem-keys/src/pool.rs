//! Round-robin key rotation with error accounting and cooldown timeouts.

use std::collections::HashMap;
use std::io::BufRead;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use rand::seq::SliceRandom;
use tokio::sync::mpsc;
use tracing::{info, warn};

use tandem_core::config::KEY_PREFIX;

use crate::error::KeyPoolError;

/// Default cooldown before an exhausted key is put back into rotation.
const EXHAUST_COOLDOWN: Duration = Duration::from_secs(18 * 3600);
/// Quota errors within one cooldown window before a key is timed out.
const QUOTA_THRESHOLD: u32 = 3;

/// Classified error fed back from a dispatcher attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyErrorKind {
    /// RESOURCE_EXHAUSTED — counts toward the eviction threshold.
    Quota,
    /// Authentication failure — the key is dead, drop it permanently.
    Invalid,
    /// Transient server error — counted but never evicts.
    Server,
    /// Not a key problem (bad request shape etc.) — no retry.
    Other,
}

/// Notification sent to the admin channel when a key leaves rotation.
#[derive(Debug, Clone)]
pub struct KeyEvent {
    /// Last six characters of the key — never the full credential.
    pub key_tail: String,
    pub reason: String,
}

/// Counts surfaced by `/stats`.
#[derive(Debug, Clone, Copy, Default)]
pub struct KeyStatuses {
    pub active: usize,
    pub active_billing: usize,
    pub exhausted: usize,
    pub exhausted_billing: usize,
    pub total: usize,
    pub total_billing: usize,
}

/// One rotation set. The billing set is a subset of the general set; the same
/// key string may live in both, with independent exhaustion state.
#[derive(Default)]
struct KeySet {
    active: Vec<String>,
    exhausted: HashMap<String, Instant>,
    quota_errors: HashMap<String, u32>,
    server_errors: HashMap<String, u32>,
    index: u64,
    total: usize,
}

impl KeySet {
    fn reactivate_due(&mut self, cooldown: Duration) {
        let now = Instant::now();
        let due: Vec<String> = self
            .exhausted
            .iter()
            .filter(|(_, at)| now.duration_since(**at) >= cooldown)
            .map(|(k, _)| k.clone())
            .collect();
        for key in due {
            self.exhausted.remove(&key);
            self.quota_errors.remove(&key);
            self.active.push(key.clone());
            info!(key_tail = tail(&key), "key reactivated after cooldown");
        }
    }

    fn exhaust(&mut self, key: &str) {
        self.active.retain(|k| k != key);
        self.exhausted.insert(key.to_string(), Instant::now());
    }

    fn remove(&mut self, key: &str) {
        self.active.retain(|k| k != key);
        self.exhausted.remove(key);
        self.quota_errors.remove(key);
        self.server_errors.remove(key);
    }
}

struct Inner {
    general: KeySet,
    billing: KeySet,
}

/// Owns the Google credential pool. One mutex serialises all mutations;
/// acquisition is sub-millisecond so contention is irrelevant at chat rates.
pub struct KeyPool {
    inner: Mutex<Inner>,
    cooldown: Duration,
    quota_threshold: u32,
    events: Option<mpsc::UnboundedSender<KeyEvent>>,
}

impl KeyPool {
    /// Load the pool from a key file. One key per line, `AIzaSy...` prefix;
    /// a trailing `b` or `| billing enabled` marks the key billing-enabled.
    /// Blank and non-matching lines are ignored; duplicates warn and skip.
    pub fn from_file(
        path: &str,
        events: Option<mpsc::UnboundedSender<KeyEvent>>,
    ) -> Result<Self, KeyPoolError> {
        Self::with_options(path, events, EXHAUST_COOLDOWN, QUOTA_THRESHOLD)
    }

    pub fn with_options(
        path: &str,
        events: Option<mpsc::UnboundedSender<KeyEvent>>,
        cooldown: Duration,
        quota_threshold: u32,
    ) -> Result<Self, KeyPoolError> {
        let file = std::fs::File::open(path).map_err(|e| KeyPoolError::KeyFile {
            path: path.to_string(),
            source: e,
        })?;

        let mut general: Vec<String> = Vec::new();
        let mut billing: Vec<String> = Vec::new();

        for line in std::io::BufReader::new(file).lines() {
            let line = match line {
                Ok(l) => l,
                Err(e) => {
                    return Err(KeyPoolError::KeyFile {
                        path: path.to_string(),
                        source: e,
                    })
                }
            };
            let line = line.trim();
            if !line.starts_with(KEY_PREFIX) {
                continue;
            }
            let (key, marker) = match line.split_once(char::is_whitespace) {
                Some((k, rest)) => (k.to_string(), rest.trim().to_lowercase()),
                None => (line.to_string(), String::new()),
            };
            if general.contains(&key) {
                warn!(key_tail = tail(&key), "duplicate key in list file, skipping");
                continue;
            }
            let is_billing = marker == "b" || marker == "| billing enabled";
            general.push(key.clone());
            if is_billing {
                billing.push(key);
            }
        }

        let mut rng = rand::rng();
        general.shuffle(&mut rng);
        billing.shuffle(&mut rng);

        info!(
            total = general.len(),
            billing = billing.len(),
            "loaded API keys"
        );

        Ok(Self {
            inner: Mutex::new(Inner {
                general: KeySet {
                    total: general.len(),
                    active: general,
                    ..Default::default()
                },
                billing: KeySet {
                    total: billing.len(),
                    active: billing,
                    ..Default::default()
                },
            }),
            cooldown,
            quota_threshold,
            events,
        })
    }

    /// Hand out the next active key, round-robin over the relevant set.
    /// Exhausted keys whose cooldown has elapsed rejoin first.
    pub fn acquire(&self, billing_only: bool) -> Result<String, KeyPoolError> {
        let mut inner = self.inner.lock().unwrap();
        let set = if billing_only {
            &mut inner.billing
        } else {
            &mut inner.general
        };
        set.reactivate_due(self.cooldown);

        if set.active.is_empty() {
            return Err(if billing_only {
                KeyPoolError::OutOfBillingKeys
            } else {
                KeyPoolError::OutOfKeys
            });
        }

        let key = set.active[(set.index % set.active.len() as u64) as usize].clone();
        set.index += 1;
        Ok(key)
    }

    /// Account for a failed attempt with `key`. Returns whether the caller
    /// should rotate to another key and retry.
    pub fn handle_error(&self, key: &str, kind: KeyErrorKind, is_billing: bool) -> bool {
        let mut inner = self.inner.lock().unwrap();
        match kind {
            KeyErrorKind::Quota => {
                let set = if is_billing {
                    &mut inner.billing
                } else {
                    &mut inner.general
                };
                let count = set.quota_errors.entry(key.to_string()).or_insert(0);
                *count += 1;
                if *count >= self.quota_threshold {
                    set.exhaust(key);
                    info!(key_tail = tail(key), "key exhausted, timed out");
                    self.notify(key, "quota exhausted");
                }
                true
            }
            KeyErrorKind::Invalid => {
                inner.general.remove(key);
                inner.billing.remove(key);
                warn!(key_tail = tail(key), "invalid key removed permanently");
                self.notify(key, "invalid API key");
                true
            }
            KeyErrorKind::Server => {
                let set = if is_billing {
                    &mut inner.billing
                } else {
                    &mut inner.general
                };
                *set.server_errors.entry(key.to_string()).or_insert(0) += 1;
                true
            }
            KeyErrorKind::Other => false,
        }
    }

    pub fn statuses(&self) -> KeyStatuses {
        let inner = self.inner.lock().unwrap();
        KeyStatuses {
            active: inner.general.active.len(),
            active_billing: inner.billing.active.len(),
            exhausted: inner.general.exhausted.len(),
            exhausted_billing: inner.billing.exhausted.len(),
            total: inner.general.total,
            total_billing: inner.billing.total,
        }
    }

    fn notify(&self, key: &str, reason: &str) {
        if let Some(tx) = &self.events {
            let _ = tx.send(KeyEvent {
                key_tail: tail(key).to_string(),
                reason: reason.to_string(),
            });
        }
    }
}

fn tail(key: &str) -> &str {
    let n = key.len().saturating_sub(6);
    &key[n..]
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::io::Write;

    fn pool_from(lines: &str, cooldown: Duration) -> KeyPool {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(lines.as_bytes()).unwrap();
        KeyPool::with_options(f.path().to_str().unwrap(), None, cooldown, 3).unwrap()
    }

    #[test]
    fn loads_and_marks_billing_keys() {
        let pool = pool_from(
            "AIzaSyAAA111\nAIzaSyBBB222 b\n\nnot-a-key\nAIzaSyCCC333 | billing enabled\n",
            EXHAUST_COOLDOWN,
        );
        let st = pool.statuses();
        assert_eq!(st.total, 3);
        assert_eq!(st.total_billing, 2);
    }

    #[test]
    fn duplicate_keys_are_skipped() {
        let pool = pool_from("AIzaSyAAA111\nAIzaSyAAA111 b\n", EXHAUST_COOLDOWN);
        let st = pool.statuses();
        assert_eq!(st.total, 1);
        assert_eq!(st.total_billing, 0);
    }

    #[test]
    fn acquire_covers_both_keys_once() {
        let pool = pool_from("AIzaSyAAA111\nAIzaSyBBB222 b\n", EXHAUST_COOLDOWN);
        let first = pool.acquire(false).unwrap();
        let second = pool.acquire(false).unwrap();
        let got: HashSet<String> = [first, second].into_iter().collect();
        assert_eq!(
            got,
            ["AIzaSyAAA111", "AIzaSyBBB222"]
                .into_iter()
                .map(String::from)
                .collect()
        );
        assert_eq!(pool.acquire(true).unwrap(), "AIzaSyBBB222");
    }

    #[test]
    fn round_robin_is_fair() {
        let pool = pool_from(
            "AIzaSyAAA111\nAIzaSyBBB222\nAIzaSyCCC333\n",
            EXHAUST_COOLDOWN,
        );
        let mut counts: HashMap<String, u32> = HashMap::new();
        for _ in 0..12 {
            *counts.entry(pool.acquire(false).unwrap()).or_insert(0) += 1;
        }
        assert_eq!(counts.len(), 3);
        assert!(counts.values().all(|&c| c == 4));
    }

    #[test]
    fn quota_threshold_evicts_then_cooldown_restores() {
        let pool = pool_from("AIzaSyAAA111\n", Duration::ZERO);
        for _ in 0..2 {
            assert!(pool.handle_error("AIzaSyAAA111", KeyErrorKind::Quota, false));
            assert!(pool.acquire(false).is_ok());
        }
        assert!(pool.handle_error("AIzaSyAAA111", KeyErrorKind::Quota, false));

        // Zero cooldown: the key is already due, so it comes straight back
        // with a fresh counter.
        assert_eq!(pool.acquire(false).unwrap(), "AIzaSyAAA111");
        assert!(pool.handle_error("AIzaSyAAA111", KeyErrorKind::Quota, false));
        assert!(pool.acquire(false).is_ok());
    }

    #[test]
    fn eviction_empties_the_pool() {
        let pool = pool_from("AIzaSyAAA111\n", EXHAUST_COOLDOWN);
        for _ in 0..3 {
            pool.handle_error("AIzaSyAAA111", KeyErrorKind::Quota, false);
        }
        assert!(matches!(pool.acquire(false), Err(KeyPoolError::OutOfKeys)));
    }

    #[test]
    fn invalid_key_removed_from_both_sets() {
        let pool = pool_from("AIzaSyAAA111 b\nAIzaSyBBB222\n", EXHAUST_COOLDOWN);
        pool.handle_error("AIzaSyAAA111", KeyErrorKind::Invalid, false);
        let st = pool.statuses();
        assert_eq!(st.active, 1);
        assert_eq!(st.active_billing, 0);
        assert!(matches!(
            pool.acquire(true),
            Err(KeyPoolError::OutOfBillingKeys)
        ));
    }

    #[test]
    fn server_errors_never_evict() {
        let pool = pool_from("AIzaSyAAA111\n", EXHAUST_COOLDOWN);
        for _ in 0..10 {
            assert!(pool.handle_error("AIzaSyAAA111", KeyErrorKind::Server, false));
        }
        assert!(pool.acquire(false).is_ok());
    }

    #[test]
    fn other_errors_do_not_retry() {
        let pool = pool_from("AIzaSyAAA111\n", EXHAUST_COOLDOWN);
        assert!(!pool.handle_error("AIzaSyAAA111", KeyErrorKind::Other, false));
    }

    #[test]
    fn eviction_notifies_admin_channel() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(b"AIzaSyAAA111\n").unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let pool = KeyPool::with_options(
            f.path().to_str().unwrap(),
            Some(tx),
            EXHAUST_COOLDOWN,
            1,
        )
        .unwrap();
        pool.handle_error("AIzaSyAAA111", KeyErrorKind::Quota, false);
        let event = rx.try_recv().unwrap();
        assert_eq!(event.key_tail, "AAA111");
    }
}
