//! Progressive-trust reputation store
//!
//! Each identity accrues a profile of completions and failures. The trust
//! tier is a pure function of profile age, completion count, and failure
//! rate, recomputed on every access so persisted tiers can never go stale
//! or be forged through the state file.

use chrono::Utc;
use eyre::{Result, WrapErr};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{debug, warn};

use crate::identity::is_valid_identity_key;

/// Profile cap; the oldest-activity entry is evicted before an insert
/// that would exceed it.
pub const MAX_PROFILES: usize = 10_000;

const DAY_SECS: i64 = 86_400;

/// Reputation buckets, each mapping to a free-tier daily limit
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrustTier {
    New,
    Familiar,
    Established,
    Trusted,
}

impl TrustTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            TrustTier::New => "new",
            TrustTier::Familiar => "familiar",
            TrustTier::Established => "established",
            TrustTier::Trusted => "trusted",
        }
    }

    /// Tasks per UTC day granted to this tier
    pub fn daily_limit(&self) -> u32 {
        match self {
            TrustTier::New => 10,
            TrustTier::Familiar => 25,
            TrustTier::Established => 50,
            TrustTier::Trusted => 100,
        }
    }
}

impl fmt::Display for TrustTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Per-identity reputation record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrustProfile {
    pub did: String,
    pub tier: TrustTier,
    /// Unix seconds of first observation
    pub first_seen: i64,
    pub completed_tasks: u64,
    pub failed_tasks: u64,
    /// Unix seconds of the most recent recorded activity
    pub last_activity: i64,
}

impl TrustProfile {
    fn new(did: &str, now_s: i64) -> Self {
        Self {
            did: did.to_string(),
            tier: TrustTier::New,
            first_seen: now_s,
            completed_tasks: 0,
            failed_tasks: 0,
            last_activity: now_s,
        }
    }

    /// Fraction of recorded tasks that failed; 0.0 with no history
    pub fn failure_rate(&self) -> f64 {
        let total = self.completed_tasks + self.failed_tasks;
        if total == 0 {
            return 0.0;
        }
        self.failed_tasks as f64 / total as f64
    }

    /// Highest tier whose thresholds the profile meets
    pub fn evaluate_tier(&self, now_s: i64) -> TrustTier {
        let age = now_s - self.first_seen;
        let rate = self.failure_rate();

        if age >= 90 * DAY_SECS && self.completed_tasks >= 50 && rate < 0.10 {
            TrustTier::Trusted
        } else if age >= 30 * DAY_SECS && self.completed_tasks >= 20 && rate < 0.20 {
            TrustTier::Established
        } else if age >= 7 * DAY_SECS && self.completed_tasks >= 5 {
            TrustTier::Familiar
        } else {
            TrustTier::New
        }
    }
}

/// Process-wide reputation store with JSON persistence
pub struct TrustStore {
    path: PathBuf,
    profiles: Mutex<HashMap<String, TrustProfile>>,
}

impl TrustStore {
    /// Load profiles from `path`, skipping keys that fail the identity
    /// regexes. A missing or corrupt file starts empty.
    pub fn load(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let profiles = match std::fs::read_to_string(&path) {
            Ok(raw) => match serde_json::from_str::<HashMap<String, TrustProfile>>(&raw) {
                Ok(mut loaded) => {
                    loaded.retain(|k, _| is_valid_identity_key(k));
                    debug!(profiles = loaded.len(), "Trust store loaded");
                    loaded
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Corrupt trust store, starting empty");
                    HashMap::new()
                }
            },
            Err(_) => HashMap::new(),
        };

        Self {
            path,
            profiles: Mutex::new(profiles),
        }
    }

    /// Current profile for an identity, with the tier freshly evaluated.
    /// Returns `None` for identities never observed.
    pub fn profile(&self, identity: &str) -> Option<TrustProfile> {
        let now_s = Utc::now().timestamp();
        let profiles = self.profiles.lock().expect("trust lock poisoned");
        profiles.get(identity).map(|p| {
            let mut p = p.clone();
            p.tier = p.evaluate_tier(now_s);
            p
        })
    }

    /// Profile for an identity, creating one on first observation
    pub fn observe(&self, identity: &str) -> TrustProfile {
        let now_s = Utc::now().timestamp();
        let mut profiles = self.profiles.lock().expect("trust lock poisoned");
        if !profiles.contains_key(identity) {
            Self::evict_if_full(&mut profiles);
            profiles.insert(identity.to_string(), TrustProfile::new(identity, now_s));
        }
        let mut p = profiles
            .get(identity)
            .expect("profile inserted above")
            .clone();
        p.tier = p.evaluate_tier(now_s);
        p
    }

    /// Daily task limit applicable to an identity, by current tier
    pub fn daily_limit_for(&self, identity: &str) -> u32 {
        self.observe(identity).tier.daily_limit()
    }

    pub fn record_completion(&self, identity: &str) {
        self.record(identity, true);
    }

    pub fn record_failure(&self, identity: &str) {
        self.record(identity, false);
    }

    fn record(&self, identity: &str, completed: bool) {
        let now_s = Utc::now().timestamp();
        let mut profiles = self.profiles.lock().expect("trust lock poisoned");
        if !profiles.contains_key(identity) {
            Self::evict_if_full(&mut profiles);
            profiles.insert(identity.to_string(), TrustProfile::new(identity, now_s));
        }
        let entry = profiles.get_mut(identity).expect("profile inserted above");
        if completed {
            entry.completed_tasks += 1;
        } else {
            entry.failed_tasks += 1;
        }
        entry.last_activity = now_s;
        entry.tier = entry.evaluate_tier(now_s);
    }

    /// Evict the least-recently-active profile when at capacity. Runs before
    /// insertion so the map never exceeds [`MAX_PROFILES`].
    fn evict_if_full(profiles: &mut HashMap<String, TrustProfile>) {
        while profiles.len() >= MAX_PROFILES {
            let oldest = profiles
                .iter()
                .min_by_key(|(_, p)| p.last_activity)
                .map(|(k, _)| k.clone());
            match oldest {
                Some(k) => {
                    profiles.remove(&k);
                }
                None => break,
            }
        }
    }

    /// Persist all profiles. Best-effort: errors log and continue.
    pub fn save(&self) {
        let snapshot = {
            let profiles = self.profiles.lock().expect("trust lock poisoned");
            profiles.clone()
        };
        if let Err(e) = write_store_file(&self.path, &snapshot) {
            warn!(path = %self.path.display(), error = %e, "Failed to persist trust store");
        }
    }

    pub fn len(&self) -> usize {
        self.profiles.lock().expect("trust lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[cfg(test)]
    pub fn insert_for_test(&self, profile: TrustProfile) {
        self.profiles
            .lock()
            .unwrap()
            .insert(profile.did.clone(), profile);
    }
}

fn write_store_file(path: &Path, profiles: &HashMap<String, TrustProfile>) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).wrap_err("creating state directory")?;
    }
    let json = serde_json::to_string_pretty(profiles).wrap_err("serializing trust store")?;
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, json).wrap_err("writing temp trust store")?;
    std::fs::rename(&tmp, path).wrap_err("renaming trust store into place")?;
    Ok(())
}
