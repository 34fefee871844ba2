//! Daily rate limiting for free-tier identities
//!
//! Two keyed counter maps (by identity, by source IP) with windows that reset
//! at the next UTC midnight. Counters persist to a JSON file so restarts do
//! not hand out fresh quota; enforcement is best-effort and never fails a
//! request on a persistence error.
//!
//! File shape (`rate-limits.json`, mode 0600):
//! `{"did": {"<identity>": {"count": n, "reset_at": ts}}, "ip": {...}}`

use chrono::{Duration as ChronoDuration, TimeZone, Utc};
use eyre::{Result, WrapErr};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{debug, warn};

use crate::identity::is_valid_identity_key;

/// Fixed per-IP daily ceiling, independent of the identity limit
pub const IP_DAILY_LIMIT: u32 = 20;

/// How often the periodic persistence task flushes, seconds
pub const SAVE_INTERVAL_SECS: u64 = 60;

/// One counter window
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitEntry {
    pub count: u32,
    /// Unix seconds of the next UTC midnight after the first use
    pub reset_at: i64,
}

impl RateLimitEntry {
    fn fresh(now_s: i64) -> Self {
        Self {
            count: 1,
            reset_at: next_utc_midnight(now_s),
        }
    }

    fn is_expired(&self, now_s: i64) -> bool {
        self.reset_at <= now_s
    }
}

/// Unix seconds of the first UTC midnight strictly after `now_s`
pub fn next_utc_midnight(now_s: i64) -> i64 {
    let now = Utc
        .timestamp_opt(now_s, 0)
        .single()
        .unwrap_or_else(Utc::now);
    let next_day = now.date_naive() + ChronoDuration::days(1);
    next_day
        .and_hms_opt(0, 0, 0)
        .map(|dt| dt.and_utc().timestamp())
        .unwrap_or(now_s + 86_400)
}

/// On-disk shape of the store
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct PersistedLimits {
    #[serde(default)]
    did: HashMap<String, RateLimitEntry>,
    #[serde(default)]
    ip: HashMap<String, RateLimitEntry>,
}

/// Per-identity and per-IP daily counters with file persistence (C1)
/// plus the allow/deny contract used on the hot path (C2).
pub struct FreeTierLimiter {
    path: PathBuf,
    state: Mutex<PersistedLimits>,
}

impl FreeTierLimiter {
    /// Load counters from `path`, discarding expired windows and keys that
    /// fail validation. A missing or corrupt file starts empty.
    pub fn load(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let state = match std::fs::read_to_string(&path) {
            Ok(raw) => match serde_json::from_str::<PersistedLimits>(&raw) {
                Ok(mut loaded) => {
                    let now_s = Utc::now().timestamp();
                    loaded
                        .did
                        .retain(|k, v| is_valid_identity_key(k) && !v.is_expired(now_s));
                    loaded
                        .ip
                        .retain(|k, v| k.parse::<IpAddr>().is_ok() && !v.is_expired(now_s));
                    debug!(
                        identities = loaded.did.len(),
                        ips = loaded.ip.len(),
                        "Rate-limit state loaded"
                    );
                    loaded
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Corrupt rate-limit file, starting empty");
                    PersistedLimits::default()
                }
            },
            Err(_) => PersistedLimits::default(),
        };

        Self {
            path,
            state: Mutex::new(state),
        }
    }

    /// Check both counters against their limits without recording anything.
    ///
    /// Returns `(allowed, reason)`. An expired window counts as absent.
    pub fn can_proceed(&self, identity: &str, ip: &str, daily_limit: u32) -> (bool, Option<String>) {
        let now_s = Utc::now().timestamp();
        let state = self.state.lock().expect("rate-limit lock poisoned");

        if let Some(entry) = state.did.get(identity) {
            if !entry.is_expired(now_s) && entry.count >= daily_limit {
                return (
                    false,
                    Some(format!(
                        "DID daily limit reached ({}/{} tasks today)",
                        entry.count, daily_limit
                    )),
                );
            }
        }

        if let Some(entry) = state.ip.get(ip) {
            if !entry.is_expired(now_s) && entry.count >= IP_DAILY_LIMIT {
                return (
                    false,
                    Some(format!(
                        "IP daily limit reached ({}/{} tasks today)",
                        entry.count, IP_DAILY_LIMIT
                    )),
                );
            }
        }

        (true, None)
    }

    /// Increment both counters, starting a fresh window where needed.
    pub fn record(&self, identity: &str, ip: &str) {
        let now_s = Utc::now().timestamp();
        let mut guard = self.state.lock().expect("rate-limit lock poisoned");
        let state = &mut *guard;

        for (map, key) in [
            (&mut state.did, identity),
            (&mut state.ip, ip),
        ] {
            match map.get_mut(key) {
                Some(entry) if !entry.is_expired(now_s) => entry.count += 1,
                _ => {
                    map.insert(key.to_string(), RateLimitEntry::fresh(now_s));
                }
            }
        }
    }

    /// Remaining quota for an identity under `daily_limit`
    pub fn remaining(&self, identity: &str, daily_limit: u32) -> u32 {
        let now_s = Utc::now().timestamp();
        let state = self.state.lock().expect("rate-limit lock poisoned");
        match state.did.get(identity) {
            Some(entry) if !entry.is_expired(now_s) => daily_limit.saturating_sub(entry.count),
            _ => daily_limit,
        }
    }

    /// Drop expired windows from both maps
    pub fn cleanup(&self) {
        let now_s = Utc::now().timestamp();
        let mut state = self.state.lock().expect("rate-limit lock poisoned");
        state.did.retain(|_, v| !v.is_expired(now_s));
        state.ip.retain(|_, v| !v.is_expired(now_s));
    }

    /// Persist the current counters. Whole-file write via temp + rename so a
    /// crash mid-write never leaves a torn file. Errors log and continue.
    pub fn save(&self) {
        let snapshot = {
            let state = self.state.lock().expect("rate-limit lock poisoned");
            state.clone()
        };
        if let Err(e) = write_state_file(&self.path, &snapshot) {
            warn!(path = %self.path.display(), error = %e, "Failed to persist rate-limit state");
        }
    }

    #[cfg(test)]
    pub fn insert_for_test(&self, identity: &str, entry: RateLimitEntry) {
        self.state
            .lock()
            .unwrap()
            .did
            .insert(identity.to_string(), entry);
    }
}

fn write_state_file(path: &Path, state: &PersistedLimits) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).wrap_err("creating state directory")?;
    }
    let json = serde_json::to_string_pretty(state).wrap_err("serializing rate-limit state")?;
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, json).wrap_err("writing temp rate-limit file")?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&tmp, std::fs::Permissions::from_mode(0o600))
            .wrap_err("setting rate-limit file permissions")?;
    }
    std::fs::rename(&tmp, path).wrap_err("renaming rate-limit file into place")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_limiter() -> (tempfile::TempDir, FreeTierLimiter) {
        let dir = tempfile::tempdir().unwrap();
        let limiter = FreeTierLimiter::load(dir.path().join("rate-limits.json"));
        (dir, limiter)
    }

    #[test]
    fn test_next_utc_midnight_is_future_day_boundary() {
        let now = Utc::now().timestamp();
        let midnight = next_utc_midnight(now);
        assert!(midnight > now);
        assert!(midnight - now <= 86_400);
        assert_eq!(midnight % 86_400, 0);
    }

    #[test]
    fn test_allows_until_identity_limit() {
        let (_dir, limiter) = temp_limiter();
        for _ in 0..10 {
            let (allowed, _) = limiter.can_proceed("user-1", "10.0.0.1", 10);
            assert!(allowed);
            limiter.record("user-1", "10.0.0.1");
        }
        let (allowed, reason) = limiter.can_proceed("user-1", "10.0.0.1", 10);
        assert!(!allowed);
        assert!(reason.unwrap().contains("DID daily limit"));
    }

    #[test]
    fn test_ip_limit_is_independent() {
        let (_dir, limiter) = temp_limiter();
        // 20 distinct identities from one IP exhaust the IP budget
        for i in 0..IP_DAILY_LIMIT {
            limiter.record(&format!("user-{}", i), "10.0.0.9");
        }
        let (allowed, reason) = limiter.can_proceed("fresh-user", "10.0.0.9", 10);
        assert!(!allowed);
        assert!(reason.unwrap().contains("IP daily limit"));

        // A different IP is unaffected
        let (allowed, _) = limiter.can_proceed("fresh-user", "10.0.0.10", 10);
        assert!(allowed);
    }

    #[test]
    fn test_expired_window_treated_as_absent() {
        let (_dir, limiter) = temp_limiter();
        limiter.insert_for_test(
            "user-1",
            RateLimitEntry {
                count: 99,
                reset_at: Utc::now().timestamp() - 1,
            },
        );
        let (allowed, _) = limiter.can_proceed("user-1", "10.0.0.1", 10);
        assert!(allowed);
        assert_eq!(limiter.remaining("user-1", 10), 10);

        // Recording over an expired window restarts the count
        limiter.record("user-1", "10.0.0.1");
        assert_eq!(limiter.remaining("user-1", 10), 9);
    }

    #[test]
    fn test_remaining_never_negative() {
        let (_dir, limiter) = temp_limiter();
        for _ in 0..15 {
            limiter.record("user-1", "10.0.0.1");
        }
        assert_eq!(limiter.remaining("user-1", 10), 0);
    }

    #[test]
    fn test_cleanup_purges_expired() {
        let (_dir, limiter) = temp_limiter();
        limiter.insert_for_test(
            "stale",
            RateLimitEntry {
                count: 3,
                reset_at: Utc::now().timestamp() - 10,
            },
        );
        limiter.record("live", "10.0.0.1");
        limiter.cleanup();
        assert_eq!(limiter.remaining("live", 10), 9);
        // Stale window gone: full quota again
        assert_eq!(limiter.remaining("stale", 10), 10);
    }

    #[test]
    fn test_persist_then_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rate-limits.json");

        let limiter = FreeTierLimiter::load(&path);
        limiter.record("did:key:zUser", "10.0.0.1");
        limiter.record("did:key:zUser", "10.0.0.1");
        limiter.save();

        let reloaded = FreeTierLimiter::load(&path);
        assert_eq!(reloaded.remaining("did:key:zUser", 10), 8);
    }

    #[test]
    fn test_load_skips_invalid_keys() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rate-limits.json");
        let future = Utc::now().timestamp() + 3600;
        let raw = format!(
            r#"{{"did": {{"__proto__": {{"count": 1, "reset_at": {f}}}, "ok_user": {{"count": 2, "reset_at": {f}}}, "bad key!": {{"count": 1, "reset_at": {f}}}}}, "ip": {{"not-an-ip": {{"count": 1, "reset_at": {f}}}}}}}"#,
            f = future
        );
        std::fs::write(&path, raw).unwrap();

        let limiter = FreeTierLimiter::load(&path);
        // "__proto__" happens to match the free-tier charset and is kept;
        // the key with a space and the non-IP entry are dropped.
        assert_eq!(limiter.remaining("ok_user", 10), 8);
        assert_eq!(limiter.remaining("bad key!", 10), 10);
    }

    #[test]
    fn test_corrupt_file_starts_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rate-limits.json");
        std::fs::write(&path, "{not json").unwrap();
        let limiter = FreeTierLimiter::load(&path);
        assert_eq!(limiter.remaining("anyone", 10), 10);
    }

    #[cfg(unix)]
    #[test]
    fn test_saved_file_is_owner_only() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rate-limits.json");
        let limiter = FreeTierLimiter::load(&path);
        limiter.record("u", "10.0.0.1");
        limiter.save();
        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }
}
