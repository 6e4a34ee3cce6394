// GateCrash Forms - Anti-Abuse Guard
// Copyright 2026 Joseph Stone - All Rights Reserved
//
// Cheap checks that run before any validation or storage:
//   1. Honeypot  - non-empty _gotcha = bot. Consumes no rate-limit slot.
//   2. CSRF      - server-held single-use tokens (only when enabled).
//   3. Rate      - per-identifier sliding window, bounded identifier map.
// State is explicit and injected; `now` is always passed in.

use crate::config::{RateLimitConfig, SecurityConfig};
use crate::paths;
use crate::submission::RawSubmission;
use chrono::{DateTime, Duration, SecondsFormat, Utc};
use parking_lot::Mutex;
use rand::distributions::Alphanumeric;
use rand::Rng;
use sha2::{Digest, Sha256};
use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};

const CSRF_TOKEN_LEN: usize = 32;
/// Ten years; keeps `now + ttl` and window arithmetic in range
const MAX_SPAN_SECS: u64 = 10 * 365 * 24 * 3600;

/// Why the guard turned a submission away
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    Spam,
    Csrf,
    RateLimited,
}

// ============================================================================
// RATE LIMITER
// ============================================================================

struct RateWindow {
    hits: VecDeque<DateTime<Utc>>,
    last_seen: DateTime<Utc>,
}

/// Sliding-window limiter: at most `max_requests` admits per identifier
/// within any trailing `window`. Tracks at most `max_identifiers`; when full,
/// the least recently active identifier is evicted.
pub struct RateLimiter {
    max_requests: usize,
    window: Duration,
    max_identifiers: usize,
    windows: Mutex<HashMap<String, RateWindow>>,
}

impl RateLimiter {
    pub fn new(max_requests: usize, window_ms: u64, max_identifiers: usize) -> Self {
        Self {
            max_requests,
            window: Duration::milliseconds(window_ms.min(MAX_SPAN_SECS * 1000) as i64),
            max_identifiers: max_identifiers.max(1),
            windows: Mutex::new(HashMap::new()),
        }
    }

    pub fn from_config(config: &RateLimitConfig) -> Self {
        Self::new(config.max_requests, config.window_ms, config.max_identifiers)
    }

    /// Admit one event for `identifier` at `now`, or deny it
    pub fn admit(&self, identifier: &str, now: DateTime<Utc>) -> bool {
        let mut windows = self.windows.lock();

        if !windows.contains_key(identifier) && windows.len() >= self.max_identifiers {
            self.make_room(&mut windows, now);
        }

        let entry = windows.entry(identifier.to_string()).or_insert_with(|| RateWindow {
            hits: VecDeque::new(),
            last_seen: now,
        });

        while let Some(oldest) = entry.hits.front() {
            if now - *oldest >= self.window {
                entry.hits.pop_front();
            } else {
                break;
            }
        }
        entry.last_seen = now;

        if entry.hits.len() >= self.max_requests {
            return false;
        }
        entry.hits.push_back(now);
        true
    }

    /// Drop fully expired windows; if still full, evict the stalest one
    fn make_room(&self, windows: &mut HashMap<String, RateWindow>, now: DateTime<Utc>) {
        windows.retain(|_, w| w.hits.back().map(|t| now - *t < self.window).unwrap_or(false));

        if windows.len() >= self.max_identifiers {
            let stalest = windows
                .iter()
                .min_by_key(|(_, w)| w.last_seen)
                .map(|(k, _)| k.clone());
            if let Some(key) = stalest {
                log::debug!("Rate limiter full, evicting identifier {}", key);
                windows.remove(&key);
            }
        }
    }

    /// Identifiers currently tracked
    pub fn tracked(&self) -> usize {
        self.windows.lock().len()
    }
}

// ============================================================================
// HONEYPOT
// ============================================================================

/// True when the hidden `_gotcha` field carries anything
pub fn honeypot_tripped(submission: &RawSubmission) -> bool {
    submission.honeypot().map(|v| !v.is_empty()).unwrap_or(false)
}

// ============================================================================
// CSRF
// ============================================================================

/// Where issued token digests live
enum TokenBackend {
    Memory(Mutex<HashMap<String, DateTime<Utc>>>),
    /// One file per digest holding its expiry; shared across processes
    Files(PathBuf),
}

/// Server-held CSRF tokens. Only SHA-256 digests are kept; each token is
/// valid once, until its expiry.
pub struct CsrfTokens {
    ttl: Duration,
    backend: TokenBackend,
}

fn token_digest(token: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(token.as_bytes());
    hex::encode(hasher.finalize())
}

fn read_expiry(path: &Path) -> std::io::Result<Option<DateTime<Utc>>> {
    let text = std::fs::read_to_string(path)?;
    Ok(DateTime::parse_from_rfc3339(text.trim())
        .ok()
        .map(|t| t.with_timezone(&Utc)))
}

impl CsrfTokens {
    /// Tokens held by this process only
    pub fn new(ttl_secs: u64) -> Self {
        Self {
            ttl: Duration::seconds(ttl_secs.min(MAX_SPAN_SECS) as i64),
            backend: TokenBackend::Memory(Mutex::new(HashMap::new())),
        }
    }

    /// Tokens persisted under `dir`, so one process can issue and another verify
    pub fn persistent(dir: impl Into<PathBuf>, ttl_secs: u64) -> Self {
        Self {
            ttl: Duration::seconds(ttl_secs.min(MAX_SPAN_SECS) as i64),
            backend: TokenBackend::Files(dir.into()),
        }
    }

    /// Issue a fresh token for embedding in a rendered form
    pub fn issue(&self, now: DateTime<Utc>) -> std::io::Result<String> {
        let token: String = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(CSRF_TOKEN_LEN)
            .map(char::from)
            .collect();
        let expires = now + self.ttl;

        match &self.backend {
            TokenBackend::Memory(issued) => {
                let mut issued = issued.lock();
                issued.retain(|_, exp| *exp > now);
                issued.insert(token_digest(&token), expires);
            }
            TokenBackend::Files(dir) => {
                std::fs::create_dir_all(dir)?;
                prune_expired(dir, now);
                std::fs::write(
                    dir.join(token_digest(&token)),
                    expires.to_rfc3339_opts(SecondsFormat::Millis, true),
                )?;
            }
        }
        Ok(token)
    }

    /// Consume a token. Unknown, reused, or expired tokens fail.
    pub fn verify(&self, token: &str, now: DateTime<Utc>) -> bool {
        if token.is_empty() {
            return false;
        }
        let digest = token_digest(token);

        match &self.backend {
            TokenBackend::Memory(issued) => match issued.lock().remove(&digest) {
                Some(expires) => expires > now,
                None => false,
            },
            TokenBackend::Files(dir) => {
                let path = dir.join(&digest);
                let expires = match read_expiry(&path) {
                    Ok(expires) => expires,
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => return false,
                    Err(e) => {
                        log::warn!("Unreadable CSRF token file {:?}: {}", path, e);
                        return false;
                    }
                };
                // Whoever removes the file consumed the token
                if std::fs::remove_file(&path).is_err() {
                    return false;
                }
                expires.map(|t| t > now).unwrap_or(false)
            }
        }
    }

    /// Tokens issued and not yet consumed (expired ones included until pruned)
    pub fn outstanding(&self) -> usize {
        match &self.backend {
            TokenBackend::Memory(issued) => issued.lock().len(),
            TokenBackend::Files(dir) => std::fs::read_dir(dir)
                .map(|entries| entries.filter_map(|e| e.ok()).count())
                .unwrap_or(0),
        }
    }
}

/// Best effort: a failed prune only leaves stale files behind
fn prune_expired(dir: &Path, now: DateTime<Utc>) {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return;
    };
    for path in entries.filter_map(|e| e.ok()).map(|e| e.path()) {
        let expired = match read_expiry(&path) {
            Ok(Some(expires)) => expires <= now,
            Ok(None) => true,
            Err(_) => false,
        };
        if expired {
            let _ = std::fs::remove_file(&path);
        }
    }
}

// ============================================================================
// GUARD
// ============================================================================

/// Honeypot -> CSRF -> rate limit, in that order
pub struct AntiAbuseGuard {
    limiter: RateLimiter,
    csrf: Option<CsrfTokens>,
}

impl AntiAbuseGuard {
    pub fn new(limiter: RateLimiter, csrf: Option<CsrfTokens>) -> Self {
        Self { limiter, csrf }
    }

    /// Rate limits from config. CSRF tokens, when required, persist under
    /// `security.csrf_dir` resolved against `base_dir`.
    pub fn from_config(rate: &RateLimitConfig, security: &SecurityConfig, base_dir: &Path) -> Self {
        let csrf = security.require_csrf.then(|| {
            CsrfTokens::persistent(paths::resolve(base_dir, &security.csrf_dir), security.csrf_ttl_secs)
        });
        Self::new(RateLimiter::from_config(rate), csrf)
    }

    pub fn limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    /// CSRF token store, when enforcement is on
    pub fn csrf(&self) -> Option<&CsrfTokens> {
        self.csrf.as_ref()
    }

    /// Admit a submission from `identifier`. Spam and CSRF rejections never
    /// consume a rate-limit slot.
    pub fn check(
        &self,
        submission: &RawSubmission,
        identifier: &str,
        now: DateTime<Utc>,
    ) -> Result<(), Rejection> {
        if honeypot_tripped(submission) {
            return Err(Rejection::Spam);
        }

        if let Some(csrf) = &self.csrf {
            let token = submission.csrf_token().unwrap_or_default();
            if !csrf.verify(&token, now) {
                return Err(Rejection::Csrf);
            }
        }

        if !self.limiter.admit(identifier, now) {
            return Err(Rejection::RateLimited);
        }

        Ok(())
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(ms: i64) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(ms).unwrap()
    }

    #[test]
    fn window_rolls_over() {
        let limiter = RateLimiter::new(3, 1000, 100);
        assert!(limiter.admit("1.2.3.4", at(0)));
        assert!(limiter.admit("1.2.3.4", at(0)));
        assert!(limiter.admit("1.2.3.4", at(0)));
        assert!(!limiter.admit("1.2.3.4", at(0)));
        assert!(!limiter.admit("1.2.3.4", at(999)));
        assert!(limiter.admit("1.2.3.4", at(1001)));
    }

    #[test]
    fn identifiers_are_independent() {
        let limiter = RateLimiter::new(1, 60_000, 100);
        assert!(limiter.admit("a", at(0)));
        assert!(!limiter.admit("a", at(1)));
        assert!(limiter.admit("b", at(1)));
    }

    #[test]
    fn denied_calls_do_not_extend_the_window() {
        let limiter = RateLimiter::new(1, 1000, 10);
        assert!(limiter.admit("x", at(0)));
        assert!(!limiter.admit("x", at(500)));
        assert!(limiter.admit("x", at(1000)));
    }

    #[test]
    fn identifier_map_is_bounded() {
        let limiter = RateLimiter::new(5, 60_000, 3);
        for (i, id) in ["a", "b", "c", "d", "e"].iter().enumerate() {
            assert!(limiter.admit(id, at(i as i64)));
        }
        assert_eq!(limiter.tracked(), 3);
        // "a" was evicted as stalest, so it starts fresh
        assert!(limiter.admit("a", at(10)));
    }

    #[test]
    fn concurrent_admits_never_exceed_limit() {
        let limiter = std::sync::Arc::new(RateLimiter::new(50, 60_000, 10));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let limiter = std::sync::Arc::clone(&limiter);
                std::thread::spawn(move || (0..20).filter(|_| limiter.admit("shared", at(0))).count())
            })
            .collect();
        let admitted: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(admitted, 50);
    }

    #[test]
    fn honeypot_rejects_without_consuming_quota() {
        let guard = AntiAbuseGuard::new(RateLimiter::new(1, 60_000, 10), None);
        let mut bot = RawSubmission::new();
        bot.insert("_gotcha", "http://spam.example");

        for _ in 0..5 {
            assert_eq!(guard.check(&bot, "9.9.9.9", at(0)), Err(Rejection::Spam));
        }
        let human: RawSubmission = vec![("_gotcha", ""), ("name", "Ada")].into_iter().collect();
        assert_eq!(guard.limiter().tracked(), 0);
        assert_eq!(guard.check(&human, "9.9.9.9", at(0)), Ok(()));
        assert_eq!(guard.check(&human, "9.9.9.9", at(1)), Err(Rejection::RateLimited));
    }

    #[test]
    fn csrf_tokens_are_single_use_and_expire() {
        let tokens = CsrfTokens::new(60);
        let token = tokens.issue(at(0)).unwrap();
        assert_eq!(token.len(), CSRF_TOKEN_LEN);
        assert!(token.chars().all(|c| c.is_ascii_alphanumeric()));

        assert_eq!(tokens.outstanding(), 1);
        assert!(tokens.verify(&token, at(1_000)));
        assert!(!tokens.verify(&token, at(2_000)));
        assert_eq!(tokens.outstanding(), 0);

        let stale = tokens.issue(at(0)).unwrap();
        assert!(!tokens.verify(&stale, at(61_000)));
        assert!(!tokens.verify("forged", at(0)));
        assert!(!tokens.verify("", at(0)));
    }

    #[test]
    fn csrf_failure_consumes_no_quota() {
        let guard = AntiAbuseGuard::new(RateLimiter::new(1, 60_000, 10), Some(CsrfTokens::new(60)));
        let forged: RawSubmission = vec![("_csrf", "nope")].into_iter().collect();
        assert_eq!(guard.check(&forged, "ip", at(0)), Err(Rejection::Csrf));

        let token = guard.csrf().unwrap().issue(at(0)).unwrap();
        let good: RawSubmission = vec![("_csrf", token.as_str())].into_iter().collect();
        assert_eq!(guard.check(&good, "ip", at(0)), Ok(()));
    }

    #[test]
    fn persistent_tokens_cross_instances() {
        let dir = tempfile::tempdir().unwrap();
        let issuer = CsrfTokens::persistent(dir.path().join("csrf"), 60);
        let token = issuer.issue(at(0)).unwrap();
        assert_eq!(issuer.outstanding(), 1);

        // Only the digest reaches disk
        let names: Vec<String> = std::fs::read_dir(dir.path().join("csrf"))
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
            .collect();
        assert_eq!(names, vec![token_digest(&token)]);

        let verifier = CsrfTokens::persistent(dir.path().join("csrf"), 60);
        assert!(verifier.verify(&token, at(1_000)));
        assert!(!issuer.verify(&token, at(1_000)));
        assert_eq!(verifier.outstanding(), 0);
    }

    #[test]
    fn persistent_tokens_expire_and_get_pruned() {
        let dir = tempfile::tempdir().unwrap();
        let tokens = CsrfTokens::persistent(dir.path(), 60);
        let stale = tokens.issue(at(0)).unwrap();
        assert!(!tokens.verify(&stale, at(61_000)));

        tokens.issue(at(0)).unwrap();
        tokens.issue(at(120_000)).unwrap();
        assert_eq!(tokens.outstanding(), 1);
    }
}
