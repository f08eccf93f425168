//! Security Gate: the protocol-agnostic policy module every inbound stream passes
//! through before reaching a protocol handler.
//!
//! Enforces a hard message-size cap, LRU duplicate suppression, peer-warning
//! escalation into a time-boxed ban, and a per-peer message rate limit plus
//! per-resource-type quota. Quotas and rate limits apply only to *inbound* traffic
//! from remote peers, never to announcements the local node itself publishes.

use lru::LruCache;
use std::collections::{HashMap, VecDeque};
use std::num::NonZeroUsize;
use std::time::{Duration, Instant};
use swapsig_core::Digest32;
use thiserror::Error;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum SecurityError {
    #[error("message of {0} bytes exceeds the {1} byte cap")]
    Oversized(usize, usize),
    #[error("peer {0} is banned")]
    PeerBanned(String),
    #[error("peer {0} exceeded its message rate limit")]
    RateLimited(String),
    #[error("peer {0} exceeded its quota for resource type {1}")]
    QuotaExceeded(String, String),
}

/// Result of passing an inbound message through [`SecurityGate::admit`].
#[derive(Debug, PartialEq, Eq)]
pub enum Admission {
    /// Message is novel and within every limit; hand it to the protocol handler.
    Accept,
    /// Message digest was already seen; drop it silently, do not hand it off.
    Duplicate,
}

#[derive(Clone, Debug)]
pub struct SecurityConfig {
    pub max_message_size: usize,
    pub duplicate_cache_capacity: usize,
    pub max_warnings_before_ban: u32,
    pub ban_duration: Duration,
    pub rate_limit_per_window: u32,
    pub rate_limit_window: Duration,
    pub resource_quota_per_window: u32,
    pub resource_quota_window: Duration,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            max_message_size: 100 * 1024,
            duplicate_cache_capacity: 10_000,
            max_warnings_before_ban: 3,
            ban_duration: Duration::from_secs(300),
            rate_limit_per_window: 50,
            rate_limit_window: Duration::from_secs(1),
            resource_quota_per_window: 20,
            resource_quota_window: Duration::from_secs(60),
        }
    }
}

#[derive(Default)]
struct PeerState {
    warnings: u32,
    banned_until: Option<Instant>,
    message_times: VecDeque<Instant>,
    resource_times: HashMap<String, VecDeque<Instant>>,
}

/// Single protocol-agnostic gate applied to every inbound stream.
pub struct SecurityGate {
    config: SecurityConfig,
    seen: LruCache<Digest32, ()>,
    peers: HashMap<String, PeerState>,
}

impl SecurityGate {
    pub fn new(config: SecurityConfig) -> Self {
        let capacity = NonZeroUsize::new(config.duplicate_cache_capacity.max(1)).unwrap();
        Self {
            config,
            seen: LruCache::new(capacity),
            peers: HashMap::new(),
        }
    }

    /// Run a just-received message through the full gate: ban check, size cap,
    /// duplicate suppression, and rate limit, in that order.
    pub fn admit(
        &mut self,
        peer: &str,
        raw_len: usize,
        digest: Digest32,
        now: Instant,
    ) -> Result<Admission, SecurityError> {
        if self.is_banned(peer, now) {
            return Err(SecurityError::PeerBanned(peer.to_string()));
        }
        if raw_len > self.config.max_message_size {
            self.warn(peer, now);
            return Err(SecurityError::Oversized(raw_len, self.config.max_message_size));
        }
        if self.is_duplicate(digest) {
            return Ok(Admission::Duplicate);
        }
        self.check_rate_limit(peer, now)?;
        Ok(Admission::Accept)
    }

    /// Record a malformed-message strike against `peer`. Escalates to a time-boxed
    /// ban once `max_warnings_before_ban` is reached.
    pub fn warn(&mut self, peer: &str, now: Instant) {
        let state = self.peers.entry(peer.to_string()).or_default();
        state.warnings += 1;
        if state.warnings >= self.config.max_warnings_before_ban {
            state.banned_until = Some(now + self.config.ban_duration);
            log::warn!("peer {peer} banned after {} warnings", state.warnings);
        } else {
            log::warn!("peer {peer} warned ({}/{})", state.warnings, self.config.max_warnings_before_ban);
        }
    }

    pub fn is_banned(&self, peer: &str, now: Instant) -> bool {
        self.peers
            .get(peer)
            .and_then(|s| s.banned_until)
            .map(|until| now < until)
            .unwrap_or(false)
    }

    /// Insert `digest` into the seen-set, evicting the oldest 10% in bulk whenever
    /// the cache is full rather than evicting one entry per insert.
    fn is_duplicate(&mut self, digest: Digest32) -> bool {
        if self.seen.contains(&digest) {
            return true;
        }
        if self.seen.len() >= self.config.duplicate_cache_capacity {
            let evict_count = (self.config.duplicate_cache_capacity / 10).max(1);
            for _ in 0..evict_count {
                if self.seen.pop_lru().is_none() {
                    break;
                }
            }
        }
        self.seen.put(digest, ());
        false
    }

    fn check_rate_limit(&mut self, peer: &str, now: Instant) -> Result<(), SecurityError> {
        let window = self.config.rate_limit_window;
        let limit = self.config.rate_limit_per_window;
        let state = self.peers.entry(peer.to_string()).or_default();
        while let Some(&front) = state.message_times.front() {
            if now.duration_since(front) > window {
                state.message_times.pop_front();
            } else {
                break;
            }
        }
        if state.message_times.len() as u32 >= limit {
            return Err(SecurityError::RateLimited(peer.to_string()));
        }
        state.message_times.push_back(now);
        Ok(())
    }

    /// Track a remote peer's announcement of `resource_type`, rejecting once their
    /// quota for that type is exceeded within the configured window.
    pub fn check_resource_quota(
        &mut self,
        peer: &str,
        resource_type: &str,
        now: Instant,
    ) -> Result<(), SecurityError> {
        let window = self.config.resource_quota_window;
        let limit = self.config.resource_quota_per_window;
        let state = self.peers.entry(peer.to_string()).or_default();
        let times = state
            .resource_times
            .entry(resource_type.to_string())
            .or_default();
        while let Some(&front) = times.front() {
            if now.duration_since(front) > window {
                times.pop_front();
            } else {
                break;
            }
        }
        if times.len() as u32 >= limit {
            return Err(SecurityError::QuotaExceeded(
                peer.to_string(),
                resource_type.to_string(),
            ));
        }
        times.push_back(now);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn digest(tag: u8) -> Digest32 {
        Digest32([tag; 32])
    }

    #[test]
    fn accepts_novel_message() {
        let mut gate = SecurityGate::new(SecurityConfig::default());
        let now = Instant::now();
        assert_eq!(gate.admit("p1", 10, digest(1), now), Ok(Admission::Accept));
    }

    #[test]
    fn drops_duplicate_silently() {
        let mut gate = SecurityGate::new(SecurityConfig::default());
        let now = Instant::now();
        assert_eq!(gate.admit("p1", 10, digest(1), now), Ok(Admission::Accept));
        assert_eq!(gate.admit("p1", 10, digest(1), now), Ok(Admission::Duplicate));
    }

    #[test]
    fn rejects_oversized_and_warns() {
        let cfg = SecurityConfig {
            max_message_size: 100,
            ..SecurityConfig::default()
        };
        let mut gate = SecurityGate::new(cfg);
        let now = Instant::now();
        let result = gate.admit("p1", 200, digest(1), now);
        assert!(matches!(result, Err(SecurityError::Oversized(200, 100))));
    }

    #[test]
    fn escalates_to_ban_after_threshold() {
        let cfg = SecurityConfig {
            max_warnings_before_ban: 2,
            ban_duration: Duration::from_secs(60),
            ..SecurityConfig::default()
        };
        let mut gate = SecurityGate::new(cfg);
        let now = Instant::now();
        gate.warn("p1", now);
        assert!(!gate.is_banned("p1", now));
        gate.warn("p1", now);
        assert!(gate.is_banned("p1", now));
    }

    #[test]
    fn ban_expires_after_duration() {
        let cfg = SecurityConfig {
            max_warnings_before_ban: 1,
            ban_duration: Duration::from_secs(10),
            ..SecurityConfig::default()
        };
        let mut gate = SecurityGate::new(cfg);
        let now = Instant::now();
        gate.warn("p1", now);
        assert!(gate.is_banned("p1", now));
        assert!(!gate.is_banned("p1", now + Duration::from_secs(11)));
    }

    #[test]
    fn banned_peer_rejected_before_size_check() {
        let cfg = SecurityConfig {
            max_warnings_before_ban: 1,
            ..SecurityConfig::default()
        };
        let mut gate = SecurityGate::new(cfg);
        let now = Instant::now();
        gate.warn("p1", now);
        assert!(matches!(
            gate.admit("p1", 10, digest(1), now),
            Err(SecurityError::PeerBanned(_))
        ));
    }

    #[test]
    fn rate_limit_enforced_within_window() {
        let cfg = SecurityConfig {
            rate_limit_per_window: 2,
            rate_limit_window: Duration::from_secs(1),
            ..SecurityConfig::default()
        };
        let mut gate = SecurityGate::new(cfg);
        let now = Instant::now();
        assert!(gate.admit("p1", 10, digest(1), now).is_ok());
        assert!(gate.admit("p1", 10, digest(2), now).is_ok());
        assert!(matches!(
            gate.admit("p1", 10, digest(3), now),
            Err(SecurityError::RateLimited(_))
        ));
    }

    #[test]
    fn rate_limit_resets_after_window() {
        let cfg = SecurityConfig {
            rate_limit_per_window: 1,
            rate_limit_window: Duration::from_millis(10),
            ..SecurityConfig::default()
        };
        let mut gate = SecurityGate::new(cfg);
        let now = Instant::now();
        assert!(gate.admit("p1", 10, digest(1), now).is_ok());
        let later = now + Duration::from_millis(20);
        assert!(gate.admit("p1", 10, digest(2), later).is_ok());
    }

    #[test]
    fn resource_quota_enforced() {
        let cfg = SecurityConfig {
            resource_quota_per_window: 2,
            resource_quota_window: Duration::from_secs(60),
            ..SecurityConfig::default()
        };
        let mut gate = SecurityGate::new(cfg);
        let now = Instant::now();
        assert!(gate.check_resource_quota("p1", "signer", now).is_ok());
        assert!(gate.check_resource_quota("p1", "signer", now).is_ok());
        assert!(matches!(
            gate.check_resource_quota("p1", "signer", now),
            Err(SecurityError::QuotaExceeded(_, _))
        ));
    }

    #[test]
    fn duplicate_cache_bulk_evicts_on_overflow() {
        let cfg = SecurityConfig {
            duplicate_cache_capacity: 10,
            rate_limit_per_window: 1000,
            ..SecurityConfig::default()
        };
        let mut gate = SecurityGate::new(cfg);
        let now = Instant::now();
        for i in 0..10u8 {
            gate.admit("p1", 10, digest(i), now).unwrap();
        }
        // cache is now full (10 entries); the next insert evicts the oldest 10% (1 entry)
        gate.admit("p1", 10, digest(10), now).unwrap();
        assert!(gate.seen.len() <= 10);
        // the very first digest should have been evicted, so it is treated as novel again
        assert_eq!(
            gate.admit("p1", 10, digest(0), now).unwrap(),
            Admission::Accept
        );
    }
}
