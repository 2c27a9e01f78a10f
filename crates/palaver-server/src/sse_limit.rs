//! Admission control for push streams.
//!
//! Stream sessions are long-lived, so they get their own limits on top of the
//! request rate limiter: a per-IP concurrency cap, a global concurrency cap,
//! and a minimum interval between openings from one IP. An admitted session
//! holds a permit; dropping the permit (the stream closing) releases the
//! slot.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SseRejection {
    #[error("too many concurrent streams from this address")]
    PerIpLimit,

    #[error("stream capacity exhausted")]
    TotalLimit,

    #[error("stream opened too soon after the previous one")]
    TooSoon,
}

#[derive(Default)]
struct SseState {
    per_ip: HashMap<IpAddr, usize>,
    total: usize,
    last_open: HashMap<IpAddr, Instant>,
}

#[derive(Clone)]
pub struct SseLimiter {
    state: Arc<Mutex<SseState>>,
    max_per_ip: usize,
    max_total: usize,
    min_interval: Duration,
}

impl SseLimiter {
    pub fn new(max_per_ip: usize, max_total: usize, min_interval: Duration) -> Self {
        Self {
            state: Arc::new(Mutex::new(SseState::default())),
            max_per_ip,
            max_total,
            min_interval,
        }
    }

    /// Admit a new stream from `ip`, or say why not. The returned permit must
    /// be kept alive for the duration of the stream.
    pub fn admit(&self, ip: IpAddr) -> Result<SsePermit, SseRejection> {
        let mut state = self.state.lock().expect("sse limiter state poisoned");

        if state.total >= self.max_total {
            return Err(SseRejection::TotalLimit);
        }

        let active = state.per_ip.get(&ip).copied().unwrap_or(0);
        if active >= self.max_per_ip {
            return Err(SseRejection::PerIpLimit);
        }

        if let Some(last) = state.last_open.get(&ip) {
            if last.elapsed() < self.min_interval {
                return Err(SseRejection::TooSoon);
            }
        }

        state.total += 1;
        *state.per_ip.entry(ip).or_insert(0) += 1;
        state.last_open.insert(ip, Instant::now());

        Ok(SsePermit {
            state: Arc::clone(&self.state),
            ip,
        })
    }

    /// Drop inter-arrival records older than `max_idle`.
    pub fn purge_stale(&self, max_idle: Duration) {
        let mut state = self.state.lock().expect("sse limiter state poisoned");
        state.last_open.retain(|_, opened| opened.elapsed() < max_idle);
    }

    #[cfg(test)]
    fn active_total(&self) -> usize {
        self.state.lock().unwrap().total
    }
}

/// An admitted stream slot; releases itself on drop.
pub struct SsePermit {
    state: Arc<Mutex<SseState>>,
    ip: IpAddr,
}

impl std::fmt::Debug for SsePermit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SsePermit").field("ip", &self.ip).finish()
    }
}

impl PartialEq for SsePermit {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.state, &other.state) && self.ip == other.ip
    }
}

impl Drop for SsePermit {
    fn drop(&mut self) {
        let mut state = match self.state.lock() {
            Ok(state) => state,
            Err(poisoned) => poisoned.into_inner(),
        };

        state.total = state.total.saturating_sub(1);
        if let Some(count) = state.per_ip.get_mut(&self.ip) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                state.per_ip.remove(&self.ip);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ip(last: u8) -> IpAddr {
        format!("10.1.1.{last}").parse().unwrap()
    }

    #[test]
    fn per_ip_cap_enforced() {
        let limiter = SseLimiter::new(2, 100, Duration::ZERO);

        let _a = limiter.admit(ip(1)).unwrap();
        let _b = limiter.admit(ip(1)).unwrap();
        assert_eq!(limiter.admit(ip(1)), Err(SseRejection::PerIpLimit));

        // A different address still gets in.
        assert!(limiter.admit(ip(2)).is_ok());
    }

    #[test]
    fn dropping_permit_frees_slot() {
        let limiter = SseLimiter::new(1, 100, Duration::ZERO);

        let permit = limiter.admit(ip(1)).unwrap();
        assert_eq!(limiter.admit(ip(1)), Err(SseRejection::PerIpLimit));

        drop(permit);
        assert!(limiter.admit(ip(1)).is_ok());
        assert_eq!(limiter.active_total(), 1);
    }

    #[test]
    fn total_cap_enforced() {
        let limiter = SseLimiter::new(10, 2, Duration::ZERO);

        let _a = limiter.admit(ip(1)).unwrap();
        let _b = limiter.admit(ip(2)).unwrap();
        assert_eq!(limiter.admit(ip(3)), Err(SseRejection::TotalLimit));
    }

    #[test]
    fn min_interval_enforced() {
        let limiter = SseLimiter::new(10, 100, Duration::from_secs(60));

        let first = limiter.admit(ip(1)).unwrap();
        drop(first);
        // Slot is free, but the inter-arrival window has not passed.
        assert_eq!(limiter.admit(ip(1)), Err(SseRejection::TooSoon));
    }
}
