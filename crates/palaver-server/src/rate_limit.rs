//! Request rate limiting.
//!
//! GCRA-style: each key tracks a single theoretical arrival time instead of a
//! token count. A request conforms while the key's schedule has not run
//! further ahead of real time than the configured burst allows, and every
//! admitted request pushes the schedule one emission interval forward. One
//! `Instant` per key keeps the table small and makes purging trivial.
//!
//! The key is the client address on the HTTP surface, but any hashable key
//! (user id, room id) works.

use std::collections::HashMap;
use std::hash::Hash;
use std::net::IpAddr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use axum::body::Body;
use axum::extract::State;
use axum::http::Request;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use tracing::warn;

use palaver_shared::RequestMetadata;

use crate::api::AppState;
use crate::error::ApiError;
use crate::request_meta::extract_client_ip;

#[derive(Clone)]
pub struct RateLimiter<K: Eq + Hash + Clone = IpAddr> {
    schedule: Arc<Mutex<HashMap<K, Instant>>>,
    emission: Duration,
    tolerance: Duration,
}

impl<K: Eq + Hash + Clone> RateLimiter<K> {
    /// A limiter sustaining `rate` requests per second per key, with up to
    /// `burst` back-to-back requests admitted from a cold start.
    pub fn new(rate: f64, burst: f64) -> Self {
        let rate = rate.max(f64::MIN_POSITIVE);
        let emission = Duration::from_secs_f64(1.0 / rate);
        let tolerance = emission.mul_f64((burst - 1.0).max(0.0));

        Self {
            schedule: Arc::new(Mutex::new(HashMap::new())),
            emission,
            tolerance,
        }
    }

    /// Admit or reject one request for `key`.
    pub fn check(&self, key: K) -> bool {
        let now = Instant::now();
        let mut schedule = self.schedule.lock().expect("rate limiter state poisoned");

        let tat = schedule.get(&key).copied().unwrap_or(now);
        if tat > now + self.tolerance {
            return false;
        }

        schedule.insert(key, tat.max(now) + self.emission);
        true
    }

    /// Drop keys whose schedule lies at least `max_idle` in the past; a
    /// fresh entry would behave identically for them.
    pub fn purge_stale(&self, max_idle: Duration) {
        let now = Instant::now();
        let mut schedule = self.schedule.lock().expect("rate limiter state poisoned");
        schedule.retain(|_, tat| *tat + max_idle > now);
    }

    #[cfg(test)]
    fn tracked_keys(&self) -> usize {
        self.schedule.lock().unwrap().len()
    }
}

pub async fn rate_limit_middleware(
    State(state): State<AppState>,
    req: Request<Body>,
    next: Next,
) -> Response {
    let ip = extract_client_ip(&req);

    if let Some(ip) = ip {
        if !state.rate_limiter.check(ip) {
            warn!(ip = %ip, "rate limit exceeded");
            if let Some(meta) = req.extensions().get::<RequestMetadata>() {
                state
                    .service
                    .audit()
                    .rate_limit_exceeded(meta, req.uri().path());
            }
            return ApiError::RateLimited.into_response();
        }
    }

    next.run(req).await
}
