//! Inbound admission control
//!
//! Fixed one-second windows counted per remote domain. The domain is taken
//! from the `keyId` of the Signature header, before any key is fetched, so
//! a flood of requests never reaches signature verification.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;

use crate::error::AppError;

const WINDOW: Duration = Duration::from_secs(1);
const DEFAULT_MAX_TRACKED_DOMAINS: usize = 10_000;

#[derive(Debug, Clone, Copy)]
struct Window {
    count: u32,
    started: Instant,
}

impl Window {
    fn expired(&self, now: Instant) -> bool {
        now.duration_since(self.started) >= WINDOW
    }
}

/// Per-domain request ceiling
pub struct RateLimiter {
    windows: Mutex<HashMap<String, Window>>,
    per_second: u32,
    max_tracked: usize,
}

impl RateLimiter {
    pub fn new(per_second: u32) -> Self {
        Self::with_max_tracked(per_second, DEFAULT_MAX_TRACKED_DOMAINS)
    }

    pub fn with_max_tracked(per_second: u32, max_tracked: usize) -> Self {
        Self {
            windows: Mutex::new(HashMap::new()),
            per_second: per_second.max(1),
            max_tracked: max_tracked.max(1),
        }
    }

    /// Count one request from `domain`
    ///
    /// # Errors
    /// `RateLimited` once the domain used up its allowance for this second.
    pub async fn check(&self, domain: &str) -> Result<(), AppError> {
        self.check_at(domain, Instant::now()).await
    }

    pub async fn check_at(&self, domain: &str, now: Instant) -> Result<(), AppError> {
        let mut windows = self.windows.lock().await;

        if !windows.contains_key(domain) && windows.len() >= self.max_tracked {
            windows.retain(|_, window| !window.expired(now));
            if windows.len() >= self.max_tracked {
                let oldest = windows
                    .iter()
                    .min_by_key(|(_, window)| window.started)
                    .map(|(key, _)| key.clone());
                if let Some(oldest) = oldest {
                    windows.remove(&oldest);
                }
            }
        }

        let window = windows.entry(domain.to_string()).or_insert(Window {
            count: 0,
            started: now,
        });
        if window.expired(now) {
            *window = Window {
                count: 0,
                started: now,
            };
        }

        if window.count >= self.per_second {
            tracing::debug!(domain, limit = self.per_second, "Inbound request rate limited");
            return Err(AppError::RateLimited);
        }
        window.count += 1;
        Ok(())
    }

    pub async fn tracked_domains(&self) -> usize {
        self.windows.lock().await.len()
    }
}

fn default_port_for_scheme(scheme: &str) -> Option<u16> {
    match scheme {
        "http" => Some(80),
        "https" => Some(443),
        _ => None,
    }
}

/// Rate limit key for an actor URI or keyId: lowercase host plus any
/// non-default port
pub fn extract_domain(uri: &str) -> String {
    let trimmed = uri.trim();
    let Ok(parsed) = url::Url::parse(trimmed) else {
        return trimmed.trim_end_matches('.').to_ascii_lowercase();
    };
    let Some(host) = parsed.host_str() else {
        return trimmed.to_ascii_lowercase();
    };

    let host = host.trim_end_matches('.').to_ascii_lowercase();
    match parsed
        .port()
        .filter(|port| Some(*port) != default_port_for_scheme(parsed.scheme()))
    {
        Some(port) => format!("{}:{}", host, port),
        None => host,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn sixth_request_in_a_second_is_limited() {
        let limiter = RateLimiter::new(5);
        let t0 = Instant::now();

        for _ in 0..5 {
            assert!(limiter.check_at("remote.example", t0).await.is_ok());
        }
        assert!(matches!(
            limiter.check_at("remote.example", t0).await,
            Err(AppError::RateLimited)
        ));

        // Other domains have their own allowance
        assert!(limiter.check_at("other.example", t0).await.is_ok());

        // Next window
        assert!(limiter
            .check_at("remote.example", t0 + Duration::from_millis(1_001))
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn tracked_domains_are_capped() {
        let limiter = RateLimiter::with_max_tracked(5, 2);
        let t0 = Instant::now();

        limiter.check_at("a.example", t0).await.unwrap();
        limiter.check_at("b.example", t0 + Duration::from_millis(1)).await.unwrap();
        limiter.check_at("c.example", t0 + Duration::from_millis(2)).await.unwrap();

        assert_eq!(limiter.tracked_domains().await, 2);
    }

    #[test]
    fn domain_keys_drop_default_ports() {
        assert_eq!(extract_domain("https://Example.com/users/alice#main-key"), "example.com");
        assert_eq!(extract_domain("https://example.com:443/users/alice"), "example.com");
        assert_eq!(extract_domain("http://127.0.0.1:8080/users/a"), "127.0.0.1:8080");
        assert_eq!(extract_domain("https://example.com./x"), "example.com");
        assert_eq!(extract_domain("not a url"), "not a url");
    }
}
