//! Request guardrails: rate limiting, circuit breaking, and timeouts.
//!
//! Every pipeline entry point that can reach the network or the model calls
//! [`SecurityGuard::allow`] before doing work and reports the outcome with
//! `record_success` / `record_failure` afterward. State is kept per
//! (requester, endpoint) pair in mutex-guarded maps; limiting is
//! best-effort under concurrency, never corrupting.
//!
//! Rate limiting uses a fixed window that resets fully once expired, not a
//! sliding window. The circuit breaker opens after a run of failures and
//! closes optimistically once the cool-down elapses, with the failure count
//! reset to zero. A success decrements the failure count (floor zero), so
//! an endpoint that mostly works never creeps toward open.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::config::SecurityConfig;
use crate::error::PipelineError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Endpoint {
    Retrieval,
    Composition,
    Evidence,
    Rules,
}

impl Endpoint {
    pub fn as_str(&self) -> &'static str {
        match self {
            Endpoint::Retrieval => "retrieval",
            Endpoint::Composition => "composition",
            Endpoint::Evidence => "evidence",
            Endpoint::Rules => "rules",
        }
    }
}

struct Window {
    count: u32,
    started: Instant,
}

#[derive(Default)]
struct Breaker {
    failures: u32,
    open: bool,
    last_failure: Option<Instant>,
}

pub struct SecurityGuard {
    max_requests: u32,
    window: Duration,
    failure_threshold: u32,
    cooldown: Duration,
    budgets: HashMap<Endpoint, Duration>,
    windows: Mutex<HashMap<(String, Endpoint), Window>>,
    breakers: Mutex<HashMap<(String, Endpoint), Breaker>>,
}

impl SecurityGuard {
    pub fn new(config: &SecurityConfig) -> Self {
        let mut budgets = HashMap::new();
        budgets.insert(
            Endpoint::Retrieval,
            Duration::from_secs(config.retrieval_timeout_secs),
        );
        budgets.insert(
            Endpoint::Composition,
            Duration::from_secs(config.composition_timeout_secs),
        );
        budgets.insert(
            Endpoint::Evidence,
            Duration::from_secs(config.evidence_timeout_secs),
        );
        budgets.insert(
            Endpoint::Rules,
            Duration::from_secs(config.rules_timeout_secs),
        );

        Self {
            max_requests: config.rate_limit_max,
            window: Duration::from_secs(config.rate_limit_window_secs),
            failure_threshold: config.breaker_failure_threshold,
            cooldown: Duration::from_secs(config.breaker_cooldown_secs),
            budgets,
            windows: Mutex::new(HashMap::new()),
            breakers: Mutex::new(HashMap::new()),
        }
    }

    /// Guard with explicit timing, for exercising window and cool-down
    /// behavior without waiting out wall-clock defaults.
    pub fn with_timing(
        max_requests: u32,
        window: Duration,
        failure_threshold: u32,
        cooldown: Duration,
        budget: Duration,
    ) -> Self {
        let budgets = [
            Endpoint::Retrieval,
            Endpoint::Composition,
            Endpoint::Evidence,
            Endpoint::Rules,
        ]
        .into_iter()
        .map(|e| (e, budget))
        .collect();

        Self {
            max_requests,
            window,
            failure_threshold,
            cooldown,
            budgets,
            windows: Mutex::new(HashMap::new()),
            breakers: Mutex::new(HashMap::new()),
        }
    }

    /// Admit or reject one request for (requester, endpoint).
    ///
    /// The breaker is consulted before the rate window so a rejected-open
    /// request does not consume window budget.
    pub fn allow(&self, requester_id: &str, endpoint: Endpoint) -> Result<(), PipelineError> {
        let key = (requester_id.to_string(), endpoint);

        {
            let mut breakers = self.breakers.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(breaker) = breakers.get_mut(&key) {
                if breaker.open {
                    let cooled = breaker
                        .last_failure
                        .map(|at| at.elapsed() >= self.cooldown)
                        .unwrap_or(true);
                    if cooled {
                        breaker.open = false;
                        breaker.failures = 0;
                    } else {
                        return Err(PipelineError::circuit_open(format!(
                            "{} endpoint temporarily disabled after repeated failures",
                            endpoint.as_str()
                        )));
                    }
                }
            }
        }

        let mut windows = self.windows.lock().unwrap_or_else(|e| e.into_inner());
        let window = windows.entry(key).or_insert_with(|| Window {
            count: 0,
            started: Instant::now(),
        });

        if window.started.elapsed() >= self.window {
            window.count = 0;
            window.started = Instant::now();
        }

        if window.count >= self.max_requests {
            return Err(PipelineError::rate_limited(format!(
                "request budget exhausted for {}",
                endpoint.as_str()
            )));
        }

        window.count += 1;
        Ok(())
    }

    pub fn record_success(&self, requester_id: &str, endpoint: Endpoint) {
        let mut breakers = self.breakers.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(breaker) = breakers.get_mut(&(requester_id.to_string(), endpoint)) {
            breaker.failures = breaker.failures.saturating_sub(1);
        }
    }

    pub fn record_failure(&self, requester_id: &str, endpoint: Endpoint) {
        let mut breakers = self.breakers.lock().unwrap_or_else(|e| e.into_inner());
        let breaker = breakers
            .entry((requester_id.to_string(), endpoint))
            .or_default();

        breaker.failures += 1;
        breaker.last_failure = Some(Instant::now());

        if breaker.failures >= self.failure_threshold && !breaker.open {
            breaker.open = true;
            tracing::warn!(
                endpoint = endpoint.as_str(),
                requester = requester_id,
                failures = breaker.failures,
                "circuit opened"
            );
        }
    }

    pub fn budget(&self, endpoint: Endpoint) -> Duration {
        self.budgets
            .get(&endpoint)
            .copied()
            .unwrap_or(Duration::from_secs(10))
    }

    /// Race a fallible operation against its endpoint budget. A timeout is
    /// a [`PipelineError::Timeout`], which callers count as a failure.
    pub async fn with_timeout<T, F>(&self, endpoint: Endpoint, fut: F) -> Result<T, PipelineError>
    where
        F: Future<Output = Result<T, PipelineError>>,
    {
        let budget = self.budget(endpoint);
        match tokio::time::timeout(budget, fut).await {
            Ok(result) => result,
            Err(_) => Err(PipelineError::timeout(format!(
                "{} exceeded its {:?} budget",
                endpoint.as_str(),
                budget
            ))),
        }
    }

    pub fn failure_count(&self, requester_id: &str, endpoint: Endpoint) -> u32 {
        let breakers = self.breakers.lock().unwrap_or_else(|e| e.into_inner());
        breakers
            .get(&(requester_id.to_string(), endpoint))
            .map(|b| b.failures)
            .unwrap_or(0)
    }

    pub fn is_open(&self, requester_id: &str, endpoint: Endpoint) -> bool {
        let breakers = self.breakers.lock().unwrap_or_else(|e| e.into_inner());
        breakers
            .get(&(requester_id.to_string(), endpoint))
            .map(|b| b.open)
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn guard(max: u32, window_ms: u64, threshold: u32, cooldown_ms: u64) -> SecurityGuard {
        SecurityGuard::with_timing(
            max,
            Duration::from_millis(window_ms),
            threshold,
            Duration::from_millis(cooldown_ms),
            Duration::from_millis(250),
        )
    }

    #[test]
    fn test_rate_limit_boundary() {
        let g = guard(3, 60_000, 5, 60_000);
        for _ in 0..3 {
            assert!(g.allow("alice", Endpoint::Retrieval).is_ok());
        }
        let err = g.allow("alice", Endpoint::Retrieval).unwrap_err();
        assert!(matches!(err, PipelineError::RateLimited(_)));

        // Other requesters and endpoints have their own windows
        assert!(g.allow("bob", Endpoint::Retrieval).is_ok());
        assert!(g.allow("alice", Endpoint::Rules).is_ok());
    }

    #[test]
    fn test_window_resets_fully_after_expiry() {
        let g = guard(2, 50, 5, 60_000);
        assert!(g.allow("alice", Endpoint::Retrieval).is_ok());
        assert!(g.allow("alice", Endpoint::Retrieval).is_ok());
        assert!(g.allow("alice", Endpoint::Retrieval).is_err());

        std::thread::sleep(Duration::from_millis(80));

        assert!(g.allow("alice", Endpoint::Retrieval).is_ok());
        assert!(g.allow("alice", Endpoint::Retrieval).is_ok());
    }

    #[test]
    fn test_circuit_opens_at_threshold() {
        let g = guard(100, 60_000, 2, 60_000);
        g.record_failure("alice", Endpoint::Composition);
        assert!(g.allow("alice", Endpoint::Composition).is_ok());

        g.record_failure("alice", Endpoint::Composition);
        let err = g.allow("alice", Endpoint::Composition).unwrap_err();
        assert!(matches!(err, PipelineError::CircuitOpen(_)));
        assert!(g.is_open("alice", Endpoint::Composition));

        // Breaker state is per requester
        assert!(g.allow("bob", Endpoint::Composition).is_ok());
    }

    #[test]
    fn test_circuit_closes_optimistically_after_cooldown() {
        let g = guard(100, 60_000, 1, 50);
        g.record_failure("alice", Endpoint::Evidence);
        assert!(g.allow("alice", Endpoint::Evidence).is_err());

        std::thread::sleep(Duration::from_millis(80));

        assert!(g.allow("alice", Endpoint::Evidence).is_ok());
        assert_eq!(g.failure_count("alice", Endpoint::Evidence), 0);
        assert!(!g.is_open("alice", Endpoint::Evidence));
    }

    #[test]
    fn test_success_decrements_failures_with_floor() {
        let g = guard(100, 60_000, 5, 60_000);
        g.record_failure("alice", Endpoint::Retrieval);
        g.record_failure("alice", Endpoint::Retrieval);
        assert_eq!(g.failure_count("alice", Endpoint::Retrieval), 2);

        g.record_success("alice", Endpoint::Retrieval);
        assert_eq!(g.failure_count("alice", Endpoint::Retrieval), 1);

        g.record_success("alice", Endpoint::Retrieval);
        g.record_success("alice", Endpoint::Retrieval);
        assert_eq!(g.failure_count("alice", Endpoint::Retrieval), 0);
    }

    #[tokio::test]
    async fn test_with_timeout_converts_slow_futures() {
        let g = guard(100, 60_000, 5, 60_000);

        let ok: Result<u32, PipelineError> = g
            .with_timeout(Endpoint::Rules, async { Ok(7) })
            .await;
        assert_eq!(ok.unwrap(), 7);

        let slow = g
            .with_timeout(Endpoint::Rules, async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(0u32)
            })
            .await;
        assert!(matches!(slow.unwrap_err(), PipelineError::Timeout(_)));
    }
}
