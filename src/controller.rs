//! Stage-7 concurrency: bounded parallel extraction with per-group retry.
//!
//! ## Retry Strategy
//!
//! VLM endpoints fail transiently under load (429, 503, timeouts). Each group
//! is retried with exponential backoff `base_delay × multiplier^attempt`,
//! capped at `max_delay`. With the defaults (500 ms, ×2, 3 attempts) the
//! wait sequence is 500 ms → 1 s before a group is given up on. Only
//! [`PipelineError::is_retryable`] errors are retried; a missing artifact
//! fails the same way every time.
//!
//! ## Isolation
//!
//! Groups share nothing but the port. A group that exhausts its attempts
//! yields exactly one failed [`ExtractionResult`]; its siblings are not
//! cancelled, slowed down or otherwise affected.

use crate::config::ExtractionSettings;
use crate::error::{GroupError, PipelineError};
use crate::model::ExtractionGroup;
use crate::output::ExtractionResult;
use crate::ports::ExtractionPort;
use crate::progress::ProgressCallback;
use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

// ── RetryPolicy ──────────────────────────────────────────────────────────

/// How often and how patiently to retry an async capability call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Attempts including the first. At least 1.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub multiplier: f64,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&ExtractionSettings::default())
    }
}

impl From<&ExtractionSettings> for RetryPolicy {
    fn from(s: &ExtractionSettings) -> Self {
        Self {
            max_attempts: s.max_attempts.max(1),
            base_delay: Duration::from_millis(s.base_delay_ms),
            multiplier: s.multiplier,
            max_delay: Duration::from_millis(s.max_delay_ms),
        }
    }
}

/// The outcome of a retried call and how many attempts it consumed.
#[derive(Debug)]
pub struct Attempted<T> {
    pub outcome: Result<T, PipelineError>,
    pub attempts: u32,
}

impl RetryPolicy {
    /// Backoff after the failed attempt number `attempt` (0-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = self.multiplier.max(1.0).powi(attempt as i32);
        let millis = self.base_delay.as_millis() as f64 * factor;
        let capped = millis.min(self.max_delay.as_millis() as f64);
        Duration::from_millis(capped as u64)
    }

    /// Call `op` until it succeeds, fails permanently or runs out of attempts.
    ///
    /// `op` receives the 0-based attempt number.
    pub async fn run<T, F, Fut>(&self, label: &str, mut op: F) -> Attempted<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, PipelineError>>,
    {
        let max_attempts = self.max_attempts.max(1);
        let mut attempt = 0;
        loop {
            match op(attempt).await {
                Ok(value) => {
                    return Attempted {
                        outcome: Ok(value),
                        attempts: attempt + 1,
                    }
                }
                Err(e) if e.is_retryable() && attempt + 1 < max_attempts => {
                    let backoff = self.delay_for(attempt);
                    warn!(
                        "{}: attempt {}/{} failed: {}; retrying after {}ms",
                        label,
                        attempt + 1,
                        max_attempts,
                        e,
                        backoff.as_millis()
                    );
                    sleep(backoff).await;
                    attempt += 1;
                }
                Err(e) => {
                    warn!("{}: attempt {}/{} failed: {}", label, attempt + 1, max_attempts, e);
                    return Attempted {
                        outcome: Err(e),
                        attempts: attempt + 1,
                    };
                }
            }
        }
    }
}

// ── ConcurrencyController ────────────────────────────────────────────────

/// Runs extraction groups with bounded concurrency.
#[derive(Debug, Clone)]
pub struct ConcurrencyController {
    limit: usize,
    policy: RetryPolicy,
}

impl ConcurrencyController {
    pub fn new(limit: usize, policy: RetryPolicy) -> Self {
        Self {
            limit: limit.max(1),
            policy,
        }
    }

    pub fn from_settings(settings: &ExtractionSettings) -> Self {
        Self::new(settings.concurrency, RetryPolicy::from(settings))
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Extract every group, at most `limit` at a time.
    ///
    /// Returns one result per group that was dispatched, in completion
    /// order. After `cancel` fires, groups not yet started are never
    /// dispatched and results of calls already in flight are discarded.
    pub async fn run(
        &self,
        session_id: &str,
        groups: Vec<ExtractionGroup>,
        port: Arc<dyn ExtractionPort>,
        cancel: &CancellationToken,
        progress: Option<&ProgressCallback>,
    ) -> Vec<ExtractionResult> {
        debug!("Dispatching {} groups, concurrency {}", groups.len(), self.limit);

        stream::iter(groups.into_iter().map(|group| {
            let port = Arc::clone(&port);
            let policy = self.policy.clone();
            let cancel = cancel.clone();
            let progress = progress.cloned();
            let session_id = session_id.to_string();
            async move {
                if cancel.is_cancelled() {
                    debug!("{}: not dispatched (cancelled)", group.label());
                    return None;
                }
                if let Some(ref cb) = progress {
                    cb.on_group_start(group.page_index, group.group_id);
                }

                let label = group.label();
                let attempted = policy.run(&label, |_| port.extract(&group)).await;

                if cancel.is_cancelled() {
                    debug!("{}: result discarded (cancelled)", label);
                    return None;
                }

                let result = match attempted.outcome {
                    Ok(output) => {
                        if let Some(ref cb) = progress {
                            cb.on_group_complete(group.page_index, group.group_id, attempted.attempts);
                        }
                        ExtractionResult::succeeded(&session_id, &group, output, attempted.attempts)
                    }
                    Err(e) => {
                        let error = if e.is_retryable() {
                            GroupError::Exhausted {
                                page: group.page_index,
                                group: group.group_id,
                                attempts: attempted.attempts,
                                detail: e.to_string(),
                            }
                        } else {
                            GroupError::Permanent {
                                page: group.page_index,
                                group: group.group_id,
                                detail: e.to_string(),
                            }
                        };
                        if let Some(ref cb) = progress {
                            cb.on_group_error(group.page_index, group.group_id, &error.to_string());
                        }
                        ExtractionResult::failed(&session_id, &group, error, attempted.attempts)
                    }
                };
                Some(result)
            }
        }))
        .buffer_unordered(self.limit)
        .filter_map(futures::future::ready)
        .collect()
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::GroupImage;
    use crate::output::ExtractionStatus;
    use crate::ports::ExtractionOutput;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            base_delay: Duration::from_millis(1),
            multiplier: 2.0,
            max_delay: Duration::from_millis(5),
        }
    }

    fn group(page_index: u32, group_id: u32) -> ExtractionGroup {
        ExtractionGroup {
            document_id: "doc".into(),
            page_index,
            group_id,
            group_count: 1,
            source: GroupImage {
                key: format!("page_{page_index:03}_source.png"),
                band: None,
                width: 1,
                height: 1,
                png: Vec::new(),
            },
            bands: Vec::new(),
        }
    }

    /// Fails each group a configured number of times, then succeeds.
    struct FlakyPort {
        failures: HashMap<u32, usize>,
        calls: Mutex<HashMap<u32, usize>>,
        in_flight: AtomicUsize,
        peak: AtomicUsize,
    }

    impl FlakyPort {
        fn new(failures: &[(u32, usize)]) -> Self {
            Self {
                failures: failures.iter().copied().collect(),
                calls: Mutex::new(HashMap::new()),
                in_flight: AtomicUsize::new(0),
                peak: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl ExtractionPort for FlakyPort {
        async fn extract(&self, group: &ExtractionGroup) -> Result<ExtractionOutput, PipelineError> {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(5)).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);

            let call = {
                let mut calls = self.calls.lock().unwrap();
                let n = calls.entry(group.group_id).or_insert(0);
                *n += 1;
                *n
            };
            if call <= self.failures.get(&group.group_id).copied().unwrap_or(0) {
                return Err(PipelineError::ExtractionFailed {
                    page: group.page_index,
                    group: group.group_id,
                    detail: format!("transient #{call}"),
                });
            }
            Ok(ExtractionOutput {
                text: format!("text of group {}", group.group_id),
                ..Default::default()
            })
        }
    }

    #[test]
    fn backoff_grows_and_caps() {
        let p = RetryPolicy {
            max_attempts: 5,
            base_delay: Duration::from_millis(500),
            multiplier: 2.0,
            max_delay: Duration::from_millis(1500),
        };
        assert_eq!(p.delay_for(0), Duration::from_millis(500));
        assert_eq!(p.delay_for(1), Duration::from_millis(1000));
        assert_eq!(p.delay_for(2), Duration::from_millis(1500));
        assert_eq!(p.delay_for(10), Duration::from_millis(1500));
    }

    #[test]
    fn default_policy_matches_settings() {
        let p = RetryPolicy::default();
        assert_eq!(p.max_attempts, 3);
        assert_eq!(p.base_delay, Duration::from_millis(500));
    }

    #[tokio::test]
    async fn run_stops_on_non_retryable_error() {
        let calls = AtomicUsize::new(0);
        let attempted: Attempted<()> = fast_policy(5)
            .run("t", |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(PipelineError::Internal("nope".into())) }
            })
            .await;
        assert_eq!(attempted.attempts, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn run_counts_attempts_until_success() {
        let attempted = tokio_test::block_on(fast_policy(3).run("t", |attempt| async move {
            if attempt < 2 {
                Err(PipelineError::ExtractionFailed {
                    page: 1,
                    group: 1,
                    detail: "503".into(),
                })
            } else {
                Ok(attempt)
            }
        }));
        assert_eq!(attempted.attempts, 3);
        assert_eq!(attempted.outcome.unwrap(), 2);
    }

    #[tokio::test]
    async fn flaky_group_recovers_and_siblings_are_unaffected() {
        let port = Arc::new(FlakyPort::new(&[(2, 2)]));
        let controller = ConcurrencyController::new(3, fast_policy(3));
        let groups = (1..=4).map(|g| group(1, g)).collect();

        let mut results = controller
            .run("s", groups, port.clone(), &CancellationToken::new(), None)
            .await;
        results.sort_by_key(|r| r.group_id);

        assert_eq!(results.len(), 4);
        assert!(results.iter().all(|r| r.status.is_succeeded()));
        let attempts: Vec<_> = results.iter().map(|r| r.attempts).collect();
        assert_eq!(attempts, [1, 3, 1, 1]);
        assert!(port.peak.load(Ordering::SeqCst) <= 3);
    }

    #[tokio::test]
    async fn exhausted_group_yields_one_failed_result() {
        let port = Arc::new(FlakyPort::new(&[(3, usize::MAX)]));
        let controller = ConcurrencyController::new(2, fast_policy(3));
        let groups = (1..=3).map(|g| group(2, g)).collect();

        let results = controller
            .run("s", groups, port, &CancellationToken::new(), None)
            .await;

        assert_eq!(results.len(), 3);
        let failed: Vec<_> = results.iter().filter(|r| !r.status.is_succeeded()).collect();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].group_id, 3);
        assert_eq!(failed[0].attempts, 3);
        assert!(matches!(
            failed[0].status,
            ExtractionStatus::Failed {
                error: GroupError::Exhausted { attempts: 3, .. }
            }
        ));
    }

    #[tokio::test]
    async fn cancelled_run_dispatches_nothing() {
        let port = Arc::new(FlakyPort::new(&[]));
        let controller = ConcurrencyController::new(3, fast_policy(3));
        let cancel = CancellationToken::new();
        cancel.cancel();

        let results = controller
            .run("s", vec![group(1, 1), group(1, 2)], port.clone(), &cancel, None)
            .await;
        assert!(results.is_empty());
        assert!(port.calls.lock().unwrap().is_empty());
    }
}
