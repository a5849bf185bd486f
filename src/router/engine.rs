//! Tiered execution router.
//!
//! ```text
//! Classify ─▶ TryA ─hit─▶ Done
//!               │miss
//!               ├─ score allows B ─▶ TryB ─ok─▶ Done
//!               │                     │fail / timeout / low confidence
//!               └─ score forces C ──▶ TryC ─ok─▶ Done
//!                                      └─retries exhausted─▶ Failed
//! ```
//!
//! Escalation only moves towards more expensive tiers. Concurrent requests
//! with the same key and content share one B/C computation (single-flight).
//! Dropping every waiter of a computation cancels it; results are only
//! offered for promotion once the computation has completed.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;

use futures::future::{BoxFuture, FutureExt, Shared};
use thiserror::Error;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use crate::cache::entry::Tier;
use crate::cache::promoter::{CasWriter, Decision, Observation};
use crate::cache::store::{CasError, ContentStore};
use crate::compute::{ComputeBackend, Computation};
use crate::config::{Config, RouterConfig};
use crate::keys::{Fingerprint, KeyEngine, TrivariateKey};
use crate::metrics::Metrics;
use crate::router::classifier::{Classification, ComplexityClassifier, RequestFeatures};
use crate::router::request::{ExecutionOutcome, ExecutionRequest, RouterState};
use crate::router::retry::{retry, RetryFailure, RetryPolicy};
use crate::staging::{Record, StagedSerializer, StagingError};

#[derive(Error, Debug, Clone)]
pub enum RouterError {
    #[error("Staging failed: {0}")]
    Staging(Arc<StagingError>),

    #[error("CAS error: {0}")]
    Cas(#[from] CasError),

    #[error("Tier C failed after {attempts} attempts: {reason}")]
    TierCFailed { attempts: u32, reason: String },
}

impl From<StagingError> for RouterError {
    fn from(e: StagingError) -> Self {
        RouterError::Staging(Arc::new(e))
    }
}

/// Result of a B/C computation shared by every waiter.
#[derive(Debug, Clone)]
struct Resolved {
    answer: Record,
    tier: Tier,
    confidence: f64,
    states: Vec<RouterState>,
}

type SharedComputation = Shared<BoxFuture<'static, Result<Resolved, RouterError>>>;
type FlightKey = (TrivariateKey, Fingerprint);

struct Flight {
    computation: SharedComputation,
    waiters: usize,
}

/// Drops a waiter from the in-flight table; the last one out removes the
/// entry, which cancels an unfinished computation.
struct FlightGuard<'a> {
    table: &'a Mutex<HashMap<FlightKey, Flight>>,
    key: FlightKey,
}

impl Drop for FlightGuard<'_> {
    fn drop(&mut self) {
        let mut table = self.table.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(flight) = table.get_mut(&self.key) {
            flight.waiters -= 1;
            if flight.waiters == 0 {
                table.remove(&self.key);
            }
        }
    }
}

/// Everything a B/C computation needs, owned so it can outlive the request
/// that started it.
#[derive(Clone)]
struct Escalation {
    tier_b: Arc<dyn ComputeBackend>,
    tier_c: Arc<dyn ComputeBackend>,
    writer: CasWriter,
    metrics: Arc<Metrics>,
    config: RouterConfig,
    retry: RetryPolicy,
}

impl Escalation {
    async fn run(
        self,
        request: ExecutionRequest,
        key: TrivariateKey,
        fingerprint: Fingerprint,
        skip_b: bool,
        promotable: bool,
    ) -> Result<Resolved, RouterError> {
        let mut states = Vec::with_capacity(2);

        if !skip_b {
            states.push(RouterState::TryB);
            let started = Instant::now();
            match timeout(self.config.tier_b_timeout(), self.tier_b.compute(&request)).await {
                Ok(Ok(computation))
                    if computation.confidence >= self.config.tier_b_min_confidence =>
                {
                    self.metrics.record_tier(Tier::B, "success");
                    debug!(
                        key = %key,
                        elapsed_ms = started.elapsed().as_millis() as u64,
                        confidence = computation.confidence,
                        "TryB -> Done"
                    );
                    return Ok(self
                        .finish(key, fingerprint, Tier::B, computation, states, promotable)
                        .await);
                }
                Ok(Ok(computation)) => {
                    self.metrics.record_tier(Tier::B, "low_confidence");
                    debug!(
                        key = %key,
                        confidence = computation.confidence,
                        "TryB -> TryC: low confidence"
                    );
                }
                Ok(Err(e)) => {
                    self.metrics.record_tier(Tier::B, "failure");
                    debug!(key = %key, error = %e, "TryB -> TryC: backend error");
                }
                Err(_) => {
                    self.metrics.record_tier(Tier::B, "timeout");
                    warn!(
                        key = %key,
                        timeout_ms = self.config.tier_b_timeout_ms,
                        "TryB -> TryC: timed out"
                    );
                }
            }
        }

        states.push(RouterState::TryC);
        let started = Instant::now();
        let metrics = Arc::clone(&self.metrics);
        let result = retry(
            "tier_c",
            &self.retry,
            |_| metrics.record_retry(),
            || self.tier_c.compute(&request),
        )
        .await;

        match result {
            Ok(computation) => {
                self.metrics.record_tier(Tier::C, "success");
                debug!(
                    key = %key,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    confidence = computation.confidence,
                    "TryC -> Done"
                );
                Ok(self.finish(key, fingerprint, Tier::C, computation, states, promotable).await)
            }
            Err(failure) => {
                self.metrics.record_tier(Tier::C, "failure");
                let (attempts, reason) = match failure {
                    RetryFailure::Failed { attempts, last } => (attempts, last.to_string()),
                    RetryFailure::TimedOut { attempts } => (attempts, "timed out".to_string()),
                };
                error!(
                    key = %key,
                    attempts,
                    reason = %reason,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "TryC -> Failed"
                );
                Err(RouterError::TierCFailed { attempts, reason })
            }
        }
    }

    /// Offer the result for promotion and wait for the decision to commit.
    async fn finish(
        &self,
        key: TrivariateKey,
        fingerprint: Fingerprint,
        tier: Tier,
        computation: Computation,
        states: Vec<RouterState>,
        promotable: bool,
    ) -> Resolved {
        if promotable {
            let observation = Observation {
                key,
                fingerprint,
                answer: computation.answer.clone(),
                confidence: computation.confidence,
                tier,
            };
            match self.writer.observe(observation).await {
                Ok(Decision::Promoted) => debug!(key = %key, "Result promoted"),
                Ok(_) => {}
                Err(e) => warn!(key = %key, error = %e, "Could not offer result for promotion"),
            }
        }
        Resolved {
            answer: computation.answer,
            tier,
            confidence: computation.confidence,
            states,
        }
    }
}

/// The tiered execution router.
pub struct Router {
    store: Arc<ContentStore>,
    serializer: StagedSerializer,
    keys: KeyEngine,
    classifier: ComplexityClassifier,
    escalation: Escalation,
    in_flight: Mutex<HashMap<FlightKey, Flight>>,
}

impl Router {
    pub fn new(
        config: &Config,
        store: Arc<ContentStore>,
        writer: CasWriter,
        tier_b: Arc<dyn ComputeBackend>,
        tier_c: Arc<dyn ComputeBackend>,
        metrics: Arc<Metrics>,
    ) -> Self {
        let serializer = store.serializer().clone();
        Self {
            store,
            serializer,
            keys: KeyEngine::new(),
            classifier: ComplexityClassifier::new(config.classifier.clone()),
            escalation: Escalation {
                tier_b,
                tier_c,
                writer,
                metrics,
                config: config.router.clone(),
                retry: RetryPolicy::new(&config.router.retry, config.router.tier_c_timeout()),
            },
            in_flight: Mutex::new(HashMap::new()),
        }
    }

    /// Tier A answer key and content fingerprint of a request's query.
    pub fn key_for(
        &self,
        request: &ExecutionRequest,
    ) -> Result<(TrivariateKey, Fingerprint), RouterError> {
        let staged = self.serializer.encode(&request.query)?;
        let compact = &staged.compact().bytes;
        Ok((
            self.keys.derive_answer_for(compact, &request.context, &request.identity),
            self.keys.fingerprint(compact),
        ))
    }

    /// Number of distinct computations currently in flight.
    pub fn in_flight(&self) -> usize {
        self.in_flight.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Route one request through the tiers.
    pub async fn execute(
        &self,
        request: ExecutionRequest,
    ) -> Result<ExecutionOutcome, RouterError> {
        let started = Instant::now();
        let metrics = &self.escalation.metrics;
        let mut states = vec![RouterState::Classify];

        let (key, fingerprint) = self.key_for(&request)?;
        let tier_a_match = self
            .store
            .peek(&key)
            .is_some_and(|e| e.origin.is_promoted() && e.fingerprint == fingerprint);
        let classification = self
            .classifier
            .classify(&RequestFeatures::of(&request.query, tier_a_match));
        debug!(
            key = %key,
            request_id = %request.id,
            score = classification.score,
            tier = %classification.tier,
            "Classify -> TryA"
        );

        states.push(RouterState::TryA);
        let mut promotable = true;
        match self.store.get_answer(&key, fingerprint) {
            Ok(Some(entry)) => {
                let answer = self.serializer.decode_record(&entry.payload).map_err(|e| {
                    error!(key = %key, error = %e, "Tier A payload failed to expand");
                    CasError::ExpansionFailed {
                        key,
                        reason: e.to_string(),
                    }
                })?;
                metrics.record_tier(Tier::A, "hit");
                states.push(RouterState::Done);
                let elapsed = started.elapsed();
                metrics.record_latency(Tier::A, elapsed);
                debug!(key = %key, elapsed_us = elapsed.as_micros() as u64, "TryA -> Done");
                return Ok(ExecutionOutcome {
                    request_id: request.id,
                    key,
                    result: answer,
                    tier: Tier::A,
                    confidence: entry.confidence,
                    score: classification.score,
                    elapsed,
                    states,
                    shared: false,
                });
            }
            Ok(None) => metrics.record_tier(Tier::A, "miss"),
            Err(CasError::KeyCollision { .. }) => {
                metrics.record_tier(Tier::A, "collision");
                metrics.record_collision();
                warn!(key = %key, "TryA key collision: recomputing in Tier C without promotion");
                promotable = false;
            }
            Err(e) => return Err(e.into()),
        }

        let skip_b = !promotable || !classification.allows_tier_b();
        let (computation, leader) =
            self.join_flight(&request, key, fingerprint, skip_b, promotable, &classification);
        let _guard = FlightGuard {
            table: &self.in_flight,
            key: (key, fingerprint),
        };

        match computation.await {
            Ok(resolved) => {
                states.extend_from_slice(&resolved.states);
                states.push(RouterState::Done);
                let elapsed = started.elapsed();
                metrics.record_latency(resolved.tier, elapsed);
                info!(
                    key = %key,
                    tier = %resolved.tier,
                    elapsed_ms = elapsed.as_millis() as u64,
                    shared = !leader,
                    "Request resolved"
                );
                Ok(ExecutionOutcome {
                    request_id: request.id,
                    key,
                    result: resolved.answer,
                    tier: resolved.tier,
                    confidence: resolved.confidence,
                    score: classification.score,
                    elapsed,
                    states,
                    shared: !leader,
                })
            }
            Err(e) => {
                states.push(RouterState::Failed);
                error!(
                    key = %key,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    states = ?states,
                    error = %e,
                    "Request failed"
                );
                Err(e)
            }
        }
    }

    /// Join the computation for this key, starting it if none is in flight.
    /// Registers the caller as a waiter; returns whether it started the
    /// computation.
    fn join_flight(
        &self,
        request: &ExecutionRequest,
        key: TrivariateKey,
        fingerprint: Fingerprint,
        skip_b: bool,
        promotable: bool,
        classification: &Classification,
    ) -> (SharedComputation, bool) {
        let mut table = self.in_flight.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(flight) = table.get_mut(&(key, fingerprint)) {
            flight.waiters += 1;
            debug!(key = %key, waiters = flight.waiters, "Joined in-flight computation");
            return (flight.computation.clone(), false);
        }

        debug!(key = %key, skip_b, tier = %classification.tier, "Starting computation");
        let computation = self
            .escalation
            .clone()
            .run(request.clone(), key, fingerprint, skip_b, promotable)
            .boxed()
            .shared();
        table.insert(
            (key, fingerprint),
            Flight {
                computation: computation.clone(),
                waiters: 1,
            },
        );
        (computation, true)
    }
}
