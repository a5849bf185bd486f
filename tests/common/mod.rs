//! Shared helpers for integration tests.

#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;

use cas_tier_router::compute::{ComputeBackend, ComputeError, Computation};
use cas_tier_router::config::Config;
use cas_tier_router::keys::KeyContext;
use cas_tier_router::router::ExecutionRequest;
use cas_tier_router::service::Service;
use cas_tier_router::staging::Record;

/// Backend that counts calls and can be slowed down or made to fail.
pub struct CountingBackend {
    calls: AtomicUsize,
    completed: AtomicUsize,
    delay: Duration,
    failures_before_success: usize,
    always_fail: bool,
    confidence: f64,
}

impl CountingBackend {
    pub fn answering(confidence: f64) -> Self {
        Self {
            calls: AtomicUsize::new(0),
            completed: AtomicUsize::new(0),
            delay: Duration::ZERO,
            failures_before_success: 0,
            always_fail: false,
            confidence,
        }
    }

    pub fn failing() -> Self {
        Self {
            always_fail: true,
            ..Self::answering(0.0)
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn failing_first(mut self, failures: usize) -> Self {
        self.failures_before_success = failures;
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn completed(&self) -> usize {
        self.completed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ComputeBackend for CountingBackend {
    fn name(&self) -> &str {
        "counting"
    }

    async fn compute(&self, request: &ExecutionRequest) -> Result<Computation, ComputeError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if self.always_fail || call <= self.failures_before_success {
            return Err(ComputeError::Unavailable(format!("call {call} failed")));
        }
        self.completed.fetch_add(1, Ordering::SeqCst);
        let answer = Record::from_value(json!({
            "schema": "answer",
            "fields": {"kind": request.query.schema(), "summary": "computed"}
        }))
        .map_err(|e| ComputeError::Failed(e.to_string()))?;
        Ok(Computation {
            answer,
            confidence: self.confidence,
        })
    }
}

/// Config with fast Tier C retries.
pub fn fast_config() -> Config {
    let mut config = Config::default();
    config.router.retry.initial_backoff_ms = 1;
    config.router.retry.max_backoff_ms = 5;
    config
}

pub async fn start(
    config: Config,
    tier_b: Arc<CountingBackend>,
    tier_c: Arc<CountingBackend>,
) -> Service {
    Service::start_with_backends(config, tier_b, tier_c)
        .await
        .expect("service starts")
}

pub fn query(target: &str) -> Record {
    Record::from_value(json!({
        "schema": "query",
        "fields": {"operation": "SEND", "target": target}
    }))
    .unwrap()
}

pub fn request(target: &str) -> ExecutionRequest {
    ExecutionRequest::new(query(target), KeyContext::at("ops", 1_700_000_000, 3600), "analyst-1")
}

pub fn task() -> Record {
    Record::from_value(json!({
        "schema": "task",
        "fields": {"name": "Recon", "priority": "high"}
    }))
    .unwrap()
}
