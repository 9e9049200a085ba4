//! Result reporting back to the workload source.

use async_trait::async_trait;
use plfm_gridtypes::WorkloadResult;
use tracing::info;

/// Delivers signed results to whoever issued the reservation.
#[async_trait]
pub trait Feedback: Send + Sync {
    async fn send(&self, result: &WorkloadResult) -> anyhow::Result<()>;
}

/// Feedback that records results in the log only. Stands in until a real
/// transport back to the reservation source is wired.
pub struct LogFeedback;

#[async_trait]
impl Feedback for LogFeedback {
    async fn send(&self, result: &WorkloadResult) -> anyhow::Result<()> {
        info!(
            id = %result.id,
            kind = %result.kind,
            state = result.state.as_str(),
            error = %result.error,
            "workload result"
        );
        Ok(())
    }
}

/// Feedback that keeps every result, for assertions in tests.
#[derive(Default)]
pub struct CollectingFeedback {
    results: std::sync::Mutex<Vec<WorkloadResult>>,
}

impl CollectingFeedback {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn results(&self) -> Vec<WorkloadResult> {
        self.results.lock().expect("feedback lock poisoned").clone()
    }
}

#[async_trait]
impl Feedback for CollectingFeedback {
    async fn send(&self, result: &WorkloadResult) -> anyhow::Result<()> {
        self.results
            .lock()
            .expect("feedback lock poisoned")
            .push(result.clone());
        Ok(())
    }
}
