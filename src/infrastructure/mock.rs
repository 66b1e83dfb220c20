//! Mock provider implementations for tests and `MODE=mock` runs.

use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use uuid::Uuid;

use crate::domain::errors::ProviderError;
use crate::domain::ports::{
    AnalysisRequest, AnalysisService, BacktestHandle, BacktestPoll, BacktestService,
};
use crate::domain::types::{Analysis, BacktestResult, Confidence};

/// Scripted outcome for one backtest submission.
pub enum MockBacktestOutcome {
    Success(BacktestResult),
    SubmitError(ProviderError),
    /// Submission succeeds, the run itself fails.
    RunFailure(String),
}

/// Backtest service driven by a queue of scripted outcomes. When the queue
/// is empty the optional default result is served, so unbounded loops can be
/// exercised without scripting every cycle.
pub struct MockBacktestService {
    outcomes: Mutex<VecDeque<MockBacktestOutcome>>,
    default_result: Mutex<Option<BacktestResult>>,
    pending: Mutex<Vec<(String, BacktestPoll)>>,
    submits: AtomicUsize,
}

impl MockBacktestService {
    pub fn new() -> Self {
        Self {
            outcomes: Mutex::new(VecDeque::new()),
            default_result: Mutex::new(None),
            pending: Mutex::new(Vec::new()),
            submits: AtomicUsize::new(0),
        }
    }

    pub fn push(&self, outcome: MockBacktestOutcome) {
        self.outcomes.lock().unwrap().push_back(outcome);
    }

    pub fn push_result(&self, result: BacktestResult) {
        self.push(MockBacktestOutcome::Success(result));
    }

    pub fn push_error(&self, error: ProviderError) {
        self.push(MockBacktestOutcome::SubmitError(error));
    }

    pub fn set_default_result(&self, result: BacktestResult) {
        *self.default_result.lock().unwrap() = Some(result);
    }

    pub fn submit_count(&self) -> usize {
        self.submits.load(Ordering::SeqCst)
    }
}

impl Default for MockBacktestService {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BacktestService for MockBacktestService {
    async fn submit(&self, _code: &str, project_id: &str) -> Result<BacktestHandle, ProviderError> {
        self.submits.fetch_add(1, Ordering::SeqCst);
        let outcome = self.outcomes.lock().unwrap().pop_front();
        let poll = match outcome {
            Some(MockBacktestOutcome::Success(result)) => BacktestPoll::Done(result),
            Some(MockBacktestOutcome::SubmitError(error)) => return Err(error),
            Some(MockBacktestOutcome::RunFailure(reason)) => BacktestPoll::Failed(reason),
            None => match self.default_result.lock().unwrap().clone() {
                Some(result) => BacktestPoll::Done(result),
                None => {
                    return Err(ProviderError::Rejected {
                        reason: "no scripted backtest outcome".to_string(),
                    });
                }
            },
        };
        let backtest_id = Uuid::new_v4().to_string();
        self.pending
            .lock()
            .unwrap()
            .push((backtest_id.clone(), poll));
        Ok(BacktestHandle {
            backtest_id,
            project_id: project_id.to_string(),
        })
    }

    async fn poll(&self, handle: &BacktestHandle) -> Result<BacktestPoll, ProviderError> {
        let pending = self.pending.lock().unwrap();
        pending
            .iter()
            .find(|(id, _)| *id == handle.backtest_id)
            .map(|(_, poll)| match poll {
                BacktestPoll::Done(result) => BacktestPoll::Done(result.clone()),
                BacktestPoll::Failed(reason) => BacktestPoll::Failed(reason.clone()),
                BacktestPoll::Pending => BacktestPoll::Pending,
            })
            .ok_or_else(|| ProviderError::Malformed {
                reason: format!("unknown backtest {}", handle.backtest_id),
            })
    }
}

/// Analysis service returning canned analyses and echoing code back with a
/// marker line, so applied versions are distinguishable.
pub struct MockAnalysisService {
    generate_outcomes: Mutex<VecDeque<Result<String, ProviderError>>>,
    last_request: Mutex<Option<AnalysisRequest>>,
    analyze_calls: AtomicUsize,
    generate_calls: AtomicUsize,
}

impl MockAnalysisService {
    pub fn new() -> Self {
        Self {
            generate_outcomes: Mutex::new(VecDeque::new()),
            last_request: Mutex::new(None),
            analyze_calls: AtomicUsize::new(0),
            generate_calls: AtomicUsize::new(0),
        }
    }

    pub fn push_generated(&self, outcome: Result<String, ProviderError>) {
        self.generate_outcomes.lock().unwrap().push_back(outcome);
    }

    pub fn last_request(&self) -> Option<AnalysisRequest> {
        self.last_request.lock().unwrap().clone()
    }

    pub fn analyze_count(&self) -> usize {
        self.analyze_calls.load(Ordering::SeqCst)
    }

    pub fn generate_count(&self) -> usize {
        self.generate_calls.load(Ordering::SeqCst)
    }
}

impl Default for MockAnalysisService {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AnalysisService for MockAnalysisService {
    async fn analyze(&self, request: &AnalysisRequest) -> Result<Analysis, ProviderError> {
        self.analyze_calls.fetch_add(1, Ordering::SeqCst);
        *self.last_request.lock().unwrap() = Some(request.clone());
        Ok(Analysis {
            diagnosis: "entries fire too often in ranging markets".to_string(),
            hypothesis: "gate entries behind a trend-strength filter".to_string(),
            confidence: Confidence::Medium,
            proposed_code: None,
        })
    }

    async fn generate(
        &self,
        _hypothesis: &str,
        current_code: &str,
    ) -> Result<String, ProviderError> {
        let call = self.generate_calls.fetch_add(1, Ordering::SeqCst) + 1;
        match self.generate_outcomes.lock().unwrap().pop_front() {
            Some(outcome) => outcome,
            None => Ok(format!("# revision {call}\n{current_code}")),
        }
    }
}
