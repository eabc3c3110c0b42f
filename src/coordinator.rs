//! Caller-side lifecycle of palette extraction.
//!
//! The coordinator keeps at most one run in flight. It is driven from the
//! caller's own context: [`ClusterCoordinator::poll`] fits a render loop that
//! must never block, [`ClusterCoordinator::wait`] suits batch callers.
//!
//! Cancellation is fire-and-forget. [`ClusterCoordinator::cancel`] reports the
//! run as cancelled immediately, while the worker halts on its own at the
//! next checkpoint and later sends a result that the coordinator discards,
//! keeping only the buffer.
//!
//! If the worker dies, the coordinator moves to [`Phase::Disconnected`] and
//! spawns a fresh worker on the next submission.

use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::buffer::PixelBuffer;
use crate::cancel::CancellationToken;
use crate::error::{ClusterError, Result};
use crate::protocol::{ClusterRequest, ClusterResult, WorkerMessage};
use crate::sampling::{OsSampler, PixelSampler};
use crate::worker::ClusterWorker;

/// Where the coordinator is in its run lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// No run submitted yet.
    Idle,
    /// A run is in flight; new submissions are handed back.
    Running,
    /// The last run delivered its centroids.
    Completed,
    /// The last run was cancelled.
    Cancelled,
    /// The worker went away; the next submission starts a new one.
    Disconnected,
}

/// What happened to a submitted request.
#[derive(Debug)]
#[must_use = "a busy submission hands the request back"]
pub enum Submission {
    /// The request was sent to the worker.
    Accepted,
    /// Another run is in flight; the request was not queued.
    Busy(ClusterRequest),
}

impl Submission {
    pub fn is_accepted(&self) -> bool {
        matches!(self, Submission::Accepted)
    }
}

type Spawner = Box<dyn FnMut() -> Result<ClusterWorker> + Send>;

pub struct ClusterCoordinator {
    worker: ClusterWorker,
    spawn: Spawner,
    phase: Phase,
    token: Option<CancellationToken>,
    /// Cancelled runs whose `worker-result` has not arrived yet.
    late_results: usize,
    reclaimed: Option<PixelBuffer>,
}

impl ClusterCoordinator {
    /// Start a coordinator with its own worker thread.
    pub fn new() -> Result<Self> {
        Self::with_sampler(OsSampler)
    }

    /// Start a coordinator whose worker seeds centroids from `sampler`.
    ///
    /// Every worker spawned after a disconnect gets its own clone of it.
    pub fn with_sampler<S>(sampler: S) -> Result<Self>
    where
        S: PixelSampler + Clone + Send + 'static,
    {
        let mut spawn: Spawner = Box::new(move || ClusterWorker::spawn_with(sampler.clone()));
        Ok(Self {
            worker: spawn()?,
            spawn,
            phase: Phase::Idle,
            token: None,
            late_results: 0,
            reclaimed: None,
        })
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn is_running(&self) -> bool {
        self.phase == Phase::Running
    }

    /// Dispatch `request` to the worker unless a run is already in flight.
    ///
    /// Invalid requests are rejected before anything is sent.
    pub fn submit(&mut self, request: ClusterRequest) -> Result<Submission> {
        if self.is_running() {
            debug!("ignoring palette request while a run is in flight");
            return Ok(Submission::Busy(request));
        }
        request.validate()?;

        if self.phase == Phase::Disconnected {
            info!("restarting cluster worker");
            self.worker = (self.spawn)()?;
            self.phase = Phase::Idle;
        }

        let token = CancellationToken::new();
        debug!(k = request.k, iterations = request.iterations, "submitting palette run");
        self.worker
            .post(request.into_message(token.clone()))
            .map_err(|e| self.lost_worker(e))?;

        self.token = Some(token);
        self.phase = Phase::Running;
        Ok(Submission::Accepted)
    }

    /// Cancel the run in flight and return its immediate cancellation result.
    ///
    /// Returns `None` when nothing is running. The returned result carries no
    /// buffer: the worker still owns it until its own result arrives, after
    /// which it is available from [`ClusterCoordinator::take_buffer`].
    pub fn cancel(&mut self) -> Option<ClusterResult> {
        if !self.is_running() {
            return None;
        }
        if let Some(token) = self.token.take() {
            token.cancel();
        }
        if let Err(e) = self.worker.post(WorkerMessage::Cancel) {
            warn!(error = %e, "failed to deliver cancel to cluster worker");
        }

        self.late_results += 1;
        self.phase = Phase::Cancelled;
        debug!("palette run cancelled");
        Some(ClusterResult::cancelled())
    }

    /// Process any pending worker messages without blocking.
    ///
    /// Returns the active run's result once it is available.
    pub fn poll(&mut self) -> Result<Option<ClusterResult>> {
        while let Some(message) = self.worker.try_recv().map_err(|e| self.lost_worker(e))? {
            if let Some(result) = self.handle(message) {
                return Ok(Some(result));
            }
        }
        Ok(None)
    }

    /// Block until the active run resolves. Returns `None` if nothing is
    /// running.
    pub fn wait(&mut self) -> Result<Option<ClusterResult>> {
        while self.is_running() {
            let message = self.worker.recv().map_err(|e| self.lost_worker(e))?;
            if let Some(result) = self.handle(message) {
                return Ok(Some(result));
            }
        }
        Ok(None)
    }

    /// Like [`ClusterCoordinator::wait`], giving up after `timeout`. The run
    /// stays in flight when the timeout expires.
    pub fn wait_timeout(&mut self, timeout: Duration) -> Result<Option<ClusterResult>> {
        let deadline = Instant::now() + timeout;
        while self.is_running() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let Some(message) = self
                .worker
                .recv_timeout(remaining)
                .map_err(|e| self.lost_worker(e))?
            else {
                return Ok(None);
            };
            if let Some(result) = self.handle(message) {
                return Ok(Some(result));
            }
        }
        Ok(None)
    }

    /// Wait up to `limit` for the active run, cancelling it if the limit
    /// expires. A cancelled run resolves to the usual cancellation result.
    pub fn wait_or_cancel(&mut self, limit: Duration) -> Result<Option<ClusterResult>> {
        if let Some(result) = self.wait_timeout(limit)? {
            return Ok(Some(result));
        }
        Ok(self.cancel())
    }

    /// Take the buffer returned by a cancelled run, if it has come back.
    pub fn take_buffer(&mut self) -> Option<PixelBuffer> {
        self.reclaimed.take()
    }

    /// Number of cancelled runs still computing or unacknowledged.
    pub fn pending_late_results(&self) -> usize {
        self.late_results
    }

    /// Forget everything owned by the dead worker, including the buffer of
    /// any run in flight.
    fn lost_worker(&mut self, error: ClusterError) -> ClusterError {
        warn!(error = %error, phase = ?self.phase, "cluster worker lost");
        if let Some(token) = self.token.take() {
            token.cancel();
        }
        self.late_results = 0;
        self.phase = Phase::Disconnected;
        error
    }

    fn handle(&mut self, message: WorkerMessage) -> Option<ClusterResult> {
        match message {
            WorkerMessage::WorkerResult {
                result,
                execution_time,
                data_buffer,
                error,
            } => {
                if self.late_results > 0 {
                    self.late_results -= 1;
                    debug!(
                        execution_time,
                        has_clusters = result.is_some(),
                        "discarding worker result of a cancelled run"
                    );
                    self.reclaimed = Some(data_buffer);
                    return None;
                }
                if !self.is_running() {
                    warn!("unexpected worker result with no run in flight");
                    self.reclaimed = Some(data_buffer);
                    return None;
                }

                self.token = None;
                self.phase = Phase::Completed;
                Some(ClusterResult {
                    clusters: result,
                    execution_time_ms: execution_time,
                    buffer: Some(data_buffer),
                    error,
                })
            }
            other => {
                warn!(action = other.action(), "unexpected message from cluster worker");
                None
            }
        }
    }
}

impl Drop for ClusterCoordinator {
    fn drop(&mut self) {
        if let Some(token) = self.token.take() {
            token.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ClusterConfig;

    fn request(k: usize) -> ClusterRequest {
        ClusterRequest::new(
            PixelBuffer::new(vec![10, 20, 30, 255, 200, 210, 220, 255]),
            2,
            1,
            &ClusterConfig::new(k).with_iterations(2),
        )
    }

    #[test]
    fn starts_idle() {
        let mut coordinator = ClusterCoordinator::new().unwrap();
        assert_eq!(coordinator.phase(), Phase::Idle);
        assert!(coordinator.cancel().is_none());
        assert!(coordinator.wait().unwrap().is_none());
        assert!(coordinator.poll().unwrap().is_none());
    }

    #[test]
    fn invalid_request_is_rejected_without_running() {
        let mut coordinator = ClusterCoordinator::new().unwrap();
        let err = coordinator.submit(request(0)).unwrap_err();
        assert!(err.is_invalid_input());
        assert_eq!(coordinator.phase(), Phase::Idle);
    }

    #[test]
    fn completed_run_returns_buffer() {
        let mut coordinator = ClusterCoordinator::new().unwrap();
        assert!(coordinator.submit(request(2)).unwrap().is_accepted());
        assert_eq!(coordinator.phase(), Phase::Running);

        let result = coordinator.wait().unwrap().unwrap();
        assert_eq!(coordinator.phase(), Phase::Completed);
        assert_eq!(result.clusters.unwrap().len(), 2);
        assert!(result.execution_time_ms >= 0.0);
        assert_eq!(
            result.buffer.unwrap().into_inner(),
            vec![10, 20, 30, 255, 200, 210, 220, 255]
        );
    }

    #[test]
    fn oversized_k_completes_with_error() {
        let mut coordinator = ClusterCoordinator::new().unwrap();
        assert!(coordinator.submit(request(usize::MAX)).unwrap().is_accepted());

        let result = coordinator.wait().unwrap().unwrap();
        assert_eq!(coordinator.phase(), Phase::Completed);
        assert!(result.clusters.is_none());
        assert!(result.error.unwrap().contains("cannot allocate"));
        assert_eq!(result.buffer.unwrap().len(), 8);
    }

    #[test]
    fn wait_or_cancel_returns_result_that_beats_the_limit() {
        let mut coordinator = ClusterCoordinator::new().unwrap();
        assert!(coordinator.submit(request(2)).unwrap().is_accepted());

        let result = coordinator
            .wait_or_cancel(Duration::from_secs(30))
            .unwrap()
            .unwrap();
        assert!(!result.is_cancelled());
        assert_eq!(coordinator.phase(), Phase::Completed);
        assert!(coordinator.wait_or_cancel(Duration::from_millis(1)).unwrap().is_none());
    }
}
