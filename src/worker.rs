//! The background side of palette extraction.
//!
//! [`ClusterWorker`] receives [`WorkerMessage::Run`] requests, clusters the
//! moved-in buffer and sends the buffer back inside a
//! [`WorkerMessage::WorkerResult`]. Runs are processed strictly one at a time
//! in arrival order; a [`WorkerMessage::Cancel`] takes effect on the run it
//! follows even while that run is computing.

#[cfg(not(target_arch = "wasm32"))]
use std::thread::{self, JoinHandle};
#[cfg(not(target_arch = "wasm32"))]
use std::time::Duration;

#[cfg(not(target_arch = "wasm32"))]
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TryRecvError};
use tracing::{debug, info, warn};

use crate::cancel::CancellationToken;
#[cfg(not(target_arch = "wasm32"))]
use crate::error::{ClusterError, Result};
use crate::kmeans::KMeans;
use crate::protocol::{ClusterRequest, WorkerMessage};
#[cfg(not(target_arch = "wasm32"))]
use crate::sampling::OsSampler;
use crate::sampling::PixelSampler;
use crate::timing::Stopwatch;

/// Run one clustering job and package the outcome as a `worker-result`.
///
/// Failures are reported inside the message, never returned, so nothing
/// but data crosses back to the caller.
pub fn process_run<S: PixelSampler>(
    request: ClusterRequest,
    token: &CancellationToken,
    sampler: &mut S,
) -> WorkerMessage {
    let ClusterRequest {
        buffer,
        width,
        height,
        k,
        iterations,
    } = request;

    let mut kmeans = KMeans::new(k, iterations).with_sampler(&mut *sampler);
    let timer = Stopwatch::start();
    let outcome = kmeans.run(buffer.as_bytes(), width, height, token);
    let execution_time = timer.elapsed_ms();

    match outcome {
        Ok(result) => {
            if result.is_some() {
                info!(k, iterations, width, height, execution_time, "palette extracted");
            } else {
                debug!(execution_time, "clustering run abandoned after cancellation");
            }
            WorkerMessage::WorkerResult {
                result,
                execution_time,
                data_buffer: buffer,
                error: None,
            }
        }
        Err(e) => {
            warn!(error = %e, "clustering run failed");
            WorkerMessage::WorkerResult {
                result: None,
                execution_time,
                data_buffer: buffer,
                error: Some(e.to_string()),
            }
        }
    }
}

/// Handle to the background clustering threads.
///
/// A dispatcher thread reads the inbox and forwards runs to a compute thread,
/// so a `cancel` reaches the run in progress while it is still polling.
/// Dropping the handle closes the inbox and joins both threads, which waits
/// for any run in progress to finish or observe its cancellation.
#[cfg(not(target_arch = "wasm32"))]
pub struct ClusterWorker {
    inbox: Option<Sender<WorkerMessage>>,
    outbox: Receiver<WorkerMessage>,
    dispatcher: Option<JoinHandle<()>>,
    compute: Option<JoinHandle<()>>,
}

#[cfg(not(target_arch = "wasm32"))]
impl ClusterWorker {
    /// Spawn a worker that seeds centroids from OS randomness.
    pub fn spawn() -> Result<Self> {
        Self::spawn_with(OsSampler)
    }

    /// Spawn a worker with a custom seeding source.
    pub fn spawn_with<S>(sampler: S) -> Result<Self>
    where
        S: PixelSampler + Send + 'static,
    {
        let (inbox_tx, inbox_rx) = crossbeam_channel::unbounded();
        let (jobs_tx, jobs_rx) = crossbeam_channel::unbounded();
        let (outbox_tx, outbox_rx) = crossbeam_channel::unbounded();

        // Only the compute thread holds the outbox sender, so the caller sees
        // a disconnect as soon as it exits or panics.
        let compute = thread::Builder::new()
            .name("cluster-compute".into())
            .spawn(move || compute_loop(jobs_rx, outbox_tx, sampler))?;
        let dispatcher = thread::Builder::new()
            .name("cluster-worker".into())
            .spawn(move || dispatch_loop(inbox_rx, jobs_tx))?;

        debug!("cluster worker started");
        Ok(Self {
            inbox: Some(inbox_tx),
            outbox: outbox_rx,
            dispatcher: Some(dispatcher),
            compute: Some(compute),
        })
    }

    /// Send a message to the worker. Messages are delivered in send order.
    pub fn post(&self, message: WorkerMessage) -> Result<()> {
        let inbox = self.inbox.as_ref().ok_or(ClusterError::WorkerDisconnected)?;
        inbox
            .send(message)
            .map_err(|_| ClusterError::WorkerDisconnected)
    }

    pub fn try_recv(&self) -> Result<Option<WorkerMessage>> {
        match self.outbox.try_recv() {
            Ok(message) => Ok(Some(message)),
            Err(TryRecvError::Empty) => Ok(None),
            Err(TryRecvError::Disconnected) => Err(ClusterError::WorkerDisconnected),
        }
    }

    pub fn recv(&self) -> Result<WorkerMessage> {
        self.outbox
            .recv()
            .map_err(|_| ClusterError::WorkerDisconnected)
    }

    pub fn recv_timeout(&self, timeout: Duration) -> Result<Option<WorkerMessage>> {
        match self.outbox.recv_timeout(timeout) {
            Ok(message) => Ok(Some(message)),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => Err(ClusterError::WorkerDisconnected),
        }
    }
}

#[cfg(not(target_arch = "wasm32"))]
impl Drop for ClusterWorker {
    fn drop(&mut self) {
        self.inbox.take();
        for handle in [self.dispatcher.take(), self.compute.take()].into_iter().flatten() {
            if handle.join().is_err() {
                warn!("cluster worker thread panicked");
            }
        }
    }
}

/// Reads the inbox and owns the token of the most recently forwarded run.
///
/// A `cancel` always follows the `run` it targets in the inbox, so it is
/// applied to whichever run was forwarded last, queued or computing.
#[cfg(not(target_arch = "wasm32"))]
fn dispatch_loop(
    inbox: Receiver<WorkerMessage>,
    jobs: Sender<(ClusterRequest, CancellationToken)>,
) {
    let mut current: Option<CancellationToken> = None;

    for message in inbox.iter() {
        match message {
            WorkerMessage::Run {
                data_buffer,
                data_width,
                data_height,
                k,
                iterations,
                token,
            } => {
                current = Some(token.clone());
                let request = ClusterRequest {
                    buffer: data_buffer,
                    width: data_width,
                    height: data_height,
                    k,
                    iterations,
                };
                if jobs.send((request, token)).is_err() {
                    debug!("compute thread gone, stopping cluster worker");
                    return;
                }
            }
            WorkerMessage::Cancel => match &current {
                Some(token) => {
                    token.cancel();
                    debug!("cluster worker received cancel");
                }
                None => debug!("cluster worker received cancel with no run"),
            },
            WorkerMessage::WorkerResult { .. } => {
                warn!("cluster worker ignoring unexpected worker-result message");
            }
        }
    }

    debug!("cluster worker inbox closed");
}

#[cfg(not(target_arch = "wasm32"))]
fn compute_loop<S: PixelSampler>(
    jobs: Receiver<(ClusterRequest, CancellationToken)>,
    outbox: Sender<WorkerMessage>,
    mut sampler: S,
) {
    for (request, token) in jobs.iter() {
        let reply = process_run(request, &token, &mut sampler);
        if outbox.send(reply).is_err() {
            debug!("coordinator dropped, stopping cluster compute thread");
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::PixelBuffer;
    use crate::config::ClusterConfig;
    use crate::sampling::SequenceSampler;

    fn two_pixel_request() -> ClusterRequest {
        ClusterRequest::new(
            PixelBuffer::new(vec![0, 0, 0, 255, 255, 255, 255, 255]),
            2,
            1,
            &ClusterConfig::new(2).with_iterations(1),
        )
    }

    #[test]
    fn process_run_returns_buffer_and_centroids() {
        let mut sampler = SequenceSampler::new(vec![0, 1]);
        let reply = process_run(two_pixel_request(), &CancellationToken::new(), &mut sampler);
        match reply {
            WorkerMessage::WorkerResult {
                result,
                execution_time,
                data_buffer,
                error,
            } => {
                assert_eq!(result.map(|c| c.len()), Some(2));
                assert!(execution_time >= 0.0);
                assert_eq!(data_buffer.as_bytes(), &[0, 0, 0, 255, 255, 255, 255, 255]);
                assert!(error.is_none());
            }
            other => panic!("unexpected message: {}", other.action()),
        }
    }

    #[test]
    fn process_run_reports_failure_as_data() {
        let request = ClusterRequest::new(
            PixelBuffer::new(vec![1, 2, 3]),
            1,
            1,
            &ClusterConfig::new(1),
        );
        let reply = process_run(request, &CancellationToken::new(), &mut SequenceSampler::new(vec![0]));
        match reply {
            WorkerMessage::WorkerResult {
                result,
                data_buffer,
                error,
                ..
            } => {
                assert!(result.is_none());
                assert_eq!(data_buffer.len(), 3);
                assert!(error.unwrap().contains("does not match"));
            }
            other => panic!("unexpected message: {}", other.action()),
        }
    }

    #[test]
    fn worker_thread_answers_runs_in_order() {
        let worker = ClusterWorker::spawn_with(SequenceSampler::new(vec![0, 1])).unwrap();
        for _ in 0..2 {
            worker
                .post(two_pixel_request().into_message(CancellationToken::new()))
                .unwrap();
        }
        for _ in 0..2 {
            match worker.recv().unwrap() {
                WorkerMessage::WorkerResult { result, .. } => {
                    let clusters = result.unwrap();
                    assert!(clusters.iter().all(|c| c.count == 1));
                }
                other => panic!("unexpected message: {}", other.action()),
            }
        }
        assert!(worker.try_recv().unwrap().is_none());
    }

    #[test]
    fn worker_thread_honours_pre_cancelled_token() {
        let worker = ClusterWorker::spawn().unwrap();
        let token = CancellationToken::new();
        token.cancel();
        worker.post(two_pixel_request().into_message(token)).unwrap();
        match worker.recv().unwrap() {
            WorkerMessage::WorkerResult { result, data_buffer, .. } => {
                assert!(result.is_none());
                assert_eq!(data_buffer.len(), 8);
            }
            other => panic!("unexpected message: {}", other.action()),
        }
    }

    #[test]
    fn cancel_message_stops_run_in_progress() {
        let worker = ClusterWorker::spawn().unwrap();
        let (width, height) = (256u32, 256u32);
        let json = serde_json::json!({
            "action": "run",
            "dataBuffer": vec![90u8; (width * height * 4) as usize],
            "dataWidth": width,
            "dataHeight": height,
            "k": 16,
            "iterations": 1_000_000,
        })
        .to_string();

        // A deserialized run carries a token nobody else holds; only the
        // cancel message can reach it.
        worker.post(WorkerMessage::from_json(&json).unwrap()).unwrap();
        std::thread::sleep(Duration::from_millis(20));
        worker.post(WorkerMessage::Cancel).unwrap();

        match worker.recv_timeout(Duration::from_secs(5)).unwrap() {
            Some(WorkerMessage::WorkerResult { result, data_buffer, error, .. }) => {
                assert!(result.is_none());
                assert!(error.is_none());
                assert_eq!(data_buffer.len(), (width * height * 4) as usize);
            }
            Some(other) => panic!("unexpected message: {}", other.action()),
            None => panic!("cancel did not stop the running job"),
        }
    }

    #[test]
    fn allocation_failure_is_reported_as_data() {
        let worker = ClusterWorker::spawn().unwrap();
        let request = ClusterRequest::new(
            PixelBuffer::new(vec![1, 2, 3, 4]),
            1,
            1,
            &ClusterConfig::new(usize::MAX),
        );
        worker.post(request.into_message(CancellationToken::new())).unwrap();
        match worker.recv().unwrap() {
            WorkerMessage::WorkerResult { result, data_buffer, error, .. } => {
                assert!(result.is_none());
                assert_eq!(data_buffer.into_inner(), vec![1, 2, 3, 4]);
                assert!(error.unwrap().contains("allocate"));
            }
            other => panic!("unexpected message: {}", other.action()),
        }
        // The worker survives and serves the next run.
        worker
            .post(two_pixel_request().into_message(CancellationToken::new()))
            .unwrap();
        assert!(matches!(
            worker.recv().unwrap(),
            WorkerMessage::WorkerResult { result: Some(_), .. }
        ));
    }

    #[test]
    fn cancel_without_run_is_ignored() {
        let worker = ClusterWorker::spawn().unwrap();
        worker.post(WorkerMessage::Cancel).unwrap();
        assert!(
            worker
                .recv_timeout(Duration::from_millis(50))
                .unwrap()
                .is_none()
        );
    }
}
