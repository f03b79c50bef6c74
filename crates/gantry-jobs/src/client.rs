//! JobClient — blocking-wait-with-poll submission on top of a transport.
//!
//! A submission polls at a fixed interval up to a bounded retry count and
//! always resolves to a terminal [`JobOutcome`]; it can never hang. Batch
//! submission drives all jobs through shared poll rounds so a cycle's worth
//! of work completes in one bounded wait.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tracing::{debug, warn};

use crate::error::TransportError;
use crate::transport::{JobHandle, JobTransport, PollStatus};

/// Terminal result of a job submission.
#[derive(Debug, Clone, PartialEq)]
pub enum JobOutcome {
    /// The worker responded with this payload (which may itself say FAIL).
    Completed(Value),
    /// The job server is up but the worker never responded in time.
    TimedOut,
    /// The job server connection was lost.
    Disconnected,
}

impl JobOutcome {
    pub fn is_completed(&self) -> bool {
        matches!(self, JobOutcome::Completed(_))
    }
}

/// Client wrapping a queue transport with poll/timeout bookkeeping.
#[derive(Clone)]
pub struct JobClient {
    transport: Arc<dyn JobTransport>,
    poll_interval: Duration,
    poll_retries: u32,
}

impl JobClient {
    /// Create a client with the given poll interval and retry bound.
    pub fn new(transport: Arc<dyn JobTransport>, poll_interval: Duration, poll_retries: u32) -> Self {
        Self {
            transport,
            poll_interval,
            poll_retries,
        }
    }

    /// The configured per-job retry bound.
    pub fn poll_retries(&self) -> u32 {
        self.poll_retries
    }

    /// Submit one job and wait for a terminal outcome.
    pub async fn submit(&self, worker: &str, payload: &Value) -> JobOutcome {
        self.submit_with_retries(worker, payload, self.poll_retries)
            .await
    }

    /// Submit one job with a caller-supplied retry bound (the ping cycle
    /// uses an extended bound for its second-chance batch).
    pub async fn submit_with_retries(
        &self,
        worker: &str,
        payload: &Value,
        retries: u32,
    ) -> JobOutcome {
        let handle = match self.transport.submit(worker, payload) {
            Ok(h) => h,
            Err(TransportError::Disconnected) => {
                warn!(%worker, "job server disconnected on submit");
                return JobOutcome::Disconnected;
            }
            Err(e) => {
                warn!(%worker, error = %e, "job submit failed");
                return JobOutcome::Disconnected;
            }
        };

        for attempt in 0..retries {
            match self.transport.poll(handle) {
                Ok(PollStatus::Done(result)) => {
                    debug!(%worker, attempt, "job completed");
                    return JobOutcome::Completed(result);
                }
                Ok(PollStatus::Pending) => {
                    tokio::time::sleep(self.poll_interval).await;
                }
                Err(TransportError::Disconnected) => {
                    warn!(%worker, "job server disconnected while polling");
                    return JobOutcome::Disconnected;
                }
                Err(e) => {
                    warn!(%worker, error = %e, "job poll failed");
                    return JobOutcome::Disconnected;
                }
            }
        }

        debug!(%worker, retries, "job timed out");
        JobOutcome::TimedOut
    }

    /// Submit a batch and wait for every job to reach a terminal state
    /// within the shared poll-round bound. Jobs still pending after the
    /// rounds are exhausted come back as `TimedOut`.
    pub async fn submit_many(&self, jobs: &[(String, Value)]) -> Vec<JobOutcome> {
        let mut outcomes: Vec<Option<JobOutcome>> = vec![None; jobs.len()];
        let mut pending: HashMap<usize, JobHandle> = HashMap::new();

        for (idx, (worker, payload)) in jobs.iter().enumerate() {
            match self.transport.submit(worker, payload) {
                Ok(handle) => {
                    pending.insert(idx, handle);
                }
                Err(_) => {
                    warn!(%worker, "job server disconnected on batch submit");
                    outcomes[idx] = Some(JobOutcome::Disconnected);
                }
            }
        }

        for _round in 0..self.poll_retries {
            if pending.is_empty() {
                break;
            }
            let mut done: Vec<usize> = Vec::new();
            for (&idx, &handle) in &pending {
                match self.transport.poll(handle) {
                    Ok(PollStatus::Done(result)) => {
                        outcomes[idx] = Some(JobOutcome::Completed(result));
                        done.push(idx);
                    }
                    Ok(PollStatus::Pending) => {}
                    Err(_) => {
                        outcomes[idx] = Some(JobOutcome::Disconnected);
                        done.push(idx);
                    }
                }
            }
            for idx in done {
                pending.remove(&idx);
            }
            if !pending.is_empty() {
                tokio::time::sleep(self.poll_interval).await;
            }
        }

        outcomes
            .into_iter()
            .map(|o| o.unwrap_or(JobOutcome::TimedOut))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mem::InMemoryQueue;
    use serde_json::json;
    use std::time::Instant;

    fn echo_queue() -> Arc<InMemoryQueue> {
        let queue = Arc::new(InMemoryQueue::new());
        queue.register("echo", |payload| {
            let mut result = payload.clone();
            result["response"] = json!("PASS");
            result
        });
        queue
    }

    #[tokio::test]
    async fn submit_completes_against_registered_worker() {
        let queue = echo_queue();
        let client = JobClient::new(queue, Duration::from_millis(10), 5);

        let outcome = client.submit("echo", &json!({"action": "BUILD_DEVICE"})).await;
        match outcome {
            JobOutcome::Completed(v) => assert_eq!(v["response"], "PASS"),
            other => panic!("expected Completed, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn submit_times_out_within_bound() {
        // No handler registered — the job never completes.
        let queue = Arc::new(InMemoryQueue::new());
        let client = JobClient::new(queue, Duration::from_secs(1), 4);

        let start = Instant::now();
        let outcome = client.submit("silent", &json!({})).await;

        assert_eq!(outcome, JobOutcome::TimedOut);
        // Paused time: elapsed virtual time is exactly retries * interval.
        assert!(start.elapsed() <= Duration::from_secs(5));
    }

    #[tokio::test]
    async fn submit_detects_disconnect() {
        let queue = Arc::new(InMemoryQueue::new());
        queue.disconnect();
        let client = JobClient::new(queue, Duration::from_millis(10), 3);

        let outcome = client.submit("echo", &json!({})).await;
        assert_eq!(outcome, JobOutcome::Disconnected);
    }

    #[tokio::test]
    async fn submit_detects_disconnect_mid_poll() {
        let queue = Arc::new(InMemoryQueue::new());
        let client = JobClient::new(queue.clone(), Duration::from_millis(5), 50);

        let poller = tokio::spawn({
            let client = client.clone();
            async move { client.submit("silent", &json!({})).await }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.disconnect();

        assert_eq!(poller.await.unwrap(), JobOutcome::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn batch_mixes_completed_and_timed_out() {
        let queue = echo_queue();
        let client = JobClient::new(queue, Duration::from_millis(100), 3);

        let jobs = vec![
            ("echo".to_string(), json!({"n": 1})),
            ("silent".to_string(), json!({"n": 2})),
            ("echo".to_string(), json!({"n": 3})),
        ];
        let outcomes = client.submit_many(&jobs).await;

        assert!(outcomes[0].is_completed());
        assert_eq!(outcomes[1], JobOutcome::TimedOut);
        assert!(outcomes[2].is_completed());
    }

    #[tokio::test]
    async fn batch_of_nothing_is_empty() {
        let queue = echo_queue();
        let client = JobClient::new(queue, Duration::from_millis(10), 3);
        assert!(client.submit_many(&[]).await.is_empty());
    }

    #[tokio::test]
    async fn extended_retry_bound_is_honored() {
        let queue = Arc::new(InMemoryQueue::new());
        let client = JobClient::new(queue.clone(), Duration::from_millis(5), 1);

        // Complete the job manually after the first bound would have expired.
        let handle_queue = queue.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            handle_queue.complete_next(json!({"response": "PASS"}));
        });

        let outcome = client
            .submit_with_retries("manual", &json!({}), 50)
            .await;
        assert!(outcome.is_completed());
    }
}
