//! In-memory job queue.
//!
//! Used by the standalone daemon (embedded worker controller) and by every
//! test. Workers are handler closures registered per worker name; a job
//! submitted to an unregistered worker stays pending forever, which is how
//! tests drive the timeout path. A disconnect switch makes every transport
//! call fail, driving the disconnect path.

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use serde_json::Value;

use crate::error::TransportError;
use crate::transport::{JobHandle, JobTransport, PollStatus};

type Handler = Box<dyn Fn(&Value) -> Value + Send + Sync>;

struct QueueInner {
    next_handle: u64,
    /// handle → result (None while pending).
    jobs: HashMap<u64, Option<Value>>,
    /// handle → worker name and payload, kept while pending.
    pending: HashMap<u64, (String, Value)>,
    /// Pending handles in submission order, for `complete_next`.
    pending_order: Vec<u64>,
    /// Submission log: (worker, payload), for assertions.
    log: Vec<(String, Value)>,
}

/// An in-process queue implementing [`JobTransport`].
pub struct InMemoryQueue {
    inner: Mutex<QueueInner>,
    handlers: Mutex<HashMap<String, Handler>>,
    disconnected: AtomicBool,
}

impl InMemoryQueue {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(QueueInner {
                next_handle: 1,
                jobs: HashMap::new(),
                pending: HashMap::new(),
                pending_order: Vec::new(),
                log: Vec::new(),
            }),
            handlers: Mutex::new(HashMap::new()),
            disconnected: AtomicBool::new(false),
        }
    }

    /// Register a worker handler. Jobs submitted to this name complete
    /// synchronously with the handler's result.
    pub fn register(&self, worker: &str, handler: impl Fn(&Value) -> Value + Send + Sync + 'static) {
        self.handlers
            .lock()
            .expect("handler registry poisoned")
            .insert(worker.to_string(), Box::new(handler));
    }

    /// Simulate losing the job server connection.
    pub fn disconnect(&self) {
        self.disconnected.store(true, Ordering::SeqCst);
    }

    /// Restore the connection after [`Self::disconnect`].
    pub fn reconnect(&self) {
        self.disconnected.store(false, Ordering::SeqCst);
    }

    /// Complete the oldest pending job with the given result.
    pub fn complete_next(&self, result: Value) {
        let mut inner = self.inner.lock().expect("queue poisoned");
        if !inner.pending_order.is_empty() {
            let handle = inner.pending_order.remove(0);
            inner.pending.remove(&handle);
            inner.jobs.insert(handle, Some(result));
        }
    }

    /// Claim the oldest pending job addressed to `worker` for out-of-band
    /// processing (the embedded worker loop). The submitter keeps seeing
    /// Pending until [`Self::complete`] is called for the handle.
    pub fn claim_pending(&self, worker: &str) -> Option<(JobHandle, Value)> {
        let mut inner = self.inner.lock().expect("queue poisoned");
        let pos = inner.pending_order.iter().position(|handle| {
            inner
                .pending
                .get(handle)
                .is_some_and(|(w, _)| w == worker)
        })?;
        let handle = inner.pending_order.remove(pos);
        let (_, payload) = inner.pending.remove(&handle)?;
        Some((JobHandle(handle), payload))
    }

    /// Complete a claimed job with its result.
    pub fn complete(&self, handle: JobHandle, result: Value) {
        let mut inner = self.inner.lock().expect("queue poisoned");
        inner.jobs.insert(handle.0, Some(result));
    }

    /// Every submission seen so far, in order.
    pub fn submissions(&self) -> Vec<(String, Value)> {
        self.inner.lock().expect("queue poisoned").log.clone()
    }

    /// How many submissions targeted the given worker.
    pub fn submitted_to(&self, worker: &str) -> usize {
        self.inner
            .lock()
            .expect("queue poisoned")
            .log
            .iter()
            .filter(|(w, _)| w == worker)
            .count()
    }
}

impl Default for InMemoryQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl JobTransport for InMemoryQueue {
    fn submit(&self, worker: &str, payload: &Value) -> Result<JobHandle, TransportError> {
        if self.disconnected.load(Ordering::SeqCst) {
            return Err(TransportError::Disconnected);
        }

        let result = {
            let handlers = self.handlers.lock().expect("handler registry poisoned");
            handlers.get(worker).map(|h| h(payload))
        };

        let mut inner = self.inner.lock().expect("queue poisoned");
        let handle = inner.next_handle;
        inner.next_handle += 1;
        inner.log.push((worker.to_string(), payload.clone()));
        if result.is_none() {
            inner.pending_order.push(handle);
            inner
                .pending
                .insert(handle, (worker.to_string(), payload.clone()));
        }
        inner.jobs.insert(handle, result);
        Ok(JobHandle(handle))
    }

    fn poll(&self, handle: JobHandle) -> Result<PollStatus, TransportError> {
        if self.disconnected.load(Ordering::SeqCst) {
            return Err(TransportError::Disconnected);
        }
        let inner = self.inner.lock().expect("queue poisoned");
        match inner.jobs.get(&handle.0) {
            Some(Some(result)) => Ok(PollStatus::Done(result.clone())),
            Some(None) => Ok(PollStatus::Pending),
            None => Err(TransportError::Other(format!("unknown job {}", handle.0))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn registered_worker_completes_synchronously() {
        let queue = InMemoryQueue::new();
        queue.register("w", |p| json!({"echo": p.clone()}));

        let handle = queue.submit("w", &json!({"x": 1})).unwrap();
        match queue.poll(handle).unwrap() {
            PollStatus::Done(v) => assert_eq!(v["echo"]["x"], 1),
            PollStatus::Pending => panic!("expected Done"),
        }
    }

    #[test]
    fn unregistered_worker_stays_pending() {
        let queue = InMemoryQueue::new();
        let handle = queue.submit("ghost", &json!({})).unwrap();
        assert_eq!(queue.poll(handle).unwrap(), PollStatus::Pending);

        queue.complete_next(json!({"done": true}));
        assert!(matches!(queue.poll(handle).unwrap(), PollStatus::Done(_)));
    }

    #[test]
    fn disconnect_fails_submit_and_poll() {
        let queue = InMemoryQueue::new();
        let handle = queue.submit("ghost", &json!({})).unwrap();

        queue.disconnect();
        assert!(matches!(
            queue.submit("ghost", &json!({})),
            Err(TransportError::Disconnected)
        ));
        assert!(matches!(
            queue.poll(handle),
            Err(TransportError::Disconnected)
        ));

        queue.reconnect();
        assert!(queue.poll(handle).is_ok());
    }

    #[test]
    fn submission_log_counts_per_worker() {
        let queue = InMemoryQueue::new();
        queue.submit("a", &json!({})).unwrap();
        queue.submit("a", &json!({})).unwrap();
        queue.submit("b", &json!({})).unwrap();

        assert_eq!(queue.submitted_to("a"), 2);
        assert_eq!(queue.submitted_to("b"), 1);
        assert_eq!(queue.submissions().len(), 3);
    }

    #[test]
    fn claimed_jobs_complete_out_of_band() {
        let queue = InMemoryQueue::new();
        let handle = queue.submit("pool", &json!({"action": "BUILD_IP"})).unwrap();
        queue.submit("other", &json!({})).unwrap();

        // Only jobs for the claimed worker come back.
        let (claimed, payload) = queue.claim_pending("pool").unwrap();
        assert_eq!(claimed, handle);
        assert_eq!(payload["action"], "BUILD_IP");
        assert!(queue.claim_pending("pool").is_none());

        // Pending until completed.
        assert_eq!(queue.poll(handle).unwrap(), PollStatus::Pending);
        queue.complete(claimed, json!({"response": "PASS"}));
        assert!(matches!(queue.poll(handle).unwrap(), PollStatus::Done(_)));
    }

    #[test]
    fn unknown_handle_is_an_error() {
        let queue = InMemoryQueue::new();
        assert!(queue.poll(JobHandle(99)).is_err());
    }
}
