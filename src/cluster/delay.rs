use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::debug;

use super::node::NodeKey;

/// What caused a refresh to be requested.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RefreshReason {
    Moved { slot: u16 },
    NodeDown,
    NodeError,
    ClusterDown,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefreshRequest {
    pub bucket: String,
    pub reason: RefreshReason,
    pub trigger: Option<NodeKey>,
}

impl RefreshRequest {
    pub fn new(bucket: impl Into<String>, reason: RefreshReason, trigger: Option<NodeKey>) -> Self {
        Self {
            bucket: bucket.into(),
            reason,
            trigger,
        }
    }
}

/// Invoked once per expired window with the bucket name and every request
/// that landed in it.
pub type RefreshAction = Arc<dyn Fn(&str, Vec<RefreshRequest>) + Send + Sync>;

#[derive(Default)]
struct Bucket {
    queue: Vec<RefreshRequest>,
    timer: Option<JoinHandle<()>>,
}

/// Coalesces refresh requests per bucket. The first request in an idle
/// bucket opens a window; everything arriving before it closes is handled
/// by the same single action call.
pub struct RefreshScheduler {
    window: Duration,
    action: RefreshAction,
    buckets: Mutex<HashMap<String, Bucket>>,
    this: Weak<RefreshScheduler>,
}

impl RefreshScheduler {
    pub fn new(window: Duration, action: RefreshAction) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            window,
            action,
            buckets: Mutex::new(HashMap::new()),
            this: this.clone(),
        })
    }

    /// Queue `request`. Returns true when it opened a new window.
    pub fn schedule(&self, request: RefreshRequest) -> bool {
        let mut buckets = self.buckets.lock();
        let bucket = buckets.entry(request.bucket.clone()).or_default();
        let name = request.bucket.clone();
        bucket.queue.push(request);
        if bucket.timer.is_some() {
            return false;
        }

        let this = self.this.clone();
        let window = self.window;
        let timer_bucket = name.clone();
        bucket.timer = Some(tokio::spawn(async move {
            tokio::time::sleep(window).await;
            if let Some(scheduler) = this.upgrade() {
                scheduler.fire(&timer_bucket);
            }
        }));
        debug!(bucket = %name, window_ms = window.as_millis() as u64, "refresh window opened");
        true
    }

    fn fire(&self, bucket: &str) {
        let queue = {
            let mut buckets = self.buckets.lock();
            match buckets.remove(bucket) {
                Some(expired) => expired.queue,
                None => return,
            }
        };
        if queue.is_empty() {
            return;
        }
        debug!(bucket, requests = queue.len(), "refresh window expired");
        (self.action)(bucket, queue);
    }

    /// Buckets with an open window.
    pub fn pending_buckets(&self) -> Vec<String> {
        let mut names: Vec<String> = self.buckets.lock().keys().cloned().collect();
        names.sort();
        names
    }

    /// Cancel every open window without running its action.
    pub fn clear(&self) {
        let drained: Vec<Bucket> = self.buckets.lock().drain().map(|(_, b)| b).collect();
        for bucket in drained {
            if let Some(timer) = bucket.timer {
                timer.abort();
            }
        }
    }
}
