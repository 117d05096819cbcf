//! Periodic poll-and-broadcast task.
//!
//! Used for pulling state from an external request/response service (e.g.
//! mission or obstacle data from an interoperability server) and pushing
//! each result to every live connection.
//!
//! Cancellation is cooperative: the running flag is checked before each
//! poll and again before sleeping, so `stop()` takes effect within one
//! interval rather than interrupting a poll in flight.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::handler::BoxFuture;
use crate::server::ConnectionSet;

/// Something that can be asked for its latest state.
pub trait PollSource: Send + Sync + 'static {
    fn poll(&self) -> BoxFuture<'static, Result<Value>>;
}

impl<F, Fut> PollSource for F
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value>> + Send + 'static,
{
    fn poll(&self) -> BoxFuture<'static, Result<Value>> {
        Box::pin(self())
    }
}

/// Handle to a running poll loop.
pub struct Poller {
    name: String,
    running: Arc<AtomicBool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Poller {
    /// Start polling `source` every `interval` and broadcasting each
    /// result as `type_path` to `sink`.
    pub fn spawn<S>(
        name: impl Into<String>,
        type_path: impl Into<String>,
        interval: Duration,
        source: S,
        sink: Arc<ConnectionSet>,
    ) -> Self
    where
        S: PollSource,
    {
        let name = name.into();
        let type_path = type_path.into();
        let running = Arc::new(AtomicBool::new(true));

        let task = tokio::spawn(poll_loop(
            name.clone(),
            type_path,
            interval,
            source,
            sink,
            running.clone(),
        ));

        info!(poller = %name, ?interval, "Poller started");

        Self {
            name,
            running,
            task: Mutex::new(Some(task)),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// True until `stop` is called.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Ask the loop to stop. Idempotent.
    pub fn stop(&self) {
        if self.running.swap(false, Ordering::SeqCst) {
            info!(poller = %self.name, "Poller stopping");
        }
    }

    /// Stop and wait for the loop to exit.
    pub async fn join(&self) {
        self.stop();
        let task = self.task.lock().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                warn!(poller = %self.name, "Poller task failed: {}", e);
            }
        }
    }
}

impl Drop for Poller {
    fn drop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
    }
}

async fn poll_loop<S: PollSource>(
    name: String,
    type_path: String,
    interval: Duration,
    source: S,
    sink: Arc<ConnectionSet>,
    running: Arc<AtomicBool>,
) {
    loop {
        if !running.load(Ordering::SeqCst) {
            break;
        }

        match source.poll().await {
            Ok(value) => match sink.broadcast(&type_path, &value).await {
                Ok(report) => {
                    debug!(poller = %name, delivered = report.delivered.len(), "Poll broadcast")
                }
                Err(e) => warn!(poller = %name, "Poll result not sent: {}", e),
            },
            Err(e) => warn!(poller = %name, "Poll failed: {}", e),
        }

        if !running.load(Ordering::SeqCst) {
            break;
        }
        tokio::time::sleep(interval).await;
    }

    debug!(poller = %name, "Poller exited");
}
