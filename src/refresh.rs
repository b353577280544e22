//! Refresh notifications fired after an output file changes.

use tokio::sync::broadcast;
use tracing::trace;

/// Receives the root-relative path of every regenerated file.
///
/// Hooks are fire-and-forget: they must not block and cannot fail the
/// generation that triggered them.
pub trait RefreshHook: Send + Sync {
    /// Called after `path` has been rewritten in the output directory.
    fn refresh(&self, path: &str);
}

impl<F> RefreshHook for F
where
    F: Fn(&str) + Send + Sync,
{
    fn refresh(&self, path: &str) {
        self(path);
    }
}

/// Fans refresh notifications out to any number of subscribers, e.g. a
/// live-reload transport.
#[derive(Debug, Clone)]
pub struct BroadcastRefresh {
    tx: broadcast::Sender<String>,
}

impl BroadcastRefresh {
    /// Creates a channel retaining at most `capacity` undelivered paths per
    /// subscriber.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Subscribes to future notifications.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<String> {
        self.tx.subscribe()
    }
}

impl RefreshHook for BroadcastRefresh {
    fn refresh(&self, path: &str) {
        // No subscribers is not an error.
        if self.tx.send(path.to_string()).is_err() {
            trace!("No refresh subscribers for {}", path);
        }
    }
}
