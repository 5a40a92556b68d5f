//! Cancellation of in-flight signing attempts, in the spirit of the DOM `AbortController`.

use std::sync::Arc;

use tokio::sync::watch;

/// Reason reported when [`AbortController::abort`] is given no explicit reason.
pub const DEFAULT_ABORT_REASON: &str = "This operation was aborted";

/// Owner side of an abort signal. Aborting is sticky: the first reason wins.
#[derive(Debug, Clone)]
pub struct AbortController {
    sender: Arc<watch::Sender<Option<String>>>,
}

impl AbortController {
    pub fn new() -> Self {
        let (sender, _) = watch::channel(None);
        Self {
            sender: Arc::new(sender),
        }
    }

    pub fn signal(&self) -> AbortSignal {
        AbortSignal {
            receiver: self.sender.subscribe(),
        }
    }

    pub fn abort(&self, reason: impl Into<String>) {
        let reason = reason.into();
        self.sender.send_if_modified(|current| {
            if current.is_some() {
                return false;
            }
            *current = Some(reason);
            true
        });
    }

    pub fn abort_default(&self) {
        self.abort(DEFAULT_ABORT_REASON);
    }
}

impl Default for AbortController {
    fn default() -> Self {
        Self::new()
    }
}

/// Observer side of an abort signal, threaded through a signing call.
#[derive(Debug, Clone)]
pub struct AbortSignal {
    receiver: watch::Receiver<Option<String>>,
}

impl AbortSignal {
    pub fn aborted(&self) -> bool {
        self.receiver.borrow().is_some()
    }

    pub fn reason(&self) -> Option<String> {
        self.receiver.borrow().clone()
    }

    /// Resolves with the abort reason once the signal fires. Never resolves if the
    /// controller is dropped without aborting.
    pub async fn wait(&self) -> String {
        let mut receiver = self.receiver.clone();
        let reason = match receiver.wait_for(Option::is_some).await {
            Ok(reason) => Some((*reason).clone().unwrap_or_default()),
            Err(_) => None,
        };
        match reason {
            Some(reason) => reason,
            None => std::future::pending().await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_first_reason_wins() {
        let controller = AbortController::new();
        let signal = controller.signal();
        assert!(!signal.aborted());

        controller.abort("user navigated away");
        controller.abort("second reason");

        assert!(signal.aborted());
        assert_eq!(signal.reason().as_deref(), Some("user navigated away"));
    }

    #[tokio::test]
    async fn test_wait_resolves_on_abort() {
        let controller = AbortController::new();
        let signal = controller.signal();

        let waiter = tokio::spawn(async move { signal.wait().await });
        controller.abort_default();

        let reason = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reason, DEFAULT_ABORT_REASON);
    }

    #[tokio::test]
    async fn test_dropped_controller_never_aborts() {
        let signal = AbortController::new().signal();
        let waited = tokio::time::timeout(Duration::from_millis(20), signal.wait()).await;
        assert!(waited.is_err());
    }
}
