//! The background: owns every review in flight.
//!
//! A `checkTransaction` message opens a review popup and keeps the content script's
//! answer pending until the popup decides, its window is closed, its tab goes away or
//! the review times out. Reviews are keyed by the page's correlation id and the tab the
//! request came from; each review is settled exactly once.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use common::{ExtensionMessage, ReviewOutcome, ReviewRef, TabId, WalletRef, WalletSummary};
use log::{debug, error, info, warn};
use tokio::sync::mpsc;

use crate::config::ProtectorConfig;
use crate::popup::ReviewRequest;
use crate::transport::{BrowserEvent, IncomingMessage, Responder, WindowError, WindowId, WindowManager};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BackgroundError {
    #[error("review popup could not be opened: {0}")]
    Popup(#[from] WindowError),
    #[error("no pending review {} for tab {}", .0.id, .0.origin)]
    UnknownReview(ReviewRef),
    #[error("{0} messages must come from a tab")]
    MissingTab(&'static str),
}

struct PendingReview {
    responder: Responder,
    window: WindowId,
}

#[derive(Default)]
struct BackgroundState {
    pending: HashMap<ReviewRef, PendingReview>,
    by_window: HashMap<WindowId, ReviewRef>,
    tab_wallets: HashMap<TabId, Vec<WalletSummary>>,
}

impl BackgroundState {
    fn take(&mut self, review: &ReviewRef) -> Option<PendingReview> {
        let pending = self.pending.remove(review)?;
        self.by_window.remove(&pending.window);
        Some(pending)
    }
}

pub struct BackgroundCoordinator {
    config: ProtectorConfig,
    windows: Arc<dyn WindowManager>,
    state: Mutex<BackgroundState>,
}

impl BackgroundCoordinator {
    pub fn new(config: ProtectorConfig, windows: Arc<dyn WindowManager>) -> Arc<Self> {
        Arc::new(Self {
            config,
            windows,
            state: Mutex::new(BackgroundState::default()),
        })
    }

    /// Handles the runtime messages and browser events until the runtime goes away.
    pub async fn run(
        self: Arc<Self>,
        mut incoming: mpsc::Receiver<IncomingMessage>,
        mut events: mpsc::Receiver<BrowserEvent>,
    ) {
        let mut events_open = true;
        loop {
            tokio::select! {
                message = incoming.recv() => {
                    let Some(message) = message else {
                        break;
                    };
                    if let Err(e) = self.handle_message(message).await {
                        warn!("{e}");
                    }
                }
                event = events.recv(), if events_open => match event {
                    Some(BrowserEvent::WindowRemoved(window)) => self.handle_window_removed(window),
                    Some(BrowserEvent::TabRemoved(tab)) => self.handle_tab_removed(tab).await,
                    None => events_open = false,
                },
            }
        }
        debug!("extension runtime closed, background stopped");
    }

    pub async fn handle_message(self: &Arc<Self>, incoming: IncomingMessage) -> Result<(), BackgroundError> {
        let IncomingMessage {
            message,
            sender,
            responder,
        } = incoming;

        match message {
            ExtensionMessage::CheckTransaction(check) => {
                let origin = sender.tab.ok_or(BackgroundError::MissingTab("checkTransaction"))?;
                self.open_review(ReviewRequest::new(&check, origin), responder)
                    .await
            }
            ExtensionMessage::RegisteredWallets(wallets) => {
                let tab = sender.tab.ok_or(BackgroundError::MissingTab("registeredWallets"))?;
                self.record_wallets(tab, wallets);
                Ok(())
            }
            ExtensionMessage::UnregisteredWallets(wallets) => {
                let tab = sender
                    .tab
                    .ok_or(BackgroundError::MissingTab("unregisteredWallets"))?;
                self.forget_wallets(tab, &wallets);
                Ok(())
            }
            ExtensionMessage::Fix(decision) => {
                let review = ReviewRef {
                    id: decision.id,
                    origin: decision.origin,
                };
                self.settle(review, ReviewOutcome::fix(decision.transaction))
            }
            ExtensionMessage::Cancel(review) => self.settle(review, ReviewOutcome::cancel()),
            ExtensionMessage::Proceed(review) => self.settle(review, ReviewOutcome::proceed()),
        }
    }

    async fn open_review(
        self: &Arc<Self>,
        request: ReviewRequest,
        responder: Responder,
    ) -> Result<(), BackgroundError> {
        let review = request.review_ref();
        let url = request.to_url(&self.config.review_url);
        let window = match self
            .windows
            .create_popup(&url, self.config.popup_width, self.config.popup_height)
            .await
        {
            Ok(window) => window,
            Err(e) => {
                error!("review {} of tab {}: {e}", review.id, review.origin);
                responder.respond(ReviewOutcome::default());
                return Err(e.into());
            }
        };
        info!("review {} of tab {} opened in window {window}", review.id, review.origin);

        let replaced = {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            let replaced = state.take(&review);
            state.pending.insert(review, PendingReview { responder, window });
            state.by_window.insert(window, review);
            replaced
        };
        // The page reloaded and reused an id: its previous request has no caller left.
        if let Some(replaced) = replaced {
            warn!("review {} of tab {} superseded", review.id, review.origin);
            replaced.responder.respond(ReviewOutcome::cancel());
            self.close_window(replaced.window).await;
        }

        if let Some(timeout) = self.config.review_timeout() {
            let coordinator = Arc::downgrade(self);
            tokio::spawn(async move {
                tokio::time::sleep(timeout).await;
                if let Some(coordinator) = coordinator.upgrade() {
                    coordinator.expire(review, window).await;
                }
            });
        }
        Ok(())
    }

    fn settle(&self, review: ReviewRef, outcome: ReviewOutcome) -> Result<(), BackgroundError> {
        let pending = self
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take(&review)
            .ok_or(BackgroundError::UnknownReview(review))?;
        debug!(
            "review {} of tab {} settled: {:?}",
            review.id, review.origin, outcome.action
        );
        pending.responder.respond(outcome);
        Ok(())
    }

    /// Cancels the review shown in `window`, if it is still undecided.
    pub fn handle_window_removed(&self, window: WindowId) {
        let pending = {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            match state.by_window.get(&window).copied() {
                Some(review) => state.take(&review),
                None => None,
            }
        };
        if let Some(pending) = pending {
            info!("review window {window} closed without a decision");
            pending.responder.respond(ReviewOutcome::cancel());
        }
    }

    /// Cancels the reviews requested by `tab` and closes their windows.
    pub async fn handle_tab_removed(&self, tab: TabId) {
        let abandoned: Vec<PendingReview> = {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            state.tab_wallets.remove(&tab);
            let reviews: Vec<ReviewRef> = state
                .pending
                .keys()
                .filter(|review| review.origin == tab)
                .copied()
                .collect();
            reviews
                .iter()
                .filter_map(|review| state.take(review))
                .collect()
        };
        for pending in abandoned {
            pending.responder.respond(ReviewOutcome::cancel());
            self.close_window(pending.window).await;
        }
    }

    async fn expire(&self, review: ReviewRef, window: WindowId) {
        let pending = {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            // A newer review may have taken the same key.
            let current = state.pending.get(&review).map(|pending| pending.window);
            if current == Some(window) {
                state.take(&review)
            } else {
                None
            }
        };
        if let Some(pending) = pending {
            info!("review {} of tab {} timed out", review.id, review.origin);
            pending.responder.respond(ReviewOutcome::cancel());
            self.close_window(window).await;
        }
    }

    async fn close_window(&self, window: WindowId) {
        if let Err(e) = self.windows.remove(window).await {
            debug!("review window {window} not closed: {e}");
        }
    }

    fn record_wallets(&self, tab: TabId, wallets: Vec<WalletSummary>) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let known = state.tab_wallets.entry(tab).or_default();
        for wallet in wallets {
            known.retain(|w| !(w.id == wallet.id && w.name == wallet.name));
            known.push(wallet);
        }
        debug!("tab {tab} reports {} wallet(s)", known.len());
    }

    fn forget_wallets(&self, tab: TabId, wallets: &[WalletRef]) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(known) = state.tab_wallets.get_mut(&tab) {
            known.retain(|w| !wallets.iter().any(|r| r.id == w.id && r.name == w.name));
        }
    }

    /// Wallets last reported by the page of `tab`.
    pub fn tab_wallets(&self, tab: TabId) -> Vec<WalletSummary> {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .tab_wallets
            .get(&tab)
            .cloned()
            .unwrap_or_default()
    }

    pub fn pending_reviews(&self) -> usize {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pending
            .len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use common::{CheckTransaction, FixDecision, ReviewAction, WalletAccount};
    use tokio::sync::oneshot;

    use crate::sandbox::MemoryWindowManager;
    use crate::transport::MessageSender;

    fn check(id: u64) -> ExtensionMessage {
        ExtensionMessage::CheckTransaction(CheckTransaction {
            id,
            transaction: "TX_A".into(),
            account: WalletAccount {
                address: "0xa11ce".into(),
                public_key: vec![1],
                chains: vec!["sui:devnet".into()],
                features: Vec::new(),
                label: None,
            },
            chain: "sui:devnet".into(),
        })
    }

    fn incoming(
        message: ExtensionMessage,
        tab: Option<TabId>,
    ) -> (IncomingMessage, oneshot::Receiver<ReviewOutcome>) {
        let (sender, answer) = oneshot::channel();
        (
            IncomingMessage {
                message,
                sender: MessageSender { tab },
                responder: Responder(sender),
            },
            answer,
        )
    }

    fn coordinator(config: ProtectorConfig) -> (Arc<BackgroundCoordinator>, Arc<MemoryWindowManager>) {
        let (windows, _events) = MemoryWindowManager::new();
        let coordinator = BackgroundCoordinator::new(config, windows.clone());
        (coordinator, windows)
    }

    #[tokio::test]
    async fn test_review_settles_once() {
        let (coordinator, windows) = coordinator(ProtectorConfig::default());
        let (message, answer) = incoming(check(4), Some(2));
        coordinator.handle_message(message).await.unwrap();

        let popups = windows.popups();
        assert_eq!(popups.len(), 1);
        let request = ReviewRequest::from_url(&popups[0].url).unwrap();
        assert_eq!((request.id, request.origin), (4, 2));
        assert_eq!((popups[0].width, popups[0].height), (360, 600));

        let decision = ExtensionMessage::Fix(FixDecision {
            id: 4,
            origin: 2,
            transaction: "TX_B".into(),
        });
        let (message, _) = incoming(decision.clone(), None);
        coordinator.handle_message(message).await.unwrap();
        assert_eq!(answer.await.unwrap(), ReviewOutcome::fix("TX_B".into()));

        let (message, _) = incoming(decision, None);
        assert_eq!(
            coordinator.handle_message(message).await,
            Err(BackgroundError::UnknownReview(ReviewRef { id: 4, origin: 2 }))
        );
    }

    #[tokio::test]
    async fn test_same_id_from_two_tabs() {
        let (coordinator, _windows) = coordinator(ProtectorConfig::default());
        let (first, first_answer) = incoming(check(0), Some(1));
        let (second, second_answer) = incoming(check(0), Some(2));
        coordinator.handle_message(first).await.unwrap();
        coordinator.handle_message(second).await.unwrap();
        assert_eq!(coordinator.pending_reviews(), 2);

        let (message, _) = incoming(ExtensionMessage::Cancel(ReviewRef { id: 0, origin: 2 }), None);
        coordinator.handle_message(message).await.unwrap();
        let (message, _) = incoming(ExtensionMessage::Proceed(ReviewRef { id: 0, origin: 1 }), None);
        coordinator.handle_message(message).await.unwrap();

        assert_eq!(first_answer.await.unwrap().action, Some(ReviewAction::Proceed));
        assert_eq!(second_answer.await.unwrap().action, Some(ReviewAction::Cancel));
    }

    #[tokio::test]
    async fn test_closed_window_cancels() {
        let (coordinator, windows) = coordinator(ProtectorConfig::default());
        let (message, answer) = incoming(check(1), Some(1));
        coordinator.handle_message(message).await.unwrap();

        coordinator.handle_window_removed(windows.popups()[0].window);
        assert_eq!(answer.await.unwrap(), ReviewOutcome::cancel());
        assert_eq!(coordinator.pending_reviews(), 0);
    }

    #[tokio::test]
    async fn test_popup_failure_answers_without_action() {
        let (coordinator, windows) = coordinator(ProtectorConfig::default());
        windows.fail_next_popup();
        let (message, answer) = incoming(check(1), Some(1));

        assert!(matches!(
            coordinator.handle_message(message).await,
            Err(BackgroundError::Popup(_))
        ));
        assert_eq!(answer.await.unwrap(), ReviewOutcome::default());
        assert_eq!(coordinator.pending_reviews(), 0);
    }

    #[tokio::test]
    async fn test_check_from_extension_page_is_refused() {
        let (coordinator, windows) = coordinator(ProtectorConfig::default());
        let (message, answer) = incoming(check(1), None);

        assert_eq!(
            coordinator.handle_message(message).await,
            Err(BackgroundError::MissingTab("checkTransaction"))
        );
        assert!(answer.await.is_err());
        assert!(windows.popups().is_empty());
    }

    #[tokio::test]
    async fn test_tab_removal_cancels_and_closes() {
        let (coordinator, windows) = coordinator(ProtectorConfig::default());
        let (message, answer) = incoming(check(1), Some(8));
        coordinator.handle_message(message).await.unwrap();
        let window = windows.popups()[0].window;

        coordinator.handle_tab_removed(8).await;
        assert_eq!(answer.await.unwrap(), ReviewOutcome::cancel());
        assert_eq!(windows.removed(), vec![window]);
    }

    #[tokio::test]
    async fn test_undecided_review_times_out() {
        let config = ProtectorConfig {
            review_timeout_secs: Some(1),
            ..ProtectorConfig::default()
        };
        let (coordinator, windows) = coordinator(config);
        let (message, answer) = incoming(check(1), Some(1));
        coordinator.handle_message(message).await.unwrap();

        let outcome = tokio::time::timeout(Duration::from_secs(3), answer)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(outcome, ReviewOutcome::cancel());
        assert_eq!(windows.removed().len(), 1);
    }

    #[tokio::test]
    async fn test_wallet_bookkeeping() {
        let (coordinator, _windows) = coordinator(ProtectorConfig::default());
        let summary = WalletSummary {
            id: Some("com.suiet".into()),
            name: "Suiet".into(),
            icon: String::new(),
            chains: vec!["sui:devnet".into()],
            features: vec!["standard:connect".into()],
            accounts: Vec::new(),
        };

        let (message, _) = incoming(
            ExtensionMessage::RegisteredWallets(vec![summary.clone()]),
            Some(3),
        );
        coordinator.handle_message(message).await.unwrap();
        let (message, _) = incoming(
            ExtensionMessage::RegisteredWallets(vec![summary.clone()]),
            Some(3),
        );
        coordinator.handle_message(message).await.unwrap();
        assert_eq!(coordinator.tab_wallets(3), vec![summary]);
        assert!(coordinator.tab_wallets(4).is_empty());

        let (message, _) = incoming(
            ExtensionMessage::UnregisteredWallets(vec![WalletRef {
                id: Some("com.suiet".into()),
                name: "Suiet".into(),
            }]),
            Some(3),
        );
        coordinator.handle_message(message).await.unwrap();
        assert!(coordinator.tab_wallets(3).is_empty());
    }
}
