//! Page side of the `checkTransaction` relay.
//!
//! Each check gets a correlation id from a per-page counter, is stored in the pending map
//! and posted on the window for the content script. The answer comes back on the window,
//! tagged with the same id. Responses are matched by id only, so concurrent checks settle
//! in whatever order their answers arrive.
//!
//! A pending check leaves the map exactly once: when its response is handled, when its
//! abort signal fires, or when its caller stops waiting. Anything arriving for an id that
//! is no longer pending is rejected.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use common::constants::CANCELED_MESSAGE;
use common::{
    CheckTransaction, CheckTransactionResponse, ReviewAction, WalletAccount, WindowMessage,
    WindowMessageBody,
};
use log::{debug, error, warn};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::abort::AbortSignal;
use crate::bus::{BusError, PageWindow};

/// Why a transaction check did not allow signing.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CheckError {
    /// The user canceled the transaction in the review popup.
    #[error("{}", CANCELED_MESSAGE)]
    Canceled,
    /// The signing call was aborted; carries the abort reason.
    #[error("{0}")]
    Aborted(String),
    /// The review answered without a usable decision.
    #[error("Internal error")]
    Internal,
    /// The page relay stopped before an answer arrived.
    #[error("the transaction check relay is not running")]
    Disconnected,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RelayError {
    #[error("no pending transaction check with id {0}")]
    UnknownRequest(u64),
    #[error(transparent)]
    Bus(#[from] BusError),
}

/// A transaction to check, with the rest of the signing call it belongs to.
#[derive(Debug, Clone)]
pub struct CheckInput {
    pub transaction: String,
    pub account: WalletAccount,
    pub chain: String,
    pub signal: Option<AbortSignal>,
}

struct PendingCheck {
    transaction: String,
    signal: Option<AbortSignal>,
    responder: oneshot::Sender<Result<String, CheckError>>,
}

/// Removes a check from the pending map when its caller stops waiting for it.
struct PendingGuard<'a> {
    checker: &'a TransactionChecker,
    id: u64,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        if self.checker.forget(self.id) {
            debug!("transaction check {} abandoned", self.id);
        }
    }
}

/// The `checkTransaction` client of one page.
pub struct TransactionChecker {
    window: Arc<PageWindow>,
    next_id: AtomicU64,
    pending: Mutex<HashMap<u64, PendingCheck>>,
}

impl TransactionChecker {
    /// Creates a checker that does not listen to the window; responses must be fed to
    /// [`TransactionChecker::handle_message`].
    pub fn new(window: Arc<PageWindow>) -> Arc<Self> {
        Arc::new(Self {
            window,
            next_id: AtomicU64::new(0),
            pending: Mutex::new(HashMap::new()),
        })
    }

    /// Creates a checker listening to the content script's answers on `window`.
    pub fn spawn(window: Arc<PageWindow>) -> (Arc<Self>, JoinHandle<()>) {
        let checker = Self::new(window);
        let listener = checker.listen();
        (checker, listener)
    }

    /// Starts handling the window's messages. The subscription is taken before this
    /// returns, so no answer to a later check can be missed.
    pub fn listen(self: &Arc<Self>) -> JoinHandle<()> {
        let mut messages = self.window.subscribe();
        let checker = Arc::downgrade(self);
        tokio::spawn(async move {
            loop {
                let Some(message) = messages.recv().await else {
                    break;
                };
                let Some(checker) = checker.upgrade() else {
                    break;
                };
                if let Err(e) = checker.handle_message(&message) {
                    warn!("dropping window message: {e}");
                }
            }
        })
    }

    pub fn pending_count(&self) -> usize {
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Asks for a review of `input.transaction` and waits for the decision.
    ///
    /// Resolves with the transaction to sign: the replacement on `fix`, the original on
    /// `proceed`.
    pub async fn check_transaction(&self, input: CheckInput) -> Result<String, CheckError> {
        let CheckInput {
            transaction,
            account,
            chain,
            signal,
        } = input;

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (responder, response) = oneshot::channel();
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(
                id,
                PendingCheck {
                    transaction: transaction.clone(),
                    signal: signal.clone(),
                    responder,
                },
            );
        let _guard = PendingGuard { checker: self, id };
        debug!("Request {id}");

        let request = WindowMessage::from_page_script(WindowMessageBody::CheckTransaction(
            CheckTransaction {
                id,
                transaction,
                account,
                chain,
            },
        ));
        if let Err(e) = self.window.post_message(request) {
            error!("transaction check {id} could not be posted: {e}");
            return Err(CheckError::Disconnected);
        }

        let settled = match signal {
            None => response.await,
            // An answer already handled wins over a signal that fires afterwards.
            Some(signal) => tokio::select! {
                biased;
                settled = response => settled,
                reason = signal.wait() => {
                    debug!("transaction check {id} aborted");
                    return Err(CheckError::Aborted(reason));
                }
            },
        };
        settled.unwrap_or(Err(CheckError::Disconnected))
    }

    /// Handles one message from the window. Messages not coming from the content script
    /// are ignored.
    pub fn handle_message(&self, message: &WindowMessage) -> Result<(), RelayError> {
        if !message.is_from_content_script() {
            return Ok(());
        }
        match &message.body {
            WindowMessageBody::CheckTransactionResponse(response) => self.settle(response),
            _ => Ok(()),
        }
    }

    fn settle(&self, response: &CheckTransactionResponse) -> Result<(), RelayError> {
        let id = response.id;
        // The entry leaves the map before settling, so a duplicate cannot settle twice.
        let pending = self
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id)
            .ok_or(RelayError::UnknownRequest(id))?;
        debug!("Response {id}: {:?}", response.outcome.action);

        let outcome = match pending.signal.as_ref().and_then(AbortSignal::reason) {
            Some(reason) => Err(CheckError::Aborted(reason)),
            None => match response.outcome.action {
                Some(ReviewAction::Fix) => response
                    .outcome
                    .transaction
                    .clone()
                    .ok_or(CheckError::Internal),
                Some(ReviewAction::Cancel) => Err(CheckError::Canceled),
                Some(ReviewAction::Proceed) => Ok(pending.transaction),
                None => Err(CheckError::Internal),
            },
        };

        if pending.responder.send(outcome).is_err() {
            debug!("transaction check {id} settled after its caller left");
        }
        Ok(())
    }

    fn forget(&self, id: u64) -> bool {
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id)
            .is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use common::ReviewOutcome;

    use crate::abort::AbortController;
    use crate::bus::WindowMessages;

    fn account() -> WalletAccount {
        WalletAccount {
            address: "0xa11ce".into(),
            public_key: vec![2; 32],
            chains: vec!["sui:devnet".into()],
            features: Vec::new(),
            label: None,
        }
    }

    fn input(tx: &str, signal: Option<AbortSignal>) -> CheckInput {
        CheckInput {
            transaction: tx.into(),
            account: account(),
            chain: "sui:devnet".into(),
            signal,
        }
    }

    fn response(id: u64, outcome: ReviewOutcome) -> WindowMessage {
        WindowMessage::from_content_script(WindowMessageBody::CheckTransactionResponse(
            CheckTransactionResponse { id, outcome },
        ))
    }

    async fn next_request(messages: &mut WindowMessages) -> CheckTransaction {
        loop {
            let message = tokio::time::timeout(Duration::from_secs(1), messages.recv())
                .await
                .unwrap()
                .unwrap();
            if let WindowMessageBody::CheckTransaction(request) = message.body {
                assert!(message.source == common::constants::PAGE_SCRIPT_SOURCE);
                return request;
            }
        }
    }

    #[tokio::test]
    async fn test_fix_returns_replacement_and_proceed_returns_original() {
        let window = PageWindow::new();
        let mut messages = window.subscribe();
        let checker = TransactionChecker::new(window.clone());

        let check = checker.check_transaction(input("TX_A", None));
        let answer = async {
            let request = next_request(&mut messages).await;
            assert_eq!(request.transaction, "TX_A");
            checker
                .handle_message(&response(request.id, ReviewOutcome::fix("TX_B".into())))
                .unwrap();
        };
        let (checked, ()) = tokio::join!(check, answer);
        assert_eq!(checked, Ok("TX_B".to_string()));

        let check = checker.check_transaction(input("TX_A", None));
        let answer = async {
            let request = next_request(&mut messages).await;
            checker
                .handle_message(&response(request.id, ReviewOutcome::proceed()))
                .unwrap();
        };
        let (checked, ()) = tokio::join!(check, answer);
        assert_eq!(checked, Ok("TX_A".to_string()));
        assert_eq!(checker.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_cancel_and_garbled_actions_reject() {
        let window = PageWindow::new();
        let mut messages = window.subscribe();
        let checker = TransactionChecker::new(window.clone());

        for (outcome, expected) in [
            (ReviewOutcome::cancel(), CheckError::Canceled),
            (ReviewOutcome::default(), CheckError::Internal),
            (
                ReviewOutcome {
                    action: Some(ReviewAction::Fix),
                    transaction: None,
                },
                CheckError::Internal,
            ),
        ] {
            let check = checker.check_transaction(input("TX_A", None));
            let answer = async {
                let request = next_request(&mut messages).await;
                checker
                    .handle_message(&response(request.id, outcome))
                    .unwrap();
            };
            let (checked, ()) = tokio::join!(check, answer);
            assert_eq!(checked, Err(expected));
        }
        assert_eq!(
            CheckError::Canceled.to_string(),
            "Dominion protection has canceled the transaction"
        );
    }

    #[tokio::test]
    async fn test_responses_are_matched_by_id() {
        let window = PageWindow::new();
        let mut messages = window.subscribe();
        let (checker, _listener) = TransactionChecker::spawn(window.clone());

        let first = tokio::spawn({
            let checker = checker.clone();
            async move { checker.check_transaction(input("TX_1", None)).await }
        });
        let r1 = next_request(&mut messages).await;
        let second = tokio::spawn({
            let checker = checker.clone();
            async move { checker.check_transaction(input("TX_2", None)).await }
        });
        let r2 = next_request(&mut messages).await;
        let third = tokio::spawn({
            let checker = checker.clone();
            async move { checker.check_transaction(input("TX_3", None)).await }
        });
        let r3 = next_request(&mut messages).await;
        assert!(r1.id < r2.id && r2.id < r3.id);

        for (id, tx) in [(r3.id, "FIX_3"), (r1.id, "FIX_1"), (r2.id, "FIX_2")] {
            window
                .post_message(response(id, ReviewOutcome::fix(tx.into())))
                .unwrap();
        }

        assert_eq!(first.await.unwrap(), Ok("FIX_1".to_string()));
        assert_eq!(second.await.unwrap(), Ok("FIX_2".to_string()));
        assert_eq!(third.await.unwrap(), Ok("FIX_3".to_string()));
    }

    #[tokio::test]
    async fn test_abort_takes_precedence_over_late_proceed() {
        let window = PageWindow::new();
        let mut messages = window.subscribe();
        let checker = TransactionChecker::new(window.clone());
        let controller = AbortController::new();

        let check = checker.check_transaction(input("TX_A", Some(controller.signal())));
        let answer = async {
            let request = next_request(&mut messages).await;
            controller.abort("dApp gave up");
            // The check may already have observed the abort and left the map.
            let _ = checker.handle_message(&response(request.id, ReviewOutcome::proceed()));
        };
        let (checked, ()) = tokio::join!(check, answer);
        assert_eq!(checked, Err(CheckError::Aborted("dApp gave up".into())));
        assert_eq!(checker.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_aborted_entry_is_removed_immediately() {
        let window = PageWindow::new();
        let mut messages = window.subscribe();
        let checker = TransactionChecker::new(window.clone());
        let controller = AbortController::new();

        let check = checker.check_transaction(input("TX_A", Some(controller.signal())));
        let abort = async {
            let request = next_request(&mut messages).await;
            assert_eq!(checker.pending_count(), 1);
            controller.abort("navigated away");
            request
        };
        let (checked, request) = tokio::join!(check, abort);
        assert_eq!(checked, Err(CheckError::Aborted("navigated away".into())));
        assert_eq!(checker.pending_count(), 0);

        assert_eq!(
            checker.handle_message(&response(request.id, ReviewOutcome::proceed())),
            Err(RelayError::UnknownRequest(request.id))
        );
    }

    #[tokio::test]
    async fn test_duplicate_response_is_rejected() {
        let window = PageWindow::new();
        let mut messages = window.subscribe();
        let checker = TransactionChecker::new(window.clone());

        let check = checker.check_transaction(input("TX_A", None));
        let answer = async {
            let request = next_request(&mut messages).await;
            checker
                .handle_message(&response(request.id, ReviewOutcome::proceed()))
                .unwrap();
            checker.handle_message(&response(request.id, ReviewOutcome::cancel()))
        };
        let (checked, duplicate) = tokio::join!(check, answer);
        assert_eq!(checked, Ok("TX_A".to_string()));
        assert!(matches!(duplicate, Err(RelayError::UnknownRequest(_))));
    }

    #[tokio::test]
    async fn test_foreign_sources_are_ignored() {
        let window = PageWindow::new();
        let checker = TransactionChecker::new(window);

        let mut spoofed = response(0, ReviewOutcome::proceed());
        spoofed.source = "some-other-extension".into();
        assert_eq!(checker.handle_message(&spoofed), Ok(()));
    }

    #[tokio::test]
    async fn test_dropped_check_leaves_no_pending_entry() {
        let window = PageWindow::new();
        let checker = TransactionChecker::new(window);

        let check = checker.check_transaction(input("TX_A", None));
        let timed_out = tokio::time::timeout(Duration::from_millis(20), check).await;
        assert!(timed_out.is_err());
        assert_eq!(checker.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_closed_window_disconnects() {
        let window = PageWindow::new();
        let checker = TransactionChecker::new(window.clone());
        window.close();

        assert_eq!(
            checker.check_transaction(input("TX_A", None)).await,
            Err(CheckError::Disconnected)
        );
        assert_eq!(checker.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_answer_survives_a_burst_of_messages() {
        let window = PageWindow::new();
        let mut messages = window.subscribe();
        let (checker, _listener) = TransactionChecker::spawn(window.clone());

        let check = checker.check_transaction(input("TX_A", None));
        let answer = async {
            let request = next_request(&mut messages).await;
            window
                .post_message(response(request.id, ReviewOutcome::proceed()))
                .unwrap();
            for _ in 0..300 {
                window
                    .post_message(WindowMessage::from_page_script(
                        WindowMessageBody::RegisteredWallets(Vec::new()),
                    ))
                    .unwrap();
            }
        };
        let (checked, ()) = tokio::time::timeout(Duration::from_secs(2), async {
            tokio::join!(check, answer)
        })
        .await
        .unwrap();
        assert_eq!(checked, Ok("TX_A".to_string()));
        assert_eq!(checker.pending_count(), 0);
    }
}
