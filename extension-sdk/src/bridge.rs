//! The content script: relays the page script's requests to the background and the
//! background's answers back to the page.
//!
//! The bridge keeps no state of its own. A check is answered through the runtime
//! channel's own request/response pairing, and the answer is posted on the page tagged
//! with the page's correlation id.

use std::sync::{Arc, Weak};

use common::{
    CheckTransaction, CheckTransactionResponse, ExtensionMessage, ReviewOutcome, WindowMessage,
    WindowMessageBody,
};
use log::{debug, error, warn};
use tokio::task::JoinHandle;

use crate::bus::PageWindow;
use crate::transport::RuntimeChannel;

pub struct ContentBridge {
    window: Weak<PageWindow>,
    runtime: Arc<dyn RuntimeChannel>,
}

impl ContentBridge {
    /// Starts relaying the messages of `window`. The task ends when the page goes away.
    pub fn spawn(window: &Arc<PageWindow>, runtime: Arc<dyn RuntimeChannel>) -> JoinHandle<()> {
        let mut messages = window.subscribe();
        let bridge = Arc::new(Self {
            window: Arc::downgrade(window),
            runtime,
        });
        tokio::spawn(async move {
            loop {
                let Some(message) = messages.recv().await else {
                    break;
                };
                bridge.dispatch(message);
            }
            debug!("page gone, content script stopped");
        })
    }

    fn dispatch(self: &Arc<Self>, message: WindowMessage) {
        if !message.is_from_page_script() {
            return;
        }
        let bridge = self.clone();
        match message.body {
            WindowMessageBody::CheckTransaction(request) => {
                tokio::spawn(async move { bridge.relay_check(request).await });
            }
            WindowMessageBody::RegisteredWallets(wallets) => {
                tokio::spawn(async move {
                    bridge
                        .forward(ExtensionMessage::RegisteredWallets(wallets))
                        .await
                });
            }
            WindowMessageBody::UnregisteredWallets(wallets) => {
                tokio::spawn(async move {
                    bridge
                        .forward(ExtensionMessage::UnregisteredWallets(wallets))
                        .await
                });
            }
            WindowMessageBody::CheckTransactionResponse(_) => {}
        }
    }

    async fn relay_check(&self, request: CheckTransaction) {
        let id = request.id;
        let outcome = match self
            .runtime
            .send_message(ExtensionMessage::CheckTransaction(request))
            .await
        {
            Ok(Some(outcome)) => outcome,
            Ok(None) => {
                warn!("transaction check {id} was not answered");
                ReviewOutcome::default()
            }
            Err(e) => {
                error!("transaction check {id} could not be relayed: {e}");
                ReviewOutcome::default()
            }
        };

        let Some(window) = self.window.upgrade() else {
            debug!("page gone before transaction check {id} was answered");
            return;
        };
        let response = WindowMessage::from_content_script(
            WindowMessageBody::CheckTransactionResponse(CheckTransactionResponse { id, outcome }),
        );
        if let Err(e) = window.post_message(response) {
            warn!("answer to transaction check {id} could not be posted: {e}");
        }
    }

    async fn forward(&self, message: ExtensionMessage) {
        if let Err(e) = self.runtime.send_message(message).await {
            warn!("wallet telemetry could not be forwarded: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use common::{ReviewAction, WalletAccount};

    use crate::transport::{ExtensionRuntime, IncomingMessage};

    fn request(id: u64) -> WindowMessage {
        WindowMessage::from_page_script(WindowMessageBody::CheckTransaction(CheckTransaction {
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
        }))
    }

    async fn next_response(
        messages: &mut crate::bus::WindowMessages,
    ) -> CheckTransactionResponse {
        loop {
            let message = tokio::time::timeout(Duration::from_secs(1), messages.recv())
                .await
                .unwrap()
                .unwrap();
            if !message.is_from_content_script() {
                continue;
            }
            if let WindowMessageBody::CheckTransactionResponse(response) = message.body {
                return response;
            }
        }
    }

    async fn next_incoming(incoming: &mut tokio::sync::mpsc::Receiver<IncomingMessage>) -> IncomingMessage {
        tokio::time::timeout(Duration::from_secs(1), incoming.recv())
            .await
            .unwrap()
            .unwrap()
    }

    #[tokio::test]
    async fn test_answer_is_tagged_with_page_id() {
        let window = PageWindow::new();
        let (runtime, mut incoming) = ExtensionRuntime::new(4);
        let _bridge = ContentBridge::spawn(&window, Arc::new(runtime.connect_tab(3)));
        let mut messages = window.subscribe();

        window.post_message(request(41)).unwrap();
        let received = next_incoming(&mut incoming).await;
        assert_eq!(received.sender.tab, Some(3));
        assert!(matches!(
            &received.message,
            ExtensionMessage::CheckTransaction(check) if check.id == 41
        ));
        received.responder.respond(ReviewOutcome::fix("TX_B".into()));

        let response = next_response(&mut messages).await;
        assert_eq!(response.id, 41);
        assert_eq!(response.outcome, ReviewOutcome::fix("TX_B".into()));
    }

    #[tokio::test]
    async fn test_unanswered_check_is_answered_without_action() {
        let window = PageWindow::new();
        let (runtime, mut incoming) = ExtensionRuntime::new(4);
        let _bridge = ContentBridge::spawn(&window, Arc::new(runtime.connect_tab(3)));
        let mut messages = window.subscribe();

        window.post_message(request(2)).unwrap();
        drop(next_incoming(&mut incoming).await);

        let response = next_response(&mut messages).await;
        assert_eq!(response.id, 2);
        assert_eq!(response.outcome.action, None::<ReviewAction>);
    }

    #[tokio::test]
    async fn test_telemetry_is_forwarded_and_foreign_messages_ignored() {
        let window = PageWindow::new();
        let (runtime, mut incoming) = ExtensionRuntime::new(4);
        let _bridge = ContentBridge::spawn(&window, Arc::new(runtime.connect_tab(3)));

        let mut foreign = request(9);
        foreign.source = "evil-script".into();
        window.post_message(foreign).unwrap();
        window
            .post_message(WindowMessage::from_page_script(
                WindowMessageBody::UnregisteredWallets(Vec::new()),
            ))
            .unwrap();

        let received = next_incoming(&mut incoming).await;
        assert_eq!(
            received.message,
            ExtensionMessage::UnregisteredWallets(Vec::new())
        );
        assert!(incoming.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_bridge_stops_with_the_page() {
        let window = PageWindow::new();
        let (runtime, _incoming) = ExtensionRuntime::new(4);
        let bridge = ContentBridge::spawn(&window, Arc::new(runtime.connect_tab(3)));

        drop(window);
        tokio::time::timeout(Duration::from_secs(1), bridge)
            .await
            .unwrap()
            .unwrap();
    }
}
