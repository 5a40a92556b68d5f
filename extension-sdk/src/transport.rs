//! The extension runtime: the channel the content scripts and the popup use to reach
//! the background, and the window management the background relies on.

use std::fmt::Debug;

use async_trait::async_trait;
use common::{ExtensionMessage, ReviewOutcome, TabId};
use log::trace;
use tokio::sync::{mpsc, oneshot};
use url::Url;

/// Identifier of a browser window.
pub type WindowId = u32;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ChannelError {
    #[error("the background is not running")]
    Disconnected,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WindowError {
    #[error("window could not be created: {0}")]
    CreateFailed(String),
    #[error("no window with id {0}")]
    NotFound(WindowId),
}

/// Who sent a message to the background.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageSender {
    /// The tab of the content script, `None` for extension pages such as the popup.
    pub tab: Option<TabId>,
}

/// The pending answer to a message. Dropping it answers nothing.
#[derive(Debug)]
pub struct Responder(pub(crate) oneshot::Sender<ReviewOutcome>);

impl Responder {
    pub fn respond(self, outcome: ReviewOutcome) {
        if self.0.send(outcome).is_err() {
            trace!("answer dropped: the sender stopped waiting");
        }
    }
}

/// A message as received by the background.
#[derive(Debug)]
pub struct IncomingMessage {
    pub message: ExtensionMessage,
    pub sender: MessageSender,
    pub responder: Responder,
}

/// Sending side of the extension runtime, as seen by one script.
#[async_trait]
pub trait RuntimeChannel: Send + Sync + Debug {
    /// Sends `message` to the background and waits for its answer. Messages the
    /// background does not answer resolve with `None`.
    async fn send_message(
        &self,
        message: ExtensionMessage,
    ) -> Result<Option<ReviewOutcome>, ChannelError>;
}

/// In-process extension runtime.
#[derive(Debug, Clone)]
pub struct ExtensionRuntime {
    incoming: mpsc::Sender<IncomingMessage>,
}

impl ExtensionRuntime {
    /// Creates the runtime, and the receiving end the background reads from.
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<IncomingMessage>) {
        let (incoming, receiver) = mpsc::channel(capacity);
        (Self { incoming }, receiver)
    }

    /// The channel of the content script running in `tab`.
    pub fn connect_tab(&self, tab: TabId) -> RuntimeEndpoint {
        RuntimeEndpoint {
            incoming: self.incoming.clone(),
            sender: MessageSender { tab: Some(tab) },
        }
    }

    /// The channel of an extension page.
    pub fn connect_extension_page(&self) -> RuntimeEndpoint {
        RuntimeEndpoint {
            incoming: self.incoming.clone(),
            sender: MessageSender { tab: None },
        }
    }
}

#[derive(Debug, Clone)]
pub struct RuntimeEndpoint {
    incoming: mpsc::Sender<IncomingMessage>,
    sender: MessageSender,
}

#[async_trait]
impl RuntimeChannel for RuntimeEndpoint {
    async fn send_message(
        &self,
        message: ExtensionMessage,
    ) -> Result<Option<ReviewOutcome>, ChannelError> {
        let (responder, answer) = oneshot::channel();
        self.incoming
            .send(IncomingMessage {
                message,
                sender: self.sender,
                responder: Responder(responder),
            })
            .await
            .map_err(|_| ChannelError::Disconnected)?;
        Ok(answer.await.ok())
    }
}

/// Browser events the background reacts to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BrowserEvent {
    WindowRemoved(WindowId),
    TabRemoved(TabId),
}

/// The browser's window management, as used by the background.
#[async_trait]
pub trait WindowManager: Send + Sync {
    /// Opens a popup window navigated to `url`.
    async fn create_popup(&self, url: &Url, width: u32, height: u32) -> Result<WindowId, WindowError>;

    async fn remove(&self, window: WindowId) -> Result<(), WindowError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::ReviewRef;

    #[tokio::test]
    async fn test_answered_and_unanswered_messages() {
        let (runtime, mut incoming) = ExtensionRuntime::new(4);
        let tab = runtime.connect_tab(7);
        let popup = runtime.connect_extension_page();

        let background = tokio::spawn(async move {
            let first = incoming.recv().await.unwrap();
            assert_eq!(first.sender.tab, Some(7));
            first.responder.respond(ReviewOutcome::proceed());

            let second = incoming.recv().await.unwrap();
            assert_eq!(second.sender.tab, None);
            drop(second.responder);
        });

        let cancel = ExtensionMessage::Cancel(ReviewRef { id: 0, origin: 7 });
        assert_eq!(
            tab.send_message(cancel.clone()).await,
            Ok(Some(ReviewOutcome::proceed()))
        );
        assert_eq!(popup.send_message(cancel).await, Ok(None));
        background.await.unwrap();
    }

    #[tokio::test]
    async fn test_stopped_background_disconnects() {
        let (runtime, incoming) = ExtensionRuntime::new(1);
        drop(incoming);
        let tab = runtime.connect_tab(1);
        assert_eq!(
            tab.send_message(ExtensionMessage::UnregisteredWallets(Vec::new()))
                .await,
            Err(ChannelError::Disconnected)
        );
    }
}
