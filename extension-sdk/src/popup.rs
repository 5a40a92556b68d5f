//! The review popup's side of the protocol.
//!
//! The background navigates the popup to the review page with the request in the query
//! string. The popup shows it, sends exactly one decision back and closes its window.

use std::sync::Arc;

use common::{CheckTransaction, ExtensionMessage, FixDecision, ReviewRef, TabId};
use log::{debug, warn};
use url::Url;

use crate::transport::{ChannelError, RuntimeChannel, WindowError, WindowId, WindowManager};

#[derive(Debug, thiserror::Error)]
pub enum PopupError {
    #[error("review url is missing the {0} parameter")]
    MissingParameter(&'static str),
    #[error("review url has an invalid {name} parameter: {value}")]
    InvalidParameter { name: &'static str, value: String },
    #[error("transaction is not valid JSON: {0}")]
    InvalidTransaction(#[from] serde_json::Error),
    #[error(transparent)]
    Channel(#[from] ChannelError),
    #[error(transparent)]
    Window(#[from] WindowError),
}

/// What the review page receives: the request, and the tab it came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReviewRequest {
    pub id: u64,
    /// Serialized transaction.
    pub transaction: String,
    /// Address of the signing account.
    pub account: String,
    pub chain: String,
    pub origin: TabId,
}

impl ReviewRequest {
    pub fn new(check: &CheckTransaction, origin: TabId) -> Self {
        Self {
            id: check.id,
            transaction: check.transaction.clone(),
            account: check.account.address.clone(),
            chain: check.chain.clone(),
            origin,
        }
    }

    pub fn review_ref(&self) -> ReviewRef {
        ReviewRef {
            id: self.id,
            origin: self.origin,
        }
    }

    /// The review page url for this request.
    pub fn to_url(&self, review_page: &Url) -> Url {
        let mut url = review_page.clone();
        url.query_pairs_mut()
            .clear()
            .append_pair("id", &self.id.to_string())
            .append_pair("transaction", &self.transaction)
            .append_pair("account", &self.account)
            .append_pair("chain", &self.chain)
            .append_pair("origin", &self.origin.to_string());
        url
    }

    pub fn from_url(url: &Url) -> Result<Self, PopupError> {
        let param = |name: &'static str| -> Result<String, PopupError> {
            url.query_pairs()
                .find(|(key, _)| key == name)
                .map(|(_, value)| value.into_owned())
                .ok_or(PopupError::MissingParameter(name))
        };
        let id = param("id")?;
        let origin = param("origin")?;
        Ok(Self {
            id: id
                .parse()
                .map_err(|_| PopupError::InvalidParameter { name: "id", value: id })?,
            transaction: param("transaction")?,
            account: param("account")?,
            chain: param("chain")?,
            origin: origin.parse().map_err(|_| PopupError::InvalidParameter {
                name: "origin",
                value: origin,
            })?,
        })
    }
}

/// The three ways a review can end.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReviewDecision {
    /// Sign `transaction` instead of the reviewed one.
    Fix { transaction: String },
    Cancel,
    Proceed,
}

impl ReviewDecision {
    pub fn to_message(&self, review: ReviewRef) -> ExtensionMessage {
        match self {
            ReviewDecision::Fix { transaction } => ExtensionMessage::Fix(FixDecision {
                id: review.id,
                origin: review.origin,
                transaction: transaction.clone(),
            }),
            ReviewDecision::Cancel => ExtensionMessage::Cancel(review),
            ReviewDecision::Proceed => ExtensionMessage::Proceed(review),
        }
    }
}

/// An open review popup.
pub struct ReviewPopup {
    request: ReviewRequest,
    window: WindowId,
    runtime: Arc<dyn RuntimeChannel>,
    windows: Arc<dyn WindowManager>,
}

impl ReviewPopup {
    /// Loads the review page at `url`, shown in `window`.
    pub fn open(
        url: &Url,
        window: WindowId,
        runtime: Arc<dyn RuntimeChannel>,
        windows: Arc<dyn WindowManager>,
    ) -> Result<Self, PopupError> {
        Ok(Self {
            request: ReviewRequest::from_url(url)?,
            window,
            runtime,
            windows,
        })
    }

    pub fn request(&self) -> &ReviewRequest {
        &self.request
    }

    pub fn window(&self) -> WindowId {
        self.window
    }

    /// The reviewed transaction, parsed for display.
    pub fn transaction_json(&self) -> Result<serde_json::Value, PopupError> {
        Ok(serde_json::from_str(&self.request.transaction)?)
    }

    /// Sends `decision` to the background, then closes the popup.
    pub async fn decide(self, decision: ReviewDecision) -> Result<(), PopupError> {
        debug!(
            "review {} of tab {}: {:?}",
            self.request.id, self.request.origin, decision
        );
        self.runtime
            .send_message(decision.to_message(self.request.review_ref()))
            .await?;
        self.close().await
    }

    /// Closes the popup without deciding.
    pub async fn close(self) -> Result<(), PopupError> {
        if let Err(e) = self.windows.remove(self.window).await {
            warn!("review popup {} could not be closed: {e}", self.window);
            return Err(e.into());
        }
        Ok(())
    }
}
