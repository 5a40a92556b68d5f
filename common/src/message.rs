//! Messages exchanged between the page, the content script, the background and the
//! review popup.
//!
//! Two channels exist:
//! - the page window (`window.postMessage`), shared by the page script and the content
//!   script. Every message carries a `source` discriminator that listeners check before
//!   acting, see [`WindowMessage`].
//! - the extension runtime, used by the content script and the popup to reach the
//!   background, see [`ExtensionMessage`].
//!
//! A single correlation id, allocated by the page script, is carried unchanged through
//! every hop. The background tells requests from different tabs apart by the origin tab.

use alloc::string::String;
use alloc::vec::Vec;

use serde::{Deserialize, Deserializer, Serialize};

use crate::constants::{CONTENT_SCRIPT_SOURCE, PAGE_SCRIPT_SOURCE};

/// Identifier of a browser tab, as reported by the extension runtime.
pub type TabId = u32;

/// An account exposed by a wallet.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct WalletAccount {
    pub address: String,
    #[serde(with = "hex::serde")]
    pub public_key: Vec<u8>,
    pub chains: Vec<String>,
    pub features: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
}

/// Decision taken by the user in the review popup.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ReviewAction {
    /// Sign the replacement transaction proposed by the review.
    Fix,
    /// Abandon the signing attempt.
    Cancel,
    /// Sign the original transaction unchanged.
    Proceed,
}

impl ReviewAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReviewAction::Fix => "fix",
            ReviewAction::Cancel => "cancel",
            ReviewAction::Proceed => "proceed",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "fix" => Some(ReviewAction::Fix),
            "cancel" => Some(ReviewAction::Cancel),
            "proceed" => Some(ReviewAction::Proceed),
            _ => None,
        }
    }
}

/// A request to review a transaction before it is handed to the wallet.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct CheckTransaction {
    /// Correlation id allocated by the page script.
    pub id: u64,
    /// Serialized transaction, as produced by the transaction's `toJSON`.
    pub transaction: String,
    pub account: WalletAccount,
    pub chain: String,
}

/// The outcome of a review, as answered by the background.
///
/// An outcome without an action (missing, garbled or unknown) is a failed review.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct ReviewOutcome {
    #[serde(
        default,
        deserialize_with = "deserialize_action",
        skip_serializing_if = "Option::is_none"
    )]
    pub action: Option<ReviewAction>,
    /// Replacement transaction, only meaningful when `action` is `fix`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transaction: Option<String>,
}

impl ReviewOutcome {
    pub fn fix(transaction: String) -> Self {
        Self {
            action: Some(ReviewAction::Fix),
            transaction: Some(transaction),
        }
    }

    pub fn cancel() -> Self {
        Self {
            action: Some(ReviewAction::Cancel),
            transaction: None,
        }
    }

    pub fn proceed() -> Self {
        Self {
            action: Some(ReviewAction::Proceed),
            transaction: None,
        }
    }
}

// Unknown or non-string actions must not make the whole message unreadable: they are
// reported as a missing action and handled as an internal error by the page.
fn deserialize_action<'de, D>(deserializer: D) -> Result<Option<ReviewAction>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum RawAction {
        Name(String),
        Other(serde::de::IgnoredAny),
    }

    Ok(match Option::<RawAction>::deserialize(deserializer)? {
        Some(RawAction::Name(name)) => ReviewAction::from_name(&name),
        Some(RawAction::Other(_)) | None => None,
    })
}

/// The answer relayed to the page script, tagged with the page's correlation id.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct CheckTransactionResponse {
    pub id: u64,
    #[serde(flatten)]
    pub outcome: ReviewOutcome,
}

/// Telemetry description of a wallet discovered in a page.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct WalletSummary {
    pub id: Option<String>,
    pub name: String,
    pub icon: String,
    pub chains: Vec<String>,
    /// Names of the features exposed by the wallet.
    pub features: Vec<String>,
    pub accounts: Vec<WalletAccount>,
}

/// Telemetry reference to a wallet that went away.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct WalletRef {
    pub id: Option<String>,
    pub name: String,
}

/// Payload of a message posted on the page window.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum WindowMessageBody {
    CheckTransaction(CheckTransaction),
    CheckTransactionResponse(CheckTransactionResponse),
    RegisteredWallets(Vec<WalletSummary>),
    UnregisteredWallets(Vec<WalletRef>),
}

/// A message posted on the page window.
///
/// Any script running in the page can post on the window, so `source` is kept as
/// free text and checked by every listener.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct WindowMessage {
    pub source: String,
    #[serde(flatten)]
    pub body: WindowMessageBody,
}

impl WindowMessage {
    pub fn from_page_script(body: WindowMessageBody) -> Self {
        Self {
            source: PAGE_SCRIPT_SOURCE.into(),
            body,
        }
    }

    pub fn from_content_script(body: WindowMessageBody) -> Self {
        Self {
            source: CONTENT_SCRIPT_SOURCE.into(),
            body,
        }
    }

    pub fn is_from_page_script(&self) -> bool {
        self.source == PAGE_SCRIPT_SOURCE
    }

    pub fn is_from_content_script(&self) -> bool {
        self.source == CONTENT_SCRIPT_SOURCE
    }
}

/// A user decision sent by the popup, carrying the replacement transaction.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct FixDecision {
    pub id: u64,
    pub origin: TabId,
    pub transaction: String,
}

/// Identifies a review in the background: the page's correlation id and the tab
/// that requested it.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ReviewRef {
    pub id: u64,
    pub origin: TabId,
}

/// Messages sent over the extension runtime to the background.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum ExtensionMessage {
    /// Content script: a page asks for a review. Answered with a [`ReviewOutcome`].
    CheckTransaction(CheckTransaction),
    /// Content script: wallets discovered in the page. Never answered.
    RegisteredWallets(Vec<WalletSummary>),
    /// Content script: wallets that went away. Never answered.
    UnregisteredWallets(Vec<WalletRef>),
    /// Popup decisions. Never answered.
    Fix(FixDecision),
    Cancel(ReviewRef),
    Proceed(ReviewRef),
}
