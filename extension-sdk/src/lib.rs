//! Page, content script, background and review popup of the Dominion wallet protector.
//!
//! The page script protects the wallets announced on the page: their signing features
//! ask for a review ([`relay::TransactionChecker`]) before signing. The request travels
//! through the content script ([`bridge::ContentBridge`]) to the background
//! ([`background::BackgroundCoordinator`]), which opens a review popup
//! ([`popup::ReviewPopup`]) and relays its decision back.

pub mod abort;
pub mod background;
pub mod bridge;
pub mod bus;
pub mod config;
pub mod interceptor;
pub mod notification;
pub mod popup;
pub mod protector;
pub mod registry;
pub mod relay;
pub mod transport;
pub mod wallet;

#[cfg(any(test, feature = "sandbox"))]
pub mod sandbox;

pub use common;
