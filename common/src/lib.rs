//! Types shared by every execution context of the Wallet Protector extension.
//!
//! The page script, the content script, the background service worker and the
//! review popup only ever talk to each other through the messages defined here.
//! All of them are plain serde types whose JSON form matches what travels over
//! `window.postMessage` and the extension runtime.

#![no_std]

extern crate alloc;

pub mod constants;
pub mod message;

pub use message::{
    CheckTransaction, CheckTransactionResponse, ExtensionMessage, FixDecision, ReviewAction,
    ReviewOutcome, ReviewRef, TabId, WalletAccount, WalletRef, WalletSummary, WindowMessage,
    WindowMessageBody,
};
