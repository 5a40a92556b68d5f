/// Value of the `source` field of every message posted by the page script.
pub const PAGE_SCRIPT_SOURCE: &str = "dominion-page-script";

/// Value of the `source` field of every message posted by the content script.
pub const CONTENT_SCRIPT_SOURCE: &str = "content-script";

/// Prefix of the id of a protected wallet. Wallets carrying it are never wrapped again.
pub const PROTECTED_ID_PREFIX: &str = "DP:";

/// The only version of the sui signing features the protector knows how to wrap.
pub const SUPPORTED_FEATURE_VERSION: &str = "2.0.0";

/// Wallet-standard version announced by protected wallets.
pub const WALLET_STANDARD_VERSION: &str = "1.0.0";

pub const STANDARD_CONNECT: &str = "standard:connect";
pub const STANDARD_EVENTS: &str = "standard:events";
pub const SUI_SIGN_TRANSACTION: &str = "sui:signTransaction";
pub const SUI_SIGN_AND_EXECUTE_TRANSACTION: &str = "sui:signAndExecuteTransaction";

/// Capabilities every wallet must expose to be considered for protection.
pub const REQUIRED_FEATURES: [&str; 2] = [STANDARD_CONNECT, STANDARD_EVENTS];

/// Chain namespace handled by the protector.
pub const SUI_NAMESPACE: &str = "sui";

pub const APP_READY_EVENT: &str = "wallet-standard:app-ready";
pub const REGISTER_WALLET_EVENT: &str = "wallet-standard:register-wallet";

/// Error message surfaced to the dApp when the user cancels a transaction in the review popup.
pub const CANCELED_MESSAGE: &str = "Dominion protection has canceled the transaction";

/// Returns the namespace of a chain identifier, e.g. `sui` for `sui:devnet`.
pub fn chain_namespace(chain: &str) -> &str {
    chain.split(':').next().unwrap_or(chain)
}
