//! User-facing notifications about signing attempts.

use std::fmt;

use crate::wallet::WalletError;

const DIGEST_PREVIEW: usize = 10;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notification {
    /// A signing attempt failed; `message` is shown as is.
    Error { message: String },
    /// A transaction was signed without being executed.
    TransactionSigned { signature: String },
    /// A transaction was executed on `network` for `user`.
    TransactionSuccess {
        digest: String,
        network: String,
        user: String,
    },
}

impl Notification {
    pub fn error(error: &WalletError) -> Self {
        Notification::Error {
            message: error.to_string(),
        }
    }

    /// Explorer page of an executed transaction.
    pub fn transaction_link(network: &str, digest: &str) -> String {
        let subdomain = match network {
            "mainnet" => String::new(),
            network => format!("{network}."),
        };
        format!("https://{subdomain}suivision.xyz/txblock/{digest}")
    }

    /// The status line shown for this notification.
    pub fn render(&self) -> String {
        match self {
            Notification::Error { message } => message.clone(),
            Notification::TransactionSigned { signature } => {
                format!("Tx signed ({})", format_digest(signature))
            }
            Notification::TransactionSuccess {
                digest,
                network,
                user,
            } => format!(
                "Tx {} success for {} <{}>",
                format_digest(digest),
                user,
                Self::transaction_link(network, digest)
            ),
        }
    }
}

impl fmt::Display for Notification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.render())
    }
}

fn format_digest(digest: &str) -> String {
    match digest.char_indices().nth(DIGEST_PREVIEW) {
        Some((end, _)) => format!("{}...", &digest[..end]),
        None => digest.to_string(),
    }
}
