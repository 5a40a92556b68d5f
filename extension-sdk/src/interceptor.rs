//! Wraps the signing features of a discovered wallet so that every transaction goes
//! through a review before reaching the wallet.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use common::constants::{
    PROTECTED_ID_PREFIX, REQUIRED_FEATURES, SUI_NAMESPACE, SUI_SIGN_AND_EXECUTE_TRANSACTION,
    SUI_SIGN_TRANSACTION, SUPPORTED_FEATURE_VERSION,
};
use log::{debug, info};

use crate::bus::{register_wallet, PageWindow};
use crate::config::ProtectorConfig;
use crate::relay::{CheckInput, TransactionChecker};
use crate::wallet::{
    ExecutedTransaction, Feature, FeatureMethod, SerializedTransaction, SignAndExecuteTransaction,
    SignTransaction, SignTransactionInput, SignedTransaction, Wallet, WalletError,
};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum InterceptError {
    #[error("Unsupported version of the {feature} feature: {version}. Expected version {expected}.")]
    UnsupportedFeatureVersion {
        feature: String,
        version: String,
        expected: String,
    },
    #[error("the {0} feature does not expose the matching signing method")]
    MismatchedFeature(String),
}

/// Whether a wallet may be protected: it exposes the standard connection features and
/// `required_features`, and supports at least one sui chain.
pub fn is_eligible(wallet: &Wallet, required_features: &[String]) -> bool {
    let has_features = REQUIRED_FEATURES
        .iter()
        .copied()
        .chain(required_features.iter().map(String::as_str))
        .all(|feature| wallet.has_feature(feature));
    has_features && wallet.supports_namespace(SUI_NAMESPACE)
}

/// Runs a signing input through the review and substitutes the reviewed transaction.
async fn review(
    checker: &TransactionChecker,
    input: SignTransactionInput,
) -> Result<SignTransactionInput, WalletError> {
    let transaction = input.transaction.to_json().await?;
    let reviewed = checker
        .check_transaction(CheckInput {
            transaction,
            account: input.account.clone(),
            chain: input.chain.clone(),
            signal: input.signal.clone(),
        })
        .await?;
    Ok(SignTransactionInput {
        transaction: Arc::new(SerializedTransaction::new(reviewed)),
        ..input
    })
}

struct ProtectedSigner {
    original: Arc<dyn SignTransaction>,
    checker: Arc<TransactionChecker>,
}

#[async_trait]
impl SignTransaction for ProtectedSigner {
    async fn sign_transaction(
        &self,
        input: SignTransactionInput,
    ) -> Result<SignedTransaction, WalletError> {
        let input = review(&self.checker, input).await?;
        self.original.sign_transaction(input).await
    }
}

struct ProtectedExecutor {
    original: Arc<dyn SignAndExecuteTransaction>,
    checker: Arc<TransactionChecker>,
}

#[async_trait]
impl SignAndExecuteTransaction for ProtectedExecutor {
    async fn sign_and_execute_transaction(
        &self,
        input: SignTransactionInput,
    ) -> Result<ExecutedTransaction, WalletError> {
        let input = review(&self.checker, input).await?;
        self.original.sign_and_execute_transaction(input).await
    }
}

/// Produces and announces protected versions of the wallets of one page.
pub struct Interceptor {
    checker: Arc<TransactionChecker>,
    window: Option<Arc<PageWindow>>,
    required_features: Vec<String>,
}

impl Interceptor {
    pub fn new(
        checker: Arc<TransactionChecker>,
        window: Option<Arc<PageWindow>>,
        config: &ProtectorConfig,
    ) -> Self {
        Self {
            checker,
            window,
            required_features: config.required_features.clone(),
        }
    }

    /// Protects `origin` and announces the protected wallet on the page.
    ///
    /// Returns `Ok(None)` for wallets that are already protected or not eligible. A
    /// signing feature of an unsupported version fails before anything is announced.
    pub fn install(&self, origin: &Arc<Wallet>) -> Result<Option<Arc<Wallet>>, InterceptError> {
        if origin.is_protected() {
            debug!("{} is already protected", origin.unique_id());
            return Ok(None);
        }
        if !is_eligible(origin, &self.required_features) {
            debug!("{} is not eligible for protection", origin.unique_id());
            return Ok(None);
        }

        let mut features: BTreeMap<String, Feature> = origin.features().clone();
        for name in [SUI_SIGN_TRANSACTION, SUI_SIGN_AND_EXECUTE_TRANSACTION] {
            if let Some(feature) = origin.feature(name) {
                features.insert(name.to_string(), self.protect(name, feature)?);
            }
        }

        // The account list is the original's own: it changes when the original connects.
        let wrapped = Wallet::builder(origin.name())
            .version(origin.version())
            .id(format!("{PROTECTED_ID_PREFIX}{}", origin.unique_id()))
            .icon(origin.icon())
            .chains(origin.chains().to_vec())
            .features(features)
            .shared_accounts(origin)
            .frozen()
            .build();
        info!("protecting wallet {}", origin.unique_id());

        register_wallet(self.window.as_ref(), wrapped.clone());
        Ok(Some(wrapped))
    }

    fn protect(&self, name: &str, feature: &Feature) -> Result<Feature, InterceptError> {
        if feature.version() != SUPPORTED_FEATURE_VERSION {
            return Err(InterceptError::UnsupportedFeatureVersion {
                feature: name.to_string(),
                version: feature.version().to_string(),
                expected: SUPPORTED_FEATURE_VERSION.to_string(),
            });
        }

        let checker = self.checker.clone();
        match (name, feature.method()) {
            (SUI_SIGN_TRANSACTION, FeatureMethod::SignTransaction(original)) => {
                Ok(Feature::sign_transaction(
                    feature.version(),
                    Arc::new(ProtectedSigner {
                        original: original.clone(),
                        checker,
                    }),
                ))
            }
            (SUI_SIGN_AND_EXECUTE_TRANSACTION, FeatureMethod::SignAndExecuteTransaction(original)) => {
                Ok(Feature::sign_and_execute_transaction(
                    feature.version(),
                    Arc::new(ProtectedExecutor {
                        original: original.clone(),
                        checker,
                    }),
                ))
            }
            _ => Err(InterceptError::MismatchedFeature(name.to_string())),
        }
    }
}
