//! Wallet-standard descriptors as seen from the page context.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};

use async_trait::async_trait;
use common::constants::{
    chain_namespace, PROTECTED_ID_PREFIX, SUI_SIGN_AND_EXECUTE_TRANSACTION, SUI_SIGN_TRANSACTION,
};
use common::{WalletAccount, WalletRef, WalletSummary};

use crate::abort::AbortSignal;
use crate::relay::CheckError;

/// Errors surfaced by a wallet's signing features.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WalletError {
    /// The review of the transaction did not allow signing it.
    #[error(transparent)]
    Check(#[from] CheckError),
    /// The underlying wallet refused or failed; the message is passed through unchanged.
    #[error("{0}")]
    Rejected(String),
    #[error("transaction could not be serialized: {0}")]
    Serialization(String),
    #[error("wallet {0} is frozen")]
    Frozen(String),
    #[error("wallet does not support {0}")]
    UnsupportedFeature(String),
}

/// A transaction handed to a signing feature. Only its canonical wire form matters here.
#[async_trait]
pub trait Transaction: Send + Sync {
    async fn to_json(&self) -> Result<String, WalletError>;
}

/// A transaction that is already in its serialized form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SerializedTransaction(String);

impl SerializedTransaction {
    pub fn new(json: impl Into<String>) -> Self {
        Self(json.into())
    }
}

#[async_trait]
impl Transaction for SerializedTransaction {
    async fn to_json(&self) -> Result<String, WalletError> {
        Ok(self.0.clone())
    }
}

/// Arguments of `sui:signTransaction` and `sui:signAndExecuteTransaction`.
#[derive(Clone)]
pub struct SignTransactionInput {
    pub transaction: Arc<dyn Transaction>,
    pub account: WalletAccount,
    pub chain: String,
    pub signal: Option<AbortSignal>,
}

impl fmt::Debug for SignTransactionInput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SignTransactionInput")
            .field("account", &self.account.address)
            .field("chain", &self.chain)
            .field("signal", &self.signal)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedTransaction {
    pub bytes: String,
    pub signature: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutedTransaction {
    pub digest: String,
    pub bytes: String,
    pub signature: String,
    pub effects: String,
}

#[async_trait]
pub trait SignTransaction: Send + Sync {
    async fn sign_transaction(
        &self,
        input: SignTransactionInput,
    ) -> Result<SignedTransaction, WalletError>;
}

#[async_trait]
pub trait SignAndExecuteTransaction: Send + Sync {
    async fn sign_and_execute_transaction(
        &self,
        input: SignTransactionInput,
    ) -> Result<ExecutedTransaction, WalletError>;
}

/// The operation behind a named feature.
#[derive(Clone)]
pub enum FeatureMethod {
    SignTransaction(Arc<dyn SignTransaction>),
    SignAndExecuteTransaction(Arc<dyn SignAndExecuteTransaction>),
    /// Any feature the protector does not intercept (connect, events, ...).
    Opaque,
}

/// A versioned capability of a wallet.
#[derive(Clone)]
pub struct Feature {
    version: String,
    method: FeatureMethod,
}

impl Feature {
    pub fn opaque(version: impl Into<String>) -> Self {
        Self {
            version: version.into(),
            method: FeatureMethod::Opaque,
        }
    }

    pub fn sign_transaction(version: impl Into<String>, signer: Arc<dyn SignTransaction>) -> Self {
        Self {
            version: version.into(),
            method: FeatureMethod::SignTransaction(signer),
        }
    }

    pub fn sign_and_execute_transaction(
        version: impl Into<String>,
        executor: Arc<dyn SignAndExecuteTransaction>,
    ) -> Self {
        Self {
            version: version.into(),
            method: FeatureMethod::SignAndExecuteTransaction(executor),
        }
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn method(&self) -> &FeatureMethod {
        &self.method
    }
}

impl fmt::Debug for Feature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let method = match self.method {
            FeatureMethod::SignTransaction(_) => "signTransaction",
            FeatureMethod::SignAndExecuteTransaction(_) => "signAndExecuteTransaction",
            FeatureMethod::Opaque => "opaque",
        };
        f.debug_struct("Feature")
            .field("version", &self.version)
            .field("method", &method)
            .finish()
    }
}

/// A wallet descriptor.
///
/// Identity matters: registries track wallets by reference (`Arc::ptr_eq`), not by id.
/// Only the account list is mutable, and not at all once the descriptor is frozen. A
/// descriptor built with [`WalletBuilder::shared_accounts`] sees the account list of the
/// wallet it was built from.
#[derive(Debug)]
pub struct Wallet {
    version: String,
    id: Option<String>,
    name: String,
    icon: String,
    chains: Vec<String>,
    features: BTreeMap<String, Feature>,
    accounts: Arc<RwLock<Vec<WalletAccount>>>,
    frozen: bool,
}

impl Wallet {
    pub fn builder(name: impl Into<String>) -> WalletBuilder {
        WalletBuilder::new(name)
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn id(&self) -> Option<&str> {
        self.id.as_deref()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn icon(&self) -> &str {
        &self.icon
    }

    pub fn chains(&self) -> &[String] {
        &self.chains
    }

    pub fn features(&self) -> &BTreeMap<String, Feature> {
        &self.features
    }

    pub fn feature(&self, name: &str) -> Option<&Feature> {
        self.features.get(name)
    }

    pub fn has_feature(&self, name: &str) -> bool {
        self.features.contains_key(name)
    }

    /// Id used to derive the protected id: the wallet id, or its name when it has none.
    pub fn unique_id(&self) -> &str {
        match self.id.as_deref() {
            Some(id) if !id.is_empty() => id,
            _ => &self.name,
        }
    }

    /// Whether this descriptor was produced by the protector.
    pub fn is_protected(&self) -> bool {
        self.id
            .as_deref()
            .is_some_and(|id| id.starts_with(PROTECTED_ID_PREFIX))
    }

    pub fn supports_namespace(&self, namespace: &str) -> bool {
        self.chains
            .iter()
            .any(|chain| chain_namespace(chain) == namespace)
    }

    pub fn is_frozen(&self) -> bool {
        self.frozen
    }

    pub fn accounts(&self) -> Vec<WalletAccount> {
        self.accounts
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn set_accounts(&self, accounts: Vec<WalletAccount>) -> Result<(), WalletError> {
        if self.frozen {
            return Err(WalletError::Frozen(self.unique_id().to_string()));
        }
        *self.accounts.write().unwrap_or_else(PoisonError::into_inner) = accounts;
        Ok(())
    }

    pub fn summary(&self) -> WalletSummary {
        WalletSummary {
            id: self.id.clone(),
            name: self.name.clone(),
            icon: self.icon.clone(),
            chains: self.chains.clone(),
            features: self.features.keys().cloned().collect(),
            accounts: self.accounts(),
        }
    }

    pub fn reference(&self) -> WalletRef {
        WalletRef {
            id: self.id.clone(),
            name: self.name.clone(),
        }
    }

    /// Calls the wallet's `sui:signTransaction` feature.
    pub async fn sign_transaction(
        &self,
        input: SignTransactionInput,
    ) -> Result<SignedTransaction, WalletError> {
        match self.feature(SUI_SIGN_TRANSACTION).map(Feature::method) {
            Some(FeatureMethod::SignTransaction(signer)) => signer.sign_transaction(input).await,
            _ => Err(WalletError::UnsupportedFeature(SUI_SIGN_TRANSACTION.into())),
        }
    }

    /// Calls the wallet's `sui:signAndExecuteTransaction` feature.
    pub async fn sign_and_execute_transaction(
        &self,
        input: SignTransactionInput,
    ) -> Result<ExecutedTransaction, WalletError> {
        match self.feature(SUI_SIGN_AND_EXECUTE_TRANSACTION).map(Feature::method) {
            Some(FeatureMethod::SignAndExecuteTransaction(executor)) => {
                executor.sign_and_execute_transaction(input).await
            }
            _ => Err(WalletError::UnsupportedFeature(
                SUI_SIGN_AND_EXECUTE_TRANSACTION.into(),
            )),
        }
    }
}

pub struct WalletBuilder {
    version: String,
    id: Option<String>,
    name: String,
    icon: String,
    chains: Vec<String>,
    features: BTreeMap<String, Feature>,
    accounts: Arc<RwLock<Vec<WalletAccount>>>,
    frozen: bool,
}

impl WalletBuilder {
    fn new(name: impl Into<String>) -> Self {
        Self {
            version: common::constants::WALLET_STANDARD_VERSION.into(),
            id: None,
            name: name.into(),
            icon: String::new(),
            chains: Vec::new(),
            features: BTreeMap::new(),
            accounts: Arc::default(),
            frozen: false,
        }
    }

    pub fn version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    pub fn id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn icon(mut self, icon: impl Into<String>) -> Self {
        self.icon = icon.into();
        self
    }

    pub fn chain(mut self, chain: impl Into<String>) -> Self {
        self.chains.push(chain.into());
        self
    }

    pub fn chains(mut self, chains: Vec<String>) -> Self {
        self.chains = chains;
        self
    }

    pub fn feature(mut self, name: impl Into<String>, feature: Feature) -> Self {
        self.features.insert(name.into(), feature);
        self
    }

    pub fn features(mut self, features: BTreeMap<String, Feature>) -> Self {
        self.features = features;
        self
    }

    pub fn account(self, account: WalletAccount) -> Self {
        self.accounts
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(account);
        self
    }

    /// Shares the account list of `wallet`: accounts it gets later show up here too.
    pub fn shared_accounts(mut self, wallet: &Wallet) -> Self {
        self.accounts = wallet.accounts.clone();
        self
    }

    pub fn frozen(mut self) -> Self {
        self.frozen = true;
        self
    }

    pub fn build(self) -> Arc<Wallet> {
        Arc::new(Wallet {
            version: self.version,
            id: self.id,
            name: self.name,
            icon: self.icon,
            chains: self.chains,
            features: self.features,
            accounts: self.accounts,
            frozen: self.frozen,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unique_id_falls_back_to_name() {
        let wallet = Wallet::builder("Suiet").build();
        assert_eq!(wallet.unique_id(), "Suiet");

        let wallet = Wallet::builder("Suiet").id("").build();
        assert_eq!(wallet.unique_id(), "Suiet");

        let wallet = Wallet::builder("Suiet").id("com.suiet").build();
        assert_eq!(wallet.unique_id(), "com.suiet");
    }

    #[test]
    fn test_protected_prefix() {
        assert!(Wallet::builder("x").id("DP:com.suiet").build().is_protected());
        assert!(!Wallet::builder("DP: x").build().is_protected());
    }

    #[test]
    fn test_frozen_accounts_are_immutable() {
        let wallet = Wallet::builder("Suiet").id("com.suiet").frozen().build();
        assert_eq!(
            wallet.set_accounts(Vec::new()),
            Err(WalletError::Frozen("com.suiet".into()))
        );

        let wallet = Wallet::builder("Suiet").build();
        let account = WalletAccount {
            address: "0x1".into(),
            public_key: vec![1],
            chains: vec!["sui:devnet".into()],
            features: Vec::new(),
            label: None,
        };
        wallet.set_accounts(vec![account.clone()]).unwrap();
        assert_eq!(wallet.accounts(), vec![account]);
    }

    #[test]
    fn test_summary_lists_feature_names() {
        let wallet = Wallet::builder("Suiet")
            .id("com.suiet")
            .chain("sui:devnet")
            .feature("standard:events", Feature::opaque("1.0.0"))
            .feature("standard:connect", Feature::opaque("1.0.0"))
            .build();

        let summary = wallet.summary();
        assert_eq!(summary.features, vec!["standard:connect", "standard:events"]);
        assert_eq!(summary.chains, vec!["sui:devnet"]);
    }
}
