//! In-process browser: an in-memory window manager, the wiring of the page, content
//! script and background of each tab, and a demo wallet.

use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use common::constants::{
    STANDARD_CONNECT, STANDARD_EVENTS, SUI_SIGN_AND_EXECUTE_TRANSACTION, SUI_SIGN_TRANSACTION,
};
use common::{TabId, WalletAccount};
use log::trace;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use url::Url;

use crate::background::BackgroundCoordinator;
use crate::bridge::ContentBridge;
use crate::bus::{register_wallet, PageWindow};
use crate::config::ProtectorConfig;
use crate::interceptor::Interceptor;
use crate::popup::{PopupError, ReviewPopup};
use crate::protector::WalletProtector;
use crate::registry::{Unsubscribe, WalletRegistry};
use crate::relay::TransactionChecker;
use crate::transport::{
    BrowserEvent, ChannelError, ExtensionRuntime, WindowError, WindowId, WindowManager,
};
use crate::wallet::{
    ExecutedTransaction, Feature, SignAndExecuteTransaction, SignTransaction,
    SignTransactionInput, SignedTransaction, Wallet, WalletError,
};

const EVENT_CAPACITY: usize = 64;
const RUNTIME_CAPACITY: usize = 64;

/// A popup opened through a [`MemoryWindowManager`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenedPopup {
    pub window: WindowId,
    pub url: Url,
    pub width: u32,
    pub height: u32,
}

#[derive(Default)]
struct WindowsState {
    next_window: WindowId,
    open: Vec<WindowId>,
    popups: Vec<OpenedPopup>,
    removed: Vec<WindowId>,
    fail_next: bool,
}

/// Window manager keeping its windows in memory. Removals are reported as
/// [`BrowserEvent::WindowRemoved`].
pub struct MemoryWindowManager {
    state: Mutex<WindowsState>,
    events: mpsc::Sender<BrowserEvent>,
    opened: mpsc::UnboundedSender<OpenedPopup>,
    opened_queue: tokio::sync::Mutex<mpsc::UnboundedReceiver<OpenedPopup>>,
}

impl MemoryWindowManager {
    pub fn new() -> (Arc<Self>, mpsc::Receiver<BrowserEvent>) {
        let (events, receiver) = mpsc::channel(EVENT_CAPACITY);
        let (opened, opened_queue) = mpsc::unbounded_channel();
        let windows = Arc::new(Self {
            state: Mutex::new(WindowsState {
                next_window: 1,
                ..WindowsState::default()
            }),
            events,
            opened,
            opened_queue: tokio::sync::Mutex::new(opened_queue),
        });
        (windows, receiver)
    }

    /// Makes the next popup creation fail.
    pub fn fail_next_popup(&self) {
        self.lock().fail_next = true;
    }

    /// Every popup opened so far, in order.
    pub fn popups(&self) -> Vec<OpenedPopup> {
        self.lock().popups.clone()
    }

    /// Windows removed so far, in order.
    pub fn removed(&self) -> Vec<WindowId> {
        self.lock().removed.clone()
    }

    pub fn open_windows(&self) -> Vec<WindowId> {
        self.lock().open.clone()
    }

    /// Waits for the next popup to open.
    pub async fn next_popup(&self) -> Option<OpenedPopup> {
        self.opened_queue.lock().await.recv().await
    }

    /// Reports a browser event to the background.
    pub fn notify(&self, event: BrowserEvent) {
        if let Err(e) = self.events.try_send(event) {
            trace!("browser event not delivered: {e}");
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, WindowsState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl WindowManager for MemoryWindowManager {
    async fn create_popup(&self, url: &Url, width: u32, height: u32) -> Result<WindowId, WindowError> {
        let popup = {
            let mut state = self.lock();
            if state.fail_next {
                state.fail_next = false;
                return Err(WindowError::CreateFailed("no browser window to attach to".into()));
            }
            let window = state.next_window;
            state.next_window += 1;
            state.open.push(window);
            let popup = OpenedPopup {
                window,
                url: url.clone(),
                width,
                height,
            };
            state.popups.push(popup.clone());
            popup
        };
        let window = popup.window;
        if self.opened.send(popup).is_err() {
            trace!("popup {window} opened with nobody watching");
        }
        Ok(window)
    }

    async fn remove(&self, window: WindowId) -> Result<(), WindowError> {
        {
            let mut state = self.lock();
            let position = state
                .open
                .iter()
                .position(|w| *w == window)
                .ok_or(WindowError::NotFound(window))?;
            state.open.remove(position);
            state.removed.push(window);
        }
        self.notify(BrowserEvent::WindowRemoved(window));
        Ok(())
    }
}

/// A whole extension running in-process: the runtime, the background and the window
/// manager. Tabs are opened with [`ExtensionHarness::open_tab`].
pub struct ExtensionHarness {
    pub config: ProtectorConfig,
    pub runtime: ExtensionRuntime,
    pub windows: Arc<MemoryWindowManager>,
    pub background: Arc<BackgroundCoordinator>,
    background_task: JoinHandle<()>,
}

impl ExtensionHarness {
    /// Starts the background. Must be called within a tokio runtime.
    pub fn new(config: ProtectorConfig) -> Self {
        let (runtime, incoming) = ExtensionRuntime::new(RUNTIME_CAPACITY);
        let (windows, events) = MemoryWindowManager::new();
        let background = BackgroundCoordinator::new(config.clone(), windows.clone());
        let background_task = tokio::spawn(background.clone().run(incoming, events));
        Self {
            config,
            runtime,
            windows,
            background,
            background_task,
        }
    }

    /// Loads a page in `tab`, with the protector and the content script running.
    pub fn open_tab(&self, tab: TabId) -> TabSetup {
        let window = PageWindow::new();
        let (checker, checker_task) = TransactionChecker::spawn(window.clone());
        let bridge_task = ContentBridge::spawn(&window, Arc::new(self.runtime.connect_tab(tab)));

        let registry = WalletRegistry::new(Some(&window));
        let interceptor = Interceptor::new(checker.clone(), Some(window.clone()), &self.config);
        let protector = WalletProtector::new(interceptor, Some(window.clone()));
        let subscription = protector.track(&registry);

        TabSetup {
            tab,
            window,
            registry,
            checker,
            protector,
            subscription,
            tasks: vec![checker_task, bridge_task],
        }
    }

    /// Waits for the background to open a review popup, and loads the review page in it.
    pub async fn next_popup(&self) -> Result<ReviewPopup, PopupError> {
        let opened = self
            .windows
            .next_popup()
            .await
            .ok_or(PopupError::Channel(ChannelError::Disconnected))?;
        ReviewPopup::open(
            &opened.url,
            opened.window,
            Arc::new(self.runtime.connect_extension_page()),
            self.windows.clone(),
        )
    }

    /// Closes a popup window as the user would, without deciding.
    pub async fn close_window(&self, window: WindowId) -> Result<(), WindowError> {
        self.windows.remove(window).await
    }

    /// Closes the browser tab: its page goes away and the background is told.
    pub fn close_tab(&self, setup: TabSetup) {
        let tab = setup.tab;
        drop(setup);
        self.windows.notify(BrowserEvent::TabRemoved(tab));
    }
}

impl Drop for ExtensionHarness {
    fn drop(&mut self) {
        self.background_task.abort();
    }
}

/// One page of a tab, with its wallet registry and the protector.
pub struct TabSetup {
    pub tab: TabId,
    pub window: Arc<PageWindow>,
    pub registry: WalletRegistry,
    pub checker: Arc<TransactionChecker>,
    pub protector: Arc<WalletProtector>,
    subscription: Unsubscribe,
    tasks: Vec<JoinHandle<()>>,
}

impl TabSetup {
    /// A wallet announcing itself on the page, as a wallet extension does.
    pub fn announce_wallet(&self, wallet: Arc<Wallet>) {
        register_wallet(Some(&self.window), wallet);
    }

    /// The protected version of the wallet named `name`, as the dApp discovers it.
    pub fn protected_wallet(&self, name: &str) -> Option<Arc<Wallet>> {
        self.registry
            .get()
            .iter()
            .find(|w| w.is_protected() && w.name() == name)
            .cloned()
    }
}

impl Drop for TabSetup {
    fn drop(&mut self) {
        self.subscription.unregister();
        self.window.close();
        for task in &self.tasks {
            task.abort();
        }
    }
}

/// An in-memory wallet signer recording the transactions it signs.
#[derive(Default)]
pub struct RecordingSigner {
    signed: Mutex<Vec<String>>,
    failure: Option<String>,
}

impl RecordingSigner {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// A signer refusing every transaction with `reason`.
    pub fn failing(reason: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            signed: Mutex::new(Vec::new()),
            failure: Some(reason.into()),
        })
    }

    /// Serialized transactions signed so far.
    pub fn signed(&self) -> Vec<String> {
        self.signed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    async fn record(&self, input: &SignTransactionInput) -> Result<SignedTransaction, WalletError> {
        if let Some(reason) = &self.failure {
            return Err(WalletError::Rejected(reason.clone()));
        }
        let transaction = input.transaction.to_json().await?;
        self.signed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(transaction.clone());
        Ok(SignedTransaction {
            signature: format!("{}:{}", input.account.address, transaction.len()),
            bytes: transaction,
        })
    }
}

#[async_trait]
impl SignTransaction for RecordingSigner {
    async fn sign_transaction(
        &self,
        input: SignTransactionInput,
    ) -> Result<SignedTransaction, WalletError> {
        self.record(&input).await
    }
}

#[async_trait]
impl SignAndExecuteTransaction for RecordingSigner {
    async fn sign_and_execute_transaction(
        &self,
        input: SignTransactionInput,
    ) -> Result<ExecutedTransaction, WalletError> {
        let signed = self.record(&input).await?;
        let digest = format!("0x{:016x}", self.signed().len());
        Ok(ExecutedTransaction {
            digest,
            effects: "success".into(),
            bytes: signed.bytes,
            signature: signed.signature,
        })
    }
}

pub fn demo_account() -> WalletAccount {
    WalletAccount {
        address: "0x5a1e0f0c4b7d2e9a8f3c6b1d0e4a7c2f9b8d3e6a1c0f5b2d7e4a9c8f3b6d1e0a".into(),
        public_key: vec![0x02; 32],
        chains: vec!["sui:devnet".into(), "sui:testnet".into()],
        features: vec![
            SUI_SIGN_TRANSACTION.into(),
            SUI_SIGN_AND_EXECUTE_TRANSACTION.into(),
        ],
        label: Some("demo".into()),
    }
}

/// A sui wallet named `name`, eligible for protection, signing with `signer`.
pub fn demo_wallet(name: &str, signer: Arc<RecordingSigner>) -> Arc<Wallet> {
    Wallet::builder(name)
        .id(format!("com.{}", name.to_lowercase()))
        .icon("data:image/svg+xml;base64,PHN2Zy8+")
        .chain("sui:devnet")
        .chain("sui:testnet")
        .feature(STANDARD_CONNECT, Feature::opaque("1.0.0"))
        .feature(STANDARD_EVENTS, Feature::opaque("1.0.0"))
        .feature(
            SUI_SIGN_TRANSACTION,
            Feature::sign_transaction("2.0.0", signer.clone()),
        )
        .feature(
            SUI_SIGN_AND_EXECUTE_TRANSACTION,
            Feature::sign_and_execute_transaction("2.0.0", signer),
        )
        .account(demo_account())
        .build()
}
