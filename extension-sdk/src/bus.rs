//! The page window: `postMessage` traffic and the wallet-standard custom events.
//!
//! Messages posted on the window are delivered asynchronously and in order to every
//! subscriber, which filters them by their `source`. No message is ever dropped for a
//! slow subscriber. Custom events are dispatched synchronously to the
//! listeners registered for their kind; a failing listener is logged and never affects
//! the dispatcher or the other listeners.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use common::constants::{APP_READY_EVENT, REGISTER_WALLET_EVENT};
use common::WindowMessage;
use log::{error, trace};
use tokio::sync::mpsc;

use crate::registry::RegisterCapability;
use crate::wallet::Wallet;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BusError {
    #[error("the page window is closed")]
    Closed,
}

/// Callback carried by a `wallet-standard:register-wallet` event: the wallet side of
/// the handshake, invoked with the capability of the registry that picks it up.
pub type RegisterWalletCallback = Arc<dyn Fn(&RegisterCapability) + Send + Sync>;

#[derive(Clone)]
pub enum WindowEvent {
    /// A registry announces itself to the wallets already loaded in the page.
    AppReady(RegisterCapability),
    /// A wallet announces itself to the registries already loaded in the page.
    RegisterWallet(RegisterWalletCallback),
}

impl WindowEvent {
    pub fn kind(&self) -> WindowEventKind {
        match self {
            WindowEvent::AppReady(_) => WindowEventKind::AppReady,
            WindowEvent::RegisterWallet(_) => WindowEventKind::RegisterWallet,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowEventKind {
    AppReady,
    RegisterWallet,
}

impl WindowEventKind {
    pub fn name(&self) -> &'static str {
        match self {
            WindowEventKind::AppReady => APP_READY_EVENT,
            WindowEventKind::RegisterWallet => REGISTER_WALLET_EVENT,
        }
    }
}

/// The messages posted on a window after subscribing; ends when the page is closed.
pub type WindowMessages = mpsc::UnboundedReceiver<WindowMessage>;

type EventListener = Arc<dyn Fn(&WindowEvent) -> Result<(), BusError> + Send + Sync>;

/// The `window` of one page.
pub struct PageWindow {
    subscribers: Mutex<Vec<mpsc::UnboundedSender<WindowMessage>>>,
    listeners: Mutex<Vec<(u64, WindowEventKind, EventListener)>>,
    next_listener: AtomicU64,
    closed: AtomicBool,
}

impl PageWindow {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            subscribers: Mutex::new(Vec::new()),
            listeners: Mutex::new(Vec::new()),
            next_listener: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        })
    }

    /// Tears the page down: no further message or event is delivered.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        self.listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Posts a message to every current subscriber of the window.
    pub fn post_message(&self, message: WindowMessage) -> Result<(), BusError> {
        if self.is_closed() {
            return Err(BusError::Closed);
        }
        let mut subscribers = self
            .subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        subscribers.retain(|subscriber| subscriber.send(message.clone()).is_ok());
        if subscribers.is_empty() {
            trace!("message posted on a window nobody listens to");
        }
        Ok(())
    }

    /// Subscribes to the messages posted from now on.
    pub fn subscribe(&self) -> WindowMessages {
        let (sender, receiver) = mpsc::unbounded_channel();
        if !self.is_closed() {
            self.subscribers
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(sender);
        }
        receiver
    }

    pub fn add_event_listener<F>(&self, kind: WindowEventKind, listener: F) -> Result<u64, BusError>
    where
        F: Fn(&WindowEvent) -> Result<(), BusError> + Send + Sync + 'static,
    {
        if self.is_closed() {
            return Err(BusError::Closed);
        }
        let handle = self.next_listener.fetch_add(1, Ordering::Relaxed);
        self.listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((handle, kind, Arc::new(listener)));
        Ok(handle)
    }

    pub fn remove_event_listener(&self, handle: u64) {
        self.listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|(id, _, _)| *id != handle);
    }

    /// Dispatches a non-bubbling, non-cancelable event to the listeners of its kind.
    ///
    /// Listeners run without any lock held, so they may dispatch events themselves.
    pub fn dispatch_event(&self, event: WindowEvent) -> Result<(), BusError> {
        if self.is_closed() {
            return Err(BusError::Closed);
        }
        let kind = event.kind();
        let listeners: Vec<EventListener> = self
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|(_, k, _)| *k == kind)
            .map(|(_, _, listener)| listener.clone())
            .collect();

        for listener in listeners {
            if let Err(e) = listener(&event) {
                error!("{} listener failed: {}", kind.name(), e);
            }
        }
        Ok(())
    }
}

/// Announces a wallet to every registry of the page, present or future.
///
/// The wallet is registered right away with the registries already listening for
/// `wallet-standard:register-wallet`, and with every registry that later dispatches
/// `wallet-standard:app-ready`. Failures are logged: discovery is best-effort.
pub fn register_wallet(window: Option<&Arc<PageWindow>>, wallet: Arc<Wallet>) {
    let Some(window) = window else {
        error!("{REGISTER_WALLET_EVENT} event could not be dispatched: no window");
        return;
    };

    let callback: RegisterWalletCallback = Arc::new(move |api: &RegisterCapability| {
        api.register(vec![wallet.clone()]);
    });

    if let Err(e) = window.dispatch_event(WindowEvent::RegisterWallet(callback.clone())) {
        error!("{REGISTER_WALLET_EVENT} event could not be dispatched: {e}");
    }

    let on_app_ready = move |event: &WindowEvent| -> Result<(), BusError> {
        if let WindowEvent::AppReady(api) = event {
            callback(api);
        }
        Ok(())
    };
    if let Err(e) = window.add_event_listener(WindowEventKind::AppReady, on_app_ready) {
        error!("{APP_READY_EVENT} event listener could not be added: {e}");
    }
}
