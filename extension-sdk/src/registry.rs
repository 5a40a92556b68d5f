//! The discovery half of the wallet-standard protocol for one page.
//!
//! Wallets register themselves, consumers read the current set and subscribe to
//! register/unregister events. The registry announces itself on the page window when it
//! is created, and picks up wallets that announced themselves before it existed.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};

use common::constants::{APP_READY_EVENT, REGISTER_WALLET_EVENT};
use log::{debug, error};

use crate::bus::{BusError, PageWindow, WindowEvent, WindowEventKind};
use crate::wallet::Wallet;

/// Something that happened to the set of registered wallets.
#[derive(Debug, Clone)]
pub enum RegistryEvent {
    /// Wallets newly added by one `register` call.
    Register(Vec<Arc<Wallet>>),
    /// The same batch, removed by its `Unregister`.
    Unregister(Vec<Arc<Wallet>>),
}

impl RegistryEvent {
    pub fn kind(&self) -> RegistryEventKind {
        match self {
            RegistryEvent::Register(_) => RegistryEventKind::Register,
            RegistryEvent::Unregister(_) => RegistryEventKind::Unregister,
        }
    }

    pub fn wallets(&self) -> &[Arc<Wallet>] {
        match self {
            RegistryEvent::Register(wallets) | RegistryEvent::Unregister(wallets) => wallets,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistryEventKind {
    Register,
    Unregister,
}

/// A one-shot undo action. Only the first call has an effect.
pub struct Unregister {
    action: Mutex<Option<Box<dyn FnOnce() + Send>>>,
}

/// Removes a subscription; same semantics as [`Unregister`].
pub type Unsubscribe = Unregister;

impl Unregister {
    pub fn new(action: impl FnOnce() + Send + 'static) -> Self {
        Self {
            action: Mutex::new(Some(Box::new(action))),
        }
    }

    pub fn noop() -> Self {
        Self {
            action: Mutex::new(None),
        }
    }

    pub fn unregister(&self) {
        let action = self
            .action
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(action) = action {
            action();
        }
    }
}

impl std::fmt::Debug for Unregister {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let pending = self
            .action
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some();
        f.debug_struct("Unregister").field("pending", &pending).finish()
    }
}

/// The `register` capability handed to wallets during the discovery handshake.
#[derive(Clone)]
pub struct RegisterCapability {
    registry: Weak<RegistryInner>,
}

impl RegisterCapability {
    pub fn register(&self, wallets: Vec<Arc<Wallet>>) -> Unregister {
        match self.registry.upgrade() {
            Some(inner) => RegistryInner::register(&inner, wallets),
            None => Unregister::noop(),
        }
    }
}

type Handler = Arc<dyn Fn(&RegistryEvent) + Send + Sync>;

#[derive(Default)]
struct RegistryState {
    wallets: Vec<Arc<Wallet>>,
    snapshot: Option<Arc<[Arc<Wallet>]>>,
}

impl RegistryState {
    fn contains(&self, wallet: &Arc<Wallet>) -> bool {
        self.wallets.iter().any(|w| Arc::ptr_eq(w, wallet))
    }
}

#[derive(Default)]
struct RegistryInner {
    state: Mutex<RegistryState>,
    handlers: Mutex<Vec<(u64, Handler)>>,
    next_handler: AtomicU64,
}

impl RegistryInner {
    fn register(inner: &Arc<Self>, wallets: Vec<Arc<Wallet>>) -> Unregister {
        let added = {
            let mut state = inner.state.lock().unwrap_or_else(PoisonError::into_inner);
            let mut added: Vec<Arc<Wallet>> = Vec::new();
            for wallet in wallets {
                if state.contains(&wallet) || added.iter().any(|w| Arc::ptr_eq(w, &wallet)) {
                    continue;
                }
                added.push(wallet);
            }
            if !added.is_empty() {
                state.wallets.extend(added.iter().cloned());
                state.snapshot = None;
            }
            added
        };

        if added.is_empty() {
            return Unregister::noop();
        }
        debug!("registered {} wallet(s)", added.len());
        inner.notify(&RegistryEvent::Register(added.clone()));

        let registry = Arc::downgrade(inner);
        Unregister::new(move || {
            if let Some(inner) = registry.upgrade() {
                inner.unregister(added);
            }
        })
    }

    fn unregister(&self, wallets: Vec<Arc<Wallet>>) {
        {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            state
                .wallets
                .retain(|w| !wallets.iter().any(|removed| Arc::ptr_eq(w, removed)));
            state.snapshot = None;
        }
        debug!("unregistered {} wallet(s)", wallets.len());
        self.notify(&RegistryEvent::Unregister(wallets));
    }

    // Handlers run without any lock held: they commonly register more wallets.
    fn notify(&self, event: &RegistryEvent) {
        let handlers: Vec<Handler> = self
            .handlers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(_, handler)| handler.clone())
            .collect();
        for handler in handlers {
            handler(event);
        }
    }
}

/// The wallet registry of one page context.
#[derive(Clone)]
pub struct WalletRegistry {
    inner: Arc<RegistryInner>,
}

impl WalletRegistry {
    /// Creates the registry and announces it on `window`, if there is one.
    pub fn new(window: Option<&Arc<PageWindow>>) -> Self {
        let registry = Self {
            inner: Arc::new(RegistryInner::default()),
        };
        match window {
            Some(window) => registry.announce(window),
            None => debug!("no page window, the wallet registry is not announced"),
        }
        registry
    }

    fn announce(&self, window: &PageWindow) {
        let api = self.capability();

        let listener_api = api.clone();
        let on_register_wallet = move |event: &WindowEvent| -> Result<(), BusError> {
            if let WindowEvent::RegisterWallet(callback) = event {
                callback(&listener_api);
            }
            Ok(())
        };
        if let Err(e) = window.add_event_listener(WindowEventKind::RegisterWallet, on_register_wallet)
        {
            error!("{REGISTER_WALLET_EVENT} event listener could not be added: {e}");
        }

        if let Err(e) = window.dispatch_event(WindowEvent::AppReady(api)) {
            error!("{APP_READY_EVENT} event could not be dispatched: {e}");
        }
    }

    pub fn capability(&self) -> RegisterCapability {
        RegisterCapability {
            registry: Arc::downgrade(&self.inner),
        }
    }

    /// Registers the wallets not registered yet, and notifies `register` subscribers
    /// with that batch. The returned [`Unregister`] removes exactly that batch.
    pub fn register(&self, wallets: Vec<Arc<Wallet>>) -> Unregister {
        RegistryInner::register(&self.inner, wallets)
    }

    /// The registered wallets. The same snapshot is returned until the set changes.
    pub fn get(&self) -> Arc<[Arc<Wallet>]> {
        let mut state = self.inner.state.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(snapshot) = &state.snapshot {
            return snapshot.clone();
        }
        let snapshot: Arc<[Arc<Wallet>]> = state.wallets.clone().into();
        state.snapshot = Some(snapshot.clone());
        snapshot
    }

    /// Subscribes to every registry event.
    pub fn subscribe<F>(&self, handler: F) -> Unsubscribe
    where
        F: Fn(&RegistryEvent) + Send + Sync + 'static,
    {
        let id = self.inner.next_handler.fetch_add(1, Ordering::Relaxed);
        self.inner
            .handlers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((id, Arc::new(handler)));

        let registry = Arc::downgrade(&self.inner);
        Unsubscribe::new(move || {
            if let Some(inner) = registry.upgrade() {
                inner
                    .handlers
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .retain(|(handler_id, _)| *handler_id != id);
            }
        })
    }

    /// Subscribes to one kind of registry event.
    pub fn on<F>(&self, kind: RegistryEventKind, handler: F) -> Unsubscribe
    where
        F: Fn(&[Arc<Wallet>]) + Send + Sync + 'static,
    {
        self.subscribe(move |event| {
            if event.kind() == kind {
                handler(event.wallets());
            }
        })
    }
}
