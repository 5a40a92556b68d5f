//! Tracks the wallets of a page, protects the eligible ones and reports them to the
//! content script.

use std::sync::{Arc, Mutex, PoisonError};

use common::{WalletRef, WalletSummary, WindowMessage, WindowMessageBody};
use log::{debug, error, warn};

use crate::bus::PageWindow;
use crate::interceptor::{InterceptError, Interceptor};
use crate::registry::{RegistryEventKind, Unregister, Unsubscribe, WalletRegistry};
use crate::wallet::Wallet;

#[derive(Default)]
struct ProtectorState {
    /// Wallets seen by this protector, by reference.
    tracked: Vec<Arc<Wallet>>,
    protected: Vec<Arc<Wallet>>,
}

/// The page-script side of the protection: one per page.
pub struct WalletProtector {
    interceptor: Interceptor,
    window: Option<Arc<PageWindow>>,
    state: Mutex<ProtectorState>,
}

impl WalletProtector {
    pub fn new(interceptor: Interceptor, window: Option<Arc<PageWindow>>) -> Arc<Self> {
        Arc::new(Self {
            interceptor,
            window,
            state: Mutex::new(ProtectorState::default()),
        })
    }

    /// Protects the wallets not seen yet, and reports them to the content script.
    ///
    /// Already protected wallets are tracked but neither wrapped nor reported. Fails on
    /// the first wallet whose signing features cannot be wrapped. The returned
    /// [`Unregister`] forgets exactly the wallets reported by this call, so they are
    /// protected and reported again if they come back.
    pub fn register(self: &Arc<Self>, wallets: &[Arc<Wallet>]) -> Result<Unregister, InterceptError> {
        let fresh: Vec<Arc<Wallet>> = {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            let mut fresh = Vec::new();
            for wallet in wallets {
                if state.tracked.iter().any(|w| Arc::ptr_eq(w, wallet)) {
                    continue;
                }
                state.tracked.push(wallet.clone());
                if !wallet.is_protected() {
                    fresh.push(wallet.clone());
                }
            }
            fresh
        };
        if fresh.is_empty() {
            return Ok(Unregister::noop());
        }

        // Installing announces the protected wallets, which re-enters `register`.
        for wallet in &fresh {
            if let Some(protected) = self.interceptor.install(wallet)? {
                self.state
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .protected
                    .push(protected);
            }
        }

        let summaries: Vec<WalletSummary> = fresh.iter().map(|w| w.summary()).collect();
        self.post(WindowMessageBody::RegisteredWallets(summaries));

        let references: Vec<WalletRef> = fresh.iter().map(|w| w.reference()).collect();
        let window = self.window.clone();
        let protector = Arc::downgrade(self);
        Ok(Unregister::new(move || {
            if let Some(protector) = protector.upgrade() {
                protector.forget(&fresh);
            }
            post(window.as_ref(), WindowMessageBody::UnregisteredWallets(references));
        }))
    }

    /// Protects the wallets of `registry`, present and future.
    pub fn track(self: &Arc<Self>, registry: &WalletRegistry) -> Unsubscribe {
        let current = registry.get();
        if let Err(e) = self.register(&current) {
            error!("wallet protection failed: {e}");
        }

        let protector = Arc::downgrade(self);
        registry.on(RegistryEventKind::Register, move |wallets| {
            let Some(protector) = protector.upgrade() else {
                return;
            };
            if let Err(e) = protector.register(wallets) {
                error!("wallet protection failed: {e}");
            }
        })
    }

    /// Protected wallets produced so far.
    pub fn protected_wallets(&self) -> Vec<Arc<Wallet>> {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .protected
            .clone()
    }

    fn forget(&self, wallets: &[Arc<Wallet>]) {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .tracked
            .retain(|tracked| !wallets.iter().any(|w| Arc::ptr_eq(w, tracked)));
    }

    fn post(&self, body: WindowMessageBody) {
        post(self.window.as_ref(), body);
    }
}

fn post(window: Option<&Arc<PageWindow>>, body: WindowMessageBody) {
    let Some(window) = window else {
        debug!("no page window, wallet telemetry dropped");
        return;
    };
    if let Err(e) = window.post_message(WindowMessage::from_page_script(body)) {
        warn!("wallet telemetry could not be posted: {e}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::config::ProtectorConfig;
    use crate::relay::TransactionChecker;
    use crate::sandbox::{demo_wallet, RecordingSigner};

    fn protector(window: &Arc<PageWindow>) -> Arc<WalletProtector> {
        let checker = TransactionChecker::new(window.clone());
        let interceptor =
            Interceptor::new(checker, Some(window.clone()), &ProtectorConfig::default());
        WalletProtector::new(interceptor, Some(window.clone()))
    }

    fn drain(messages: &mut crate::bus::WindowMessages) -> Vec<WindowMessageBody> {
        let mut bodies = Vec::new();
        while let Ok(message) = messages.try_recv() {
            assert!(message.is_from_page_script());
            bodies.push(message.body);
        }
        bodies
    }

    #[test]
    fn test_tracker_protects_registry_wallets() {
        let window = PageWindow::new();
        let registry = WalletRegistry::new(Some(&window));
        let origin = demo_wallet("Suiet", RecordingSigner::new());
        registry.register(vec![origin.clone()]);

        let protector = protector(&window);
        let _subscription = protector.track(&registry);

        let protected = protector.protected_wallets();
        assert_eq!(protected.len(), 1);
        assert_eq!(protected[0].id(), Some("DP:com.suiet"));

        // The protected wallet reached the registry through the handshake.
        let registered = registry.get();
        assert_eq!(registered.len(), 2);
        assert!(registered.iter().any(|w| Arc::ptr_eq(w, &protected[0])));

        // Later wallets are protected as they register; their protected versions come
        // back through the registry and are left alone.
        let later = demo_wallet("Ethos", RecordingSigner::new());
        registry.register(vec![later]);
        assert_eq!(protector.protected_wallets().len(), 2);
        assert_eq!(registry.get().len(), 4);
    }

    #[test]
    fn test_telemetry_and_idempotent_unregister() {
        let window = PageWindow::new();
        let mut messages = window.subscribe();
        let protector = protector(&window);
        let origin = demo_wallet("Suiet", RecordingSigner::new());

        let unregister = protector.register(&[origin.clone()]).unwrap();
        let bodies = drain(&mut messages);
        assert_eq!(
            bodies,
            vec![WindowMessageBody::RegisteredWallets(vec![origin.summary()])]
        );

        // Seen already: nothing new to report.
        let again = protector.register(&[origin.clone()]).unwrap();
        again.unregister();
        assert!(drain(&mut messages).is_empty());

        unregister.unregister();
        unregister.unregister();
        assert_eq!(
            drain(&mut messages),
            vec![WindowMessageBody::UnregisteredWallets(vec![origin.reference()])]
        );
    }

    #[test]
    fn test_unregistered_wallet_is_reported_again() {
        let window = PageWindow::new();
        let mut messages = window.subscribe();
        let protector = protector(&window);
        let origin = demo_wallet("Suiet", RecordingSigner::new());

        protector.register(&[origin.clone()]).unwrap().unregister();
        assert_eq!(drain(&mut messages).len(), 2);

        let unregister = protector.register(&[origin.clone()]).unwrap();
        assert_eq!(
            drain(&mut messages),
            vec![WindowMessageBody::RegisteredWallets(vec![origin.summary()])]
        );
        assert_eq!(protector.protected_wallets().len(), 2);

        unregister.unregister();
        assert_eq!(
            drain(&mut messages),
            vec![WindowMessageBody::UnregisteredWallets(vec![origin.reference()])]
        );
    }

    #[test]
    fn test_protected_wallets_are_not_reported() {
        let window = PageWindow::new();
        let mut messages = window.subscribe();
        let protector = protector(&window);
        let wrapped = Wallet::builder("Suiet").id("DP:com.suiet").build();

        protector.register(&[wrapped]).unwrap();
        assert!(drain(&mut messages).is_empty());
        assert!(protector.protected_wallets().is_empty());
    }
}
