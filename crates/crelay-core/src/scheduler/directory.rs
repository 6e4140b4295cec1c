use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use crelay_store::{Store, keys};
use tokio::time::MissedTickBehavior;
use tracing::warn;

use crate::account::{AccountRepo, AccountView};

const REFRESH_INTERVAL: Duration = Duration::from_secs(30);

/// Coherent snapshot of account metadata for lock-free scheduler reads.
/// Writers commit to the store and publish an invalidation; the
/// directory reloads on that signal, with a periodic reload as backstop.
pub struct AccountDirectory {
    repo: Arc<AccountRepo>,
    accounts: ArcSwap<Vec<AccountView>>,
}

impl AccountDirectory {
    pub async fn load(repo: Arc<AccountRepo>) -> Arc<Self> {
        let initial = repo.list().await.unwrap_or_else(|err| {
            warn!(event = "directory.initial_load_failed", error = %err);
            Vec::new()
        });
        Arc::new(Self {
            repo,
            accounts: ArcSwap::from_pointee(initial),
        })
    }

    pub fn accounts(&self) -> Arc<Vec<AccountView>> {
        self.accounts.load_full()
    }

    pub async fn reload(&self) {
        match self.repo.list().await {
            Ok(accounts) => self.accounts.store(Arc::new(accounts)),
            Err(err) => warn!(event = "directory.reload_failed", error = %err),
        }
    }

    pub fn spawn_refresh(self: &Arc<Self>, store: &Store) {
        let directory = self.clone();
        let mut invalidations = store.subscribe();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(REFRESH_INTERVAL);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    message = invalidations.recv() => {
                        match message {
                            Ok(message) if message.channel == keys::ACCOUNTS_CHANNEL => {
                                directory.reload().await;
                            }
                            // Lagged receivers just wait for the next tick.
                            _ => {}
                        }
                    }
                    _ = ticker.tick() => {
                        directory.reload().await;
                    }
                }
            }
        });
    }
}
