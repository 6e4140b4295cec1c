use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::sync::Arc;

use tokio::sync::{Mutex, Notify};
use tokio::time::{Duration, Instant, sleep_until};
use tracing::warn;

use crate::account::{AccountId, AccountRepo};
use crate::events::{Event, EventHub, OperationalEvent};
use crate::time_util::now_ms;

/// Min-heap of cooldown deadlines with a background task that flips
/// accounts back to active when their deadline passes. Selection-time
/// checks remain authoritative; this exists so recovery is observable
/// and persisted without waiting for the next request.
#[derive(Debug)]
pub struct CooldownQueue {
    heap: Mutex<BinaryHeap<Reverse<(Instant, AccountId)>>>,
    notify: Notify,
}

impl CooldownQueue {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            heap: Mutex::new(BinaryHeap::new()),
            notify: Notify::new(),
        })
    }

    pub async fn push(&self, until_ms: i64, account_id: AccountId) {
        let delay_ms = (until_ms - now_ms()).max(0) as u64;
        let wake_at = Instant::now() + Duration::from_millis(delay_ms);
        {
            let mut heap = self.heap.lock().await;
            heap.push(Reverse((wake_at, account_id)));
        }
        // Always notify: the task re-computes the next deadline itself.
        self.notify.notify_one();
    }

    pub fn spawn_recover_task(self: Arc<Self>, repo: Arc<AccountRepo>, events: EventHub) {
        tokio::spawn(async move {
            loop {
                let next = {
                    let heap = self.heap.lock().await;
                    heap.peek().map(|Reverse((at, _))| *at)
                };

                match next {
                    None => {
                        self.notify.notified().await;
                        continue;
                    }
                    Some(deadline) => {
                        tokio::select! {
                            _ = sleep_until(deadline) => {}
                            _ = self.notify.notified() => continue,
                        }
                    }
                }

                let now = Instant::now();
                let mut due: Vec<AccountId> = Vec::new();
                {
                    let mut heap = self.heap.lock().await;
                    loop {
                        let ready = heap
                            .peek()
                            .is_some_and(|Reverse((at, _))| *at <= now);
                        if !ready {
                            break;
                        }
                        if let Some(Reverse((_, id))) = heap.pop() {
                            due.push(id);
                        }
                    }
                }

                for account_id in due {
                    // clear_cooldown re-checks the persisted deadline, so
                    // a stale heap entry cannot recover an account early.
                    match repo.clear_cooldown(&account_id).await {
                        Ok(true) => {
                            events
                                .emit(Event::Operational(OperationalEvent::CooldownEnd {
                                    account_id,
                                }))
                                .await;
                        }
                        Ok(false) => {}
                        Err(err) => {
                            warn!(event = "cooldown.recover_failed", account_id = %account_id, error = %err);
                        }
                    }
                }
            }
        });
    }
}
