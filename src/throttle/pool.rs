//! Credential pool gating every outbound search call.
//!
//! Workers check out a [`CredentialLease`] for their whole lifetime so no two
//! workers ever hold the same credential. Each call then waits on that
//! credential's [`RateBudget`]; callers without a lease use
//! [`CredentialPool::acquire_slot`], which picks whichever free credential
//! has budget first.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::Notify;
use tokio::time::{Instant, sleep_until};

use crate::models::RateLimitHeaders;
use crate::throttle::budget::{Credential, RateBudget, instant_for};

struct Slot {
    credential: Credential,
    budget: RateBudget,
    leased: bool,
}

/// Point-in-time view of one credential's budget.
#[derive(Debug, Clone)]
pub struct BudgetStatus {
    pub credential_id: String,
    pub remaining: u32,
    pub ceiling: u32,
    pub reset_in: Duration,
    pub leased: bool,
}

#[derive(Clone, Copy)]
enum Pick {
    AnyFree,
    Leased(usize),
}

/// Holds N credentials, each with an independent budget.
pub struct CredentialPool {
    slots: Mutex<Vec<Slot>>,
    changed: Notify,
}

impl CredentialPool {
    /// Pool where every credential starts with a full budget.
    pub fn new(
        credentials: Vec<Credential>,
        ceiling: u32,
        window: Duration,
        min_interval: Duration,
    ) -> Self {
        let now = Instant::now();
        Self::from_budgets(
            credentials
                .into_iter()
                .map(|c| {
                    let budget = RateBudget::new(ceiling, window, now).with_min_interval(min_interval);
                    (c, budget)
                })
                .collect(),
        )
    }

    pub fn from_budgets(entries: Vec<(Credential, RateBudget)>) -> Self {
        let slots = entries
            .into_iter()
            .map(|(credential, budget)| Slot {
                credential,
                budget,
                leased: false,
            })
            .collect();
        Self {
            slots: Mutex::new(slots),
            changed: Notify::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Wait until some free credential has budget, consume one call and
    /// return that credential.
    pub async fn acquire_slot(&self) -> Credential {
        let index = self.wait_for_slot(Pick::AnyFree).await;
        self.lock()[index].credential.clone()
    }

    /// Update a credential's budget from the latest response headers.
    pub fn report(&self, credential: &Credential, headers: &RateLimitHeaders) {
        self.with_slot_of(credential, |slot| {
            slot.budget.update(headers, Instant::now(), Utc::now())
        });
    }

    /// Record a rate-limit rejection for a credential.
    pub fn mark_rate_limited(
        &self,
        credential: &Credential,
        reset_at: Option<DateTime<Utc>>,
        retry_after: Option<Duration>,
    ) {
        self.with_slot_of(credential, |slot| {
            exhaust(&mut slot.budget, reset_at, retry_after)
        });
    }

    /// Take exclusive hold of a free credential, waiting for one to be released.
    pub async fn checkout(self: &Arc<Self>) -> CredentialLease {
        loop {
            let released = self.changed.notified();
            if let Some(lease) = self.try_checkout() {
                return lease;
            }
            released.await;
        }
    }

    /// Take exclusive hold of a free credential if one exists.
    ///
    /// Prefers the credential with the most remaining calls.
    pub fn try_checkout(self: &Arc<Self>) -> Option<CredentialLease> {
        let mut slots = self.lock();
        let now = Instant::now();
        let index = slots
            .iter_mut()
            .enumerate()
            .filter(|(_, slot)| !slot.leased)
            .map(|(i, slot)| {
                slot.budget.refresh(now);
                (i, slot.budget.available_at(now), slot.budget.remaining())
            })
            .min_by(|a, b| a.1.cmp(&b.1).then(b.2.cmp(&a.2)))
            .map(|(i, _, _)| i)?;

        let slot = &mut slots[index];
        slot.leased = true;
        Some(CredentialLease {
            pool: Arc::clone(self),
            index,
            credential: slot.credential.clone(),
        })
    }

    /// Budget view for scheduling and operator output.
    pub fn status(&self) -> Vec<BudgetStatus> {
        let now = Instant::now();
        self.lock()
            .iter_mut()
            .map(|slot| {
                slot.budget.refresh(now);
                BudgetStatus {
                    credential_id: slot.credential.id().to_string(),
                    remaining: slot.budget.remaining(),
                    ceiling: slot.budget.ceiling(),
                    reset_in: slot.budget.reset_at().saturating_duration_since(now),
                    leased: slot.leased,
                }
            })
            .collect()
    }

    /// Credentials in pool order.
    pub fn credentials(&self) -> Vec<Credential> {
        self.lock().iter().map(|s| s.credential.clone()).collect()
    }

    async fn wait_for_slot(&self, pick: Pick) -> usize {
        loop {
            let changed = self.changed.notified();
            let wake_at = {
                let mut slots = self.lock();
                let now = Instant::now();
                let mut earliest: Option<Instant> = None;
                for (i, slot) in slots.iter_mut().enumerate() {
                    let eligible = match pick {
                        Pick::AnyFree => !slot.leased,
                        Pick::Leased(index) => i == index,
                    };
                    if !eligible {
                        continue;
                    }
                    if slot.budget.try_consume(now) {
                        return i;
                    }
                    let at = slot.budget.available_at(now);
                    earliest = Some(earliest.map_or(at, |e| e.min(at)));
                }
                earliest
            };

            match wake_at {
                Some(at) => {
                    log::debug!(
                        "Search budget exhausted, sleeping {:.1}s",
                        at.saturating_duration_since(Instant::now()).as_secs_f64()
                    );
                    tokio::select! {
                        _ = sleep_until(at) => {}
                        _ = changed => {}
                    }
                }
                None => changed.await,
            }
        }
    }

    fn release(&self, index: usize) {
        if let Some(slot) = self.lock().get_mut(index) {
            slot.leased = false;
        }
        self.changed.notify_waiters();
    }

    fn with_slot_of(&self, credential: &Credential, f: impl FnOnce(&mut Slot)) {
        {
            let mut slots = self.lock();
            match slots.iter_mut().find(|s| s.credential.id() == credential.id()) {
                Some(slot) => f(slot),
                None => {
                    log::warn!("Unknown credential '{}' reported", credential.id());
                    return;
                }
            }
        }
        self.changed.notify_waiters();
    }

    fn with_index(&self, index: usize, f: impl FnOnce(&mut Slot)) {
        if let Some(slot) = self.lock().get_mut(index) {
            f(slot);
        }
        self.changed.notify_waiters();
    }

    fn lock(&self) -> MutexGuard<'_, Vec<Slot>> {
        self.slots.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn exhaust(budget: &mut RateBudget, reset_at: Option<DateTime<Utc>>, retry_after: Option<Duration>) {
    let now = Instant::now();
    let until = match (reset_at, retry_after) {
        (_, Some(wait)) => Some(now + wait),
        (Some(reset), None) => Some(instant_for(reset, now, Utc::now())),
        (None, None) => None,
    };
    match until {
        Some(until) if until > now => budget.exhaust_until(until),
        _ => budget.exhaust_for_window(now),
    }
}

/// Exclusive hold on one credential; returned to the pool on drop.
pub struct CredentialLease {
    pool: Arc<CredentialPool>,
    index: usize,
    credential: Credential,
}

impl CredentialLease {
    pub fn credential(&self) -> &Credential {
        &self.credential
    }

    /// Wait until this credential has budget and consume one call.
    pub async fn acquire_slot(&self) {
        self.pool.wait_for_slot(Pick::Leased(self.index)).await;
    }

    pub fn report(&self, headers: &RateLimitHeaders) {
        self.pool.with_index(self.index, |slot| {
            slot.budget.update(headers, Instant::now(), Utc::now())
        });
    }

    pub fn mark_rate_limited(&self, reset_at: Option<DateTime<Utc>>, retry_after: Option<Duration>) {
        self.pool.with_index(self.index, |slot| {
            exhaust(&mut slot.budget, reset_at, retry_after)
        });
    }
}

impl Drop for CredentialLease {
    fn drop(&mut self) {
        self.pool.release(self.index);
    }
}
