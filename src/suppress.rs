//! Suppression flag for scene notifications caused by the engine itself.
//!
//! While a snapshot is being loaded into the scene (initial load, inbound
//! remote edit) every change notification it fires must be ignored. Outbound
//! publishes stay held back for a short trailing window after that. The flag
//! is only ever raised through [`Suppression::acquire`]; dropping the guard,
//! on success or on an early `?` return, starts the trailing settle window.
//! It can never stay raised.

use std::cell::Cell;
use std::time::{Duration, Instant};

#[derive(Debug, Default)]
pub struct Suppression {
    holders: Cell<u32>,
    release_at: Cell<Option<Instant>>,
}

impl Suppression {
    pub fn new() -> Self {
        Self::default()
    }

    /// Raise the flag until the returned guard is dropped, then for `settle`
    /// longer (measured from `now`).
    pub fn acquire(&self, now: Instant, settle: Duration) -> SuppressionGuard<'_> {
        self.holders.set(self.holders.get() + 1);
        SuppressionGuard {
            owner: self,
            until: now + settle,
        }
    }

    /// Whether a guard is alive right now. Notifications raised while held
    /// come from the restore itself.
    pub fn is_held(&self) -> bool {
        self.holders.get() > 0
    }

    /// Held, or inside the trailing settle window
    pub fn is_active(&self, now: Instant) -> bool {
        self.holders.get() > 0 || self.release_at.get().is_some_and(|at| now < at)
    }

    /// When the trailing window closes, if one is open
    pub fn release_deadline(&self, now: Instant) -> Option<Instant> {
        self.release_at.get().filter(|at| *at > now)
    }
}

/// Scoped hold on a [`Suppression`]
#[derive(Debug)]
pub struct SuppressionGuard<'a> {
    owner: &'a Suppression,
    until: Instant,
}

impl Drop for SuppressionGuard<'_> {
    fn drop(&mut self) {
        let holders = self.owner.holders.get();
        self.owner.holders.set(holders.saturating_sub(1));
        let release_at = match self.owner.release_at.get() {
            Some(existing) if existing > self.until => existing,
            _ => self.until,
        };
        self.owner.release_at.set(Some(release_at));
    }
}
