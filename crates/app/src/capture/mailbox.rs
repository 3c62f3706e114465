//! Single-slot overwrite channels.
//!
//! A `Mailbox` holds at most one unread value: writers replace whatever is
//! there, readers consume it. Slow consumers therefore only ever see the most
//! recent value. `StatsHub` keeps one mailbox per named consumer so the
//! recording loop can fan a snapshot out without knowing who listens.

use std::{
    collections::BTreeMap,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use crate::capture::stats::StatsSnapshot;

/// Consumer name for the operator dashboard (`/get_stats`).
pub const DASHBOARD: &str = "dashboard";
/// Consumer name for the embedded UI (`/get_stats_user_interface`).
pub const USER_INTERFACE: &str = "ui";

#[derive(Debug)]
pub struct Mailbox<T> {
    slot: Mutex<Option<T>>,
}

impl<T> Default for Mailbox<T> {
    fn default() -> Self {
        Self {
            slot: Mutex::new(None),
        }
    }
}

impl<T> Mailbox<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store `value`, discarding any unread one.
    pub fn put(&self, value: T) {
        *self.lock() = Some(value);
    }

    /// Remove and return the pending value.
    pub fn take(&self) -> Option<T> {
        self.lock().take()
    }

    pub fn clear(&self) {
        self.lock().take();
    }

    fn lock(&self) -> MutexGuard<'_, Option<T>> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<T: Clone> Mailbox<T> {
    /// Copy of the pending value without consuming it.
    pub fn peek(&self) -> Option<T> {
        self.lock().clone()
    }
}

/// Registry of per-consumer statistics mailboxes.
#[derive(Clone, Debug)]
pub struct StatsHub {
    boxes: Arc<BTreeMap<String, Mailbox<StatsSnapshot>>>,
}

impl Default for StatsHub {
    fn default() -> Self {
        Self::with_consumers([DASHBOARD, USER_INTERFACE])
    }
}

impl StatsHub {
    pub fn with_consumers<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let boxes = names
            .into_iter()
            .map(|name| (name.into(), Mailbox::new()))
            .collect();
        Self {
            boxes: Arc::new(boxes),
        }
    }

    pub fn consumers(&self) -> impl Iterator<Item = &str> {
        self.boxes.keys().map(String::as_str)
    }

    /// Overwrite every consumer's slot with `snapshot`.
    pub fn publish(&self, snapshot: &StatsSnapshot) {
        for mailbox in self.boxes.values() {
            mailbox.put(snapshot.clone());
        }
    }

    pub fn clear_all(&self) {
        for mailbox in self.boxes.values() {
            mailbox.clear();
        }
    }

    /// Consume the pending snapshot for `consumer`. Unknown names read as empty.
    pub fn take(&self, consumer: &str) -> Option<StatsSnapshot> {
        self.boxes.get(consumer).and_then(Mailbox::take)
    }
}

#[cfg(test)]
mod tests {
    use std::{path::Path, time::Duration};

    use super::*;
    use crate::capture::stats::FolderSizeSample;

    fn snapshot(count: u64) -> StatsSnapshot {
        StatsSnapshot::new(
            count,
            Duration::from_secs(1),
            1.0,
            Path::new("/tmp/photos"),
            true,
            FolderSizeSample::default(),
        )
    }

    #[test]
    fn second_write_overwrites_first() {
        let mailbox = Mailbox::new();
        mailbox.put(1);
        mailbox.put(2);
        assert_eq!(mailbox.take(), Some(2));
        assert_eq!(mailbox.take(), None);
    }

    #[test]
    fn empty_mailbox_reads_empty() {
        let mailbox: Mailbox<u8> = Mailbox::new();
        assert_eq!(mailbox.take(), None);
        mailbox.put(4);
        assert_eq!(mailbox.peek(), Some(4));
        mailbox.clear();
        assert_eq!(mailbox.peek(), None);
    }

    #[test]
    fn consumers_are_independent() {
        let hub = StatsHub::default();
        hub.publish(&snapshot(1));
        hub.publish(&snapshot(2));
        assert_eq!(hub.take(DASHBOARD).map(|s| s.count), Some(2));
        assert_eq!(hub.take(DASHBOARD), None);
        assert_eq!(hub.take(USER_INTERFACE).map(|s| s.count), Some(2));
        assert_eq!(hub.take("nobody"), None);
    }

    #[test]
    fn clear_all_empties_every_slot() {
        let hub = StatsHub::with_consumers(["a", "b", "c"]);
        assert_eq!(hub.consumers().collect::<Vec<_>>(), ["a", "b", "c"]);
        hub.publish(&snapshot(5));
        hub.clear_all();
        assert!(hub.consumers().all(|name| hub.take(name).is_none()));
    }
}
