//! Hierarchical progress tracking for long-running jobs.
//!
//! A [`ProgressTracker`] owns a flat arena of items keyed by
//! caller-assigned string ids; parent/child links are ids, so nothing
//! here self-deletes behind an observer's back. Producer tasks report
//! through the tracker's methods; observers subscribe to a broadcast
//! stream of [`ProgressEvent`]s and must tolerate events from
//! different jobs interleaving.
//!
//! Completion flows upward: a parent asked to complete while children
//! are still running waits, and finishes the moment its last child is
//! removed. Cancellation flows downward and is advisory: the flag is
//! set (on every individually cancellable descendant), events are
//! emitted, and owners are expected to notice via [`ProgressTracker::is_canceled`].

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::broadcast;
use tracing::debug;

const EVENT_CAPACITY: usize = 256;

/// A change notification from the tracker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProgressEvent {
    /// A new item started being tracked.
    Added {
        /// The item's id.
        id: String,
        /// Human-readable job label.
        label: String,
        /// Id of the parent item, when nested.
        parent: Option<String>,
    },
    /// An item's progress value changed.
    Progress {
        /// The item's id.
        id: String,
        /// The new value (conventionally 0-100, stored as given).
        value: u32,
    },
    /// An item's status text changed.
    Status {
        /// The item's id.
        id: String,
        /// The new status text.
        text: String,
    },
    /// An item completed and was removed from the tracker.
    Completed {
        /// The item's id.
        id: String,
    },
    /// An item was canceled (it stays tracked until completed).
    Canceled {
        /// The item's id.
        id: String,
    },
}

#[derive(Debug)]
struct Item {
    label: String,
    status: String,
    progress: u32,
    cancellable: bool,
    canceled: bool,
    waiting_for_children: bool,
    parent: Option<String>,
    children: Vec<String>,
}

#[derive(Debug, Default)]
struct Arena {
    items: HashMap<String, Item>,
}

/// Shared progress registry; cheap to clone into producer tasks.
#[derive(Debug, Clone)]
pub struct ProgressTracker {
    arena: Arc<Mutex<Arena>>,
    events: broadcast::Sender<ProgressEvent>,
}

impl Default for ProgressTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressTracker {
    /// Creates an empty tracker.
    #[must_use]
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            arena: Arc::new(Mutex::new(Arena::default())),
            events,
        }
    }

    /// Subscribes to change notifications.
    ///
    /// A slow subscriber that falls more than the channel capacity
    /// behind observes a lag error, not a blocked producer.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<ProgressEvent> {
        self.events.subscribe()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Arena> {
        self.arena.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn emit(&self, events: Vec<ProgressEvent>) {
        for event in events {
            // Nobody listening is fine.
            let _ = self.events.send(event);
        }
    }

    /// Registers an item, linked under `parent` when given.
    ///
    /// Idempotent: an id that is already tracked is left exactly as it
    /// is and no event is emitted, so racing registrations of the same
    /// job are harmless.
    pub fn create_item(
        &self,
        parent: Option<&str>,
        id: &str,
        label: &str,
        status: &str,
        cancellable: bool,
    ) {
        let event = {
            let mut arena = self.lock();
            if arena.items.contains_key(id) {
                debug!(id, "progress item already tracked");
                None
            } else {
                let parent = parent
                    .filter(|p| arena.items.contains_key(*p))
                    .map(str::to_string);
                if let Some(parent_id) = &parent {
                    if let Some(parent_item) = arena.items.get_mut(parent_id) {
                        parent_item.children.push(id.to_string());
                    }
                }
                arena.items.insert(
                    id.to_string(),
                    Item {
                        label: label.to_string(),
                        status: status.to_string(),
                        progress: 0,
                        cancellable,
                        canceled: false,
                        waiting_for_children: false,
                        parent: parent.clone(),
                        children: Vec::new(),
                    },
                );
                debug!(id, ?parent, "progress item added");
                Some(ProgressEvent::Added {
                    id: id.to_string(),
                    label: label.to_string(),
                    parent,
                })
            }
        };
        if let Some(event) = event {
            self.emit(vec![event]);
        }
    }

    /// Stores a new progress value (unclamped; callers pass 0-100).
    pub fn set_progress(&self, id: &str, value: u32) {
        let event = {
            let mut arena = self.lock();
            arena.items.get_mut(id).map(|item| {
                item.progress = value;
                ProgressEvent::Progress {
                    id: id.to_string(),
                    value,
                }
            })
        };
        if let Some(event) = event {
            self.emit(vec![event]);
        }
    }

    /// Stores a new status text.
    pub fn set_status(&self, id: &str, text: &str) {
        let event = {
            let mut arena = self.lock();
            arena.items.get_mut(id).map(|item| {
                item.status = text.to_string();
                ProgressEvent::Status {
                    id: id.to_string(),
                    text: text.to_string(),
                }
            })
        };
        if let Some(event) = event {
            self.emit(vec![event]);
        }
    }

    /// Marks an item complete.
    ///
    /// An item without children is removed and `Completed` is emitted
    /// exactly once; calling again afterwards is a no-op. An item with
    /// live children only starts waiting: it completes (and notifies)
    /// when its last child is removed, and that may ripple further up.
    pub fn set_complete(&self, id: &str) {
        let events = {
            let mut arena = self.lock();
            let Some(item) = arena.items.get_mut(id) else {
                return;
            };
            item.progress = 100;
            if item.children.is_empty() {
                let mut events = Vec::new();
                remove_completed(&mut arena, id, &mut events);
                events
            } else {
                debug!(id, "completion deferred until children finish");
                item.waiting_for_children = true;
                Vec::new()
            }
        };
        self.emit(events);
    }

    /// Flags an item and its cancellable descendants as canceled.
    ///
    /// Idempotent per item. Children are flagged (and announced) before
    /// the item itself; a child that was created non-cancellable keeps
    /// running. Advisory only: owners poll [`Self::is_canceled`] and
    /// still call [`Self::set_complete`] when they stop.
    pub fn cancel(&self, id: &str) {
        let events = {
            let mut arena = self.lock();
            let mut canceled = Vec::new();
            cancel_recursive(&mut arena, id, true, &mut canceled);
            canceled
                .into_iter()
                .map(|id| ProgressEvent::Canceled { id })
                .collect::<Vec<_>>()
        };
        self.emit(events);
    }

    /// Whether the item has been flagged canceled.
    #[must_use]
    pub fn is_canceled(&self, id: &str) -> bool {
        self.lock().items.get(id).is_some_and(|item| item.canceled)
    }

    /// Whether the item is currently tracked.
    #[must_use]
    pub fn contains(&self, id: &str) -> bool {
        self.lock().items.contains_key(id)
    }

    /// The item's stored progress value.
    #[must_use]
    pub fn progress(&self, id: &str) -> Option<u32> {
        self.lock().items.get(id).map(|item| item.progress)
    }

    /// The item's current status text.
    #[must_use]
    pub fn status(&self, id: &str) -> Option<String> {
        self.lock().items.get(id).map(|item| item.status.clone())
    }

    /// The item's label.
    #[must_use]
    pub fn label(&self, id: &str) -> Option<String> {
        self.lock().items.get(id).map(|item| item.label.clone())
    }
}

/// Removes a finished item, detaches it from its parent, and completes
/// the parent in turn when it was only waiting for this child.
fn remove_completed(arena: &mut Arena, id: &str, events: &mut Vec<ProgressEvent>) {
    let Some(item) = arena.items.remove(id) else {
        return;
    };
    events.push(ProgressEvent::Completed { id: id.to_string() });
    debug!(id, "progress item completed");

    if let Some(parent_id) = item.parent {
        let ready = arena.items.get_mut(&parent_id).map(|parent| {
            parent.children.retain(|child| child != id);
            parent.waiting_for_children && parent.children.is_empty()
        });
        if ready == Some(true) {
            remove_completed(arena, &parent_id, events);
        }
    }
}

/// Flags the subtree canceled, children before self, honoring each
/// child's own cancellable flag. `force` lets the root of the request
/// through regardless of its flag (explicitly canceling a
/// non-cancellable item is the owner's own decision).
fn cancel_recursive(arena: &mut Arena, id: &str, force: bool, canceled: &mut Vec<String>) {
    let children = {
        let Some(item) = arena.items.get_mut(id) else {
            return;
        };
        if item.canceled || !(force || item.cancellable) {
            return;
        }
        item.canceled = true;
        item.children.clone()
    };
    for child in children {
        cancel_recursive(arena, &child, false, canceled);
    }
    canceled.push(id.to_string());
}

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::redundant_clone,
    clippy::manual_string_new,
    clippy::needless_collect,
    clippy::unreadable_literal,
    clippy::used_underscore_items,
    clippy::similar_names
)]
mod tests {
    use super::*;

    fn drain(rx: &mut broadcast::Receiver<ProgressEvent>) -> Vec<ProgressEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[tokio::test]
    async fn create_is_idempotent() {
        let tracker = ProgressTracker::new();
        let mut rx = tracker.subscribe();

        tracker.create_item(None, "job", "Sending mail", "queued", true);
        tracker.create_item(None, "job", "Different label", "other", false);

        let events = drain(&mut rx);
        assert_eq!(events.len(), 1);
        assert_eq!(tracker.label("job").as_deref(), Some("Sending mail"));
    }

    #[tokio::test]
    async fn childless_complete_notifies_exactly_once() {
        let tracker = ProgressTracker::new();
        let mut rx = tracker.subscribe();
        tracker.create_item(None, "job", "job", "", true);

        tracker.set_complete("job");
        tracker.set_complete("job");

        let completions = drain(&mut rx)
            .into_iter()
            .filter(|e| matches!(e, ProgressEvent::Completed { .. }))
            .count();
        assert_eq!(completions, 1);
        assert!(!tracker.contains("job"));
    }

    #[tokio::test]
    async fn parent_completion_waits_for_both_children() {
        let tracker = ProgressTracker::new();
        tracker.create_item(None, "all", "everything", "", true);
        tracker.create_item(Some("all"), "a", "first half", "", true);
        tracker.create_item(Some("all"), "b", "second half", "", true);
        let mut rx = tracker.subscribe();

        tracker.set_complete("all");
        assert!(tracker.contains("all"), "parent must wait for children");

        tracker.set_complete("a");
        assert!(tracker.contains("all"));

        tracker.set_complete("b");
        assert!(!tracker.contains("all"));

        let completed: Vec<String> = drain(&mut rx)
            .into_iter()
            .filter_map(|e| match e {
                ProgressEvent::Completed { id } => Some(id),
                _ => None,
            })
            .collect();
        assert_eq!(completed, ["a", "b", "all"]);
    }

    #[tokio::test]
    async fn cancel_skips_non_cancellable_children() {
        let tracker = ProgressTracker::new();
        tracker.create_item(None, "sync", "sync all", "", true);
        tracker.create_item(Some("sync"), "fetch", "fetch", "", true);
        tracker.create_item(Some("sync"), "index", "index", "", false);
        let mut rx = tracker.subscribe();

        tracker.cancel("sync");

        assert!(tracker.is_canceled("sync"));
        assert!(tracker.is_canceled("fetch"));
        assert!(!tracker.is_canceled("index"));

        // Children are announced before the item that was canceled.
        let order: Vec<String> = drain(&mut rx)
            .into_iter()
            .filter_map(|e| match e {
                ProgressEvent::Canceled { id } => Some(id),
                _ => None,
            })
            .collect();
        assert_eq!(order, ["fetch", "sync"]);
    }

    #[tokio::test]
    async fn cancel_is_idempotent_and_advisory() {
        let tracker = ProgressTracker::new();
        tracker.create_item(None, "job", "job", "", true);
        let mut rx = tracker.subscribe();

        tracker.cancel("job");
        tracker.cancel("job");
        assert_eq!(drain(&mut rx).len(), 1);

        // The canceled item still completes normally when its owner
        // winds down.
        tracker.set_complete("job");
        assert!(!tracker.contains("job"));
    }

    #[tokio::test]
    async fn progress_is_stored_unclamped() {
        let tracker = ProgressTracker::new();
        tracker.create_item(None, "job", "job", "", true);
        tracker.set_progress("job", 150);
        assert_eq!(tracker.progress("job"), Some(150));
    }

    #[tokio::test]
    async fn updates_to_unknown_ids_are_ignored() {
        let tracker = ProgressTracker::new();
        let mut rx = tracker.subscribe();
        tracker.set_progress("ghost", 10);
        tracker.set_status("ghost", "nope");
        tracker.set_complete("ghost");
        tracker.cancel("ghost");
        assert!(drain(&mut rx).is_empty());
        assert!(!tracker.is_canceled("ghost"));
    }

    #[tokio::test]
    async fn status_and_progress_events_carry_values() {
        let tracker = ProgressTracker::new();
        tracker.create_item(None, "job", "job", "queued", true);
        let mut rx = tracker.subscribe();

        tracker.set_progress("job", 40);
        tracker.set_status("job", "halfway there");

        let events = drain(&mut rx);
        assert!(events.contains(&ProgressEvent::Progress {
            id: "job".to_string(),
            value: 40
        }));
        assert!(events.contains(&ProgressEvent::Status {
            id: "job".to_string(),
            text: "halfway there".to_string()
        }));
        assert_eq!(tracker.status("job").as_deref(), Some("halfway there"));
    }
}
