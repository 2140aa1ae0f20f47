//! # Transition Notifiers
//!
//! Observers of state transitions. Two ordered lists exist: pre-transition
//! entries see the old state still current, post-transition entries see the
//! new one. Within a list, [`NotifierPriority::High`] entries run before
//! [`NotifierPriority::Normal`] ones, FIFO within a band.
//!
//! ## Ownership
//!
//! Entries are keyed by [`OwnerId`]. An owner may hold at most one entry per
//! list. Entries left behind at teardown are force-removed and logged as
//! leaks.

use std::fmt;
use std::sync::Arc;

use spin::RwLock;

use crate::error::{Error, Result};
use crate::event::{EventFlag, EventId};
use crate::state::State;

// =============================================================================
// Types
// =============================================================================

/// Identity of a notifier owner
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct OwnerId(pub u32);

impl fmt::Display for OwnerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Priority band (lower runs first)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum NotifierPriority {
    /// Runs before every normal entry
    High,
    /// Default band
    #[default]
    Normal,
}

/// Which side of the state write the entry observes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    /// Before the state is written
    Pre,
    /// After the state is written
    Post,
}

/// Snapshot handed to every notifier
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    /// State being left
    pub from: State,
    /// State being entered
    pub to: State,
    /// Event that caused the transition
    pub event: EventId,
    /// Flag carried by that event
    pub flag: EventFlag,
}

/// Transition observer; the implementing value is the owner's context
pub trait TransitionNotifier: Send + Sync {
    /// Called on the dispatcher thread; must not block on the dispatcher
    fn notify(&self, transition: &Transition);
}

impl<F> TransitionNotifier for F
where
    F: Fn(&Transition) + Send + Sync,
{
    fn notify(&self, transition: &Transition) {
        self(transition)
    }
}

struct Entry {
    owner: OwnerId,
    priority: NotifierPriority,
    callback: Arc<dyn TransitionNotifier>,
}

// =============================================================================
// Registry
// =============================================================================

/// Pre/post notifier lists
#[derive(Default)]
pub struct NotifierRegistry {
    pre: RwLock<Vec<Entry>>,
    post: RwLock<Vec<Entry>>,
}

impl fmt::Debug for NotifierRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NotifierRegistry")
            .field("pre", &self.owners(Phase::Pre))
            .field("post", &self.owners(Phase::Post))
            .finish()
    }
}

impl NotifierRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    fn list(&self, phase: Phase) -> &RwLock<Vec<Entry>> {
        match phase {
            Phase::Pre => &self.pre,
            Phase::Post => &self.post,
        }
    }

    /// Add an entry; rejected if `owner` already has one in this list
    pub fn register(
        &self,
        owner: OwnerId,
        callback: Arc<dyn TransitionNotifier>,
        priority: NotifierPriority,
        phase: Phase,
    ) -> Result<()> {
        let mut list = self.list(phase).write();
        if list.iter().any(|e| e.owner == owner) {
            return Err(Error::DuplicateOwner(owner));
        }

        // Insert after every entry of the same or higher priority
        let pos = list
            .iter()
            .position(|e| e.priority > priority)
            .unwrap_or(list.len());
        list.insert(pos, Entry {
            owner,
            priority,
            callback,
        });

        log::debug!(
            target: "mdfsm::notifier",
            "registered {:?} notifier {} ({:?})",
            phase,
            owner,
            priority
        );
        Ok(())
    }

    /// Remove every entry held by `owner`
    pub fn unregister(&self, owner: OwnerId) -> Result<()> {
        let mut removed = 0;
        for phase in [Phase::Pre, Phase::Post] {
            let mut list = self.list(phase).write();
            let before = list.len();
            list.retain(|e| e.owner != owner);
            removed += before - list.len();
        }
        if removed == 0 {
            return Err(Error::UnknownOwner(owner));
        }
        log::debug!(target: "mdfsm::notifier", "unregistered notifier {}", owner);
        Ok(())
    }

    /// Invoke every entry of `phase` in order
    ///
    /// Callbacks are cloned out first so a callback may (un)register.
    pub fn fire(&self, phase: Phase, transition: &Transition) -> usize {
        let callbacks: Vec<Arc<dyn TransitionNotifier>> = self
            .list(phase)
            .read()
            .iter()
            .map(|e| e.callback.clone())
            .collect();
        for cb in &callbacks {
            cb.notify(transition);
        }
        callbacks.len()
    }

    /// Number of entries in a list
    pub fn len(&self, phase: Phase) -> usize {
        self.list(phase).read().len()
    }

    /// Whether both lists are empty
    pub fn is_empty(&self) -> bool {
        self.pre.read().is_empty() && self.post.read().is_empty()
    }

    /// Owners in invocation order
    pub fn owners(&self, phase: Phase) -> Vec<OwnerId> {
        self.list(phase).read().iter().map(|e| e.owner).collect()
    }

    /// Drop every remaining entry, reporting each as a leak
    pub fn force_clear(&self) -> usize {
        let mut leaked = 0;
        for phase in [Phase::Pre, Phase::Post] {
            for entry in self.list(phase).write().drain(..) {
                log::error!(
                    target: "mdfsm::notifier",
                    "leaked {:?} notifier {} removed at teardown",
                    phase,
                    entry.owner
                );
                leaked += 1;
            }
        }
        leaked
    }
}
