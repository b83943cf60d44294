use std::fmt;
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::error::TagNotFound;
use crate::tag::Tag;

/// A compensation waiting on the stack, as seen by [`CompensationStack::pending`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingCompensation {
    /// Registration order, starting at 1 for the first compensation.
    pub sequence: u64,
    /// Tag the compensation was pinned to, if any.
    pub tag: Option<Tag>,
}

struct Entry<A> {
    sequence: u64,
    action: A,
}

struct Group<A> {
    tag: Option<Tag>,
    entries: Vec<Entry<A>>,
}

impl<A> Group<A> {
    fn pending(&self, entry: &Entry<A>) -> PendingCompensation {
        PendingCompensation {
            sequence: entry.sequence,
            tag: self.tag.clone(),
        }
    }
}

struct State<A> {
    groups: Vec<Group<A>>,
    next_sequence: u64,
}

impl<A> State<A> {
    fn owns(&self, tag: &Tag) -> bool {
        self.groups.iter().any(|group| group.tag.as_ref() == Some(tag))
    }

    fn group_mut(&mut self, tag: &Tag) -> Option<&mut Group<A>> {
        self.groups
            .iter_mut()
            .find(|group| group.tag.as_ref() == Some(tag))
    }

    fn drop_empty_top(&mut self) {
        while self
            .groups
            .last()
            .is_some_and(|group| group.entries.is_empty())
        {
            self.groups.pop();
        }
    }
}

/// Stack of compensation groups, unwound last-in first-out.
///
/// Each group is itself a stack of actions, optionally owned by a [`Tag`].
/// Untagged registrations push a new single-action group on top. Tagged
/// registrations go into the tag's existing group wherever it sits, so they
/// roll back at the position the tag was created.
///
/// The stack synchronizes internally and can be shared between threads.
pub struct CompensationStack<A> {
    state: Mutex<State<A>>,
}

impl<A> CompensationStack<A> {
    /// Create an empty stack.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State {
                groups: Vec::new(),
                next_sequence: 1,
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, State<A>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Push an empty group owned by a fresh tag and return the tag.
    pub fn add_tag(&self, label: Option<&str>) -> Tag {
        let tag = Tag::new(label);
        self.state().groups.push(Group {
            tag: Some(tag.clone()),
            entries: Vec::new(),
        });
        tag
    }

    /// Register an action, on top of the stack or inside the tag's group.
    ///
    /// Returns the action's registration sequence number.
    ///
    /// # Errors
    ///
    /// Returns [`TagNotFound`] if no group owns `tag`.
    pub fn add_compensation(&self, action: A, tag: Option<&Tag>) -> Result<u64, TagNotFound> {
        let mut state = self.state();
        let sequence = state.next_sequence;
        let entry = Entry { sequence, action };

        match tag {
            None => state.groups.push(Group {
                tag: None,
                entries: vec![entry],
            }),
            Some(tag) => state
                .group_mut(tag)
                .ok_or_else(|| TagNotFound(tag.clone()))?
                .entries
                .push(entry),
        }

        state.next_sequence += 1;
        Ok(sequence)
    }

    /// The compensation that would run next, without removing it.
    ///
    /// Empty groups found on top are discarded along the way.
    pub fn try_peek(&self) -> Option<PendingCompensation> {
        let mut state = self.state();
        state.drop_empty_top();
        let group = state.groups.last()?;
        group.entries.last().map(|entry| group.pending(entry))
    }

    /// Remove and return the compensation that would run next.
    pub fn try_pop(&self) -> Option<(PendingCompensation, A)> {
        let mut state = self.state();
        state.drop_empty_top();
        let group = state.groups.last_mut()?;
        let entry = group.entries.pop()?;
        let pending = group.pending(&entry);
        if group.entries.is_empty() {
            state.groups.pop();
        }
        Some((pending, entry.action))
    }

    /// Put an action returned by [`CompensationStack::try_pop`] back on top,
    /// so it is the next one to run.
    ///
    /// A tagged action whose group was emptied by the pop gets its group
    /// back, which makes the tag valid again.
    pub fn restore(&self, pending: PendingCompensation, action: A) {
        let mut state = self.state();
        let entry = Entry {
            sequence: pending.sequence,
            action,
        };
        if let Some(group) = state
            .groups
            .last_mut()
            .filter(|group| group.tag.is_some() && group.tag == pending.tag)
        {
            group.entries.push(entry);
            return;
        }
        state.groups.push(Group {
            tag: pending.tag,
            entries: vec![entry],
        });
    }

    /// Discard every group and action without running anything.
    ///
    /// Returns the number of discarded actions.
    pub fn clear(&self) -> usize {
        let mut state = self.state();
        let discarded = state.groups.iter().map(|group| group.entries.len()).sum();
        state.groups.clear();
        discarded
    }

    /// Check that `tag`, if given, still owns a group.
    ///
    /// # Errors
    ///
    /// Returns [`TagNotFound`] if no group owns `tag`.
    pub fn validate_tag(&self, tag: Option<&Tag>) -> Result<(), TagNotFound> {
        match tag {
            Some(tag) if !self.state().owns(tag) => Err(TagNotFound(tag.clone())),
            _ => Ok(()),
        }
    }

    /// Pending compensations in the order they would run.
    #[must_use]
    pub fn pending(&self) -> Vec<PendingCompensation> {
        let state = self.state();
        state
            .groups
            .iter()
            .rev()
            .flat_map(|group| group.entries.iter().rev().map(|entry| group.pending(entry)))
            .collect()
    }

    /// Number of pending compensations.
    #[must_use]
    pub fn len(&self) -> usize {
        self.state()
            .groups
            .iter()
            .map(|group| group.entries.len())
            .sum()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of groups, including empty tag groups.
    #[must_use]
    pub fn group_count(&self) -> usize {
        self.state().groups.len()
    }
}

impl<A> Default for CompensationStack<A> {
    fn default() -> Self {
        Self::new()
    }
}

impl<A> fmt::Debug for CompensationStack<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompensationStack")
            .field("pending", &self.pending())
            .finish()
    }
}
