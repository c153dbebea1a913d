//! Navigation state machine over the bounded history of shown items

use std::collections::VecDeque;

use thiserror::Error;

use crate::types::ReadyItem;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("no previous item")]
pub struct NoPreviousItem;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NavState {
    /// Nothing shown
    Empty,
    /// `history[index]` is shown
    Showing,
}

/// What an `advance` did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Advance {
    /// Moved one step towards the newest history entry
    Stepped,
    /// Took the front of the ready queue
    Promoted,
    /// Nothing ready; the navigator is now empty
    Exhausted,
}

/// Recently shown items, newest at index 0, at most `keep_num + 1` long.
#[derive(Debug)]
pub struct History {
    entries: VecDeque<ReadyItem>,
    index: usize,
    state: NavState,
    keep_num: usize,
}

impl History {
    pub fn new(keep_num: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(keep_num + 1),
            index: 0,
            state: NavState::Empty,
            keep_num,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn current(&self) -> Option<&ReadyItem> {
        match self.state {
            NavState::Showing => self.entries.get(self.index),
            NavState::Empty => None,
        }
    }

    /// Apply a new history depth, dropping the oldest entries if it shrank.
    pub fn set_keep_num(&mut self, keep_num: usize) {
        self.keep_num = keep_num;
        self.evict();
        if self.index >= self.entries.len() {
            self.index = self.entries.len().saturating_sub(1);
        }
        if self.entries.is_empty() {
            self.state = NavState::Empty;
        }
    }

    fn evict(&mut self) {
        while self.entries.len() > self.keep_num + 1 {
            self.entries.pop_back();
        }
    }

    fn promote(&mut self, item: ReadyItem) {
        self.entries.push_front(item);
        self.evict();
        self.index = 0;
        self.state = NavState::Showing;
    }

    pub fn advance(&mut self, ready: &mut VecDeque<ReadyItem>) -> Advance {
        if self.index > 0 {
            self.index -= 1;
            self.state = NavState::Showing;
            Advance::Stepped
        } else if let Some(item) = ready.pop_front() {
            self.promote(item);
            Advance::Promoted
        } else {
            self.state = NavState::Empty;
            Advance::Exhausted
        }
    }

    /// Show the first ready item if nothing is shown. Returns true if it did.
    pub fn fill_if_empty(&mut self, ready: &mut VecDeque<ReadyItem>) -> bool {
        if self.state != NavState::Empty || self.index != 0 {
            return false;
        }
        match ready.pop_front() {
            Some(item) => {
                self.promote(item);
                true
            }
            None => false,
        }
    }

    pub fn back(&mut self) -> Result<(), NoPreviousItem> {
        if self.state == NavState::Empty && !self.entries.is_empty() {
            self.state = NavState::Showing;
            Ok(())
        } else if self.index + 1 < self.entries.len() {
            self.index += 1;
            self.state = NavState::Showing;
            Ok(())
        } else {
            Err(NoPreviousItem)
        }
    }
}
