//! Messages accepted while the socket is not open

use std::collections::VecDeque;

/// Holds outbound frames until the session is ready.
///
/// Forced frames jump ahead of ordinary ones but stay in order among
/// themselves.
#[derive(Debug)]
pub struct OfflineQueue<T> {
    items: VecDeque<(bool, T)>,
    forced: usize,
}

impl<T> Default for OfflineQueue<T> {
    fn default() -> Self {
        Self {
            items: VecDeque::new(),
            forced: 0,
        }
    }
}

impl<T> OfflineQueue<T> {
    pub fn push(&mut self, force: bool, item: T) {
        if force {
            self.items.insert(self.forced, (true, item));
            self.forced += 1;
        } else {
            self.items.push_back((false, item));
        }
    }

    /// Take everything out in send order, with each item's force flag
    pub fn drain(&mut self) -> impl Iterator<Item = (bool, T)> + '_ {
        self.forced = 0;
        self.items.drain(..)
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}
