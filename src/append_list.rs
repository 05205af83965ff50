use std::sync::{Mutex, PoisonError};

/// Collection many tasks append to and one reader drains once they have finished.
#[derive(Debug)]
pub struct AppendList<T> {
    items: Mutex<Vec<T>>,
}

impl<T> Default for AppendList<T> {
    fn default() -> Self {
        Self {
            items: Mutex::new(Vec::new()),
        }
    }
}

impl<T> AppendList<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&self, item: T) {
        self.items
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(item);
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.items
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Takes every item in insertion order.
    pub fn drain(&self) -> Vec<T> {
        std::mem::take(&mut *self.items.lock().unwrap_or_else(PoisonError::into_inner))
    }
}
