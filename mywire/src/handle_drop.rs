//! A guard that hands its content to a callback unless it is released
//!
//! Used by the pool to give back sessions and connection slots when an
//! await point is cancelled.
use std::{
    mem::ManuallyDrop,
    ops::{Deref, DerefMut},
};

/// Owns content and calls on_drop with it when dropped without [HandleDrop::release]
pub(crate) struct HandleDrop<T, F: FnOnce(T)> {
    /// The guarded value, present as long as on_drop is Some
    content: ManuallyDrop<T>,
    /// Called with content on drop
    on_drop: Option<F>,
}

impl<T, F: FnOnce(T)> HandleDrop<T, F> {
    /// Guard content
    pub(crate) fn new(content: T, on_drop: F) -> Self {
        Self {
            content: ManuallyDrop::new(content),
            on_drop: Some(on_drop),
        }
    }

    /// Return the content without calling on_drop
    pub(crate) fn release(mut self) -> T {
        self.on_drop = None;
        // Safety: on_drop is None so drop will not take content a second time
        unsafe { ManuallyDrop::take(&mut self.content) }
    }
}

impl<T, F: FnOnce(T)> Deref for HandleDrop<T, F> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        &self.content
    }
}

impl<T, F: FnOnce(T)> DerefMut for HandleDrop<T, F> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.content
    }
}

impl<T, F: FnOnce(T)> Drop for HandleDrop<T, F> {
    fn drop(&mut self) {
        if let Some(on_drop) = self.on_drop.take() {
            // Safety: content is present while on_drop was Some, and is not touched again
            on_drop(unsafe { ManuallyDrop::take(&mut self.content) })
        }
    }
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;

    use super::HandleDrop;

    #[test]
    fn drop_calls_back() {
        let seen = Cell::new(0);
        {
            let mut h = HandleDrop::new(5, |v| seen.set(v));
            *h += 1;
        }
        assert_eq!(seen.get(), 6);
    }

    #[test]
    fn release_skips_callback() {
        let seen = Cell::new(0);
        let h = HandleDrop::new(5, |v| seen.set(v));
        assert_eq!(h.release(), 5);
        assert_eq!(seen.get(), 0);
    }
}
