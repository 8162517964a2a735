//! `Option`-backed default for types with no natural default, used to park a
//! value in a struct field until ownership is handed off to a spawned
//! thread.

/// Wraps a `T` so the owning struct can `#[derive(Default)]` even though `T`
/// itself has no `Default` impl. [`DefaultWrapper::take`] consumes the
/// value; calling it twice is a bug in the caller, not a runtime condition.
pub struct DefaultWrapper<T>(Option<T>);

impl<T> DefaultWrapper<T> {
    pub fn new(value: T) -> Self {
        Self(Some(value))
    }

    /// Takes the wrapped value. Panics if already taken.
    pub fn take(&mut self) -> T {
        self.0.take().expect("DefaultWrapper: value already taken")
    }

    pub fn is_some(&self) -> bool {
        self.0.is_some()
    }
}

impl<T> Default for DefaultWrapper<T> {
    fn default() -> Self {
        Self(None)
    }
}

impl<T> From<T> for DefaultWrapper<T> {
    fn from(value: T) -> Self {
        Self::new(value)
    }
}
