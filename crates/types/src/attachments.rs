//! Typed, open-ended request attachments.

use std::{
    any::{Any, TypeId},
    collections::HashMap,
    fmt,
    sync::Arc,
};

/// Type-indexed map of values carried alongside a request.
///
/// Pipeline stages use attachments for out-of-band routing hints. Each type
/// holds at most one value. Cloning is cheap; inserting into a shared map
/// copies it first.
#[derive(Clone, Default)]
pub struct Attachments {
    values: Arc<HashMap<TypeId, Arc<dyn Any + Send + Sync>>>,
}

impl Attachments {
    /// Creates an empty attachment map.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the value of type `T`, if present.
    #[must_use]
    pub fn get<T: Any + Send + Sync>(&self) -> Option<&T> {
        self.values.get(&TypeId::of::<T>()).and_then(|value| value.downcast_ref::<T>())
    }

    /// Returns true if a value of type `T` is present.
    #[must_use]
    pub fn contains<T: Any + Send + Sync>(&self) -> bool {
        self.values.contains_key(&TypeId::of::<T>())
    }

    /// Inserts a value, replacing any previous value of the same type.
    pub fn insert<T: Any + Send + Sync>(&mut self, value: T) {
        Arc::make_mut(&mut self.values).insert(TypeId::of::<T>(), Arc::new(value));
    }

    /// Removes the value of type `T`, returning whether one was present.
    pub fn remove<T: Any + Send + Sync>(&mut self) -> bool {
        if !self.contains::<T>() {
            return false;
        }
        Arc::make_mut(&mut self.values).remove(&TypeId::of::<T>()).is_some()
    }

    /// Number of attached values.
    #[must_use]
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Returns true if nothing is attached.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Returns true if both maps share the same storage.
    #[must_use]
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.values, &other.values)
    }
}

impl fmt::Debug for Attachments {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Attachments").field("len", &self.values.len()).finish()
    }
}
