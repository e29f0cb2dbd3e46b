//! Opaque, typed identity for stored values.

use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::marker::PhantomData;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// A 64-bit identity tag for a value of type `T` held in a handle map.
///
/// Handles are allocated by the map on `put` and are never reused within the
/// lifetime of that map. [`Handle::invalid`] marks a value that has not been
/// stored yet.
pub struct Handle<T> {
    value: i64,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Handle<T> {
    const INVALID: i64 = -1;

    /// Wrap a raw handle value.
    pub const fn new(value: i64) -> Self {
        Self { value, _marker: PhantomData }
    }

    /// The "not yet stored" handle.
    pub const fn invalid() -> Self {
        Self::new(Self::INVALID)
    }

    pub const fn value(self) -> i64 {
        self.value
    }

    pub const fn is_valid(self) -> bool {
        self.value >= 0
    }

    /// Reinterpret this handle as a handle to another type.
    ///
    /// Only meaningful when both types live in the same map.
    pub const fn cast<U>(self) -> Handle<U> {
        Handle::new(self.value)
    }
}

// Manual impls: derives would put bounds on `T`.

impl<T> Clone for Handle<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for Handle<T> {}

impl<T> PartialEq for Handle<T> {
    fn eq(&self, other: &Self) -> bool {
        self.value == other.value
    }
}

impl<T> Eq for Handle<T> {}

impl<T> PartialOrd for Handle<T> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<T> Ord for Handle<T> {
    fn cmp(&self, other: &Self) -> Ordering {
        self.value.cmp(&other.value)
    }
}

impl<T> Hash for Handle<T> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.value.hash(state);
    }
}

impl<T> Default for Handle<T> {
    fn default() -> Self {
        Self::invalid()
    }
}

impl<T> fmt::Debug for Handle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_valid() {
            write!(f, "Handle({})", self.value)
        } else {
            f.write_str("Handle(invalid)")
        }
    }
}

impl<T> fmt::Display for Handle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.value)
    }
}

impl<T> From<i64> for Handle<T> {
    fn from(value: i64) -> Self {
        Self::new(value)
    }
}

impl<T> Serialize for Handle<T> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_i64(self.value)
    }
}

impl<'de, T> Deserialize<'de> for Handle<T> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        i64::deserialize(deserializer).map(Self::new)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Marker;

    #[test]
    fn invalid_handle_is_minus_one() {
        let h: Handle<Marker> = Handle::invalid();
        assert_eq!(h.value(), -1);
        assert!(!h.is_valid());
        assert_eq!(Handle::<Marker>::default(), h);
    }

    #[test]
    fn handles_are_ordered_by_value() {
        let a: Handle<Marker> = Handle::new(3);
        let b: Handle<Marker> = Handle::new(10);
        assert!(a < b);
        assert_eq!(a.max(b), b);
    }

    #[test]
    fn serializes_as_bare_integer() {
        let h: Handle<Marker> = Handle::new(42);
        assert_eq!(serde_json::to_string(&h).unwrap(), "42");
        let back: Handle<Marker> = serde_json::from_str("42").unwrap();
        assert_eq!(back, h);
    }
}
