//! Small shared utilities.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::sync::atomic::{AtomicU64, Ordering};

/// An `f64` cell that can be mutated through a shared reference.
///
/// Backs the mutable numeric fields (`spend`, `ecpm`) of entities that live
/// inside an otherwise immutable catalog snapshot, so per-entity accounting
/// writes never clone or re-publish the snapshot.
#[derive(Debug, Default)]
pub struct AtomicF64(AtomicU64);

impl AtomicF64 {
    pub fn new(value: f64) -> Self {
        Self(AtomicU64::new(value.to_bits()))
    }

    pub fn get(&self) -> f64 {
        f64::from_bits(self.0.load(Ordering::Relaxed))
    }

    pub fn set(&self, value: f64) {
        self.0.store(value.to_bits(), Ordering::Relaxed);
    }

    /// Add `delta` and return the new value. Compare-and-swap loop since the
    /// bits of an f64 sum cannot be formed with a single fetch_add.
    pub fn add(&self, delta: f64) -> f64 {
        let mut current = self.0.load(Ordering::Relaxed);
        loop {
            let next = (f64::from_bits(current) + delta).to_bits();
            match self
                .0
                .compare_exchange_weak(current, next, Ordering::Relaxed, Ordering::Relaxed)
            {
                Ok(_) => return f64::from_bits(next),
                Err(observed) => current = observed,
            }
        }
    }
}

impl Clone for AtomicF64 {
    fn clone(&self) -> Self {
        Self::new(self.get())
    }
}

impl From<f64> for AtomicF64 {
    fn from(value: f64) -> Self {
        Self::new(value)
    }
}

impl Serialize for AtomicF64 {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(self.get())
    }
}

impl<'de> Deserialize<'de> for AtomicF64 {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        f64::deserialize(deserializer).map(Self::new)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_get_set_add() {
        let cell = AtomicF64::new(1.5);
        assert_eq!(cell.get(), 1.5);

        cell.set(3.0);
        assert_eq!(cell.get(), 3.0);

        let new = cell.add(0.25);
        assert_eq!(new, 3.25);
        assert_eq!(cell.get(), 3.25);
    }

    #[test]
    fn test_serde_round_trip() {
        let cell = AtomicF64::new(12.75);
        let json = serde_json::to_string(&cell).expect("serialize");
        assert_eq!(json, "12.75");

        let back: AtomicF64 = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back.get(), 12.75);
    }
}
