use std::sync::atomic::{AtomicU8, Ordering};

/// Lifecycle of a branch's child list.
///
/// `Materialized` is terminal. A branch that needs to be rebuilt is replaced
/// by a fresh node instead of being reset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MaterializationState {
    Unmaterialized = 0,
    Materializing = 1,
    Materialized = 2,
}

impl MaterializationState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => MaterializationState::Unmaterialized,
            1 => MaterializationState::Materializing,
            _ => MaterializationState::Materialized,
        }
    }
}

/// Atomic holder for a [`MaterializationState`].
///
/// Only [`MaterializationCell::try_begin`] may leave `Unmaterialized`, so at
/// most one thread at a time performs the fetch.
#[derive(Debug)]
pub(crate) struct MaterializationCell(AtomicU8);

impl MaterializationCell {
    pub(crate) fn new() -> Self {
        Self(AtomicU8::new(MaterializationState::Unmaterialized as u8))
    }

    pub(crate) fn get(&self) -> MaterializationState {
        MaterializationState::from_u8(self.0.load(Ordering::Acquire))
    }

    /// Claims the fetch. On failure returns the state that was observed.
    pub(crate) fn try_begin(&self) -> Result<(), MaterializationState> {
        self.0
            .compare_exchange(
                MaterializationState::Unmaterialized as u8,
                MaterializationState::Materializing as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .map(|_| ())
            .map_err(MaterializationState::from_u8)
    }

    pub(crate) fn finish(&self) {
        self.0
            .store(MaterializationState::Materialized as u8, Ordering::Release);
    }

    /// Returns a claimed cell to `Unmaterialized` after a failed fetch.
    pub(crate) fn abort(&self) {
        self.0
            .store(MaterializationState::Unmaterialized as u8, Ordering::Release);
    }
}
