//! The enrolled set and enrollment file naming.
//!
//! The control loop reads a consistent snapshot once per frame; the
//! enrollment watcher swaps in a whole new set when the photo directory
//! changes. Readers never observe a partially rebuilt set.

use crate::types::EnrolledIdentity;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

/// Shared, atomically replaceable list of enrolled identities.
#[derive(Debug, Default)]
pub struct EnrollmentStore {
    current: RwLock<Arc<Vec<EnrolledIdentity>>>,
    generation: AtomicU64,
}

impl EnrollmentStore {
    pub fn new(identities: Vec<EnrolledIdentity>) -> Self {
        Self {
            current: RwLock::new(Arc::new(identities)),
            generation: AtomicU64::new(0),
        }
    }

    /// Snapshot of the enrolled set. Stays valid across later replacements.
    pub fn current_identities(&self) -> Arc<Vec<EnrolledIdentity>> {
        let guard = self.current.read().unwrap_or_else(|e| e.into_inner());
        Arc::clone(&guard)
    }

    /// Swap in a freshly built set; returns the new generation.
    pub fn replace(&self, identities: Vec<EnrolledIdentity>) -> u64 {
        let count = identities.len();
        {
            let mut guard = self.current.write().unwrap_or_else(|e| e.into_inner());
            *guard = Arc::new(identities);
        }
        let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
        tracing::info!(count, generation, "enrolled set replaced");
        generation
    }

    pub fn len(&self) -> usize {
        self.current_identities().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of replacements since startup.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }
}

/// Enrollment label for a photo named `First_Last_<id>` (extension removed).
///
/// Digits trailing the last name are disambiguators for multiple photos of
/// the same person and are dropped: `"Jane_Doe2_117"` → `"117 - Jane Doe"`.
pub fn label_from_file_stem(stem: &str) -> Option<String> {
    let mut parts = stem.split('_');
    let first = parts.next()?;
    let last = parts.next()?;
    let id = parts.next()?;
    if parts.next().is_some() {
        return None;
    }

    let last = last.trim_end_matches(|c: char| c.is_ascii_digit());
    let alphabetic = |s: &str| !s.is_empty() && s.chars().all(|c| c.is_ascii_alphabetic());
    if !alphabetic(first) || !alphabetic(last) {
        return None;
    }
    if id.is_empty() || !id.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }

    Some(format!("{id} - {first} {last}"))
}
