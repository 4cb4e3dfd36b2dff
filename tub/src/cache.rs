//! Memo of subject-identity verdicts, owned by a tub or shared between tubs.

use std::{
    collections::HashMap,
    sync::RwLock,
};

use sturdy_common::fingerprint::Fingerprint;

/// Outcome of the subject-identity rules for one certificate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrustDecision {
    Accepted,
    Rejected(String),
}

/// Maps certificate fingerprints to their [`TrustDecision`].
///
/// Only the subject-identity verdict is cached. The fingerprint comparison
/// against a descriptor runs on every handshake regardless.
#[derive(Debug, Default)]
pub struct FingerprintCache {
    decisions: RwLock<HashMap<Fingerprint, TrustDecision>>,
}

impl FingerprintCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, fingerprint: &Fingerprint) -> Option<TrustDecision> {
        self.decisions
            .read()
            .ok()
            .and_then(|decisions| decisions.get(fingerprint).cloned())
    }

    pub fn insert(&self, fingerprint: Fingerprint, decision: TrustDecision) {
        if let Ok(mut decisions) = self.decisions.write() {
            decisions.insert(fingerprint, decision);
        }
    }

    /// Returns the cached decision, computing and storing it on a miss.
    pub fn decide<F>(&self, fingerprint: &Fingerprint, compute: F) -> TrustDecision
    where
        F: FnOnce() -> TrustDecision,
    {
        if let Some(decision) = self.get(fingerprint) {
            return decision;
        }
        let decision = compute();
        self.insert(fingerprint.clone(), decision.clone());
        decision
    }

    pub fn len(&self) -> usize {
        self.decisions.read().map(|d| d.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        if let Ok(mut decisions) = self.decisions.write() {
            decisions.clear();
        }
    }
}
