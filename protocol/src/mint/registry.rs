//! In-memory mirror of the spent registry plus the set of secrets locked by
//! an in-flight melt.
//!
//! The ledger keeps exactly one of these behind a mutex. It is only ever
//! written after the matching storage write has succeeded, so it can lag
//! the database but never run ahead of it.

use std::collections::HashSet;

use crate::types::ProofState;

#[derive(Debug, Default)]
pub struct Registry {
    spent: HashSet<String>,
    pending: HashSet<String>,
}

impl Registry {
    pub fn new<S, P>(spent: S, pending: P) -> Self
    where
        S: IntoIterator<Item = String>,
        P: IntoIterator<Item = String>,
    {
        Self {
            spent: spent.into_iter().collect(),
            pending: pending.into_iter().collect(),
        }
    }

    pub fn state(&self, secret: &str) -> ProofState {
        if self.spent.contains(secret) {
            ProofState::Spent
        } else if self.pending.contains(secret) {
            ProofState::Pending
        } else {
            ProofState::Unspent
        }
    }

    pub fn is_spent(&self, secret: &str) -> bool {
        self.spent.contains(secret)
    }

    pub fn mark_pending<'a>(&mut self, secrets: impl IntoIterator<Item = &'a str>) {
        self.pending.extend(secrets.into_iter().map(str::to_string));
    }

    /// Drop pending locks without spending. Spent secrets stay spent.
    pub fn release<'a>(&mut self, secrets: impl IntoIterator<Item = &'a str>) {
        for secret in secrets {
            self.pending.remove(secret);
        }
    }

    pub fn mark_spent<'a>(&mut self, secrets: impl IntoIterator<Item = &'a str>) {
        for secret in secrets {
            self.pending.remove(secret);
            self.spent.insert(secret.to_string());
        }
    }

    pub fn spent_count(&self) -> usize {
        self.spent.len()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }
}
