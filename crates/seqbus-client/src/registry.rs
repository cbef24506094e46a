//! Registration identifiers.
//!
//! The registry is owned by the client instance and constructor-injected
//! where needed; there is no process-wide id state, so independent clients
//! (and tests) cannot collide.

use crate::error::{Error, Result};
use std::collections::HashSet;
use uuid::Uuid;

/// Opaque id of one consumer registration.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RegistrationId(String);

impl RegistrationId {
    /// Wrap an externally chosen id, e.g. one derived from the
    /// subscription so the same consumer resumes its own checkpoint
    /// across restarts.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The id as a string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for RegistrationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Allocates and tracks registration ids for one client instance.
#[derive(Debug, Default)]
pub struct RegistrationRegistry {
    ids: HashSet<RegistrationId>,
}

impl RegistrationRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Generate a fresh id with the given prefix and insert it.
    pub fn generate(&mut self, prefix: &str) -> RegistrationId {
        loop {
            let id = RegistrationId(format!("{}-{}", prefix, Uuid::new_v4().simple()));
            if self.ids.insert(id.clone()) {
                return id;
            }
        }
    }

    /// Insert an externally chosen id. Duplicates are a configuration
    /// error.
    pub fn insert(&mut self, id: RegistrationId) -> Result<()> {
        if !self.ids.insert(id.clone()) {
            return Err(Error::Config(format!("duplicate registration id: {id}")));
        }
        Ok(())
    }

    /// True when the id is known to this registry.
    pub fn validate(&self, id: &RegistrationId) -> bool {
        self.ids.contains(id)
    }

    /// Remove an id, e.g. after deregistration.
    pub fn remove(&mut self, id: &RegistrationId) -> bool {
        self.ids.remove(id)
    }

    /// Number of live registrations.
    pub fn len(&self) -> usize {
        self.ids.len()
    }

    /// True when no registrations exist.
    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_unique_and_validated() {
        let mut reg = RegistrationRegistry::new();
        let a = reg.generate("orders");
        let b = reg.generate("orders");
        assert_ne!(a, b);
        assert!(a.as_str().starts_with("orders-"));
        assert!(reg.validate(&a));
        assert!(reg.validate(&b));
        assert_eq!(reg.len(), 2);
    }

    #[test]
    fn test_duplicate_insert_rejected() {
        let mut reg = RegistrationRegistry::new();
        let id = reg.generate("x");
        let err = reg.insert(id.clone()).unwrap_err();
        assert!(matches!(err, Error::Config(_)));

        assert!(reg.remove(&id));
        assert!(!reg.validate(&id));
        reg.insert(id).unwrap();
    }
}
