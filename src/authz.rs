//! Admin authorization table — built once at startup, read-only afterwards.
//!
//! Entries are chat usernames or numeric ids; `*` admits everyone. There is
//! no first-sight promotion: every admin identity is registered explicitly
//! before the table is sealed.

use std::collections::HashSet;

/// Immutable admin table.
#[derive(Debug, Clone)]
pub struct AdminRegistry {
    entries: HashSet<String>,
    wildcard: bool,
}

/// Builder for the one-time registration step.
#[derive(Debug, Default)]
pub struct AdminRegistryBuilder {
    entries: HashSet<String>,
    wildcard: bool,
}

impl AdminRegistryBuilder {
    /// Register one identity (username or numeric id as text).
    pub fn register(mut self, identity: &str) -> Self {
        let identity = identity.trim();
        if identity == "*" {
            self.wildcard = true;
        } else if !identity.is_empty() {
            self.entries.insert(identity.to_string());
        }
        self
    }

    pub fn build(self) -> AdminRegistry {
        AdminRegistry {
            entries: self.entries,
            wildcard: self.wildcard,
        }
    }
}

impl AdminRegistry {
    pub fn builder() -> AdminRegistryBuilder {
        AdminRegistryBuilder::default()
    }

    /// Build directly from configured entries.
    pub fn from_config(configured: &[String]) -> Self {
        configured
            .iter()
            .fold(Self::builder(), |b, entry| b.register(entry))
            .build()
    }

    /// Check whether any of the presented identities is an admin.
    pub fn is_admin<'a, I>(&self, identities: I) -> bool
    where
        I: IntoIterator<Item = &'a str>,
    {
        if self.wildcard {
            return true;
        }
        identities
            .into_iter()
            .any(|id| self.entries.contains(id))
    }
}
