//! Static name → constructor tables.
//!
//! Endpoint kinds, codecs, modules and proxies are selected by looking a
//! configured name up in a [`Registry`]. Entries are added by explicit
//! `register` calls when the process starts; nothing is discovered by
//! reflection and configuration strings are never evaluated.

use std::collections::BTreeMap;

/// One registered constructor.
#[derive(Debug, Clone)]
pub struct RegistryEntry<C> {
    pub name: &'static str,
    pub description: &'static str,
    pub constructor: C,
}

/// Lookup failure carrying the names that would have matched.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown {kind} '{name}' (available: {available})")]
pub struct UnknownEntry {
    pub kind: &'static str,
    pub name: String,
    pub available: String,
}

/// An ordered table of named constructors of type `C`.
#[derive(Debug, Clone)]
pub struct Registry<C> {
    kind: &'static str,
    entries: BTreeMap<&'static str, RegistryEntry<C>>,
}

impl<C> Registry<C> {
    /// Create an empty registry; `kind` names the table in error messages.
    pub fn new(kind: &'static str) -> Self {
        Self {
            kind,
            entries: BTreeMap::new(),
        }
    }

    /// Register `constructor` under `name`, replacing any earlier entry.
    pub fn register(
        &mut self,
        name: &'static str,
        description: &'static str,
        constructor: C,
    ) -> &mut Self {
        self.entries.insert(
            name,
            RegistryEntry {
                name,
                description,
                constructor,
            },
        );
        self
    }

    pub fn get(&self, name: &str) -> Option<&C> {
        self.entries.get(name).map(|e| &e.constructor)
    }

    /// Like [`get`](Self::get) but reports the available names on failure.
    pub fn lookup(&self, name: &str) -> Result<&C, UnknownEntry> {
        self.get(name).ok_or_else(|| UnknownEntry {
            kind: self.kind,
            name: name.to_string(),
            available: self.names().collect::<Vec<_>>().join(", "),
        })
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.entries.keys().copied()
    }

    pub fn entries(&self) -> impl Iterator<Item = &RegistryEntry<C>> {
        self.entries.values()
    }

    pub fn kind(&self) -> &'static str {
        self.kind
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn double(x: u32) -> u32 {
        x * 2
    }

    fn square(x: u32) -> u32 {
        x * x
    }

    #[test]
    fn lookup_calls_registered_constructor() {
        let mut reg: Registry<fn(u32) -> u32> = Registry::new("op");
        reg.register("double", "multiply by two", double)
            .register("square", "multiply by itself", square);

        assert_eq!((reg.lookup("double").unwrap())(4), 8);
        assert_eq!((reg.lookup("square").unwrap())(4), 16);
        assert_eq!(reg.names().collect::<Vec<_>>(), vec!["double", "square"]);
    }

    #[test]
    fn unknown_name_lists_alternatives() {
        let mut reg: Registry<fn(u32) -> u32> = Registry::new("op");
        reg.register("double", "", double);

        let err = reg.lookup("__import__('os')").unwrap_err();
        assert_eq!(err.kind, "op");
        assert_eq!(err.available, "double");
        assert!(err.to_string().contains("unknown op"));
    }

    #[test]
    fn re_registering_replaces_entry() {
        let mut reg: Registry<fn(u32) -> u32> = Registry::new("op");
        reg.register("f", "first", double);
        reg.register("f", "second", square);
        assert_eq!(reg.len(), 1);
        assert_eq!((reg.get("f").unwrap())(3), 9);
        assert_eq!(reg.entries().next().unwrap().description, "second");
    }
}
