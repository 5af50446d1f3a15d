//! Service and listener descriptors
//!
//! A service's request methods and each listener type's response methods are
//! numbered independently: request id 1 and response id 1 are unrelated. The
//! two descriptor types are kept distinct so one can never be looked up where
//! the other is meant.

use crate::protocol::MethodId;

/// Response id every listener type understands: the call failed
pub const REQUEST_FAILED: MethodId = 0;

/// Response id of [`ConfirmListener::request_processed`]
pub const REQUEST_PROCESSED: MethodId = 1;

/// Immutable name <-> id table
#[derive(Debug, Clone, Copy)]
pub struct MethodTable {
    entries: &'static [(&'static str, MethodId)],
}

impl MethodTable {
    pub const fn new(entries: &'static [(&'static str, MethodId)]) -> Self {
        Self { entries }
    }

    pub fn id_of(&self, name: &str) -> Option<MethodId> {
        self.entries
            .iter()
            .find(|(n, _)| *n == name)
            .map(|(_, id)| *id)
    }

    pub fn name_of(&self, id: MethodId) -> Option<&'static str> {
        self.entries
            .iter()
            .find(|(_, i)| *i == id)
            .map(|(n, _)| *n)
    }

    pub fn ids(&self) -> impl Iterator<Item = MethodId> + '_ {
        self.entries.iter().map(|(_, id)| *id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn check(&self, owner: &str, min_id: MethodId) -> Result<(), String> {
        for (i, (name, id)) in self.entries.iter().enumerate() {
            if *id < min_id {
                return Err(format!("{}: method {} has reserved id {}", owner, name, id));
            }
            for (other_name, other_id) in &self.entries[i + 1..] {
                if other_id == id {
                    return Err(format!(
                        "{}: {} and {} share id {}",
                        owner, name, other_name, id
                    ));
                }
                if other_name == name {
                    return Err(format!("{}: {} declared twice", owner, name));
                }
            }
        }
        Ok(())
    }
}

/// Request namespace of one service
#[derive(Debug, Clone, Copy)]
pub struct ServiceDescriptor {
    pub name: &'static str,
    pub methods: MethodTable,
}

impl ServiceDescriptor {
    pub const fn new(name: &'static str, methods: &'static [(&'static str, MethodId)]) -> Self {
        Self {
            name,
            methods: MethodTable::new(methods),
        }
    }

    pub fn method_id(&self, name: &str) -> Option<MethodId> {
        self.methods.id_of(name)
    }

    pub fn method_name(&self, id: MethodId) -> Option<&'static str> {
        self.methods.name_of(id)
    }

    /// Ids must be positive and unique, names unique
    pub fn validate(&self) -> Result<(), String> {
        self.methods.check(self.name, 1)
    }
}

/// Response namespace of one listener type. Every listener also answers to
/// the base [`REQUEST_FAILED`] outcome.
#[derive(Debug, Clone, Copy)]
pub struct ListenerDescriptor {
    pub name: &'static str,
    pub methods: MethodTable,
}

impl ListenerDescriptor {
    pub const fn new(name: &'static str, methods: &'static [(&'static str, MethodId)]) -> Self {
        Self {
            name,
            methods: MethodTable::new(methods),
        }
    }

    pub fn method_id(&self, name: &str) -> Option<MethodId> {
        self.methods
            .id_of(name)
            .or_else(|| INVOCATION_LISTENER.methods.id_of(name))
    }

    pub fn method_name(&self, id: MethodId) -> Option<&'static str> {
        self.methods
            .name_of(id)
            .or_else(|| INVOCATION_LISTENER.methods.name_of(id))
    }

    pub fn validate(&self) -> Result<(), String> {
        self.methods.check(self.name, REQUEST_FAILED + 1)
    }
}

pub const INVOCATION_LISTENER: ListenerDescriptor =
    ListenerDescriptor::new("InvocationListener", &[("request_failed", REQUEST_FAILED)]);

pub const CONFIRM_LISTENER: ListenerDescriptor =
    ListenerDescriptor::new("ConfirmListener", &[("request_processed", REQUEST_PROCESSED)]);

/// Base of every listener: the one outcome all calls may end in
pub trait InvocationListener: Send {
    fn request_failed(&mut self, cause: String);
}

/// Listener for requests whose only success outcome is "done"
pub trait ConfirmListener: InvocationListener {
    fn request_processed(&mut self);
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: ServiceDescriptor = ServiceDescriptor::new("sample", &[("one", 1), ("two", 2)]);

    #[test]
    fn test_lookup_both_ways() {
        assert_eq!(SAMPLE.method_id("two"), Some(2));
        assert_eq!(SAMPLE.method_name(1), Some("one"));
        assert_eq!(SAMPLE.method_name(3), None);
        assert!(SAMPLE.validate().is_ok());
    }

    #[test]
    fn test_duplicate_ids_rejected() {
        const BAD: ServiceDescriptor = ServiceDescriptor::new("bad", &[("a", 1), ("b", 1)]);
        assert!(BAD.validate().is_err());
    }

    #[test]
    fn test_zero_id_reserved() {
        const BAD: ServiceDescriptor = ServiceDescriptor::new("bad", &[("a", 0)]);
        assert!(BAD.validate().is_err());

        const BAD_LISTENER: ListenerDescriptor = ListenerDescriptor::new("bad", &[("a", 0)]);
        assert!(BAD_LISTENER.validate().is_err());
    }

    #[test]
    fn test_listener_falls_back_to_base() {
        assert_eq!(CONFIRM_LISTENER.method_name(REQUEST_FAILED), Some("request_failed"));
        assert_eq!(CONFIRM_LISTENER.method_name(REQUEST_PROCESSED), Some("request_processed"));
        assert_eq!(CONFIRM_LISTENER.method_id("request_failed"), Some(REQUEST_FAILED));
        assert!(CONFIRM_LISTENER.validate().is_ok());
    }
}
