//! Local copies of distributed objects

use log::info;
use shared::{ObjectEvent, ObjectId, Value};
use std::collections::HashMap;

/// Attribute values of every object the server has told us about
#[derive(Debug, Default)]
pub struct ObjectMirror {
    objects: HashMap<ObjectId, HashMap<String, Value>>,
}

impl ObjectMirror {
    pub fn new() -> Self {
        Self::default()
    }

    /// Applies an attribute change. Message events carry no state and leave
    /// the mirror untouched.
    pub fn apply(&mut self, event: &ObjectEvent) {
        match event {
            ObjectEvent::AttributeChanged {
                target_oid,
                name,
                value,
            } => {
                self.objects
                    .entry(*target_oid)
                    .or_default()
                    .insert(name.clone(), value.clone());
            }
            ObjectEvent::MessageEvent {
                target_oid, name, ..
            } => {
                info!("Message event {} on object {}", name, target_oid);
            }
        }
    }

    pub fn attribute(&self, oid: ObjectId, name: &str) -> Option<&Value> {
        self.objects.get(&oid)?.get(name)
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }
}
