use std::{
    any::{Any, TypeId},
    collections::HashMap,
};

use crate::topology::ElementId;

/// Type-indexed side table of optional capabilities per topology element.
///
/// An element is a controller, a device or both depending on which capability
/// kinds are registered for it, not on what type it is.
#[derive(Default)]
pub struct CapabilityRegistry {
    entries: HashMap<(ElementId, TypeId), Box<dyn Any>>,
}

impl CapabilityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attaches a capability, returning the one it replaced.
    pub fn insert<C: Any>(&mut self, element: ElementId, capability: C) -> Option<C> {
        self.entries
            .insert((element, TypeId::of::<C>()), Box::new(capability))
            .and_then(|old| old.downcast::<C>().ok())
            .map(|old| *old)
    }

    pub fn get<C: Any>(&self, element: ElementId) -> Option<&C> {
        self.entries
            .get(&(element, TypeId::of::<C>()))
            .and_then(|cap| cap.downcast_ref::<C>())
    }

    pub fn has<C: Any>(&self, element: ElementId) -> bool {
        self.entries.contains_key(&(element, TypeId::of::<C>()))
    }

    pub fn remove<C: Any>(&mut self, element: ElementId) -> Option<C> {
        self.entries
            .remove(&(element, TypeId::of::<C>()))
            .and_then(|old| old.downcast::<C>().ok())
            .map(|old| *old)
    }

    /// Drops every capability of an element.
    pub fn remove_all(&mut self, element: ElementId) {
        self.entries.retain(|(id, _), _| *id != element);
    }
}

impl std::fmt::Debug for CapabilityRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CapabilityRegistry")
            .field("entries", &self.entries.len())
            .finish()
    }
}
