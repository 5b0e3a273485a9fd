use std::collections::{HashSet, VecDeque};

use serde::{Deserialize, Serialize};

use crate::{
    capability::CapabilityRegistry,
    device::{ControllerCapability, DeviceCapability, DeviceId, SharedDevice},
};

/// Handle into the topology arena. Handles are never reused.
#[derive(Debug, Copy, Clone, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ElementId(pub u32);

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ElementKind {
    /// Cable segment, relays connectivity.
    Cable,
    /// Bus controller block, relays connectivity.
    Controller,
    /// Device block, a leaf of the traversal.
    Device,
}

impl ElementKind {
    fn relays(self) -> bool {
        matches!(self, ElementKind::Cable | ElementKind::Controller)
    }
}

#[derive(Debug)]
struct BusElement {
    kind: ElementKind,
    neighbors: Vec<ElementId>,
}

/// Result of walking a connected segment.
#[derive(Debug, Default)]
pub struct Discovery {
    pub controllers: Vec<ElementId>,
    pub devices: Vec<DeviceCapability>,
}

/// Arena of bus elements with adjacency lists of handles.
///
/// Edges never own anything: removing an element just drops it from its
/// neighbours' lists.
#[derive(Debug, Default)]
pub struct Topology {
    elements: Vec<Option<BusElement>>,
    capabilities: CapabilityRegistry,
    next_device_id: u64,
    changed: bool,
}

impl Topology {
    pub fn new() -> Self {
        Self::default()
    }

    fn push(&mut self, kind: ElementKind) -> ElementId {
        let id = ElementId(self.elements.len() as u32);
        self.elements.push(Some(BusElement {
            kind,
            neighbors: Vec::new(),
        }));
        self.changed = true;
        id
    }

    fn element(&self, id: ElementId) -> Option<&BusElement> {
        self.elements.get(id.0 as usize).and_then(Option::as_ref)
    }

    fn element_mut(&mut self, id: ElementId) -> Option<&mut BusElement> {
        self.elements.get_mut(id.0 as usize).and_then(Option::as_mut)
    }

    pub fn add_cable(&mut self) -> ElementId {
        self.push(ElementKind::Cable)
    }

    pub fn add_controller(&mut self) -> ElementId {
        let id = self.push(ElementKind::Controller);
        self.capabilities.insert(id, ControllerCapability);
        id
    }

    /// Installs a new device on its own element and gives it a fresh identity.
    pub fn add_device(&mut self, device: SharedDevice) -> (ElementId, DeviceId) {
        let device_id = DeviceId(self.next_device_id);
        self.next_device_id += 1;

        let element = self.push(ElementKind::Device);
        self.capabilities.insert(
            element,
            DeviceCapability {
                id: device_id,
                device,
            },
        );
        (element, device_id)
    }

    /// Exposes an already installed device through another element as well.
    /// Scans see it once.
    pub fn add_device_alias(&mut self, capability: DeviceCapability) -> ElementId {
        let element = self.push(ElementKind::Device);
        self.capabilities.insert(element, capability);
        element
    }

    pub fn kind(&self, id: ElementId) -> Option<ElementKind> {
        self.element(id).map(|e| e.kind)
    }

    pub fn neighbors(&self, id: ElementId) -> &[ElementId] {
        self.element(id)
            .map(|e| e.neighbors.as_slice())
            .unwrap_or(&[])
    }

    pub fn capabilities(&self) -> &CapabilityRegistry {
        &self.capabilities
    }

    pub fn device(&self, element: ElementId) -> Option<&DeviceCapability> {
        self.capabilities.get::<DeviceCapability>(element)
    }

    /// Connects two elements. Returns false if either is gone or they are
    /// already adjacent.
    pub fn connect(&mut self, a: ElementId, b: ElementId) -> bool {
        if a == b || self.element(a).is_none() || self.element(b).is_none() {
            return false;
        }
        if self.neighbors(a).contains(&b) {
            return false;
        }

        if let Some(e) = self.element_mut(a) {
            e.neighbors.push(b);
        }
        if let Some(e) = self.element_mut(b) {
            e.neighbors.push(a);
        }
        self.changed = true;
        true
    }

    pub fn disconnect(&mut self, a: ElementId, b: ElementId) -> bool {
        let mut removed = false;
        if let Some(e) = self.element_mut(a) {
            let before = e.neighbors.len();
            e.neighbors.retain(|n| *n != b);
            removed |= e.neighbors.len() != before;
        }
        if let Some(e) = self.element_mut(b) {
            e.neighbors.retain(|n| *n != a);
        }
        self.changed |= removed;
        removed
    }

    pub fn remove(&mut self, id: ElementId) {
        let Some(element) = self.elements.get_mut(id.0 as usize).and_then(Option::take) else {
            return;
        };
        for neighbor in element.neighbors {
            if let Some(e) = self.element_mut(neighbor) {
                e.neighbors.retain(|n| *n != id);
            }
        }
        self.capabilities.remove_all(id);
        self.changed = true;
    }

    /// Returns and clears the "topology changed since last call" flag.
    pub fn take_changed(&mut self) -> bool {
        std::mem::take(&mut self.changed)
    }

    /// Breadth-first walk of the segment containing `root`.
    ///
    /// Devices come back in discovery order, each identity once.
    pub fn discover(&self, root: ElementId) -> Discovery {
        let mut discovery = Discovery::default();
        let mut visited = HashSet::new();
        let mut seen_devices = HashSet::new();
        let mut queue = VecDeque::new();

        if self.element(root).is_none() {
            return discovery;
        }
        visited.insert(root);
        queue.push_back(root);

        while let Some(id) = queue.pop_front() {
            let Some(element) = self.element(id) else {
                continue;
            };

            if self.capabilities.has::<ControllerCapability>(id) {
                discovery.controllers.push(id);
            }
            if let Some(device) = self.capabilities.get::<DeviceCapability>(id) {
                if seen_devices.insert(device.id) {
                    discovery.devices.push(device.clone());
                }
            }

            if !element.kind.relays() {
                continue;
            }
            for neighbor in &element.neighbors {
                if visited.insert(*neighbor) {
                    queue.push_back(*neighbor);
                }
            }
        }

        tracing::trace!(
            "[TOPOLOGY] Discovered {} controller(s), {} device(s) from {:?}",
            discovery.controllers.len(),
            discovery.devices.len(),
            root
        );

        discovery
    }
}
