//! Topology node registration.
//!
//! Nodes are registered once, before any test runs, into a [`Graph`]: a
//! static catalog of driver variants, the bus capability each consumes (with
//! edge options), and the capability names each produces. The external graph
//! engine later selects a path through the catalog, finalizes the launch
//! command from the registered fragments, and instantiates nodes bottom-up.
//!
//! Registration mistakes (duplicate node, edge on an unknown node) are
//! configuration errors and panic.

use std::collections::{BTreeMap, BTreeSet};
use std::rc::Rc;

use crate::driver::{Capability, DeviceDriver, GuestAllocator};

/// PCI slot/function address for nodes occupying an addressable slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PciAddress {
    pub devfn: u8,
}

impl PciAddress {
    pub const fn new(device: u8, function: u8) -> Self {
        Self {
            devfn: ((device & 0x1f) << 3) | (function & 0x7),
        }
    }

    pub const fn device(self) -> u8 {
        self.devfn >> 3
    }

    pub const fn function(self) -> u8 {
        self.devfn & 0x7
    }
}

/// Options attached to a consumed-capability edge.
#[derive(Debug, Clone, Default)]
pub struct EdgeOptions {
    /// Command-line fragment that must be injected before the node's device
    /// can be found.
    pub before_cmd_line: Option<String>,
    /// Extra options appended to the node's own device entry.
    pub extra_device_opts: Option<String>,
    /// Bus address, for bridge-attached nodes.
    pub pci_address: Option<PciAddress>,
}

/// Constructor registered for a driver node.
///
/// `parent` is the capability object produced by the parent node for the
/// consumed edge; `alloc` is the run-wide guest allocator, threaded
/// explicitly so instances never share module state; `addr` is the edge's
/// PCI address, if any. Construction records handles only — no hardware
/// handshake happens until [`DeviceDriver::start_hw`].
pub type NodeConstructor =
    fn(parent: Capability, alloc: Rc<dyn GuestAllocator>, addr: Option<PciAddress>) -> Box<dyn DeviceDriver>;

/// A consumed-capability edge of a registered node.
#[derive(Debug, Clone)]
pub struct ConsumedEdge {
    pub capability: String,
    pub options: EdgeOptions,
}

/// Registered driver variant: immutable once registered, lives for the
/// process lifetime.
pub struct NodeDescriptor {
    name: String,
    constructor: NodeConstructor,
    consumes: Vec<ConsumedEdge>,
    produces: BTreeSet<String>,
}

impl NodeDescriptor {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn consumes(&self) -> &[ConsumedEdge] {
        &self.consumes
    }

    pub fn produces(&self) -> &BTreeSet<String> {
        &self.produces
    }

    /// Creates a driver instance for this node, forwarding the PCI address
    /// carried by the consumed edge, if any.
    pub fn instantiate(
        &self,
        parent: Capability,
        alloc: Rc<dyn GuestAllocator>,
    ) -> Box<dyn DeviceDriver> {
        let addr = self.consumes.iter().find_map(|edge| edge.options.pci_address);
        tracing::debug!(node = %self.name, parent = ?parent, "creating driver instance");
        (self.constructor)(parent, alloc, addr)
    }

    /// Asserts that every capability this node declared as produced resolves
    /// on `driver`.
    ///
    /// Valid immediately after construction, before `start_hw`: produced
    /// capabilities are handle copies, not hardware state. A node variant
    /// whose resolution does depend on bring-up fails here instead of racing.
    pub fn verify_produces(&self, driver: &dyn DeviceDriver) {
        for capability in &self.produces {
            let _ = driver.get_driver(capability);
        }
    }
}

/// Static catalog of driver nodes and their edges.
#[derive(Default)]
pub struct Graph {
    nodes: BTreeMap<String, NodeDescriptor>,
}

impl Graph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `name` as a driver node backed by `constructor`.
    pub fn node_create_driver(&mut self, name: &str, constructor: NodeConstructor) {
        let descriptor = NodeDescriptor {
            name: name.to_owned(),
            constructor,
            consumes: Vec::new(),
            produces: BTreeSet::new(),
        };
        let previous = self.nodes.insert(name.to_owned(), descriptor);
        assert!(previous.is_none(), "driver node {name:?} registered twice");
        tracing::debug!(node = name, "registered driver node");
    }

    /// Declares that `name` consumes `capability` from its parent.
    pub fn node_consumes(&mut self, name: &str, capability: &str, options: EdgeOptions) {
        self.node_mut(name).consumes.push(ConsumedEdge {
            capability: capability.to_owned(),
            options,
        });
    }

    /// Declares that `name` produces `capability`.
    pub fn node_produces(&mut self, name: &str, capability: &str) {
        self.node_mut(name).produces.insert(capability.to_owned());
    }

    pub fn node(&self, name: &str) -> Option<&NodeDescriptor> {
        self.nodes.get(name)
    }

    pub fn nodes(&self) -> impl Iterator<Item = &NodeDescriptor> {
        self.nodes.values()
    }

    fn node_mut(&mut self, name: &str) -> &mut NodeDescriptor {
        self.nodes
            .get_mut(name)
            .unwrap_or_else(|| panic!("edge declared on unregistered node {name:?}"))
    }
}
