//! Driver lifecycle contract and the capability objects nodes exchange.
//!
//! Every device node presents the same shape to the driver-agnostic graph
//! engine: a registered constructor (see [`crate::graph::NodeConstructor`]),
//! an explicit hardware bring-up step, capability resolution, and an
//! explicit teardown. The engine drives all transitions; nothing here is
//! implicit or concurrent.

use std::any::Any;
use std::fmt;
use std::rc::Rc;

use crate::graph::PciAddress;

/// Sentinel feature bit no conformant device offers; cleared unconditionally
/// during feature negotiation.
pub const VIRTIO_F_BAD_FEATURE: u64 = 1 << 30;

/// Ring event-index feature. The harness does not implement event
/// suppression, so bring-up must clear it.
pub const VIRTIO_F_RING_EVENT_IDX: u64 = 1 << 29;

/// Guest memory allocator shared by every driver instance of one test run.
///
/// The framework never serializes access; the graph engine invokes lifecycle
/// operations sequentially, so implementations may use plain interior
/// mutability.
pub trait GuestAllocator {
    /// Allocates `size` bytes of guest memory, returning the guest address.
    fn alloc(&self, size: u64) -> u64;
    /// Returns a prior allocation to the pool.
    fn free(&self, addr: u64);
}

/// Handle to a virtqueue set up on a transport.
///
/// Opaque to this crate beyond identity: drivers hold it between bring-up
/// and teardown and hand it back to the transport for release.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VirtQueue {
    pub index: u16,
    pub ring_addr: u64,
}

/// Feature-negotiation and queue-setup primitives of a virtio transport.
///
/// Provided by the bus/bridge collaborator; consumed here as the opaque
/// "bus" capability. Lifetime exceeds any driver instance attached to it.
pub trait VirtioTransport {
    /// Virtio device type carried by this transport (e.g. 9 for a 9P device).
    fn device_type(&self) -> u16;
    /// Feature bits offered by the device.
    fn features(&self) -> u64;
    /// Writes back the feature bits accepted by the driver.
    fn set_features(&self, features: u64);
    /// Allocates and configures virtqueue `index` from `alloc`.
    fn setup_queue(&self, alloc: &dyn GuestAllocator, index: u16) -> VirtQueue;
    /// Releases a queue previously returned by [`Self::setup_queue`].
    fn cleanup_queue(&self, vq: VirtQueue, alloc: &dyn GuestAllocator);
    /// Signals "driver ready" to the emulated device.
    fn set_driver_ok(&self);
}

/// Identity of a device occupying an addressable PCI slot.
pub trait PciDevice {
    fn devfn(&self) -> u8;
}

/// A bridge device occupying a PCI slot and exposing a virtio transport.
///
/// Bridge-attached nodes own their bridge object and delegate to it: bridge
/// bring-up strictly precedes the node's own bring-up, and the node's
/// teardown strictly precedes the bridge's.
pub trait VirtioPciBridge {
    fn start_hw(&self);
    fn teardown(&self, alloc: &dyn GuestAllocator);
    /// The virtio transport reachable through this bridge.
    fn transport(&self) -> Rc<dyn VirtioTransport>;
    /// The slot occupant, exposed to dependents as the `pci-device` capability.
    fn pci_device(&self) -> Rc<dyn PciDevice>;
}

/// Bus capability consumed by bridge-attached nodes.
pub trait PciBus {
    /// Attaches to the bridge occupying `addr`, returning its lifecycle object.
    fn plug(&self, addr: PciAddress) -> Rc<dyn VirtioPciBridge>;
}

/// A named, typed facet a node produces for its dependents.
///
/// The facet kinds form a closed set; string names appear only at the
/// [`DeviceDriver::get_driver`] boundary. The device-family handle is the
/// one cross-cutting case kept dynamically typed: its concrete type belongs
/// to the node, and consumers downcast it.
#[derive(Clone)]
pub enum Capability {
    /// Generic virtio transport handle (pass-through of the parent bus).
    Virtio(Rc<dyn VirtioTransport>),
    /// PCI bus handle, consumed by bridge-attached nodes at construction.
    PciBus(Rc<dyn PciBus>),
    /// Device occupying a bridge slot (bridge-attached nodes only).
    PciDevice(Rc<dyn PciDevice>),
    /// Device-family protocol handle; downcast with [`Capability::downcast_device`].
    Device(Rc<dyn Any>),
}

impl Capability {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Virtio(_) => "virtio transport",
            Self::PciBus(_) => "pci bus",
            Self::PciDevice(_) => "pci device",
            Self::Device(_) => "device handle",
        }
    }

    pub fn as_virtio(&self) -> Option<Rc<dyn VirtioTransport>> {
        match self {
            Self::Virtio(transport) => Some(Rc::clone(transport)),
            _ => None,
        }
    }

    pub fn as_pci_bus(&self) -> Option<Rc<dyn PciBus>> {
        match self {
            Self::PciBus(bus) => Some(Rc::clone(bus)),
            _ => None,
        }
    }

    pub fn as_pci_device(&self) -> Option<Rc<dyn PciDevice>> {
        match self {
            Self::PciDevice(device) => Some(Rc::clone(device)),
            _ => None,
        }
    }

    pub fn downcast_device<T: 'static>(&self) -> Option<Rc<T>> {
        match self {
            Self::Device(device) => Rc::clone(device).downcast::<T>().ok(),
            _ => None,
        }
    }
}

impl fmt::Debug for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.kind())
    }
}

/// Uniform lifecycle every driver node presents to the graph engine.
///
/// State machine (all transitions engine-driven):
///
/// | state           | entered via                       |
/// |-----------------|-----------------------------------|
/// | constructed     | registered node constructor       |
/// | hardware-active | [`Self::start_hw`], exactly once  |
/// | resolvable      | implicit once constructed         |
/// | destroyed       | [`Self::teardown`], exactly once  |
///
/// Construction must not perform any hardware handshake. `start_hw` twice is
/// out of contract. Teardown happens in strict reverse dependency order
/// across a chain (leaf before its bridge's own release), after which the
/// engine makes no further calls.
pub trait DeviceDriver {
    /// Negotiates features, sets up the command queue, signals driver-ready.
    fn start_hw(&mut self);

    /// Resolves a produced capability by name.
    ///
    /// Valid any time after construction: produced capabilities are handle
    /// copies, not hardware state. Must succeed for every name the node
    /// declared as produced at registration; an unknown name is a harness
    /// configuration bug and panics with the capability and node names.
    fn get_driver(&self, capability: &str) -> Capability;

    /// Releases the command queue (and, for bridge-attached variants, the
    /// bridge's own resources).
    fn teardown(&mut self);
}
