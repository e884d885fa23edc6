//! Test-topology composition and lifecycle for emulated virtio devices.
//!
//! The crate declares how device driver variants attach to buses
//! ([`graph`]), the uniform lifecycle each driver presents to a
//! driver-agnostic test harness ([`driver`]), and the regex templating used
//! to finalize the emulated machine's launch command ([`cmdline`]). The
//! shipped node is a 9P filesystem transport in a directly-attached and a
//! PCI-bridge-attached variant ([`nodes::virtio_9p`]).
//!
//! The graph engine that selects topology paths and drives lifecycles is an
//! external collaborator. It registers nodes once at process start,
//! finalizes the launch command from the registered fragments, instantiates
//! nodes bottom-up via [`graph::NodeDescriptor::instantiate`], calls
//! [`driver::DeviceDriver::start_hw`] exactly once per instance, and tears
//! instances down in reverse dependency order. Everything is single-threaded
//! and synchronous; every failure in this core is a contract violation that
//! fails loudly rather than degrading.

pub mod cmdline;
pub mod driver;
pub mod graph;
pub mod nodes;

pub use driver::{
    Capability, DeviceDriver, GuestAllocator, PciBus, PciDevice, VirtQueue, VirtioPciBridge,
    VirtioTransport,
};
pub use graph::{ConsumedEdge, EdgeOptions, Graph, NodeConstructor, NodeDescriptor, PciAddress};
