//! 9P filesystem transport node, in two attachment variants.
//!
//! [`Virtio9pDevice`] attaches directly to a generic virtio bus;
//! [`Virtio9pPci`] attaches through a virtio-over-PCI bridge occupying a bus
//! address, delegating every lifecycle operation to the bridge on the way up
//! and on the way down. Both variants share the protocol-facing
//! [`Virtio9p`] handle that dependents resolve as the `virtio-9p`
//! capability. The wire protocol itself is out of scope here: this module
//! prepares the channel, it never speaks 9P.

use std::any::Any;
use std::cell::Cell;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::rc::Rc;

use thiserror::Error;

use crate::cmdline::regex_replace;
use crate::driver::{
    Capability, DeviceDriver, GuestAllocator, VirtQueue, VirtioPciBridge, VirtioTransport,
    VIRTIO_F_BAD_FEATURE, VIRTIO_F_RING_EVENT_IDX,
};
use crate::graph::{EdgeOptions, Graph, PciAddress};

pub const VIRTIO_DEVICE_TYPE_9P: u16 = 9;

/// Mount tag the 9P device exports to the guest.
pub const MOUNT_TAG: &str = "qtest";

/// Fixed fsdev id referenced by the registered command-line fragments.
pub const FSDEV_ID: &str = "fsdev0";

/// Protocol-facing state shared between a node object and its dependents.
///
/// Holds the parent transport handle (borrowed from the bus collaborator,
/// whose lifetime exceeds the instance) and the command queue between
/// bring-up and teardown.
pub struct Virtio9p {
    transport: Rc<dyn VirtioTransport>,
    vq: Cell<Option<VirtQueue>>,
}

impl Virtio9p {
    fn new(transport: Rc<dyn VirtioTransport>) -> Rc<Self> {
        Rc::new(Self {
            transport,
            vq: Cell::new(None),
        })
    }

    pub fn transport(&self) -> Rc<dyn VirtioTransport> {
        Rc::clone(&self.transport)
    }

    /// Command queue, present between bring-up and teardown.
    pub fn queue(&self) -> Option<VirtQueue> {
        self.vq.get()
    }

    /// Hardware bring-up: negotiate features, set up queue 0, signal ready.
    fn setup(&self, alloc: &dyn GuestAllocator) {
        let features =
            self.transport.features() & !(VIRTIO_F_BAD_FEATURE | VIRTIO_F_RING_EVENT_IDX);
        self.transport.set_features(features);
        self.vq.set(Some(self.transport.setup_queue(alloc, 0)));
        self.transport.set_driver_ok();
    }

    /// Returns the command queue to the allocator.
    fn cleanup(&self, alloc: &dyn GuestAllocator) {
        if let Some(vq) = self.vq.take() {
            self.transport.cleanup_queue(vq, alloc);
        }
    }

    /// Capabilities common to both variants: the node's own protocol handle
    /// and the pass-through of the parent transport.
    fn resolve(this: &Rc<Self>, node: &str, capability: &str) -> Capability {
        match capability {
            "virtio-9p" => Capability::Device(Rc::clone(this) as Rc<dyn Any>),
            "virtio" => Capability::Virtio(Rc::clone(&this.transport)),
            other => panic!("capability {other:?} not present in {node}"),
        }
    }
}

/// Directly-attached variant: the parent is the generic virtio bus.
pub struct Virtio9pDevice {
    v9p: Rc<Virtio9p>,
    alloc: Rc<dyn GuestAllocator>,
}

impl Virtio9pDevice {
    pub const NODE_NAME: &'static str = "virtio-9p-device";

    pub fn create(
        parent: Capability,
        alloc: Rc<dyn GuestAllocator>,
        _addr: Option<PciAddress>,
    ) -> Box<dyn DeviceDriver> {
        let transport = parent.as_virtio().unwrap_or_else(|| {
            panic!(
                "{}: parent must be a virtio transport, got {parent:?}",
                Self::NODE_NAME
            )
        });
        Box::new(Self {
            v9p: Virtio9p::new(transport),
            alloc,
        })
    }
}

impl DeviceDriver for Virtio9pDevice {
    fn start_hw(&mut self) {
        self.v9p.setup(self.alloc.as_ref());
    }

    fn get_driver(&self, capability: &str) -> Capability {
        Virtio9p::resolve(&self.v9p, Self::NODE_NAME, capability)
    }

    fn teardown(&mut self) {
        self.v9p.cleanup(self.alloc.as_ref());
    }
}

/// Bridge-attached variant: the parent is a PCI bus, and the node reaches
/// its transport through the bridge occupying the registered slot.
pub struct Virtio9pPci {
    v9p: Rc<Virtio9p>,
    bridge: Rc<dyn VirtioPciBridge>,
    alloc: Rc<dyn GuestAllocator>,
}

impl Virtio9pPci {
    pub const NODE_NAME: &'static str = "virtio-9p-pci";

    pub fn create(
        parent: Capability,
        alloc: Rc<dyn GuestAllocator>,
        addr: Option<PciAddress>,
    ) -> Box<dyn DeviceDriver> {
        let bus = parent.as_pci_bus().unwrap_or_else(|| {
            panic!(
                "{}: parent must be a pci bus, got {parent:?}",
                Self::NODE_NAME
            )
        });
        let addr = addr
            .unwrap_or_else(|| panic!("{}: consumed edge carries no PCI address", Self::NODE_NAME));
        let bridge = bus.plug(addr);
        let transport = bridge.transport();
        assert_eq!(
            transport.device_type(),
            VIRTIO_DEVICE_TYPE_9P,
            "{}: bridge slot does not carry a 9P device",
            Self::NODE_NAME
        );
        Box::new(Self {
            v9p: Virtio9p::new(transport),
            bridge,
            alloc,
        })
    }
}

impl DeviceDriver for Virtio9pPci {
    fn start_hw(&mut self) {
        // Bridge bring-up strictly precedes the node's own.
        self.bridge.start_hw();
        self.v9p.setup(self.alloc.as_ref());
    }

    fn get_driver(&self, capability: &str) -> Capability {
        if capability == "pci-device" {
            return Capability::PciDevice(self.bridge.pci_device());
        }
        Virtio9p::resolve(&self.v9p, Self::NODE_NAME, capability)
    }

    fn teardown(&mut self) {
        // Own queue first, then the bridge's resources.
        self.v9p.cleanup(self.alloc.as_ref());
        self.bridge.teardown(self.alloc.as_ref());
    }
}

/// Environment failures while preparing the `local` backend's backing store.
///
/// All of these are fatal at registration time: they surface before any test
/// executes rather than misconfiguring a run silently.
#[derive(Debug, Error)]
pub enum LocalBackendError {
    #[error("cannot resolve working directory: {0}")]
    WorkingDir(#[source] io::Error),
    #[error("cannot create 9P backing directory {path:?}: {source}")]
    Create {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("9P backing path {path:?} exists but is not a directory")]
    NotADirectory { path: PathBuf },
}

/// Backing store for the `local` filesystem backend.
#[derive(Debug)]
pub struct LocalBackend {
    path: PathBuf,
}

impl LocalBackend {
    /// Directory name, fixed relative to the process working directory.
    pub const DIR_NAME: &'static str = "qtest-9p-local";

    /// Prepares the backing directory under the working directory.
    pub fn prepare() -> Result<Self, LocalBackendError> {
        let cwd = std::env::current_dir().map_err(LocalBackendError::WorkingDir)?;
        Self::prepare_in(&cwd)
    }

    /// Prepares the backing directory under `base`. Re-runs reuse an
    /// existing directory; a non-directory at the path is an error.
    pub fn prepare_in(base: &Path) -> Result<Self, LocalBackendError> {
        let path = base.join(Self::DIR_NAME);
        match fs::create_dir(&path) {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::AlreadyExists => {}
            Err(source) => return Err(LocalBackendError::Create { path, source }),
        }
        // The path may have pre-existed the create call; it must actually be
        // a directory.
        let metadata = fs::metadata(&path).map_err(|source| LocalBackendError::Create {
            path: path.clone(),
            source,
        })?;
        if !metadata.is_dir() {
            return Err(LocalBackendError::NotADirectory { path });
        }
        tracing::info!(path = %path.display(), "9P local backing directory ready");
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Rewrites the launch command to use the `local` filesystem backend.
///
/// Replaces the synthetic placeholder backend of the registered
/// `before_cmd_line` fragment with the local-directory backend, appends the
/// resolved `path=` option to the backend's option group, and appends
/// `extra_args` to the same group when supplied. The buffer afterwards
/// contains a single backend group of the form
/// `-fsdev local,id=fsdev0,path='<dir>'[,<extra_args>]`.
pub fn assign_local_backend(cmd_line: &mut String, backend: &LocalBackend, extra_args: Option<&str>) {
    // Replace the 'synth' placeholder backend with the 'local' backend.
    regex_replace(cmd_line, "-fsdev synth,", "-fsdev local,");

    // Append 'path=...' to the '-fsdev ...' option group.
    regex_replace(
        cmd_line,
        r"(-fsdev \w[^ ]*)",
        &format!("${{1}},path='{}'", backend.path().display()),
    );

    let Some(args) = extra_args else {
        return;
    };

    // Append the passed args to the '-fsdev ...' option group.
    regex_replace(cmd_line, r"(-fsdev \w[^ ]*)", &format!("${{1}},{args}"));
}

/// Registers both 9P node variants into `graph` and prepares the local
/// backing store under the process working directory.
pub fn register_nodes(graph: &mut Graph) -> Result<LocalBackend, LocalBackendError> {
    let cwd = std::env::current_dir().map_err(LocalBackendError::WorkingDir)?;
    register_nodes_in(graph, &cwd)
}

/// Same as [`register_nodes`], with the backing store rooted at `base`.
pub fn register_nodes_in(graph: &mut Graph, base: &Path) -> Result<LocalBackend, LocalBackendError> {
    // The 'local' backend needs its directory before any machine boots.
    let backend = LocalBackend::prepare_in(base)?;

    let before_cmd_line = format!("-fsdev synth,id={FSDEV_ID}");

    graph.node_create_driver(Virtio9pDevice::NODE_NAME, Virtio9pDevice::create);
    graph.node_consumes(
        Virtio9pDevice::NODE_NAME,
        "virtio-bus",
        EdgeOptions {
            before_cmd_line: Some(before_cmd_line.clone()),
            extra_device_opts: Some(format!("fsdev={FSDEV_ID},mount_tag={MOUNT_TAG}")),
            pci_address: None,
        },
    );
    graph.node_produces(Virtio9pDevice::NODE_NAME, "virtio");
    graph.node_produces(Virtio9pDevice::NODE_NAME, "virtio-9p");

    graph.node_create_driver(Virtio9pPci::NODE_NAME, Virtio9pPci::create);
    graph.node_consumes(
        Virtio9pPci::NODE_NAME,
        "pci-bus",
        EdgeOptions {
            before_cmd_line: Some(before_cmd_line),
            extra_device_opts: Some(format!("fsdev={FSDEV_ID},addr=04.0,mount_tag={MOUNT_TAG}")),
            pci_address: Some(PciAddress::new(4, 0)),
        },
    );
    graph.node_produces(Virtio9pPci::NODE_NAME, "pci-device");
    graph.node_produces(Virtio9pPci::NODE_NAME, "virtio");
    graph.node_produces(Virtio9pPci::NODE_NAME, "virtio-9p");

    Ok(backend)
}
