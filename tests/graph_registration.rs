//! Registration-time behavior: the node catalog built by the 9P module and
//! the backing-directory side effect.

use devgraph::graph::{EdgeOptions, Graph, PciAddress};
use devgraph::nodes::virtio_9p::{
    register_nodes_in, LocalBackend, LocalBackendError, Virtio9pDevice, Virtio9pPci, FSDEV_ID,
    MOUNT_TAG,
};
use tempfile::TempDir;

#[test]
fn registers_both_node_variants_with_their_edges() {
    let dir = TempDir::new().unwrap();
    let mut graph = Graph::new();
    let backend = register_nodes_in(&mut graph, dir.path()).unwrap();

    assert_eq!(backend.path(), dir.path().join(LocalBackend::DIR_NAME));

    let device = graph.node(Virtio9pDevice::NODE_NAME).expect("registered");
    let [edge] = device.consumes() else {
        panic!("virtio-9p-device consumes exactly one capability");
    };
    assert_eq!(edge.capability, "virtio-bus");
    assert_eq!(
        edge.options.before_cmd_line.as_deref(),
        Some(format!("-fsdev synth,id={FSDEV_ID}").as_str())
    );
    assert_eq!(
        edge.options.extra_device_opts.as_deref(),
        Some(format!("fsdev={FSDEV_ID},mount_tag={MOUNT_TAG}").as_str())
    );
    assert_eq!(edge.options.pci_address, None);
    assert!(device.produces().contains("virtio"));
    assert!(device.produces().contains("virtio-9p"));
    assert!(!device.produces().contains("pci-device"));

    let pci = graph.node(Virtio9pPci::NODE_NAME).expect("registered");
    let [edge] = pci.consumes() else {
        panic!("virtio-9p-pci consumes exactly one capability");
    };
    assert_eq!(edge.capability, "pci-bus");
    assert_eq!(edge.options.pci_address, Some(PciAddress::new(4, 0)));
    assert!(edge
        .options
        .extra_device_opts
        .as_deref()
        .unwrap()
        .contains("addr=04.0"));
    assert!(pci.produces().contains("pci-device"));
    assert!(pci.produces().contains("virtio"));
    assert!(pci.produces().contains("virtio-9p"));
}

#[test]
fn backing_directory_is_reused_across_runs() {
    let dir = TempDir::new().unwrap();

    let mut first = Graph::new();
    register_nodes_in(&mut first, dir.path()).unwrap();

    // A second registration pass (fresh catalog, same working directory)
    // finds the directory already present and succeeds.
    let mut second = Graph::new();
    let backend = register_nodes_in(&mut second, dir.path()).unwrap();
    assert!(backend.path().is_dir());
}

#[test]
fn file_occupying_the_backing_path_is_fatal() {
    let dir = TempDir::new().unwrap();
    std::fs::write(dir.path().join(LocalBackend::DIR_NAME), b"not a directory").unwrap();

    // `unwrap_err` formats the Ok side on failure, so this also pins
    // `LocalBackend: Debug`.
    let err = LocalBackend::prepare_in(dir.path()).unwrap_err();
    assert!(matches!(err, LocalBackendError::NotADirectory { .. }));

    let mut graph = Graph::new();
    assert!(register_nodes_in(&mut graph, dir.path()).is_err());
}

#[test]
#[should_panic(expected = "registered twice")]
fn duplicate_node_registration_panics() {
    let mut graph = Graph::new();
    graph.node_create_driver(Virtio9pDevice::NODE_NAME, Virtio9pDevice::create);
    graph.node_create_driver(Virtio9pDevice::NODE_NAME, Virtio9pDevice::create);
}

#[test]
#[should_panic(expected = "unregistered node")]
fn edge_on_unknown_node_panics() {
    let mut graph = Graph::new();
    graph.node_consumes("virtio-9p-device", "virtio-bus", EdgeOptions::default());
}
