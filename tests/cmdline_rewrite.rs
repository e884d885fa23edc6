//! Pins the exact launch-command strings produced by the local-backend
//! rewrite: text-level templating affords no structural validation, so the
//! expected output is asserted verbatim.

use devgraph::nodes::virtio_9p::{assign_local_backend, LocalBackend};
use tempfile::TempDir;

fn local_backend() -> (TempDir, LocalBackend) {
    let dir = TempDir::new().unwrap();
    let backend = LocalBackend::prepare_in(dir.path()).unwrap();
    (dir, backend)
}

#[test]
fn replaces_synth_backend_and_appends_path() {
    let (_dir, backend) = local_backend();
    let mut cmd = String::from("-fsdev synth,id=fsdev0");

    assign_local_backend(&mut cmd, &backend, None);

    assert_eq!(
        cmd,
        format!("-fsdev local,id=fsdev0,path='{}'", backend.path().display())
    );
}

#[test]
fn appends_extra_options_to_the_backend_group() {
    let (_dir, backend) = local_backend();
    let mut cmd = String::from("-fsdev synth,id=fsdev0");

    assign_local_backend(&mut cmd, &backend, Some("security_model=mapped"));

    assert_eq!(
        cmd,
        format!(
            "-fsdev local,id=fsdev0,path='{}',security_model=mapped",
            backend.path().display()
        )
    );
}

#[test]
fn rewrite_is_confined_to_the_backend_group() {
    let (_dir, backend) = local_backend();
    let mut cmd = String::from(
        "-machine q35 -fsdev synth,id=fsdev0 -device virtio-9p-pci,fsdev=fsdev0,mount_tag=qtest",
    );

    assign_local_backend(&mut cmd, &backend, None);

    assert_eq!(
        cmd,
        format!(
            "-machine q35 -fsdev local,id=fsdev0,path='{}' \
             -device virtio-9p-pci,fsdev=fsdev0,mount_tag=qtest",
            backend.path().display()
        )
    );
}

#[test]
fn leaves_a_single_backend_group_for_the_fixed_id() {
    let (_dir, backend) = local_backend();
    let mut cmd = String::from("-fsdev synth,id=fsdev0 -device virtio-9p-device,fsdev=fsdev0");

    assign_local_backend(&mut cmd, &backend, Some("writeout=immediate"));

    assert_eq!(cmd.matches("-fsdev ").count(), 1);
    assert_eq!(cmd.matches("id=fsdev0").count(), 1);
    assert!(!cmd.contains("synth"));
}
