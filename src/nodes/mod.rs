//! Driver node implementations.

pub mod virtio_9p;
