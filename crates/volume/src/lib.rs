//! The Volume entity and Volume Service (spec §4.7, SPEC_FULL.md §5):
//! named host-directory bind mounts with create/mount/unmount/delete.

mod entity;
mod service;

pub use entity::{Visibility, Volume, VolumeBuilder};
pub use service::{CreateRequest, MountDescriptor, VolumeService};
