//! The Image entity and Image Service (spec §4.7, SPEC_FULL.md §5):
//! materialized-rootfs lifecycle, external build/pull invocation, and
//! referential integrity against containers.

mod builder;
mod entity;
mod service;

pub use builder::{DefaultExecCommand, ExecCommand};
pub use entity::{Image, ImageBuilder, SourceKind, Visibility};
pub use service::{CreateRequest, ImageService, ImageSource};
