//! The Container entity and the Lifecycle Controller (spec §4.3), which
//! folds in the Checkpoint/Restore Manager (spec §4.4, design note OQ-2).

mod controller;
mod entity;

pub use controller::{CreateRequest, LifecycleController};
pub use entity::{
    Container, ContainerBuilder, ContainerLog, ContainerLogBuilder, ContainerStat,
    ContainerStatBuilder, ContainerStatus, LogKind, LogLevel, NetworkConfig, PortMapping,
    Protocol, ResourceLimits, Visibility, VolumeMountEntry, MAX_LOG_MESSAGE_BYTES,
};
