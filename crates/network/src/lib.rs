//! The Network Hook (spec §4.7, expanded SPEC_FULL.md §5): per-container
//! bridge IP allocation, veth pair creation via netlink, and port-mapping
//! host rules.

mod hook;
mod netlink;
mod pool;
mod port;

pub use hook::{Attachment, NetworkHook};
pub use pool::BridgePool;
pub use port::{DefaultExecCommand as DefaultPortExecCommand, ExecCommand as PortExecCommand, PortForwarder};
