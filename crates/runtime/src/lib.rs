//! Runtime Adapter (spec §4.2, component B): a thin, stateless wrapper
//! around the external runc-compatible and CRIU-compatible binaries. All
//! container lifecycle state lives in the caller's process-table and
//! persisted records, never here.

mod adapter;

pub use adapter::{
    DefaultExecCommand, ExecCommand, RuntimeAdapter, RuntimeAdapterBuilder, RuntimeState,
    RuntimeStatus, CHECKPOINT_TIMEOUT, LAUNCH_TIMEOUT, SHORT_TIMEOUT,
};
