//! OCI runtime specification document model and the Bundle Builder
//! (spec §4.1, component A) that turns an image rootfs plus a container
//! creation request into a bundle directory a runtime adapter can hand to
//! a runc-compatible low level runtime.

mod bundle;
mod runtime_spec;

pub use bundle::{
    copy_tree, network_namespace_path, BundleBuilder, BundleRequest, BundleRequestBuilder,
    VolumeMount,
};
pub use runtime_spec::{
    Linux, LinuxBuilder, LinuxCPU, LinuxCPUBuilder, LinuxCapabilities, LinuxCapabilitiesBuilder,
    LinuxIDMapping, LinuxIDMappingBuilder, LinuxMemory, LinuxMemoryBuilder, LinuxNamespace,
    LinuxNamespaceBuilder, LinuxNamespaceType, LinuxPids, LinuxPidsBuilder, LinuxResources,
    LinuxResourcesBuilder, Mount, MountBuilder, POSIXRlimit, POSIXRlimitBuilder, Process,
    ProcessBuilder, Root, RootBuilder, Spec, SpecBuilder, User, UserBuilder,
};
