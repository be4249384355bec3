//! Wires the Bundle Builder, Runtime Adapter, Lifecycle Controller,
//! Image/Volume/Network services, Stats Collector and Health Monitor into
//! one embeddable engine (spec §5).

mod engine;

pub use engine::{CreateContainerRequest, Engine, HealthPolicy, VolumeRequest};
