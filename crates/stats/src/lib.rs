//! The Stats Collector (spec §4.5): periodic cgroup telemetry sampling
//! and count-based retention pruning for `ContainerStat` records.

mod cgroup;
mod collector;

pub use collector::StatsCollector;
