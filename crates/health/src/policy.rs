use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display};

/// The restart policy the Health Monitor consults when a registered
/// container is found not running (spec §4.6).
#[derive(AsRefStr, Clone, Copy, Debug, Display, Eq, PartialEq, Serialize, Deserialize)]
#[strum(serialize_all = "kebab-case")]
#[serde(rename_all = "kebab-case")]
pub enum RestartPolicy {
    Never,
    OnFailure,
    UnlessStopped,
    Always,
}

/// One row of the in-memory registration map `{container-id →
/// {restart-policy, max-retries, retry-count}}` (spec §4.6).
#[derive(Clone, Debug)]
pub struct Registration {
    pub policy: RestartPolicy,
    pub max_retries: u32,
    pub retry_count: u32,
}

impl Registration {
    pub fn new(policy: RestartPolicy, max_retries: u32) -> Self {
        Self {
            policy,
            max_retries,
            retry_count: 0,
        }
    }
}
