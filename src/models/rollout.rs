use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// One versioned instantiation of a config. Stored as a replication
/// controller whose annotations carry the rollout state.
pub type Rollout = k8s_openapi::api::core::v1::ReplicationController;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RolloutStatus {
    New,
    Pending,
    Running,
    Complete,
    Failed,
}

impl RolloutStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RolloutStatus::New => "New",
            RolloutStatus::Pending => "Pending",
            RolloutStatus::Running => "Running",
            RolloutStatus::Complete => "Complete",
            RolloutStatus::Failed => "Failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, RolloutStatus::Complete | RolloutStatus::Failed)
    }

    /// Status only moves forward; terminal states are final.
    pub fn can_transition_to(&self, next: RolloutStatus) -> bool {
        use RolloutStatus::*;
        match self {
            New => matches!(next, Pending | Running | Complete | Failed),
            Pending => matches!(next, Running | Complete | Failed),
            Running => matches!(next, Complete | Failed),
            Complete | Failed => false,
        }
    }
}

impl fmt::Display for RolloutStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RolloutStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "New" => Ok(RolloutStatus::New),
            "Pending" => Ok(RolloutStatus::Pending),
            "Running" => Ok(RolloutStatus::Running),
            "Complete" => Ok(RolloutStatus::Complete),
            "Failed" => Ok(RolloutStatus::Failed),
            other => Err(format!("unknown rollout status {other:?}")),
        }
    }
}
