use std::fmt;

use serde::{Deserialize, Serialize};

/// Opaque identifiers. Newtypes over `String` so that operation, pool and
/// job ids cannot be accidentally swapped at call sites (the same
/// `BackupDir`/`BackupGroup`-style newtype discipline the teacher uses for
/// ids that are structurally just strings).
macro_rules! string_id {
    ($name:ident) => {
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Deserialize, Serialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_owned())
            }
        }
    };
}

string_id!(PoolId);
string_id!(OperationId);
string_id!(JobId);
string_id!(NodeId);

/// Preemption status lattice (§3, §4.9): a per-job classification derived
/// from its operation's fair-share state, never from the job itself.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum PreemptionStatus {
    NonPreemptible,
    SsdNonPreemptible,
    AggressivelyPreemptible,
    SsdAggressivelyPreemptible,
    Preemptible,
}

impl PreemptionStatus {
    /// Whether this status satisfies the minimum level a scheduling stage
    /// requires (§4.9: stage 3 accepts `>= AggressivelyPreemptible`, stage
    /// 4 accepts `>= Preemptible`). The lattice order is the enum
    /// declaration order, SSD variants sitting alongside their regular
    /// counterpart at the same rank.
    pub fn at_least(self, min: PreemptionStatus) -> bool {
        self.rank() >= min.rank()
    }

    fn rank(self) -> u8 {
        match self {
            PreemptionStatus::NonPreemptible => 0,
            PreemptionStatus::SsdNonPreemptible => 0,
            PreemptionStatus::AggressivelyPreemptible => 1,
            PreemptionStatus::SsdAggressivelyPreemptible => 1,
            PreemptionStatus::Preemptible => 2,
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum PreemptionMode {
    Normal,
    Graceful,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum StarvationStatus {
    Normal,
    BelowFairShare,
    Starving,
    AggressivelyStarving,
}

/// Coarse node/operation partition (§GLOSSARY "scheduling segment"); a
/// `module` subdivides it further (e.g. a data center).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub struct SchedulingSegment {
    pub segment: String,
    pub module: Option<String>,
}

impl SchedulingSegment {
    pub fn default_segment() -> Self {
        SchedulingSegment {
            segment: "default".to_owned(),
            module: None,
        }
    }

    pub fn compatible_with(&self, node: &SchedulingSegment) -> bool {
        self.segment == node.segment && (self.module.is_none() || self.module == node.module)
    }
}

/// A tag-filter expression matched against a node's scheduling tags.
/// Deliberately simple (conjunction of required tags) rather than a full
/// boolean-expression language, since spec.md treats tag filtering as an
/// opaque predicate and no teacher file models one.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct SchedulingTagFilter {
    pub required_tags: Vec<String>,
}

impl SchedulingTagFilter {
    pub fn matches(&self, node_tags: &[String]) -> bool {
        self.required_tags.iter().all(|t| node_tags.contains(t))
    }
}
