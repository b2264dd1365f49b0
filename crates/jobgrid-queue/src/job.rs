//! Job row model and descriptors

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Storage-generated job identifier
pub type JobId = i64;

/// Job priority.
///
/// Leasing orders by priority descending; `min_priority` lets a lease pass
/// restrict itself to a tier. Serializes as the same integer value the
/// PRIORITY column stores, so storage and wire frames agree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Priority {
    Low,
    Medium,
    High,
}

impl Serialize for Priority {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_i16(self.as_i16())
    }
}

impl<'de> Deserialize<'de> for Priority {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = i16::deserialize(deserializer)?;
        Priority::from_i16(value)
            .ok_or_else(|| serde::de::Error::custom(format!("invalid priority: {value}")))
    }
}

impl Priority {
    pub fn as_i16(self) -> i16 {
        match self {
            Self::Low => 0,
            Self::Medium => 1,
            Self::High => 2,
        }
    }

    pub fn from_i16(value: i16) -> Option<Self> {
        match value {
            0 => Some(Self::Low),
            1 => Some(Self::Medium),
            2 => Some(Self::High),
            _ => None,
        }
    }

    /// All priorities, highest first, for tiered lease passes.
    pub fn descending() -> [Priority; 3] {
        [Self::High, Self::Medium, Self::Low]
    }
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Low => write!(f, "low"),
            Self::Medium => write!(f, "medium"),
            Self::High => write!(f, "high"),
        }
    }
}

/// One persisted job row.
///
/// `assigned` is non-null only while some node believes it owns execution;
/// a row whose `assigned` is older than the overdue cutoff is abandoned
/// and eligible for re-lease by any node.
#[derive(Debug, Clone, PartialEq)]
pub struct Job {
    pub id: JobId,
    pub work_type: String,
    pub priority: Priority,
    /// Cost estimate used only for peer load comparison
    pub weight: i32,
    /// The job must not be leased before this time
    pub not_before: DateTime<Utc>,
    /// When a node last claimed this job
    pub assigned: Option<DateTime<Utc>>,
    /// Failed execution attempts so far
    pub failed: i32,
}

impl Job {
    pub fn descriptor(&self) -> JobDescriptor {
        JobDescriptor {
            job_id: self.id,
            priority: self.priority,
            weight: self.weight,
        }
    }
}

/// The minimal data needed to hand a job to a performer without
/// re-reading it from storage first.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct JobDescriptor {
    pub job_id: JobId,
    pub priority: Priority,
    pub weight: i32,
}

/// Everything needed to create a Job row plus its work-item row.
#[derive(Debug, Clone)]
pub struct EnqueueRequest {
    pub work_type: String,
    pub fields: serde_json::Value,
    pub not_before: DateTime<Utc>,
    pub priority: Priority,
    pub weight: i32,
}

/// One live node, keyed by hostname and port.
///
/// Rows whose `time` is older than the liveness threshold represent dead
/// nodes; their leased jobs are recovered by the overdue-cutoff reclaim.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeRecord {
    pub hostname: String,
    pub pid: i32,
    pub port: u16,
    pub time: DateTime<Utc>,
}
