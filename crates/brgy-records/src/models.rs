//! Record types read and written by the maintenance jobs.

use std::fmt;
use std::str::FromStr;

use brgy_core::error::BrgyError;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

/// Position that always receives feature notifications within its category.
pub const ADMIN_POSITION: &str = "ADMIN";

/// Follow-up visit status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FollowUpStatus {
    Pending,
    Scheduled,
    Completed,
    Missed,
}

impl FollowUpStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            FollowUpStatus::Pending => "pending",
            FollowUpStatus::Scheduled => "scheduled",
            FollowUpStatus::Completed => "completed",
            FollowUpStatus::Missed => "missed",
        }
    }
}

impl fmt::Display for FollowUpStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FollowUpStatus {
    type Err = BrgyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "pending" => Ok(FollowUpStatus::Pending),
            "scheduled" => Ok(FollowUpStatus::Scheduled),
            "completed" => Ok(FollowUpStatus::Completed),
            "missed" => Ok(FollowUpStatus::Missed),
            other => Err(BrgyError::Database(format!("unknown follow-up status '{other}'"))),
        }
    }
}

/// A scheduled check-in owed by a patient.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FollowUpVisit {
    pub id: i64,
    /// Owning patient record.
    pub patrec_id: i64,
    pub scheduled_date: NaiveDate,
    pub status: FollowUpStatus,
    pub description: String,
    pub completed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// Groups encounters of one patient under a record type
/// ("Family Planning", "Prenatal", ...).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PatientRecord {
    pub id: i64,
    pub patient_id: String,
    pub record_type: String,
    pub created_at: DateTime<Utc>,
}

/// Any clinical record created for a patient (FP record, new encounter, ...).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DomainEvent {
    pub id: i64,
    pub patient_id: String,
    pub kind: String,
    pub created_at: DateTime<Utc>,
}

/// Staff member as seen by notification routing.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Staff {
    pub staff_id: String,
    /// Linked person profile; staff without one cannot be notified.
    pub person_id: Option<String>,
    /// Staff type, e.g. "HEALTH" or "BARANGAY".
    pub category: String,
    pub position: Option<String>,
}
