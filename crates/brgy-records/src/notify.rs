//! Notification model: messages addressed to resolved person ids,
//! persisted as an outbox and delivered by the dispatch job.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::{FollowUpVisit, PatientRecord};

/// Notification priority.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum NotifyPriority {
    Low,
    Normal,
    High,
    Urgent,
}

impl NotifyPriority {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotifyPriority::Low => "low",
            NotifyPriority::Normal => "normal",
            NotifyPriority::High => "high",
            NotifyPriority::Urgent => "urgent",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "low" => NotifyPriority::Low,
            "high" => NotifyPriority::High,
            "urgent" => NotifyPriority::Urgent,
            _ => NotifyPriority::Normal,
        }
    }
}

/// Outbox delivery state.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryStatus {
    Pending,
    Sent,
    Failed,
}

impl DeliveryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeliveryStatus::Pending => "pending",
            DeliveryStatus::Sent => "sent",
            DeliveryStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "sent" => DeliveryStatus::Sent,
            "failed" => DeliveryStatus::Failed,
            _ => DeliveryStatus::Pending,
        }
    }
}

/// A notification not yet written to the outbox.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewNotification {
    pub title: String,
    pub message: String,
    /// Routing tag, e.g. "followup_missed".
    pub notif_type: String,
    /// Which job or actor produced it.
    pub source: String,
    pub priority: NotifyPriority,
}

/// A persisted notification with its recipients.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Notification {
    pub id: i64,
    pub title: String,
    pub message: String,
    pub notif_type: String,
    pub source: String,
    pub priority: NotifyPriority,
    pub status: DeliveryStatus,
    pub attempts: u32,
    pub last_error: Option<String>,
    pub channel: Option<String>,
    pub created_at: DateTime<Utc>,
    pub sent_at: Option<DateTime<Utc>>,
    /// Person ids, in resolution order.
    pub recipients: Vec<String>,
}

impl NewNotification {
    pub fn new(title: &str, message: &str, notif_type: &str, source: &str) -> Self {
        Self {
            title: title.to_string(),
            message: message.to_string(),
            notif_type: notif_type.to_string(),
            source: source.to_string(),
            priority: NotifyPriority::Normal,
        }
    }

    pub fn with_priority(mut self, priority: NotifyPriority) -> Self {
        self.priority = priority;
        self
    }

    /// Notice sent to staff when a follow-up visit is marked missed.
    pub fn missed_followup(visit: &FollowUpVisit, record: &PatientRecord) -> Self {
        let description = if visit.description.is_empty() {
            String::new()
        } else {
            format!(" ({})", visit.description)
        };
        Self::new(
            "Missed follow-up visit",
            &format!(
                "Patient {} did not return for the {} follow-up scheduled on {}{}.",
                record.patient_id, record.record_type, visit.scheduled_date, description
            ),
            "followup_missed",
            "followup-reconcile",
        )
        .with_priority(NotifyPriority::High)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::FollowUpStatus;
    use chrono::NaiveDate;

    #[test]
    fn test_missed_followup_message() {
        let visit = FollowUpVisit {
            id: 7,
            patrec_id: 3,
            scheduled_date: NaiveDate::from_ymd_opt(2026, 10, 12).unwrap(),
            status: FollowUpStatus::Missed,
            description: "Pill refill".into(),
            completed_at: None,
            created_at: Utc::now(),
        };
        let record = PatientRecord {
            id: 3,
            patient_id: "PAT-0001".into(),
            record_type: "Family Planning".into(),
            created_at: Utc::now(),
        };

        let n = NewNotification::missed_followup(&visit, &record);
        assert_eq!(n.priority, NotifyPriority::High);
        assert_eq!(n.notif_type, "followup_missed");
        assert!(n.message.contains("PAT-0001"));
        assert!(n.message.contains("2026-10-12"));
        assert!(n.message.contains("(Pill refill)"));
    }

    #[test]
    fn test_priority_parse_falls_back_to_normal() {
        assert_eq!(NotifyPriority::parse("urgent"), NotifyPriority::Urgent);
        assert_eq!(NotifyPriority::parse("???"), NotifyPriority::Normal);
        assert_eq!(DeliveryStatus::parse("sent"), DeliveryStatus::Sent);
    }
}
