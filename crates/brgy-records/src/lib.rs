//! # brgy-records
//!
//! Health-records side of the barangay maintenance jobs.
//!
//! - [`reconciler`] flips stale pending follow-up visits to missed.
//! - [`recipients`] resolves who should hear about a feature event.
//! - [`dispatch`] drains the notification outbox to a webhook or the log.
//!
//! All state lives in one SQLite file behind [`db::RecordsDb`].

pub mod db;
pub mod dispatch;
pub mod models;
pub mod notify;
pub mod reconciler;
pub mod recipients;

pub use db::{RecordsDb, StaleScan};
pub use dispatch::{DispatchReport, NotifyTarget, dispatch_pending, target_from_config};
pub use models::{FollowUpStatus, FollowUpVisit, PatientRecord, Staff};
pub use notify::{NewNotification, Notification, NotifyPriority};
pub use reconciler::{FollowUpReconciler, MissedNotice, ReconcileReport};
pub use recipients::resolve_recipients;
