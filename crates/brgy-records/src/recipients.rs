//! Notification recipient resolution.
//!
//! The audience for a feature notification is the staff assigned to that
//! feature plus every ADMIN of the same staff category, mapped to their
//! person profiles.

use std::collections::HashSet;

use brgy_core::error::Result;

use crate::db::RecordsDb;
use crate::models::{ADMIN_POSITION, Staff};

/// Resolve the person ids that should receive a notification about
/// `feature_name`.
///
/// Feature-assigned staff come first, then admins; each group is ordered by
/// staff id. Person ids are unique, the excluded staff member never appears,
/// and staff without a linked person are dropped. No matching staff yields
/// an empty list.
pub fn resolve_recipients(
    db: &RecordsDb,
    feature_name: &str,
    staff_category: &str,
    exclude_staff_id: Option<&str>,
) -> Result<Vec<String>> {
    let assigned = db.feature_staff(feature_name, staff_category, exclude_staff_id)?;
    let admins = db.staff_by_position(ADMIN_POSITION, staff_category, exclude_staff_id)?;

    let recipients = union_person_ids(assigned.iter().chain(admins.iter()));
    tracing::debug!(
        "Resolved {} recipient(s) for feature '{}' ({} assigned, {} admin)",
        recipients.len(),
        feature_name,
        assigned.len(),
        admins.len()
    );
    Ok(recipients)
}

fn union_person_ids<'a>(staff: impl Iterator<Item = &'a Staff>) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut out = Vec::new();
    for member in staff {
        let Some(person_id) = member.person_id.as_deref() else {
            tracing::debug!("Staff {} has no person profile, skipped", member.staff_id);
            continue;
        };
        if seen.insert(person_id.to_string()) {
            out.push(person_id.to_string());
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seeded() -> RecordsDb {
        let db = RecordsDb::open_in_memory().unwrap();
        db.upsert_staff("S01", Some("P-ana"), "HEALTH", Some("MIDWIFE")).unwrap();
        db.upsert_staff("S02", Some("P-ben"), "HEALTH", Some("ADMIN")).unwrap();
        db.upsert_staff("S03", Some("P-cora"), "HEALTH", Some("ADMIN")).unwrap();
        db.upsert_staff("S04", None, "HEALTH", Some("BHW")).unwrap();
        db.upsert_staff("S05", Some("P-dan"), "BARANGAY", Some("ADMIN")).unwrap();
        db.assign_feature("S01", "FAMILY PLANNING").unwrap();
        db.assign_feature("S02", "FAMILY PLANNING").unwrap();
        db.assign_feature("S04", "FAMILY PLANNING").unwrap();
        db.assign_feature("S05", "FAMILY PLANNING").unwrap();
        db
    }

    #[test]
    fn test_union_assigned_then_admins() {
        let db = seeded();
        let people = resolve_recipients(&db, "FAMILY PLANNING", "HEALTH", None).unwrap();
        // S02 is both assigned and admin: listed once, in the assigned group.
        // S04 has no person profile. S05 is in another category.
        assert_eq!(people, vec!["P-ana", "P-ben", "P-cora"]);
    }

    #[test]
    fn test_excluded_staff_never_included() {
        let db = seeded();
        let people = resolve_recipients(&db, "FAMILY PLANNING", "HEALTH", Some("S02")).unwrap();
        assert_eq!(people, vec!["P-ana", "P-cora"]);
    }

    #[test]
    fn test_no_duplicates_when_staff_share_person() {
        let db = seeded();
        // A second staff account for the same person.
        db.upsert_staff("S06", Some("P-ana"), "HEALTH", Some("ADMIN")).unwrap();
        let people = resolve_recipients(&db, "FAMILY PLANNING", "HEALTH", None).unwrap();
        let unique: HashSet<&String> = people.iter().collect();
        assert_eq!(unique.len(), people.len());
        assert_eq!(people.iter().filter(|p| *p == "P-ana").count(), 1);
    }

    #[test]
    fn test_empty_when_nobody_matches() {
        let db = RecordsDb::open_in_memory().unwrap();
        let people = resolve_recipients(&db, "WASTE COLLECTION", "BARANGAY", None).unwrap();
        assert!(people.is_empty());
    }

    #[test]
    fn test_admins_only_when_feature_unassigned() {
        let db = seeded();
        let people = resolve_recipients(&db, "PRENATAL", "HEALTH", None).unwrap();
        assert_eq!(people, vec!["P-ben", "P-cora"]);
    }
}
