//! Notification classification
//!
//! Turns the raw notification list of a batch into five disjoint action
//! groups keyed by tracking id:
//!
//! 1. drop notifications for ignored entity types and strip ignored keys
//! 2. drop move/update notifications left with no changed key
//! 3. split a parent change out into the `moved` group
//! 4. split a name change out into the `renamed` group
//!
//! Every group entry carries exactly one concern, so the phases never have
//! to look at a notification twice. Repeated notifications for the same
//! entity are coalesced: a removal supersedes everything else for that
//! entity, and an addition absorbs later edits because the addition phase
//! reads fresh state from the tracking tree anyway.

use crate::config::SyncConfig;
use crate::models::{ChangeAction, EntityKind, Notification, NAME_KEY, PARENT_KEY};
use std::collections::BTreeMap;

#[derive(Debug, Default, Clone, PartialEq)]
pub struct ActionGroups {
    pub removed: BTreeMap<String, Notification>,
    pub renamed: BTreeMap<String, Notification>,
    pub added: BTreeMap<String, Notification>,
    pub moved: BTreeMap<String, Notification>,
    pub updated: BTreeMap<String, Notification>,
}

impl ActionGroups {
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn len(&self) -> usize {
        self.removed.len()
            + self.renamed.len()
            + self.added.len()
            + self.moved.len()
            + self.updated.len()
    }
}

pub struct EventClassifier<'a> {
    config: &'a SyncConfig,
}

impl<'a> EventClassifier<'a> {
    pub fn new(config: &'a SyncConfig) -> Self {
        Self { config }
    }

    pub fn classify(&self, notifications: Vec<Notification>) -> ActionGroups {
        let mut groups = ActionGroups::default();

        for mut notification in notifications {
            if self.config.is_ignored_entity_type(&notification.entity_type) {
                tracing::trace!(
                    "Ignoring notification for {} of type {}",
                    notification.entity_id,
                    notification.entity_type
                );
                continue;
            }

            notification.retain_keys(|key| !self.config.is_ignored_key(key));

            if notification.entity_kind == EntityKind::Project {
                // The root is fixed; only its attributes follow the tracking tree
                if notification.action != ChangeAction::Update {
                    tracing::warn!(
                        "Ignoring {} of project root {}",
                        notification.action,
                        notification.entity_id
                    );
                    continue;
                }
                notification.retain_keys(|key| key != NAME_KEY && key != PARENT_KEY);
            }

            match notification.action {
                ChangeAction::Add | ChangeAction::Remove => {}
                ChangeAction::Move | ChangeAction::Update => {
                    if notification.changed_keys.is_empty() && notification.changes.is_empty() {
                        continue;
                    }
                }
            }

            Self::route(&mut groups, notification);
        }

        tracing::debug!(
            "Classified batch: {} removed, {} renamed, {} added, {} moved, {} updated",
            groups.removed.len(),
            groups.renamed.len(),
            groups.added.len(),
            groups.moved.len(),
            groups.updated.len()
        );
        groups
    }

    fn route(groups: &mut ActionGroups, notification: Notification) {
        let id = notification.entity_id.clone();

        match notification.action {
            ChangeAction::Remove => {
                groups.added.remove(&id);
                groups.renamed.remove(&id);
                groups.moved.remove(&id);
                groups.updated.remove(&id);
                insert_or_absorb(&mut groups.removed, notification);
            }
            ChangeAction::Add => {
                if groups.removed.contains_key(&id) {
                    return;
                }
                insert_or_absorb(&mut groups.added, notification);
            }
            ChangeAction::Move | ChangeAction::Update => {
                if groups.removed.contains_key(&id) {
                    return;
                }
                if let Some(added) = groups.added.get_mut(&id) {
                    added.absorb(notification);
                    return;
                }

                let has_key = |key: &str| {
                    notification.changed_keys.iter().any(|k| k == key)
                        || notification.changes.contains_key(key)
                };

                if has_key(PARENT_KEY) {
                    let mut moved = notification.clone();
                    moved.action = ChangeAction::Move;
                    moved.retain_keys(|key| key == PARENT_KEY);
                    insert_or_absorb(&mut groups.moved, moved);
                }

                if has_key(NAME_KEY) {
                    let mut renamed = notification.clone();
                    renamed.action = ChangeAction::Update;
                    renamed.retain_keys(|key| key == NAME_KEY);
                    insert_or_absorb(&mut groups.renamed, renamed);
                }

                let mut rest = notification;
                rest.action = ChangeAction::Update;
                rest.retain_keys(|key| key != PARENT_KEY && key != NAME_KEY);
                if !rest.changed_keys.is_empty() || !rest.changes.is_empty() {
                    insert_or_absorb(&mut groups.updated, rest);
                }
            }
        }
    }
}

fn insert_or_absorb(group: &mut BTreeMap<String, Notification>, notification: Notification) {
    match group.get_mut(&notification.entity_id) {
        Some(existing) => existing.absorb(notification),
        None => {
            group.insert(notification.entity_id.clone(), notification);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn update(id: &str) -> Notification {
        Notification::new(id, EntityKind::Node, "Shot", ChangeAction::Update)
            .with_parent("ft-seq", EntityKind::Node)
            .with_parent("ft-p", EntityKind::Project)
    }

    #[test]
    fn test_ignored_types_and_keys_are_dropped() {
        let config = SyncConfig::default();
        let groups = EventClassifier::new(&config).classify(vec![
            Notification::new("ft-s", EntityKind::Node, "Session", ChangeAction::Add),
            update("ft-1").with_change("thumbnail_id", None, Some(json!("t"))),
            update("ft-2").with_change("sync_id", None, Some(json!("e2"))),
        ]);
        assert!(groups.is_empty());
    }

    #[test]
    fn test_move_with_extra_fields_is_split() {
        let config = SyncConfig::default();
        let n = Notification::new("ft-1", EntityKind::Node, "Shot", ChangeAction::Move)
            .with_change(PARENT_KEY, Some(json!("ft-a")), Some(json!("ft-b")))
            .with_change("fps", Some(json!(24)), Some(json!(25)));

        let groups = EventClassifier::new(&config).classify(vec![n]);
        assert_eq!(groups.moved["ft-1"].changed_keys, vec![PARENT_KEY]);
        assert_eq!(groups.updated["ft-1"].changed_keys, vec!["fps"]);
        assert_eq!(groups.updated["ft-1"].action, ChangeAction::Update);
        assert!(groups.renamed.is_empty());
    }

    #[test]
    fn test_name_change_extracted_into_renamed() {
        let config = SyncConfig::default();
        let n = update("ft-7")
            .with_change(NAME_KEY, Some(json!("Seq01")), Some(json!("Seq02")))
            .with_change("frame_start", None, Some(json!(1001)));

        let groups = EventClassifier::new(&config).classify(vec![n]);
        assert_eq!(groups.renamed["ft-7"].entity_name(), Some("Seq02"));
        assert!(!groups.updated["ft-7"].changes.contains_key(NAME_KEY));
    }

    #[test]
    fn test_removal_supersedes_other_actions() {
        let config = SyncConfig::default();
        let groups = EventClassifier::new(&config).classify(vec![
            update("ft-1").with_change("fps", None, Some(json!(25))),
            Notification::new("ft-1", EntityKind::Node, "Shot", ChangeAction::Remove),
            update("ft-1").with_change(NAME_KEY, None, Some(json!("late"))),
        ]);
        assert_eq!(groups.len(), 1);
        assert!(groups.removed.contains_key("ft-1"));
    }

    #[test]
    fn test_addition_absorbs_later_edits() {
        let config = SyncConfig::default();
        let groups = EventClassifier::new(&config).classify(vec![
            Notification::new("ft-9", EntityKind::Node, "Shot", ChangeAction::Add)
                .with_parent("ft-p", EntityKind::Project),
            update("ft-9").with_change(NAME_KEY, Some(json!("a")), Some(json!("b"))),
        ]);
        assert_eq!(groups.len(), 1);
        assert_eq!(groups.added["ft-9"].entity_name(), Some("b"));
    }

    #[test]
    fn test_project_structural_changes_are_ignored() {
        let config = SyncConfig::default();
        let groups = EventClassifier::new(&config).classify(vec![
            Notification::new("ft-p", EntityKind::Project, "Project", ChangeAction::Remove),
            Notification::new("ft-p", EntityKind::Project, "Project", ChangeAction::Update)
                .with_change(NAME_KEY, Some(json!("Demo")), Some(json!("Demo2")))
                .with_change("fps", Some(json!(24)), Some(json!(25))),
        ]);
        assert!(groups.renamed.is_empty());
        assert!(groups.removed.is_empty());
        assert_eq!(groups.updated["ft-p"].changed_keys, vec!["fps"]);
    }
}
