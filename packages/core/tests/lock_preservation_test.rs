//! Lock Preservation and Inheritance Tests
//!
//! Entities with published downstream work are locked: a batch may never
//! change their id, name or parent. Structural edits against them are
//! rejected by writing the project database's state back onto the tracking
//! tree.
//!
//! ## Test Coverage
//! - Removal of a locked entity recreates it in the tracking tree, once
//! - Rename and move of a locked entity are written back
//! - A failed write-back is reported and leaves the entity untouched
//! - Hierarchical attributes over a 3-level chain with an intermediate override
//! - A move re-inherits hierarchical attributes from the new parent

#[cfg(test)]
mod lock_preservation_tests {
    use anyhow::Result;
    use serde_json::json;
    use std::sync::Arc;
    use treesync_core::db::{EntityStore, MemoryStore};
    use treesync_core::models::{ChangeAction, Entity, EntityKind, Notification, NAME_KEY, PARENT_KEY};
    use treesync_core::reconcile::SkipReason;
    use treesync_core::services::SyncService;
    use treesync_core::tracking::{MemoryTrackingTree, TrackedEntity, TrackingTree};
    use treesync_core::SyncConfig;

    /// Demo / Ep01 / Seq01 / sh010 plus a second episode Ep02
    async fn setup() -> Result<(Arc<MemoryStore>, Arc<MemoryTrackingTree>, SyncService)> {
        let project = Entity::new_project("Demo", "ft-p")
            .with_id("p")
            .with_attribute("fps", json!(24));
        let ep = Entity::new_child("Ep01", "Episode", &project, "ft-ep")
            .with_id("ep")
            .with_attribute("fps", json!(24));
        let ep2 = Entity::new_child("Ep02", "Episode", &project, "ft-ep2")
            .with_id("ep2")
            .with_attribute("fps", json!(30));
        let seq = Entity::new_child("Seq01", "Sequence", &ep, "ft-seq")
            .with_id("seq")
            .with_attribute("fps", json!(24));
        let mut shot = Entity::new_child("sh010", "Shot", &seq, "ft-sh")
            .with_id("sh")
            .with_attribute("fps", json!(24))
            .with_attribute("comment", json!("hero"));
        shot.tasks.insert("comp".to_string());

        let tracked = vec![
            TrackedEntity::new("ft-p", "Demo", EntityKind::Project, "Project", None)
                .with_attribute("auto_sync", json!(true))
                .with_attribute("fps", json!(24)),
            TrackedEntity::new("ft-ep", "Ep01", EntityKind::Node, "Episode", Some("ft-p")),
            TrackedEntity::new("ft-ep2", "Ep02", EntityKind::Node, "Episode", Some("ft-p"))
                .with_attribute("fps", json!(30)),
            TrackedEntity::new("ft-seq", "Seq01", EntityKind::Node, "Sequence", Some("ft-ep")),
            TrackedEntity::new("ft-sh", "sh010", EntityKind::Node, "Shot", Some("ft-seq"))
                .with_attribute("comment", json!("hero")),
        ];

        let store = Arc::new(MemoryStore::with_entities(vec![project, ep, ep2, seq, shot]));
        let tracking = Arc::new(MemoryTrackingTree::with_entities(tracked));
        let service = SyncService::new(store.clone(), tracking.clone(), SyncConfig::default())?;
        Ok((store, tracking, service))
    }

    fn node(id: &str, entity_type: &str, action: ChangeAction, ancestry: &[&str]) -> Notification {
        let mut notification = Notification::new(id, EntityKind::Node, entity_type, action);
        for parent in ancestry {
            let kind = if *parent == "ft-p" {
                EntityKind::Project
            } else {
                EntityKind::Node
            };
            notification = notification.with_parent(*parent, kind);
        }
        notification
    }

    async fn stored(store: &MemoryStore, id: &str) -> Result<Entity> {
        store
            .get(id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("entity {} missing", id))
    }

    #[tokio::test]
    async fn test_locked_removal_recreates_tracking_node() -> Result<()> {
        let (store, tracking, service) = setup().await?;
        store.mark_published("sh").await;
        tracking.remove("ft-sh").await;

        let report = service
            .process_batch(vec![node(
                "ft-sh",
                "Shot",
                ChangeAction::Remove,
                &["ft-seq", "ft-ep", "ft-p"],
            )])
            .await?;

        assert_eq!(report.recreated, vec!["sh"]);
        assert!(report.archived.is_empty());

        let shot = stored(&store, "sh").await?;
        assert!(!shot.archived);
        assert_eq!(shot.name, "sh010");
        assert_eq!(shot.parent_id.as_deref(), Some("seq"));
        assert!(shot.tasks.contains("comp"));

        let new_tid = shot.tracking_id.clone().unwrap();
        assert_ne!(new_tid, "ft-sh");
        let recreated = tracking.get(&new_tid).await.unwrap();
        assert_eq!(recreated.name, "sh010");
        assert_eq!(recreated.parent_id.as_deref(), Some("ft-seq"));
        assert_eq!(recreated.attributes.get("comment"), Some(&json!("hero")));
        assert_eq!(recreated.attributes.get("sync_id"), Some(&json!("sh")));
        // Inherited values are not copied onto the recreated node
        assert!(!recreated.attributes.contains_key("fps"));

        let children = tracking.query_children(&[new_tid]).await?;
        assert_eq!(children.len(), 1);
        assert_eq!(children[0].name, "comp");
        Ok(())
    }

    #[tokio::test]
    async fn test_replayed_locked_removal_recreates_once() -> Result<()> {
        let (store, tracking, service) = setup().await?;
        store.mark_published("sh").await;
        tracking.remove("ft-sh").await;
        let batch = vec![node(
            "ft-sh",
            "Shot",
            ChangeAction::Remove,
            &["ft-seq", "ft-ep", "ft-p"],
        )];

        let first = service.process_batch(batch.clone()).await?;
        assert_eq!(first.recreated, vec!["sh"]);
        let new_tid = stored(&store, "sh").await?.tracking_id.unwrap();
        let writes = store.bulk_write_count();

        let replay = service.process_batch(batch).await?;
        assert!(replay.recreated.is_empty());
        assert_eq!(replay.operations, 0);
        assert_eq!(store.bulk_write_count(), writes);

        let shot = stored(&store, "sh").await?;
        assert_eq!(shot.tracking_id.as_deref(), Some(new_tid.as_str()));
        assert!(!shot.archived);
        assert_eq!(tracking.query_children(&["ft-seq".to_string()]).await?.len(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_locked_rename_is_written_back() -> Result<()> {
        let (store, tracking, service) = setup().await?;
        store.mark_published("sh").await;

        let report = service
            .process_batch(vec![node("ft-seq", "Sequence", ChangeAction::Update, &["ft-ep", "ft-p"])
                .with_change(NAME_KEY, Some(json!("Seq01")), Some(json!("Seq99")))])
            .await?;

        assert_eq!(report.skips(SkipReason::Locked), 1);
        assert_eq!(stored(&store, "seq").await?.name, "Seq01");
        assert_eq!(tracking.get("ft-seq").await.unwrap().name, "Seq01");
        assert_eq!(store.bulk_write_count(), 0);
        Ok(())
    }

    #[tokio::test]
    async fn test_locked_move_is_written_back() -> Result<()> {
        let (store, tracking, service) = setup().await?;
        store.mark_published("sh").await;

        let report = service
            .process_batch(vec![node("ft-seq", "Sequence", ChangeAction::Move, &["ft-ep2", "ft-p"])
                .with_change(PARENT_KEY, Some(json!("ft-ep")), Some(json!("ft-ep2")))])
            .await?;

        assert_eq!(report.skips(SkipReason::Locked), 1);
        let seq = stored(&store, "seq").await?;
        assert_eq!(seq.parent_id.as_deref(), Some("ep"));
        assert_eq!(
            tracking.get("ft-seq").await.unwrap().parent_id.as_deref(),
            Some("ft-ep")
        );
        Ok(())
    }

    #[tokio::test]
    async fn test_failed_write_back_is_reported() -> Result<()> {
        let (store, tracking, service) = setup().await?;
        store.mark_published("sh").await;
        tracking.set_fail_commits(true);

        let report = service
            .process_batch(vec![node("ft-sh", "Shot", ChangeAction::Update, &["ft-seq", "ft-ep", "ft-p"])
                .with_change(NAME_KEY, Some(json!("sh010")), Some(json!("sh011")))])
            .await?;

        assert_eq!(report.skips(SkipReason::WriteBackFailed), 1);
        assert_eq!(stored(&store, "sh").await?.name, "sh010");
        assert!(tracking.committed_writes().await.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_changeable_siblings_of_locked_entity_still_move() -> Result<()> {
        let (store, _tracking, service) = setup().await?;
        store.mark_published("ep2").await;

        // ep2 is locked, but moving seq under it only touches seq
        let report = service
            .process_batch(vec![node("ft-seq", "Sequence", ChangeAction::Move, &["ft-ep2", "ft-p"])
                .with_change(PARENT_KEY, Some(json!("ft-ep")), Some(json!("ft-ep2")))])
            .await?;

        assert_eq!(report.moved, vec!["seq"]);
        let seq = stored(&store, "seq").await?;
        assert_eq!(seq.parent_id.as_deref(), Some("ep2"));
        assert_eq!(seq.ancestor_names, vec!["Ep02"]);

        // The moved subtree re-inherits from Ep02
        assert_eq!(seq.attributes.get("fps"), Some(&json!(30)));
        let shot = stored(&store, "sh").await?;
        assert_eq!(shot.ancestor_names, vec!["Ep02", "Seq01"]);
        assert_eq!(shot.attributes.get("fps"), Some(&json!(30)));
        Ok(())
    }

    #[tokio::test]
    async fn test_three_level_inheritance_with_intermediate_override() -> Result<()> {
        let (store, tracking, service) = setup().await?;

        let mut seq = tracking.get("ft-seq").await.unwrap();
        seq.attributes.insert("fps".to_string(), json!(25));
        tracking.insert(seq).await;
        service
            .process_batch(vec![node("ft-seq", "Sequence", ChangeAction::Update, &["ft-ep", "ft-p"])
                .with_change("fps", None, Some(json!(25)))])
            .await?;

        let fps = |entity: Entity| entity.attributes.get("fps").cloned();
        assert_eq!(fps(stored(&store, "ep").await?), Some(json!(24)));
        assert_eq!(fps(stored(&store, "seq").await?), Some(json!(25)));
        assert_eq!(fps(stored(&store, "sh").await?), Some(json!(25)));

        // A new project default flows to Ep01 but stops at the Seq01 override
        let mut project = tracking.get("ft-p").await.unwrap();
        project.attributes.insert("fps".to_string(), json!(48));
        tracking.insert(project).await;
        service
            .process_batch(vec![Notification::new(
                "ft-p",
                EntityKind::Project,
                "Project",
                ChangeAction::Update,
            )
            .with_change("fps", Some(json!(24)), Some(json!(48)))])
            .await?;

        assert_eq!(fps(stored(&store, "p").await?), Some(json!(48)));
        assert_eq!(fps(stored(&store, "ep").await?), Some(json!(48)));
        assert_eq!(fps(stored(&store, "ep2").await?), Some(json!(30)));
        assert_eq!(fps(stored(&store, "seq").await?), Some(json!(25)));
        assert_eq!(fps(stored(&store, "sh").await?), Some(json!(25)));
        Ok(())
    }
}
