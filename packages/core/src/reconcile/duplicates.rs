//! Duplicate-resolution sweep
//!
//! A tracking node whose name collided with a live sibling is never synced.
//! Once archival or a rename frees that name, the sweep finds such nodes,
//! creates them through the addition path and descends breadth-first into
//! their unsynced children. Task children are merged into the parent's task
//! set and never descended into.

use crate::models::ChangeAction;
use crate::reconcile::{AdditionProcessor, BatchContext, SkipReason, SyncEnv};
use crate::services::SyncError;
use crate::tracking::TrackedEntity;
use std::collections::BTreeSet;

pub struct DuplicateSweep<'a> {
    env: SyncEnv<'a>,
}

impl<'a> DuplicateSweep<'a> {
    pub fn new(env: SyncEnv<'a>) -> Self {
        Self { env }
    }

    pub async fn run(
        &self,
        ctx: &mut BatchContext,
        freed_names: BTreeSet<String>,
    ) -> Result<(), SyncError> {
        if freed_names.is_empty() {
            return Ok(());
        }

        let mut worklist: Vec<TrackedEntity> = Vec::new();
        for name in &freed_names {
            let candidates = self
                .env
                .tracking
                .query_by_name(name)
                .await
                .map_err(|e| SyncError::tracking("duplicate sweep lookup", e))?;

            for candidate in candidates {
                if candidate.is_task() || ctx.index.by_tracking_id(&candidate.id).is_some() {
                    continue;
                }
                let parent_synced = candidate
                    .parent_id
                    .as_deref()
                    .is_some_and(|parent| ctx.index.by_tracking_id(parent).is_some());
                if parent_synced {
                    worklist.push(candidate);
                }
            }
        }

        if worklist.is_empty() {
            return Ok(());
        }
        tracing::debug!(
            "Duplicate sweep: {} blocked entities for {} freed names",
            worklist.len(),
            freed_names.len()
        );

        let additions = AdditionProcessor::new(self.env);
        let mut head = 0;
        while head < worklist.len() {
            let snapshot = worklist[head].clone();
            head += 1;

            let created = match additions.create_from_snapshot(ctx, &snapshot).await {
                Ok(Some(id)) => id,
                Ok(None) => continue,
                Err(e) if e.is_entity_scoped() => {
                    tracing::warn!("Duplicate sweep skipped {}: {}", snapshot.id, e);
                    ctx.report.skip(
                        &snapshot.id,
                        ChangeAction::Add,
                        SkipReason::from_error(&e),
                        e.to_string(),
                    );
                    continue;
                }
                Err(e) => return Err(e),
            };

            let children = self
                .env
                .tracking
                .query_children(&[snapshot.id.clone()])
                .await
                .map_err(|e| SyncError::tracking("duplicate sweep descent", e))?;

            for child in children {
                if child.is_task() {
                    if let Some(tasks) = ctx.task_set(&created) {
                        tasks.insert(child.name.clone());
                    }
                } else if ctx.index.by_tracking_id(&child.id).is_none() {
                    worklist.push(child);
                }
            }
        }
        Ok(())
    }
}
