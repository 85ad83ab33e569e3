//! Attribute update phase
//!
//! Flat keys are staged as direct writes. Hierarchical keys are only marked
//! dirty; the hierarchy cleanup resolves them once ancestry is final.

use crate::models::{ChangeAction, EntityUpdate, Notification};
use crate::reconcile::{BatchContext, SkipReason, SyncEnv};
use crate::services::SyncError;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};

pub struct AttributeUpdateProcessor<'a> {
    env: SyncEnv<'a>,
}

impl<'a> AttributeUpdateProcessor<'a> {
    pub fn new(env: SyncEnv<'a>) -> Self {
        Self { env }
    }

    pub async fn run(
        &self,
        ctx: &mut BatchContext,
        updated: BTreeMap<String, Notification>,
    ) -> Result<(), SyncError> {
        for notification in updated.values() {
            if notification.is_task() {
                continue;
            }

            let Some(entity_id) = ctx
                .index
                .by_tracking_id(&notification.entity_id)
                .map(|entity| entity.id.clone())
            else {
                tracing::debug!(
                    "Updated tracking entity {} is not synced",
                    notification.entity_id
                );
                ctx.report.skip(
                    &notification.entity_id,
                    ChangeAction::Update,
                    SkipReason::NotSynced,
                    "",
                );
                continue;
            };

            let keys: BTreeSet<&String> = notification
                .changed_keys
                .iter()
                .chain(notification.changes.keys())
                .collect();

            let mut update = EntityUpdate::new();
            for key in keys {
                if self.env.config.is_hierarchical(key) {
                    ctx.mark_dirty(&entity_id, key);
                    continue;
                }
                match notification.changes.get(key) {
                    Some(change) => {
                        let value = change.new.clone().unwrap_or(Value::Null);
                        update = update.with_attribute(key.clone(), value);
                    }
                    None => {
                        tracing::debug!(
                            "No value for changed key '{}' on {}",
                            key,
                            notification.entity_id
                        );
                    }
                }
            }

            if ctx.stage_update(&entity_id, update) {
                ctx.report.mark_updated(&entity_id);
            }
        }
        Ok(())
    }
}
