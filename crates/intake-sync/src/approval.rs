//! Review decisions on queued items and promotion into production relations.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use intake_core::{ContentKind, ProductionRecord, QueueRecord, QueueStatus, ReviewAction, Row};
use intake_storage::{DataStore, Filter, StoreError};
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApprovalRequest {
    pub item_id: Uuid,
    pub action: ReviewAction,
    pub reviewed_by: String,
    #[serde(default)]
    pub notes: Option<String>,
    #[serde(default)]
    pub rejection_reason: Option<String>,
}

impl ApprovalRequest {
    pub fn new(item_id: Uuid, action: ReviewAction, reviewed_by: impl Into<String>) -> Self {
        Self {
            item_id,
            action,
            reviewed_by: reviewed_by.into(),
            notes: None,
            rejection_reason: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApprovalResult {
    pub item_id: Uuid,
    pub kind: ContentKind,
    pub previous_status: QueueStatus,
    pub status: QueueStatus,
    pub production_id: Option<String>,
    pub reviewed_at: DateTime<Utc>,
}

#[derive(Debug, Error)]
pub enum ApprovalError {
    #[error("queue item {0} not found")]
    NotFound(Uuid),
    #[error("cannot {action} an item that is {from}")]
    InvalidTransition { from: QueueStatus, action: ReviewAction },
    #[error(transparent)]
    Storage(#[from] StoreError),
    #[error("queue item {id} is unreadable: {reason}")]
    Corrupt { id: String, reason: String },
}

fn corrupt(id: impl ToString, err: serde_json::Error) -> ApprovalError {
    ApprovalError::Corrupt {
        id: id.to_string(),
        reason: err.to_string(),
    }
}

fn by_id(id: impl ToString) -> Filter {
    Filter::all().eq("id", id.to_string())
}

/// Looks the id up in every kind's queue relation.
pub async fn find_queue_item(store: &dyn DataStore, item_id: Uuid) -> Result<QueueRecord, ApprovalError> {
    for kind in ContentKind::ALL {
        if let Some(row) = store
            .select(kind.queue_table(), &by_id(item_id), &[])
            .await?
            .into_iter()
            .next()
        {
            return QueueRecord::from_row(row).map_err(|e| corrupt(item_id, e));
        }
    }
    Err(ApprovalError::NotFound(item_id))
}

async fn current_status(store: &dyn DataStore, record: &QueueRecord) -> Result<QueueStatus, ApprovalError> {
    let rows = store
        .select(record.kind.queue_table(), &by_id(record.id), &["status"])
        .await?;
    let status = rows
        .into_iter()
        .next()
        .and_then(|mut row| row.remove("status"))
        .ok_or(ApprovalError::NotFound(record.id))?;
    serde_json::from_value(status).map_err(|e| corrupt(record.id, e))
}

/// Copies the record into production. Returns the production id and whether this call inserted it.
async fn promote(
    store: &dyn DataStore,
    record: &QueueRecord,
    approved_by: &str,
    approved_at: DateTime<Utc>,
) -> Result<(Option<String>, bool), ApprovalError> {
    let table = record.kind.production_table();
    let row = ProductionRecord::promote(record, approved_by, approved_at)
        .to_row()
        .map_err(|e| corrupt(record.id, e))?;
    match store.insert(table, row).await {
        Ok(inserted) => Ok((id_of(&inserted), true)),
        Err(err) if err.is_unique_violation() => {
            info!(item_id = %record.id, url_key = %record.url_key, "production row already present; reusing it");
            let existing = store
                .select(table, &Filter::all().eq("url_key", record.url_key.as_str()), &["id"])
                .await?;
            Ok((existing.first().and_then(id_of), false))
        }
        Err(err) => Err(err.into()),
    }
}

fn id_of(row: &Row) -> Option<String> {
    row.get("id").and_then(|v| v.as_str()).map(str::to_string)
}

async fn undo_promotion(store: &dyn DataStore, kind: ContentKind, production_id: Option<&str>) {
    let Some(id) = production_id else { return };
    if let Err(err) = store.delete(kind.production_table(), &by_id(id)).await {
        warn!(production_id = %id, error = %err, "failed to remove production row after lost update");
    }
}

/// Applies a review action. Terminal items never change; on approve the
/// production copy is made before the status moves, and a failed copy leaves
/// the queue row untouched.
pub async fn process_approval(
    store: &dyn DataStore,
    request: &ApprovalRequest,
) -> Result<ApprovalResult, ApprovalError> {
    let record = find_queue_item(store, request.item_id).await?;
    let next = record
        .status
        .transition(request.action)
        .ok_or(ApprovalError::InvalidTransition {
            from: record.status,
            action: request.action,
        })?;
    let now = Utc::now();

    let (production_id, inserted_here) = if request.action == ReviewAction::Approve {
        promote(store, &record, &request.reviewed_by, now).await?
    } else {
        (None, false)
    };

    let mut patch = Row::new();
    patch.insert("status".into(), json!(next));
    patch.insert("reviewed_by".into(), json!(request.reviewed_by));
    patch.insert("reviewed_at".into(), json!(now));
    patch.insert("updated_at".into(), json!(now));
    if let Some(notes) = &request.notes {
        patch.insert("reviewer_notes".into(), json!(notes));
    }
    if request.action == ReviewAction::Reject {
        if let Some(reason) = &request.rejection_reason {
            patch.insert("rejection_reason".into(), json!(reason));
        }
    }

    let guard = by_id(record.id).eq("status", record.status.as_str());
    let updated = match store.update(record.kind.queue_table(), &guard, patch).await {
        Ok(rows) => rows,
        Err(err) => {
            if inserted_here {
                undo_promotion(store, record.kind, production_id.as_deref()).await;
            }
            return Err(err.into());
        }
    };
    if updated.is_empty() {
        let winner = current_status(store, &record).await?;
        // A competing approver may have reused the row this call inserted.
        if inserted_here && winner != QueueStatus::Approved {
            undo_promotion(store, record.kind, production_id.as_deref()).await;
        }
        return Err(ApprovalError::InvalidTransition {
            from: winner,
            action: request.action,
        });
    }

    info!(
        item_id = %record.id,
        kind = %record.kind,
        from = %record.status,
        to = %next,
        reviewed_by = %request.reviewed_by,
        "review action applied"
    );
    Ok(ApprovalResult {
        item_id: record.id,
        kind: record.kind,
        previous_status: record.status,
        status: next,
        production_id,
        reviewed_at: now,
    })
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KindStatus {
    pub kind: ContentKind,
    pub counts: BTreeMap<QueueStatus, usize>,
    pub total: usize,
    pub production: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueStatusReport {
    pub kinds: Vec<KindStatus>,
    pub generated_at: DateTime<Utc>,
}

impl QueueStatusReport {
    pub fn pending(&self) -> usize {
        self.kinds
            .iter()
            .map(|k| k.counts.get(&QueueStatus::PendingReview).copied().unwrap_or(0))
            .sum()
    }
}

/// Per-kind queue counts by status plus production totals.
pub async fn queue_status(store: &dyn DataStore) -> Result<QueueStatusReport, ApprovalError> {
    let mut kinds = Vec::new();
    for kind in ContentKind::ALL {
        let rows = store.select(kind.queue_table(), &Filter::all(), &["status"]).await?;
        let mut counts = QueueStatus::ALL
            .into_iter()
            .map(|s| (s, 0usize))
            .collect::<BTreeMap<_, _>>();
        for row in &rows {
            let status = row
                .get("status")
                .and_then(|v| serde_json::from_value::<QueueStatus>(v.clone()).ok());
            match status {
                Some(status) => *counts.entry(status).or_default() += 1,
                None => warn!(kind = %kind, "queue row with unknown status"),
            }
        }
        let production = store
            .select(kind.production_table(), &Filter::all(), &["id"])
            .await?
            .len();
        kinds.push(KindStatus {
            kind,
            counts,
            total: rows.len(),
            production,
        });
    }
    Ok(QueueStatusReport {
        kinds,
        generated_at: Utc::now(),
    })
}

/// Queue rows of one kind in any of `statuses` (all rows when empty), best score first.
pub async fn list_queue(
    store: &dyn DataStore,
    kind: ContentKind,
    statuses: &[QueueStatus],
) -> Result<Vec<QueueRecord>, ApprovalError> {
    let filter = match statuses {
        [] => Filter::all(),
        [status] => Filter::all().eq("status", status.as_str()),
        many => Filter::all().one_of("status", many.iter().map(|s| s.as_str())),
    };
    let mut records = store
        .select(kind.queue_table(), &filter, &[])
        .await?
        .into_iter()
        .map(|row| {
            let id = row.get("id").cloned().unwrap_or_default();
            QueueRecord::from_row(row).map_err(|e| corrupt(id, e))
        })
        .collect::<Result<Vec<_>, _>>()?;
    records.sort_by(|a, b| b.score.cmp(&a.score).then_with(|| a.created_at.cmp(&b.created_at)));
    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::TimeZone;
    use intake_core::{ContentDetails, ContentItem, FitCategory, ProjectDetails, ScoreBreakdown, ScoredItem};
    use intake_storage::MemoryStore;

    fn scored(title: &str, url: &str, score: u8) -> ScoredItem {
        let item = ContentItem::new(
            "hn-show",
            title,
            url,
            "Inventory sync for small shops.",
            ContentDetails::Project(ProjectDetails::default()),
            Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).single().unwrap(),
        )
        .unwrap();
        ScoredItem {
            item,
            score,
            category: FitCategory::bucket(score, 80, 50),
            confidence: 0.6,
            ai_summary: None,
            ai_reasoning: None,
            breakdown: ScoreBreakdown::default(),
        }
    }

    async fn enqueue(store: &dyn DataStore, item: &ScoredItem) -> Uuid {
        let row = store.insert("queue_projects", item.to_queue_row()).await.unwrap();
        row["id"].as_str().unwrap().parse().unwrap()
    }

    async fn production_count(store: &dyn DataStore) -> usize {
        store.select("projects", &Filter::all(), &[]).await.unwrap().len()
    }

    #[tokio::test]
    async fn approve_promotes_exactly_once() {
        let store = MemoryStore::with_intake_schema();
        let id = enqueue(&store, &scored("Acme", "https://acme.io", 60)).await;

        let request = ApprovalRequest::new(id, ReviewAction::Approve, "maria");
        let result = process_approval(&store, &request).await.unwrap();
        assert_eq!(result.previous_status, QueueStatus::PendingReview);
        assert_eq!(result.status, QueueStatus::Approved);
        assert!(result.production_id.is_some());
        assert_eq!(production_count(&store).await, 1);

        let record = find_queue_item(&store, id).await.unwrap();
        assert_eq!(record.status, QueueStatus::Approved);
        assert_eq!(record.reviewed_by.as_deref(), Some("maria"));

        let again = process_approval(&store, &request).await.unwrap_err();
        assert!(matches!(
            again,
            ApprovalError::InvalidTransition {
                from: QueueStatus::Approved,
                action: ReviewAction::Approve
            }
        ));
        assert_eq!(production_count(&store).await, 1);

        let production = ProductionRecord::from_row(
            store.select("projects", &Filter::all(), &[]).await.unwrap().remove(0),
        )
        .unwrap();
        assert_eq!(production.url_key, "https://acme.io");
        assert_eq!(production.approved_by, "maria");
    }

    #[tokio::test]
    async fn reject_after_approve_changes_nothing() {
        let store = MemoryStore::with_intake_schema();
        let id = enqueue(&store, &scored("Acme", "https://acme.io", 60)).await;
        process_approval(&store, &ApprovalRequest::new(id, ReviewAction::Approve, "maria"))
            .await
            .unwrap();
        let before = find_queue_item(&store, id).await.unwrap();

        let mut reject = ApprovalRequest::new(id, ReviewAction::Reject, "sam");
        reject.rejection_reason = Some("spam".into());
        let err = process_approval(&store, &reject).await.unwrap_err();
        assert!(matches!(err, ApprovalError::InvalidTransition { from: QueueStatus::Approved, .. }));
        assert_eq!(find_queue_item(&store, id).await.unwrap(), before);
    }

    #[tokio::test]
    async fn reject_records_reason_without_promotion() {
        let store = MemoryStore::with_intake_schema();
        let id = enqueue(&store, &scored("Acme", "https://acme.io", 60)).await;
        let mut reject = ApprovalRequest::new(id, ReviewAction::Reject, "sam");
        reject.rejection_reason = Some("out of scope".into());
        reject.notes = Some("not a startup".into());
        let result = process_approval(&store, &reject).await.unwrap();
        assert_eq!(result.status, QueueStatus::Rejected);
        assert_eq!(production_count(&store).await, 0);
        let record = find_queue_item(&store, id).await.unwrap();
        assert_eq!(record.rejection_reason.as_deref(), Some("out of scope"));
        assert_eq!(record.reviewer_notes.as_deref(), Some("not a startup"));
    }

    #[tokio::test]
    async fn review_states_follow_transition_table() {
        let store = MemoryStore::with_intake_schema();
        let id = enqueue(&store, &scored("Acme", "https://acme.io", 60)).await;
        let step = |action| ApprovalRequest::new(id, action, "maria");

        assert_eq!(
            process_approval(&store, &step(ReviewAction::StartReview)).await.unwrap().status,
            QueueStatus::UnderReview
        );
        assert!(process_approval(&store, &step(ReviewAction::StartReview)).await.is_err());
        assert_eq!(
            process_approval(&store, &step(ReviewAction::RequestInfo)).await.unwrap().status,
            QueueStatus::NeedsInfo
        );
        assert_eq!(
            process_approval(&store, &step(ReviewAction::Approve)).await.unwrap().status,
            QueueStatus::Approved
        );
    }

    #[tokio::test]
    async fn unknown_item_is_not_found() {
        let store = MemoryStore::with_intake_schema();
        let id = Uuid::new_v4();
        let err = process_approval(&store, &ApprovalRequest::new(id, ReviewAction::Approve, "maria"))
            .await
            .unwrap_err();
        assert!(matches!(err, ApprovalError::NotFound(missing) if missing == id));
    }

    #[tokio::test]
    async fn earlier_partial_copy_counts_as_promoted() {
        let store = MemoryStore::with_intake_schema();
        let item = scored("Acme", "https://acme.io", 60);
        let id = enqueue(&store, &item).await;
        let record = find_queue_item(&store, id).await.unwrap();
        let copy = ProductionRecord::promote(&record, "maria", Utc::now()).to_row().unwrap();
        store.insert("projects", copy).await.unwrap();

        let result = process_approval(&store, &ApprovalRequest::new(id, ReviewAction::Approve, "maria"))
            .await
            .unwrap();
        assert_eq!(result.status, QueueStatus::Approved);
        assert!(result.production_id.is_some());
        assert_eq!(production_count(&store).await, 1);
    }

    /// Fails production inserts or loses the conditional status update.
    struct FaultyStore {
        inner: MemoryStore,
        fail_production_insert: bool,
        /// Status a competing reviewer writes just before the guarded update.
        competing_status: Option<&'static str>,
    }

    #[async_trait]
    impl DataStore for FaultyStore {
        async fn select(&self, table: &str, filter: &Filter, projection: &[&str]) -> Result<Vec<Row>, StoreError> {
            self.inner.select(table, filter, projection).await
        }

        async fn insert(&self, table: &str, row: Row) -> Result<Row, StoreError> {
            if self.fail_production_insert && !table.starts_with("queue_") {
                return Err(StoreError::Backend("disk full".into()));
            }
            self.inner.insert(table, row).await
        }

        async fn update(&self, table: &str, filter: &Filter, patch: Row) -> Result<Vec<Row>, StoreError> {
            if let Some(status) = self.competing_status {
                let mut competing = Row::new();
                competing.insert("status".into(), json!(status));
                let ids = self.inner.select(table, filter, &["id"]).await?;
                for row in ids {
                    let id = row["id"].clone();
                    self.inner.update(table, &Filter::all().eq("id", id), competing.clone()).await?;
                }
            }
            self.inner.update(table, filter, patch).await
        }

        async fn delete(&self, table: &str, filter: &Filter) -> Result<u64, StoreError> {
            self.inner.delete(table, filter).await
        }
    }

    #[tokio::test]
    async fn failed_copy_leaves_status_untouched() {
        let store = FaultyStore {
            inner: MemoryStore::with_intake_schema(),
            fail_production_insert: true,
            competing_status: None,
        };
        let id = enqueue(&store, &scored("Acme", "https://acme.io", 60)).await;
        let err = process_approval(&store, &ApprovalRequest::new(id, ReviewAction::Approve, "maria"))
            .await
            .unwrap_err();
        assert!(matches!(err, ApprovalError::Storage(StoreError::Backend(_))));
        let record = find_queue_item(&store, id).await.unwrap();
        assert_eq!(record.status, QueueStatus::PendingReview);
        assert!(record.reviewed_by.is_none());
    }

    #[tokio::test]
    async fn lost_update_race_removes_fresh_production_row() {
        let store = FaultyStore {
            inner: MemoryStore::with_intake_schema(),
            fail_production_insert: false,
            competing_status: Some("rejected"),
        };
        let id = enqueue(&store, &scored("Acme", "https://acme.io", 60)).await;
        let err = process_approval(&store, &ApprovalRequest::new(id, ReviewAction::Approve, "maria"))
            .await
            .unwrap_err();
        assert!(matches!(err, ApprovalError::InvalidTransition { from: QueueStatus::Rejected, .. }));
        assert_eq!(production_count(&store).await, 0);
    }

    #[tokio::test]
    async fn losing_to_a_competing_approval_keeps_the_shared_production_row() {
        let store = FaultyStore {
            inner: MemoryStore::with_intake_schema(),
            fail_production_insert: false,
            competing_status: Some("approved"),
        };
        let id = enqueue(&store, &scored("Acme", "https://acme.io", 60)).await;
        let err = process_approval(&store, &ApprovalRequest::new(id, ReviewAction::Approve, "maria"))
            .await
            .unwrap_err();
        assert!(matches!(err, ApprovalError::InvalidTransition { from: QueueStatus::Approved, .. }));
        assert_eq!(find_queue_item(&store, id).await.unwrap().status, QueueStatus::Approved);
        assert_eq!(production_count(&store).await, 1);
    }

    #[tokio::test]
    async fn status_reread_failure_is_reported() {
        struct VanishingStore(MemoryStore);

        #[async_trait]
        impl DataStore for VanishingStore {
            async fn select(&self, table: &str, filter: &Filter, projection: &[&str]) -> Result<Vec<Row>, StoreError> {
                if projection == ["status"] {
                    return Err(StoreError::Unavailable("connection reset".into()));
                }
                self.0.select(table, filter, projection).await
            }

            async fn insert(&self, table: &str, row: Row) -> Result<Row, StoreError> {
                self.0.insert(table, row).await
            }

            async fn update(&self, table: &str, filter: &Filter, patch: Row) -> Result<Vec<Row>, StoreError> {
                let mut competing = Row::new();
                competing.insert("status".into(), json!("rejected"));
                self.0.update(table, &Filter::all(), competing).await?;
                self.0.update(table, filter, patch).await
            }

            async fn delete(&self, table: &str, filter: &Filter) -> Result<u64, StoreError> {
                self.0.delete(table, filter).await
            }
        }

        let store = VanishingStore(MemoryStore::with_intake_schema());
        let id = enqueue(&store, &scored("Acme", "https://acme.io", 60)).await;
        let err = process_approval(&store, &ApprovalRequest::new(id, ReviewAction::Reject, "sam"))
            .await
            .unwrap_err();
        assert!(matches!(err, ApprovalError::Storage(StoreError::Unavailable(_))));
    }

    #[tokio::test]
    async fn status_counts_and_listing() {
        let store = MemoryStore::with_intake_schema();
        let low = enqueue(&store, &scored("Acme", "https://acme.io", 55)).await;
        enqueue(&store, &scored("Tallybook", "https://tallybook.app", 90)).await;
        process_approval(&store, &ApprovalRequest::new(low, ReviewAction::Approve, "maria"))
            .await
            .unwrap();

        let report = queue_status(&store).await.unwrap();
        let projects = report.kinds.iter().find(|k| k.kind == ContentKind::Project).unwrap();
        assert_eq!(projects.total, 2);
        assert_eq!(projects.counts[&QueueStatus::PendingReview], 1);
        assert_eq!(projects.counts[&QueueStatus::Approved], 1);
        assert_eq!(projects.production, 1);
        assert_eq!(report.pending(), 1);

        let all = list_queue(&store, ContentKind::Project, &[]).await.unwrap();
        assert_eq!(all.iter().map(|r| r.score).collect::<Vec<_>>(), vec![90, 55]);
        let pending = list_queue(&store, ContentKind::Project, &[QueueStatus::PendingReview])
            .await
            .unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].title, "Tallybook");
    }

    #[tokio::test]
    async fn listing_accepts_several_statuses() {
        let store = MemoryStore::with_intake_schema();
        let approved = enqueue(&store, &scored("Acme", "https://acme.io", 55)).await;
        let rejected = enqueue(&store, &scored("Tallybook", "https://tallybook.app", 90)).await;
        enqueue(&store, &scored("Ledgerly", "https://ledgerly.dev", 70)).await;
        process_approval(&store, &ApprovalRequest::new(approved, ReviewAction::Approve, "maria"))
            .await
            .unwrap();
        process_approval(&store, &ApprovalRequest::new(rejected, ReviewAction::Reject, "maria"))
            .await
            .unwrap();

        let decided = list_queue(
            &store,
            ContentKind::Project,
            &[QueueStatus::Approved, QueueStatus::Rejected],
        )
        .await
        .unwrap();
        assert_eq!(
            decided.iter().map(|r| r.title.as_str()).collect::<Vec<_>>(),
            vec!["Tallybook", "Acme"]
        );
    }
}
