//! Relational item store and reconciliation of extracted item sets against it.

use std::collections::HashSet;
use std::path::Path;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;
use sha2::{Digest, Sha256};
use shelterwatch_adapters::adoption::resolve_status;
use shelterwatch_core::{
    AnimalType, ItemDraft, ItemFields, ItemRecord, ItemStatus, ParseValueError, StoredItem,
};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::FromRow;
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration failed: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("creating database directory {path}: {source}")]
    CreateDir {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("stored row {id} has invalid {column}: {message}")]
    Corrupt {
        id: i64,
        column: &'static str,
        message: String,
    },
    #[error("encoding image list: {0}")]
    Images(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Inserted(i64),
    Updated(i64),
    /// Fields matched the stored row; only `last_seen_at` moved.
    Unchanged(i64),
}

impl UpsertOutcome {
    pub fn id(self) -> i64 {
        match self {
            UpsertOutcome::Inserted(id)
            | UpsertOutcome::Updated(id)
            | UpsertOutcome::Unchanged(id) => id,
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ApplyOptions {
    /// Load drafts flagged `needs_review` instead of skipping them.
    pub skip_review: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct ReconcileReport {
    pub found: usize,
    pub inserted: usize,
    pub updated: usize,
    pub unchanged: usize,
    pub skipped: usize,
    /// Drafts repeating an external id already loaded from the same set; the first one wins.
    pub duplicates: usize,
    pub removed: u64,
}

impl ReconcileReport {
    /// Distinct items that made it into the store during this apply.
    pub fn loaded(&self) -> usize {
        self.inserted + self.updated + self.unchanged
    }
}

#[derive(Debug, FromRow)]
struct ItemRow {
    id: i64,
    source_id: String,
    external_id: String,
    name: String,
    animal_type: String,
    breed: Option<String>,
    age_estimate: Option<String>,
    gender: Option<String>,
    color: Option<String>,
    size: Option<String>,
    health_status: Option<String>,
    personality: Option<String>,
    special_needs: Option<String>,
    images: String,
    protection_date: Option<NaiveDate>,
    deadline_date: Option<NaiveDate>,
    status: String,
    source_url: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    last_seen_at: DateTime<Utc>,
}

impl TryFrom<ItemRow> for StoredItem {
    type Error = StoreError;

    fn try_from(row: ItemRow) -> Result<Self, Self::Error> {
        let id = row.id;
        let corrupt = |column: &'static str| {
            move |err: ParseValueError| StoreError::Corrupt {
                id,
                column,
                message: err.to_string(),
            }
        };
        let images = serde_json::from_str(&row.images).map_err(|err| StoreError::Corrupt {
            id,
            column: "images",
            message: err.to_string(),
        })?;

        Ok(StoredItem {
            id,
            source_id: row.source_id,
            external_id: row.external_id,
            fields: ItemFields {
                name: row.name,
                animal_type: AnimalType::from_str(&row.animal_type)
                    .map_err(corrupt("animal_type"))?,
                breed: row.breed,
                age_estimate: row.age_estimate,
                gender: row.gender,
                color: row.color,
                size: row.size,
                health_status: row.health_status,
                personality: row.personality,
                special_needs: row.special_needs,
                images,
                protection_date: row.protection_date,
                deadline_date: row.deadline_date,
                status: ItemStatus::from_str(&row.status).map_err(corrupt("status"))?,
                source_url: row.source_url,
            },
            created_at: row.created_at,
            updated_at: row.updated_at,
            last_seen_at: row.last_seen_at,
        })
    }
}

/// Sole writer of item rows. Cheap to clone; clones share the pool.
#[derive(Debug, Clone)]
pub struct StoreReconciler {
    pool: SqlitePool,
}

impl StoreReconciler {
    /// Open (creating if needed) the SQLite database at `database_url` and run migrations.
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);
        let in_memory = database_url.contains(":memory:") || database_url.contains("mode=memory");

        if !in_memory {
            ensure_parent_dir(options.get_filename()).await?;
        }

        // Every connection to an in-memory database is a separate database.
        let pool = if in_memory {
            SqlitePoolOptions::new()
                .max_connections(1)
                .min_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
                .connect_with(options)
                .await?
        } else {
            SqlitePoolOptions::new()
                .max_connections(4)
                .connect_with(options)
                .await?
        };

        let store = Self::from_pool(pool);
        store.migrate().await?;
        Ok(store)
    }

    pub fn from_pool(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }

    pub async fn upsert(&self, record: &ItemRecord) -> Result<UpsertOutcome, StoreError> {
        self.upsert_at(record, Utc::now()).await
    }

    /// Insert or refresh the row identified by (source_id, external_id), as of `now`.
    pub async fn upsert_at(
        &self,
        record: &ItemRecord,
        now: DateTime<Utc>,
    ) -> Result<UpsertOutcome, StoreError> {
        let fields = &record.fields;
        let images = serde_json::to_string(&fields.images)?;
        let mut tx = self.pool.begin().await?;

        let existing = sqlx::query_as::<_, ItemRow>(
            "SELECT * FROM items WHERE source_id = ? AND external_id = ?",
        )
        .bind(&record.source_id)
        .bind(&record.external_id)
        .fetch_optional(&mut *tx)
        .await?;

        let outcome = match existing {
            None => {
                let result = sqlx::query(
                    r#"
                    INSERT INTO items
                        (source_id, external_id, name, animal_type, breed, age_estimate, gender,
                         color, size, health_status, personality, special_needs, images,
                         protection_date, deadline_date, status, source_url,
                         created_at, updated_at, last_seen_at)
                    VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                    "#,
                )
                .bind(&record.source_id)
                .bind(&record.external_id)
                .bind(&fields.name)
                .bind(fields.animal_type.as_str())
                .bind(fields.breed.as_deref())
                .bind(fields.age_estimate.as_deref())
                .bind(fields.gender.as_deref())
                .bind(fields.color.as_deref())
                .bind(fields.size.as_deref())
                .bind(fields.health_status.as_deref())
                .bind(fields.personality.as_deref())
                .bind(fields.special_needs.as_deref())
                .bind(&images)
                .bind(fields.protection_date)
                .bind(fields.deadline_date)
                .bind(fields.status.as_str())
                .bind(fields.source_url.as_deref())
                .bind(now)
                .bind(now)
                .bind(now)
                .execute(&mut *tx)
                .await?;
                UpsertOutcome::Inserted(result.last_insert_rowid())
            }
            Some(row) => {
                let stored = StoredItem::try_from(row)?;
                if stored.fields == *fields {
                    sqlx::query("UPDATE items SET last_seen_at = ? WHERE id = ?")
                        .bind(now)
                        .bind(stored.id)
                        .execute(&mut *tx)
                        .await?;
                    UpsertOutcome::Unchanged(stored.id)
                } else {
                    sqlx::query(
                        r#"
                        UPDATE items SET
                            name = ?, animal_type = ?, breed = ?, age_estimate = ?, gender = ?,
                            color = ?, size = ?, health_status = ?, personality = ?,
                            special_needs = ?, images = ?, protection_date = ?, deadline_date = ?,
                            status = ?, source_url = ?, updated_at = ?, last_seen_at = ?
                        WHERE id = ?
                        "#,
                    )
                    .bind(&fields.name)
                    .bind(fields.animal_type.as_str())
                    .bind(fields.breed.as_deref())
                    .bind(fields.age_estimate.as_deref())
                    .bind(fields.gender.as_deref())
                    .bind(fields.color.as_deref())
                    .bind(fields.size.as_deref())
                    .bind(fields.health_status.as_deref())
                    .bind(fields.personality.as_deref())
                    .bind(fields.special_needs.as_deref())
                    .bind(&images)
                    .bind(fields.protection_date)
                    .bind(fields.deadline_date)
                    .bind(fields.status.as_str())
                    .bind(fields.source_url.as_deref())
                    .bind(now)
                    .bind(now)
                    .bind(stored.id)
                    .execute(&mut *tx)
                    .await?;
                    UpsertOutcome::Updated(stored.id)
                }
            }
        };

        tx.commit().await?;
        debug!(
            source_id = %record.source_id,
            external_id = %record.external_id,
            ?outcome,
            "item upserted"
        );
        Ok(outcome)
    }

    pub async fn reconcile_removals(
        &self,
        source_id: &str,
        current_ids: &HashSet<String>,
    ) -> Result<u64, StoreError> {
        self.reconcile_removals_at(source_id, current_ids, Utc::now())
            .await
    }

    /// Mark every available row of `source_id` missing from `current_ids` as removed.
    ///
    /// An empty `current_ids` removes all available rows of the source.
    pub async fn reconcile_removals_at(
        &self,
        source_id: &str,
        current_ids: &HashSet<String>,
        now: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        let mut tx = self.pool.begin().await?;

        let available: Vec<(i64, String)> = sqlx::query_as(
            "SELECT id, external_id FROM items WHERE source_id = ? AND status = ?",
        )
        .bind(source_id)
        .bind(ItemStatus::Available.as_str())
        .fetch_all(&mut *tx)
        .await?;

        let mut removed = 0u64;
        for (id, external_id) in available {
            if current_ids.contains(&external_id) {
                continue;
            }
            sqlx::query("UPDATE items SET status = ?, updated_at = ? WHERE id = ?")
                .bind(ItemStatus::Removed.as_str())
                .bind(now)
                .bind(id)
                .execute(&mut *tx)
                .await?;
            removed += 1;
        }

        tx.commit().await?;
        if removed > 0 {
            info!(source_id, removed, "items no longer listed marked removed");
        }
        Ok(removed)
    }

    /// `base` if no other row of the source uses it, else the first free `base-N` (N >= 2).
    ///
    /// `owner` is the external id of the row the name is for; its own name never
    /// counts as a collision.
    pub async fn ensure_unique_name(
        &self,
        source_id: &str,
        base: &str,
        owner: Option<&str>,
    ) -> Result<String, StoreError> {
        let rows: Vec<(String, String)> =
            sqlx::query_as("SELECT external_id, name FROM items WHERE source_id = ?")
                .bind(source_id)
                .fetch_all(&self.pool)
                .await?;

        let taken = rows
            .into_iter()
            .filter(|(external_id, _)| Some(external_id.as_str()) != owner)
            .map(|(_, name)| name)
            .collect::<HashSet<_>>();

        if !taken.contains(base) {
            return Ok(base.to_string());
        }
        let mut suffix = 2u32;
        loop {
            let candidate = format!("{base}-{suffix}");
            if !taken.contains(&candidate) {
                return Ok(candidate);
            }
            suffix += 1;
        }
    }

    pub async fn apply_item_set(
        &self,
        source_id: &str,
        drafts: &[ItemDraft],
        options: ApplyOptions,
    ) -> Result<ReconcileReport, StoreError> {
        self.apply_item_set_at(source_id, drafts, options, Utc::now())
            .await
    }

    /// Upsert every loadable draft of one source, then soft-delete what the set no longer lists.
    pub async fn apply_item_set_at(
        &self,
        source_id: &str,
        drafts: &[ItemDraft],
        options: ApplyOptions,
        now: DateTime<Utc>,
    ) -> Result<ReconcileReport, StoreError> {
        let mut report = ReconcileReport {
            found: drafts.len(),
            ..Default::default()
        };
        let mut present = HashSet::new();
        let mut upserted = HashSet::new();
        let mut synthesized = HashSet::new();

        for draft in drafts {
            let skip_reason = if draft.extraction_error {
                Some("extraction_error")
            } else if draft.needs_review && !options.skip_review {
                Some("needs_review")
            } else {
                None
            };
            if let Some(reason) = skip_reason {
                report.skipped += 1;
                if let Some(external_id) = explicit_external_id(draft) {
                    present.insert(external_id.to_string());
                }
                debug!(source_id, reason, "draft skipped");
                continue;
            }

            let external_id = match explicit_external_id(draft) {
                Some(id) => id.to_string(),
                None => {
                    let base = synthesize_external_id(draft);
                    let mut candidate = base.clone();
                    let mut suffix = 2u32;
                    while !synthesized.insert(candidate.clone()) {
                        candidate = format!("{base}-{suffix}");
                        suffix += 1;
                    }
                    candidate
                }
            };
            if upserted.contains(&external_id) {
                report.duplicates += 1;
                warn!(source_id, external_id = %external_id, "duplicate draft in item set ignored");
                continue;
            }

            let animal_type = draft.animal_type.unwrap_or_default();
            let base_name = draft
                .name
                .as_deref()
                .map(str::trim)
                .filter(|name| !name.is_empty())
                .map(str::to_string)
                .unwrap_or_else(|| default_display_name(animal_type, &external_id));
            let name = self
                .ensure_unique_name(source_id, &base_name, Some(&external_id))
                .await?;

            let record = ItemRecord {
                source_id: source_id.to_string(),
                external_id: external_id.clone(),
                fields: ItemFields {
                    name,
                    animal_type,
                    breed: draft.breed.clone(),
                    age_estimate: draft.age_estimate.clone(),
                    gender: draft.gender.clone(),
                    color: draft.color.clone(),
                    size: draft.size.clone(),
                    health_status: draft.health_status.clone(),
                    personality: draft.personality.clone(),
                    special_needs: draft.special_needs.clone(),
                    images: draft.images.clone(),
                    protection_date: draft.protection_date,
                    deadline_date: draft.deadline_date,
                    status: resolve_status(draft),
                    source_url: draft.source_url.clone(),
                },
            };

            match self.upsert_at(&record, now).await? {
                UpsertOutcome::Inserted(_) => report.inserted += 1,
                UpsertOutcome::Updated(_) => report.updated += 1,
                UpsertOutcome::Unchanged(_) => report.unchanged += 1,
            }
            upserted.insert(external_id.clone());
            present.insert(external_id);
        }

        report.removed = self.reconcile_removals_at(source_id, &present, now).await?;

        info!(
            source_id,
            found = report.found,
            inserted = report.inserted,
            updated = report.updated,
            unchanged = report.unchanged,
            skipped = report.skipped,
            duplicates = report.duplicates,
            removed = report.removed,
            "item set applied"
        );
        Ok(report)
    }

    /// Items still listed, optionally restricted to one source.
    pub async fn available_items(
        &self,
        source_id: Option<&str>,
    ) -> Result<Vec<StoredItem>, StoreError> {
        let rows = match source_id {
            Some(source_id) => {
                sqlx::query_as::<_, ItemRow>(
                    "SELECT * FROM items WHERE status = ? AND source_id = ? ORDER BY source_id, id",
                )
                .bind(ItemStatus::Available.as_str())
                .bind(source_id)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query_as::<_, ItemRow>(
                    "SELECT * FROM items WHERE status = ? ORDER BY source_id, id",
                )
                .bind(ItemStatus::Available.as_str())
                .fetch_all(&self.pool)
                .await?
            }
        };
        rows.into_iter().map(StoredItem::try_from).collect()
    }

    pub async fn get(
        &self,
        source_id: &str,
        external_id: &str,
    ) -> Result<Option<StoredItem>, StoreError> {
        sqlx::query_as::<_, ItemRow>("SELECT * FROM items WHERE source_id = ? AND external_id = ?")
            .bind(source_id)
            .bind(external_id)
            .fetch_optional(&self.pool)
            .await?
            .map(StoredItem::try_from)
            .transpose()
    }
}

async fn ensure_parent_dir(path: &Path) -> Result<(), StoreError> {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => tokio::fs::create_dir_all(parent)
            .await
            .map_err(|source| StoreError::CreateDir {
                path: parent.display().to_string(),
                source,
            }),
        _ => Ok(()),
    }
}

fn explicit_external_id(draft: &ItemDraft) -> Option<&str> {
    draft
        .external_id
        .as_deref()
        .map(str::trim)
        .filter(|id| !id.is_empty())
}

/// Content-derived identity for drafts the source gave no id; stable across runs
/// as long as the listed content is.
pub fn synthesize_external_id(draft: &ItemDraft) -> String {
    let mut hasher = Sha256::new();
    let parts = [
        draft.name.as_deref(),
        draft.animal_type.map(AnimalType::as_str),
        draft.breed.as_deref(),
        draft.age_estimate.as_deref(),
        draft.gender.as_deref(),
        draft.color.as_deref(),
        draft.size.as_deref(),
        draft.source_url.as_deref(),
    ];
    for part in parts {
        hasher.update(part.unwrap_or_default().as_bytes());
        hasher.update([0x1f]);
    }
    for image in &draft.images {
        hasher.update(image.as_bytes());
        hasher.update([0x1e]);
    }
    if let Some(date) = draft.protection_date {
        hasher.update(date.to_string().as_bytes());
    }
    let digest = hex::encode(hasher.finalize());
    format!("local-{}", &digest[..12])
}

pub fn default_display_name(animal_type: AnimalType, external_id: &str) -> String {
    let prefix = match animal_type {
        AnimalType::Cat => "Cat",
        AnimalType::Dog => "Dog",
        AnimalType::Other | AnimalType::Unknown => "Animal",
    };
    format!("{prefix} {external_id}")
}
