//! Postgres-backed restaurant store.
//!
//! ## Locking
//!
//! `queue_for_enrichment` runs in one transaction:
//! 1. `SELECT … FOR UPDATE` on the restaurant row
//! 2. If the row is `queued`/`in_progress`, roll back and return it
//! 3. Upsert with status `queued`, keeping any stored phone number
//!
//! A row lock cannot cover a row that does not exist yet, so the upsert repeats the
//! status guard in its `ON CONFLICT … WHERE` clause. Two first-time requests racing on
//! the insert therefore still produce a single `queued` transition.
//!
//! `set_status`, `record_call_started` and `complete_call` lock the restaurant row
//! before checking the lifecycle. `complete_call` only flips an `initiated` call, and
//! only finalises the restaurant when that call is the newest one for it.
//!
//! ## Error Mapping
//!
//! | SQLx Error | StoreError |
//! |------------|------------|
//! | Database (any code) | `Storage` |
//! | PoolClosed | `Storage` |
//! | Row decode failure | `Corrupt` |

use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use sqlx::{PgPool, Postgres, Row, Transaction};
use std::sync::Arc;
use tracing::instrument;

use eatsavvy_core::{Call, CallStatus, EnrichmentStatus, PlaceId, ProviderCallId, Restaurant, TimeRange};

use super::{CallCompletion, CallFinalised, Finalisation, QueueOutcome, RestaurantStore, StoreError};

const RESTAURANT_COLUMNS: &str = "places_id, name, address, phone_number, open_hours, nutrition_info, \
     enrichment_status, rating, created_at, updated_at";

const CALL_COLUMNS: &str = "places_id, vapi_call_id, call_status, transcript, structured_outputs, summary, \
     success_evaluation, ended_reason, created_at, updated_at";

#[derive(Debug, Clone)]
pub struct PostgresRestaurantStore {
    pool: Arc<PgPool>,
}

impl PostgresRestaurantStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool: Arc::new(pool) }
    }

    /// Connect and apply `migrations/`.
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPool::connect(database_url)
            .await
            .map_err(|e| map_sqlx_error("connect", e))?;
        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .map_err(|e| StoreError::Storage(format!("migration failed: {e}")))?;
        Ok(Self::new(pool))
    }

}

#[async_trait::async_trait]
impl RestaurantStore for PostgresRestaurantStore {
    #[instrument(skip(self), fields(place_id = %place_id), err)]
    async fn get_restaurant(&self, place_id: &PlaceId) -> Result<Option<Restaurant>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {RESTAURANT_COLUMNS} FROM restaurants WHERE places_id = $1"
        ))
        .bind(place_id.as_str())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("get_restaurant", e))?;

        row.map(|r| restaurant_from_row(&r)).transpose()
    }

    #[instrument(skip(self), err)]
    async fn list_restaurants(&self) -> Result<Vec<Restaurant>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {RESTAURANT_COLUMNS} FROM restaurants ORDER BY created_at ASC, places_id ASC"
        ))
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("list_restaurants", e))?;

        rows.iter().map(restaurant_from_row).collect()
    }

    #[instrument(skip(self, fresh), fields(place_id = %fresh.place_id), err)]
    async fn queue_for_enrichment(&self, fresh: &Restaurant) -> Result<QueueOutcome, StoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        if let Some(locked) = lock_restaurant(&mut tx, &fresh.place_id).await? {
            if locked.enrichment_status.is_active() {
                tx.rollback().await.map_err(|e| map_sqlx_error("rollback", e))?;
                tracing::debug!(status = %locked.enrichment_status, "restaurant already active");
                return Ok(QueueOutcome::AlreadyActive(locked));
            }
        }

        let open_hours = serde_json::to_value(&fresh.open_hours)
            .map_err(|e| StoreError::Corrupt(format!("open_hours not serialisable: {e}")))?;

        let upserted = sqlx::query(&format!(
            r#"
            INSERT INTO restaurants (
                places_id, name, address, phone_number, open_hours, nutrition_info,
                enrichment_status, rating, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, NULL, 'queued', $6, $7, $7)
            ON CONFLICT (places_id) DO UPDATE SET
                name = EXCLUDED.name,
                address = EXCLUDED.address,
                phone_number = COALESCE(restaurants.phone_number, EXCLUDED.phone_number),
                open_hours = EXCLUDED.open_hours,
                rating = EXCLUDED.rating,
                enrichment_status = 'queued',
                updated_at = EXCLUDED.updated_at
            WHERE restaurants.enrichment_status NOT IN ('queued', 'in_progress')
            RETURNING {RESTAURANT_COLUMNS}
            "#
        ))
        .bind(fresh.place_id.as_str())
        .bind(&fresh.name)
        .bind(&fresh.address)
        .bind(fresh.phone_number.as_deref())
        .bind(&open_hours)
        .bind(fresh.rating)
        .bind(fresh.updated_at)
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("upsert_restaurant", e))?;

        match upserted {
            Some(row) => {
                let restaurant = restaurant_from_row(&row)?;
                tx.commit().await.map_err(|e| map_sqlx_error("commit", e))?;
                Ok(QueueOutcome::Queued(restaurant))
            }
            None => {
                // Lost the insert race to a concurrent first-time request.
                let current = lock_restaurant(&mut tx, &fresh.place_id)
                    .await?
                    .ok_or_else(|| StoreError::RestaurantNotFound(fresh.place_id.clone()))?;
                tx.rollback().await.map_err(|e| map_sqlx_error("rollback", e))?;
                Ok(QueueOutcome::AlreadyActive(current))
            }
        }
    }

    #[instrument(skip(self), fields(place_id = %place_id, status = %status), err)]
    async fn set_status(
        &self,
        place_id: &PlaceId,
        status: EnrichmentStatus,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        let current = lock_status(&mut tx, place_id).await?;
        if let Err(e) = check_transition(place_id, current, status) {
            tx.rollback().await.map_err(|e| map_sqlx_error("rollback", e))?;
            return Err(e);
        }

        sqlx::query(
            r#"
            UPDATE restaurants
            SET enrichment_status = $2, updated_at = $3
            WHERE places_id = $1
            "#,
        )
        .bind(place_id.as_str())
        .bind(status.as_str())
        .bind(at)
        .execute(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("set_status", e))?;

        tx.commit().await.map_err(|e| map_sqlx_error("commit", e))?;
        Ok(())
    }

    #[instrument(skip(self), fields(place_id = %place_id, call_id = %provider_call_id), err)]
    async fn record_call_started(
        &self,
        place_id: &PlaceId,
        provider_call_id: &ProviderCallId,
        at: DateTime<Utc>,
    ) -> Result<Call, StoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        let current = lock_status(&mut tx, place_id).await?;
        if let Err(e) = check_transition(place_id, current, EnrichmentStatus::InProgress) {
            tx.rollback().await.map_err(|e| map_sqlx_error("rollback", e))?;
            return Err(e);
        }

        sqlx::query(
            r#"
            UPDATE restaurants
            SET enrichment_status = 'in_progress', updated_at = $2
            WHERE places_id = $1
            "#,
        )
        .bind(place_id.as_str())
        .bind(at)
        .execute(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("mark_in_progress", e))?;

        sqlx::query(
            r#"
            INSERT INTO calls (places_id, vapi_call_id, call_status, created_at, updated_at)
            VALUES ($1, $2, 'initiated', $3, $3)
            "#,
        )
        .bind(place_id.as_str())
        .bind(provider_call_id.as_str())
        .bind(at)
        .execute(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("insert_call", e))?;

        tx.commit().await.map_err(|e| map_sqlx_error("commit", e))?;

        Ok(Call::initiated(place_id.clone(), provider_call_id.clone(), at))
    }

    #[instrument(
        skip(self, completion),
        fields(call_id = %completion.provider_call_id, status = %completion.final_status),
        err
    )]
    async fn complete_call(&self, completion: &CallCompletion) -> Result<CallFinalised, StoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        let owner = sqlx::query("SELECT places_id FROM calls WHERE vapi_call_id = $1")
            .bind(completion.provider_call_id.as_str())
            .fetch_optional(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("find_call", e))?;
        let Some(owner) = owner else {
            tx.rollback().await.map_err(|e| map_sqlx_error("rollback", e))?;
            return Err(StoreError::CallNotFound(completion.provider_call_id.clone()));
        };
        let raw_place_id: String = owner
            .try_get("places_id")
            .map_err(|e| StoreError::Corrupt(format!("calls.places_id: {e}")))?;
        let place_id = PlaceId::new(raw_place_id).map_err(|e| StoreError::Corrupt(e.to_string()))?;

        // Restaurant first, then the call: the same order record_call_started takes.
        let current = lock_status(&mut tx, &place_id).await?;

        let updated = sqlx::query(
            r#"
            UPDATE calls
            SET call_status = 'completed',
                transcript = $2,
                structured_outputs = $3,
                summary = $4,
                success_evaluation = $5,
                ended_reason = $6,
                updated_at = $7
            WHERE vapi_call_id = $1 AND call_status = 'initiated'
            RETURNING id
            "#,
        )
        .bind(completion.provider_call_id.as_str())
        .bind(&completion.transcript)
        .bind(&completion.structured_outputs)
        .bind(&completion.summary)
        .bind(completion.success_evaluation.as_deref())
        .bind(&completion.ended_reason)
        .bind(completion.completed_at)
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("update_call", e))?;

        let Some(updated) = updated else {
            tx.rollback().await.map_err(|e| map_sqlx_error("rollback", e))?;
            return Ok(CallFinalised {
                place_id,
                finalisation: Finalisation::Duplicate,
            });
        };
        let call_row_id: i64 = updated
            .try_get("id")
            .map_err(|e| StoreError::Corrupt(format!("calls.id: {e}")))?;

        let latest: Option<i64> = sqlx::query_scalar("SELECT MAX(id) FROM calls WHERE places_id = $1")
            .bind(place_id.as_str())
            .fetch_one(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("latest_call", e))?;

        let owns_restaurant = latest == Some(call_row_id)
            && current == EnrichmentStatus::InProgress
            && current.can_transition_to(completion.final_status);

        if owns_restaurant {
            sqlx::query(
                r#"
                UPDATE restaurants
                SET nutrition_info = $2, enrichment_status = $3, updated_at = $4
                WHERE places_id = $1
                "#,
            )
            .bind(place_id.as_str())
            .bind(&completion.nutrition_info)
            .bind(completion.final_status.as_str())
            .bind(completion.completed_at)
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("finalise_restaurant", e))?;
        }

        tx.commit().await.map_err(|e| map_sqlx_error("commit", e))?;
        Ok(CallFinalised {
            place_id,
            finalisation: if owns_restaurant {
                Finalisation::Applied
            } else {
                Finalisation::Superseded
            },
        })
    }


    #[instrument(skip(self, phone_number), fields(place_id = %place_id), err)]
    async fn update_phone_number(
        &self,
        place_id: &PlaceId,
        phone_number: &str,
        at: DateTime<Utc>,
    ) -> Result<Restaurant, StoreError> {
        let row = sqlx::query(&format!(
            r#"
            UPDATE restaurants
            SET phone_number = $2, updated_at = $3
            WHERE places_id = $1
            RETURNING {RESTAURANT_COLUMNS}
            "#
        ))
        .bind(place_id.as_str())
        .bind(phone_number)
        .bind(at)
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("update_phone_number", e))?;

        match row {
            Some(row) => restaurant_from_row(&row),
            None => Err(StoreError::RestaurantNotFound(place_id.clone())),
        }
    }

    #[instrument(skip(self), fields(place_id = %place_id), err)]
    async fn calls_for(&self, place_id: &PlaceId) -> Result<Vec<Call>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {CALL_COLUMNS} FROM calls WHERE places_id = $1 ORDER BY created_at ASC, id ASC"
        ))
        .bind(place_id.as_str())
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("calls_for", e))?;

        rows.iter().map(call_from_row).collect()
    }
}

async fn lock_restaurant(
    tx: &mut Transaction<'_, Postgres>,
    place_id: &PlaceId,
) -> Result<Option<Restaurant>, StoreError> {
    let row = sqlx::query(&format!(
        "SELECT {RESTAURANT_COLUMNS} FROM restaurants WHERE places_id = $1 FOR UPDATE"
    ))
    .bind(place_id.as_str())
    .fetch_optional(&mut **tx)
    .await
    .map_err(|e| map_sqlx_error("lock_restaurant", e))?;

    row.map(|r| restaurant_from_row(&r)).transpose()
}

/// Lock the restaurant row and read its status.
async fn lock_status(
    tx: &mut Transaction<'_, Postgres>,
    place_id: &PlaceId,
) -> Result<EnrichmentStatus, StoreError> {
    let raw: Option<String> =
        sqlx::query_scalar("SELECT enrichment_status FROM restaurants WHERE places_id = $1 FOR UPDATE")
            .bind(place_id.as_str())
            .fetch_optional(&mut **tx)
            .await
            .map_err(|e| map_sqlx_error("lock_status", e))?;

    raw.ok_or_else(|| StoreError::RestaurantNotFound(place_id.clone()))?
        .parse()
        .map_err(|e| StoreError::Corrupt(format!("restaurants.enrichment_status: {e}")))
}

fn check_transition(place_id: &PlaceId, from: EnrichmentStatus, to: EnrichmentStatus) -> Result<(), StoreError> {
    if from.can_transition_to(to) {
        Ok(())
    } else {
        Err(StoreError::InvalidTransition {
            place_id: place_id.clone(),
            from,
            to,
        })
    }
}

fn restaurant_from_row(row: &sqlx::postgres::PgRow) -> Result<Restaurant, StoreError> {
    let corrupt = |column: &str, e: &dyn std::fmt::Display| StoreError::Corrupt(format!("restaurants.{column}: {e}"));

    let place_id: String = row.try_get("places_id").map_err(|e| corrupt("places_id", &e))?;
    let status: String = row.try_get("enrichment_status").map_err(|e| corrupt("enrichment_status", &e))?;
    let open_hours: Option<JsonValue> = row.try_get("open_hours").map_err(|e| corrupt("open_hours", &e))?;
    let open_hours: Vec<TimeRange> = match open_hours {
        Some(value) => serde_json::from_value(value).map_err(|e| corrupt("open_hours", &e))?,
        None => Vec::new(),
    };

    Ok(Restaurant {
        place_id: PlaceId::new(place_id).map_err(|e| corrupt("places_id", &e))?,
        name: row.try_get("name").map_err(|e| corrupt("name", &e))?,
        address: row
            .try_get::<Option<String>, _>("address")
            .map_err(|e| corrupt("address", &e))?
            .unwrap_or_default(),
        phone_number: row.try_get("phone_number").map_err(|e| corrupt("phone_number", &e))?,
        open_hours,
        nutrition_info: row.try_get("nutrition_info").map_err(|e| corrupt("nutrition_info", &e))?,
        enrichment_status: status.parse().map_err(|e| corrupt("enrichment_status", &e))?,
        rating: row.try_get("rating").map_err(|e| corrupt("rating", &e))?,
        created_at: row.try_get("created_at").map_err(|e| corrupt("created_at", &e))?,
        updated_at: row.try_get("updated_at").map_err(|e| corrupt("updated_at", &e))?,
    })
}

fn call_from_row(row: &sqlx::postgres::PgRow) -> Result<Call, StoreError> {
    let corrupt = |column: &str, e: &dyn std::fmt::Display| StoreError::Corrupt(format!("calls.{column}: {e}"));

    let place_id: String = row.try_get("places_id").map_err(|e| corrupt("places_id", &e))?;
    let call_id: String = row.try_get("vapi_call_id").map_err(|e| corrupt("vapi_call_id", &e))?;
    let status: String = row.try_get("call_status").map_err(|e| corrupt("call_status", &e))?;

    Ok(Call {
        place_id: PlaceId::new(place_id).map_err(|e| corrupt("places_id", &e))?,
        provider_call_id: ProviderCallId::new(call_id).map_err(|e| corrupt("vapi_call_id", &e))?,
        status: status.parse::<CallStatus>().map_err(|e| corrupt("call_status", &e))?,
        transcript: row.try_get("transcript").map_err(|e| corrupt("transcript", &e))?,
        structured_outputs: row
            .try_get("structured_outputs")
            .map_err(|e| corrupt("structured_outputs", &e))?,
        summary: row.try_get("summary").map_err(|e| corrupt("summary", &e))?,
        success_evaluation: row
            .try_get("success_evaluation")
            .map_err(|e| corrupt("success_evaluation", &e))?,
        ended_reason: row.try_get("ended_reason").map_err(|e| corrupt("ended_reason", &e))?,
        created_at: row.try_get("created_at").map_err(|e| corrupt("created_at", &e))?,
        updated_at: row.try_get("updated_at").map_err(|e| corrupt("updated_at", &e))?,
    })
}

/// Map a SQLx error to `StoreError` with the failing operation in the message.
fn map_sqlx_error(operation: &str, err: sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            let code = db_err.code().map(|c| c.to_string()).unwrap_or_default();
            StoreError::Storage(format!(
                "database error in {} ({}): {}",
                operation,
                code,
                db_err.message()
            ))
        }
        sqlx::Error::PoolClosed => StoreError::Storage(format!("connection pool closed in {}", operation)),
        sqlx::Error::ColumnDecode { index, source } => {
            StoreError::Corrupt(format!("column {} in {}: {}", index, operation, source))
        }
        _ => StoreError::Storage(format!("sqlx error in {}: {}", operation, err)),
    }
}
