//! services/api/src/adapters/db.rs
//!
//! This module contains the PostgreSQL adapter, the concrete implementation of
//! the `CourseRepository` and `UsageStore` ports from the core crate. Courses
//! are stored as JSONB documents; a partial update merges the patch's fields
//! into the stored document in a single statement.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use course_engine_core::domain::{Course, CourseStatus};
use course_engine_core::ports::{
    CounterUpdate, CoursePatch, CourseRepository, PortError, PortResult, UsageStore,
};
use course_engine_core::usage::UsageKey;
use sqlx::types::Json;
use sqlx::{FromRow, PgPool};
use uuid::Uuid;

//=========================================================================================
// The Main Adapter Struct
//=========================================================================================

/// A database adapter that implements the persistence ports.
#[derive(Clone)]
pub struct DbAdapter {
    pool: PgPool,
}

impl DbAdapter {
    /// Creates a new `DbAdapter`.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// A helper function to run database migrations at startup.
    pub async fn run_migrations(&self) -> Result<(), sqlx::migrate::MigrateError> {
        sqlx::migrate!("./migrations").run(&self.pool).await
    }
}

fn unexpected(e: sqlx::Error) -> PortError {
    PortError::Unexpected(e.to_string())
}

//=========================================================================================
// "Impure" Database Record Structs
//=========================================================================================

#[derive(FromRow)]
struct CourseRecord {
    doc: Json<Course>,
}
impl CourseRecord {
    fn to_domain(self) -> Course {
        self.doc.0
    }
}

#[derive(FromRow)]
struct CounterRecord {
    used: i64,
}
impl CounterRecord {
    fn to_domain(self) -> u64 {
        self.used.max(0) as u64
    }
}

#[derive(FromRow)]
struct CountRecord {
    count: i64,
}

//=========================================================================================
// `CourseRepository` Trait Implementation
//=========================================================================================

#[async_trait]
impl CourseRepository for DbAdapter {
    async fn create_course(&self, course: &Course) -> PortResult<()> {
        sqlx::query(
            "INSERT INTO courses (id, user_id, status, doc, created_at, updated_at) \
             VALUES ($1, $2, $3, $4, $5, $6)",
        )
        .bind(course.id)
        .bind(course.user_id)
        .bind(course.status.as_str())
        .bind(Json(course))
        .bind(course.created_at)
        .bind(course.updated_at)
        .execute(&self.pool)
        .await
        .map_err(unexpected)?;
        Ok(())
    }

    async fn get_course(&self, course_id: Uuid) -> PortResult<Course> {
        let record = sqlx::query_as::<_, CourseRecord>("SELECT doc FROM courses WHERE id = $1")
            .bind(course_id)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| match e {
                sqlx::Error::RowNotFound => {
                    PortError::NotFound(format!("Course {} not found", course_id))
                }
                _ => unexpected(e),
            })?;
        Ok(record.to_domain())
    }

    async fn update_course(&self, course_id: Uuid, patch: &CoursePatch) -> PortResult<()> {
        let fields = patch.to_fields()?;
        let status = patch.status.map(|s| s.as_str().to_string());
        let updated_at: DateTime<Utc> = patch.updated_at.unwrap_or_else(Utc::now);

        // `||` replaces top-level keys only, which is exactly the field-group granularity.
        let result = sqlx::query(
            "UPDATE courses \
             SET doc = doc || $2, status = COALESCE($3, status), updated_at = $4 \
             WHERE id = $1",
        )
        .bind(course_id)
        .bind(Json(serde_json::Value::Object(fields)))
        .bind(status)
        .bind(updated_at)
        .execute(&self.pool)
        .await
        .map_err(unexpected)?;

        if result.rows_affected() == 0 {
            return Err(PortError::NotFound(format!("Course {} not found", course_id)));
        }
        Ok(())
    }

    async fn list_courses(&self, user_id: Uuid) -> PortResult<Vec<Course>> {
        let records = sqlx::query_as::<_, CourseRecord>(
            "SELECT doc FROM courses WHERE user_id = $1 AND status <> $2 ORDER BY updated_at DESC",
        )
        .bind(user_id)
        .bind(CourseStatus::Deleted.as_str())
        .fetch_all(&self.pool)
        .await
        .map_err(unexpected)?;
        Ok(records.into_iter().map(CourseRecord::to_domain).collect())
    }

    async fn count_active_courses(&self, user_id: Uuid) -> PortResult<u32> {
        let record = sqlx::query_as::<_, CountRecord>(
            "SELECT COUNT(*) AS count FROM courses WHERE user_id = $1 AND status = $2",
        )
        .bind(user_id)
        .bind(CourseStatus::Active.as_str())
        .fetch_one(&self.pool)
        .await
        .map_err(unexpected)?;
        Ok(record.count.max(0) as u32)
    }
}

//=========================================================================================
// `UsageStore` Trait Implementation
//=========================================================================================

#[async_trait]
impl UsageStore for DbAdapter {
    async fn increment_if_below(
        &self,
        key: &UsageKey,
        amount: u64,
        limit: u64,
    ) -> PortResult<CounterUpdate> {
        // The conditional upsert is the atomic check-and-increment: a row is
        // returned only when the increment was applied.
        let applied = sqlx::query_as::<_, CounterRecord>(
            "INSERT INTO usage_counters (counter_key, user_id, tier, metric, period, used) \
             VALUES ($1, $2, $3, $4, $5, $6) \
             ON CONFLICT (counter_key) DO UPDATE \
               SET used = usage_counters.used + EXCLUDED.used, updated_at = now() \
               WHERE usage_counters.used + EXCLUDED.used <= $7 \
             RETURNING used",
        )
        .bind(key.storage_key())
        .bind(key.user_id)
        .bind(key.tier.as_str())
        .bind(key.window.as_str())
        .bind(&key.period)
        .bind(amount as i64)
        .bind(limit as i64)
        .fetch_optional(&self.pool)
        .await
        .map_err(unexpected)?;

        match applied {
            Some(record) => Ok(CounterUpdate {
                admitted: true,
                used: record.to_domain(),
            }),
            None => Ok(CounterUpdate {
                admitted: false,
                used: self.current(key).await?,
            }),
        }
    }

    async fn current(&self, key: &UsageKey) -> PortResult<u64> {
        let record = sqlx::query_as::<_, CounterRecord>(
            "SELECT used FROM usage_counters WHERE counter_key = $1",
        )
        .bind(key.storage_key())
        .fetch_optional(&self.pool)
        .await
        .map_err(unexpected)?;
        Ok(record.map(CounterRecord::to_domain).unwrap_or(0))
    }
}
