//! Database operations for Outbox

use sqlx::sqlite::SqlitePool;
use sqlx::Row;
use std::path::Path;

use crate::error::{DbError, Result};
use crate::types::{PostStatus, ScheduledPost};

#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Create a new database connection
    pub async fn new(db_path: &str) -> Result<Self> {
        // Expand path and create parent directories
        let expanded_path = shellexpand::tilde(db_path).to_string();
        let path = Path::new(&expanded_path);

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(DbError::IoError)?;
        }

        // Use mode=rwc to allow creating the database file if it doesn't exist
        let db_url = format!("sqlite://{}?mode=rwc", expanded_path.replace('\\', "/"));

        let pool = SqlitePool::connect(&db_url)
            .await
            .map_err(DbError::SqlxError)?;

        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .map_err(DbError::MigrationError)?;

        Ok(Self { pool })
    }

    /// Shared connection pool (the vault runs over the same database)
    pub fn pool(&self) -> SqlitePool {
        self.pool.clone()
    }

    /// Schedule a post for future publication.
    ///
    /// A tenant can hold at most one post per scheduled time; a second
    /// insert for the same slot fails with `DbError::DuplicateSchedule`.
    pub async fn create_scheduled_post(
        &self,
        tenant_id: &str,
        content: &str,
        image_ref: Option<&str>,
        scheduled_time: i64,
    ) -> Result<i64> {
        let now = chrono::Utc::now().timestamp();

        let result = sqlx::query(
            r#"
            INSERT INTO scheduled_posts (tenant_id, content, image_ref, scheduled_time, status, created_at)
            VALUES (?, ?, ?, ?, 'pending', ?)
            "#,
        )
        .bind(tenant_id)
        .bind(content)
        .bind(image_ref)
        .bind(scheduled_time)
        .bind(now)
        .execute(&self.pool)
        .await;

        match result {
            Ok(r) => Ok(r.last_insert_rowid()),
            Err(sqlx::Error::Database(e)) if e.is_unique_violation() => {
                Err(DbError::DuplicateSchedule.into())
            }
            Err(e) => Err(DbError::SqlxError(e).into()),
        }
    }

    /// Get a scheduled post by ID
    pub async fn get_scheduled_post(&self, id: i64) -> Result<Option<ScheduledPost>> {
        let row = sqlx::query(
            r#"
            SELECT id, tenant_id, content, image_ref, scheduled_time, status,
                   error_message, provider_post_id, created_at, published_at
            FROM scheduled_posts WHERE id = ?
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(row.map(row_to_post))
    }

    /// All pending posts whose scheduled time has passed, oldest first
    pub async fn get_due_posts(&self, now: i64) -> Result<Vec<ScheduledPost>> {
        let rows = sqlx::query(
            r#"
            SELECT id, tenant_id, content, image_ref, scheduled_time, status,
                   error_message, provider_post_id, created_at, published_at
            FROM scheduled_posts
            WHERE status = 'pending' AND scheduled_time <= ?
            ORDER BY scheduled_time ASC
            "#,
        )
        .bind(now)
        .fetch_all(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(rows.into_iter().map(row_to_post).collect())
    }

    /// Record a successful publication.
    ///
    /// Conditional on the row still being pending, which makes terminal
    /// states sticky: a late or duplicate worker write is a no-op.
    /// Returns whether the row actually transitioned.
    pub async fn mark_published(
        &self,
        id: i64,
        provider_post_id: &str,
        published_at: i64,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE scheduled_posts
            SET status = 'published', provider_post_id = ?, published_at = ?, error_message = NULL
            WHERE id = ? AND status = 'pending'
            "#,
        )
        .bind(provider_post_id)
        .bind(published_at)
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(result.rows_affected() > 0)
    }

    /// Record a terminal failure, with the same pending guard as
    /// `mark_published`
    pub async fn mark_failed(&self, id: i64, error_message: &str) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE scheduled_posts
            SET status = 'failed', error_message = ?
            WHERE id = ? AND status = 'pending'
            "#,
        )
        .bind(error_message)
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(result.rows_affected() > 0)
    }

    /// Tenant-initiated cancellation; only pending posts can be removed
    pub async fn delete_scheduled_post(&self, id: i64, tenant_id: &str) -> Result<bool> {
        let result = sqlx::query(
            r#"
            DELETE FROM scheduled_posts
            WHERE id = ? AND tenant_id = ? AND status = 'pending'
            "#,
        )
        .bind(id)
        .bind(tenant_id)
        .execute(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(result.rows_affected() > 0)
    }

    /// List posts, optionally filtered by tenant and status, newest
    /// schedule first
    pub async fn list_posts(
        &self,
        tenant_id: Option<&str>,
        status: Option<PostStatus>,
        limit: i64,
    ) -> Result<Vec<ScheduledPost>> {
        let mut where_clauses = vec!["1=1"];
        if tenant_id.is_some() {
            where_clauses.push("tenant_id = ?");
        }
        if status.is_some() {
            where_clauses.push("status = ?");
        }

        let query_str = format!(
            r#"
            SELECT id, tenant_id, content, image_ref, scheduled_time, status,
                   error_message, provider_post_id, created_at, published_at
            FROM scheduled_posts
            WHERE {}
            ORDER BY scheduled_time DESC
            LIMIT ?
            "#,
            where_clauses.join(" AND ")
        );

        let mut query = sqlx::query(&query_str);
        if let Some(tenant) = tenant_id {
            query = query.bind(tenant);
        }
        if let Some(s) = status {
            query = query.bind(s.as_str());
        }
        query = query.bind(limit);

        let rows = query
            .fetch_all(&self.pool)
            .await
            .map_err(DbError::SqlxError)?;

        Ok(rows.into_iter().map(row_to_post).collect())
    }

    /// Post counts per status, for queue stats
    pub async fn count_by_status(&self) -> Result<Vec<(PostStatus, i64)>> {
        let rows = sqlx::query(
            r#"
            SELECT status, COUNT(*) AS n FROM scheduled_posts GROUP BY status
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(rows
            .into_iter()
            .filter_map(|r| {
                let status = PostStatus::parse(&r.get::<String, _>("status"))?;
                Some((status, r.get::<i64, _>("n")))
            })
            .collect())
    }
}

fn row_to_post(r: sqlx::sqlite::SqliteRow) -> ScheduledPost {
    ScheduledPost {
        id: r.get("id"),
        tenant_id: r.get("tenant_id"),
        content: r.get("content"),
        image_ref: r.get("image_ref"),
        scheduled_time: r.get("scheduled_time"),
        status: PostStatus::parse(&r.get::<String, _>("status")).unwrap_or(PostStatus::Pending),
        error_message: r.get("error_message"),
        provider_post_id: r.get("provider_post_id"),
        created_at: r.get("created_at"),
        published_at: r.get("published_at"),
    }
}
