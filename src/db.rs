use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::Value;
use sqlx::{postgres::PgPoolOptions, Pool, Postgres, Row};
use tokio::sync::OnceCell;
use tracing::info;

use crate::{
    models::{ExamPartRef, ExamQuestionCoordinate, ReadingCacheEntry},
    store::{CacheScope, CachedExplanation, ExplainStore},
};

pub type DbPool = Pool<Postgres>;

pub async fn init_pool(database_url: &str) -> anyhow::Result<DbPool> {
    let pool = PgPoolOptions::new()
        .max_connections(16)
        .min_connections(2)
        .idle_timeout(std::time::Duration::from_secs(10))
        .connect(database_url)
        .await?;
    Ok(pool)
}

const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS exam_question_readings (
        level TEXT NOT NULL,
        exam_id TEXT NOT NULL,
        part TEXT NOT NULL,
        section_index INT NOT NULL,
        question_index INT NOT NULL,
        payload JSONB NOT NULL,
        created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
        updated_at TIMESTAMPTZ NOT NULL DEFAULT now(),
        PRIMARY KEY (level, exam_id, part, section_index, question_index)
    )",
    "CREATE TABLE IF NOT EXISTS exam_question_explanations (
        level TEXT NOT NULL,
        exam_id TEXT NOT NULL,
        part TEXT NOT NULL,
        section_index INT NOT NULL,
        question_index INT NOT NULL,
        content_hash TEXT NOT NULL,
        prompt_version TEXT NOT NULL,
        payload JSONB NOT NULL,
        model TEXT NOT NULL,
        created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
        updated_at TIMESTAMPTZ NOT NULL DEFAULT now(),
        PRIMARY KEY (level, exam_id, part, section_index, question_index, content_hash, prompt_version)
    )",
    "CREATE TABLE IF NOT EXISTS exam_explanation_requests (
        id BIGSERIAL PRIMARY KEY,
        user_id TEXT NOT NULL,
        level TEXT NOT NULL,
        exam_id TEXT NOT NULL,
        part TEXT NOT NULL,
        section_index INT NOT NULL,
        question_index INT NOT NULL,
        prompt_version TEXT NOT NULL,
        created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
        UNIQUE (user_id, level, exam_id, part, section_index, question_index, prompt_version)
    )",
    "CREATE TABLE IF NOT EXISTS exam_passage_explanations (
        level TEXT NOT NULL,
        exam_id TEXT NOT NULL,
        part TEXT NOT NULL,
        section_index INT NOT NULL,
        group_hash TEXT NOT NULL,
        question_indices JSONB NOT NULL,
        content_hash TEXT NOT NULL,
        prompt_version TEXT NOT NULL,
        payload JSONB NOT NULL,
        model TEXT NOT NULL,
        created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
        updated_at TIMESTAMPTZ NOT NULL DEFAULT now(),
        PRIMARY KEY (level, exam_id, part, section_index, group_hash, content_hash, prompt_version)
    )",
    "CREATE TABLE IF NOT EXISTS exam_passage_explanation_requests (
        id BIGSERIAL PRIMARY KEY,
        user_id TEXT NOT NULL,
        level TEXT NOT NULL,
        exam_id TEXT NOT NULL,
        part TEXT NOT NULL,
        section_index INT NOT NULL,
        group_hash TEXT NOT NULL,
        prompt_version TEXT NOT NULL,
        created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
        UNIQUE (user_id, level, exam_id, part, section_index, group_hash, prompt_version)
    )",
];

/// Postgres-backed store. Tables are created on first use; a failed attempt
/// is retried by the next call.
pub struct PgStore {
    pool: DbPool,
    schema: OnceCell<()>,
}

impl PgStore {
    pub fn new(pool: DbPool) -> Self {
        Self {
            pool,
            schema: OnceCell::new(),
        }
    }

    async fn ensure_schema(&self) -> Result<()> {
        self.schema
            .get_or_try_init(|| async {
                for statement in SCHEMA {
                    sqlx::query(statement)
                        .execute(&self.pool)
                        .await
                        .context("failed to create explanation tables")?;
                }
                info!("explanation tables ready");
                Ok::<(), anyhow::Error>(())
            })
            .await?;
        Ok(())
    }
}

fn index(value: usize) -> Result<i32> {
    i32::try_from(value).context("index out of range for storage")
}

#[async_trait]
impl ExplainStore for PgStore {
    async fn ping(&self) -> bool {
        sqlx::query_scalar::<_, i32>("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .map(|v| v == 1)
            .unwrap_or(false)
    }

    async fn load_exam_part(&self, part: &ExamPartRef) -> Result<Option<Value>> {
        let row = sqlx::query("SELECT payload FROM exam_parts WHERE level = $1 AND exam_id = $2 AND part = $3")
            .bind(&part.level)
            .bind(&part.exam_id)
            .bind(&part.part)
            .fetch_optional(&self.pool)
            .await
            .context("failed to load exam part")?;
        Ok(row.map(|r| r.try_get::<Value, _>("payload")).transpose()?)
    }

    async fn get_reading(&self, coord: &ExamQuestionCoordinate) -> Result<Option<ReadingCacheEntry>> {
        self.ensure_schema().await?;
        let row = sqlx::query(
            "SELECT payload FROM exam_question_readings
             WHERE level = $1 AND exam_id = $2 AND part = $3 AND section_index = $4 AND question_index = $5",
        )
        .bind(&coord.level)
        .bind(&coord.exam_id)
        .bind(&coord.part)
        .bind(index(coord.section_index)?)
        .bind(index(coord.question_index)?)
        .fetch_optional(&self.pool)
        .await?;
        match row {
            Some(row) => {
                let payload: Value = row.try_get("payload")?;
                Ok(Some(serde_json::from_value(payload)?))
            }
            None => Ok(None),
        }
    }

    async fn put_reading(&self, coord: &ExamQuestionCoordinate, entry: &ReadingCacheEntry) -> Result<()> {
        self.ensure_schema().await?;
        sqlx::query(
            "INSERT INTO exam_question_readings(level, exam_id, part, section_index, question_index, payload)
             VALUES ($1,$2,$3,$4,$5,$6)
             ON CONFLICT (level, exam_id, part, section_index, question_index)
             DO UPDATE SET payload = EXCLUDED.payload, updated_at = now()",
        )
        .bind(&coord.level)
        .bind(&coord.exam_id)
        .bind(&coord.part)
        .bind(index(coord.section_index)?)
        .bind(index(coord.question_index)?)
        .bind(serde_json::to_value(entry)?)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_explanation(
        &self,
        scope: &CacheScope,
        content_hash: &str,
        prompt_version: &str,
    ) -> Result<Option<CachedExplanation>> {
        self.ensure_schema().await?;
        let row = match scope {
            CacheScope::Question(coord) => {
                sqlx::query(
                    "SELECT payload, model FROM exam_question_explanations
                     WHERE level = $1 AND exam_id = $2 AND part = $3 AND section_index = $4
                       AND question_index = $5 AND content_hash = $6 AND prompt_version = $7",
                )
                .bind(&coord.level)
                .bind(&coord.exam_id)
                .bind(&coord.part)
                .bind(index(coord.section_index)?)
                .bind(index(coord.question_index)?)
                .bind(content_hash)
                .bind(prompt_version)
                .fetch_optional(&self.pool)
                .await?
            }
            CacheScope::PassageGroup {
                part,
                section_index,
                group_hash,
                ..
            } => {
                sqlx::query(
                    "SELECT payload, model FROM exam_passage_explanations
                     WHERE level = $1 AND exam_id = $2 AND part = $3 AND section_index = $4
                       AND group_hash = $5 AND content_hash = $6 AND prompt_version = $7",
                )
                .bind(&part.level)
                .bind(&part.exam_id)
                .bind(&part.part)
                .bind(index(*section_index)?)
                .bind(group_hash)
                .bind(content_hash)
                .bind(prompt_version)
                .fetch_optional(&self.pool)
                .await?
            }
        };
        match row {
            Some(row) => Ok(Some(CachedExplanation {
                payload: row.try_get("payload")?,
                model: row.try_get("model")?,
            })),
            None => Ok(None),
        }
    }

    async fn put_explanation(
        &self,
        scope: &CacheScope,
        content_hash: &str,
        prompt_version: &str,
        cached: &CachedExplanation,
    ) -> Result<()> {
        self.ensure_schema().await?;
        match scope {
            CacheScope::Question(coord) => {
                sqlx::query(
                    "INSERT INTO exam_question_explanations(level, exam_id, part, section_index, question_index, content_hash, prompt_version, payload, model)
                     VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9)
                     ON CONFLICT (level, exam_id, part, section_index, question_index, content_hash, prompt_version)
                     DO UPDATE SET payload = EXCLUDED.payload, model = EXCLUDED.model, updated_at = now()",
                )
                .bind(&coord.level)
                .bind(&coord.exam_id)
                .bind(&coord.part)
                .bind(index(coord.section_index)?)
                .bind(index(coord.question_index)?)
                .bind(content_hash)
                .bind(prompt_version)
                .bind(&cached.payload)
                .bind(&cached.model)
                .execute(&self.pool)
                .await?;
            }
            CacheScope::PassageGroup {
                part,
                section_index,
                group_hash,
                question_indices,
            } => {
                sqlx::query(
                    "INSERT INTO exam_passage_explanations(level, exam_id, part, section_index, group_hash, question_indices, content_hash, prompt_version, payload, model)
                     VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10)
                     ON CONFLICT (level, exam_id, part, section_index, group_hash, content_hash, prompt_version)
                     DO UPDATE SET payload = EXCLUDED.payload, model = EXCLUDED.model, updated_at = now()",
                )
                .bind(&part.level)
                .bind(&part.exam_id)
                .bind(&part.part)
                .bind(index(*section_index)?)
                .bind(group_hash)
                .bind(serde_json::to_value(question_indices)?)
                .bind(content_hash)
                .bind(prompt_version)
                .bind(&cached.payload)
                .bind(&cached.model)
                .execute(&self.pool)
                .await?;
            }
        }
        Ok(())
    }

    async fn try_consume_quota(
        &self,
        user_id: &str,
        scope: &CacheScope,
        prompt_version: &str,
    ) -> Result<bool> {
        self.ensure_schema().await?;
        let result = match scope {
            CacheScope::Question(coord) => {
                sqlx::query(
                    "INSERT INTO exam_explanation_requests(user_id, level, exam_id, part, section_index, question_index, prompt_version)
                     VALUES ($1,$2,$3,$4,$5,$6,$7)
                     ON CONFLICT DO NOTHING",
                )
                .bind(user_id)
                .bind(&coord.level)
                .bind(&coord.exam_id)
                .bind(&coord.part)
                .bind(index(coord.section_index)?)
                .bind(index(coord.question_index)?)
                .bind(prompt_version)
                .execute(&self.pool)
                .await?
            }
            CacheScope::PassageGroup {
                part,
                section_index,
                group_hash,
                ..
            } => {
                sqlx::query(
                    "INSERT INTO exam_passage_explanation_requests(user_id, level, exam_id, part, section_index, group_hash, prompt_version)
                     VALUES ($1,$2,$3,$4,$5,$6,$7)
                     ON CONFLICT DO NOTHING",
                )
                .bind(user_id)
                .bind(&part.level)
                .bind(&part.exam_id)
                .bind(&part.part)
                .bind(index(*section_index)?)
                .bind(group_hash)
                .bind(prompt_version)
                .execute(&self.pool)
                .await?
            }
        };
        Ok(result.rows_affected() == 1)
    }
}
