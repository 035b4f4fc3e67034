use std::path::Path;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::{mapref::entry::Entry, DashMap};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{info, warn};

use crate::models::{ExamPartRef, ExamQuestionCoordinate, ReadingCacheEntry};

/// What an explanation cache row or quota row is about.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum CacheScope {
    Question(ExamQuestionCoordinate),
    PassageGroup {
        part: ExamPartRef,
        section_index: usize,
        group_hash: String,
        question_indices: Vec<usize>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedExplanation {
    pub payload: Value,
    pub model: String,
}

/// Persistence used by the engine. Exam parts are read-only; everything else
/// is owned by the engine.
#[async_trait]
pub trait ExplainStore: Send + Sync {
    async fn ping(&self) -> bool;

    async fn load_exam_part(&self, part: &ExamPartRef) -> Result<Option<Value>>;

    async fn get_reading(&self, coord: &ExamQuestionCoordinate) -> Result<Option<ReadingCacheEntry>>;

    /// Inserts or replaces the reading entry for one coordinate.
    async fn put_reading(&self, coord: &ExamQuestionCoordinate, entry: &ReadingCacheEntry) -> Result<()>;

    async fn get_explanation(
        &self,
        scope: &CacheScope,
        content_hash: &str,
        prompt_version: &str,
    ) -> Result<Option<CachedExplanation>>;

    async fn put_explanation(
        &self,
        scope: &CacheScope,
        content_hash: &str,
        prompt_version: &str,
        cached: &CachedExplanation,
    ) -> Result<()>;

    /// Records a quota row; `false` when the row already existed.
    async fn try_consume_quota(
        &self,
        user_id: &str,
        scope: &CacheScope,
        prompt_version: &str,
    ) -> Result<bool>;
}

type ExplanationKey = (CacheScope, String, String);
type QuotaKey = (String, CacheScope, String);

/// In-process store for local runs and tests.
#[derive(Default)]
pub struct MemoryStore {
    exam_parts: DashMap<ExamPartRef, Value>,
    readings: DashMap<ExamQuestionCoordinate, ReadingCacheEntry>,
    explanations: DashMap<ExplanationKey, CachedExplanation>,
    quota: DashMap<QuotaKey, DateTime<Utc>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_exam_part(&self, part: ExamPartRef, payload: Value) {
        self.exam_parts.insert(part, payload);
    }

    /// Loads every `{level}/{exam_id}/{part}.json` below `root`. A missing
    /// directory yields an empty store.
    pub async fn seed_from_dir(root: &Path) -> Result<Self> {
        let store = Self::new();
        if !tokio::fs::try_exists(root).await.unwrap_or(false) {
            warn!(dir = %root.display(), "exam data directory not found; starting empty");
            return Ok(store);
        }
        for level_dir in sub_dirs(root).await? {
            for exam_dir in sub_dirs(&level_dir).await? {
                let mut files = tokio::fs::read_dir(&exam_dir)
                    .await
                    .with_context(|| format!("failed to list {}", exam_dir.display()))?;
                while let Some(file) = files.next_entry().await? {
                    let path = file.path();
                    if path.extension().and_then(|e| e.to_str()) != Some("json") {
                        continue;
                    }
                    let raw = tokio::fs::read_to_string(&path)
                        .await
                        .with_context(|| format!("failed to read {}", path.display()))?;
                    let payload: Value = serde_json::from_str(&raw)
                        .with_context(|| format!("invalid exam JSON in {}", path.display()))?;
                    let part = ExamPartRef {
                        level: file_name(&level_dir),
                        exam_id: file_name(&exam_dir),
                        part: path
                            .file_stem()
                            .map(|s| s.to_string_lossy().into_owned())
                            .unwrap_or_default(),
                    };
                    store.insert_exam_part(part, payload);
                }
            }
        }
        info!(dir = %root.display(), parts = store.exam_parts.len(), "exam parts loaded");
        Ok(store)
    }

    #[cfg(test)]
    pub fn quota_rows(&self) -> usize {
        self.quota.len()
    }

    #[cfg(test)]
    pub fn explanation_rows(&self) -> usize {
        self.explanations.len()
    }
}

async fn sub_dirs(dir: &Path) -> Result<Vec<std::path::PathBuf>> {
    let mut out = Vec::new();
    let mut entries = tokio::fs::read_dir(dir)
        .await
        .with_context(|| format!("failed to list {}", dir.display()))?;
    while let Some(entry) = entries.next_entry().await? {
        if entry.file_type().await?.is_dir() {
            out.push(entry.path());
        }
    }
    out.sort();
    Ok(out)
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default()
}

#[async_trait]
impl ExplainStore for MemoryStore {
    async fn ping(&self) -> bool {
        true
    }

    async fn load_exam_part(&self, part: &ExamPartRef) -> Result<Option<Value>> {
        Ok(self.exam_parts.get(part).map(|v| v.value().clone()))
    }

    async fn get_reading(&self, coord: &ExamQuestionCoordinate) -> Result<Option<ReadingCacheEntry>> {
        Ok(self.readings.get(coord).map(|v| v.value().clone()))
    }

    async fn put_reading(&self, coord: &ExamQuestionCoordinate, entry: &ReadingCacheEntry) -> Result<()> {
        self.readings.insert(coord.clone(), entry.clone());
        Ok(())
    }

    async fn get_explanation(
        &self,
        scope: &CacheScope,
        content_hash: &str,
        prompt_version: &str,
    ) -> Result<Option<CachedExplanation>> {
        let key = (scope.clone(), content_hash.to_string(), prompt_version.to_string());
        Ok(self.explanations.get(&key).map(|v| v.value().clone()))
    }

    async fn put_explanation(
        &self,
        scope: &CacheScope,
        content_hash: &str,
        prompt_version: &str,
        cached: &CachedExplanation,
    ) -> Result<()> {
        let key = (scope.clone(), content_hash.to_string(), prompt_version.to_string());
        self.explanations.insert(key, cached.clone());
        Ok(())
    }

    async fn try_consume_quota(
        &self,
        user_id: &str,
        scope: &CacheScope,
        prompt_version: &str,
    ) -> Result<bool> {
        let key = (user_id.to_string(), scope.clone(), prompt_version.to_string());
        Ok(match self.quota.entry(key) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                slot.insert(Utc::now());
                true
            }
        })
    }
}
