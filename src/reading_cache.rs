use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, info};

use crate::{
    error::ExplainError,
    models::{ExamQuestionCoordinate, OptionReadingEntry, QuestionContext, ReadingCacheEntry, TextReading},
    reading::ReadingAnnotator,
    store::ExplainStore,
    text::split_sentences,
};

/// Per-question readings, computed once and then kept as written.
pub struct ReadingCache {
    store: Arc<dyn ExplainStore>,
    annotator: Arc<ReadingAnnotator>,
}

impl ReadingCache {
    pub fn new(store: Arc<dyn ExplainStore>, annotator: Arc<ReadingAnnotator>) -> Self {
        Self { store, annotator }
    }

    /// Returns the stored entry, filling gaps from a fresh build without
    /// overwriting what was stored. Writes only when nothing was stored or
    /// `force` is set.
    pub async fn fetch_or_build(
        &self,
        coord: &ExamQuestionCoordinate,
        ctx: &QuestionContext,
        force: bool,
    ) -> Result<ReadingCacheEntry, ExplainError> {
        if !force {
            if let Some(stored) = self.store.get_reading(coord).await? {
                if covers(&stored, ctx) {
                    debug!(section = coord.section_index, question = coord.question_index, "reading cache hit");
                    return Ok(stored);
                }
                info!(
                    exam_level = %coord.level,
                    exam_id = %coord.exam_id,
                    part = %coord.part,
                    section = coord.section_index,
                    question = coord.question_index,
                    "stored readings do not cover the question; serving a merged entry, force a refresh to persist it"
                );
                let fresh = self.build(ctx).await?;
                return Ok(merge(stored, fresh));
            }
        }
        let fresh = self.build(ctx).await?;
        self.store.put_reading(coord, &fresh).await?;
        debug!(section = coord.section_index, question = coord.question_index, force, "reading cache written");
        Ok(fresh)
    }

    pub async fn build(&self, ctx: &QuestionContext) -> Result<ReadingCacheEntry, ExplainError> {
        let question = self.annotate(&ctx.blank_question_text).await?;
        let mut options = Vec::with_capacity(ctx.options.len());
        for option in &ctx.options {
            let reading = self.annotate(&option.text).await?;
            options.push(OptionReadingEntry {
                key: option.key.clone(),
                text: option.text.clone(),
                reading: reading.reading,
                ruby: reading.ruby,
            });
        }
        let passage = self.annotate(&ctx.passage_text).await?;
        let mut passage_sentences = Vec::new();
        for sentence in split_sentences(&ctx.passage_text) {
            passage_sentences.push(self.annotate(&sentence).await?);
        }
        Ok(ReadingCacheEntry {
            question,
            options,
            passage,
            passage_sentences,
            built_at: Some(Utc::now()),
        })
    }

    async fn annotate(&self, text: &str) -> Result<TextReading, ExplainError> {
        self.annotator
            .annotate(text, None)
            .await
            .map_err(ExplainError::Tokenizer)
    }
}

fn covers(entry: &ReadingCacheEntry, ctx: &QuestionContext) -> bool {
    let question_ok = ctx.blank_question_text.trim().is_empty() || !entry.question.text.is_empty();
    let passage_ok = ctx.passage_text.trim().is_empty() || !entry.passage.text.is_empty();
    let options_ok = ctx.options.iter().all(|o| entry.option(&o.key).is_some());
    question_ok && passage_ok && options_ok
}

fn merge(mut stored: ReadingCacheEntry, fresh: ReadingCacheEntry) -> ReadingCacheEntry {
    if stored.question.text.is_empty() {
        stored.question = fresh.question;
    }
    if stored.passage.text.is_empty() {
        stored.passage = fresh.passage;
    }
    if stored.passage_sentences.is_empty() {
        stored.passage_sentences = fresh.passage_sentences;
    }
    for option in fresh.options {
        if stored.option(&option.key).is_none() {
            stored.options.push(option);
        }
    }
    stored
}
