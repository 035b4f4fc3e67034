use std::future::Future;
use std::sync::Arc;

use anyhow::Context;
use serde::{de::DeserializeOwned, Serialize};
use serde_json::json;
use tracing::{debug, info, warn};

use crate::{
    context::extract_context,
    error::ExplainError,
    exam_doc::ExamPartDoc,
    explain::{ExplanationGenerator, Generated},
    llm::ChatModel,
    models::{
        Caller, ExamPartRef, ExamQuestionCoordinate, ExplainResponse, ExplainSource, Explanation,
        GroupExplanation, QuestionContext, ReadingCacheEntry, TextReading,
    },
    reading::ReadingAnnotator,
    reading_cache::ReadingCache,
    store::{CacheScope, CachedExplanation, ExplainStore},
};

/// Process-scoped explanation service: cache lookup, quota gate, generation.
pub struct ExplainEngine {
    store: Arc<dyn ExplainStore>,
    annotator: Arc<ReadingAnnotator>,
    readings: ReadingCache,
    generator: ExplanationGenerator,
    prompt_version: String,
}

impl ExplainEngine {
    pub fn new(
        store: Arc<dyn ExplainStore>,
        model: Arc<dyn ChatModel>,
        annotator: Arc<ReadingAnnotator>,
        prompt_version: impl Into<String>,
    ) -> Self {
        Self {
            readings: ReadingCache::new(store.clone(), annotator.clone()),
            generator: ExplanationGenerator::new(model, annotator.clone()),
            store,
            annotator,
            prompt_version: prompt_version.into(),
        }
    }

    pub fn prompt_version(&self) -> &str {
        &self.prompt_version
    }

    pub fn tokenizer_ready(&self) -> bool {
        self.annotator.is_ready()
    }

    pub async fn store_ready(&self) -> bool {
        self.store.ping().await
    }

    pub async fn explain_question(
        &self,
        caller: &Caller,
        coord: &ExamQuestionCoordinate,
        force_refresh: bool,
    ) -> Result<ExplainResponse<Explanation>, ExplainError> {
        ensure_refresh_allowed(caller, force_refresh)?;
        let doc = self.load_doc(&coord.part_ref()).await?;
        let ctx = extract_context(&doc, coord)?;
        let readings = self.readings.fetch_or_build(coord, &ctx, force_refresh).await?;

        let scope = CacheScope::Question(coord.clone());
        let hash = content_hash(&ctx)?;
        self.cached_or_generate(caller, &scope, &hash, force_refresh, || {
            self.generator.generate(&ctx, &readings)
        })
        .await
    }

    pub async fn explain_passage_group(
        &self,
        caller: &Caller,
        part: &ExamPartRef,
        section_index: usize,
        question_indices: &[usize],
        force_refresh: bool,
    ) -> Result<ExplainResponse<GroupExplanation>, ExplainError> {
        ensure_refresh_allowed(caller, force_refresh)?;
        let mut indices = question_indices.to_vec();
        indices.sort_unstable();
        indices.dedup();
        if indices.is_empty() {
            return Err(ExplainError::NotFound("empty question group".to_string()));
        }

        let doc = self.load_doc(part).await?;
        let mut contexts: Vec<QuestionContext> = Vec::with_capacity(indices.len());
        let mut readings: Vec<ReadingCacheEntry> = Vec::with_capacity(indices.len());
        for &question_index in &indices {
            let coord = part.question(section_index, question_index);
            let ctx = extract_context(&doc, &coord)?;
            readings.push(self.readings.fetch_or_build(&coord, &ctx, force_refresh).await?);
            contexts.push(ctx);
        }
        let passage = group_passage(&readings);

        let scope = CacheScope::PassageGroup {
            part: part.clone(),
            section_index,
            group_hash: content_hash(&json!([section_index, indices]))?,
            question_indices: indices,
        };
        let hash = content_hash(&contexts)?;
        self.cached_or_generate(caller, &scope, &hash, force_refresh, || {
            self.generator.generate_group(&passage, &contexts, &readings)
        })
        .await
    }

    /// Reading cache entry for one question, built on first request.
    pub async fn reading_for(
        &self,
        caller: &Caller,
        coord: &ExamQuestionCoordinate,
        refresh: bool,
    ) -> Result<ReadingCacheEntry, ExplainError> {
        ensure_refresh_allowed(caller, refresh)?;
        let doc = self.load_doc(&coord.part_ref()).await?;
        let ctx = extract_context(&doc, coord)?;
        self.readings.fetch_or_build(coord, &ctx, refresh).await
    }

    async fn load_doc(&self, part: &ExamPartRef) -> Result<ExamPartDoc, ExplainError> {
        let payload = self.store.load_exam_part(part).await?.ok_or_else(|| {
            ExplainError::NotFound(format!("exam part {}/{}/{}", part.level, part.exam_id, part.part))
        })?;
        Ok(ExamPartDoc::from_value(&payload))
    }

    async fn cached_or_generate<T, F, Fut>(
        &self,
        caller: &Caller,
        scope: &CacheScope,
        hash: &str,
        force_refresh: bool,
        generate: F,
    ) -> Result<ExplainResponse<T>, ExplainError>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Generated<T>, ExplainError>>,
    {
        if !force_refresh {
            if let Some(hit) = self.lookup(scope, hash).await? {
                debug!(user = %caller.user_id, ?scope, "explanation cache hit");
                return Ok(hit);
            }
            if !caller.privileged {
                let consumed = self
                    .store
                    .try_consume_quota(&caller.user_id, scope, &self.prompt_version)
                    .await?;
                if !consumed {
                    if let Some(hit) = self.lookup(scope, hash).await? {
                        debug!(user = %caller.user_id, "explanation appeared after quota conflict");
                        return Ok(hit);
                    }
                    info!(user = %caller.user_id, ?scope, "explanation quota exhausted");
                    return Err(ExplainError::QuotaExhausted);
                }
                debug!(user = %caller.user_id, "explanation quota consumed");
            }
        }

        let generated = generate().await?;
        let payload = serde_json::to_value(&generated.explanation)
            .context("failed to serialize explanation")?;
        self.store
            .put_explanation(
                scope,
                hash,
                &self.prompt_version,
                &CachedExplanation {
                    payload,
                    model: generated.model.clone(),
                },
            )
            .await?;
        info!(user = %caller.user_id, model = %generated.model, force_refresh, "explanation stored");
        Ok(ExplainResponse {
            source: ExplainSource::Model,
            prompt_version: self.prompt_version.clone(),
            explanation: generated.explanation,
            model: generated.model,
        })
    }

    async fn lookup<T: DeserializeOwned>(
        &self,
        scope: &CacheScope,
        hash: &str,
    ) -> Result<Option<ExplainResponse<T>>, ExplainError> {
        let Some(cached) = self
            .store
            .get_explanation(scope, hash, &self.prompt_version)
            .await?
        else {
            return Ok(None);
        };
        match serde_json::from_value(cached.payload) {
            Ok(explanation) => Ok(Some(ExplainResponse {
                source: ExplainSource::Cache,
                prompt_version: self.prompt_version.clone(),
                explanation,
                model: cached.model,
            })),
            Err(err) => {
                warn!(?scope, "cached explanation unreadable, regenerating: {}", err);
                Ok(None)
            }
        }
    }
}

fn ensure_refresh_allowed(caller: &Caller, force_refresh: bool) -> Result<(), ExplainError> {
    if force_refresh && !caller.privileged {
        return Err(ExplainError::Forbidden(
            "forced refresh requires a privileged caller".to_string(),
        ));
    }
    Ok(())
}

/// Hex blake3 digest of the value's JSON serialization.
pub fn content_hash<T: Serialize + ?Sized>(value: &T) -> Result<String, ExplainError> {
    let bytes = serde_json::to_vec(value).context("failed to serialize hash input")?;
    Ok(blake3::hash(&bytes).to_hex().to_string())
}

/// Distinct passages of the group, in question order.
fn group_passage(readings: &[ReadingCacheEntry]) -> TextReading {
    let mut seen: Vec<&TextReading> = Vec::new();
    for entry in readings {
        if !entry.passage.text.is_empty() && !seen.iter().any(|p| p.text == entry.passage.text) {
            seen.push(&entry.passage);
        }
    }
    TextReading {
        text: seen.iter().map(|p| p.text.as_str()).collect::<Vec<_>>().join("\n"),
        reading: seen.iter().map(|p| p.reading.as_str()).collect::<Vec<_>>().join("\n"),
        ruby: seen.iter().map(|p| p.ruby.as_str()).collect::<Vec<_>>().join("<br>"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::LlmError;
    use crate::models::{QuestionType, Verdict};
    use crate::store::MemoryStore;
    use crate::testing::{test_annotator, ScriptedModel};
    use serde_json::Value;

    const REPLY: &str = r#"{"overview_vi": "Giải thích", "option_analysis": [{"key": "1", "verdict": "correct"}]}"#;

    fn part() -> ExamPartRef {
        ExamPartRef {
            level: "N3".into(),
            exam_id: "2023-07".into(),
            part: "language".into(),
        }
    }

    fn exam_payload() -> Value {
        json!({
            "sections": [
                {
                    "title": "問題2 次の文の（　）に入れるのに最もよいものを選びなさい。",
                    "questions": [
                        {"question": "彼は学校（　）行った。", "options": ["1. を", "2. に", "3. で", "4. が"], "answer": "2"}
                    ]
                },
                {
                    "title": "問題4 次の文章を読んで、質問に答えなさい。",
                    "questions": [
                        {"question": "(1)", "options": ["1. まだ", "2. もう", "3. すぐ", "4. やっと"], "answer": "2", "passage_id": "p1"},
                        {"question": "筆者が一番言いたいことは何か。", "options": ["1. A", "2. B", "3. C", "4. D"], "answer": "3", "passage_id": "p1"}
                    ]
                }
            ],
            "passages": [{"id": "p1", "text": "前置き。彼は（1）学校に行った。前の文。"}]
        })
    }

    fn setup(replies: Vec<Result<String, LlmError>>) -> (ExplainEngine, Arc<MemoryStore>, Arc<ScriptedModel>) {
        let store = Arc::new(MemoryStore::new());
        store.insert_exam_part(part(), exam_payload());
        let model = Arc::new(ScriptedModel::with_results(replies));
        let engine = ExplainEngine::new(store.clone(), model.clone(), Arc::new(test_annotator()), "test-v1");
        (engine, store, model)
    }

    fn learner(id: &str) -> Caller {
        Caller {
            user_id: id.to_string(),
            privileged: false,
        }
    }

    fn admin() -> Caller {
        Caller {
            user_id: "admin".to_string(),
            privileged: true,
        }
    }

    #[tokio::test]
    async fn second_request_is_served_from_cache() {
        let (engine, _, model) = setup(vec![Ok(REPLY.to_string())]);
        let coord = part().question(0, 0);

        let first = engine.explain_question(&learner("u1"), &coord, false).await.unwrap();
        let second = engine.explain_question(&learner("u1"), &coord, false).await.unwrap();
        assert_eq!(first.source, ExplainSource::Model);
        assert_eq!(second.source, ExplainSource::Cache);
        assert_eq!(
            serde_json::to_string(&first.explanation).unwrap(),
            serde_json::to_string(&second.explanation).unwrap()
        );
        assert_eq!(second.model, "scripted-1");
        assert_eq!(second.prompt_version, "test-v1");
        assert_eq!(model.calls(), 1);

        let analysis = &first.explanation.option_analysis;
        assert_eq!(analysis[0].verdict, Verdict::Wrong);
        assert_eq!(analysis[1].verdict, Verdict::Correct);
        assert_eq!(first.explanation.question_type, QuestionType::GrammarChoice);
    }

    #[tokio::test]
    async fn quota_is_consumed_once_per_user_and_question() {
        let (engine, store, model) = setup(vec![Ok(REPLY.to_string())]);
        let coord = part().question(0, 0);

        engine.explain_question(&learner("u1"), &coord, false).await.unwrap();
        let again = engine.explain_question(&learner("u1"), &coord, false).await.unwrap();
        assert_eq!(again.source, ExplainSource::Cache);
        let other = engine.explain_question(&learner("u2"), &coord, false).await.unwrap();
        assert_eq!(other.source, ExplainSource::Cache);
        assert_eq!(store.quota_rows(), 1);
        assert_eq!(model.calls(), 1);
    }

    #[tokio::test]
    async fn consumed_quota_without_cache_is_exhausted() {
        let (engine, store, model) = setup(vec![Ok(REPLY.to_string())]);
        let coord = part().question(0, 0);
        store
            .try_consume_quota("u1", &CacheScope::Question(coord.clone()), "test-v1")
            .await
            .unwrap();

        let err = engine.explain_question(&learner("u1"), &coord, false).await.unwrap_err();
        assert!(matches!(err, ExplainError::QuotaExhausted));
        assert_eq!(model.calls(), 0);
    }

    #[tokio::test]
    async fn forced_refresh_from_learner_is_forbidden_before_lookup() {
        let (engine, store, model) = setup(vec![]);
        let missing = ExamPartRef {
            exam_id: "does-not-exist".into(),
            ..part()
        };
        let err = engine
            .explain_question(&learner("u1"), &missing.question(9, 9), true)
            .await
            .unwrap_err();
        assert!(matches!(err, ExplainError::Forbidden(_)));
        let err = engine
            .explain_passage_group(&learner("u1"), &missing, 9, &[1], true)
            .await
            .unwrap_err();
        assert!(matches!(err, ExplainError::Forbidden(_)));
        let err = engine.reading_for(&learner("u1"), &part().question(0, 0), true).await.unwrap_err();
        assert!(matches!(err, ExplainError::Forbidden(_)));
        assert!(store.get_reading(&part().question(0, 0)).await.unwrap().is_none());
        assert_eq!(model.calls(), 0);
        assert_eq!(store.quota_rows(), 0);
    }

    #[tokio::test]
    async fn privileged_refresh_regenerates_without_quota() {
        let (engine, store, model) = setup(vec![Ok(REPLY.to_string()), Ok(r#"{"overview_vi": "Mới"}"#.to_string())]);
        let coord = part().question(0, 0);
        engine.explain_question(&admin(), &coord, false).await.unwrap();
        let refreshed = engine.explain_question(&admin(), &coord, true).await.unwrap();
        assert_eq!(refreshed.source, ExplainSource::Model);
        assert_eq!(refreshed.explanation.overview_vi, "Mới");
        let cached = engine.explain_question(&learner("u1"), &coord, false).await.unwrap();
        assert_eq!(cached.explanation.overview_vi, "Mới");
        assert_eq!(model.calls(), 2);
        assert_eq!(store.quota_rows(), 0);
        assert_eq!(store.explanation_rows(), 1);
    }

    #[tokio::test]
    async fn prompt_version_bump_creates_new_entry() {
        let store = Arc::new(MemoryStore::new());
        store.insert_exam_part(part(), exam_payload());
        let model = Arc::new(ScriptedModel::new([REPLY, REPLY]));
        let coord = part().question(0, 0);
        for version in ["v1", "v2"] {
            let engine = ExplainEngine::new(store.clone(), model.clone(), Arc::new(test_annotator()), version);
            let response = engine.explain_question(&learner("u1"), &coord, false).await.unwrap();
            assert_eq!(response.source, ExplainSource::Model);
        }
        assert_eq!(store.explanation_rows(), 2);
        assert_eq!(model.calls(), 2);
    }

    #[tokio::test]
    async fn missing_coordinates_are_not_found() {
        let (engine, store, model) = setup(vec![]);
        let err = engine
            .explain_question(&learner("u1"), &part().question(0, 5), false)
            .await
            .unwrap_err();
        assert!(matches!(err, ExplainError::NotFound(_)));
        let other_part = ExamPartRef {
            part: "listening".into(),
            ..part()
        };
        let err = engine
            .explain_question(&learner("u1"), &other_part.question(0, 0), false)
            .await
            .unwrap_err();
        assert!(matches!(err, ExplainError::NotFound(_)));
        assert_eq!(store.quota_rows(), 0);
        assert_eq!(model.calls(), 0);
    }

    #[tokio::test]
    async fn upstream_failure_is_reported() {
        let (engine, _, _) = setup(vec![Err(LlmError::Status {
            status: 503,
            body: "unavailable".into(),
        })]);
        let err = engine
            .explain_question(&admin(), &part().question(0, 0), false)
            .await
            .unwrap_err();
        assert!(matches!(err, ExplainError::UpstreamCall(_)));
    }

    #[tokio::test]
    async fn passage_group_is_cached_under_normalized_indices() {
        let reply = r#"{"passage": {"summary_vi": "Tóm tắt"}, "questions": [{"overview_vi": "Q1"}, {"overview_vi": "Q2"}]}"#;
        let (engine, store, model) = setup(vec![Ok(reply.to_string())]);

        let first = engine
            .explain_passage_group(&learner("u1"), &part(), 1, &[1, 0], false)
            .await
            .unwrap();
        assert_eq!(first.source, ExplainSource::Model);
        let group = &first.explanation;
        assert_eq!(group.passage.text, "前置き。彼は（1）学校に行った。前の文。");
        assert!(!group.passage.reading.is_empty());
        assert_eq!(group.passage.summary_vi, "Tóm tắt");
        assert_eq!(group.questions.len(), 2);
        assert_eq!(group.questions[0].question_type, QuestionType::ReadingCloze);
        assert_eq!(group.questions[0].question.text, "彼は（1）学校に行った。");
        assert_eq!(group.questions[1].overview_vi, "Q2");

        let second = engine
            .explain_passage_group(&learner("u1"), &part(), 1, &[0, 1, 1], false)
            .await
            .unwrap();
        assert_eq!(second.source, ExplainSource::Cache);
        assert_eq!(model.calls(), 1);
        assert_eq!(store.quota_rows(), 1);

        let err = engine
            .explain_passage_group(&learner("u1"), &part(), 1, &[], false)
            .await
            .unwrap_err();
        assert!(matches!(err, ExplainError::NotFound(_)));
        let err = engine
            .explain_passage_group(&learner("u1"), &part(), 1, &[0, 7], false)
            .await
            .unwrap_err();
        assert!(matches!(err, ExplainError::NotFound(_)));
    }

    #[tokio::test]
    async fn readings_route_builds_and_reuses_entry() {
        let (engine, _, model) = setup(vec![]);
        let coord = part().question(1, 0);
        let entry = engine.reading_for(&learner("u1"), &coord, false).await.unwrap();
        assert_eq!(entry.question.text, "彼は（1）学校に行った。");
        assert_eq!(entry.passage_sentences.len(), 3);
        let again = engine.reading_for(&learner("u1"), &coord, false).await.unwrap();
        assert_eq!(entry, again);
        assert!(engine.tokenizer_ready());
        assert_eq!(model.calls(), 0);
    }

    #[test]
    fn content_hash_tracks_question_content() {
        let ctx = QuestionContext {
            question_text: "a".into(),
            ..QuestionContext::default()
        };
        let mut changed = ctx.clone();
        changed.question_text = "b".into();
        assert_eq!(content_hash(&ctx).unwrap(), content_hash(&ctx.clone()).unwrap());
        assert_ne!(content_hash(&ctx).unwrap(), content_hash(&changed).unwrap());
    }
}
