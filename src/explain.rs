use std::sync::Arc;

use serde_json::Value;
use tracing::info;

use crate::{
    error::ExplainError,
    exam_doc::normalize_key,
    llm::{json_from_response, ChatModel, ChatRequest},
    models::{
        Explanation, GrammarPoint, GroupExplanation, OptionAnalysis, OptionReading, PassageSummary,
        QuestionBlock, QuestionContext, QuestionType, ReadingCacheEntry, TextReading, Verdict,
        VocabItem,
    },
    prompts::{explain_user_prompt, passage_user_prompt, EXPLAIN_SYSTEM, PASSAGE_SYSTEM},
    reading::{is_ideograph, ReadingAnnotator},
    sentence_order::solve_sentence_order,
};

const GENERATION_TEMPERATURE: f32 = 0.2;

#[derive(Debug, Clone)]
pub struct Generated<T> {
    pub explanation: T,
    pub model: String,
}

/// Calls the model once per request and normalizes whatever comes back.
pub struct ExplanationGenerator {
    model: Arc<dyn ChatModel>,
    annotator: Arc<ReadingAnnotator>,
}

impl ExplanationGenerator {
    pub fn new(model: Arc<dyn ChatModel>, annotator: Arc<ReadingAnnotator>) -> Self {
        Self { model, annotator }
    }

    pub async fn generate(
        &self,
        ctx: &QuestionContext,
        readings: &ReadingCacheEntry,
    ) -> Result<Generated<Explanation>, ExplainError> {
        let request = ChatRequest {
            system: EXPLAIN_SYSTEM.to_string(),
            user: explain_user_prompt(ctx, readings),
            temperature: GENERATION_TEMPERATURE,
            json_mode: true,
        };
        let completion = self.model.complete(&request).await?;
        info!(
            model = %completion.model,
            latency_s = completion.latency_s,
            prompt_tokens = ?completion.usage.prompt_tokens,
            completion_tokens = ?completion.usage.completion_tokens,
            total_tokens = ?completion.usage.total_tokens,
            question_type = ctx.question_type().as_str(),
            "explanation generated"
        );
        let raw = json_from_response(&completion.content)?;
        let explanation = self.finish(ctx, readings, &raw).await?;
        Ok(Generated {
            explanation,
            model: completion.model,
        })
    }

    pub async fn generate_group(
        &self,
        passage: &TextReading,
        contexts: &[QuestionContext],
        readings: &[ReadingCacheEntry],
    ) -> Result<Generated<GroupExplanation>, ExplainError> {
        let request = ChatRequest {
            system: PASSAGE_SYSTEM.to_string(),
            user: passage_user_prompt(passage, contexts, readings),
            temperature: GENERATION_TEMPERATURE,
            json_mode: true,
        };
        let completion = self.model.complete(&request).await?;
        info!(
            model = %completion.model,
            latency_s = completion.latency_s,
            questions = contexts.len(),
            "passage explanation generated"
        );
        let raw = json_from_response(&completion.content)?;

        let items = raw
            .get("questions")
            .and_then(Value::as_array)
            .map(Vec::as_slice)
            .unwrap_or(&[]);
        let mut questions = Vec::with_capacity(contexts.len());
        for (idx, (ctx, reading)) in contexts.iter().zip(readings.iter()).enumerate() {
            let item = items.get(idx).unwrap_or(&Value::Null);
            questions.push(self.finish(ctx, reading, item).await?);
        }

        let summary = raw.get("passage").unwrap_or(&Value::Null);
        Ok(Generated {
            explanation: GroupExplanation {
                passage: PassageSummary {
                    text: passage.text.clone(),
                    reading: passage.reading.clone(),
                    ruby: passage.ruby.clone(),
                    summary_vi: str_field(summary, "summary_vi"),
                    translation_vi: str_field(summary, "translation_vi"),
                },
                questions,
            },
            model: completion.model,
        })
    }

    async fn finish(
        &self,
        ctx: &QuestionContext,
        readings: &ReadingCacheEntry,
        raw: &Value,
    ) -> Result<Explanation, ExplainError> {
        let mut explanation = normalize_explanation(ctx, readings, raw);
        if ctx.question_type() == QuestionType::SentenceOrder {
            let proposal = raw.get("sentence_order").unwrap_or(&Value::Null);
            explanation.sentence_order = Some(
                solve_sentence_order(ctx, proposal, self.model.as_ref(), &self.annotator).await?,
            );
        }
        Ok(explanation)
    }
}

/// Builds a schema-complete explanation from arbitrary model output.
///
/// Option lists follow the source question exactly, the correct verdict comes
/// from the exam's answer, and precomputed readings win over the model's.
pub fn normalize_explanation(
    ctx: &QuestionContext,
    readings: &ReadingCacheEntry,
    raw: &Value,
) -> Explanation {
    let question_type = ctx.question_type();
    let model_analysis = object_items(raw, "option_analysis");
    let model_options = object_items(raw, "options");

    let correct_answer = ctx
        .correct_answer
        .clone()
        .or_else(|| {
            raw.get("correct_answer")
                .and_then(scalar_key)
                .filter(|k| ctx.options.iter().any(|o| o.key == *k))
        })
        .or_else(|| {
            let flagged: Vec<String> = model_analysis
                .iter()
                .filter(|item| is_correct_verdict(item.get("verdict")))
                .filter_map(|item| item.get("key").and_then(scalar_key))
                .filter(|k| ctx.options.iter().any(|o| o.key == *k))
                .collect();
            (flagged.len() == 1).then(|| flagged[0].clone())
        })
        .unwrap_or_default();

    let option_analysis = ctx
        .options
        .iter()
        .map(|option| {
            let item = find_option_item(&model_analysis, &option.key, &option.text);
            OptionAnalysis {
                key: option.key.clone(),
                text: option.text.clone(),
                verdict: if option.key == correct_answer {
                    Verdict::Correct
                } else {
                    Verdict::Wrong
                },
                reason_vi: item.map(|i| str_field(i, "reason_vi")).unwrap_or_default(),
            }
        })
        .collect();

    let options = ctx
        .options
        .iter()
        .map(|option| {
            let item = find_option_item(&model_options, &option.key, &option.text);
            let precomputed = readings.option(&option.key);
            let reading = choose_reading(
                precomputed.map(|p| (p.reading.as_str(), p.ruby.as_str())),
                item.map(|i| (str_field(i, "reading"), str_field(i, "ruby"))),
            );
            OptionReading {
                key: option.key.clone(),
                text: option.text.clone(),
                reading: reading.0,
                ruby: reading.1,
                meaning_vi: item.map(|i| str_field(i, "meaning_vi")).unwrap_or_default(),
            }
        })
        .collect();

    let question_raw = raw.get("question").unwrap_or(&Value::Null);
    let model_text = str_field(question_raw, "text");
    let question_text = if question_type.is_reading() || model_text.is_empty() {
        ctx.blank_question_text.clone()
    } else {
        model_text
    };
    let answered_text = if ctx.answered_question_text.is_empty() {
        str_field(question_raw, "answered_text")
    } else {
        ctx.answered_question_text.clone()
    };
    let (question_reading, question_ruby) = choose_reading(
        Some((readings.question.reading.as_str(), readings.question.ruby.as_str())),
        Some((str_field(question_raw, "reading"), str_field(question_raw, "ruby"))),
    );
    let question = QuestionBlock {
        text: question_text,
        reading: question_reading,
        ruby: question_ruby,
        answered_text,
        translation_vi: str_field(question_raw, "translation_vi"),
    };

    let vocabulary = object_items(raw, "vocabulary")
        .into_iter()
        .map(|item| VocabItem {
            word: str_field(item, "word"),
            reading: str_field(item, "reading"),
            meaning_vi: str_field(item, "meaning_vi"),
        })
        .filter(|v| !v.word.is_empty())
        .collect();
    let grammar_points = object_items(raw, "grammar_points")
        .into_iter()
        .map(|item| GrammarPoint {
            pattern: str_field(item, "pattern"),
            meaning_vi: str_field(item, "meaning_vi"),
            usage_vi: str_field(item, "usage_vi"),
        })
        .filter(|g| !g.pattern.is_empty())
        .collect();

    let strategy = str_field(raw, "strategy_vi");
    Explanation {
        question_type,
        mondai_label: ctx.classification.mondai_label.clone(),
        label_vi: ctx.classification.label_vi.clone(),
        display_number: ctx.display_number,
        question,
        correct_text: ctx.option_text(&correct_answer).unwrap_or_default().to_string(),
        correct_answer,
        overview_vi: str_field(raw, "overview_vi"),
        option_analysis,
        options,
        vocabulary,
        grammar_points,
        strategy_vi: if strategy.is_empty() {
            ctx.classification.strategy_vi.clone()
        } else {
            strategy
        },
        sentence_order: None,
    }
}

fn object_items<'a>(raw: &'a Value, key: &str) -> Vec<&'a Value> {
    match raw.get(key) {
        Some(Value::Array(items)) => items.iter().filter(|i| i.is_object()).collect(),
        Some(Value::Object(map)) => map.values().filter(|i| i.is_object()).collect(),
        _ => Vec::new(),
    }
}

fn find_option_item<'a>(items: &[&'a Value], key: &str, text: &str) -> Option<&'a Value> {
    items
        .iter()
        .find(|item| item.get("key").and_then(scalar_key).as_deref() == Some(key))
        .or_else(|| {
            items
                .iter()
                .find(|item| !text.is_empty() && str_field(item, "text") == text)
        })
        .copied()
}

fn is_correct_verdict(value: Option<&Value>) -> bool {
    match value {
        Some(Value::Bool(b)) => *b,
        Some(Value::String(s)) => matches!(
            s.trim().to_lowercase().as_str(),
            "correct" | "true" | "right" | "đúng" | "○"
        ),
        _ => false,
    }
}

/// Picks a `(reading, ruby)` pair. Precomputed readings win unless they still
/// contain ideographs the tokenizer could not read and the model's reading
/// is fully kana.
fn choose_reading(precomputed: Option<(&str, &str)>, model: Option<(String, String)>) -> (String, String) {
    let (model_reading, model_ruby) = model.unwrap_or_default();
    let model_reading = model_reading.trim().to_string();
    let model_complete = !model_reading.is_empty() && !model_reading.chars().any(is_ideograph);
    match precomputed.map(|(r, ruby)| (r.trim(), ruby.trim())) {
        Some((reading, ruby)) if !reading.is_empty() => {
            if reading.chars().any(is_ideograph) && model_complete {
                let ruby = if model_ruby.trim().is_empty() { ruby.to_string() } else { model_ruby };
                (model_reading, ruby)
            } else {
                (reading.to_string(), ruby.to_string())
            }
        }
        _ => (model_reading, model_ruby),
    }
}

fn scalar_key(value: &Value) -> Option<String> {
    let raw = match value {
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        _ => return None,
    };
    let key = normalize_key(&raw);
    (!key.is_empty()).then_some(key)
}

fn str_field(value: &Value, key: &str) -> String {
    value
        .get(key)
        .and_then(Value::as_str)
        .map(|s| s.trim().to_string())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::LlmError;
    use crate::models::{Classification, OptionEntry, OptionReadingEntry, OrderResolution};
    use crate::testing::{test_annotator, ScriptedModel};
    use serde_json::json;

    fn ctx(question_type: QuestionType) -> QuestionContext {
        QuestionContext {
            question_text: "彼は学校（　）行った。".into(),
            blank_question_text: "彼は学校（　）行った。".into(),
            answered_question_text: "彼は学校に行った。".into(),
            display_number: 7,
            options: (1..=4)
                .map(|i| OptionEntry { key: i.to_string(), text: ["を", "に", "で", "が"][i - 1].into() })
                .collect(),
            correct_answer: Some("2".into()),
            classification: Classification {
                question_type,
                mondai_label: "問題2".into(),
                label_vi: "Ngữ pháp".into(),
                strategy_vi: "default strategy".into(),
                ..Classification::default()
            },
            ..QuestionContext::default()
        }
    }

    fn generator(model: Arc<ScriptedModel>) -> ExplanationGenerator {
        ExplanationGenerator::new(model, Arc::new(test_annotator()))
    }

    #[test]
    fn garbage_output_still_yields_complete_option_lists() {
        let ctx = ctx(QuestionType::GrammarChoice);
        for raw in [json!("garbage"), json!({}), json!({"option_analysis": 5, "options": null})] {
            let explanation = normalize_explanation(&ctx, &ReadingCacheEntry::default(), &raw);
            assert_eq!(explanation.option_analysis.len(), 4);
            assert_eq!(explanation.options.len(), 4);
            let correct: Vec<_> = explanation
                .option_analysis
                .iter()
                .filter(|a| a.verdict == Verdict::Correct)
                .map(|a| a.key.as_str())
                .collect();
            assert_eq!(correct, vec!["2"]);
            assert_eq!(explanation.correct_text, "に");
            assert_eq!(explanation.strategy_vi, "default strategy");
            assert!(explanation.sentence_order.is_none());
        }
    }

    #[test]
    fn model_verdicts_and_readings_are_overridden() {
        let ctx = ctx(QuestionType::GrammarChoice);
        let readings = ReadingCacheEntry {
            question: TextReading {
                text: ctx.blank_question_text.clone(),
                reading: "かれはがっこう（　）いった。".into(),
                ruby: "precomputed".into(),
            },
            options: vec![OptionReadingEntry {
                key: "1".into(),
                text: "を".into(),
                reading: "を".into(),
                ruby: "を".into(),
            }],
            ..ReadingCacheEntry::default()
        };
        let raw = json!({
            "question": {"text": "彼は学校（　）行った。", "reading": "model reading", "translation_vi": "Anh ấy đã đi"},
            "option_analysis": [
                {"key": "1", "verdict": "correct", "reason_vi": "sai"},
                {"key": "1", "verdict": "correct", "reason_vi": "duplicate"},
                {"key": "9", "verdict": "wrong", "reason_vi": "extra"}
            ],
            "options": [{"key": "１", "reading": "model", "meaning_vi": "trợ từ"}],
            "vocabulary": [{"word": "学校", "reading": "がっこう", "meaning_vi": "trường"}, {"word": ""}]
        });
        let explanation = normalize_explanation(&ctx, &readings, &raw);
        assert_eq!(explanation.option_analysis.len(), 4);
        assert_eq!(explanation.option_analysis[0].verdict, Verdict::Wrong);
        assert_eq!(explanation.option_analysis[0].reason_vi, "sai");
        assert_eq!(explanation.option_analysis[1].verdict, Verdict::Correct);
        assert_eq!(explanation.options[0].reading, "を");
        assert_eq!(explanation.options[0].meaning_vi, "trợ từ");
        assert_eq!(explanation.question.reading, "かれはがっこう（　）いった。");
        assert_eq!(explanation.question.ruby, "precomputed");
        assert_eq!(explanation.question.translation_vi, "Anh ấy đã đi");
        assert_eq!(explanation.vocabulary.len(), 1);
        assert_eq!(explanation.display_number, 7);
    }

    #[test]
    fn partial_tokenizer_reading_yields_to_kana_model_reading() {
        let ctx = ctx(QuestionType::GrammarChoice);
        let readings = ReadingCacheEntry {
            question: TextReading {
                text: ctx.blank_question_text.clone(),
                reading: "かれは学校（　）いった。".into(),
                ruby: "<ruby>彼<rt>かれ</rt></ruby>は学校（　）".into(),
            },
            options: vec![OptionReadingEntry {
                key: "1".into(),
                text: "勉強".into(),
                reading: "勉強".into(),
                ruby: "勉強".into(),
            }],
            ..ReadingCacheEntry::default()
        };
        let raw = json!({
            "question": {"reading": "かれはがっこう（　）いった。", "ruby": "model ruby"},
            "options": [{"key": "1", "reading": "べんきょう"}]
        });
        let explanation = normalize_explanation(&ctx, &readings, &raw);
        assert_eq!(explanation.question.reading, "かれはがっこう（　）いった。");
        assert_eq!(explanation.question.ruby, "model ruby");
        assert_eq!(explanation.options[0].reading, "べんきょう");
        assert_eq!(explanation.options[0].ruby, "勉強");

        let kanji_model = json!({"question": {"reading": "かれは学校"}});
        let explanation = normalize_explanation(&ctx, &readings, &kanji_model);
        assert_eq!(explanation.question.reading, "かれは学校（　）いった。");
    }

    #[test]
    fn reading_questions_keep_source_text() {
        let ctx = ctx(QuestionType::ReadingContent);
        let raw = json!({"question": {"text": "drifted text"}});
        let explanation = normalize_explanation(&ctx, &ReadingCacheEntry::default(), &raw);
        assert_eq!(explanation.question.text, ctx.blank_question_text);

        let grammar = normalize_explanation(&self::ctx(QuestionType::GrammarChoice), &ReadingCacheEntry::default(), &raw);
        assert_eq!(grammar.question.text, "drifted text");
    }

    #[test]
    fn unknown_answer_falls_back_to_model_claim() {
        let mut ctx = ctx(QuestionType::GrammarChoice);
        ctx.correct_answer = None;
        let raw = json!({"correct_answer": "３"});
        let explanation = normalize_explanation(&ctx, &ReadingCacheEntry::default(), &raw);
        assert_eq!(explanation.correct_answer, "3");
        assert_eq!(explanation.option_analysis[2].verdict, Verdict::Correct);
    }

    #[tokio::test]
    async fn generate_parses_fenced_reply() {
        let model = Arc::new(ScriptedModel::new([
            "```json\n{\"overview_vi\": \"Chọn に\", \"sentence_order\": {\"ordered_options\": [\"1\"]}}\n```",
        ]));
        let generated = generator(model.clone())
            .generate(&ctx(QuestionType::GrammarChoice), &ReadingCacheEntry::default())
            .await
            .unwrap();
        assert_eq!(generated.model, "scripted-1");
        assert_eq!(generated.explanation.overview_vi, "Chọn に");
        assert!(generated.explanation.sentence_order.is_none());
        let request = &model.requests()[0];
        assert!(request.json_mode);
        assert_eq!(request.temperature, GENERATION_TEMPERATURE);
    }

    #[tokio::test]
    async fn generate_surfaces_upstream_failures() {
        let ctx = ctx(QuestionType::GrammarChoice);
        let readings = ReadingCacheEntry::default();

        let empty = Arc::new(ScriptedModel::with_results(vec![Err(LlmError::EmptyContent)]));
        let err = generator(empty).generate(&ctx, &readings).await.unwrap_err();
        assert!(matches!(err, ExplainError::UpstreamCall(_)));

        let unconfigured = Arc::new(ScriptedModel::with_results(vec![Err(LlmError::MissingCredential)]));
        let err = generator(unconfigured).generate(&ctx, &readings).await.unwrap_err();
        assert!(matches!(err, ExplainError::UpstreamConfig(_)));

        let prose = Arc::new(ScriptedModel::new(["I cannot answer that."]));
        let err = generator(prose).generate(&ctx, &readings).await.unwrap_err();
        assert!(matches!(err, ExplainError::UpstreamCall(_)));
    }

    #[tokio::test]
    async fn sentence_order_questions_get_a_solution() {
        let mut ctx = ctx(QuestionType::SentenceOrder);
        ctx.blank_question_text = "彼は ＿＿ ★ ＿＿ ＿＿ 。".into();
        let model = Arc::new(ScriptedModel::new([r#"{"sentence_order": {"ordered_options": ["4", "3", "2", "1"]}}"#]));
        let generated = generator(model.clone())
            .generate(&ctx, &ReadingCacheEntry::default())
            .await
            .unwrap();
        let solution = generated.explanation.sentence_order.unwrap();
        assert_eq!(solution.ordered_options, vec!["4", "3", "2", "1"]);
        assert_eq!(solution.resolution, OrderResolution::ModelProposal);
        assert_eq!(solution.sentence, "彼はがでにを。");
        assert_eq!(solution.star_option, "2");
        assert_eq!(model.calls(), 1);
    }

    #[tokio::test]
    async fn group_generation_normalizes_each_question() {
        let first = ctx(QuestionType::ReadingContent);
        let mut second = ctx(QuestionType::ReadingContent);
        second.correct_answer = Some("4".into());
        let passage = TextReading {
            text: "文章。".into(),
            reading: "ぶんしょう。".into(),
            ruby: "<ruby>文章<rt>ぶんしょう</rt></ruby>。".into(),
        };
        let model = Arc::new(ScriptedModel::new([
            r#"{"passage": {"summary_vi": "Tóm tắt", "translation_vi": "Bản dịch"}, "questions": [{"overview_vi": "Q1"}]}"#,
        ]));
        let generated = generator(model)
            .generate_group(
                &passage,
                &[first, second],
                &[ReadingCacheEntry::default(), ReadingCacheEntry::default()],
            )
            .await
            .unwrap();
        let group = generated.explanation;
        assert_eq!(group.passage.summary_vi, "Tóm tắt");
        assert_eq!(group.passage.reading, "ぶんしょう。");
        assert_eq!(group.questions.len(), 2);
        assert_eq!(group.questions[0].overview_vi, "Q1");
        assert_eq!(group.questions[1].option_analysis[3].verdict, Verdict::Correct);
    }
}
