//! Prompt text for the explanation model.
//!
//! Instructions are in English, pedagogy output is Vietnamese, and exam
//! material is passed through untouched. Bump `PROMPT_VERSION` whenever the
//! wording or schema changes; cached explanations are keyed by it.

use crate::{
    models::{QuestionContext, QuestionType, ReadingCacheEntry, TextReading},
    text::truncate,
};

pub const PROMPT_VERSION: &str = "jlpt-explain-v3";

const MAX_PASSAGE_CHARS: usize = 6000;
const MAX_SOURCE_EXPLANATION_CHARS: usize = 1200;

pub const EXPLAIN_SYSTEM: &str = "You are an experienced JLPT teacher writing explanations for Vietnamese learners.\nExplain why the correct option is correct and why every other option is wrong.\nAll explanatory prose must be in Vietnamese; keep Japanese words, sentences and readings in Japanese.\nReadings must be hiragana only.\nRespond with a single JSON object that follows the schema exactly. Do not add commentary outside of valid JSON.";

pub const PASSAGE_SYSTEM: &str = "You are an experienced JLPT teacher explaining a reading passage and all of its questions to Vietnamese learners.\nSummarize and translate the passage into Vietnamese, then explain every question against the passage.\nAll explanatory prose must be in Vietnamese; keep Japanese quotations in Japanese.\nRespond with a single JSON object that follows the schema exactly. Do not add commentary outside of valid JSON.";

pub const REPAIR_SYSTEM: &str = "You order Japanese sentence fragments.\nReturn JSON with one key, ordered_options: an array containing every option key exactly once, in the order that forms a natural sentence.\nDo not add commentary outside of valid JSON.";

const EXPLANATION_SCHEMA: &str = r#"{
  "question": {"text": "", "reading": "", "ruby": "", "answered_text": "", "translation_vi": ""},
  "correct_answer": "<option key>",
  "overview_vi": "",
  "option_analysis": [{"key": "", "text": "", "verdict": "correct|wrong", "reason_vi": ""}],
  "options": [{"key": "", "text": "", "reading": "", "ruby": "", "meaning_vi": ""}],
  "vocabulary": [{"word": "", "reading": "", "meaning_vi": ""}],
  "grammar_points": [{"pattern": "", "meaning_vi": "", "usage_vi": ""}],
  "strategy_vi": "",
  "sentence_order": null
}"#;

const SENTENCE_ORDER_SCHEMA: &str = r#""sentence_order": {
    "ordered_options": ["<every option key once, in sentence order>"],
    "sentence": "<full sentence with the fragments in place>",
    "sentence_reading": "",
    "sentence_ruby": "",
    "star_option": "<key of the fragment at ★>",
    "rationale_vi": ""
  }"#;

/// User prompt for a single question.
pub fn explain_user_prompt(ctx: &QuestionContext, readings: &ReadingCacheEntry) -> String {
    let mut parts = vec![question_section(ctx, readings)];
    if !ctx.passage_text.is_empty() {
        parts.push(format!(
            "PASSAGE:\n{}",
            truncate(&ctx.passage_text, MAX_PASSAGE_CHARS)
        ));
    }
    parts.push(format!("JSON SCHEMA:\n{}", schema_for(ctx.question_type())));
    parts.join("\n\n")
}

/// User prompt for several questions sharing one passage.
pub fn passage_user_prompt(
    passage: &TextReading,
    contexts: &[QuestionContext],
    readings: &[ReadingCacheEntry],
) -> String {
    let questions = contexts
        .iter()
        .zip(readings.iter())
        .enumerate()
        .map(|(idx, (ctx, reading))| format!("QUESTION {}:\n{}", idx + 1, question_section(ctx, reading)))
        .collect::<Vec<_>>()
        .join("\n\n");
    let item_schema = if contexts
        .iter()
        .any(|c| c.question_type() == QuestionType::SentenceOrder)
    {
        schema_for(QuestionType::SentenceOrder)
    } else {
        EXPLANATION_SCHEMA.to_string()
    };
    format!(
        "PASSAGE:\n{}\n\nPASSAGE READING:\n{}\n\n{}\n\nJSON SCHEMA:\n{{\n  \"passage\": {{\"summary_vi\": \"\", \"translation_vi\": \"\"}},\n  \"questions\": [<one object per question, in the order given>]\n}}\nEach question object:\n{}",
        truncate(&passage.text, MAX_PASSAGE_CHARS),
        truncate(&passage.reading, MAX_PASSAGE_CHARS),
        questions,
        item_schema
    )
}

/// Narrow prompt asking only for a complete fragment order.
pub fn repair_user_prompt(ctx: &QuestionContext, current_guess: &[String]) -> String {
    let options = ctx
        .options
        .iter()
        .map(|o| format!("{}: {}", o.key, o.text))
        .collect::<Vec<_>>()
        .join("\n");
    format!(
        "SENTENCE:\n{}\n\nOPTIONS:\n{}\n\nThe option at ★ is: {}\nCurrent incomplete order: [{}]\nReturn every option key exactly once.",
        ctx.blank_question_text,
        options,
        ctx.correct_answer.as_deref().unwrap_or("unknown"),
        current_guess.join(", ")
    )
}

fn question_section(ctx: &QuestionContext, readings: &ReadingCacheEntry) -> String {
    let mut lines = vec![
        format!("Level: {}", ctx.level),
        format!("Part: {}", ctx.part),
        format!("Section: {}", ctx.section_title),
        format!("Question label: {}", ctx.question_label),
        format!("Question number: {}", ctx.display_number),
        format!(
            "Question type: {} ({})",
            ctx.question_type().as_str(),
            ctx.classification.mondai_label
        ),
        format!("Cloze: {}", if ctx.is_cloze { "yes" } else { "no" }),
        format!("Question text:\n{}", ctx.question_text),
    ];
    if ctx.blank_question_text != ctx.question_text {
        lines.push(format!("Sentence with blank:\n{}", ctx.blank_question_text));
    }
    if ctx.answered_question_text != ctx.blank_question_text {
        lines.push(format!("Sentence with answer filled in:\n{}", ctx.answered_question_text));
    }
    if !readings.question.reading.is_empty() {
        lines.push(format!("Question reading:\n{}", readings.question.reading));
    }

    let options = ctx
        .options
        .iter()
        .map(|o| match readings.option(&o.key) {
            Some(r) if !r.reading.is_empty() => format!("{}: {} ({})", o.key, o.text, r.reading),
            _ => format!("{}: {}", o.key, o.text),
        })
        .collect::<Vec<_>>()
        .join("\n");
    lines.push(format!("Options:\n{}", options));
    lines.push(format!(
        "Correct answer: {}",
        match (ctx.correct_answer.as_deref(), ctx.correct_text()) {
            (Some(key), Some(text)) => format!("{} ({})", key, text),
            (Some(key), None) => key.to_string(),
            _ => "unknown".to_string(),
        }
    ));
    if let Some(order) = &ctx.answer_key_order {
        lines.push(format!("Fragment order from the answer key: {}", order.join(" → ")));
    }
    if !ctx.source_explanation.is_empty() {
        lines.push(format!(
            "Exam notes:\n{}",
            truncate(&ctx.source_explanation, MAX_SOURCE_EXPLANATION_CHARS)
        ));
    }
    lines.join("\n")
}

fn schema_for(question_type: QuestionType) -> String {
    if question_type == QuestionType::SentenceOrder {
        EXPLANATION_SCHEMA.replace("\"sentence_order\": null", SENTENCE_ORDER_SCHEMA)
    } else {
        EXPLANATION_SCHEMA.to_string()
    }
}
