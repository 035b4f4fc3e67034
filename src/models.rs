use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct ExamQuestionCoordinate {
    pub level: String,
    pub exam_id: String,
    pub part: String,
    pub section_index: usize,
    pub question_index: usize,
}

/// Identity of one exam part document.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct ExamPartRef {
    pub level: String,
    pub exam_id: String,
    pub part: String,
}

impl ExamPartRef {
    pub fn question(&self, section_index: usize, question_index: usize) -> ExamQuestionCoordinate {
        ExamQuestionCoordinate {
            level: self.level.clone(),
            exam_id: self.exam_id.clone(),
            part: self.part.clone(),
            section_index,
            question_index,
        }
    }
}

impl ExamQuestionCoordinate {
    pub fn part_ref(&self) -> ExamPartRef {
        ExamPartRef {
            level: self.level.clone(),
            exam_id: self.exam_id.clone(),
            part: self.part.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum QuestionType {
    VocabReading,
    VocabMeaning,
    GrammarChoice,
    SentenceOrder,
    ReadingCloze,
    ReadingContent,
    Listening,
    #[default]
    Unknown,
}

impl QuestionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            QuestionType::VocabReading => "vocab_reading",
            QuestionType::VocabMeaning => "vocab_meaning",
            QuestionType::GrammarChoice => "grammar_choice",
            QuestionType::SentenceOrder => "sentence_order",
            QuestionType::ReadingCloze => "reading_cloze",
            QuestionType::ReadingContent => "reading_content",
            QuestionType::Listening => "listening",
            QuestionType::Unknown => "unknown",
        }
    }

    pub fn is_reading(&self) -> bool {
        matches!(self, QuestionType::ReadingCloze | QuestionType::ReadingContent)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct OptionEntry {
    pub key: String,
    pub text: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct Classification {
    pub mondai_label: String,
    pub mondai_number: Option<u32>,
    pub question_type: QuestionType,
    pub label_vi: String,
    pub strategy_vi: String,
}

/// Everything the engine knows about one question, derived fresh from the
/// exam part document on every request.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct QuestionContext {
    pub level: String,
    pub exam_id: String,
    pub part: String,
    pub section_index: usize,
    pub question_index: usize,
    pub section_title: String,
    pub question_label: String,
    pub display_number: u32,
    pub classification: Classification,
    pub question_text: String,
    pub blank_question_text: String,
    pub answered_question_text: String,
    pub is_cloze: bool,
    pub blank_marker: Option<String>,
    pub options: Vec<OptionEntry>,
    pub correct_answer: Option<String>,
    pub passage_text: String,
    pub source_explanation: String,
    pub answer_key_order: Option<Vec<String>>,
}

impl QuestionContext {
    pub fn question_type(&self) -> QuestionType {
        self.classification.question_type
    }

    pub fn option_text(&self, key: &str) -> Option<&str> {
        self.options
            .iter()
            .find(|o| o.key == key)
            .map(|o| o.text.as_str())
    }

    pub fn correct_text(&self) -> Option<&str> {
        self.correct_answer.as_deref().and_then(|k| self.option_text(k))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(default)]
pub struct TextReading {
    pub text: String,
    pub reading: String,
    pub ruby: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(default)]
pub struct OptionReadingEntry {
    pub key: String,
    pub text: String,
    pub reading: String,
    pub ruby: String,
}

/// Precomputed readings for one question, stored once per coordinate.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct ReadingCacheEntry {
    pub question: TextReading,
    pub options: Vec<OptionReadingEntry>,
    pub passage: TextReading,
    pub passage_sentences: Vec<TextReading>,
    pub built_at: Option<DateTime<Utc>>,
}

impl ReadingCacheEntry {
    pub fn option(&self, key: &str) -> Option<&OptionReadingEntry> {
        self.options.iter().find(|o| o.key == key)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    Correct,
    #[default]
    Wrong,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct OptionAnalysis {
    pub key: String,
    pub text: String,
    pub verdict: Verdict,
    pub reason_vi: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct OptionReading {
    pub key: String,
    pub text: String,
    pub reading: String,
    pub ruby: String,
    pub meaning_vi: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct QuestionBlock {
    pub text: String,
    pub reading: String,
    pub ruby: String,
    pub answered_text: String,
    pub translation_vi: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct VocabItem {
    pub word: String,
    pub reading: String,
    pub meaning_vi: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct GrammarPoint {
    pub pattern: String,
    pub meaning_vi: String,
    pub usage_vi: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum OrderResolution {
    #[default]
    ModelProposal,
    AnswerKey,
    RepairCall,
    DeterministicFallback,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct SentenceOrderSolution {
    pub ordered_options: Vec<String>,
    pub sentence: String,
    pub sentence_reading: String,
    pub sentence_ruby: String,
    pub star_option: String,
    pub rationale_vi: String,
    pub resolution: OrderResolution,
    pub sentence_rebuilt: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct Explanation {
    pub question_type: QuestionType,
    pub mondai_label: String,
    pub label_vi: String,
    pub display_number: u32,
    pub question: QuestionBlock,
    pub correct_answer: String,
    pub correct_text: String,
    pub overview_vi: String,
    pub option_analysis: Vec<OptionAnalysis>,
    pub options: Vec<OptionReading>,
    pub vocabulary: Vec<VocabItem>,
    pub grammar_points: Vec<GrammarPoint>,
    pub strategy_vi: String,
    pub sentence_order: Option<SentenceOrderSolution>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct PassageSummary {
    pub text: String,
    pub reading: String,
    pub ruby: String,
    pub summary_vi: String,
    pub translation_vi: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct GroupExplanation {
    pub passage: PassageSummary,
    pub questions: Vec<Explanation>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ExplainSource {
    Cache,
    Model,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExplainResponse<T> {
    pub source: ExplainSource,
    pub prompt_version: String,
    pub explanation: T,
    pub model: String,
}

/// Who is asking. Identity is established upstream; the engine only reads it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Caller {
    pub user_id: String,
    pub privileged: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExplainQuestionRequest {
    pub section_index: usize,
    pub question_index: usize,
    #[serde(default)]
    pub force_refresh: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExplainPassageRequest {
    pub section_index: usize,
    pub question_indices: Vec<usize>,
    #[serde(default)]
    pub force_refresh: bool,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct ReadingQuery {
    pub refresh: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub db: bool,
    pub tokenizer_ready: bool,
    pub prompt_version: String,
}
