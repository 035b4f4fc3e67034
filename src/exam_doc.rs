//! Tolerant view of an exam part JSON document.
//!
//! Exam payloads are authored by hand and imported from several sources, so
//! field names drift and nested arrays are often missing. Everything here
//! degrades to empty values instead of failing.

use lazy_static::lazy_static;
use regex::Regex;
use serde_json::Value;

use crate::models::OptionEntry;
use crate::text::{ascii_digits, clean_text};

lazy_static! {
    static ref OPTION_PREFIX_RE: Regex = Regex::new(
        r"^\s*(?:[(（]\s*([0-9０-９]{1,2}|[A-Da-dＡ-Ｄ])\s*[)）]|([0-9０-９]{1,2}|[A-Da-dＡ-Ｄ])\s*[.．、:：)）]|([①-⑨]))\s*"
    )
    .unwrap();
}

#[derive(Debug, Clone, Default)]
pub struct ExamPartDoc {
    pub sections: Vec<ExamSection>,
    pub passages: Vec<PassageDoc>,
    /// `question_numbers[section][question]` from the document metadata, when present.
    pub question_numbers: Vec<Vec<Option<u32>>>,
}

#[derive(Debug, Clone, Default)]
pub struct ExamSection {
    pub title: String,
    pub questions: Vec<ExamQuestionDoc>,
    pub passages: Vec<PassageDoc>,
}

#[derive(Debug, Clone, Default)]
pub struct ExamQuestionDoc {
    pub label: String,
    pub text: String,
    pub options: Vec<OptionEntry>,
    pub answer: String,
    pub passage_ids: Vec<String>,
    pub inline_passage: String,
    pub explanation: String,
}

#[derive(Debug, Clone, Default)]
pub struct PassageDoc {
    pub id: String,
    pub text: String,
}

impl ExamPartDoc {
    pub fn from_value(value: &Value) -> Self {
        let sections = array_field(value, &["sections", "mondai", "groups"])
            .iter()
            .map(ExamSection::from_value)
            .collect();
        let passages = parse_passages(value);
        let meta = value
            .get("metadata")
            .or_else(|| value.get("meta"))
            .unwrap_or(&Value::Null);
        let question_numbers = array_field(meta, &["question_numbers", "questionNumbers"])
            .iter()
            .map(|row| {
                row.as_array()
                    .map(|cells| cells.iter().map(value_as_u32).collect())
                    .unwrap_or_default()
            })
            .collect();
        Self {
            sections,
            passages,
            question_numbers,
        }
    }

    pub fn metadata_number(&self, section_index: usize, question_index: usize) -> Option<u32> {
        self.question_numbers
            .get(section_index)
            .and_then(|row| row.get(question_index))
            .copied()
            .flatten()
    }
}

impl ExamSection {
    fn from_value(value: &Value) -> Self {
        Self {
            title: string_field(
                value,
                &["title", "section_title", "sectionTitle", "name", "instruction"],
            ),
            questions: array_field(value, &["questions", "items"])
                .iter()
                .map(ExamQuestionDoc::from_value)
                .collect(),
            passages: parse_passages(value),
        }
    }
}

impl ExamQuestionDoc {
    fn from_value(value: &Value) -> Self {
        let passage_ids = ["passage_id", "passageId", "passage_ids", "passageIds", "passage_ref", "passageRef"]
            .iter()
            .filter_map(|key| value.get(*key))
            .flat_map(|v| match v {
                Value::Array(items) => items.iter().filter_map(scalar_string).collect::<Vec<_>>(),
                other => scalar_string(other).into_iter().collect(),
            })
            .filter(|id| !id.is_empty())
            .collect();
        let inline_passage = value
            .get("passage")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        Self {
            label: string_field(
                value,
                &["label", "question_label", "questionLabel", "number", "no"],
            ),
            text: string_field(value, &["question", "text", "prompt", "content"]),
            options: parse_options(
                value
                    .get("options")
                    .or_else(|| value.get("choices"))
                    .unwrap_or(&Value::Null),
            ),
            answer: string_field(value, &["answer", "correct_answer", "correctAnswer", "correct"]),
            passage_ids,
            inline_passage,
            explanation: string_field(
                value,
                &["explanation", "answer_explanation", "answerExplanation", "explain", "note"],
            ),
        }
    }
}

fn parse_passages(value: &Value) -> Vec<PassageDoc> {
    array_field(value, &["passages", "readings"])
        .iter()
        .enumerate()
        .map(|(idx, item)| match item {
            Value::String(text) => PassageDoc {
                id: (idx + 1).to_string(),
                text: text.clone(),
            },
            other => {
                let id = string_field(other, &["id", "passage_id", "passageId", "key", "label"]);
                PassageDoc {
                    id: if id.is_empty() { (idx + 1).to_string() } else { id },
                    text: string_field(other, &["text", "content", "body", "html", "passage"]),
                }
            }
        })
        .collect()
}

/// Parses options from an array of strings, an array of objects or a key→text map.
pub fn parse_options(value: &Value) -> Vec<OptionEntry> {
    match value {
        Value::Array(items) => items
            .iter()
            .enumerate()
            .filter_map(|(idx, item)| {
                let positional = (idx + 1).to_string();
                match item {
                    Value::Object(_) => {
                        let raw = string_field(item, &["text", "content", "option", "value"]);
                        let explicit = string_field(item, &["key", "id", "label", "no", "number"]);
                        let (prefix_key, text) = split_option_prefix(&clean_text(&raw));
                        let key = [Some(normalize_key(&explicit)), prefix_key]
                            .into_iter()
                            .flatten()
                            .find(|k| !k.is_empty())
                            .unwrap_or(positional);
                        Some(OptionEntry { key, text })
                    }
                    other => {
                        let raw = scalar_string(other)?;
                        let (prefix_key, text) = split_option_prefix(&clean_text(&raw));
                        Some(OptionEntry {
                            key: prefix_key.unwrap_or(positional),
                            text,
                        })
                    }
                }
            })
            .collect(),
        Value::Object(map) => map
            .iter()
            .filter_map(|(key, item)| {
                let raw = scalar_string(item)?;
                let (_, text) = split_option_prefix(&clean_text(&raw));
                Some(OptionEntry {
                    key: normalize_key(key),
                    text,
                })
            })
            .collect(),
        _ => Vec::new(),
    }
}

/// Splits a leading `1.` / `（2）` / `③` style key off an option text.
pub fn split_option_prefix(text: &str) -> (Option<String>, String) {
    if let Some(caps) = OPTION_PREFIX_RE.captures(text) {
        let key = caps
            .get(1)
            .or_else(|| caps.get(2))
            .or_else(|| caps.get(3))
            .map(|m| normalize_key(m.as_str()));
        let rest = text[caps.get(0).map(|m| m.end()).unwrap_or(0)..].trim().to_string();
        if !rest.is_empty() {
            return (key, rest);
        }
    }
    (None, text.trim().to_string())
}

/// Canonical option key: ASCII digits, circled digits unwrapped, letters upper-cased.
pub fn normalize_key(raw: &str) -> String {
    let trimmed = raw.trim();
    let unwrapped: String = trimmed
        .chars()
        .map(|c| match c {
            '①'..='⑨' => char::from_u32(c as u32 - '①' as u32 + '1' as u32).unwrap_or(c),
            'Ａ'..='Ｚ' => char::from_u32(c as u32 - 'Ａ' as u32 + 'A' as u32).unwrap_or(c),
            'ａ'..='ｚ' => char::from_u32(c as u32 - 'ａ' as u32 + 'A' as u32).unwrap_or(c),
            other => other.to_ascii_uppercase(),
        })
        .collect();
    ascii_digits(&unwrapped)
        .trim_matches(|c: char| matches!(c, '(' | ')' | '（' | '）' | '.' | '．'))
        .trim()
        .to_string()
}

fn array_field<'a>(value: &'a Value, keys: &[&str]) -> &'a [Value] {
    keys.iter()
        .find_map(|key| value.get(*key).and_then(Value::as_array))
        .map(Vec::as_slice)
        .unwrap_or(&[])
}

fn string_field(value: &Value, keys: &[&str]) -> String {
    keys.iter()
        .find_map(|key| value.get(*key).and_then(scalar_string))
        .unwrap_or_default()
}

fn scalar_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn value_as_u32(value: &Value) -> Option<u32> {
    match value {
        Value::Number(n) => n.as_u64().and_then(|n| u32::try_from(n).ok()),
        Value::String(s) => ascii_digits(s.trim()).parse().ok(),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn options_from_prefixed_strings() {
        let options = parse_options(&json!(["1. がっこう", "２．がくこう", "(3) がっこ", "がこう"]));
        let keys: Vec<_> = options.iter().map(|o| o.key.as_str()).collect();
        let texts: Vec<_> = options.iter().map(|o| o.text.as_str()).collect();
        assert_eq!(keys, vec!["1", "2", "3", "4"]);
        assert_eq!(texts, vec!["がっこう", "がくこう", "がっこ", "がこう"]);
    }

    #[test]
    fn options_from_objects_and_maps() {
        let from_objects = parse_options(&json!([{"key": "１", "text": "<b>行く</b>"}, {"text": "来る"}]));
        assert_eq!(from_objects[0], OptionEntry { key: "1".into(), text: "行く".into() });
        assert_eq!(from_objects[1].key, "2");

        let from_map = parse_options(&json!({"1": "行く", "2": "来る"}));
        assert_eq!(from_map.len(), 2);
        assert_eq!(from_map[1].text, "来る");
    }

    #[test]
    fn missing_arrays_become_empty() {
        let doc = ExamPartDoc::from_value(&json!({"sections": [{"title": "問題1"}]}));
        assert_eq!(doc.sections.len(), 1);
        assert!(doc.sections[0].questions.is_empty());
        assert!(doc.passages.is_empty());

        let doc = ExamPartDoc::from_value(&json!("not an object"));
        assert!(doc.sections.is_empty());
    }

    #[test]
    fn question_fields_accept_aliases() {
        let doc = ExamPartDoc::from_value(&json!({
            "sections": [{
                "sectionTitle": "問題9",
                "questions": [{
                    "questionLabel": 50,
                    "prompt": "(50)",
                    "choices": ["a", "b"],
                    "correctAnswer": 2,
                    "passageIds": ["p1", 7]
                }]
            }],
            "metadata": {"question_numbers": [[50, "５１"]]}
        }));
        let q = &doc.sections[0].questions[0];
        assert_eq!(doc.sections[0].title, "問題9");
        assert_eq!(q.label, "50");
        assert_eq!(q.text, "(50)");
        assert_eq!(q.answer, "2");
        assert_eq!(q.passage_ids, vec!["p1", "7"]);
        assert_eq!(doc.metadata_number(0, 1), Some(51));
    }
}
