//! Doubles shared by the engine-level tests.

use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use async_trait::async_trait;

use crate::llm::{ChatCompletion, ChatModel, ChatRequest, LlmError, LlmUsage};
use crate::reading::{is_ideograph, is_kana, Morpheme, MorphTokenizer, ReadingAnnotator};

/// Replays canned replies in order and records every request.
pub struct ScriptedModel {
    replies: Mutex<VecDeque<Result<String, LlmError>>>,
    requests: Mutex<Vec<ChatRequest>>,
    calls: AtomicUsize,
}

impl ScriptedModel {
    pub fn new<I, S>(replies: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::with_results(replies.into_iter().map(|r| Ok(r.into())).collect())
    }

    pub fn with_results(replies: Vec<Result<String, LlmError>>) -> Self {
        Self {
            replies: Mutex::new(replies.into()),
            requests: Mutex::new(Vec::new()),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> Vec<ChatRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl ChatModel for ScriptedModel {
    fn model_id(&self) -> &str {
        "scripted"
    }

    async fn complete(&self, request: &ChatRequest) -> Result<ChatCompletion, LlmError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.requests.lock().unwrap().push(request.clone());
        let reply = self
            .replies
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Err(LlmError::EmptyContent))?;
        Ok(ChatCompletion {
            content: reply,
            model: "scripted-1".to_string(),
            latency_s: 0.0,
            usage: LlmUsage::default(),
        })
    }
}

pub fn test_annotator() -> ReadingAnnotator {
    let lexicon = LexiconTokenizer::from_entries([
        ("彼", "かれ"),
        ("私", "わたし"),
        ("学校", "がっこう"),
        ("日本語", "にほんご"),
        ("日本", "にほん"),
        ("勉強", "べんきょう"),
        ("来", "き"),
        ("行", "い"),
        ("文章", "ぶんしょう"),
        ("前置", "まえお"),
        ("前", "まえ"),
        ("文", "ぶん"),
    ]);
    ReadingAnnotator::with_tokenizer(Arc::new(lexicon))
}

/// Greedy longest match against a `surface<TAB>reading` lexicon, with unknown
/// text grouped by script.
pub struct LexiconTokenizer {
    entries: HashMap<String, String>,
    max_len: usize,
}

impl LexiconTokenizer {
    pub fn from_entries<I, S>(entries: I) -> Self
    where
        I: IntoIterator<Item = (S, S)>,
        S: Into<String>,
    {
        let mut map = HashMap::new();
        let mut max_len = 0usize;
        for (surface, reading) in entries {
            let surface = surface.into();
            if surface.is_empty() {
                continue;
            }
            max_len = max_len.max(surface.chars().count());
            map.insert(surface, reading.into());
        }
        Self {
            entries: map,
            max_len,
        }
    }

    pub fn parse(source: &str) -> Result<Self> {
        let mut entries = Vec::new();
        for (line_no, line) in source.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let mut cols = line.split('\t');
            let surface = cols.next().unwrap_or_default().trim();
            let reading = cols
                .next()
                .map(str::trim)
                .filter(|r| !r.is_empty())
                .with_context(|| format!("lexicon line {} has no reading", line_no + 1))?;
            entries.push((surface.to_string(), reading.to_string()));
        }
        anyhow::ensure!(!entries.is_empty(), "lexicon contains no entries");
        Ok(Self::from_entries(entries))
    }

    pub async fn load(path: &Path) -> Result<Self> {
        let raw = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("failed to read lexicon {}", path.display()))?;
        Self::parse(&raw)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Script {
    Ideograph,
    Kana,
    Other,
}

fn script_of(c: char) -> Script {
    if is_ideograph(c) {
        Script::Ideograph
    } else if is_kana(c) {
        Script::Kana
    } else {
        Script::Other
    }
}

impl MorphTokenizer for LexiconTokenizer {
    fn tokenize(&self, text: &str) -> Vec<Morpheme> {
        let chars: Vec<char> = text.chars().collect();
        let mut out = Vec::new();
        let mut unknown = String::new();
        let mut unknown_script: Option<Script> = None;
        let mut i = 0usize;
        while i < chars.len() {
            let upper = self.max_len.min(chars.len() - i);
            let matched = (1..=upper).rev().find_map(|len| {
                let candidate: String = chars[i..i + len].iter().collect();
                self.entries
                    .get(&candidate)
                    .map(|reading| (candidate, reading.clone(), len))
            });
            match matched {
                Some((surface, reading, len)) => {
                    flush_unknown(&mut out, &mut unknown);
                    unknown_script = None;
                    out.push(Morpheme {
                        surface,
                        reading: Some(reading),
                    });
                    i += len;
                }
                None => {
                    let script = script_of(chars[i]);
                    if unknown_script != Some(script) {
                        flush_unknown(&mut out, &mut unknown);
                        unknown_script = Some(script);
                    }
                    unknown.push(chars[i]);
                    i += 1;
                }
            }
        }
        flush_unknown(&mut out, &mut unknown);
        out
    }
}

fn flush_unknown(out: &mut Vec<Morpheme>, buf: &mut String) {
    if !buf.is_empty() {
        out.push(Morpheme {
            surface: std::mem::take(buf),
            reading: None,
        });
    }
}

mod tests {
    use super::*;

    #[test]
    fn lexicon_prefers_longest_match_and_groups_unknown_runs() {
        let lexicon = LexiconTokenizer::from_entries([("学", "がく"), ("学校", "がっこう")]);
        let tokens = lexicon.tokenize("学校へ行くABC");
        let surfaces: Vec<_> = tokens.iter().map(|t| t.surface.as_str()).collect();
        assert_eq!(surfaces, vec!["学校", "へ", "行", "く", "ABC"]);
        assert_eq!(tokens[0].reading.as_deref(), Some("がっこう"));
        assert!(tokens[2].reading.is_none());
    }

    #[test]
    fn parse_rejects_line_without_reading() {
        assert!(LexiconTokenizer::parse("学校\n").is_err());
    }
}
