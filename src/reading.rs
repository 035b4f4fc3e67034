use std::borrow::Cow;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use lindera::dictionary::load_dictionary;
use lindera::mode::Mode;
use lindera::segmenter::Segmenter;
use tokio::sync::OnceCell;
use tracing::{info, warn};

use crate::models::TextReading;
use crate::text::escape_html;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Morpheme {
    pub surface: String,
    pub reading: Option<String>,
}

/// Morphological tokenizer contract. Tokenization itself is synchronous; any
/// expensive dictionary work happens when the implementation is built.
pub trait MorphTokenizer: Send + Sync {
    fn tokenize(&self, text: &str) -> Vec<Morpheme>;
}

/// Caller-supplied readings keyed by exact surface form.
pub type ForcedReadings = HashMap<String, String>;

/// IPADIC-style morphological analyser backed by lindera. Readings come from
/// the dictionary's `reading` field; unknown words carry none.
pub struct LinderaTokenizer {
    segmenter: Segmenter,
}

impl LinderaTokenizer {
    /// Loads a compiled lindera dictionary directory. The load is blocking and
    /// runs off the async workers.
    pub async fn load(path: &Path) -> Result<Self> {
        let path = path.to_path_buf();
        tokio::task::spawn_blocking(move || {
            let uri = path
                .to_str()
                .with_context(|| format!("dictionary path {} is not valid UTF-8", path.display()))?;
            let dictionary = load_dictionary(uri)
                .with_context(|| format!("failed to load dictionary {}", path.display()))?;
            Ok::<Self, anyhow::Error>(Self {
                segmenter: Segmenter::new(Mode::Normal, dictionary, None),
            })
        })
        .await
        .context("dictionary build task failed")?
    }
}

impl MorphTokenizer for LinderaTokenizer {
    fn tokenize(&self, text: &str) -> Vec<Morpheme> {
        let tokens = match self.segmenter.segment(Cow::Borrowed(text)) {
            Ok(tokens) => tokens,
            Err(err) => {
                warn!(error = %err, "segmentation failed; keeping surface text");
                return vec![Morpheme {
                    surface: text.to_string(),
                    reading: None,
                }];
            }
        };
        tokens
            .into_iter()
            .map(|mut token| {
                let reading = token
                    .get("reading")
                    .map(str::trim)
                    .filter(|r| !r.is_empty() && r.chars().all(|c| is_kana(c) || c == 'ー'))
                    .map(str::to_string);
                Morpheme {
                    surface: token.surface.into_owned(),
                    reading,
                }
            })
            .collect()
    }
}

enum TokenizerSource {
    Dictionary(PathBuf),
    #[cfg(test)]
    Lexicon(PathBuf),
    #[cfg(test)]
    Fixed,
}

/// Converts Japanese text into hiragana readings and ruby markup.
///
/// The tokenizer is built on first use. Concurrent first callers wait on the
/// same load, and a failed load leaves the handle empty so the next call retries.
pub struct ReadingAnnotator {
    source: TokenizerSource,
    tokenizer: OnceCell<Arc<dyn MorphTokenizer>>,
}

impl ReadingAnnotator {
    pub fn from_dictionary(path: impl Into<PathBuf>) -> Self {
        Self {
            source: TokenizerSource::Dictionary(path.into()),
            tokenizer: OnceCell::new(),
        }
    }

    #[cfg(test)]
    pub fn from_lexicon(path: impl Into<PathBuf>) -> Self {
        Self {
            source: TokenizerSource::Lexicon(path.into()),
            tokenizer: OnceCell::new(),
        }
    }

    #[cfg(test)]
    pub fn with_tokenizer(tokenizer: Arc<dyn MorphTokenizer>) -> Self {
        Self {
            source: TokenizerSource::Fixed,
            tokenizer: OnceCell::new_with(Some(tokenizer)),
        }
    }

    pub fn is_ready(&self) -> bool {
        self.tokenizer.initialized()
    }

    pub async fn tokenizer(&self) -> Result<Arc<dyn MorphTokenizer>> {
        let tokenizer = self
            .tokenizer
            .get_or_try_init(|| async {
                match &self.source {
                    TokenizerSource::Dictionary(path) => {
                        let analyser = LinderaTokenizer::load(path).await?;
                        info!(path = %path.display(), "tokenizer dictionary loaded");
                        Ok::<Arc<dyn MorphTokenizer>, anyhow::Error>(Arc::new(analyser))
                    }
                    #[cfg(test)]
                    TokenizerSource::Lexicon(path) => {
                        let lexicon = crate::testing::LexiconTokenizer::load(path).await?;
                        Ok::<Arc<dyn MorphTokenizer>, anyhow::Error>(Arc::new(lexicon))
                    }
                    #[cfg(test)]
                    TokenizerSource::Fixed => anyhow::bail!("no tokenizer source configured"),
                }
            })
            .await?;
        Ok(tokenizer.clone())
    }

    pub async fn to_reading_hiragana(
        &self,
        text: &str,
        forced: Option<&ForcedReadings>,
    ) -> Result<String> {
        let tokenizer = self.tokenizer().await?;
        Ok(text
            .split('\n')
            .map(|line| line_reading(tokenizer.as_ref(), line.trim_end_matches('\r'), forced))
            .collect::<Vec<_>>()
            .join("\n"))
    }

    pub async fn to_ruby_html(&self, text: &str, forced: Option<&ForcedReadings>) -> Result<String> {
        let tokenizer = self.tokenizer().await?;
        Ok(text
            .split('\n')
            .map(|line| line_ruby(tokenizer.as_ref(), line.trim_end_matches('\r'), forced))
            .collect::<Vec<_>>()
            .join("<br>"))
    }

    pub async fn annotate(&self, text: &str, forced: Option<&ForcedReadings>) -> Result<TextReading> {
        if text.trim().is_empty() {
            return Ok(TextReading {
                text: text.to_string(),
                ..TextReading::default()
            });
        }
        Ok(TextReading {
            text: text.to_string(),
            reading: self.to_reading_hiragana(text, forced).await?,
            ruby: self.to_ruby_html(text, forced).await?,
        })
    }
}

fn resolve_reading(morpheme: &Morpheme, forced: Option<&ForcedReadings>) -> String {
    if let Some(reading) = forced.and_then(|f| f.get(&morpheme.surface)) {
        return to_hiragana(reading);
    }
    match morpheme.reading.as_deref().map(str::trim) {
        Some(reading) if !reading.is_empty() && reading != "*" => to_hiragana(reading),
        _ => to_hiragana(&morpheme.surface),
    }
}

fn line_reading(tokenizer: &dyn MorphTokenizer, line: &str, forced: Option<&ForcedReadings>) -> String {
    tokenizer
        .tokenize(line)
        .iter()
        .map(|m| resolve_reading(m, forced))
        .collect()
}

fn line_ruby(tokenizer: &dyn MorphTokenizer, line: &str, forced: Option<&ForcedReadings>) -> String {
    tokenizer
        .tokenize(line)
        .iter()
        .map(|m| ruby_span(&m.surface, &resolve_reading(m, forced)))
        .collect()
}

/// Wraps the ideograph core of a morpheme in ruby, leaving shared okurigana outside.
fn ruby_span(surface: &str, reading: &str) -> String {
    if !surface.chars().any(is_ideograph)
        || reading.is_empty()
        || reading.chars().any(is_ideograph)
        || to_hiragana(surface) == reading
    {
        return escape_html(surface);
    }
    let s: Vec<char> = surface.chars().collect();
    let r: Vec<char> = reading.chars().collect();

    let mut prefix = 0usize;
    while prefix < s.len()
        && prefix < r.len()
        && !is_ideograph(s[prefix])
        && hiragana_char(s[prefix]) == r[prefix]
    {
        prefix += 1;
    }
    let mut suffix = 0usize;
    while suffix < s.len() - prefix
        && suffix < r.len() - prefix
        && !is_ideograph(s[s.len() - 1 - suffix])
        && hiragana_char(s[s.len() - 1 - suffix]) == r[r.len() - 1 - suffix]
    {
        suffix += 1;
    }

    let core_surface: String = s[prefix..s.len() - suffix].iter().collect();
    let core_reading: String = r[prefix..r.len() - suffix].iter().collect();
    if core_reading.is_empty() {
        return escape_html(surface);
    }
    let head: String = s[..prefix].iter().collect();
    let tail: String = s[s.len() - suffix..].iter().collect();
    format!(
        "{}<ruby>{}<rt>{}</rt></ruby>{}",
        escape_html(&head),
        escape_html(&core_surface),
        escape_html(&core_reading),
        escape_html(&tail)
    )
}

pub fn is_ideograph(c: char) -> bool {
    matches!(c,
        '\u{4E00}'..='\u{9FFF}'
        | '\u{3400}'..='\u{4DBF}'
        | '\u{F900}'..='\u{FAFF}'
        | '\u{20000}'..='\u{2FA1F}'
        | '々'
        | '〆')
}

pub fn is_kana(c: char) -> bool {
    matches!(c, '\u{3041}'..='\u{309F}' | '\u{30A0}'..='\u{30FF}')
}

fn hiragana_char(c: char) -> char {
    if ('\u{30A1}'..='\u{30F6}').contains(&c) {
        char::from_u32(c as u32 - 0x60).unwrap_or(c)
    } else {
        c
    }
}

pub fn to_hiragana(text: &str) -> String {
    text.chars().map(hiragana_char).collect()
}
