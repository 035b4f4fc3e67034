use lazy_static::lazy_static;
use regex::Regex;

lazy_static! {
    static ref BR_RE: Regex = Regex::new(r"(?i)<br\s*/?>").unwrap();
    static ref P_CLOSE_RE: Regex = Regex::new(r"(?i)</p\s*>").unwrap();
    static ref TAG_RE: Regex = Regex::new(r"<[^>]*>").unwrap();
    static ref SPACE_RUN_RE: Regex = Regex::new(r"[ \t\r\x0B\x0C]+").unwrap();
}

/// Strips markup from an exam field and normalizes whitespace.
///
/// `<br>` and `</p>` become line breaks, every other tag is dropped, entities are
/// decoded, runs of ASCII whitespace collapse to one space and blank lines are
/// removed. Full-width spaces are kept since exam blanks such as `（　）` rely on them.
pub fn clean_text(raw: &str) -> String {
    if raw.trim().is_empty() {
        return String::new();
    }
    let text = BR_RE.replace_all(raw, "\n");
    let text = P_CLOSE_RE.replace_all(&text, "\n");
    let text = TAG_RE.replace_all(&text, "");
    let text = decode_entities(&text);
    text.lines()
        .map(|line| SPACE_RUN_RE.replace_all(line, " ").trim().to_string())
        .filter(|line| !line.is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}

/// Decodes named and numeric character references. Non-breaking and typographic
/// spaces become plain spaces so they collapse like any other run.
pub fn decode_entities(text: &str) -> String {
    html_escape::decode_html_entities(text)
        .chars()
        .map(|c| match c {
            '\u{00A0}' | '\u{2002}' | '\u{2003}' | '\u{2009}' => ' ',
            other => other,
        })
        .collect()
}

pub fn escape_html(text: &str) -> String {
    html_escape::encode_quoted_attribute(text).into_owned()
}

/// Maps full-width digits to ASCII, leaving everything else untouched.
pub fn ascii_digits(text: &str) -> String {
    text.chars()
        .map(|c| match c {
            '０'..='９' => char::from_u32(c as u32 - '０' as u32 + '0' as u32).unwrap_or(c),
            other => other,
        })
        .collect()
}

pub fn is_sentence_end(c: char) -> bool {
    matches!(c, '。' | '｡' | '！' | '？' | '!' | '?' | '\n')
}

/// Splits text into sentences, keeping the terminating punctuation.
pub fn split_sentences(text: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut current = String::new();
    for c in text.chars() {
        if c == '\n' {
            push_sentence(&mut out, &mut current);
            continue;
        }
        current.push(c);
        if is_sentence_end(c) {
            push_sentence(&mut out, &mut current);
        }
    }
    push_sentence(&mut out, &mut current);
    out
}

fn push_sentence(out: &mut Vec<String>, current: &mut String) {
    let trimmed = current.trim();
    if !trimmed.is_empty() {
        out.push(trimmed.to_string());
    }
    current.clear();
}

pub fn truncate(text: &str, limit: usize) -> String {
    let mut truncated = text.trim().chars().take(limit).collect::<String>();
    if text.trim().chars().count() > limit {
        truncated.push('…');
    }
    truncated
}
