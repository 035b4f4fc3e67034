use lazy_static::lazy_static;
use regex::Regex;

use crate::{
    classify::{self, ClassifyInput, ASSEMBLY_MARKER},
    error::ExplainError,
    exam_doc::{normalize_key, ExamPartDoc, ExamQuestionDoc, ExamSection},
    models::{ExamQuestionCoordinate, OptionEntry, QuestionContext, QuestionType},
    text::{ascii_digits, clean_text, is_sentence_end},
};

lazy_static! {
    static ref MARKER_ONLY_RE: Regex =
        Regex::new(r"^[（(][\s　]*([0-9０-９]{1,3})[\s　]*[)）][\s　]*[。、．.,，:：]?$").unwrap();
    static ref EMPTY_BLANK_RE: Regex = Regex::new(r"[（(][\s　]*[)）]").unwrap();
    static ref ORDER_RUN_RE: Regex =
        Regex::new(r"[0-9](?:[\s　]*[-–—−→⇒＞>、,，・/][\s　]*[0-9]|[\s　]+[0-9])+").unwrap();
}

/// Locates one question in a parsed exam part and derives its full context.
pub fn extract_context(
    doc: &ExamPartDoc,
    coord: &ExamQuestionCoordinate,
) -> Result<QuestionContext, ExplainError> {
    let section = doc.sections.get(coord.section_index).ok_or_else(|| {
        ExplainError::NotFound(format!(
            "section {} in {}/{}/{}",
            coord.section_index, coord.level, coord.exam_id, coord.part
        ))
    })?;
    let question = section.questions.get(coord.question_index).ok_or_else(|| {
        ExplainError::NotFound(format!(
            "question {} in section {}",
            coord.question_index, coord.section_index
        ))
    })?;

    let section_title = clean_text(&section.title);
    let question_label = clean_text(&question.label);
    let question_text = clean_text(&question.text);
    let options = question.options.clone();
    let correct_answer = resolve_answer(&question.answer, &options);
    let passage_text = resolve_passage(doc, section, question);

    let cloze = blank_marker_number(&question_text)
        .filter(|_| !passage_text.is_empty())
        .and_then(|n| locate_blank_sentence(&passage_text, &n));
    let is_cloze = cloze.is_some();
    let correct_text = correct_answer
        .as_deref()
        .and_then(|k| options.iter().find(|o| o.key == k))
        .map(|o| o.text.clone());

    let (blank_question_text, answered_question_text, blank_marker) = match cloze {
        Some(BlankSentence { sentence, marker }) => {
            let answered = match &correct_text {
                Some(text) => sentence.replacen(&marker, text, 1),
                None => sentence.clone(),
            };
            (sentence, answered, Some(marker))
        }
        None => {
            let answered = match &correct_text {
                Some(text) if !question_text.contains(ASSEMBLY_MARKER) => {
                    EMPTY_BLANK_RE
                        .replace(&question_text, regex::NoExpand(text.as_str()))
                        .into_owned()
                }
                _ => question_text.clone(),
            };
            (question_text.clone(), answered, None)
        }
    };

    let metadata_number = doc.metadata_number(coord.section_index, coord.question_index);
    let display_number = display_number(
        &question_text,
        &question_label,
        metadata_number,
        coord.question_index,
    );

    let classification = classify::classify(&ClassifyInput {
        level: &coord.level,
        part: &coord.part,
        section_title: &section_title,
        question_label: &question_label,
        question_text: &question_text,
        option_texts: options.iter().map(|o| o.text.as_str()).collect(),
        has_passage: !passage_text.is_empty(),
        is_cloze,
        metadata_number,
    });

    let source_explanation = clean_text(&question.explanation);
    let answer_key_order = if classification.question_type == QuestionType::SentenceOrder {
        parse_answer_key_order(&source_explanation, &options)
    } else {
        None
    };

    Ok(QuestionContext {
        level: coord.level.clone(),
        exam_id: coord.exam_id.clone(),
        part: coord.part.clone(),
        section_index: coord.section_index,
        question_index: coord.question_index,
        section_title,
        question_label,
        display_number,
        classification,
        question_text,
        blank_question_text,
        answered_question_text,
        is_cloze,
        blank_marker,
        options,
        correct_answer,
        passage_text,
        source_explanation,
        answer_key_order,
    })
}

/// Returns the blank number when the question text is nothing but a marker like `(12)`.
pub fn blank_marker_number(question_text: &str) -> Option<String> {
    MARKER_ONLY_RE
        .captures(question_text.trim())
        .map(|caps| ascii_digits(&caps[1]))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlankSentence {
    pub sentence: String,
    /// The marker exactly as it appears in the passage.
    pub marker: String,
}

/// Finds the sentence around the first `(n)` / `（n）` marker in a passage.
pub fn locate_blank_sentence(passage: &str, number: &str) -> Option<BlankSentence> {
    let digits = regex::escape(number);
    let fullwidth: String = number
        .chars()
        .map(|c| char::from_u32(c as u32 - '0' as u32 + '０' as u32).unwrap_or(c))
        .collect();
    let pattern = format!(
        r"[（(][\s　]*(?:{}|{})[\s　]*[)）]",
        digits,
        regex::escape(&fullwidth)
    );
    let marker_re = Regex::new(&pattern).ok()?;
    let found = marker_re.find(passage)?;

    let start = passage[..found.start()]
        .char_indices()
        .rev()
        .find(|(_, c)| is_sentence_end(*c))
        .map(|(i, c)| i + c.len_utf8())
        .unwrap_or(0);
    let end = passage[found.end()..]
        .char_indices()
        .find(|(_, c)| is_sentence_end(*c))
        .map(|(i, c)| found.end() + i + if c == '\n' { 0 } else { c.len_utf8() })
        .unwrap_or(passage.len());
    let sentence = passage[start..end].trim();
    if sentence.is_empty() {
        return None;
    }
    Some(BlankSentence {
        sentence: sentence.to_string(),
        marker: found.as_str().to_string(),
    })
}

/// Resolves the exam's answer field to an option key; accepts a key, a
/// prefixed key such as `正解：２`, or the option text itself.
pub fn resolve_answer(raw: &str, options: &[OptionEntry]) -> Option<String> {
    let cleaned = clean_text(raw);
    if cleaned.is_empty() {
        return None;
    }
    let key = normalize_key(&cleaned);
    if options.iter().any(|o| o.key == key) {
        return Some(key);
    }
    if let Some(option) = options.iter().find(|o| o.text == cleaned) {
        return Some(option.key.clone());
    }
    let stripped = normalize_key(
        cleaned
            .trim_start_matches(|c: char| !c.is_ascii_digit() && !('０'..='９').contains(&c) && !('①'..='⑨').contains(&c)),
    );
    let first: String = stripped.chars().take_while(|c| c.is_ascii_alphanumeric()).collect();
    options
        .iter()
        .find(|o| o.key == first)
        .map(|o| o.key.clone())
}

fn resolve_passage(doc: &ExamPartDoc, section: &ExamSection, question: &ExamQuestionDoc) -> String {
    let mut texts: Vec<String> = Vec::new();
    let mut seen: Vec<&str> = Vec::new();
    for id in &question.passage_ids {
        if seen.contains(&id.as_str()) {
            continue;
        }
        let matched = section
            .passages
            .iter()
            .chain(doc.passages.iter())
            .find(|p| p.id == *id);
        if let Some(passage) = matched {
            seen.push(id.as_str());
            let cleaned = clean_text(&passage.text);
            if !cleaned.is_empty() {
                texts.push(cleaned);
            }
        }
    }
    if texts.is_empty() && question.passage_ids.is_empty() {
        let inline = clean_text(&question.inline_passage);
        if !inline.is_empty() {
            texts.push(inline);
        } else if section.passages.len() == 1 {
            let only = clean_text(&section.passages[0].text);
            if !only.is_empty() {
                texts.push(only);
            }
        }
    }
    texts.join("\n")
}

/// Display number: leading `NN.` in the text, digits in the label, the
/// metadata table, then the 1-based position.
pub fn display_number(
    question_text: &str,
    question_label: &str,
    metadata_number: Option<u32>,
    question_index: usize,
) -> u32 {
    classify::leading_number(question_text)
        .or_else(|| classify::label_number(question_label))
        .or(metadata_number)
        .unwrap_or_else(|| u32::try_from(question_index + 1).unwrap_or(u32::MAX))
}

/// Recovers a fragment order such as `2→4→1→3` from the exam's own explanation
/// text. Only a complete permutation of the option keys is accepted.
pub fn parse_answer_key_order(explanation: &str, options: &[OptionEntry]) -> Option<Vec<String>> {
    if explanation.is_empty() || options.is_empty() {
        return None;
    }
    let normalized = ascii_digits(explanation);
    ORDER_RUN_RE.find_iter(&normalized).find_map(|run| {
        let keys: Vec<String> = run
            .as_str()
            .chars()
            .filter(|c| c.is_ascii_digit())
            .map(|c| c.to_string())
            .collect();
        is_complete_permutation(&keys, options).then_some(keys)
    })
}

pub fn is_complete_permutation(order: &[String], options: &[OptionEntry]) -> bool {
    if order.len() != options.len() {
        return false;
    }
    let mut seen: Vec<&str> = Vec::with_capacity(order.len());
    for key in order {
        if seen.contains(&key.as_str()) || !options.iter().any(|o| o.key == *key) {
            return false;
        }
        seen.push(key.as_str());
    }
    true
}
