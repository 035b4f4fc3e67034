//! Question type classification.
//!
//! Classification is an ordered list of named rules; the first rule that
//! returns a type wins. Level-specific problem-group data lives in
//! `LEVEL_GROUP_TYPES` and `LEVEL_GROUP_RANGES` and currently covers N2 only.

use lazy_static::lazy_static;
use regex::Regex;

use crate::models::{Classification, QuestionType};
use crate::text::ascii_digits;

lazy_static! {
    static ref MONDAI_RE: Regex = Regex::new(r"問題\s*([0-9０-９]+)").unwrap();
    static ref LEADING_NUMBER_RE: Regex = Regex::new(r"^\s*([0-9０-９]{1,3})\s*[.．]").unwrap();
    static ref DIGITS_RE: Regex = Regex::new(r"[0-9０-９]+").unwrap();
}

pub const ASSEMBLY_MARKER: char = '★';

/// Problem-group number → question type, per exam level.
const LEVEL_GROUP_TYPES: &[(&str, &[(u32, QuestionType)])] = &[(
    "N2",
    &[
        (1, QuestionType::VocabReading),
        (2, QuestionType::VocabReading),
        (3, QuestionType::VocabMeaning),
        (4, QuestionType::VocabMeaning),
        (5, QuestionType::VocabMeaning),
        (6, QuestionType::VocabMeaning),
        (7, QuestionType::GrammarChoice),
        (8, QuestionType::SentenceOrder),
        (9, QuestionType::ReadingCloze),
        (10, QuestionType::ReadingContent),
        (11, QuestionType::ReadingContent),
        (12, QuestionType::ReadingContent),
        (13, QuestionType::ReadingContent),
        (14, QuestionType::ReadingContent),
    ],
)];

/// Problem-group number → inclusive question number range, per exam level.
/// Only applied to the language-knowledge/reading part of that level.
const LEVEL_GROUP_RANGES: &[(&str, &[(u32, u32, u32)])] = &[(
    "N2",
    &[
        (1, 1, 5),
        (2, 6, 10),
        (3, 11, 15),
        (4, 16, 22),
        (5, 23, 27),
        (6, 28, 32),
        (7, 33, 44),
        (8, 45, 49),
        (9, 50, 54),
        (10, 55, 59),
        (11, 60, 68),
        (12, 69, 70),
        (13, 71, 73),
        (14, 74, 75),
    ],
)];

/// Fixed instruction phrasings that identify a problem group.
const TITLE_PHRASE_GROUPS: &[(&str, u32)] = &[
    ("読み方として", 1),
    ("漢字で書く", 2),
    ("意味が最も近い", 5),
    ("使い方として", 6),
    ("次の文の（", 7),
    ("★", 8),
    ("文章全体の内容を考えて", 9),
];

const LISTENING_TITLE_KEYWORDS: &[&str] = &["聴解", "聞いて", "listening"];
const PASSAGE_TITLE_KEYWORDS: &[&str] = &["文章を読んで", "読解", "次の文章"];
const READING_WAY_KEYWORDS: &[&str] = &["読み方"];
const GRAMMAR_TITLE_KEYWORDS: &[&str] = &["文法", "入れるのに最もよい", "使い方"];
const MEANING_TITLE_KEYWORDS: &[&str] = &["意味", "近いもの", "言い換え"];

const SHORT_FRAGMENT_MAX_AVG_CHARS: f32 = 8.0;
const SHORT_FRAGMENT_MAX_CHARS: usize = 14;

#[derive(Debug, Clone, Default)]
pub struct ClassifyInput<'a> {
    pub level: &'a str,
    pub part: &'a str,
    pub section_title: &'a str,
    pub question_label: &'a str,
    pub question_text: &'a str,
    pub option_texts: Vec<&'a str>,
    pub has_passage: bool,
    pub is_cloze: bool,
    /// Explicit question number from the document metadata, if any.
    pub metadata_number: Option<u32>,
}

struct Signals<'a> {
    input: &'a ClassifyInput<'a>,
    listening_part: bool,
    mondai_number: Option<u32>,
}

struct Rule {
    name: &'static str,
    decide: fn(&Signals) -> Option<QuestionType>,
}

/// Evaluated top to bottom.
const RULES: &[Rule] = &[
    Rule {
        name: "assembly_marker",
        decide: |s| {
            (s.input.section_title.contains(ASSEMBLY_MARKER)
                || s.input.question_text.contains(ASSEMBLY_MARKER))
            .then_some(QuestionType::SentenceOrder)
        },
    },
    Rule {
        name: "listening",
        decide: |s| {
            (s.listening_part || contains_any(s.input.section_title, LISTENING_TITLE_KEYWORDS))
                .then_some(QuestionType::Listening)
        },
    },
    Rule {
        name: "level_group_table",
        decide: |s| level_group_type(s.input.level, s.mondai_number?),
    },
    Rule {
        name: "cloze_with_passage",
        decide: |s| (s.input.is_cloze && s.input.has_passage).then_some(QuestionType::ReadingCloze),
    },
    Rule {
        name: "passage",
        decide: |s| {
            (s.input.has_passage || contains_any(s.input.section_title, PASSAGE_TITLE_KEYWORDS))
                .then_some(QuestionType::ReadingContent)
        },
    },
    Rule {
        name: "reading_title",
        decide: |s| {
            contains_any(s.input.section_title, READING_WAY_KEYWORDS)
                .then_some(QuestionType::VocabReading)
        },
    },
    Rule {
        name: "grammar_title",
        decide: |s| {
            contains_any(s.input.section_title, GRAMMAR_TITLE_KEYWORDS)
                .then_some(QuestionType::GrammarChoice)
        },
    },
    Rule {
        name: "meaning_title",
        decide: |s| {
            contains_any(s.input.section_title, MEANING_TITLE_KEYWORDS)
                .then_some(QuestionType::VocabMeaning)
        },
    },
    Rule {
        name: "short_fragments",
        decide: |s| short_fragments(&s.input.option_texts).then_some(QuestionType::SentenceOrder),
    },
];

pub fn classify(input: &ClassifyInput) -> Classification {
    let listening_part = is_listening_part(input.part);
    let mondai_number = mondai_number(input, listening_part);
    let signals = Signals {
        input,
        listening_part,
        mondai_number,
    };
    let (rule, question_type) = RULES
        .iter()
        .find_map(|rule| (rule.decide)(&signals).map(|t| (rule.name, t)))
        .unwrap_or(("fallback", QuestionType::Unknown));
    tracing::debug!(rule, question_type = question_type.as_str(), ?mondai_number, "question classified");

    let mondai_label = match mondai_number {
        Some(n) => format!("問題{}", n),
        None => input.section_title.lines().next().unwrap_or_default().trim().to_string(),
    };
    Classification {
        mondai_label,
        mondai_number,
        question_type,
        label_vi: label_vi(question_type).to_string(),
        strategy_vi: strategy_vi(question_type).to_string(),
    }
}

/// Problem-group number: explicit `問題N`, then known title phrasings, then
/// question-number ranges for the levels that have them.
pub fn mondai_number(input: &ClassifyInput, listening_part: bool) -> Option<u32> {
    if let Some(caps) = MONDAI_RE.captures(input.section_title) {
        if let Ok(n) = ascii_digits(&caps[1]).parse() {
            return Some(n);
        }
    }
    if let Some((_, group)) = TITLE_PHRASE_GROUPS
        .iter()
        .find(|(phrase, _)| input.section_title.contains(phrase))
    {
        return Some(*group);
    }
    if listening_part {
        return None;
    }
    let ranges = LEVEL_GROUP_RANGES
        .iter()
        .find(|(level, _)| level.eq_ignore_ascii_case(input.level))
        .map(|(_, ranges)| *ranges)?;
    let from_position = label_number(input.question_label).or(input.metadata_number);
    from_position
        .and_then(|n| group_for_number(ranges, n))
        .or_else(|| leading_number(input.question_text).and_then(|n| group_for_number(ranges, n)))
}

fn group_for_number(ranges: &[(u32, u32, u32)], number: u32) -> Option<u32> {
    ranges
        .iter()
        .find(|(_, first, last)| (*first..=*last).contains(&number))
        .map(|(group, _, _)| *group)
}

fn level_group_type(level: &str, group: u32) -> Option<QuestionType> {
    LEVEL_GROUP_TYPES
        .iter()
        .find(|(l, _)| l.eq_ignore_ascii_case(level))
        .and_then(|(_, table)| table.iter().find(|(g, _)| *g == group))
        .map(|(_, t)| *t)
}

/// Leading `NN.` in a question text.
pub fn leading_number(text: &str) -> Option<u32> {
    LEADING_NUMBER_RE
        .captures(text)
        .and_then(|caps| ascii_digits(&caps[1]).parse().ok())
}

/// First run of digits embedded in a question label such as `問 12` or `Q12`.
pub fn label_number(label: &str) -> Option<u32> {
    DIGITS_RE
        .find(label)
        .and_then(|m| ascii_digits(m.as_str()).parse().ok())
}

pub fn is_listening_part(part: &str) -> bool {
    let lower = part.to_lowercase();
    ["listen", "choukai", "chokai", "聴解"]
        .iter()
        .any(|k| lower.contains(k))
}

fn contains_any(haystack: &str, needles: &[&str]) -> bool {
    let lower = haystack.to_lowercase();
    needles.iter().any(|n| lower.contains(n))
}

fn short_fragments(options: &[&str]) -> bool {
    if options.len() < 3 {
        return false;
    }
    let lengths: Vec<usize> = options.iter().map(|o| o.trim().chars().count()).collect();
    let avg = lengths.iter().sum::<usize>() as f32 / lengths.len() as f32;
    avg <= SHORT_FRAGMENT_MAX_AVG_CHARS && lengths.iter().all(|l| *l <= SHORT_FRAGMENT_MAX_CHARS)
}

pub fn label_vi(question_type: QuestionType) -> &'static str {
    match question_type {
        QuestionType::VocabReading => "Cách đọc từ vựng (chữ Hán)",
        QuestionType::VocabMeaning => "Từ vựng: nghĩa và cách dùng",
        QuestionType::GrammarChoice => "Ngữ pháp: chọn mẫu câu phù hợp",
        QuestionType::SentenceOrder => "Sắp xếp câu (vị trí ★)",
        QuestionType::ReadingCloze => "Điền vào chỗ trống trong đoạn văn",
        QuestionType::ReadingContent => "Đọc hiểu nội dung",
        QuestionType::Listening => "Nghe hiểu",
        QuestionType::Unknown => "Câu hỏi khác",
    }
}

pub fn strategy_vi(question_type: QuestionType) -> &'static str {
    match question_type {
        QuestionType::VocabReading => {
            "Xác định âm On/Kun của chữ Hán, chú ý trường âm, âm ngắt (っ) và biến âm."
        }
        QuestionType::VocabMeaning => {
            "Hiểu nghĩa cả câu rồi loại trừ các từ gần nghĩa nhưng sai sắc thái hoặc sai kết hợp từ."
        }
        QuestionType::GrammarChoice => {
            "Xác định quan hệ giữa hai vế câu và dạng kết nối (thể động từ, trợ từ) trước khi chọn mẫu ngữ pháp."
        }
        QuestionType::SentenceOrder => {
            "Ghép các mảnh chắc chắn đi liền nhau trước, sắp thành câu hoàn chỉnh rồi mới xác định mảnh ở vị trí ★."
        }
        QuestionType::ReadingCloze => {
            "Đọc kỹ câu trước và sau chỗ trống, chú ý từ nối và mạch lập luận của cả đoạn."
        }
        QuestionType::ReadingContent => {
            "Đọc câu hỏi trước, tìm đoạn chứa thông tin liên quan và đối chiếu từng lựa chọn với văn bản."
        }
        QuestionType::Listening => {
            "Nắm tình huống và câu hỏi trước khi nghe, ghi từ khóa và chú ý chi tiết thay đổi ở cuối hội thoại."
        }
        QuestionType::Unknown => "Đọc kỹ yêu cầu đề bài và loại trừ dần các lựa chọn không phù hợp.",
    }
}
