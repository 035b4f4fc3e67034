//! Turns a model's proposed ★-question solution into one that always holds a
//! complete fragment order and a sentence consistent with it.

use lazy_static::lazy_static;
use regex::Regex;
use serde_json::Value;
use tracing::{debug, warn};

use crate::{
    classify::ASSEMBLY_MARKER,
    context::is_complete_permutation,
    error::ExplainError,
    exam_doc::normalize_key,
    llm::{json_from_response, ChatModel, ChatRequest},
    models::{OptionEntry, OrderResolution, QuestionContext, SentenceOrderSolution},
    prompts::{repair_user_prompt, REPAIR_SYSTEM},
    reading::ReadingAnnotator,
};

lazy_static! {
    static ref BLANK_CLUSTER_RE: Regex = Regex::new(r"[＿_ 　]*★[＿_ 　★]*").unwrap();
}

const REPAIR_TEMPERATURE: f32 = 0.0;

/// Repair progress. Every path reaches `Validated` with at most one model call.
#[derive(Debug, Clone, PartialEq)]
enum OrderState {
    Proposed {
        order: Vec<String>,
        resolution: OrderResolution,
    },
    PartiallyOrdered(Vec<String>),
    Repaired(Vec<String>),
    DeterministicFallback(Vec<String>),
    Validated {
        order: Vec<String>,
        resolution: OrderResolution,
    },
}

impl OrderState {
    fn name(&self) -> &'static str {
        match self {
            OrderState::Proposed { .. } => "proposed",
            OrderState::PartiallyOrdered(_) => "partially_ordered",
            OrderState::Repaired(_) => "repaired",
            OrderState::DeterministicFallback(_) => "deterministic_fallback",
            OrderState::Validated { .. } => "validated",
        }
    }
}

/// Finalizes the sentence-order solution for one question.
///
/// `proposal` is the model's `sentence_order` object (any shape). The repair
/// call is soft: any failure falls through to deterministic padding.
pub async fn solve_sentence_order(
    ctx: &QuestionContext,
    proposal: &Value,
    model: &dyn ChatModel,
    annotator: &ReadingAnnotator,
) -> Result<SentenceOrderSolution, ExplainError> {
    let proposed_sentence = str_field(proposal, "sentence");
    let proposed_keys = key_list(proposal.get("ordered_options"), &ctx.options);

    let mut state = match &ctx.answer_key_order {
        Some(order) if is_complete_permutation(order, &ctx.options) => OrderState::Proposed {
            order: order.clone(),
            resolution: OrderResolution::AnswerKey,
        },
        _ => {
            // The model's own sentence is the base; its key list only fills gaps.
            let inferred = infer_order_from_sentence(&proposed_sentence, &ctx.options);
            OrderState::Proposed {
                order: merge_orders(&inferred, &proposed_keys),
                resolution: OrderResolution::ModelProposal,
            }
        }
    };

    let (order, resolution) = loop {
        debug!(
            section = ctx.section_index,
            question = ctx.question_index,
            state = state.name(),
            "sentence order state"
        );
        state = match state {
            OrderState::Proposed { order, resolution } => {
                if is_complete_permutation(&order, &ctx.options) {
                    OrderState::Validated { order, resolution }
                } else {
                    OrderState::PartiallyOrdered(order)
                }
            }
            OrderState::PartiallyOrdered(order) => match request_repair(ctx, &order, model).await {
                Some(repaired) => OrderState::Repaired(repaired),
                None => OrderState::DeterministicFallback(order),
            },
            OrderState::Repaired(order) => OrderState::Validated {
                order,
                resolution: OrderResolution::RepairCall,
            },
            OrderState::DeterministicFallback(order) => OrderState::Validated {
                order: pad_order(&order, &ctx.options),
                resolution: OrderResolution::DeterministicFallback,
            },
            OrderState::Validated { order, resolution } => break (order, resolution),
        };
    };

    let sentence_matches = !proposed_sentence.is_empty()
        && sentence_follows_order(&proposed_sentence, &order, &ctx.options);
    let (sentence, sentence_rebuilt) = if sentence_matches {
        (proposed_sentence, false)
    } else {
        (rebuild_sentence(&ctx.blank_question_text, &order, &ctx.options), true)
    };

    let mut sentence_reading = str_field(proposal, "sentence_reading");
    let mut sentence_ruby = str_field(proposal, "sentence_ruby");
    if sentence_rebuilt || sentence_reading.is_empty() || sentence_ruby.is_empty() {
        let annotated = annotator
            .annotate(&sentence, None)
            .await
            .map_err(ExplainError::Tokenizer)?;
        if sentence_rebuilt || sentence_reading.is_empty() {
            sentence_reading = annotated.reading;
        }
        if sentence_rebuilt || sentence_ruby.is_empty() {
            sentence_ruby = annotated.ruby;
        }
    }

    let star_option = ctx
        .correct_answer
        .clone()
        .or_else(|| {
            proposal
                .get("star_option")
                .and_then(scalar_key)
                .filter(|k| ctx.options.iter().any(|o| o.key == *k))
        })
        .unwrap_or_default();

    Ok(SentenceOrderSolution {
        ordered_options: order,
        sentence,
        sentence_reading,
        sentence_ruby,
        star_option,
        rationale_vi: str_field(proposal, "rationale_vi"),
        resolution,
        sentence_rebuilt,
    })
}

async fn request_repair(
    ctx: &QuestionContext,
    current: &[String],
    model: &dyn ChatModel,
) -> Option<Vec<String>> {
    let request = ChatRequest {
        system: REPAIR_SYSTEM.to_string(),
        user: repair_user_prompt(ctx, current),
        temperature: REPAIR_TEMPERATURE,
        json_mode: true,
    };
    let completion = match model.complete(&request).await {
        Ok(completion) => completion,
        Err(err) => {
            warn!(question = ctx.question_index, "sentence order repair call failed: {}", err);
            return None;
        }
    };
    let payload = match json_from_response(&completion.content) {
        Ok(payload) => payload,
        Err(err) => {
            warn!(question = ctx.question_index, "sentence order repair unparseable: {}", err);
            return None;
        }
    };
    let keys = key_list(payload.get("ordered_options"), &ctx.options);
    if is_complete_permutation(&keys, &ctx.options) {
        Some(keys)
    } else {
        warn!(
            question = ctx.question_index,
            returned = keys.len(),
            "sentence order repair returned an incomplete order"
        );
        None
    }
}

/// Orders options by where their text first appears in `sentence`. Longer
/// fragments claim their span first so a short fragment is not matched inside
/// a longer one; ties on position go to the longer match.
pub fn infer_order_from_sentence(sentence: &str, options: &[OptionEntry]) -> Vec<String> {
    if sentence.is_empty() {
        return Vec::new();
    }
    let mut by_length: Vec<&OptionEntry> = options.iter().filter(|o| !o.text.is_empty()).collect();
    by_length.sort_by(|a, b| b.text.len().cmp(&a.text.len()));

    let mut claimed: Vec<(usize, usize)> = Vec::new();
    let mut found: Vec<(usize, usize, &str)> = Vec::new();
    for option in by_length {
        let hit = sentence.match_indices(option.text.as_str()).find(|(start, text)| {
            let end = start + text.len();
            !claimed.iter().any(|(s, e)| *start < *e && end > *s)
        });
        if let Some((start, text)) = hit {
            claimed.push((start, start + text.len()));
            found.push((start, text.len(), option.key.as_str()));
        }
    }
    found.sort_by(|a, b| a.0.cmp(&b.0).then(b.1.cmp(&a.1)));
    found.into_iter().map(|(_, _, key)| key.to_string()).collect()
}

/// Appends keys from `extra` that are not already in `base`.
pub fn merge_orders(base: &[String], extra: &[String]) -> Vec<String> {
    let mut merged: Vec<String> = Vec::with_capacity(base.len() + extra.len());
    for key in base.iter().chain(extra.iter()) {
        if !merged.contains(key) {
            merged.push(key.clone());
        }
    }
    merged
}

/// Keeps the valid, distinct prefix of `order` and appends missing keys in
/// natural order.
pub fn pad_order(order: &[String], options: &[OptionEntry]) -> Vec<String> {
    let mut padded: Vec<String> = Vec::with_capacity(options.len());
    for key in order {
        if options.iter().any(|o| o.key == *key) && !padded.contains(key) {
            padded.push(key.clone());
        }
    }
    let mut missing: Vec<&str> = options
        .iter()
        .map(|o| o.key.as_str())
        .filter(|k| !padded.iter().any(|p| p == k))
        .collect();
    missing.sort_by(|a, b| natural_key(a).cmp(&natural_key(b)));
    padded.extend(missing.into_iter().map(str::to_string));
    padded
}

fn natural_key(key: &str) -> (u64, String) {
    (key.parse().unwrap_or(u64::MAX), key.to_string())
}

/// True when every option text occurs in `sentence`, in `order`.
pub fn sentence_follows_order(sentence: &str, order: &[String], options: &[OptionEntry]) -> bool {
    let mut cursor = 0usize;
    for key in order {
        let text = match options.iter().find(|o| o.key == *key) {
            Some(option) => option.text.as_str(),
            None => return false,
        };
        match sentence[cursor..].find(text) {
            Some(offset) => cursor += offset + text.len(),
            None => return false,
        }
    }
    true
}

/// Places the ordered fragments into the ★ blank cluster, or onto ★ itself,
/// or at the end when the stem has no marker.
pub fn rebuild_sentence(stem: &str, order: &[String], options: &[OptionEntry]) -> String {
    let joined: String = order
        .iter()
        .filter_map(|key| options.iter().find(|o| o.key == *key))
        .map(|o| o.text.as_str())
        .collect();
    if let Some(cluster) = BLANK_CLUSTER_RE.find(stem) {
        return format!("{}{}{}", &stem[..cluster.start()], joined, &stem[cluster.end()..]);
    }
    if stem.contains(ASSEMBLY_MARKER) {
        return stem.replacen(ASSEMBLY_MARKER, &joined, 1);
    }
    format!("{}{}", stem.trim_end(), joined)
}

fn key_list(value: Option<&Value>, options: &[OptionEntry]) -> Vec<String> {
    let Some(Value::Array(items)) = value else {
        return Vec::new();
    };
    let mut keys: Vec<String> = Vec::new();
    for item in items {
        let key = scalar_key(item).or_else(|| {
            item.as_str()
                .and_then(|text| options.iter().find(|o| o.text == text.trim()))
                .map(|o| o.key.clone())
        });
        if let Some(key) = key {
            if options.iter().any(|o| o.key == key) && !keys.contains(&key) {
                keys.push(key);
            }
        }
    }
    keys
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
