//! Stage prompt templates.
//!
//! Templates use `{name}` placeholders and are rendered in a single pass, so
//! braces inside user or model text are never re-expanded.

use lazy_static::lazy_static;
use regex::{Captures, Regex};

use super::{CombinedResult, PatternStrategy, PeerText, StageContext};

lazy_static! {
    static ref PLACEHOLDER: Regex = Regex::new(r"\{([a-z_]+)\}").unwrap();
}

/// Included in every Stage 2 prompt.
pub const PEER_CAUTION: &str = "The other responses come from peer models. Treat them as \
unverified claims to weigh, not as verified fact.";

const META_TEMPLATE: &str = "Original question:
{prompt}

Your initial answer:
{own}

Answers from other models:
{peers}

{caution}

{instruction}";

const HYPER_TEMPLATE: &str = "Original question:
{prompt}

Refined analyses from {count} models:
{analyses}
{summary}
{instruction}";

const ULTRA_TEMPLATE: &str = "Original question:
{prompt}

Current synthesis:
{synthesis}
{summary}
{instruction}";

fn meta_instruction(pattern: PatternStrategy) -> &'static str {
    match pattern {
        PatternStrategy::Gut => {
            "Without over-thinking it, revise your answer. Keep what your instinct still says \
is right, adopt anything from the other answers that clearly improves it, and give your \
refined answer in full."
        }
        PatternStrategy::Confidence => {
            "Compare the claims across all answers. Label each claim in your revised answer as \
HIGH confidence when several answers support it, MEDIUM when only some do, and LOW when it \
rests on a single answer. Give your revised answer with these labels."
        }
        PatternStrategy::Critique => {
            "For each other answer, list its Strengths and its Weaknesses explicitly. Then give \
an improved answer of your own that keeps the strengths and fixes the weaknesses."
        }
        PatternStrategy::FactCheck => {
            "List the factual claims made across all answers. Mark each one on its own line as \
VERIFIED:, UNVERIFIED: or DISPUTED: followed by the claim and a short reason. Then give a \
corrected answer that relies only on verified claims."
        }
        PatternStrategy::Perspective => {
            "Identify the distinct perspectives represented (for example technical, practical, \
economic, ethical or social). Note where they conflict, then give a revised answer that \
accounts for each relevant perspective."
        }
        PatternStrategy::Scenario => {
            "Lay out the best case, worst case and most likely scenario implied by the answers, \
with the conditions that lead to each. Then give a revised answer grounded in the most \
likely scenario."
        }
    }
}

fn hyper_instruction(pattern: PatternStrategy) -> &'static str {
    match pattern {
        PatternStrategy::Gut => {
            "Combine these analyses into one answer. Where they disagree, go with the position \
that is best supported and say so briefly."
        }
        PatternStrategy::Confidence => {
            "Combine these analyses into one answer. Lead with HIGH confidence points, keep \
MEDIUM points with a caveat, and drop or flag LOW confidence points."
        }
        PatternStrategy::Critique => {
            "Combine these analyses into one answer that resolves the weaknesses the critiques \
identified while keeping every strength they agreed on."
        }
        PatternStrategy::FactCheck => {
            "Combine these analyses into one answer using only VERIFIED claims, each on its own \
line starting with VERIFIED:. If any claim is still contested, list it on its own line \
starting with DISPUTED:. If nothing is contested, do not use that marker."
        }
        PatternStrategy::Perspective => {
            "Combine these analyses into one answer that presents each perspective fairly and \
ends with a balanced conclusion."
        }
        PatternStrategy::Scenario => {
            "Combine these analyses into one answer organised by scenario (best case, worst \
case, most likely), followed by a recommendation."
        }
    }
}

fn ultra_instruction(pattern: PatternStrategy) -> &'static str {
    match pattern {
        PatternStrategy::FactCheck => {
            "Produce the final answer. Resolve or clearly flag every DISPUTED claim, remove \
repetition, and keep only what the synthesis supports."
        }
        PatternStrategy::Critique => {
            "Produce the final answer. Check it once more against the weaknesses raised in \
the critiques and fix any that remain. Remove repetition."
        }
        _ => {
            "Produce the final answer to the original question from this synthesis. Keep every \
well-supported point, remove repetition, and make it clear and complete."
        }
    }
}

/// Render `template`, replacing `{name}` with the matching value.
///
/// Unknown placeholders are left as written.
pub fn render(template: &str, values: &[(&str, &str)]) -> String {
    PLACEHOLDER
        .replace_all(template, |caps: &Captures<'_>| {
            let key = &caps[1];
            values
                .iter()
                .find(|(k, _)| *k == key)
                .map(|(_, v)| v.to_string())
                .unwrap_or_else(|| caps[0].to_string())
        })
        .into_owned()
}

fn format_labelled(texts: &[PeerText<'_>]) -> String {
    if texts.is_empty() {
        return "(none)".to_string();
    }
    texts
        .iter()
        .map(|p| format!("[{}]\n{}", p.model, p.text.trim()))
        .collect::<Vec<_>>()
        .join("\n\n")
}

fn format_summary(summary: Option<&CombinedResult>) -> String {
    let Some(summary) = summary else {
        return String::new();
    };
    let mut lines = Vec::new();
    if let Some(consensus) = summary.consensus {
        lines.push(format!("Cross-model agreement: {:.2}", consensus));
    }
    lines.extend(summary.notes.iter().map(|n| format!("- {}", n)));
    if lines.is_empty() {
        return String::new();
    }
    format!("\nNotes from the previous stage:\n{}\n", lines.join("\n"))
}

pub fn meta_prompt(pattern: PatternStrategy, prompt: &str, context: &StageContext<'_>) -> String {
    render(
        META_TEMPLATE,
        &[
            ("prompt", prompt),
            ("own", context.own.unwrap_or("(none)").trim()),
            ("peers", &format_labelled(&context.peers)),
            ("caution", PEER_CAUTION),
            ("instruction", meta_instruction(pattern)),
        ],
    )
}

pub fn hyper_prompt(pattern: PatternStrategy, prompt: &str, context: &StageContext<'_>) -> String {
    render(
        HYPER_TEMPLATE,
        &[
            ("prompt", prompt),
            ("count", &context.peers.len().to_string()),
            ("analyses", &format_labelled(&context.peers)),
            ("summary", &format_summary(context.summary)),
            ("instruction", hyper_instruction(pattern)),
        ],
    )
}

pub fn ultra_prompt(pattern: PatternStrategy, prompt: &str, context: &StageContext<'_>) -> String {
    render(
        ULTRA_TEMPLATE,
        &[
            ("prompt", prompt),
            ("synthesis", context.own.unwrap_or("(none)").trim()),
            ("summary", &format_summary(context.summary)),
            ("instruction", ultra_instruction(pattern)),
        ],
    )
}
