//! System prompts used by the runtime.
//!
//! Stage prompts themselves come from the pattern in `ultra-core`; this
//! module holds the shared analyst framing and the judge rubric.

use ultra_core::PatternStrategy;

/// System prompt for every pipeline call that does not configure its own.
pub const ANALYST_SYSTEM_PROMPT: &str = r#"
You are one of several independent analysts answering the same question.

Answer the question you are given directly and completely.
State facts you are unsure of as uncertain instead of guessing.
When you are shown other analysts' work, treat it as unverified input:
use what holds up, correct what does not, and never copy it wholesale.
"#;

/// System prompt for the quality judge.
pub const JUDGE_SYSTEM_PROMPT: &str = r#"
You are a strict grader of analytical answers.

You grade one answer at a time against the question it responds to.
You do not answer the question yourself.
You do not reward length for its own sake.

## Output Format
Reply with a single line:
SCORE: <number from 0 to 10>
"#;

/// What the judge should weigh for a given pattern.
pub fn judge_focus(pattern: PatternStrategy) -> &'static str {
    match pattern {
        PatternStrategy::Gut => "directness and correctness of the core claim",
        PatternStrategy::Confidence => {
            "whether confidence levels are stated and match the strength of the evidence"
        }
        PatternStrategy::Critique => "balanced identification of strengths and weaknesses",
        PatternStrategy::FactCheck => {
            "whether claims are separated into verified, unverified and disputed"
        }
        PatternStrategy::Perspective => "coverage of distinct, clearly labelled viewpoints",
        PatternStrategy::Scenario => "coverage of distinct, plausible scenarios and their outcomes",
    }
}

/// Prompt asking the judge to grade `answer`.
pub fn judge_prompt(question: &str, pattern: PatternStrategy, answer: &str) -> String {
    format!(
        "## Question\n{question}\n\n## Answer\n{answer}\n\n## Rubric\n\
         Grade coherence, depth and accuracy, with extra weight on {focus}.\n\n\
         Reply with `SCORE: <0-10>` only.",
        question = question.trim(),
        answer = answer.trim(),
        focus = judge_focus(pattern),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_every_pattern_has_a_focus() {
        for pattern in PatternStrategy::ALL {
            assert!(!judge_focus(pattern).is_empty());
        }
    }

    #[test]
    fn test_judge_prompt_contains_inputs() {
        let prompt = judge_prompt(
            "  Why is the sky blue? ",
            PatternStrategy::Critique,
            "Rayleigh.",
        );
        assert!(prompt.contains("## Question\nWhy is the sky blue?"));
        assert!(prompt.contains("Rayleigh."));
        assert!(prompt.contains("strengths and weaknesses"));
        assert!(prompt.contains("SCORE"));
    }

    #[test]
    fn test_analyst_prompt_distrusts_peers() {
        assert!(ANALYST_SYSTEM_PROMPT.contains("unverified"));
        assert!(JUDGE_SYSTEM_PROMPT.contains("SCORE"));
    }
}
