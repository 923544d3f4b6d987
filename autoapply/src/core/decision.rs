//! Parsing model completions into typed decisions.
//!
//! The model answers in a fixed line protocol:
//!
//! ```text
//! Thought: <one reasoning step>
//! Action: <tool name>
//! Action Input: <input>
//! ```
//!
//! or `Thought:` followed by `Final Answer: <message>`. Anything else is a
//! format violation that is fed back to the model as an observation.

use std::sync::LazyLock;

use regex::Regex;
use serde::Serialize;
use thiserror::Error;

use crate::core::tools::{Tool, ToolCall};

static THINK_BLOCK_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)<think>.*?</think>").unwrap());

static LABEL_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?mi)^[ \t>]*\**[ \t]*(thought|action[ _]input|action|final[ _]answer|observation)[ \t]*\**[ \t]*:[ \t]*\**",
    )
    .unwrap()
});

/// Why a completion could not be turned into a decision.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FormatError {
    #[error("the response was empty")]
    Empty,
    #[error("the response named no Action and no Final Answer")]
    NoAction,
    #[error("'{name}' is not an available tool")]
    UnknownTool { name: String },
    #[error("invalid Action Input for {tool}: {reason}")]
    BadInput { tool: String, reason: String },
    #[error("the response contained both an Action and a Final Answer; choose exactly one")]
    ActionAndFinal,
    #[error("the Final Answer was empty")]
    EmptyFinal,
    #[error(
        "a Final Answer is only accepted once the page shows a submission confirmation; \
         quote the confirmation you see, or keep working"
    )]
    UnconfirmedFinish,
}

impl FormatError {
    /// Observation text appended to history so the model can correct itself.
    pub fn observation(&self) -> String {
        format!(
            "Format error: {self}. Reply with 'Thought:' followed by either \
             'Action:' (one of: {}) and 'Action Input:', or 'Final Answer:'.",
            Tool::names().join(", ")
        )
    }
}

/// Syntactically valid model output, before any finish policy is applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Parsed {
    Act { thought: String, call: ToolCall },
    Finish { thought: String, message: String },
}

/// What the orchestrator does with one model turn.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Decision {
    Act { thought: String, call: ToolCall },
    Finish { thought: String, message: String },
    /// Recoverable: the violation is fed back as an observation.
    Malformed { error: FormatError, raw: String },
    /// Recoverable: the model did not answer in time.
    Stalled { reason: String },
}

impl Decision {
    /// Short label used in logs and attempt metadata.
    pub fn label(&self) -> &'static str {
        match self {
            Decision::Act { .. } => "act",
            Decision::Finish { .. } => "finish",
            Decision::Malformed { .. } => "malformed",
            Decision::Stalled { .. } => "stalled",
        }
    }
}

/// Deterministic gate on top of the model's own claim that it is done.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FinishPolicy {
    pub require_confirmation: bool,
    /// Lowercase phrases; one must appear in the thought or final message.
    pub phrases: Vec<String>,
}

impl Default for FinishPolicy {
    fn default() -> Self {
        Self {
            require_confirmation: true,
            phrases: default_confirmation_phrases(),
        }
    }
}

pub fn default_confirmation_phrases() -> Vec<String> {
    [
        "submitted",
        "thank you",
        "thanks for applying",
        "application received",
        "application has been",
        "we have received",
        "successfully applied",
        "confirmation number",
        "confirmation email",
    ]
    .into_iter()
    .map(str::to_string)
    .collect()
}

/// Words that deny or defer a phrase when they come shortly before it.
const NEGATIONS: &[&str] = &[
    "not", "no", "never", "yet", "haven't", "hasn't", "hadn't", "didn't", "don't", "doesn't",
    "wasn't", "isn't", "aren't", "weren't", "cannot", "can't", "couldn't", "won't", "without",
    "before", "until", "unless", "if", "once", "will", "should", "must", "need", "looking",
    "waiting", "trying",
];
/// How many words before a phrase are searched for a negation.
const NEGATION_WINDOW: usize = 4;

fn words(text: &str) -> Vec<&str> {
    text.split(|c: char| !(c.is_alphanumeric() || c == '\''))
        .map(|w| w.trim_matches('\''))
        .filter(|w| !w.is_empty())
        .collect()
}

/// True if `phrase` appears in `sentence` without a negation just before it
/// or a trailing "yet".
fn affirms(sentence: &[&str], phrase: &[&str]) -> bool {
    if phrase.is_empty() || phrase.len() > sentence.len() {
        return false;
    }
    (0..=sentence.len() - phrase.len()).any(|start| {
        let end = start + phrase.len();
        if sentence[start..end] != *phrase {
            return false;
        }
        let before = &sentence[start.saturating_sub(NEGATION_WINDOW)..start];
        let negated = before.iter().any(|w| NEGATIONS.contains(w));
        let deferred = sentence[end..].iter().take(2).any(|w| *w == "yet");
        !negated && !deferred
    })
}

impl FinishPolicy {
    /// Accept the finish only if some sentence affirms a confirmation phrase.
    pub fn check(&self, thought: &str, message: &str) -> Result<(), FormatError> {
        if !self.require_confirmation {
            return Ok(());
        }
        let haystack = format!("{thought}\n{message}")
            .to_lowercase()
            .replace('\u{2019}', "'");
        let sentences: Vec<Vec<&str>> = haystack
            .split(['.', '!', '?', ';', '\n'])
            .map(words)
            .filter(|s| !s.is_empty())
            .collect();
        let confirmed = self.phrases.iter().any(|phrase| {
            let phrase = phrase.to_lowercase();
            let phrase = words(&phrase);
            sentences.iter().any(|sentence| affirms(sentence, &phrase))
        });
        if confirmed {
            Ok(())
        } else {
            Err(FormatError::UnconfirmedFinish)
        }
    }
}

/// Remove `<think>` blocks, including an unterminated leading one.
pub fn strip_reasoning(raw: &str) -> String {
    let stripped = THINK_BLOCK_RE.replace_all(raw, "");
    let stripped = match stripped.rfind("</think>") {
        Some(idx) => &stripped[idx + "</think>".len()..],
        None => stripped.as_ref(),
    };
    stripped.trim().to_string()
}

#[derive(Debug, Default)]
struct Fields {
    thought: Option<String>,
    action: Option<String>,
    action_input: Option<String>,
    final_answer: Option<String>,
}

fn split_fields(text: &str) -> Fields {
    let labels: Vec<(String, usize, usize)> = LABEL_RE
        .captures_iter(text)
        .filter_map(|caps| {
            let whole = caps.get(0)?;
            let label = caps.get(1)?.as_str().to_ascii_lowercase().replace('_', " ");
            Some((label, whole.start(), whole.end()))
        })
        .collect();

    let mut fields = Fields::default();
    for (i, (label, _, body_start)) in labels.iter().enumerate() {
        let body_end = labels.get(i + 1).map_or(text.len(), |next| next.1);
        let body = text[*body_start..body_end].trim().to_string();
        let slot = match label.as_str() {
            "thought" => &mut fields.thought,
            "action" => &mut fields.action,
            "action input" => &mut fields.action_input,
            "final answer" => &mut fields.final_answer,
            // A hallucinated observation ends the model's turn.
            _ => break,
        };
        if slot.is_none() {
            *slot = Some(body);
        }
    }
    fields
}

fn clean_input(input: &str) -> String {
    let mut s = input.trim();
    if let Some(rest) = s.strip_prefix("```") {
        let rest = rest.split_once('\n').map_or(rest, |(_, body)| body);
        s = rest.strip_suffix("```").unwrap_or(rest).trim();
    }
    let s = s.trim_matches(|c: char| c == '`' || c == '*').trim();
    let quoted = s.len() >= 2
        && ((s.starts_with('"') && s.ends_with('"')) || (s.starts_with('\'') && s.ends_with('\'')));
    if quoted {
        s[1..s.len() - 1].trim().to_string()
    } else {
        s.to_string()
    }
}

/// Parse one completion into an action or a finish.
pub fn parse_react(raw: &str) -> Result<Parsed, FormatError> {
    let text = strip_reasoning(raw);
    if text.is_empty() {
        return Err(FormatError::Empty);
    }
    let fields = split_fields(&text);
    let thought = fields.thought.unwrap_or_default();

    let action = fields
        .action
        .as_deref()
        .and_then(|a| a.lines().next())
        .map(str::trim)
        .filter(|a| !a.is_empty());

    match (action, fields.final_answer) {
        (Some(_), Some(_)) => Err(FormatError::ActionAndFinal),
        (None, Some(message)) => {
            let message = clean_input(&message);
            if message.is_empty() {
                return Err(FormatError::EmptyFinal);
            }
            Ok(Parsed::Finish { thought, message })
        }
        (Some(name), None) => {
            let tool = Tool::from_name(name).ok_or_else(|| FormatError::UnknownTool {
                name: name.to_string(),
            })?;
            let input = clean_input(fields.action_input.as_deref().unwrap_or_default());
            let call = ToolCall::parse(tool, &input).map_err(|reason| FormatError::BadInput {
                tool: tool.name().to_string(),
                reason,
            })?;
            Ok(Parsed::Act { thought, call })
        }
        (None, None) => Err(FormatError::NoAction),
    }
}

/// Parse a completion and apply the finish policy.
pub fn interpret(raw: &str, policy: &FinishPolicy) -> Decision {
    match parse_react(raw) {
        Ok(Parsed::Act { thought, call }) => Decision::Act { thought, call },
        Ok(Parsed::Finish { thought, message }) => match policy.check(&thought, &message) {
            Ok(()) => Decision::Finish { thought, message },
            Err(error) => Decision::Malformed {
                error,
                raw: raw.to_string(),
            },
        },
        Err(error) => Decision::Malformed {
            error,
            raw: raw.to_string(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_action_with_input() {
        let raw = "Thought: the email field is empty\nAction: Type_Text\nAction Input: 4|jane@example.com";
        assert_eq!(
            parse_react(raw),
            Ok(Parsed::Act {
                thought: "the email field is empty".to_string(),
                call: ToolCall::TypeText {
                    id: 4,
                    text: "jane@example.com".to_string()
                },
            })
        );
    }

    #[test]
    fn strips_think_blocks_and_markdown_labels() {
        let raw = "<think>lots of\nreasoning\nAction: Go_Back</think>\n**Thought:** click apply\n**Action:** `click_element`\n**Action Input:** \"[7]\"";
        match parse_react(raw) {
            Ok(Parsed::Act { call, .. }) => assert_eq!(call, ToolCall::Click { id: 7 }),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn unterminated_think_prefix_is_dropped() {
        let raw = "reasoning without opener</think>Thought: ok\nAction: Scroll_Down\nAction Input: none";
        assert!(matches!(
            parse_react(raw),
            Ok(Parsed::Act {
                call: ToolCall::ScrollDown,
                ..
            })
        ));
    }

    #[test]
    fn hallucinated_observation_ends_the_turn() {
        let raw = "Thought: t\nAction: Click_Element\nAction Input: 3\nObservation: clicked\nFinal Answer: done";
        assert!(matches!(
            parse_react(raw),
            Ok(Parsed::Act {
                call: ToolCall::Click { id: 3 },
                ..
            })
        ));
    }

    #[test]
    fn both_action_and_final_is_malformed() {
        let raw = "Thought: t\nAction: Go_Back\nAction Input: x\nFinal Answer: done";
        assert_eq!(parse_react(raw), Err(FormatError::ActionAndFinal));
    }

    #[test]
    fn unknown_tool_fails_closed() {
        let raw = "Thought: t\nAction: Submit_Everything\nAction Input: 1";
        assert_eq!(
            parse_react(raw),
            Err(FormatError::UnknownTool {
                name: "Submit_Everything".to_string()
            })
        );
    }

    #[test]
    fn bad_input_names_the_tool() {
        let raw = "Thought: t\nAction: Click_Element\nAction Input: the blue button";
        match parse_react(raw) {
            Err(FormatError::BadInput { tool, .. }) => assert_eq!(tool, "Click_Element"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn prose_without_labels_is_no_action() {
        assert_eq!(
            parse_react("I think I should click the button."),
            Err(FormatError::NoAction)
        );
        assert_eq!(parse_react("  <think>x</think> "), Err(FormatError::Empty));
    }

    #[test]
    fn finish_requires_confirmation_phrase_by_default() {
        let policy = FinishPolicy::default();
        let unconfirmed = interpret("Thought: I filled the form\nFinal Answer: done", &policy);
        assert!(matches!(
            unconfirmed,
            Decision::Malformed {
                error: FormatError::UnconfirmedFinish,
                ..
            }
        ));

        let confirmed = interpret(
            "Thought: the page says 'Thank you for applying'\nFinal Answer: Application submitted",
            &policy,
        );
        assert_eq!(
            confirmed,
            Decision::Finish {
                thought: "the page says 'Thank you for applying'".to_string(),
                message: "Application submitted".to_string(),
            }
        );
    }

    #[test]
    fn negated_or_pending_confirmation_is_not_a_finish() {
        let policy = FinishPolicy::default();
        for (thought, message) in [
            ("I have not submitted yet", "done"),
            ("I haven\u{2019}t submitted the form", "done"),
            ("The form is not submitted", "done"),
            ("Has the application been submitted yet", "unsure"),
            ("I am looking for the confirmation button", "done"),
            ("I will say thank you once it is submitted", "almost"),
        ] {
            assert_eq!(
                policy.check(thought, message),
                Err(FormatError::UnconfirmedFinish),
                "{thought}"
            );
        }
    }

    #[test]
    fn affirmed_confirmation_in_any_sentence_is_a_finish() {
        let policy = FinishPolicy::default();
        for (thought, message) in [
            ("The page shows: Thank you for applying!", "done"),
            ("I clicked Submit. Application submitted successfully.", "done"),
            ("We have not seen errors. Your confirmation number is 1234", "done"),
            ("Banner reads \"We have received your application\"", "applied"),
        ] {
            assert_eq!(policy.check(thought, message), Ok(()), "{thought}");
        }
    }

    #[test]
    fn finish_gate_can_be_disabled() {
        let policy = FinishPolicy {
            require_confirmation: false,
            phrases: Vec::new(),
        };
        assert_eq!(
            interpret("Final Answer: done", &policy).label(),
            "finish"
        );
    }

    #[test]
    fn observation_lists_tools() {
        let obs = FormatError::NoAction.observation();
        assert!(obs.starts_with("Format error:"));
        assert!(obs.contains("Pause_For_Human"));
    }
}
