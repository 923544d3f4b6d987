//! Prompt builder for the decision, answer and vision models.
//!
//! Decision prompts are rendered from a sectioned template and then fitted
//! into a byte budget. The visual summary goes first, then the element list
//! is cut at a line boundary down to half the budget, then the history is
//! re-rendered with fewer entries. The newest history entry is never dropped.

use std::sync::LazyLock;

use anyhow::Result;
use minijinja::{Environment, context};
use serde::Serialize;
use tracing::debug;

use crate::core::perception::PerceptionSnapshot;
use crate::core::scratchpad::Scratchpad;
use crate::core::tools::Tool;
use crate::core::types::Job;

const DECISION_TEMPLATE: &str = include_str!("prompts/decision.md");
const ANSWER_TEMPLATE: &str = include_str!("prompts/answer.md");
const VISION_TEMPLATE: &str = include_str!("prompts/vision.md");
const HISTORY_TEMPLATE: &str = include_str!("prompts/history.md");

/// Section removed first when the decision prompt is over budget.
const DROP_KEY: &str = "vision";
/// Section re-rendered with fewer entries once the element list is at its floor.
const HISTORY_KEY: &str = "history";
/// Section cut line by line.
const TRUNCATE_KEY: &str = "elements";
const TRUNCATION_MARKER: &str = "[element list truncated]";
/// The element list keeps `budget / ELEMENTS_FLOOR_DIVISOR` bytes before history shrinks.
const ELEMENTS_FLOOR_DIVISOR: usize = 2;

static SECTION_RE: LazyLock<regex::Regex> = LazyLock::new(|| {
    regex::Regex::new(r"<!--\s*section:(\w+)\s+(required|droppable|shrinkable)\s*-->")
        .expect("section marker regex is valid")
});

#[derive(Debug, Clone, Serialize)]
struct ToolContext {
    name: &'static str,
    description: &'static str,
}

#[derive(Debug, Clone, Serialize)]
struct JobContext<'a> {
    url: &'a str,
    title: &'a str,
    company: &'a str,
}

/// Everything the decision model sees for one iteration.
#[derive(Debug, Clone, Copy)]
pub struct DecisionInputs<'a> {
    pub job: &'a Job,
    pub iteration: u32,
    pub max_iterations: u32,
    pub history: &'a Scratchpad,
    pub snapshot: &'a PerceptionSnapshot,
}

#[derive(Debug, Clone)]
struct ParsedSection {
    key: String,
    droppable: bool,
    content: String,
}

/// Split rendered output on `<!-- section:KEY required|droppable|shrinkable -->` markers.
///
/// Empty sections are discarded unless required.
fn parse_sections(rendered: &str) -> Vec<ParsedSection> {
    let markers: Vec<_> = SECTION_RE.captures_iter(rendered).collect();
    let mut sections = Vec::with_capacity(markers.len());

    for (i, caps) in markers.iter().enumerate() {
        let (Some(whole), Some(key), Some(kind)) = (caps.get(0), caps.get(1), caps.get(2)) else {
            continue;
        };
        let end = markers
            .get(i + 1)
            .and_then(|next| next.get(0))
            .map_or(rendered.len(), |m| m.start());
        let content = rendered[whole.end()..end].trim().to_string();
        if !content.is_empty() || kind.as_str() == "required" {
            sections.push(ParsedSection {
                key: key.as_str().to_string(),
                droppable: kind.as_str() == "droppable",
                content,
            });
        }
    }
    sections
}

fn total_len(sections: &[ParsedSection]) -> usize {
    let separators = sections.len().saturating_sub(1) * 2;
    sections.iter().map(|s| s.content.len()).sum::<usize>() + separators
}

fn drop_section(sections: &mut Vec<ParsedSection>, key: &str, budget: usize) {
    if total_len(sections) <= budget {
        return;
    }
    if let Some(idx) = sections.iter().position(|s| s.key == key && s.droppable) {
        let dropped = sections.remove(idx);
        debug!(
            section = key,
            bytes_dropped = dropped.content.len(),
            "dropped section for budget"
        );
    }
}

/// Cut the element list so the prompt fits `budget`, keeping at least `floor` bytes.
fn truncate_elements(sections: &mut [ParsedSection], budget: usize, floor: usize) {
    let total = total_len(sections);
    if total <= budget {
        return;
    }
    let Some(section) = sections.iter_mut().find(|s| s.key == TRUNCATE_KEY) else {
        return;
    };
    let before_len = section.content.len();
    let allowed = before_len.saturating_sub(total - budget).max(floor);
    if allowed >= before_len {
        return;
    }
    let content = section
        .content
        .strip_suffix(TRUNCATION_MARKER)
        .unwrap_or(&section.content);
    section.content = truncate_lines(content, allowed);
    debug!(
        section = TRUNCATE_KEY,
        before_len,
        after_len = section.content.len(),
        "truncated section for budget"
    );
}

/// Keep whole lines that fit in `allowed` bytes, then append the marker.
///
/// The first line is always kept so the section header survives.
fn truncate_lines(content: &str, allowed: usize) -> String {
    let limit = allowed.saturating_sub(TRUNCATION_MARKER.len() + 1);
    let mut out = String::new();
    for line in content.lines() {
        if !out.is_empty() && out.len() + line.len() + 1 > limit {
            break;
        }
        out.push_str(line);
        out.push('\n');
    }
    out.push_str(TRUNCATION_MARKER);
    out
}

fn join_sections(sections: &[ParsedSection]) -> String {
    sections
        .iter()
        .map(|s| s.content.as_str())
        .collect::<Vec<_>>()
        .join("\n\n")
}

/// Renders model prompts; decision prompts are kept within `budget_bytes`.
#[derive(Debug)]
pub struct PromptBuilder {
    env: Environment<'static>,
    budget_bytes: usize,
}

impl PromptBuilder {
    pub fn new(budget_bytes: usize) -> Self {
        let mut env = Environment::new();
        env.add_template("decision", DECISION_TEMPLATE)
            .expect("decision template should be valid");
        env.add_template("answer", ANSWER_TEMPLATE)
            .expect("answer template should be valid");
        env.add_template("vision", VISION_TEMPLATE)
            .expect("vision template should be valid");
        env.add_template("history", HISTORY_TEMPLATE)
            .expect("history template should be valid");
        Self { env, budget_bytes }
    }

    fn render_history(&self, entries: &str) -> Result<String> {
        let rendered = self
            .env
            .get_template("history")?
            .render(context! { history => entries })?;
        Ok(rendered.trim().to_string())
    }

    /// Shrink `sections` into the budget without ever losing the newest history entry.
    fn fit_budget(&self, sections: &mut Vec<ParsedSection>, history: &Scratchpad) -> Result<()> {
        let budget = self.budget_bytes;
        drop_section(sections, DROP_KEY, budget);
        truncate_elements(sections, budget, budget / ELEMENTS_FLOOR_DIVISOR);

        let over = total_len(sections).saturating_sub(budget);
        if over > 0 {
            let frame = self.render_history("")?.len();
            if let Some(section) = sections.iter_mut().find(|s| s.key == HISTORY_KEY) {
                let before_len = section.content.len();
                let entries_budget = before_len.saturating_sub(over).saturating_sub(frame);
                section.content = self.render_history(&history.render(entries_budget))?;
                debug!(
                    section = HISTORY_KEY,
                    before_len,
                    after_len = section.content.len(),
                    "shortened history for budget"
                );
            }
        }

        truncate_elements(sections, budget, 0);
        Ok(())
    }

    pub fn budget_bytes(&self) -> usize {
        self.budget_bytes
    }

    /// ReAct prompt for one iteration: contract, job, history, visual summary, elements.
    pub fn build_decision(&self, input: &DecisionInputs<'_>) -> Result<String> {
        let tools: Vec<ToolContext> = Tool::ALL
            .iter()
            .map(|tool| ToolContext {
                name: tool.name(),
                description: tool.description(),
            })
            .collect();
        let history = input.history.render(self.budget_bytes / 2);
        let visual_summary = input.snapshot.visual_summary.trim();

        let rendered = self.env.get_template("decision")?.render(context! {
            tools => tools,
            tool_names => Tool::names().join(", "),
            job => JobContext {
                url: &input.job.url,
                title: input.job.title.trim(),
                company: input.job.company.trim(),
            },
            iteration => input.iteration,
            max_iterations => input.max_iterations,
            history => (!history.is_empty()).then_some(history),
            visual_summary => (!visual_summary.is_empty()).then_some(visual_summary),
            elements => input.snapshot.render_elements().trim_end(),
        })?;

        let mut sections = parse_sections(&rendered);
        self.fit_budget(&mut sections, input.history)?;
        Ok(join_sections(&sections))
    }

    /// Prompt for answering one application question from the profile.
    pub fn build_answer(&self, profile: &str, job: Option<&Job>, question: &str) -> Result<String> {
        let rendered = self.env.get_template("answer")?.render(context! {
            profile => profile.trim(),
            job_title => job.map(|j| j.title.trim()).unwrap_or_default(),
            job_company => job.map(|j| j.company.trim()).unwrap_or_default(),
            question => question.trim(),
        })?;
        Ok(rendered)
    }

    /// Vision prompt; `None` asks the fixed page-health questions.
    pub fn build_vision(&self, question: Option<&str>) -> Result<String> {
        let question = question.map(str::trim).filter(|q| !q.is_empty());
        let rendered = self
            .env
            .get_template("vision")?
            .render(context! { question => question })?;
        Ok(rendered)
    }
}
