//! Append-only action history for one job attempt.

use std::fmt::Write as _;

use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HistoryEntry {
    /// The model's reasoning for the action; empty for synthetic entries.
    pub thought: String,
    pub action: String,
    pub input: String,
    pub observation: String,
}

impl HistoryEntry {
    pub fn new(
        action: impl Into<String>,
        input: impl Into<String>,
        observation: impl Into<String>,
    ) -> Self {
        Self {
            thought: String::new(),
            action: action.into(),
            input: input.into(),
            observation: observation.into(),
        }
    }

    pub fn with_thought(mut self, thought: impl Into<String>) -> Self {
        self.thought = thought.into();
        self
    }

    fn render(&self) -> String {
        let mut buf = String::new();
        let thought = self.thought.trim();
        if !thought.is_empty() {
            let _ = writeln!(buf, "Thought: {thought}");
        }
        let _ = writeln!(buf, "Action: {}", self.action);
        let _ = writeln!(buf, "Action Input: {}", self.input);
        let _ = write!(buf, "Observation: {}", self.observation.trim());
        buf
    }
}

/// The model's running context. Entries are never edited or removed.
#[derive(Debug, Clone, Default)]
pub struct Scratchpad {
    entries: Vec<HistoryEntry>,
}

impl Scratchpad {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, entry: HistoryEntry) {
        self.entries.push(entry);
    }

    pub fn entries(&self) -> &[HistoryEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn last(&self) -> Option<&HistoryEntry> {
        self.entries.last()
    }

    /// Render newest-last within `budget_bytes`, eliding the oldest entries first.
    ///
    /// The newest entry is always kept, even if it alone exceeds the budget.
    pub fn render(&self, budget_bytes: usize) -> String {
        if self.entries.is_empty() {
            return String::new();
        }
        let rendered: Vec<String> = self.entries.iter().map(HistoryEntry::render).collect();

        let mut kept = 0usize;
        let mut used = 0usize;
        for block in rendered.iter().rev() {
            let cost = block.len() + 2;
            if kept > 0 && used + cost > budget_bytes {
                break;
            }
            used += cost;
            kept += 1;
        }

        let elided = rendered.len() - kept;
        let mut out = String::new();
        if elided > 0 {
            let _ = writeln!(out, "[{elided} earlier steps omitted]\n");
        }
        out.push_str(&rendered[elided..].join("\n\n"));
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pad(n: usize) -> Scratchpad {
        let mut pad = Scratchpad::new();
        for i in 0..n {
            pad.push(HistoryEntry::new(
                "Click_Element",
                i.to_string(),
                format!("clicked {i}"),
            ));
        }
        pad
    }

    #[test]
    fn renders_in_order_when_within_budget() {
        let rendered = pad(2).render(10_000);
        let first = rendered.find("clicked 0").expect("first");
        let second = rendered.find("clicked 1").expect("second");
        assert!(first < second);
        assert!(!rendered.contains("omitted"));
    }

    #[test]
    fn elides_oldest_entries_over_budget() {
        let pad = pad(10);
        let one = pad.entries()[0].render().len() + 2;
        let rendered = pad.render(one * 3);
        assert!(rendered.starts_with("[7 earlier steps omitted]"));
        assert!(rendered.contains("clicked 9"));
        assert!(!rendered.contains("clicked 6"));
    }

    #[test]
    fn newest_entry_survives_tiny_budget() {
        let rendered = pad(3).render(1);
        assert!(rendered.contains("clicked 2"));
        assert!(rendered.starts_with("[2 earlier steps omitted]"));
    }

    #[test]
    fn thought_is_rendered_before_the_action() {
        let mut pad = Scratchpad::new();
        pad.push(
            HistoryEntry::new("Click_Element", "3", "Clicked element 3.")
                .with_thought("the Apply button opens the form"),
        );
        pad.push(HistoryEntry::new("(invalid format)", "", "No Action line."));
        let rendered = pad.render(10_000);
        assert!(rendered.starts_with(
            "Thought: the Apply button opens the form\nAction: Click_Element\nAction Input: 3\n"
        ));
        assert_eq!(rendered.matches("Thought:").count(), 1);
    }

    #[test]
    fn empty_history_renders_nothing() {
        assert_eq!(Scratchpad::new().render(100), "");
    }
}
