//! Perception snapshot model: filtering raw page candidates into a bounded,
//! ID-addressable element map.
//!
//! Element IDs are dense integers assigned per snapshot. The page-side marker
//! for an element embeds the snapshot generation, so a handle issued by an
//! older snapshot can never resolve to an element tagged by a newer one.

use std::collections::BTreeMap;
use std::fmt::Write as _;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Page attribute carrying `<generation>:<ordinal>` for every enumerated candidate.
pub const CANDIDATE_ATTR: &str = "data-autoapply-cand";

/// Snapshot-scoped element identifier shown to the model.
pub type ElementId = u32;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
pub struct BoundingBox {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

impl BoundingBox {
    fn has_area(&self) -> bool {
        self.width > 0.0 && self.height > 0.0
    }
}

/// One interactive element as reported by the enumeration script.
///
/// Visibility is decided in Rust from these raw fields, never trusted from
/// the page.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct RawCandidate {
    /// Position in the script's candidate list; part of the page marker.
    pub ordinal: u32,
    pub tag: String,
    pub input_type: Option<String>,
    /// Value of the inline `style` attribute.
    pub inline_style: String,
    /// Computed `display`.
    pub display: String,
    /// Computed `visibility`.
    pub visibility: String,
    /// The `hidden` attribute.
    pub hidden_attr: bool,
    pub text: String,
    pub label: String,
    pub name: Option<String>,
    pub placeholder: Option<String>,
    pub value: Option<String>,
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

impl RawCandidate {
    fn bounding_box(&self) -> BoundingBox {
        BoundingBox {
            x: self.x,
            y: self.y,
            width: self.width,
            height: self.height,
        }
    }

    fn is_file_input(&self) -> bool {
        self.tag.eq_ignore_ascii_case("input")
            && self
                .input_type
                .as_deref()
                .is_some_and(|t| t.eq_ignore_ascii_case("file"))
    }
}

/// Whether a candidate may appear in a snapshot.
///
/// Excludes `type=hidden`, inline `display:none` / `visibility:hidden`, the
/// computed equivalents, the `hidden` attribute, and zero-area boxes (file
/// inputs are exempt from the area rule since they are routinely restyled).
pub fn is_visible(candidate: &RawCandidate) -> bool {
    if candidate
        .input_type
        .as_deref()
        .is_some_and(|t| t.trim().eq_ignore_ascii_case("hidden"))
    {
        return false;
    }
    let style: String = candidate
        .inline_style
        .chars()
        .filter(|c| !c.is_whitespace())
        .collect::<String>()
        .to_ascii_lowercase();
    if style.contains("display:none") || style.contains("visibility:hidden") {
        return false;
    }
    let display = candidate.display.trim();
    let visibility = candidate.visibility.trim();
    if display.eq_ignore_ascii_case("none")
        || visibility.eq_ignore_ascii_case("hidden")
        || visibility.eq_ignore_ascii_case("collapse")
    {
        return false;
    }
    if candidate.hidden_attr {
        return false;
    }
    if !candidate.bounding_box().has_area() && !candidate.is_file_input() {
        return false;
    }
    true
}

/// Collapse whitespace and cap at `limit` characters, marking truncation with `…`.
pub fn normalize_text(text: &str, limit: usize) -> String {
    let collapsed = text.split_whitespace().collect::<Vec<_>>().join(" ");
    if collapsed.chars().count() <= limit {
        return collapsed;
    }
    let mut out: String = collapsed.chars().take(limit).collect();
    out.push('…');
    out
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ElementDescriptor {
    pub tag: String,
    pub visible_text: String,
    pub accessible_label: String,
    pub bounding_box: BoundingBox,
    pub input_type: Option<String>,
    pub name: Option<String>,
    pub placeholder: Option<String>,
    pub value: Option<String>,
}

impl ElementDescriptor {
    pub fn is_file_input(&self) -> bool {
        self.tag == "input"
            && self
                .input_type
                .as_deref()
                .is_some_and(|t| t.eq_ignore_ascii_case("file"))
    }

    pub fn is_text_entry(&self) -> bool {
        match self.tag.as_str() {
            "textarea" | "select" => true,
            "input" => !matches!(
                self.input_type
                    .as_deref()
                    .map(str::to_ascii_lowercase)
                    .as_deref(),
                Some("button" | "submit" | "reset" | "checkbox" | "radio" | "file" | "image")
            ),
            _ => false,
        }
    }
}

/// Page-side reference to an element, scoped to one snapshot generation.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ElementHandle {
    pub generation: u64,
    pub ordinal: u32,
}

impl ElementHandle {
    pub fn marker(&self) -> String {
        format!("{}:{}", self.generation, self.ordinal)
    }

    /// CSS selector matching exactly this element, or nothing once the page moved on.
    pub fn selector(&self) -> String {
        format!("[{CANDIDATE_ATTR}=\"{}\"]", self.marker())
    }
}

/// Limits applied while building a snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SnapshotLimits {
    pub max_elements: usize,
    pub text_limit: usize,
}

impl Default for SnapshotLimits {
    fn default() -> Self {
        Self {
            max_elements: 150,
            text_limit: 80,
        }
    }
}

/// Bounded, addressable view of the page for one loop iteration.
#[derive(Debug, Clone, Serialize)]
pub struct PerceptionSnapshot {
    pub generation: u64,
    pub elements: BTreeMap<ElementId, ElementDescriptor>,
    pub visual_summary: String,
    pub captured_at: DateTime<Utc>,
    /// Visible elements dropped by `max_elements`.
    pub omitted: usize,
    #[serde(skip)]
    handles: BTreeMap<ElementId, ElementHandle>,
}

impl PerceptionSnapshot {
    /// Filter candidates and assign dense IDs (from 1) in document order.
    pub fn from_candidates(
        generation: u64,
        candidates: Vec<RawCandidate>,
        limits: SnapshotLimits,
        captured_at: DateTime<Utc>,
    ) -> Self {
        let mut elements = BTreeMap::new();
        let mut handles = BTreeMap::new();
        let mut omitted = 0usize;
        let mut next_id: ElementId = 1;

        for candidate in candidates.into_iter().filter(is_visible) {
            if elements.len() >= limits.max_elements {
                omitted += 1;
                continue;
            }
            let descriptor = ElementDescriptor {
                tag: candidate.tag.to_ascii_lowercase(),
                visible_text: normalize_text(&candidate.text, limits.text_limit),
                accessible_label: normalize_text(&candidate.label, limits.text_limit),
                bounding_box: candidate.bounding_box(),
                input_type: candidate.input_type.clone().map(|t| t.to_ascii_lowercase()),
                name: candidate.name.clone().filter(|s| !s.is_empty()),
                placeholder: candidate
                    .placeholder
                    .as_deref()
                    .map(|p| normalize_text(p, limits.text_limit))
                    .filter(|s| !s.is_empty()),
                value: candidate
                    .value
                    .as_deref()
                    .map(|v| normalize_text(v, limits.text_limit)),
            };
            handles.insert(
                next_id,
                ElementHandle {
                    generation,
                    ordinal: candidate.ordinal,
                },
            );
            elements.insert(next_id, descriptor);
            next_id += 1;
        }

        Self {
            generation,
            elements,
            visual_summary: String::new(),
            captured_at,
            omitted,
            handles,
        }
    }

    pub fn with_visual_summary(mut self, summary: impl Into<String>) -> Self {
        self.visual_summary = summary.into();
        self
    }

    pub fn element(&self, id: ElementId) -> Option<&ElementDescriptor> {
        self.elements.get(&id)
    }

    /// Resolve an ID against this snapshot only.
    pub fn resolve(&self, id: ElementId) -> Option<(&ElementDescriptor, ElementHandle)> {
        let descriptor = self.elements.get(&id)?;
        let handle = self.handles.get(&id)?.clone();
        Some((descriptor, handle))
    }

    pub fn len(&self) -> usize {
        self.elements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }

    /// One line per element, the structural list shown to the model.
    pub fn render_elements(&self) -> String {
        if self.elements.is_empty() {
            return "(no interactive elements visible)".to_string();
        }
        let mut buf = String::new();
        for (id, el) in &self.elements {
            let _ = write!(buf, "[{id}] <{}", el.tag);
            if let Some(t) = &el.input_type {
                let _ = write!(buf, " type=\"{t}\"");
            }
            if let Some(n) = &el.name {
                let _ = write!(buf, " name=\"{n}\"");
            }
            if let Some(p) = &el.placeholder {
                let _ = write!(buf, " placeholder=\"{p}\"");
            }
            buf.push('>');
            if !el.visible_text.is_empty() {
                let _ = write!(buf, " \"{}\"", el.visible_text);
            }
            if !el.accessible_label.is_empty() && el.accessible_label != el.visible_text {
                let _ = write!(buf, " label=\"{}\"", el.accessible_label);
            }
            if let Some(v) = el.value.as_deref().filter(|v| !v.is_empty()) {
                let _ = write!(buf, " value=\"{v}\"");
            }
            let bb = &el.bounding_box;
            let _ = writeln!(
                buf,
                " @({:.0},{:.0} {:.0}x{:.0})",
                bb.x, bb.y, bb.width, bb.height
            );
        }
        if self.omitted > 0 {
            let _ = writeln!(
                buf,
                "({} more elements not listed; scroll to reach them)",
                self.omitted
            );
        }
        buf.trim_end().to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(ordinal: u32, tag: &str, text: &str) -> RawCandidate {
        RawCandidate {
            ordinal,
            tag: tag.to_string(),
            text: text.to_string(),
            display: "block".to_string(),
            visibility: "visible".to_string(),
            width: 100.0,
            height: 20.0,
            ..RawCandidate::default()
        }
    }

    fn snapshot(candidates: Vec<RawCandidate>) -> PerceptionSnapshot {
        PerceptionSnapshot::from_candidates(7, candidates, SnapshotLimits::default(), Utc::now())
    }

    #[test]
    fn hidden_inputs_are_never_included() {
        let mut hidden = candidate(0, "input", "");
        hidden.input_type = Some("HIDDEN".to_string());
        let snap = snapshot(vec![hidden, candidate(1, "button", "Apply")]);
        assert_eq!(snap.len(), 1);
        assert_eq!(snap.element(1).map(|e| e.tag.as_str()), Some("button"));
    }

    #[test]
    fn inline_hidden_styles_are_excluded_regardless_of_spacing() {
        let mut none = candidate(0, "a", "gone");
        none.inline_style = "color: red; DISPLAY : none".to_string();
        let mut invisible = candidate(1, "a", "ghost");
        invisible.inline_style = "visibility:hidden".to_string();
        let snap = snapshot(vec![none, invisible, candidate(2, "a", "here")]);
        let texts: Vec<&str> = snap
            .elements
            .values()
            .map(|e| e.visible_text.as_str())
            .collect();
        assert_eq!(texts, vec!["here"]);
    }

    #[test]
    fn computed_invisibility_and_zero_area_are_excluded() {
        let mut collapsed = candidate(0, "button", "x");
        collapsed.visibility = "collapse".to_string();
        let mut flat = candidate(1, "button", "y");
        flat.width = 0.0;
        flat.height = 0.0;
        let mut file = candidate(2, "input", "");
        file.input_type = Some("file".to_string());
        file.width = 0.0;
        file.height = 0.0;
        let snap = snapshot(vec![collapsed, flat, file]);
        assert_eq!(snap.len(), 1);
        assert!(snap.element(1).is_some_and(|e| e.is_file_input()));
    }

    #[test]
    fn ids_are_dense_and_handles_carry_generation() {
        let mut hidden = candidate(1, "input", "");
        hidden.hidden_attr = true;
        let snap = snapshot(vec![
            candidate(0, "a", "first"),
            hidden,
            candidate(2, "a", "third"),
        ]);
        let (_, handle) = snap.resolve(2).expect("id 2");
        assert_eq!(handle.ordinal, 2);
        assert_eq!(handle.generation, 7);
        assert_eq!(handle.selector(), "[data-autoapply-cand=\"7:2\"]");
        assert!(snap.resolve(3).is_none());
    }

    #[test]
    fn max_elements_caps_and_counts_omitted() {
        let candidates = (0..5).map(|i| candidate(i, "a", "link")).collect();
        let snap = PerceptionSnapshot::from_candidates(
            1,
            candidates,
            SnapshotLimits {
                max_elements: 2,
                text_limit: 80,
            },
            Utc::now(),
        );
        assert_eq!(snap.len(), 2);
        assert_eq!(snap.omitted, 3);
        assert!(snap.render_elements().contains("3 more elements"));
    }

    #[test]
    fn text_is_collapsed_and_truncated() {
        assert_eq!(normalize_text("  a \n  b ", 10), "a b");
        assert_eq!(normalize_text("abcdefgh", 3), "abc…");
    }

    #[test]
    fn render_lists_attributes_for_disambiguation() {
        let mut email = candidate(0, "INPUT", "");
        email.input_type = Some("email".to_string());
        email.name = Some("email".to_string());
        email.label = "Email address".to_string();
        let snap = snapshot(vec![email]);
        let rendered = snap.render_elements();
        assert!(rendered.starts_with("[1] <input type=\"email\" name=\"email\">"));
        assert!(rendered.contains("label=\"Email address\""));
        assert!(snap.element(1).is_some_and(|e| e.is_text_entry()));
    }

    #[test]
    fn empty_snapshot_renders_placeholder() {
        let snap = snapshot(Vec::new());
        assert!(snap.is_empty());
        assert_eq!(snap.render_elements(), "(no interactive elements visible)");
    }
}
