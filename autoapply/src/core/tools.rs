//! Closed tool catalogue and typed tool calls.
//!
//! The model picks a tool by name from free-form text; lookup fails closed
//! (unknown names are reported back as format violations, never dispatched).

use std::fmt;
use std::path::PathBuf;

use serde::Serialize;

use crate::core::perception::ElementId;

/// Every action the decision model may choose.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum Tool {
    ClickElement,
    TypeText,
    UploadFile,
    ScrollDown,
    ScrollUp,
    GoBack,
    GetProfileData,
    AnswerFromProfile,
    LookAtScreen,
    PauseForHuman,
}

impl Tool {
    pub const ALL: [Tool; 10] = [
        Tool::ClickElement,
        Tool::TypeText,
        Tool::UploadFile,
        Tool::ScrollDown,
        Tool::ScrollUp,
        Tool::GoBack,
        Tool::GetProfileData,
        Tool::AnswerFromProfile,
        Tool::LookAtScreen,
        Tool::PauseForHuman,
    ];

    /// Name the model must use.
    pub fn name(self) -> &'static str {
        match self {
            Tool::ClickElement => "Click_Element",
            Tool::TypeText => "Type_Text",
            Tool::UploadFile => "Upload_File",
            Tool::ScrollDown => "Scroll_Down",
            Tool::ScrollUp => "Scroll_Up",
            Tool::GoBack => "Go_Back",
            Tool::GetProfileData => "Get_Profile_Data",
            Tool::AnswerFromProfile => "Answer_From_Profile",
            Tool::LookAtScreen => "Look_At_Screen",
            Tool::PauseForHuman => "Pause_For_Human",
        }
    }

    pub fn description(self) -> &'static str {
        match self {
            Tool::ClickElement => {
                "Clicks an element. Input: the element ID from CURRENT ELEMENTS, e.g. 12."
            }
            Tool::TypeText => {
                "Clears an input field and types text into it. Input: 'ID|text', e.g. 4|Jane Doe."
            }
            Tool::UploadFile => {
                "Uploads a file into a file input. Input: 'ID' to upload the resume, or 'ID|/path/to/file'."
            }
            Tool::ScrollDown => "Scrolls down by one screen height. Input: anything (ignored).",
            Tool::ScrollUp => "Scrolls up by one screen height. Input: anything (ignored).",
            Tool::GoBack => "Navigates back to the previous page. Input: anything (ignored).",
            Tool::GetProfileData => {
                "Returns one field of the applicant profile. Input: a field name such as name, email, phone, resume, password."
            }
            Tool::AnswerFromProfile => {
                "Answers a free-form application question using the applicant profile. Input: the question text."
            }
            Tool::LookAtScreen => {
                "Asks a vision model a question about the current screenshot. Never trust IDs it mentions. Input: the question."
            }
            Tool::PauseForHuman => {
                "Pauses and asks the human operator for help (CAPTCHA, 2FA code, unknown screen). Input: the question for the human."
            }
        }
    }

    /// Case-insensitive lookup treating `_`, `-` and spaces as equivalent.
    pub fn from_name(name: &str) -> Option<Tool> {
        let wanted = canonical_name(name);
        if wanted.is_empty() {
            return None;
        }
        Tool::ALL
            .into_iter()
            .find(|tool| canonical_name(tool.name()) == wanted)
    }

    pub fn names() -> Vec<&'static str> {
        Tool::ALL.iter().map(|t| t.name()).collect()
    }
}

impl fmt::Display for Tool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

fn canonical_name(name: &str) -> String {
    name.trim()
        .trim_matches(|c: char| c == '`' || c == '"' || c == '\'' || c == '*' || c == '[' || c == ']')
        .chars()
        .filter(|c| !matches!(c, '_' | '-' | ' '))
        .flat_map(char::to_lowercase)
        .collect()
}

/// A validated tool invocation with typed arguments.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "tool", rename_all = "snake_case")]
pub enum ToolCall {
    Click { id: ElementId },
    TypeText { id: ElementId, text: String },
    UploadFile { id: ElementId, path: Option<PathBuf> },
    ScrollDown,
    ScrollUp,
    GoBack,
    GetProfileData { field: String },
    AnswerFromProfile { question: String },
    LookAtScreen { question: String },
    PauseForHuman { prompt: String },
}

impl ToolCall {
    /// Validate raw `Action Input` text for `tool`.
    ///
    /// Errors describe the expected input shape so the model can correct itself.
    pub fn parse(tool: Tool, input: &str) -> Result<ToolCall, String> {
        let input = input.trim();
        match tool {
            Tool::ClickElement => Ok(ToolCall::Click {
                id: parse_element_id(input)?,
            }),
            Tool::TypeText => {
                let (id, text) = input.split_once('|').ok_or_else(|| {
                    format!("Type_Text input must be 'ID|text' but was '{input}'")
                })?;
                Ok(ToolCall::TypeText {
                    id: parse_element_id(id)?,
                    text: text.to_string(),
                })
            }
            Tool::UploadFile => {
                let (id, path) = match input.split_once('|') {
                    Some((id, path)) => (id, Some(path.trim())),
                    None => (input, None),
                };
                Ok(ToolCall::UploadFile {
                    id: parse_element_id(id)?,
                    path: path.filter(|p| !p.is_empty()).map(PathBuf::from),
                })
            }
            Tool::ScrollDown => Ok(ToolCall::ScrollDown),
            Tool::ScrollUp => Ok(ToolCall::ScrollUp),
            Tool::GoBack => Ok(ToolCall::GoBack),
            Tool::GetProfileData => {
                let field = input.trim_matches(|c: char| c == '"' || c == '\'').trim();
                if field.is_empty() {
                    return Err("Get_Profile_Data needs a field name, e.g. email".to_string());
                }
                Ok(ToolCall::GetProfileData {
                    field: field.to_ascii_lowercase(),
                })
            }
            Tool::AnswerFromProfile => Ok(ToolCall::AnswerFromProfile {
                question: non_empty(tool, input)?,
            }),
            Tool::LookAtScreen => Ok(ToolCall::LookAtScreen {
                question: non_empty(tool, input)?,
            }),
            Tool::PauseForHuman => Ok(ToolCall::PauseForHuman {
                prompt: non_empty(tool, input)?,
            }),
        }
    }

    pub fn tool(&self) -> Tool {
        match self {
            ToolCall::Click { .. } => Tool::ClickElement,
            ToolCall::TypeText { .. } => Tool::TypeText,
            ToolCall::UploadFile { .. } => Tool::UploadFile,
            ToolCall::ScrollDown => Tool::ScrollDown,
            ToolCall::ScrollUp => Tool::ScrollUp,
            ToolCall::GoBack => Tool::GoBack,
            ToolCall::GetProfileData { .. } => Tool::GetProfileData,
            ToolCall::AnswerFromProfile { .. } => Tool::AnswerFromProfile,
            ToolCall::LookAtScreen { .. } => Tool::LookAtScreen,
            ToolCall::PauseForHuman { .. } => Tool::PauseForHuman,
        }
    }

    /// Canonical input text, as recorded in history.
    pub fn input_text(&self) -> String {
        match self {
            ToolCall::Click { id } => id.to_string(),
            ToolCall::TypeText { id, text } => format!("{id}|{text}"),
            ToolCall::UploadFile { id, path: None } => id.to_string(),
            ToolCall::UploadFile {
                id,
                path: Some(path),
            } => format!("{id}|{}", path.display()),
            ToolCall::ScrollDown | ToolCall::ScrollUp | ToolCall::GoBack => String::new(),
            ToolCall::GetProfileData { field } => field.clone(),
            ToolCall::AnswerFromProfile { question } | ToolCall::LookAtScreen { question } => {
                question.clone()
            }
            ToolCall::PauseForHuman { prompt } => prompt.clone(),
        }
    }
}

/// Accepts `12`, `[12]`, `#12`, `id=12`, `ID: 12`.
pub fn parse_element_id(input: &str) -> Result<ElementId, String> {
    let mut s = input
        .trim()
        .trim_matches(|c: char| c == '"' || c == '\'' || c == '`')
        .trim();
    let lower = s.to_ascii_lowercase();
    for prefix in ["id=", "id:", "id "] {
        if lower.starts_with(prefix) {
            s = s[prefix.len()..].trim();
            break;
        }
    }
    let s = s
        .trim_start_matches('#')
        .trim_start_matches('[')
        .trim_end_matches(']')
        .trim();
    s.parse::<ElementId>()
        .map_err(|_| format!("expected a numeric element ID from CURRENT ELEMENTS but got '{input}'"))
}

fn non_empty(tool: Tool, input: &str) -> Result<String, String> {
    if input.is_empty() {
        return Err(format!("{} needs a non-empty input", tool.name()));
    }
    Ok(input.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_is_forgiving_but_closed() {
        assert_eq!(Tool::from_name("Click_Element"), Some(Tool::ClickElement));
        assert_eq!(Tool::from_name(" click-element "), Some(Tool::ClickElement));
        assert_eq!(Tool::from_name("`Type_Text`"), Some(Tool::TypeText));
        assert_eq!(Tool::from_name("pause for human"), Some(Tool::PauseForHuman));
        assert_eq!(Tool::from_name("Submit_Form"), None);
        assert_eq!(Tool::from_name(""), None);
    }

    #[test]
    fn names_are_unique() {
        let mut names = Tool::names();
        names.sort_unstable();
        names.dedup();
        assert_eq!(names.len(), Tool::ALL.len());
    }

    #[test]
    fn element_ids_accept_common_spellings() {
        for raw in ["12", "[12]", "#12", "id=12", "ID: 12", "'12'"] {
            assert_eq!(parse_element_id(raw), Ok(12), "{raw}");
        }
        assert!(parse_element_id("//button[@id='x']").is_err());
        assert!(parse_element_id("").is_err());
    }

    #[test]
    fn type_text_requires_separator() {
        assert_eq!(
            ToolCall::parse(Tool::TypeText, "4|Jane | Doe"),
            Ok(ToolCall::TypeText {
                id: 4,
                text: "Jane | Doe".to_string()
            })
        );
        let err = ToolCall::parse(Tool::TypeText, "4 Jane").unwrap_err();
        assert!(err.contains("ID|text"));
    }

    #[test]
    fn upload_path_is_optional() {
        assert_eq!(
            ToolCall::parse(Tool::UploadFile, "3"),
            Ok(ToolCall::UploadFile { id: 3, path: None })
        );
        assert_eq!(
            ToolCall::parse(Tool::UploadFile, "3|/tmp/cv.pdf"),
            Ok(ToolCall::UploadFile {
                id: 3,
                path: Some(PathBuf::from("/tmp/cv.pdf"))
            })
        );
    }

    #[test]
    fn empty_questions_are_rejected() {
        assert!(ToolCall::parse(Tool::PauseForHuman, "  ").is_err());
        assert!(ToolCall::parse(Tool::GetProfileData, "\"\"").is_err());
        assert_eq!(
            ToolCall::parse(Tool::GetProfileData, "\"Email\""),
            Ok(ToolCall::GetProfileData {
                field: "email".to_string()
            })
        );
    }

    #[test]
    fn input_text_round_trips_for_history() {
        let call = ToolCall::parse(Tool::TypeText, "4|hello").expect("parse");
        assert_eq!(call.tool(), Tool::TypeText);
        assert_eq!(call.input_text(), "4|hello");
        assert_eq!(ToolCall::ScrollDown.input_text(), "");
    }
}
