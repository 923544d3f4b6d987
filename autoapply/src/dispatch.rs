//! Tool registry: executes one [`ToolCall`] and describes what happened.
//!
//! Every failure that still leaves a usable session becomes observation text
//! with a hint for the next decision. Only session-level browser errors
//! escape, as [`SessionCrash`].

use std::path::PathBuf;

use thiserror::Error;
use tracing::{debug, instrument, warn};

use crate::core::perception::{ElementDescriptor, ElementHandle, ElementId, PerceptionSnapshot};
use crate::core::tools::ToolCall;
use crate::core::types::Job;
use crate::io::browser::{BrowserDriver, BrowserError, ScrollDirection};
use crate::io::model::{TextModel, VisionModel};
use crate::io::profile::Profile;
use crate::io::prompt::PromptBuilder;
use crate::perceive::{PerceptionBuilder, ScreenError};

/// The browser session is unusable; the job ends and the session is replaced.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{0}")]
pub struct SessionCrash(pub BrowserError);

type Observation = Result<String, SessionCrash>;

/// Everything tools may read besides the browser session.
pub struct ToolRegistry<'a, M: ?Sized> {
    pub profile: &'a Profile,
    pub model: &'a M,
    pub prompts: &'a PromptBuilder,
    pub answer_model: &'a str,
    pub perception: &'a PerceptionBuilder,
}

impl<M> ToolRegistry<'_, M>
where
    M: TextModel + VisionModel + ?Sized,
{
    /// Run `call` against the session and the snapshot the decision was made on.
    ///
    /// `Pause_For_Human` is routed to the intervention gate by the caller and
    /// only reaches this point when no gate is wired up.
    #[instrument(skip_all, fields(tool = %call.tool(), generation = snapshot.generation))]
    pub fn dispatch<D>(
        &self,
        driver: &mut D,
        snapshot: &PerceptionSnapshot,
        job: &Job,
        call: &ToolCall,
    ) -> Observation
    where
        D: BrowserDriver + ?Sized,
    {
        let observation = match call {
            ToolCall::Click { id } => self.click(driver, snapshot, *id),
            ToolCall::TypeText { id, text } => self.type_text(driver, snapshot, *id, text),
            ToolCall::UploadFile { id, path } => {
                self.upload(driver, snapshot, *id, path.as_ref())
            }
            ToolCall::ScrollDown => scroll(driver, ScrollDirection::Down),
            ToolCall::ScrollUp => scroll(driver, ScrollDirection::Up),
            ToolCall::GoBack => match driver.back() {
                Ok(()) => Ok("Navigated back to the previous page.".to_string()),
                Err(err) => failure("Go back", err),
            },
            ToolCall::GetProfileData { field } => Ok(self.profile.get(field)),
            ToolCall::AnswerFromProfile { question } => Ok(self.answer(job, question)),
            ToolCall::LookAtScreen { question } => self.look(driver, question),
            ToolCall::PauseForHuman { .. } => Ok(
                "No human operator is available right now. Continue without help or try again later."
                    .to_string(),
            ),
        }?;
        debug!(observation = %observation, "tool finished");
        Ok(observation)
    }

    fn click<D: BrowserDriver + ?Sized>(
        &self,
        driver: &mut D,
        snapshot: &PerceptionSnapshot,
        id: ElementId,
    ) -> Observation {
        let (descriptor, handle) = match resolve(snapshot, id) {
            Ok(found) => found,
            Err(observation) => return Ok(observation),
        };
        let what = describe(id, descriptor);
        match driver.click(&handle) {
            Ok(()) => Ok(format!("Clicked {what}.")),
            Err(BrowserError::NotInteractable(reason)) => {
                debug!(%reason, "native click rejected, clicking by script");
                match driver.script_click(&handle) {
                    Ok(()) => Ok(format!(
                        "Clicked {what} by script because a normal click was rejected ({reason})."
                    )),
                    Err(err) => failure(&format!("Click on {what}"), err),
                }
            }
            Err(err) => failure(&format!("Click on {what}"), err),
        }
    }

    fn type_text<D: BrowserDriver + ?Sized>(
        &self,
        driver: &mut D,
        snapshot: &PerceptionSnapshot,
        id: ElementId,
        text: &str,
    ) -> Observation {
        let (descriptor, handle) = match resolve(snapshot, id) {
            Ok(found) => found,
            Err(observation) => return Ok(observation),
        };
        let what = describe(id, descriptor);
        if !descriptor.is_text_entry() {
            return Ok(format!(
                "Did not type: {what} is not a text field. Pick an input, textarea or select element."
            ));
        }

        match driver.click(&handle) {
            Ok(()) | Err(BrowserError::NotInteractable(_)) => {}
            Err(err) => return failure(&format!("Focusing {what}"), err),
        }
        match driver.type_text(&handle, text) {
            Ok(()) => Ok(format!("Typed \"{text}\" into {what}.")),
            Err(BrowserError::NotInteractable(reason)) => {
                debug!(%reason, "typing rejected, setting value by script");
                match driver.script_set_value(&handle, text) {
                    Ok(()) => Ok(format!(
                        "Set {what} to \"{text}\" by script because typing was rejected ({reason})."
                    )),
                    Err(err) => failure(&format!("Typing into {what}"), err),
                }
            }
            Err(err) => failure(&format!("Typing into {what}"), err),
        }
    }

    fn upload<D: BrowserDriver + ?Sized>(
        &self,
        driver: &mut D,
        snapshot: &PerceptionSnapshot,
        id: ElementId,
        path: Option<&PathBuf>,
    ) -> Observation {
        let (descriptor, handle) = match resolve(snapshot, id) {
            Ok(found) => found,
            Err(observation) => return Ok(observation),
        };
        let what = describe(id, descriptor);
        if !descriptor.is_file_input() {
            return Ok(format!(
                "Did not upload: {what} is not a file input. Look for an <input type=\"file\"> element."
            ));
        }
        let Some(path) = path.or(self.profile.resume_path.as_ref()) else {
            return Ok(
                "Did not upload: no file path was given and the profile has no resume_path."
                    .to_string(),
            );
        };
        if !path.is_file() {
            warn!(path = %path.display(), "upload file missing");
            return Ok(format!("Did not upload: file not found: {}", path.display()));
        }
        match driver.upload_file(&handle, path) {
            Ok(()) => Ok(format!("Uploaded {} into {what}.", path.display())),
            Err(err) => failure(&format!("Upload into {what}"), err),
        }
    }

    fn answer(&self, job: &Job, question: &str) -> String {
        let prompt = match self
            .prompts
            .build_answer(&self.profile.render_for_prompt(), Some(job), question)
        {
            Ok(prompt) => prompt,
            Err(err) => return format!("Could not prepare an answer: {err:#}"),
        };
        match self.model.generate(self.answer_model, &prompt) {
            Ok(answer) if !answer.trim().is_empty() => answer.trim().to_string(),
            Ok(_) => "The answer model returned nothing. Use Get_Profile_Data or answer briefly yourself."
                .to_string(),
            Err(err) => format!("Could not generate an answer: {err}"),
        }
    }

    fn look<D: BrowserDriver + ?Sized>(&self, driver: &mut D, question: &str) -> Observation {
        let prompt = match self.prompts.build_vision(Some(question)) {
            Ok(prompt) => prompt,
            Err(err) => return Ok(format!("Could not prepare the vision request: {err:#}")),
        };
        match self.perception.look(driver, self.model, &prompt) {
            Ok(text) => Ok(text.trim().to_string()),
            Err(ScreenError::Browser(err)) if err.is_session_fatal() => Err(SessionCrash(err)),
            Err(err) => Ok(format!("Could not look at the screen: {err}")),
        }
    }
}

fn resolve(
    snapshot: &PerceptionSnapshot,
    id: ElementId,
) -> Result<(&ElementDescriptor, ElementHandle), String> {
    snapshot.resolve(id).ok_or_else(|| {
        let valid = if snapshot.is_empty() {
            "the current element list is empty".to_string()
        } else {
            format!("valid IDs are 1 to {}", snapshot.len())
        };
        format!(
            "Element ID {id} does not exist in the current element list ({valid}). \
             No action was taken; use an ID from CURRENT ELEMENTS."
        )
    })
}

fn describe(id: ElementId, element: &ElementDescriptor) -> String {
    let name = [&element.visible_text, &element.accessible_label]
        .into_iter()
        .find(|s| !s.is_empty())
        .cloned()
        .or_else(|| element.placeholder.clone())
        .or_else(|| element.name.clone());
    match name {
        Some(name) => format!("element {id} (<{}> \"{name}\")", element.tag),
        None => format!("element {id} (<{}>)", element.tag),
    }
}

fn scroll<D: BrowserDriver + ?Sized>(driver: &mut D, direction: ScrollDirection) -> Observation {
    let label = match direction {
        ScrollDirection::Down => "down",
        ScrollDirection::Up => "up",
    };
    match driver.scroll(direction) {
        Ok(()) => Ok(format!("Scrolled {label} by one screen.")),
        Err(err) => failure(&format!("Scroll {label}"), err),
    }
}

fn failure(action: &str, err: BrowserError) -> Observation {
    if err.is_session_fatal() {
        return Err(SessionCrash(err));
    }
    Ok(format!("{action} failed: {err}. {}", err.hint()))
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;
    use crate::core::perception::SnapshotLimits;
    use crate::core::types::JobStatus;
    use crate::io::model::ModelError;
    use crate::test_support::{FakeBrowser, FakeOp, ScriptedModel, candidate, input};

    struct Fixture {
        browser: FakeBrowser,
        driver: FakeBrowser,
        model: ScriptedModel,
        profile: Profile,
        prompts: PromptBuilder,
        perception: PerceptionBuilder,
        snapshot: PerceptionSnapshot,
    }

    impl Fixture {
        fn new(model: ScriptedModel) -> Self {
            let browser = FakeBrowser::new();
            browser.set_page(vec![
                candidate("button", "Apply"),
                input("email", "Email"),
                input("file", "Resume"),
            ]);
            let mut driver = browser.clone();
            let mut perception = PerceptionBuilder::new(SnapshotLimits::default(), None);
            let snapshot = perception.capture(&mut driver, &model).expect("capture");
            let mut profile = Profile::default();
            profile.name = "Jane Doe".to_string();
            Self {
                browser,
                driver,
                model,
                profile,
                prompts: PromptBuilder::new(24_000),
                perception,
                snapshot,
            }
        }

        fn run(&mut self, call: ToolCall) -> Observation {
            let registry = ToolRegistry {
                profile: &self.profile,
                model: &self.model,
                prompts: &self.prompts,
                answer_model: "answer-model",
                perception: &self.perception,
            };
            registry.dispatch(&mut self.driver, &self.snapshot, &job(), &call)
        }
    }

    fn job() -> Job {
        Job {
            id: 1,
            url: "https://ex.com/job/1".to_string(),
            title: "Engineer".to_string(),
            company: "Acme".to_string(),
            status: JobStatus::InProgress,
            log: String::new(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn unknown_id_is_reported_without_acting() {
        let mut fx = Fixture::new(ScriptedModel::new());
        let observation = fx.run(ToolCall::Click { id: 42 }).expect("observation");
        assert!(observation.contains("Element ID 42 does not exist"), "{observation}");
        assert!(observation.contains("1 to 3"));
        assert_eq!(fx.browser.count_calls("click"), 0);
    }

    #[test]
    fn click_uses_the_snapshot_handle() {
        let mut fx = Fixture::new(ScriptedModel::new());
        let generation = fx.snapshot.generation;
        let observation = fx.run(ToolCall::Click { id: 1 }).expect("observation");
        assert_eq!(observation, "Clicked element 1 (<button> \"Apply\").");
        assert!(fx.browser.calls().contains(&format!("click {generation}:0")));
    }

    #[test]
    fn id_from_an_older_snapshot_is_not_clicked() {
        let mut fx = Fixture::new(ScriptedModel::new());
        let fresh = fx
            .perception
            .capture(&mut fx.driver, &fx.model)
            .expect("second capture");
        assert!(fresh.generation > fx.snapshot.generation);

        let observation = fx.run(ToolCall::Click { id: 1 }).expect("observation");
        assert!(
            observation.starts_with("Click on element 1 (<button> \"Apply\") failed"),
            "{observation}"
        );
        assert!(observation.contains("no longer attached"), "{observation}");
        assert!(fx.browser.landed_clicks().is_empty());
        assert_eq!(fx.browser.count_calls("script [data-autoapply-cand"), 0);
    }

    #[test]
    fn obscured_click_explains_the_overlay() {
        let mut fx = Fixture::new(ScriptedModel::new());
        fx.browser.fail_next(
            FakeOp::Click,
            BrowserError::Obscured("other element would receive the click".to_string()),
        );
        let observation = fx.run(ToolCall::Click { id: 1 }).expect("observation");
        assert!(observation.starts_with("Click on element 1"), "{observation}");
        assert!(observation.contains("Close, Dismiss or X"));
    }

    #[test]
    fn not_interactable_click_falls_back_to_script() {
        let mut fx = Fixture::new(ScriptedModel::new());
        fx.browser.fail_next(
            FakeOp::Click,
            BrowserError::NotInteractable("element has zero size".to_string()),
        );
        let observation = fx.run(ToolCall::Click { id: 1 }).expect("observation");
        assert!(observation.contains("by script"), "{observation}");
        assert_eq!(fx.browser.count_calls("script [data-autoapply-cand"), 1);
    }

    #[test]
    fn typing_falls_back_to_setting_the_value() {
        let mut fx = Fixture::new(ScriptedModel::new());
        fx.browser
            .fail_next(FakeOp::Type, BrowserError::NotInteractable("readonly".to_string()));
        let observation = fx
            .run(ToolCall::TypeText {
                id: 2,
                text: "jane@example.com".to_string(),
            })
            .expect("observation");
        assert!(observation.starts_with("Set element 2"), "{observation}");
    }

    #[test]
    fn typing_into_a_button_is_refused() {
        let mut fx = Fixture::new(ScriptedModel::new());
        let observation = fx
            .run(ToolCall::TypeText {
                id: 1,
                text: "hello".to_string(),
            })
            .expect("observation");
        assert!(observation.contains("not a text field"));
        assert_eq!(fx.browser.count_calls("type"), 0);
    }

    #[test]
    fn upload_checks_the_file_exists() {
        let temp = tempfile::tempdir().expect("tempdir");
        let resume = temp.path().join("resume.pdf");
        let mut fx = Fixture::new(ScriptedModel::new());

        let observation = fx
            .run(ToolCall::UploadFile { id: 3, path: None })
            .expect("observation");
        assert!(observation.contains("no resume_path"), "{observation}");

        fx.profile.resume_path = Some(resume.clone());
        let observation = fx
            .run(ToolCall::UploadFile { id: 3, path: None })
            .expect("observation");
        assert!(observation.contains("file not found"), "{observation}");

        std::fs::write(&resume, b"%PDF").expect("write resume");
        let observation = fx
            .run(ToolCall::UploadFile { id: 3, path: None })
            .expect("observation");
        assert!(observation.starts_with("Uploaded"), "{observation}");
        assert_eq!(fx.browser.count_calls("upload"), 1);
    }

    #[test]
    fn lost_session_escapes_as_crash() {
        let mut fx = Fixture::new(ScriptedModel::new());
        fx.browser
            .fail_next(FakeOp::Click, BrowserError::SessionLost("chrome not reachable".to_string()));
        let crash = fx.run(ToolCall::Click { id: 1 }).expect_err("crash");
        assert!(crash.0.is_session_fatal());
    }

    #[test]
    fn profile_answers_use_the_answer_model() {
        let model = ScriptedModel::new().with_text(["I enjoy building reliable systems."]);
        let mut fx = Fixture::new(model);
        let observation = fx
            .run(ToolCall::AnswerFromProfile {
                question: "Why Acme?".to_string(),
            })
            .expect("observation");
        assert_eq!(observation, "I enjoy building reliable systems.");
        let calls = fx.model.text_calls();
        assert_eq!(calls[0].0, "answer-model");
        assert!(calls[0].1.contains("Name: Jane Doe") || calls[0].1.contains("name: Jane Doe"));
    }

    #[test]
    fn answer_model_failure_is_an_observation() {
        let model =
            ScriptedModel::new().with_text_error(ModelError::Transport("refused".to_string()));
        let mut fx = Fixture::new(model);
        let observation = fx
            .run(ToolCall::AnswerFromProfile {
                question: "Why?".to_string(),
            })
            .expect("observation");
        assert!(observation.starts_with("Could not generate an answer"));
    }

    #[test]
    fn profile_fields_are_returned_verbatim() {
        let mut fx = Fixture::new(ScriptedModel::new());
        let name = fx
            .run(ToolCall::GetProfileData {
                field: "name".to_string(),
            })
            .expect("observation");
        assert_eq!(name, "Jane Doe");
        let missing = fx
            .run(ToolCall::GetProfileData {
                field: "phone".to_string(),
            })
            .expect("observation");
        assert_eq!(missing, "[phone not found in profile]");
    }

    #[test]
    fn look_without_vision_is_an_observation() {
        let mut fx = Fixture::new(ScriptedModel::new());
        let observation = fx
            .run(ToolCall::LookAtScreen {
                question: "Is there a CAPTCHA?".to_string(),
            })
            .expect("observation");
        assert!(observation.contains("vision is disabled"));
    }
}
