//! Decision engine: one completion request per iteration, parsed into a [`Decision`].

use anyhow::{Context, Result};
use tracing::{debug, instrument, warn};

use crate::core::decision::{Decision, FinishPolicy, interpret};
use crate::io::model::TextModel;
use crate::io::prompt::{DecisionInputs, PromptBuilder};

/// One model turn: the exact prompt, the raw completion and its interpretation.
#[derive(Debug, Clone)]
pub struct DecisionTurn {
    pub prompt: String,
    pub response: String,
    pub decision: Decision,
}

#[derive(Debug, Clone)]
pub struct DecisionEngine {
    model: String,
    policy: FinishPolicy,
}

impl DecisionEngine {
    pub fn new(model: impl Into<String>, policy: FinishPolicy) -> Self {
        Self {
            model: model.into(),
            policy,
        }
    }

    /// Ask the model for the next step.
    ///
    /// Format violations, timeouts and unreadable responses come back as
    /// recoverable decisions. An unreachable server is returned as an error
    /// wrapping the [`ModelError`](crate::io::model::ModelError), so the caller can wait and ask again.
    #[instrument(skip_all, fields(model = %self.model, iteration = inputs.iteration))]
    pub fn decide<M>(
        &self,
        model: &M,
        prompts: &PromptBuilder,
        inputs: &DecisionInputs<'_>,
    ) -> Result<DecisionTurn>
    where
        M: TextModel + ?Sized,
    {
        let prompt = prompts
            .build_decision(inputs)
            .context("render decision prompt")?;
        match model.generate(&self.model, &prompt) {
            Ok(response) => {
                let decision = interpret(&response, &self.policy);
                debug!(decision = decision.label(), "model decided");
                Ok(DecisionTurn {
                    prompt,
                    response,
                    decision,
                })
            }
            Err(err) if !err.is_unavailable() => {
                warn!(error = %err, "decision model gave no usable answer");
                Ok(DecisionTurn {
                    prompt,
                    response: String::new(),
                    decision: Decision::Stalled {
                        reason: err.to_string(),
                    },
                })
            }
            Err(err) => Err(err).context("decision model request failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;
    use crate::core::decision::FormatError;
    use crate::core::perception::{PerceptionSnapshot, SnapshotLimits};
    use crate::core::scratchpad::Scratchpad;
    use crate::core::tools::ToolCall;
    use crate::core::types::{Job, JobStatus};
    use crate::io::model::ModelError;
    use crate::test_support::{ScriptedModel, candidate};

    fn job() -> Job {
        Job {
            id: 7,
            url: "https://ex.com/job/1".to_string(),
            title: "Engineer".to_string(),
            company: "Acme".to_string(),
            status: JobStatus::InProgress,
            log: String::new(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn decide_with(model: &ScriptedModel) -> Result<DecisionTurn> {
        let job = job();
        let history = Scratchpad::new();
        let snapshot = PerceptionSnapshot::from_candidates(
            1,
            vec![candidate("button", "Apply now")],
            SnapshotLimits::default(),
            Utc::now(),
        );
        let engine = DecisionEngine::new("qwen", FinishPolicy::default());
        engine.decide(
            model,
            &PromptBuilder::new(24_000),
            &DecisionInputs {
                job: &job,
                iteration: 1,
                max_iterations: 50,
                history: &history,
                snapshot: &snapshot,
            },
        )
    }

    #[test]
    fn action_is_parsed_and_prompt_is_kept() {
        let model = ScriptedModel::new()
            .with_text(["Thought: start the application\nAction: Click_Element\nAction Input: 1"]);
        let turn = decide_with(&model).expect("decide");
        assert!(matches!(
            turn.decision,
            Decision::Act {
                call: ToolCall::Click { id: 1 },
                ..
            }
        ));
        assert!(turn.prompt.contains("[1] <button> \"Apply now\""));
        let calls = model.text_calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].0, "qwen");
        assert_eq!(calls[0].1, turn.prompt);
    }

    #[test]
    fn garbage_is_malformed_not_an_error() {
        let model = ScriptedModel::new().with_text(["I think we should apply!"]);
        let turn = decide_with(&model).expect("decide");
        assert!(matches!(
            turn.decision,
            Decision::Malformed {
                error: FormatError::NoAction,
                ..
            }
        ));
    }

    #[test]
    fn timeout_and_garbled_response_stall() {
        let model =
            ScriptedModel::new().with_text_error(ModelError::Timeout("120s elapsed".to_string()));
        let turn = decide_with(&model).expect("decide");
        assert!(matches!(turn.decision, Decision::Stalled { .. }));

        let model =
            ScriptedModel::new().with_text_error(ModelError::Decode("unexpected eof".to_string()));
        let turn = decide_with(&model).expect("decide");
        assert!(matches!(turn.decision, Decision::Stalled { .. }));
    }

    #[test]
    fn unreachable_server_keeps_the_model_error() {
        let model = ScriptedModel::new()
            .with_text_error(ModelError::Transport("connection refused".to_string()));
        let err = decide_with(&model).expect_err("transport");
        assert!(format!("{err:#}").contains("connection refused"));
        let cause = err.downcast_ref::<ModelError>().expect("model error");
        assert!(cause.is_unavailable());
    }

    #[test]
    fn unconfirmed_finish_is_rejected() {
        let model = ScriptedModel::new()
            .with_text(["Thought: I filled everything\nFinal Answer: done"]);
        let turn = decide_with(&model).expect("decide");
        assert!(matches!(
            turn.decision,
            Decision::Malformed {
                error: FormatError::UnconfirmedFinish,
                ..
            }
        ));
    }
}
