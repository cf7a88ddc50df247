use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use super::{GenerationClient, GenerationError, GenerationPrompt};
use crate::models::Stage;

/// One scripted reply.
#[derive(Debug, Clone)]
pub enum ScriptedReply {
    Text(String),
    Fail(GenerationError),
    /// Never completes; exercises timeouts and cancellation.
    Hang,
}

/// A call as the generator saw it.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedCall {
    pub stage: Stage,
    pub model: String,
    pub user: String,
}

/// Deterministic stand-in for the generation service.
///
/// Replies are queued per stage and consumed in order. When a stage's queue
/// is empty the stage fallback is used, if one was set; otherwise the call
/// fails with a non-retryable error so an under-scripted test stops quickly.
#[derive(Debug, Default)]
pub struct ScriptedGenerator {
    queues: Mutex<HashMap<Stage, VecDeque<ScriptedReply>>>,
    fallbacks: HashMap<Stage, String>,
    calls: Mutex<Vec<RecordedCall>>,
}

impl ScriptedGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn then(self, stage: Stage, reply: ScriptedReply) -> Self {
        self.queues
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .entry(stage)
            .or_default()
            .push_back(reply);
        self
    }

    pub fn then_text(self, stage: Stage, text: impl Into<String>) -> Self {
        self.then(stage, ScriptedReply::Text(text.into()))
    }

    pub fn then_fail(self, stage: Stage, error: GenerationError) -> Self {
        self.then(stage, ScriptedReply::Fail(error))
    }

    pub fn then_hang(self, stage: Stage) -> Self {
        self.then(stage, ScriptedReply::Hang)
    }

    /// Reply used whenever `stage` has nothing queued.
    pub fn fallback(mut self, stage: Stage, text: impl Into<String>) -> Self {
        self.fallbacks.insert(stage, text.into());
        self
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn call_count(&self, stage: Stage) -> usize {
        self.calls
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .iter()
            .filter(|c| c.stage == stage)
            .count()
    }

    fn next_reply(&self, stage: Stage) -> ScriptedReply {
        let queued = self
            .queues
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get_mut(&stage)
            .and_then(VecDeque::pop_front);

        queued.unwrap_or_else(|| match self.fallbacks.get(&stage) {
            Some(text) => ScriptedReply::Text(text.clone()),
            None => ScriptedReply::Fail(GenerationError::MalformedResponse(format!(
                "no scripted {stage} reply left"
            ))),
        })
    }
}

impl GenerationClient for ScriptedGenerator {
    async fn generate(&self, prompt: &GenerationPrompt) -> Result<String, GenerationError> {
        self.calls
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(RecordedCall {
                stage: prompt.stage,
                model: prompt.model.clone(),
                user: prompt.user.clone(),
            });

        match self.next_reply(prompt.stage) {
            ScriptedReply::Text(text) => Ok(text),
            ScriptedReply::Fail(error) => Err(error),
            ScriptedReply::Hang => std::future::pending().await,
        }
    }
}
