//! Shared test helpers: a scripted provider and a canned executor.

use async_trait::async_trait;
use codeloop_core::error::{ExecutionError, ProviderError};
use codeloop_core::executor::{CodeExecutor, ExecutionOutput, ExecutionRequest};
use codeloop_core::message::Message;
use codeloop_core::provider::{
    ChunkReceiver, Provider, ProviderRequest, ProviderResponse, StreamChunk, Usage,
};
use std::sync::Mutex;

/// One scripted provider reply.
#[derive(Debug, Clone)]
pub enum Turn {
    Text(String),
    Fail(ProviderError),
}

impl Turn {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text(text.into())
    }

    pub fn fail(error: ProviderError) -> Self {
        Self::Fail(error)
    }
}

/// A mock provider that returns a sequence of scripted replies.
///
/// Each call to `complete` or `stream` takes the next turn. Streams deliver
/// the text in small fragments. Panics if more calls are made than turns
/// provided.
pub struct ScriptedProvider {
    turns: Mutex<Vec<Turn>>,
    requests: Mutex<Vec<ProviderRequest>>,
}

impl ScriptedProvider {
    pub fn new(turns: Vec<Turn>) -> Self {
        Self {
            turns: Mutex::new(turns),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn call_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    /// Every request received, in order.
    pub fn requests(&self) -> Vec<ProviderRequest> {
        self.requests.lock().unwrap().clone()
    }

    fn next_turn(&self, request: ProviderRequest) -> Turn {
        let mut requests = self.requests.lock().unwrap();
        let turns = self.turns.lock().unwrap();
        let index = requests.len();
        if index >= turns.len() {
            panic!(
                "ScriptedProvider: no more turns (call #{}, have {})",
                index,
                turns.len()
            );
        }
        requests.push(request);
        turns[index].clone()
    }
}

#[async_trait]
impl Provider for ScriptedProvider {
    fn name(&self) -> &str {
        "scripted_mock"
    }

    async fn complete(&self, request: ProviderRequest) -> Result<ProviderResponse, ProviderError> {
        match self.next_turn(request) {
            Turn::Text(text) => Ok(ProviderResponse {
                message: Message::assistant(text),
                usage: Some(Usage {
                    prompt_tokens: 10,
                    completion_tokens: 5,
                    total_tokens: 15,
                }),
                model: "mock-model".into(),
            }),
            Turn::Fail(e) => Err(e),
        }
    }

    async fn stream(&self, request: ProviderRequest) -> Result<ChunkReceiver, ProviderError> {
        let text = match self.next_turn(request) {
            Turn::Text(text) => text,
            Turn::Fail(e) => return Err(e),
        };

        let chars: Vec<char> = text.chars().collect();
        let (tx, rx) = tokio::sync::mpsc::channel(chars.len() / 7 + 2);
        for fragment in chars.chunks(7) {
            let _ = tx.send(Ok(StreamChunk::text(fragment.iter().collect::<String>()))).await;
        }
        let _ = tx.send(Ok(StreamChunk::finished(None))).await;
        Ok(rx)
    }
}

/// An executor replaying canned outputs, recording every request.
pub struct CannedExecutor {
    outputs: Mutex<Vec<Result<ExecutionOutput, ExecutionError>>>,
    requests: Mutex<Vec<ExecutionRequest>>,
    fail_init: Option<String>,
}

impl CannedExecutor {
    pub fn new(outputs: Vec<Result<ExecutionOutput, ExecutionError>>) -> Self {
        Self {
            outputs: Mutex::new(outputs),
            requests: Mutex::new(Vec::new()),
            fail_init: None,
        }
    }

    /// Every call prints `text`.
    pub fn always(text: &str, times: usize) -> Self {
        Self::new((0..times).map(|_| Ok(ExecutionOutput::ok(text))).collect())
    }

    pub fn failing_init(message: &str) -> Self {
        Self {
            fail_init: Some(message.into()),
            ..Self::new(vec![])
        }
    }

    pub fn requests(&self) -> Vec<ExecutionRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl CodeExecutor for CannedExecutor {
    fn name(&self) -> &str {
        "canned"
    }

    async fn initialize(&self) -> Result<(), ExecutionError> {
        match &self.fail_init {
            Some(message) => Err(ExecutionError::Initialization(message.clone())),
            None => Ok(()),
        }
    }

    async fn execute(&self, request: ExecutionRequest) -> Result<ExecutionOutput, ExecutionError> {
        let mut requests = self.requests.lock().unwrap();
        let outputs = self.outputs.lock().unwrap();
        let index = requests.len();
        requests.push(request);
        outputs
            .get(index)
            .cloned()
            .unwrap_or_else(|| panic!("CannedExecutor: no output for call #{index}"))
    }
}
