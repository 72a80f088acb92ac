//! Test utilities shared across the workspace.
//! Only compiled when running tests or with the `testing` feature.

use std::sync::{Arc, Mutex};

use crate::error::Error;
use crate::message::{Message, Usage};
use crate::provider::{CompletionRequest, CompletionResponse, FinishReason, Provider};

/// A mock provider that returns pre-configured responses.
pub struct MockProvider {
    responses: Mutex<Vec<Result<CompletionResponse, Error>>>,
    /// Returned once the queue is empty; `None` means "error out".
    repeat: Option<String>,
    /// Captured requests (for assertion). Shared so tests can keep a handle
    /// after the provider is boxed into a client.
    captured_requests: Arc<Mutex<Vec<CompletionRequest>>>,
    pub name: String,
    pub default_model: Option<String>,
}

impl MockProvider {
    pub fn new() -> Self {
        Self {
            responses: Mutex::new(Vec::new()),
            repeat: None,
            captured_requests: Arc::new(Mutex::new(Vec::new())),
            name: "mock".to_string(),
            default_model: None,
        }
    }

    /// A provider that answers every request with the same text.
    pub fn always(content: &str) -> Self {
        let mut provider = Self::new();
        provider.repeat = Some(content.to_string());
        provider
    }

    pub fn with_default_model(mut self, model: &str) -> Self {
        self.default_model = Some(model.to_string());
        self
    }

    /// Queue a response to be returned by the next complete() call.
    /// Responses are returned in FIFO order (first queued = first returned).
    pub fn queue_response(&self, content: &str) {
        self.responses
            .lock()
            .unwrap()
            .insert(0, Ok(Self::response(content)));
    }

    /// Queue an error to be returned by the next complete() call.
    pub fn queue_error(&self, error: Error) {
        self.responses.lock().unwrap().insert(0, Err(error));
    }

    pub fn captured(&self) -> Arc<Mutex<Vec<CompletionRequest>>> {
        Arc::clone(&self.captured_requests)
    }

    /// Get the number of captured requests.
    pub fn request_count(&self) -> usize {
        self.captured_requests.lock().unwrap().len()
    }

    /// Get the last captured request.
    pub fn last_request(&self) -> Option<CompletionRequest> {
        self.captured_requests.lock().unwrap().last().cloned()
    }

    fn response(content: &str) -> CompletionResponse {
        CompletionResponse {
            message: Message::assistant(content),
            usage: Usage::new(0, 0),
            model: "mock-model".to_string(),
            finish_reason: FinishReason::Stop,
        }
    }
}

impl Default for MockProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl Provider for MockProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn default_model(&self) -> Option<&str> {
        self.default_model.as_deref()
    }

    fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, Error> {
        self.captured_requests.lock().unwrap().push(request);
        match self.responses.lock().unwrap().pop() {
            Some(response) => response,
            None => match &self.repeat {
                Some(content) => Ok(Self::response(content)),
                None => Err(Error::network("No mock response queued")),
            },
        }
    }
}
