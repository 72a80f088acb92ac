//! Two-message chat client with a single fallback hop.
//!
//! All conversational context is pushed into one `system` and one `user`
//! message by the caller; the client itself carries no turn state.

use tracing::{debug, warn};

use crate::error::Error;
use crate::message::Message;
use crate::provider::{CompletionRequest, Provider};

pub const DEFAULT_TEMPERATURE: f32 = 0.2;
pub const DEFAULT_MAX_TOKENS: u32 = 2048;

/// Per-call overrides for [`ChatClient::complete_with`].
#[derive(Debug, Clone, Default)]
pub struct ChatOptions {
    pub model: Option<String>,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
}

impl ChatOptions {
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }
}

pub struct ChatClient {
    primary: Box<dyn Provider>,
    fallback: Option<Box<dyn Provider>>,
    temperature: f32,
    max_tokens: u32,
}

impl ChatClient {
    pub fn new(primary: Box<dyn Provider>) -> Self {
        Self {
            primary,
            fallback: None,
            temperature: DEFAULT_TEMPERATURE,
            max_tokens: DEFAULT_MAX_TOKENS,
        }
    }

    pub fn with_fallback(mut self, fallback: Box<dyn Provider>) -> Self {
        self.fallback = Some(fallback);
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    pub fn has_fallback(&self) -> bool {
        self.fallback.is_some()
    }

    pub fn complete(&self, system_prompt: &str, user_prompt: &str) -> Result<String, Error> {
        self.complete_with(system_prompt, user_prompt, &ChatOptions::default())
    }

    /// Send the two-message exchange to the primary provider, then once to
    /// the fallback if the primary was unreachable or answered with an error
    /// status. A response body that fails to decode is returned as is.
    pub fn complete_with(
        &self,
        system_prompt: &str,
        user_prompt: &str,
        options: &ChatOptions,
    ) -> Result<String, Error> {
        let request = self.build_request(system_prompt, user_prompt, options);

        let primary_err = match self.primary.complete(request.clone()) {
            Ok(response) => {
                debug!(
                    provider = self.primary.name(),
                    model = %response.model,
                    prompt_tokens = response.usage.prompt_tokens,
                    completion_tokens = response.usage.completion_tokens,
                    "Completion received"
                );
                return Ok(response.message.content);
            }
            Err(e) => e,
        };
        if !primary_err.warrants_fallback() {
            warn!(provider = self.primary.name(), error = %primary_err, "Primary provider returned an unusable response");
            return Err(primary_err);
        }

        let Some(fallback) = &self.fallback else {
            warn!(provider = self.primary.name(), error = %primary_err, "Primary provider failed, no fallback configured");
            return Err(Error::provider_unavailable(primary_err.to_string(), None));
        };

        warn!(
            provider = self.primary.name(),
            fallback = fallback.name(),
            error = %primary_err,
            "Primary provider failed, retrying against fallback"
        );

        // The fallback keeps its own model unless the caller pinned one.
        let mut fallback_request = request;
        if options.model.is_none() {
            fallback_request.model = fallback.default_model().map(str::to_string);
        }

        match fallback.complete(fallback_request) {
            Ok(response) => Ok(response.message.content),
            Err(fallback_err) => Err(Error::provider_unavailable(
                primary_err.to_string(),
                Some(fallback_err.to_string()),
            )),
        }
    }

    fn build_request(
        &self,
        system_prompt: &str,
        user_prompt: &str,
        options: &ChatOptions,
    ) -> CompletionRequest {
        let mut request = CompletionRequest::new(vec![
            Message::system(system_prompt),
            Message::user(user_prompt),
        ])
        .with_temperature(options.temperature.unwrap_or(self.temperature))
        .with_max_tokens(options.max_tokens.unwrap_or(self.max_tokens));

        // Model priority: call override > provider default
        if let Some(model) = options
            .model
            .as_deref()
            .or_else(|| self.primary.default_model())
        {
            request = request.with_model(model);
        }
        request
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Role;
    use crate::testing::MockProvider;

    #[test]
    fn test_sends_exactly_system_and_user() {
        let primary = MockProvider::new();
        primary.queue_response("NOOP");
        let captured = primary.captured();
        let client = ChatClient::new(Box::new(primary));

        let text = client.complete("persona", "goal").unwrap();
        assert_eq!(text, "NOOP");

        let requests = captured.lock().unwrap();
        assert_eq!(requests.len(), 1);
        let messages = &requests[0].messages;
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].role, Role::System);
        assert_eq!(messages[0].content, "persona");
        assert_eq!(messages[1].role, Role::User);
        assert_eq!(requests[0].temperature, Some(0.2));
        assert_eq!(requests[0].max_tokens, Some(2048));
    }

    #[test]
    fn test_falls_back_once_on_primary_failure() {
        let primary = MockProvider::new();
        primary.queue_error(Error::network("connection refused"));
        let fallback = MockProvider::new().with_default_model("hosted-model");
        fallback.queue_response("from fallback");
        let fallback_captured = fallback.captured();

        let client = ChatClient::new(Box::new(primary)).with_fallback(Box::new(fallback));
        let text = client.complete("s", "u").unwrap();
        assert_eq!(text, "from fallback");

        let requests = fallback_captured.lock().unwrap();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].model.as_deref(), Some("hosted-model"));
        assert_eq!(requests[0].messages.len(), 2);
    }

    #[test]
    fn test_decode_failure_skips_fallback() {
        let primary = MockProvider::new();
        primary.queue_error(Error::serialization("missing field `choices`"));
        let fallback = MockProvider::always("from fallback");
        let fallback_captured = fallback.captured();

        let client = ChatClient::new(Box::new(primary)).with_fallback(Box::new(fallback));
        let err = client.complete("s", "u").unwrap_err();
        assert!(matches!(err, Error::Serialization(_)));
        assert!(fallback_captured.lock().unwrap().is_empty());
    }

    #[test]
    fn test_error_status_falls_back() {
        let primary = MockProvider::new();
        primary.queue_error(Error::invalid_request("context length exceeded"));
        let client = ChatClient::new(Box::new(primary))
            .with_fallback(Box::new(MockProvider::always("from fallback")));
        assert_eq!(client.complete("s", "u").unwrap(), "from fallback");
    }

    #[test]
    fn test_unavailable_without_fallback() {
        let primary = MockProvider::new();
        primary.queue_error(Error::api(502, "bad gateway"));
        let client = ChatClient::new(Box::new(primary));

        let err = client.complete("s", "u").unwrap_err();
        assert!(matches!(err, Error::ProviderUnavailable { fallback: None, .. }));
        assert!(err.is_fatal());
    }

    #[test]
    fn test_unavailable_when_both_fail() {
        let primary = MockProvider::new();
        primary.queue_error(Error::network("refused"));
        let fallback = MockProvider::new();
        fallback.queue_error(Error::auth("bad key"));

        let client = ChatClient::new(Box::new(primary)).with_fallback(Box::new(fallback));
        match client.complete("s", "u") {
            Err(Error::ProviderUnavailable { primary, fallback }) => {
                assert!(primary.contains("refused"));
                assert!(fallback.unwrap().contains("bad key"));
            }
            other => panic!("expected ProviderUnavailable, got {:?}", other),
        }
    }

    #[test]
    fn test_call_options_override_defaults() {
        let primary = MockProvider::new().with_default_model("local");
        primary.queue_response("ok");
        let captured = primary.captured();
        let client = ChatClient::new(Box::new(primary));

        let options = ChatOptions::default()
            .with_model("override")
            .with_temperature(0.7)
            .with_max_tokens(64);
        client.complete_with("s", "u", &options).unwrap();

        let requests = captured.lock().unwrap();
        assert_eq!(requests[0].model.as_deref(), Some("override"));
        assert_eq!(requests[0].temperature, Some(0.7));
        assert_eq!(requests[0].max_tokens, Some(64));
    }
}
