//! Collaborators the reply pipeline talks to: AI backends, credentials,
//! licensing and connectivity.

pub mod completion;
pub mod connectivity;
pub mod credentials;
pub mod license;
pub mod ollama;
pub mod openai;

pub use completion::{CompletionError, CompletionOptions, CompletionProvider, FallbackCompletion};
pub use connectivity::{ConnectivityMonitor, DnsConnectivity};
pub use credentials::{AccessToken, CredentialError, CredentialProvider, StoredCredentials};
pub use license::{HttpLicenseService, LicenseService, NoopLicenseService, TrialStatus};
pub use ollama::OllamaBackend;
pub use openai::OpenAiBackend;

const REDACTED_BODY_MAX_LEN: usize = 200;

/// Trims remote error bodies before they reach logs.
pub(crate) fn redact_response_body(body: &str) -> String {
    let trimmed = body.trim();
    if trimmed.chars().count() <= REDACTED_BODY_MAX_LEN {
        trimmed.to_string()
    } else {
        let kept: String = trimmed.chars().take(REDACTED_BODY_MAX_LEN).collect();
        format!("{}…[truncated {} bytes]", kept, trimmed.len())
    }
}

#[cfg(test)]
mod tests {
    use super::redact_response_body;

    #[test]
    fn long_bodies_are_truncated() {
        let body = "x".repeat(500);
        let redacted = redact_response_body(&body);
        assert!(redacted.starts_with(&"x".repeat(200)));
        assert!(redacted.ends_with("[truncated 500 bytes]"));
        assert_eq!(redact_response_body("  short "), "short");
    }
}
