//! Typed errors at the orchestrator's seams.
//!
//! Only failures that callers branch on get a type here. Command rejection
//! is deliberately *not* an error: the sandbox reports it as a sentinel
//! [`crate::core::state::ExecResult`] (returncode 124/126/127) so the
//! critic can classify it. Contract violations are likewise plain state
//! (`Vec<String>` of reasons) consumed by the repair loop.

use thiserror::Error;

/// Fatal misconfiguration: the request cannot proceed and nothing ran.
#[derive(Debug, Error)]
#[error("configuration error: {0}")]
pub struct ConfigurationError(pub String);

/// A failure talking to the model backend. Recovered locally with a
/// deterministic fallback artifact or an error-text reply, never a crash.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("missing credential: env var {0} is not set")]
    MissingCredential(String),
    #[error("http request failed: {0}")]
    Http(String),
    #[error("model API error: {0}")]
    Api(String),
    #[error("malformed completion response: {0}")]
    InvalidResponse(String),
}

/// The model did not return the required structured output. Recovered via
/// exactly one strict-mode retry, then a deterministic fallback.
#[derive(Debug, Error)]
#[error("parse error: {0}")]
pub struct ParseError(pub String);
