use reqwest::StatusCode;

/// A user-facing failure; the message is printed as-is
#[derive(Debug, thiserror::Error)]
#[error("{0}")]
pub struct CliError(pub String);

impl CliError {
    /// A non-success response, with the daemon's `{error:{type,message}}`
    /// body when it sent one
    pub fn daemon(status: StatusCode, kind: Option<&str>, message: &str) -> Self {
        match kind {
            Some(kind) => CliError(format!("{kind} ({status}): {message}")),
            None if message.is_empty() => CliError(format!("Daemon returned {status}")),
            None => CliError(format!("Daemon returned {status}: {message}")),
        }
    }
}

impl From<String> for CliError {
    fn from(s: String) -> Self {
        CliError(s)
    }
}

impl From<recollect::RecollectError> for CliError {
    fn from(e: recollect::RecollectError) -> Self {
        CliError(e.to_string())
    }
}

impl From<reqwest::Error> for CliError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_connect() {
            CliError(format!("Could not reach the recollect daemon: {e}"))
        } else if e.is_timeout() {
            CliError(format!("Daemon did not answer in time: {e}"))
        } else {
            CliError(format!("HTTP error: {e}"))
        }
    }
}

impl From<url::ParseError> for CliError {
    fn from(e: url::ParseError) -> Self {
        CliError(format!("Invalid daemon URL: {e}"))
    }
}

impl From<serde_json::Error> for CliError {
    fn from(e: serde_json::Error) -> Self {
        CliError(format!("JSON error: {e}"))
    }
}

pub type CliResult<T> = Result<T, CliError>;
