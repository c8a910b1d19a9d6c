use std::fmt;
use std::time::Duration;

#[derive(Debug)]
pub enum BackendError {
    Request(reqwest::Error),
    HttpStatus(u16, String),
    Stream(reqwest::Error),
    NoDataInSse,
    InvalidResponse(String),
    Spawn(String),
    ProcessExited(String),
    StdinClosed,
    Timeout(Duration),
}

impl fmt::Display for BackendError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendError::Request(e) => write!(f, "request error: {e}"),
            BackendError::HttpStatus(code, body) => {
                write!(f, "HTTP {code}: {body}")
            }
            BackendError::Stream(e) => write!(f, "stream error: {e}"),
            BackendError::NoDataInSse => write!(f, "no data line found in SSE response"),
            BackendError::InvalidResponse(msg) => write!(f, "invalid response: {msg}"),
            BackendError::Spawn(msg) => write!(f, "failed to spawn process: {msg}"),
            BackendError::ProcessExited(msg) => write!(f, "child process exited: {msg}"),
            BackendError::StdinClosed => write!(f, "stdin channel to child process is closed"),
            BackendError::Timeout(after) => {
                write!(f, "no reply from backend within {}s", after.as_secs_f64())
            }
        }
    }
}

impl std::error::Error for BackendError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            BackendError::Request(e) | BackendError::Stream(e) => Some(e),
            _ => None,
        }
    }
}
