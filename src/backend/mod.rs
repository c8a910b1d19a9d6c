mod error;
pub mod http;
pub mod sse;
pub mod stdio;

pub use error::BackendError;
pub use http::{HttpProxy, build_http_client};
pub use sse::{SseEvent, SseParser, SseRelay, parse_sse_data};
pub use stdio::StdioProcess;
