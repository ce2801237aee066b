//! Span names and field keys recorded by the relay.
//! Keep these stable; changing them is a breaking change for dashboards.

pub const SPAN_EXCHANGE: &str = "relay.exchange";

pub const KEY_PROVIDER: &str = "llm.provider";
pub const KEY_MODEL: &str = "llm.model";
pub const KEY_REQUEST_ID: &str = "req.id";
pub const KEY_TURN_COUNT: &str = "turn.count";

pub const KEY_FRAGMENTS: &str = "fragments";
pub const KEY_BYTES: &str = "bytes";
pub const KEY_FINISH_REASON: &str = "finish.reason";

pub const KEY_ERROR_KIND: &str = "error.kind";
