//! Protocol constants and configuration defaults

use std::time::Duration;

/// Default FreeSWITCH ESL port for inbound connections
pub const DEFAULT_ESL_PORT: u16 = 8021;

/// Socket buffer size for reading from the stream (64KB)
pub const SOCKET_BUF_SIZE: usize = 65536;

/// Buffer allocation size (64KB) - used for both initial allocation and growth increments
pub const BUF_CHUNK: usize = 64 * 1024;

/// Maximum single message size (8MB) - validates Content-Length header
pub const MAX_MESSAGE_SIZE: usize = 8 * 1024 * 1024;

/// Maximum total buffer size (16MB)
pub const MAX_BUFFER_SIZE: usize = 16 * 1024 * 1024;

/// Protocol message terminators
pub const HEADER_TERMINATOR: &str = "\n\n";
pub const LINE_TERMINATOR: &str = "\n";

/// Content-Type header values
pub const CONTENT_TYPE_AUTH_REQUEST: &str = "auth/request";
pub const CONTENT_TYPE_COMMAND_REPLY: &str = "command/reply";
pub const CONTENT_TYPE_API_RESPONSE: &str = "api/response";
pub const CONTENT_TYPE_TEXT_EVENT_PLAIN: &str = "text/event-plain";
pub const CONTENT_TYPE_TEXT_EVENT_JSON: &str = "text/event-json";
pub const CONTENT_TYPE_TEXT_EVENT_XML: &str = "text/event-xml";
pub const CONTENT_TYPE_DISCONNECT_NOTICE: &str = "text/disconnect-notice";

/// Protocol framing header: body media type.
pub const HEADER_CONTENT_TYPE: &str = "Content-Type";
/// Protocol framing header: body length.
pub const HEADER_CONTENT_LENGTH: &str = "Content-Length";
/// Protocol framing header: command reply status.
pub const HEADER_REPLY_TEXT: &str = "Reply-Text";
/// Protocol framing header: disconnect notice disposition.
pub const HEADER_CONTENT_DISPOSITION: &str = "Content-Disposition";

/// Hangup cause used when none is given.
pub const DEFAULT_HANGUP_CAUSE: &str = "NORMAL_CLEARING";

/// Events the session engine needs to see.
pub const SESSION_EVENTS: &str = "CHANNEL_PARK CHANNEL_EXECUTE CHANNEL_EXECUTE_COMPLETE \
CHANNEL_ANSWER CHANNEL_HANGUP CHANNEL_DESTROY BACKGROUND_JOB HEARTBEAT";

/// TCP connect timeout
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_millis(2000);

/// Maximum number of queued connection events before dropping
pub const MAX_EVENT_QUEUE_SIZE: usize = 1000;

/// Per-session inbound queue capacity
pub const DEFAULT_SESSION_QUEUE_SIZE: usize = 64;

/// Deadline for background jobs submitted through a session
pub const DEFAULT_JOB_TIMEOUT: Duration = Duration::from_secs(30);

/// How long an application may keep running after its call is gone
pub const DEFAULT_APP_GRACE_PERIOD: Duration = Duration::from_secs(5);

/// How long event handlers may keep running after their dispatcher stops
pub const DEFAULT_HANDLER_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);
