//! ESL event types and structures

use crate::headers::EventHeader;
use percent_encoding::{percent_encode, NON_ALPHANUMERIC};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

/// Event format types supported by FreeSWITCH ESL
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[non_exhaustive]
pub enum EventFormat {
    /// Plain text format (default)
    #[default]
    Plain,
    /// JSON format
    Json,
    /// XML format
    Xml,
}

impl EventFormat {
    /// Determine event format from a Content-Type header value.
    ///
    /// Returns `None` for media types that do not carry events.
    pub fn from_content_type(ct: &str) -> Option<Self> {
        match ct {
            "text/event-plain" => Some(Self::Plain),
            "text/event-json" => Some(Self::Json),
            "text/event-xml" => Some(Self::Xml),
            _ => None,
        }
    }
}

impl fmt::Display for EventFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventFormat::Plain => write!(f, "plain"),
            EventFormat::Json => write!(f, "json"),
            EventFormat::Xml => write!(f, "xml"),
        }
    }
}

impl FromStr for EventFormat {
    type Err = ParseEventFormatError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "plain" => Ok(Self::Plain),
            "json" => Ok(Self::Json),
            "xml" => Ok(Self::Xml),
            _ => Err(ParseEventFormatError(s.to_string())),
        }
    }
}

/// Error returned when parsing an invalid event format string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseEventFormatError(pub String);

impl fmt::Display for ParseEventFormatError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown event format: {}", self.0)
    }
}

impl std::error::Error for ParseEventFormatError {}

/// Error returned when parsing an unknown event type string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseEventTypeError(pub String);

impl fmt::Display for ParseEventTypeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown event type: {}", self.0)
    }
}

impl std::error::Error for ParseEventTypeError {}

wire_enum! {
    error_type: ParseEventTypeError,
    /// Event names a call-control client deals with.
    ///
    /// Events outside this set still flow through the engine; they are
    /// matched by their `Event-Name` string instead.
    #[derive(Serialize, Deserialize)]
    pub enum EslEventType {
        Custom => "CUSTOM",
        ChannelCreate => "CHANNEL_CREATE",
        ChannelDestroy => "CHANNEL_DESTROY",
        ChannelState => "CHANNEL_STATE",
        ChannelCallstate => "CHANNEL_CALLSTATE",
        ChannelAnswer => "CHANNEL_ANSWER",
        ChannelHangup => "CHANNEL_HANGUP",
        ChannelHangupComplete => "CHANNEL_HANGUP_COMPLETE",
        ChannelExecute => "CHANNEL_EXECUTE",
        ChannelExecuteComplete => "CHANNEL_EXECUTE_COMPLETE",
        ChannelBridge => "CHANNEL_BRIDGE",
        ChannelUnbridge => "CHANNEL_UNBRIDGE",
        ChannelProgress => "CHANNEL_PROGRESS",
        ChannelProgressMedia => "CHANNEL_PROGRESS_MEDIA",
        ChannelPark => "CHANNEL_PARK",
        ChannelUnpark => "CHANNEL_UNPARK",
        ChannelData => "CHANNEL_DATA",
        Dtmf => "DTMF",
        BackgroundJob => "BACKGROUND_JOB",
        Heartbeat => "HEARTBEAT",
        PlaybackStart => "PLAYBACK_START",
        PlaybackStop => "PLAYBACK_STOP",
        RecordStart => "RECORD_START",
        RecordStop => "RECORD_STOP",
        /// Subscribe to all events
        All => "ALL",
    }
}

/// ESL Event structure containing headers and optional body
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EslEvent {
    event_type: Option<EslEventType>,
    headers: HashMap<String, String>,
    body: Option<String>,
}

impl EslEvent {
    /// Create a new empty event
    pub fn new() -> Self {
        Self::default()
    }

    /// Create event with specified type; `Event-Name` is set to match.
    pub fn with_type(event_type: EslEventType) -> Self {
        let mut event = Self::new();
        event.set_header(EventHeader::EventName.as_str(), event_type.as_str());
        event.event_type = Some(event_type);
        event
    }

    /// Parsed event type, if recognized.
    pub fn event_type(&self) -> Option<EslEventType> {
        self.event_type
    }

    /// Raw `Event-Name` header, also for events without a typed variant.
    pub fn event_name(&self) -> Option<&str> {
        self.header(EventHeader::EventName)
    }

    /// Look up a header by name (case-sensitive).
    pub fn header(&self, name: impl AsRef<str>) -> Option<&str> {
        self.headers
            .get(name.as_ref())
            .map(|s| s.as_str())
    }

    /// All headers as a map.
    pub fn headers(&self) -> &HashMap<String, String> {
        &self.headers
    }

    /// Set or overwrite a header.
    ///
    /// Setting `Event-Name` also refreshes the typed event type.
    pub fn set_header(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        let value = value.into();
        if name == EventHeader::EventName.as_str() {
            self.event_type = EslEventType::from_wire(&value);
        }
        self.headers
            .insert(name, value);
    }

    /// Remove a header, returning its value if it existed.
    pub fn del_header(&mut self, name: &str) -> Option<String> {
        self.headers
            .remove(name)
    }

    /// Event body (the content after the blank line in plain-text events).
    pub fn body(&self) -> Option<&str> {
        self.body
            .as_deref()
    }

    /// Set the event body.
    pub fn set_body(&mut self, body: impl Into<String>) {
        self.body = Some(body.into());
    }

    /// `Unique-ID` header, falling back to `Caller-Unique-ID`.
    pub fn unique_id(&self) -> Option<&str> {
        self.header(EventHeader::UniqueId)
            .or_else(|| self.header(EventHeader::CallerUniqueId))
    }

    /// `Job-UUID` header from `bgapi` `BACKGROUND_JOB` events.
    pub fn job_uuid(&self) -> Option<&str> {
        self.header(EventHeader::JobUuid)
    }

    /// `Application-UUID` header of `CHANNEL_EXECUTE_COMPLETE` events.
    pub fn application_uuid(&self) -> Option<&str> {
        self.header(EventHeader::ApplicationUuid)
    }

    /// `Application-Response` header of `CHANNEL_EXECUTE_COMPLETE` events.
    pub fn application_response(&self) -> Option<&str> {
        self.header(EventHeader::ApplicationResponse)
    }

    /// `Channel-Name` header (e.g. `sofia/internal/1000@domain`).
    pub fn channel_name(&self) -> Option<&str> {
        self.header(EventHeader::ChannelName)
    }

    /// `Caller-Caller-ID-Number` header.
    pub fn caller_id_number(&self) -> Option<&str> {
        self.header(EventHeader::CallerCallerIdNumber)
    }

    /// `Caller-Caller-ID-Name` header.
    pub fn caller_id_name(&self) -> Option<&str> {
        self.header(EventHeader::CallerCallerIdName)
    }

    /// `Caller-Destination-Number` header.
    pub fn destination_number(&self) -> Option<&str> {
        self.header(EventHeader::CallerDestinationNumber)
    }

    /// `Hangup-Cause` header (e.g. `NORMAL_CLEARING`, `USER_BUSY`).
    pub fn hangup_cause(&self) -> Option<&str> {
        self.header(EventHeader::HangupCause)
    }

    /// `Event-Subclass` header for `CUSTOM` events (e.g. `sofia::register`).
    pub fn event_subclass(&self) -> Option<&str> {
        self.header(EventHeader::EventSubclass)
    }

    /// Look up a channel variable by name.
    ///
    /// Checks the `variable_{name}` header, which is how FreeSWITCH exposes
    /// channel variables in events.
    pub fn variable(&self, name: &str) -> Option<&str> {
        let key = format!("variable_{}", name);
        self.header(&key)
    }

    /// Check whether this event matches the given type.
    pub fn is_event_type(&self, event_type: EslEventType) -> bool {
        self.event_type == Some(event_type)
    }

    /// Serialize to ESL plain text wire format with percent-encoded header values.
    ///
    /// The output is what FreeSWITCH puts in the body of a
    /// `text/event-plain` message. `Event-Name` is emitted first, remaining
    /// headers are sorted for deterministic output. `Content-Length` is
    /// recomputed from the body if present.
    pub fn to_plain_format(&self) -> String {
        use std::fmt::Write;
        let mut result = String::new();

        if let Some(event_name) = self.event_name() {
            let _ = writeln!(
                result,
                "Event-Name: {}",
                percent_encode(event_name.as_bytes(), NON_ALPHANUMERIC)
            );
        }

        let mut sorted_headers: Vec<_> = self
            .headers
            .iter()
            .filter(|(k, _)| k.as_str() != "Event-Name" && k.as_str() != "Content-Length")
            .collect();
        sorted_headers.sort_by_key(|(k, _)| k.as_str());

        for (key, value) in sorted_headers {
            let _ = writeln!(
                result,
                "{}: {}",
                key,
                percent_encode(value.as_bytes(), NON_ALPHANUMERIC)
            );
        }

        if let Some(body) = &self.body {
            let _ = writeln!(result, "Content-Length: {}", body.len());
            result.push('\n');
            result.push_str(body);
        } else {
            result.push('\n');
        }

        result
    }
}
