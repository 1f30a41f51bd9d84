//! Typed header names used by the session engine.

/// Error returned when parsing an unrecognized event header name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseEventHeaderError(pub String);

impl std::fmt::Display for ParseEventHeaderError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "unknown event header: {}", self.0)
    }
}

impl std::error::Error for ParseEventHeaderError {}

wire_enum! {
    error_type: ParseEventHeaderError,
    /// Event and command header names the engine reads or writes.
    ///
    /// Use with [`EslEvent::header()`](crate::EslEvent::header) for typed
    /// lookups; unlisted headers are still reachable by string.
    pub enum EventHeader {
        EventName => "Event-Name",
        EventSubclass => "Event-Subclass",
        UniqueId => "Unique-ID",
        CallerUniqueId => "Caller-Unique-ID",
        /// Echo of the `Event-UUID` sent with `call-command: execute`.
        ApplicationUuid => "Application-UUID",
        Application => "Application",
        ApplicationData => "Application-Data",
        ApplicationResponse => "Application-Response",
        JobUuid => "Job-UUID",
        JobCommand => "Job-Command",
        EventUuid => "Event-UUID",
        CallCommand => "call-command",
        ExecuteAppName => "execute-app-name",
        ExecuteAppArg => "execute-app-arg",
        ChannelName => "Channel-Name",
        HangupCause => "Hangup-Cause",
        CallerCallerIdName => "Caller-Caller-ID-Name",
        CallerCallerIdNumber => "Caller-Caller-ID-Number",
        CallerDestinationNumber => "Caller-Destination-Number",
        CoreUuid => "Core-UUID",
    }
}
