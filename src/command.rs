//! Command serialization and reply handling

use crate::{
    constants::{HEADER_REPLY_TEXT, HEADER_TERMINATOR, LINE_TERMINATOR},
    error::{EslError, EslResult},
    headers::EventHeader,
};
use std::collections::HashMap;
use std::fmt;

/// Reject line breaks in anything that ends up on a command line or header.
///
/// ESL commands are line-delimited; embedded newlines would allow injection
/// of arbitrary protocol commands.
pub(crate) fn validate_no_newlines(s: &str, context: &str) -> EslResult<()> {
    if s.contains('\n') || s.contains('\r') {
        return Err(EslError::malformed(format!(
            "{} must not contain line breaks",
            context
        )));
    }
    Ok(())
}

/// Reply-Text classification per the ESL wire protocol.
///
/// FreeSWITCH commands return `+OK …` on success and `-ERR …` on failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum ReplyStatus {
    /// Reply-Text starts with `+OK` or is absent/empty.
    Ok,
    /// Reply-Text starts with `-ERR`.
    Err,
    /// Reply-Text present but matches neither `+OK` nor `-ERR`.
    Other,
}

/// Reply to a command written on the connection
#[derive(Debug, Clone, PartialEq)]
pub struct EslResponse {
    headers: HashMap<String, String>,
    body: Option<String>,
    status: ReplyStatus,
}

impl EslResponse {
    /// `ReplyStatus` is derived from the `Reply-Text` header.
    ///
    /// `api/response` messages carry their status in the body instead, so
    /// a body starting with `-ERR` is classified the same way.
    pub fn new(headers: HashMap<String, String>, body: Option<String>) -> Self {
        let text = headers
            .get(HEADER_REPLY_TEXT)
            .map(|s| s.as_str())
            .or(body.as_deref());
        let status = match text.map(str::trim_start) {
            None | Some("") => ReplyStatus::Ok,
            Some(t) if t.starts_with("+OK") => ReplyStatus::Ok,
            Some(t) if t.starts_with("-ERR") => ReplyStatus::Err,
            Some(_) if !headers.contains_key(HEADER_REPLY_TEXT) => ReplyStatus::Ok,
            Some(_) => ReplyStatus::Other,
        };

        Self {
            headers,
            body,
            status,
        }
    }

    /// `true` if Reply-Text is `+OK` or absent.
    pub fn is_success(&self) -> bool {
        self.status == ReplyStatus::Ok
    }

    /// Classification of the reply.
    pub fn reply_status(&self) -> ReplyStatus {
        self.status
    }

    /// Response body (the `api/` response payload).
    pub fn body(&self) -> Option<&str> {
        self.body
            .as_deref()
    }

    /// Look up a response header by name.
    pub fn header(&self, name: impl AsRef<str>) -> Option<&str> {
        self.headers
            .get(name.as_ref())
            .map(|s| s.as_str())
    }

    /// Raw `Reply-Text` header value (e.g. `+OK`, `-ERR invalid command`).
    pub fn reply_text(&self) -> Option<&str> {
        self.header(HEADER_REPLY_TEXT)
    }

    /// `Job-UUID` header from `bgapi` acknowledgements.
    pub fn job_uuid(&self) -> Option<&str> {
        self.header(EventHeader::JobUuid)
    }

    /// Convert to result based on success status.
    pub fn into_result(self) -> EslResult<Self> {
        match self.status {
            ReplyStatus::Ok => Ok(self),
            ReplyStatus::Err => {
                let reply_text = self
                    .reply_text()
                    .or(self.body())
                    .unwrap_or("-ERR")
                    .trim_end()
                    .to_string();
                Err(EslError::CommandFailed { reply_text })
            }
            ReplyStatus::Other => {
                let reply_text = self
                    .reply_text()
                    .unwrap_or("")
                    .to_string();
                Err(EslError::UnexpectedReply { reply_text })
            }
        }
    }
}

/// Builder for header-carrying commands such as `sendmsg`.
///
/// Headers keep insertion order. Headers with an empty value are skipped.
///
/// ```
/// use freeswitch_esl_session::CommandBuilder;
///
/// let cmd = CommandBuilder::new("sendmsg A-1")
///     .header("call-command", "execute").unwrap()
///     .header("execute-app-arg", "").unwrap()
///     .body("payload")
///     .build();
/// assert_eq!(
///     cmd,
///     "sendmsg A-1\ncall-command: execute\nContent-Length: 7\n\npayload"
/// );
/// ```
#[derive(Debug)]
pub struct CommandBuilder {
    command: String,
    headers: Vec<(String, String)>,
    body: Option<String>,
}

impl CommandBuilder {
    /// Start building a command with the given command line.
    pub fn new(command: &str) -> Self {
        Self {
            command: command.to_string(),
            headers: Vec::new(),
            body: None,
        }
    }

    /// Add header to command.
    ///
    /// Returns an error if the name or value contains line breaks.
    pub fn header(mut self, name: &str, value: &str) -> EslResult<Self> {
        validate_no_newlines(name, "header name")?;
        validate_no_newlines(value, "header value")?;
        if !value.is_empty() {
            self.headers
                .push((name.to_string(), value.to_string()));
        }
        Ok(self)
    }

    /// Set command body.
    ///
    /// The body is length-delimited so it may contain newlines.
    pub fn body(mut self, body: &str) -> Self {
        self.body = Some(body.to_string());
        self
    }

    /// Build the command string
    pub fn build(self) -> String {
        use std::fmt::Write;
        let mut result = self.command;
        result.push_str(LINE_TERMINATOR);

        for (key, value) in &self.headers {
            let _ = write!(result, "{}: {}{}", key, value, LINE_TERMINATOR);
        }

        if let Some(body) = &self.body {
            let _ = write!(result, "Content-Length: {}{}", body.len(), LINE_TERMINATOR);
            result.push_str(LINE_TERMINATOR);
            result.push_str(body);
        } else {
            result.push_str(LINE_TERMINATOR);
        }

        result
    }
}

/// Commands the connection knows how to serialize
#[derive(Clone)]
pub enum EslCommand {
    /// A caller-supplied command line, sent as-is
    Raw { line: String },
    /// Authenticate with password
    Auth { password: String },
    /// Execute API command and wait for its `api/response`
    Api { command: String },
    /// Submit a background job correlated by `Job-UUID`
    BgApi { command: String, job_uuid: String },
    /// Subscribe to events
    Events { format: String, events: String },
    /// Send a header block (and optional body) to a call
    SendMsg {
        uuid: Option<String>,
        headers: Vec<(String, String)>,
        body: Option<String>,
    },
    /// Fire a custom event into the switch's event system
    SendEvent {
        name: String,
        headers: Vec<(String, String)>,
        body: Option<String>,
    },
    /// Exit/logout
    Exit,
}

impl fmt::Debug for EslCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EslCommand::Raw { line } => f
                .debug_struct("Raw")
                .field("line", line)
                .finish(),
            EslCommand::Auth { .. } => f
                .debug_struct("Auth")
                .field("password", &"[REDACTED]")
                .finish(),
            EslCommand::Api { command } => f
                .debug_struct("Api")
                .field("command", command)
                .finish(),
            EslCommand::BgApi { command, job_uuid } => f
                .debug_struct("BgApi")
                .field("command", command)
                .field("job_uuid", job_uuid)
                .finish(),
            EslCommand::Events { format, events } => f
                .debug_struct("Events")
                .field("format", format)
                .field("events", events)
                .finish(),
            EslCommand::SendMsg {
                uuid,
                headers,
                body,
            } => f
                .debug_struct("SendMsg")
                .field("uuid", uuid)
                .field("headers", headers)
                .field("body", body)
                .finish(),
            EslCommand::SendEvent {
                name,
                headers,
                body,
            } => f
                .debug_struct("SendEvent")
                .field("name", name)
                .field("headers", headers)
                .field("body", body)
                .finish(),
            EslCommand::Exit => write!(f, "Exit"),
        }
    }
}

impl EslCommand {
    /// Format a simple command with optional arguments
    fn format_simple_command(cmd: &str, args: &[&str]) -> String {
        let mut result = String::from(cmd);
        for arg in args {
            result.push(' ');
            result.push_str(arg);
        }
        result.push_str(HEADER_TERMINATOR);
        result
    }

    fn header_block(line: &str, headers: &[(String, String)], body: Option<&str>) -> EslResult<String> {
        let mut builder = CommandBuilder::new(line);
        for (key, value) in headers {
            builder = builder.header(key, value)?;
        }
        if let Some(body) = body {
            builder = builder.body(body);
        }
        Ok(builder.build())
    }

    /// `Auth` is sent before the connection is usable; used to pick the log level.
    pub(crate) fn is_sensitive(&self) -> bool {
        matches!(self, EslCommand::Auth { .. })
    }

    /// Validate all user-supplied fields, then convert to wire format.
    pub fn to_wire_format(&self) -> EslResult<String> {
        match self {
            EslCommand::Raw { line } => {
                validate_no_newlines(line, "command")?;
                Ok(Self::format_simple_command(line, &[]))
            }
            EslCommand::Auth { password } => {
                validate_no_newlines(password, "password")?;
                Ok(Self::format_simple_command("auth", &[password]))
            }
            EslCommand::Api { command } => {
                validate_no_newlines(command, "api command")?;
                Ok(Self::format_simple_command("api", &[command]))
            }
            EslCommand::BgApi { command, job_uuid } => {
                validate_no_newlines(command, "bgapi command")?;
                CommandBuilder::new(&format!("bgapi {}", command))
                    .header(EventHeader::JobUuid.as_str(), job_uuid)
                    .map(CommandBuilder::build)
            }
            EslCommand::Events { format, events } => {
                validate_no_newlines(format, "event format")?;
                validate_no_newlines(events, "event list")?;
                Ok(Self::format_simple_command("event", &[format, events]))
            }
            EslCommand::SendMsg {
                uuid,
                headers,
                body,
            } => {
                let mut line = String::from("sendmsg");
                if let Some(u) = uuid {
                    validate_no_newlines(u, "sendmsg uuid")?;
                    line.push(' ');
                    line.push_str(u);
                }
                Self::header_block(&line, headers, body.as_deref())
            }
            EslCommand::SendEvent {
                name,
                headers,
                body,
            } => {
                validate_no_newlines(name, "event name")?;
                if name.is_empty() {
                    return Err(EslError::malformed("event name must not be empty"));
                }
                Self::header_block(&format!("sendevent {}", name), headers, body.as_deref())
            }
            EslCommand::Exit => Ok(Self::format_simple_command("exit", &[])),
        }
    }
}
