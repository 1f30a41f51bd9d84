//! ESL frame reader: message framing, classification and event decoding

use crate::{
    buffer::EslBuffer,
    command::EslResponse,
    constants::{
        CONTENT_TYPE_API_RESPONSE, CONTENT_TYPE_AUTH_REQUEST, CONTENT_TYPE_COMMAND_REPLY,
        CONTENT_TYPE_DISCONNECT_NOTICE, HEADER_CONTENT_DISPOSITION, HEADER_CONTENT_LENGTH,
        HEADER_CONTENT_TYPE, HEADER_REPLY_TEXT, MAX_MESSAGE_SIZE,
    },
    error::{EslError, EslResult},
    event::{EslEvent, EventFormat},
};
use percent_encoding::percent_decode_str;
use std::collections::HashMap;

/// ESL message types, derived from `Content-Type`
#[derive(Debug, Clone, PartialEq)]
pub enum MessageType {
    /// Authentication request from server
    AuthRequest,
    /// Command reply
    CommandReply,
    /// API response
    ApiResponse,
    /// Event message in the given encoding
    Event(EventFormat),
    /// Disconnect notice
    Disconnect,
    /// Log line pushed by `log <level>`
    LogData,
    /// Unknown message type
    Unknown(String),
}

impl MessageType {
    /// Parse message type from Content-Type header
    pub fn from_content_type(content_type: &str) -> Self {
        if let Some(format) = EventFormat::from_content_type(content_type) {
            return MessageType::Event(format);
        }
        match content_type {
            CONTENT_TYPE_AUTH_REQUEST => MessageType::AuthRequest,
            CONTENT_TYPE_COMMAND_REPLY => MessageType::CommandReply,
            CONTENT_TYPE_API_RESPONSE => MessageType::ApiResponse,
            CONTENT_TYPE_DISCONNECT_NOTICE => MessageType::Disconnect,
            "log/data" => MessageType::LogData,
            _ => MessageType::Unknown(content_type.to_string()),
        }
    }

    /// `true` for messages routed to the event queue.
    pub fn is_event(&self) -> bool {
        matches!(self, MessageType::Event(_))
    }
}

/// Parsed ESL message
#[derive(Debug, Clone)]
pub struct EslMessage {
    /// Message type
    pub message_type: MessageType,
    /// Message headers
    pub headers: HashMap<String, String>,
    /// Message body (optional)
    pub body: Option<String>,
}

impl EslMessage {
    /// Create new message
    pub fn new(
        message_type: MessageType,
        headers: HashMap<String, String>,
        body: Option<String>,
    ) -> Self {
        Self {
            message_type,
            headers,
            body,
        }
    }

    /// Look up a header by name.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(name)
            .map(|s| s.as_str())
    }

    /// `Reply-Text` header of a command reply.
    pub fn reply_text(&self) -> Option<&str> {
        self.header(HEADER_REPLY_TEXT)
    }

    /// `Content-Disposition: linger` notices announce a delayed close and
    /// are not terminal.
    pub fn is_linger_notice(&self) -> bool {
        self.message_type == MessageType::Disconnect
            && self
                .header(HEADER_CONTENT_DISPOSITION)
                .is_some_and(|d| d.eq_ignore_ascii_case("linger"))
    }

    /// Convert to EslResponse
    pub fn into_response(self) -> EslResponse {
        EslResponse::new(self.headers, self.body)
    }

    /// Decode the body of an event message.
    pub fn into_event(self) -> EslResult<EslEvent> {
        match self.message_type {
            MessageType::Event(EventFormat::Plain) => parse_plain_event(self.body),
            MessageType::Event(EventFormat::Json) => parse_json_event(self.body),
            MessageType::Event(EventFormat::Xml) => parse_xml_event(self.body),
            other => Err(EslError::protocol_error(format!(
                "Not an event message: {:?}",
                other
            ))),
        }
    }
}

/// Parser state for handling incomplete messages
#[derive(Debug)]
enum ParseState {
    WaitingForHeaders,
    WaitingForBody {
        message_type: MessageType,
        headers: HashMap<String, String>,
        body_length: usize,
    },
}

/// Incremental ESL frame parser.
///
/// Feed bytes with [`add_data`](Self::add_data), then call
/// [`parse_message`](Self::parse_message) until it returns `Ok(None)`.
pub struct EslParser {
    buffer: EslBuffer,
    state: ParseState,
}

impl EslParser {
    /// Create new parser
    pub fn new() -> Self {
        Self {
            buffer: EslBuffer::new(),
            state: ParseState::WaitingForHeaders,
        }
    }

    /// Add data to the parser buffer
    pub fn add_data(&mut self, data: &[u8]) -> EslResult<()> {
        self.buffer
            .extend_from_slice(data);
        self.buffer
            .check_size_limits()
    }

    /// Try to parse a complete message from the buffer
    pub fn parse_message(&mut self) -> EslResult<Option<EslMessage>> {
        loop {
            match std::mem::replace(&mut self.state, ParseState::WaitingForHeaders) {
                ParseState::WaitingForHeaders => {
                    let Some(block) = self
                        .buffer
                        .extract_header_block()
                    else {
                        return Ok(None);
                    };
                    self.buffer
                        .compact();

                    let block = String::from_utf8(block)
                        .map_err(|_| EslError::protocol_error("Invalid UTF-8 in headers"))?;
                    let headers = parse_header_block(&block)?;

                    // Every ESL message has a Content-Type; a missing one
                    // means the stream is out of sync.
                    let content_type = headers
                        .get(HEADER_CONTENT_TYPE)
                        .ok_or_else(|| {
                            EslError::protocol_error("Missing Content-Type header, stream desync")
                        })?;
                    let message_type = MessageType::from_content_type(content_type);

                    let body_length = match headers.get(HEADER_CONTENT_LENGTH) {
                        Some(raw) => parse_content_length(raw)?,
                        None => 0,
                    };

                    if body_length == 0 {
                        return Ok(Some(EslMessage::new(message_type, headers, None)));
                    }
                    self.state = ParseState::WaitingForBody {
                        message_type,
                        headers,
                        body_length,
                    };
                }
                ParseState::WaitingForBody {
                    message_type,
                    headers,
                    body_length,
                } => {
                    let Some(body) = self
                        .buffer
                        .extract_bytes(body_length)
                    else {
                        self.state = ParseState::WaitingForBody {
                            message_type,
                            headers,
                            body_length,
                        };
                        return Ok(None);
                    };
                    self.buffer
                        .compact();

                    let body = String::from_utf8(body)
                        .map_err(|_| EslError::protocol_error("Invalid UTF-8 in body"))?;
                    return Ok(Some(EslMessage::new(message_type, headers, Some(body))));
                }
            }
        }
    }
}

impl Default for EslParser {
    fn default() -> Self {
        Self::new()
    }
}

fn parse_content_length(raw: &str) -> EslResult<usize> {
    let length: usize = raw
        .trim()
        .parse()
        .map_err(|_| EslError::InvalidHeader {
            header: format!("{}: {}", HEADER_CONTENT_LENGTH, raw),
        })?;
    if length > MAX_MESSAGE_SIZE {
        return Err(EslError::protocol_error(format!(
            "Content-Length {} exceeds limit {}",
            length, MAX_MESSAGE_SIZE
        )));
    }
    Ok(length)
}

fn decode_value(raw: &str) -> String {
    percent_decode_str(raw)
        .decode_utf8()
        .map(|s| s.into_owned())
        .unwrap_or_else(|_| raw.to_string())
}

/// Split `Name: value` lines; values are percent-decoded.
fn parse_header_lines(block: &str) -> impl Iterator<Item = Result<(String, String), &str>> {
    block
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(|line| match line.split_once(':') {
            Some((key, value)) => Ok((
                key.trim()
                    .to_string(),
                decode_value(value.trim()),
            )),
            None => Err(line),
        })
}

fn invalid_header(line: &str) -> EslError {
    EslError::InvalidHeader {
        header: line.to_string(),
    }
}

fn parse_header_block(block: &str) -> EslResult<HashMap<String, String>> {
    let mut headers = HashMap::new();
    for entry in parse_header_lines(block) {
        let (key, value) = entry.map_err(invalid_header)?;
        headers.insert(key, value);
    }
    Ok(headers)
}

/// `text/event-plain`: the body is itself a header block, optionally
/// followed by a blank line and an inner body.
fn parse_plain_event(body: Option<String>) -> EslResult<EslEvent> {
    let body = body.ok_or_else(|| EslError::protocol_error("Plain event missing body"))?;

    let (header_section, inner_body) = match body.split_once("\n\n") {
        Some((headers, rest)) => (headers, Some(rest)),
        None => (body.as_str(), None),
    };

    let mut event = EslEvent::new();
    for entry in parse_header_lines(header_section) {
        let (key, value) = entry.map_err(invalid_header)?;
        event.set_header(key, value);
    }
    if let Some(inner) = inner_body.filter(|b| !b.is_empty()) {
        event.set_body(inner);
    }
    Ok(event)
}

/// `text/event-json`: top-level keys are headers, `_body` is the body.
fn parse_json_event(body: Option<String>) -> EslResult<EslEvent> {
    let body = body.ok_or_else(|| EslError::protocol_error("JSON event missing body"))?;
    let value: serde_json::Value = serde_json::from_str(&body)?;
    let obj = value
        .as_object()
        .ok_or_else(|| EslError::protocol_error("JSON event is not an object"))?;

    let mut event = EslEvent::new();
    for (key, value) in obj {
        let text = match value {
            serde_json::Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        if key == "_body" {
            event.set_body(text);
        } else {
            event.set_header(key.clone(), text);
        }
    }
    Ok(event)
}

/// `text/event-xml`:
///
/// ```xml
/// <event>
///   <headers>
///     <Event-Name>HEARTBEAT</Event-Name>
///   </headers>
///   <body>...</body>
/// </event>
/// ```
fn parse_xml_event(body: Option<String>) -> EslResult<EslEvent> {
    use quick_xml::events::Event as XmlEvent;
    use quick_xml::Reader;

    let body = body.ok_or_else(|| EslError::protocol_error("XML event missing body"))?;

    let mut reader = Reader::from_str(&body);
    let mut event = EslEvent::new();
    let mut in_headers = false;
    let mut in_body = false;
    let mut current_tag: Option<String> = None;

    loop {
        let xml_event = reader
            .read_event()
            .map_err(|e| EslError::protocol_error(format!("XML event: {}", e)))?;
        match xml_event {
            XmlEvent::Start(ref e) => {
                let tag = String::from_utf8_lossy(
                    e.name()
                        .as_ref(),
                )
                .to_string();
                match tag.as_str() {
                    "headers" => in_headers = true,
                    "body" => in_body = true,
                    _ if in_headers => current_tag = Some(tag),
                    _ => {}
                }
            }
            XmlEvent::End(ref e) => match e
                .name()
                .as_ref()
            {
                b"headers" => in_headers = false,
                b"body" => in_body = false,
                _ => current_tag = None,
            },
            XmlEvent::Text(ref e) => {
                let text = e
                    .unescape()
                    .map_err(|e| EslError::protocol_error(format!("XML event: {}", e)))?
                    .to_string();
                if in_body {
                    event.set_body(text);
                } else if let Some(ref tag) = current_tag {
                    event.set_header(tag.clone(), text);
                }
            }
            XmlEvent::Eof => break,
            _ => {}
        }
    }

    Ok(event)
}
