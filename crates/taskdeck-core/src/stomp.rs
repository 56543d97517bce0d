//! Minimal STOMP 1.2 framing for the scheduler's topic overlay.
//!
//! Only the frames a read-only subscriber needs are modelled. Bodies end at
//! the first NUL octet; `content-length` is emitted but not required on input.

use std::fmt;
use std::str::FromStr;
use thiserror::Error;

pub const DEFAULT_MAX_FRAME_BYTES: usize = 256 * 1024;
pub const ACCEPT_VERSION: &str = "1.2,1.1";
const FRAME_TERMINATOR: char = '\0';

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StompCommand {
    Connect,
    Connected,
    Subscribe,
    Unsubscribe,
    Send,
    Message,
    Receipt,
    Error,
    Disconnect,
}

impl StompCommand {
    pub fn as_str(&self) -> &'static str {
        match self {
            StompCommand::Connect => "CONNECT",
            StompCommand::Connected => "CONNECTED",
            StompCommand::Subscribe => "SUBSCRIBE",
            StompCommand::Unsubscribe => "UNSUBSCRIBE",
            StompCommand::Send => "SEND",
            StompCommand::Message => "MESSAGE",
            StompCommand::Receipt => "RECEIPT",
            StompCommand::Error => "ERROR",
            StompCommand::Disconnect => "DISCONNECT",
        }
    }
}

impl fmt::Display for StompCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StompCommand {
    type Err = FrameError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        match input {
            "CONNECT" | "STOMP" => Ok(StompCommand::Connect),
            "CONNECTED" => Ok(StompCommand::Connected),
            "SUBSCRIBE" => Ok(StompCommand::Subscribe),
            "UNSUBSCRIBE" => Ok(StompCommand::Unsubscribe),
            "SEND" => Ok(StompCommand::Send),
            "MESSAGE" => Ok(StompCommand::Message),
            "RECEIPT" => Ok(StompCommand::Receipt),
            "ERROR" => Ok(StompCommand::Error),
            "DISCONNECT" => Ok(StompCommand::Disconnect),
            other => Err(FrameError::UnknownCommand(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StompFrame {
    pub command: StompCommand,
    pub headers: Vec<(String, String)>,
    pub body: String,
}

impl StompFrame {
    pub fn new(command: StompCommand) -> Self {
        Self {
            command,
            headers: Vec::new(),
            body: String::new(),
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn with_body(mut self, body: impl Into<String>) -> Self {
        self.body = body.into();
        self
    }

    pub fn connect(host: &str, bearer: Option<&str>) -> Self {
        let frame = Self::new(StompCommand::Connect)
            .with_header("accept-version", ACCEPT_VERSION)
            .with_header("host", host)
            .with_header("heart-beat", "0,0");
        match bearer {
            Some(value) => frame.with_header("Authorization", value),
            None => frame,
        }
    }

    pub fn subscribe(id: &str, destination: &str) -> Self {
        Self::new(StompCommand::Subscribe)
            .with_header("id", id)
            .with_header("destination", destination)
            .with_header("ack", "auto")
    }

    pub fn disconnect() -> Self {
        Self::new(StompCommand::Disconnect)
    }

    /// First value wins, as STOMP 1.2 requires for repeated headers.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }

    pub fn destination(&self) -> Option<&str> {
        self.header("destination")
    }

    pub fn encode(&self) -> String {
        let escape = self.command != StompCommand::Connect && self.command != StompCommand::Connected;
        let mut out = String::with_capacity(64 + self.body.len());
        out.push_str(self.command.as_str());
        out.push('\n');
        for (name, value) in &self.headers {
            if escape {
                out.push_str(&escape_header(name));
                out.push(':');
                out.push_str(&escape_header(value));
            } else {
                out.push_str(name);
                out.push(':');
                out.push_str(value);
            }
            out.push('\n');
        }
        if !self.body.is_empty() && self.header("content-length").is_none() {
            out.push_str(&format!("content-length:{}\n", self.body.len()));
        }
        out.push('\n');
        out.push_str(&self.body);
        out.push(FRAME_TERMINATOR);
        out
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    #[error("frame exceeds max size: {size} > {max}")]
    OversizedFrame { size: usize, max: usize },
    #[error("buffer exceeds max size without terminator: {size} > {max}")]
    OversizedBuffer { size: usize, max: usize },
    #[error("unknown frame command: {0}")]
    UnknownCommand(String),
    #[error("malformed header line: {0}")]
    MalformedHeader(String),
    #[error("invalid header escape: {0}")]
    InvalidEscape(String),
}

#[derive(Debug, Clone)]
pub struct DecodeReport {
    pub frames: Vec<StompFrame>,
    pub errors: Vec<FrameError>,
}

impl Default for DecodeReport {
    fn default() -> Self {
        Self {
            frames: Vec::new(),
            errors: Vec::new(),
        }
    }
}

pub fn decode_frame(raw: &str, max_frame_bytes: usize) -> Result<StompFrame, FrameError> {
    let raw = raw.strip_suffix(FRAME_TERMINATOR).unwrap_or(raw);
    if raw.len() > max_frame_bytes {
        return Err(FrameError::OversizedFrame {
            size: raw.len(),
            max: max_frame_bytes,
        });
    }
    let raw = raw.trim_start_matches(['\r', '\n']);
    let (head, body) = match raw.find("\n\n") {
        Some(idx) => (&raw[..idx], &raw[idx + 2..]),
        None => match raw.find("\r\n\r\n") {
            Some(idx) => (&raw[..idx], &raw[idx + 4..]),
            None => (raw, ""),
        },
    };
    let mut lines = head.lines().map(|line| line.trim_end_matches('\r'));
    let command_line = lines.next().unwrap_or_default();
    let command = command_line.parse::<StompCommand>()?;
    let escape = command != StompCommand::Connect && command != StompCommand::Connected;
    let mut headers = Vec::new();
    for line in lines {
        if line.is_empty() {
            continue;
        }
        let Some((name, value)) = line.split_once(':') else {
            return Err(FrameError::MalformedHeader(line.to_string()));
        };
        if escape {
            headers.push((unescape_header(name)?, unescape_header(value)?));
        } else {
            headers.push((name.to_string(), value.to_string()));
        }
    }
    Ok(StompFrame {
        command,
        headers,
        body: body.to_string(),
    })
}

/// Accumulates websocket text and yields complete frames. Heart-beat EOLs
/// between frames are skipped.
pub struct StompFrameDecoder {
    max_frame_bytes: usize,
    pending: String,
}

impl StompFrameDecoder {
    pub fn new(max_frame_bytes: usize) -> Self {
        Self {
            max_frame_bytes,
            pending: String::new(),
        }
    }

    pub fn push_text(&mut self, chunk: &str) -> DecodeReport {
        let mut report = DecodeReport::default();
        self.pending.push_str(chunk);

        while let Some(idx) = self.pending.find(FRAME_TERMINATOR) {
            let frame: String = self.pending.drain(..=idx).collect();
            if frame.trim_matches(['\r', '\n', FRAME_TERMINATOR]).is_empty() {
                continue;
            }
            match decode_frame(&frame, self.max_frame_bytes) {
                Ok(parsed) => report.frames.push(parsed),
                Err(err) => report.errors.push(err),
            }
        }

        if self.pending.trim_matches(['\r', '\n']).is_empty() {
            self.pending.clear();
        } else if self.pending.len() > self.max_frame_bytes {
            report.errors.push(FrameError::OversizedBuffer {
                size: self.pending.len(),
                max: self.max_frame_bytes,
            });
            self.pending.clear();
        }

        report
    }

    pub fn reset(&mut self) {
        self.pending.clear();
    }
}

impl Default for StompFrameDecoder {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME_BYTES)
    }
}

fn escape_header(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for ch in input.chars() {
        match ch {
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            ':' => out.push_str("\\c"),
            other => out.push(other),
        }
    }
    out
}

fn unescape_header(input: &str) -> Result<String, FrameError> {
    let mut out = String::with_capacity(input.len());
    let mut chars = input.chars();
    while let Some(ch) = chars.next() {
        if ch != '\\' {
            out.push(ch);
            continue;
        }
        match chars.next() {
            Some('\\') => out.push('\\'),
            Some('n') => out.push('\n'),
            Some('r') => out.push('\r'),
            Some('c') => out.push(':'),
            _ => return Err(FrameError::InvalidEscape(input.to_string())),
        }
    }
    Ok(out)
}
