//! Minimal STOMP 1.2 framing for the live channel: enough to connect, subscribe to one
//! destination, receive `MESSAGE` frames and exchange heartbeats.

use std::fmt::Write as _;
use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum StompError {
    #[error("frame has no command")]
    MissingCommand,
    #[error("frame is not NUL terminated")]
    Unterminated,
    #[error("invalid header line: {0}")]
    InvalidHeader(String),
    #[error("invalid escape sequence in header: {0}")]
    InvalidEscape(String),
    #[error("invalid content-length: {0}")]
    InvalidContentLength(String),
    #[error("invalid heart-beat header: {0}")]
    InvalidHeartBeat(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Frame {
    pub command: String,
    pub headers: Vec<(String, String)>,
    pub body: String,
}

impl Frame {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            ..Default::default()
        }
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn with_body(mut self, body: impl Into<String>) -> Self {
        self.body = body.into();
        self
    }

    /// First value of a header. Repeated headers keep the first occurrence.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    pub fn encode(&self) -> String {
        let escape = escapes_headers(&self.command);
        let mut out = String::with_capacity(self.command.len() + self.body.len() + 64);
        out.push_str(&self.command);
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
        if !self.body.is_empty() && self.get("content-length").is_none() {
            let _ = writeln!(out, "content-length:{}", self.body.len());
        }
        out.push('\n');
        out.push_str(&self.body);
        out.push('\0');
        out
    }
}

/// Decodes every frame in one transport message, failing on the first broken frame. A message
/// made only of EOLs is a heartbeat and decodes to no frames.
pub fn decode_all(text: &str) -> Result<Vec<Frame>, StompError> {
    decode_frames(text).into_iter().collect()
}

/// Like [`decode_all`], but a broken frame only costs itself: decoding resumes after the next
/// NUL, so the frames around it survive.
pub fn decode_frames(text: &str) -> Vec<Result<Frame, StompError>> {
    let mut frames = Vec::new();
    let mut rest = text;

    loop {
        rest = rest.trim_start_matches(['\r', '\n']);
        if rest.is_empty() {
            return frames;
        }
        match decode_one(rest) {
            Ok((frame, tail)) => {
                frames.push(Ok(frame));
                rest = tail;
            }
            Err(e) => {
                frames.push(Err(e));
                match rest.find('\0') {
                    Some(nul) => rest = &rest[nul + 1..],
                    None => return frames,
                }
            }
        }
    }
}

fn decode_one(text: &str) -> Result<(Frame, &str), StompError> {
    let head_end = text.find("\n\n").map(|i| (i, i + 2));
    let head_end = match text.find("\r\n\r\n") {
        Some(i) if head_end.map_or(true, |(j, _)| i < j) => Some((i, i + 4)),
        _ => head_end,
    };
    let (head_len, body_start) = head_end.ok_or(StompError::Unterminated)?;

    let mut lines = text[..head_len].lines();
    let command = lines
        .next()
        .map(|l| l.trim_end_matches('\r'))
        .filter(|l| !l.is_empty())
        .ok_or(StompError::MissingCommand)?
        .to_string();
    let escape = escapes_headers(&command);

    let mut headers = Vec::new();
    for line in lines {
        let line = line.trim_end_matches('\r');
        let (name, value) = line
            .split_once(':')
            .ok_or_else(|| StompError::InvalidHeader(line.to_string()))?;
        if escape {
            headers.push((unescape_header(name)?, unescape_header(value)?));
        } else {
            headers.push((name.to_string(), value.to_string()));
        }
    }

    let rest = &text[body_start..];
    let content_length = headers
        .iter()
        .find(|(k, _)| k == "content-length")
        .map(|(_, v)| v.clone());

    let (body, tail) = match content_length {
        Some(len) => {
            let n: usize = len
                .trim()
                .parse()
                .map_err(|_| StompError::InvalidContentLength(len.clone()))?;
            if rest.len() <= n || !rest.is_char_boundary(n) || rest.as_bytes()[n] != 0 {
                return Err(StompError::InvalidContentLength(len));
            }
            (&rest[..n], &rest[n + 1..])
        }
        None => {
            let nul = rest.find('\0').ok_or(StompError::Unterminated)?;
            (&rest[..nul], &rest[nul + 1..])
        }
    };

    Ok((
        Frame {
            command,
            headers,
            body: body.to_string(),
        },
        tail,
    ))
}

fn escapes_headers(command: &str) -> bool {
    !matches!(command, "CONNECT" | "CONNECTED")
}

fn escape_header(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            ':' => out.push_str("\\c"),
            c => out.push(c),
        }
    }
    out
}

fn unescape_header(value: &str) -> Result<String, StompError> {
    let mut out = String::with_capacity(value.len());
    let mut chars = value.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('\\') => out.push('\\'),
            Some('n') => out.push('\n'),
            Some('r') => out.push('\r'),
            Some('c') => out.push(':'),
            _ => return Err(StompError::InvalidEscape(value.to_string())),
        }
    }
    Ok(out)
}

/// Parses a `heart-beat:<x>,<y>` value into milliseconds.
pub fn parse_heart_beat(value: &str) -> Result<(u64, u64), StompError> {
    let invalid = || StompError::InvalidHeartBeat(value.to_string());
    let (x, y) = value.split_once(',').ok_or_else(invalid)?;
    let x = x.trim().parse().map_err(|_| invalid())?;
    let y = y.trim().parse().map_err(|_| invalid())?;
    Ok((x, y))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct HeartBeat {
    /// How often the client must send something.
    pub send_every: Option<Duration>,
    /// How often the server promised to send something.
    pub expect_every: Option<Duration>,
}

/// Combines the client's `(outgoing, incoming)` wish with the server's reply.
pub fn negotiate_heart_beat(client: (u64, u64), server: (u64, u64)) -> HeartBeat {
    let (client_out, client_in) = client;
    let (server_out, server_in) = server;

    let pick = |a: u64, b: u64| {
        if a == 0 || b == 0 {
            None
        } else {
            Some(Duration::from_millis(a.max(b)))
        }
    };

    HeartBeat {
        send_every: pick(client_out, server_in),
        expect_every: pick(server_out, client_in),
    }
}
