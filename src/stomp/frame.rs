//! STOMP 1.2 text frames.
//!
//! One WebSocket text message carries zero or more frames. Bare EOLs between
//! frames are heart-beats.

use std::fmt;
use std::time::Duration;

use crate::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Connect,
    Stomp,
    Connected,
    Send,
    Subscribe,
    Unsubscribe,
    Ack,
    Nack,
    Begin,
    Commit,
    Abort,
    Disconnect,
    Message,
    Receipt,
    Error,
}

impl Command {
    pub fn as_str(&self) -> &'static str {
        match self {
            Command::Connect => "CONNECT",
            Command::Stomp => "STOMP",
            Command::Connected => "CONNECTED",
            Command::Send => "SEND",
            Command::Subscribe => "SUBSCRIBE",
            Command::Unsubscribe => "UNSUBSCRIBE",
            Command::Ack => "ACK",
            Command::Nack => "NACK",
            Command::Begin => "BEGIN",
            Command::Commit => "COMMIT",
            Command::Abort => "ABORT",
            Command::Disconnect => "DISCONNECT",
            Command::Message => "MESSAGE",
            Command::Receipt => "RECEIPT",
            Command::Error => "ERROR",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "CONNECT" => Command::Connect,
            "STOMP" => Command::Stomp,
            "CONNECTED" => Command::Connected,
            "SEND" => Command::Send,
            "SUBSCRIBE" => Command::Subscribe,
            "UNSUBSCRIBE" => Command::Unsubscribe,
            "ACK" => Command::Ack,
            "NACK" => Command::Nack,
            "BEGIN" => Command::Begin,
            "COMMIT" => Command::Commit,
            "ABORT" => Command::Abort,
            "DISCONNECT" => Command::Disconnect,
            "MESSAGE" => Command::Message,
            "RECEIPT" => Command::Receipt,
            "ERROR" => Command::Error,
            _ => return None,
        })
    }

    // CONNECT and CONNECTED headers are sent raw for 1.0 compatibility.
    fn escapes_headers(&self) -> bool {
        !matches!(self, Command::Connect | Command::Stomp | Command::Connected)
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub command: Command,
    pub headers: Vec<(String, String)>,
    pub body: String,
}

impl Frame {
    pub fn new(command: Command) -> Self {
        Self { command, headers: Vec::new(), body: String::new() }
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn body(mut self, body: impl Into<String>) -> Self {
        self.body = body.into();
        self
    }

    /// First occurrence wins when a header repeats.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.headers.iter().find(|(k, _)| k == name).map(|(_, v)| v.as_str())
    }

    pub fn encode(&self) -> String {
        let escape = self.command.escapes_headers();
        let mut out = String::with_capacity(self.body.len() + 64);
        out.push_str(self.command.as_str());
        out.push('\n');
        for (name, value) in &self.headers {
            if escape {
                push_escaped(&mut out, name);
                out.push(':');
                push_escaped(&mut out, value);
            } else {
                out.push_str(name);
                out.push(':');
                out.push_str(value);
            }
            out.push('\n');
        }
        out.push('\n');
        out.push_str(&self.body);
        out.push('\0');
        out
    }
}

fn push_escaped(out: &mut String, raw: &str) {
    for c in raw.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            ':' => out.push_str("\\c"),
            c => out.push(c),
        }
    }
}

fn unescape(raw: &str) -> Result<String> {
    let mut out = String::with_capacity(raw.len());
    let mut chars = raw.chars();
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
            other => {
                return Err(Error::Frame(format!("invalid header escape \\{}", other.map(String::from).unwrap_or_default())));
            }
        }
    }
    Ok(out)
}

/// Decode every frame in a WebSocket payload. A payload made only of EOLs is
/// a heart-beat and yields no frames.
pub fn decode(input: &str) -> Result<Vec<Frame>> {
    let mut frames = Vec::new();
    let mut rest = input;
    loop {
        rest = rest.trim_start_matches(['\n', '\r']);
        if rest.is_empty() {
            return Ok(frames);
        }
        let (frame, remaining) = decode_one(rest)?;
        frames.push(frame);
        rest = remaining;
    }
}

fn next_line(input: &str) -> Option<(&str, &str)> {
    let idx = input.find('\n')?;
    let line = input[..idx].strip_suffix('\r').unwrap_or(&input[..idx]);
    Some((line, &input[idx + 1..]))
}

fn decode_one(input: &str) -> Result<(Frame, &str)> {
    let (command_line, mut rest) =
        next_line(input).ok_or_else(|| Error::Frame("missing command line".into()))?;
    let command = Command::parse(command_line)
        .ok_or_else(|| Error::Frame(format!("unknown command {:?}", command_line)))?;
    let escape = command.escapes_headers();

    let mut headers = Vec::new();
    loop {
        let (line, remaining) =
            next_line(rest).ok_or_else(|| Error::Frame("unterminated headers".into()))?;
        rest = remaining;
        if line.is_empty() {
            break;
        }
        let (name, value) = line
            .split_once(':')
            .ok_or_else(|| Error::Frame(format!("header without colon: {:?}", line)))?;
        if escape {
            headers.push((unescape(name)?, unescape(value)?));
        } else {
            headers.push((name.to_string(), value.to_string()));
        }
    }

    let content_length = headers
        .iter()
        .find(|(k, _)| k == "content-length")
        .map(|(_, v)| v.trim().parse::<usize>())
        .transpose()
        .map_err(|e| Error::Frame(format!("bad content-length: {}", e)))?;

    let body_end = match content_length {
        Some(len) => {
            if rest.as_bytes().get(len) != Some(&0) || !rest.is_char_boundary(len) {
                return Err(Error::Frame("content-length does not end at NUL".into()));
            }
            len
        }
        None => rest.find('\0').ok_or_else(|| Error::Frame("missing NUL terminator".into()))?,
    };

    let frame = Frame { command, headers, body: rest[..body_end].to_string() };
    Ok((frame, &rest[body_end + 1..]))
}

/// A `heart-beat` header value: `(can send every, wants to receive every)`
/// in milliseconds, 0 meaning never.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct HeartBeat {
    pub outgoing: u64,
    pub incoming: u64,
}

impl HeartBeat {
    pub fn symmetric(interval: Duration) -> Self {
        let ms = interval.as_millis() as u64;
        Self { outgoing: ms, incoming: ms }
    }

    pub fn parse(value: &str) -> Result<Self> {
        let (out, inc) = value
            .split_once(',')
            .ok_or_else(|| Error::Frame(format!("bad heart-beat {:?}", value)))?;
        let parse = |s: &str| {
            s.trim().parse::<u64>().map_err(|_| Error::Frame(format!("bad heart-beat {:?}", value)))
        };
        Ok(Self { outgoing: parse(out)?, incoming: parse(inc)? })
    }

    pub fn header_value(&self) -> String {
        format!("{},{}", self.outgoing, self.incoming)
    }
}

/// Agreed intervals: how often we must send, how often we should hear back.
pub fn negotiate(client: HeartBeat, server: HeartBeat) -> (Option<Duration>, Option<Duration>) {
    let pick = |ours: u64, theirs: u64| {
        (ours != 0 && theirs != 0).then(|| Duration::from_millis(ours.max(theirs)))
    };
    (pick(client.outgoing, server.incoming), pick(client.incoming, server.outgoing))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encodes_send_frame() {
        let frame = Frame::new(Command::Send)
            .header("destination", "/app/chat.send")
            .header("content-type", "application/json")
            .body("{}");
        assert_eq!(
            frame.encode(),
            "SEND\ndestination:/app/chat.send\ncontent-type:application/json\n\n{}\0"
        );
    }

    #[test]
    fn escapes_headers_except_on_connect() {
        let send = Frame::new(Command::Send).header("x", "a:b\nc\\d");
        assert!(send.encode().contains("x:a\\cb\\nc\\\\d\n"));

        let connect = Frame::new(Command::Connect).header("host", "shop.io:8080");
        assert!(connect.encode().contains("host:shop.io:8080\n"));
    }

    #[test]
    fn decodes_message_with_unescaped_headers() {
        let raw = "MESSAGE\ndestination:/topic/public\nx:a\\cb\\nc\nsubscription:sub-0\n\n{\"k\":1}\0";
        let frames = decode(raw).unwrap();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].command, Command::Message);
        assert_eq!(frames[0].get("x"), Some("a:b\nc"));
        assert_eq!(frames[0].body, "{\"k\":1}");
    }

    #[test]
    fn first_repeated_header_wins() {
        let frames = decode("MESSAGE\nfoo:1\nfoo:2\n\n\0").unwrap();
        assert_eq!(frames[0].get("foo"), Some("1"));
    }

    #[test]
    fn heartbeat_payload_yields_nothing() {
        assert!(decode("\n").unwrap().is_empty());
        assert!(decode("\r\n\r\n").unwrap().is_empty());
    }

    #[test]
    fn decodes_multiple_frames_with_trailing_eols() {
        let raw = "RECEIPT\nreceipt-id:1\n\n\0\nMESSAGE\n\nhello\0\r\n";
        let frames = decode(raw).unwrap();
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].get("receipt-id"), Some("1"));
        assert_eq!(frames[1].body, "hello");
    }

    #[test]
    fn content_length_allows_nul_in_body() {
        let raw = "MESSAGE\ncontent-length:3\n\na\0b\0";
        let frames = decode(raw).unwrap();
        assert_eq!(frames[0].body, "a\0b");
    }

    #[test]
    fn content_length_counts_bytes() {
        let raw = "MESSAGE\ncontent-length:2\n\né\0";
        assert_eq!(decode(raw).unwrap()[0].body, "é");
    }

    #[test]
    fn crlf_lines_are_accepted() {
        let frames = decode("CONNECTED\r\nversion:1.2\r\n\r\n\0").unwrap();
        assert_eq!(frames[0].get("version"), Some("1.2"));
    }

    #[test]
    fn rejects_malformed_frames() {
        assert!(decode("BOGUS\n\n\0").is_err());
        assert!(decode("MESSAGE\nno-colon\n\n\0").is_err());
        assert!(decode("MESSAGE\n\nbody without nul").is_err());
        assert!(decode("MESSAGE\nx:\\t\n\n\0").is_err());
        assert!(decode("MESSAGE\ncontent-length:10\n\nshort\0").is_err());
    }

    #[test]
    fn encode_then_decode_preserves_tricky_headers() {
        let frame = Frame::new(Command::Send).header("weird:name", "line\nbreak\\").body("x");
        assert_eq!(decode(&frame.encode()).unwrap(), vec![frame]);
    }

    #[test]
    fn negotiates_heartbeats() {
        let client = HeartBeat::symmetric(Duration::from_secs(10));
        let server = HeartBeat::parse("0,20000").unwrap();
        let (send, recv) = negotiate(client, server);
        assert_eq!(send, Some(Duration::from_secs(20)));
        assert_eq!(recv, None);

        let (send, recv) = negotiate(client, HeartBeat::parse("5000,5000").unwrap());
        assert_eq!(send, Some(Duration::from_secs(10)));
        assert_eq!(recv, Some(Duration::from_secs(10)));

        assert_eq!(negotiate(HeartBeat::default(), server), (None, None));
    }

    #[test]
    fn rejects_bad_heartbeat_header() {
        assert!(HeartBeat::parse("10").is_err());
        assert!(HeartBeat::parse("a,b").is_err());
        assert_eq!(HeartBeat::symmetric(Duration::from_secs(10)).header_value(), "10000,10000");
    }
}
