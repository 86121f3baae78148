//! Line oriented parser for the debugger's output streams
//!
//! Raw bytes arrive in arbitrary chunks. [`StreamParser::feed`] reassembles
//! them into lines, strips prompts and classifies every line as one of
//!
//! * an extension frame (`<qtcreatorcdbext>|R|12|0|service|payload`), possibly
//!   split over several lines that are joined per token,
//! * a token bracket (`<qtc>12<` ... `<qtc>12>`) capturing the output of a
//!   builtin command,
//! * plain output, with a few well known lines picked out.
use std::collections::HashMap;

use bytes::{Buf, BytesMut};

use crate::error::ProtocolFault;
use crate::gdbmi::parse_address;

/// Prefix of every extension frame.
pub const EXTENSION_PREFIX: &str = "<qtcreatorcdbext>|";

/// Prefix of the `.echo` sentinels bracketing builtin command output.
pub const TOKEN_PREFIX: &str = "<qtc>";

const VERSION_BANNER: &str = "Microsoft (R) Windows Debugger Version ";
const MODULE_LOAD: &str = "ModLoad: ";
const EXTENSION_REFUSED: &str = "SECURE: File not allowed to be loaded";

/// Type character of an extension frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    /// `R`: a command completed.
    Reply,
    /// `N`: a command failed.
    ErrorReply,
    /// `E`: an unsolicited session notification.
    Event,
}

impl MessageKind {
    fn from_char(c: char) -> Option<Self> {
        match c {
            'R' => Some(Self::Reply),
            'N' => Some(Self::ErrorReply),
            'E' => Some(Self::Event),
            _ => None,
        }
    }
}

/// A fully reassembled extension frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtensionMessage {
    pub kind: MessageKind,
    /// `-1` for messages not correlated to a command.
    pub token: i64,
    pub service: String,
    pub payload: String,
}

/// One classification produced by the parser.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    Extension(ExtensionMessage),
    /// Output captured between the sentinels of a builtin command.
    BuiltinResponse { token: i64, text: String },
    /// The debugger's startup banner.
    VersionBanner { version: String },
    /// A module load notification printed during startup.
    ModuleLoad {
        start: Option<u64>,
        end: Option<u64>,
        path: String,
    },
    /// The debugger refused to load the extension library.
    ExtensionRefused { line: String },
    /// Anything else.
    Output(String),
    Fault(ProtocolFault),
}

#[derive(Debug)]
struct PartialMessage {
    kind: MessageKind,
    service: String,
    payload: String,
}

#[derive(Debug)]
struct Capture {
    token: i64,
    lines: Vec<String>,
}

/// Incremental parser over one output stream.
#[derive(Debug, Default)]
pub struct StreamParser {
    buffer: BytesMut,
    capture: Option<Capture>,
    chunks: HashMap<i64, PartialMessage>,
}

impl StreamParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Token of the builtin command whose output is being captured.
    pub fn active_capture(&self) -> Option<i64> {
        self.capture.as_ref().map(|c| c.token)
    }

    /// Bytes held back waiting for a newline.
    pub fn pending_bytes(&self) -> usize {
        self.buffer.len()
    }

    /// Append a chunk and classify every line it completes.
    pub fn feed(&mut self, bytes: &[u8]) -> Vec<StreamEvent> {
        self.buffer.extend_from_slice(bytes);
        let mut events = Vec::new();
        while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let raw = self.buffer.split_to(pos);
            self.buffer.advance(1);
            let mut line = String::from_utf8_lossy(&raw).into_owned();
            if line.ends_with('\r') {
                line.pop();
            }
            if let Some(event) = self.classify(strip_prompts(&line)) {
                events.push(event);
            }
        }
        events
    }

    fn classify(&mut self, line: &str) -> Option<StreamEvent> {
        if let Some(frame) = line.strip_prefix(EXTENSION_PREFIX) {
            return self.extension_frame(line, frame);
        }

        if let Some((token, is_start)) = parse_bracket(line) {
            return if is_start {
                self.start_capture(token)
            } else {
                self.end_capture(token)
            };
        }

        if let Some(capture) = self.capture.as_mut() {
            capture.lines.push(line.to_string());
            return None;
        }

        Some(classify_plain(line))
    }

    fn start_capture(&mut self, token: i64) -> Option<StreamEvent> {
        let fault = match self.capture.take() {
            Some(active) if active.token != token => {
                tracing::error!(active = active.token, token, "nested builtin capture");
                Some(StreamEvent::Fault(ProtocolFault::NestedCapture {
                    active: active.token,
                    token,
                }))
            }
            Some(active) => {
                // repeated start for the same token
                self.capture = Some(active);
                return None;
            }
            None => None,
        };
        self.capture = Some(Capture {
            token,
            lines: Vec::new(),
        });
        fault
    }

    fn end_capture(&mut self, token: i64) -> Option<StreamEvent> {
        match self.capture.take() {
            Some(capture) if capture.token == token => Some(StreamEvent::BuiltinResponse {
                token,
                text: capture.lines.join("\n"),
            }),
            other => {
                let active = other.map(|c| c.token);
                tracing::error!(?active, token, "unmatched builtin capture end");
                Some(StreamEvent::Fault(ProtocolFault::UnmatchedEnd { active, token }))
            }
        }
    }

    fn extension_frame(&mut self, line: &str, frame: &str) -> Option<StreamEvent> {
        let malformed = || {
            tracing::error!(%line, "malformed extension frame");
            Some(StreamEvent::Fault(ProtocolFault::MalformedFrame {
                line: line.to_string(),
            }))
        };

        let mut fields = frame.splitn(5, '|');
        let (Some(kind), Some(token), Some(remaining), Some(service), Some(payload)) = (
            fields.next(),
            fields.next(),
            fields.next(),
            fields.next(),
            fields.next(),
        ) else {
            return malformed();
        };
        let mut kind_chars = kind.chars();
        let (Some(kind), None) = (kind_chars.next(), kind_chars.next()) else {
            return malformed();
        };
        let Some(kind) = MessageKind::from_char(kind) else {
            return malformed();
        };
        let (Ok(token), Ok(remaining)) = (token.parse::<i64>(), remaining.parse::<u32>()) else {
            return malformed();
        };

        let partial = self
            .chunks
            .entry(token)
            .or_insert_with(|| PartialMessage {
                kind,
                service: service.to_string(),
                payload: String::new(),
            });
        partial.payload.push_str(payload);
        if remaining > 0 {
            return None;
        }

        let partial = self.chunks.remove(&token)?;
        Some(StreamEvent::Extension(ExtensionMessage {
            kind: partial.kind,
            token,
            service: partial.service,
            payload: partial.payload,
        }))
    }
}

/// Strip any number of leading `d:ddd> ` / `dd:ddd> ` prompts.
pub fn strip_prompts(mut line: &str) -> &str {
    while let Some(rest) = strip_prompt(line) {
        line = rest;
    }
    line
}

fn strip_prompt(line: &str) -> Option<&str> {
    let bytes = line.as_bytes();
    let digits = bytes.iter().take_while(|b| b.is_ascii_digit()).count();
    if !(1..=2).contains(&digits) {
        return None;
    }
    let rest = &bytes[digits..];
    if rest.len() < 6 || rest[0] != b':' || rest[4] != b'>' || rest[5] != b' ' {
        return None;
    }
    if !rest[1..4].iter().all(|b| b.is_ascii_digit()) {
        return None;
    }
    Some(&line[digits + 6..])
}

/// `<qtc>N<` is a start, `<qtc>N>` an end.
fn parse_bracket(line: &str) -> Option<(i64, bool)> {
    let rest = line.strip_prefix(TOKEN_PREFIX)?;
    let (number, is_start) = if let Some(n) = rest.strip_suffix('<') {
        (n, true)
    } else {
        (rest.strip_suffix('>')?, false)
    };
    if number.is_empty() || !number.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    number.parse().ok().map(|token| (token, is_start))
}

fn classify_plain(line: &str) -> StreamEvent {
    if let Some(version) = line.strip_prefix(VERSION_BANNER) {
        return StreamEvent::VersionBanner {
            version: version.trim().to_string(),
        };
    }
    if let Some(rest) = line.strip_prefix(MODULE_LOAD) {
        let mut parts = rest.split_whitespace();
        let start = parts.next().and_then(parse_address);
        let end = parts.next().and_then(parse_address);
        let path = parts.collect::<Vec<_>>().join(" ");
        return StreamEvent::ModuleLoad { start, end, path };
    }
    if line.starts_with(EXTENSION_REFUSED) {
        return StreamEvent::ExtensionRefused {
            line: line.to_string(),
        };
    }
    StreamEvent::Output(line.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reply(token: i64, payload: &str) -> StreamEvent {
        StreamEvent::Extension(ExtensionMessage {
            kind: MessageKind::Reply,
            token,
            service: "stack".to_string(),
            payload: payload.to_string(),
        })
    }

    #[test]
    fn builtin_bracket_captures_output() {
        let mut parser = StreamParser::new();
        let events = parser.feed(b"<qtc>100<\neax=0x1\n<qtc>100>\n");
        assert_eq!(
            events,
            vec![StreamEvent::BuiltinResponse {
                token: 100,
                text: "eax=0x1".to_string()
            }]
        );
        assert_eq!(parser.active_capture(), None);
    }

    #[test]
    fn multi_line_capture_is_joined() {
        let mut parser = StreamParser::new();
        let events = parser.feed(b"0:000> <qtc>3<\r\nfirst\r\nsecond\r\n<qtc>3>\r\n");
        assert_eq!(
            events,
            vec![StreamEvent::BuiltinResponse {
                token: 3,
                text: "first\nsecond".to_string()
            }]
        );
    }

    #[test]
    fn prompts_are_stripped() {
        assert_eq!(strip_prompts("0:000> 0:000> k"), "k");
        assert_eq!(strip_prompts("12:345> x"), "x");
        assert_eq!(strip_prompts("123:456> x"), "123:456> x");
        assert_eq!(strip_prompts("0:00> x"), "0:00> x");
        assert_eq!(strip_prompts("plain"), "plain");
    }

    #[test]
    fn chunk_split_matches_single_feed() {
        let stream: &[u8] = b"Microsoft (R) Windows Debugger Version 10.0.22621.2428 AMD64\r\n\
            ModLoad: 00007ff6`a1030000 00007ff6`a1055000   C:\\work\\app.exe\r\n\
            0:000> <qtcreatorcdbext>|R|7|1|stack|[frame={le\n\
            <qtcreatorcdbext>|R|7|0|stack|vel=\"0\"}]\n\
            <qtc>8<\nrax=1\nrbx=2\n<qtc>8>\nsome output\n";

        let mut whole = StreamParser::new();
        let expected = whole.feed(stream);
        assert_eq!(expected.len(), 5);

        for split in 1..stream.len() {
            let mut parser = StreamParser::new();
            let mut events = parser.feed(&stream[..split]);
            events.extend(parser.feed(&stream[split..]));
            assert_eq!(events, expected, "split at {split}");
        }

        let mut parser = StreamParser::new();
        let mut events = Vec::new();
        for byte in stream {
            events.extend(parser.feed(std::slice::from_ref(byte)));
        }
        assert_eq!(events, expected);
    }

    #[test]
    fn extension_chunks_are_reassembled() {
        let payload = r#"{reason="breakpoint",stack=[frame={level="0"}]}"#;
        let pieces: Vec<&str> = vec![&payload[..7], &payload[7..20], &payload[20..]];
        let mut parser = StreamParser::new();
        let mut events = Vec::new();
        for (i, piece) in pieces.iter().enumerate() {
            let remaining = pieces.len() - 1 - i;
            let line = format!("<qtcreatorcdbext>|R|42|{remaining}|stack|{piece}\n");
            events.extend(parser.feed(line.as_bytes()));
        }
        assert_eq!(events, vec![reply(42, payload)]);
    }

    #[test]
    fn interleaved_tokens_reassemble_independently() {
        let mut parser = StreamParser::new();
        let mut events = parser.feed(b"<qtcreatorcdbext>|R|1|1|stack|ab\n");
        events.extend(parser.feed(b"<qtcreatorcdbext>|R|2|0|stack|xyz\n"));
        events.extend(parser.feed(b"<qtcreatorcdbext>|R|1|0|stack|cd\n"));
        assert_eq!(events, vec![reply(2, "xyz"), reply(1, "abcd")]);
    }

    #[test]
    fn payload_may_contain_separator() {
        let mut parser = StreamParser::new();
        let events = parser.feed(b"<qtcreatorcdbext>|E|-1|0|debuggee_output|a|b\n");
        assert_eq!(
            events,
            vec![StreamEvent::Extension(ExtensionMessage {
                kind: MessageKind::Event,
                token: -1,
                service: "debuggee_output".to_string(),
                payload: "a|b".to_string(),
            })]
        );
    }

    #[test]
    fn nested_capture_is_a_fault() {
        let mut parser = StreamParser::new();
        let events = parser.feed(b"<qtc>1<\nlost\n<qtc>2<\nkept\n<qtc>2>\n");
        assert_eq!(
            events,
            vec![
                StreamEvent::Fault(ProtocolFault::NestedCapture {
                    active: 1,
                    token: 2
                }),
                StreamEvent::BuiltinResponse {
                    token: 2,
                    text: "kept".to_string()
                },
            ]
        );
    }

    #[test]
    fn unmatched_end_is_a_fault() {
        let mut parser = StreamParser::new();
        let events = parser.feed(b"<qtc>5<\nx\n<qtc>6>\n<qtc>7>\n");
        assert_eq!(
            events,
            vec![
                StreamEvent::Fault(ProtocolFault::UnmatchedEnd {
                    active: Some(5),
                    token: 6
                }),
                StreamEvent::Fault(ProtocolFault::UnmatchedEnd {
                    active: None,
                    token: 7
                }),
            ]
        );
        let discarded: Vec<_> = events
            .iter()
            .map(|e| match e {
                StreamEvent::Fault(fault) => fault.discarded_capture(),
                _ => None,
            })
            .collect();
        assert_eq!(discarded, vec![Some(5), None]);
        assert_eq!(parser.active_capture(), None);
    }

    #[test]
    fn malformed_frames_are_reported() {
        let mut parser = StreamParser::new();
        let events = parser.feed(b"<qtcreatorcdbext>|R|abc|0|x|y\n<qtcreatorcdbext>|Q|1|0|x|y\n");
        assert_eq!(events.len(), 2);
        assert!(
            events
                .iter()
                .all(|e| matches!(e, StreamEvent::Fault(ProtocolFault::MalformedFrame { .. })))
        );
    }

    #[test]
    fn well_known_lines() {
        let mut parser = StreamParser::new();
        let events = parser.feed(
            b"ModLoad: 00000000`77490000 00000000`77639000   C:\\Windows\\SYSTEM32\\ntdll.dll\n\
              SECURE: File not allowed to be loaded: C:\\ext\\qtcreatorcdbext.dll\n\
              hello\n",
        );
        assert_eq!(
            events,
            vec![
                StreamEvent::ModuleLoad {
                    start: Some(0x77490000),
                    end: Some(0x77639000),
                    path: "C:\\Windows\\SYSTEM32\\ntdll.dll".to_string(),
                },
                StreamEvent::ExtensionRefused {
                    line: "SECURE: File not allowed to be loaded: C:\\ext\\qtcreatorcdbext.dll"
                        .to_string()
                },
                StreamEvent::Output("hello".to_string()),
            ]
        );
    }

    #[test]
    fn incomplete_line_is_held_back() {
        let mut parser = StreamParser::new();
        assert!(parser.feed(b"partial").is_empty());
        assert_eq!(parser.pending_bytes(), 7);
        assert_eq!(
            parser.feed(b" line\n"),
            vec![StreamEvent::Output("partial line".to_string())]
        );
        assert_eq!(parser.pending_bytes(), 0);
    }
}
