//! Line-oriented wire protocol codec.
//!
//! Every message is a key line followed by a fixed number of argument lines,
//! each terminated by a single `\n`. The key table (and each key's arity) is
//! closed; unknown keys are protocol errors. The codec is a pure transform:
//! it owns no process or channel state.

use crate::error::{BridgeError, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;

/// Keys that appear between an `init`/`end` bracket pair in discovery output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordKey {
    Build,
    Hints,
    Category,
    Name,
    Label,
    Maker,
    Copyright,
    UniqueId,
    AudioIns,
    AudioOuts,
    CvIns,
    CvOuts,
    MidiIns,
    MidiOuts,
    ParameterIns,
    ParameterOuts,
}

impl RecordKey {
    pub fn as_str(self) -> &'static str {
        match self {
            RecordKey::Build => "build",
            RecordKey::Hints => "hints",
            RecordKey::Category => "category",
            RecordKey::Name => "name",
            RecordKey::Label => "label",
            RecordKey::Maker => "maker",
            RecordKey::Copyright => "copyright",
            RecordKey::UniqueId => "uniqueId",
            RecordKey::AudioIns => "audio.ins",
            RecordKey::AudioOuts => "audio.outs",
            RecordKey::CvIns => "cv.ins",
            RecordKey::CvOuts => "cv.outs",
            RecordKey::MidiIns => "midi.ins",
            RecordKey::MidiOuts => "midi.outs",
            RecordKey::ParameterIns => "parameters.ins",
            RecordKey::ParameterOuts => "parameters.outs",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        Some(match s {
            "build" => RecordKey::Build,
            "hints" => RecordKey::Hints,
            "category" => RecordKey::Category,
            "name" => RecordKey::Name,
            "label" => RecordKey::Label,
            "maker" => RecordKey::Maker,
            "copyright" => RecordKey::Copyright,
            "uniqueId" => RecordKey::UniqueId,
            "audio.ins" => RecordKey::AudioIns,
            "audio.outs" => RecordKey::AudioOuts,
            "cv.ins" => RecordKey::CvIns,
            "cv.outs" => RecordKey::CvOuts,
            "midi.ins" => RecordKey::MidiIns,
            "midi.outs" => RecordKey::MidiOuts,
            "parameters.ins" => RecordKey::ParameterIns,
            "parameters.outs" => RecordKey::ParameterOuts,
            _ => return None,
        })
    }
}

/// Severity of a standalone notification line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Error,
    Warning,
    Info,
}

impl Severity {
    pub fn as_str(self) -> &'static str {
        match self {
            Severity::Error => "error",
            Severity::Warning => "warning",
            Severity::Info => "info",
        }
    }
}

/// One protocol message. Variants map one-to-one onto wire keys.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    // UI / bridge control
    Show,
    Hide,
    Focus,
    Quit,
    Exiting,
    UiTitle {
        title: String,
    },
    Configure {
        key: String,
        value: String,
    },
    Control {
        index: u32,
        value: f32,
    },
    Program {
        index: u32,
    },
    MidiProgram {
        bank: u32,
        program: u32,
    },
    Note {
        on: bool,
        channel: u8,
        note: u8,
        velocity: u8,
    },
    /// Opaque binary blob, length-checked on decode.
    Atom {
        port_index: u32,
        data: Vec<u8>,
    },
    Urid {
        urid: u32,
        uri: String,
    },
    UiOptions {
        sample_rate: f64,
        use_theme: bool,
        window_title: String,
        transient_window_id: u64,
    },
    // Discovery
    Init,
    End,
    Field {
        key: RecordKey,
        value: String,
    },
    Notify {
        severity: Severity,
        text: String,
    },
}

impl Message {
    /// Wire key for this message.
    pub fn key(&self) -> &'static str {
        match self {
            Message::Show => "show",
            Message::Hide => "hide",
            Message::Focus => "focus",
            Message::Quit => "quit",
            Message::Exiting => "exiting",
            Message::UiTitle { .. } => "uiTitle",
            Message::Configure { .. } => "configure",
            Message::Control { .. } => "control",
            Message::Program { .. } => "program",
            Message::MidiProgram { .. } => "midiprogram",
            Message::Note { .. } => "note",
            Message::Atom { .. } => "atom",
            Message::Urid { .. } => "urid",
            Message::UiOptions { .. } => "uiOptions",
            Message::Init => "init",
            Message::End => "end",
            Message::Field { key, .. } => key.as_str(),
            Message::Notify { severity, .. } => severity.as_str(),
        }
    }
}

/// Argument-line count for a recognized key, or `None` for an unknown key.
fn key_arity(key: &str) -> Option<usize> {
    Some(match key {
        "show" | "hide" | "focus" | "quit" | "exiting" | "init" | "end" => 0,
        "uiTitle" | "program" | "error" | "warning" | "info" => 1,
        "configure" | "control" | "midiprogram" | "urid" => 2,
        "atom" => 3,
        "note" | "uiOptions" => 4,
        _ => {
            if RecordKey::from_str(key).is_some() {
                1
            } else {
                return None;
            }
        }
    })
}

/// Escape a string argument so it occupies exactly one wire line and decodes
/// back to the original byte sequence.
fn escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            _ => out.push(c),
        }
    }
    out
}

fn unescape(s: &str) -> Result<String> {
    let mut out = String::with_capacity(s.len());
    let mut chars = s.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('\\') => out.push('\\'),
            Some('n') => out.push('\n'),
            Some('r') => out.push('\r'),
            other => {
                return Err(BridgeError::Protocol(format!(
                    "bad escape sequence \\{}",
                    other.map(String::from).unwrap_or_default()
                )))
            }
        }
    }
    Ok(out)
}

/// Encode one message as wire bytes. Each argument occupies exactly one line.
pub fn encode(msg: &Message) -> String {
    let mut out = String::new();
    out.push_str(msg.key());
    out.push('\n');

    match msg {
        Message::Show
        | Message::Hide
        | Message::Focus
        | Message::Quit
        | Message::Exiting
        | Message::Init
        | Message::End => {}
        Message::UiTitle { title } => {
            push_line(&mut out, &escape(title));
        }
        Message::Configure { key, value } => {
            push_line(&mut out, &escape(key));
            push_line(&mut out, &escape(value));
        }
        Message::Control { index, value } => {
            push_line(&mut out, &index.to_string());
            push_line(&mut out, &value.to_string());
        }
        Message::Program { index } => {
            push_line(&mut out, &index.to_string());
        }
        Message::MidiProgram { bank, program } => {
            push_line(&mut out, &bank.to_string());
            push_line(&mut out, &program.to_string());
        }
        Message::Note {
            on,
            channel,
            note,
            velocity,
        } => {
            push_line(&mut out, if *on { "true" } else { "false" });
            push_line(&mut out, &channel.to_string());
            push_line(&mut out, &note.to_string());
            push_line(&mut out, &velocity.to_string());
        }
        Message::Atom { port_index, data } => {
            push_line(&mut out, &port_index.to_string());
            push_line(&mut out, &data.len().to_string());
            push_line(&mut out, &BASE64.encode(data));
        }
        Message::Urid { urid, uri } => {
            push_line(&mut out, &urid.to_string());
            push_line(&mut out, &escape(uri));
        }
        Message::UiOptions {
            sample_rate,
            use_theme,
            window_title,
            transient_window_id,
        } => {
            push_line(&mut out, &sample_rate.to_string());
            push_line(&mut out, if *use_theme { "true" } else { "false" });
            push_line(&mut out, &escape(window_title));
            push_line(&mut out, &transient_window_id.to_string());
        }
        Message::Field { value, .. } => {
            push_line(&mut out, &escape(value));
        }
        Message::Notify { text, .. } => {
            push_line(&mut out, &escape(text));
        }
    }

    out
}

fn push_line(out: &mut String, line: &str) {
    out.push_str(line);
    out.push('\n');
}

/// Incremental decoder. Feed raw bytes, pull whole messages.
///
/// Partial messages stay buffered; a malformed message is consumed in full so
/// the channel survives it.
#[derive(Debug, Default)]
pub struct Decoder {
    buf: Vec<u8>,
}

impl Decoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn feed(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Number of buffered, not-yet-decoded bytes.
    pub fn pending(&self) -> usize {
        self.buf.len()
    }

    /// Decode the next whole message, or `Ok(None)` if more bytes are needed.
    pub fn decode_next(&mut self) -> Result<Option<Message>> {
        // Complete lines currently in the buffer, as byte ranges.
        let mut lines: Vec<(usize, usize)> = Vec::new();
        let mut start = 0usize;
        for (i, b) in self.buf.iter().enumerate() {
            if *b == b'\n' {
                lines.push((start, i));
                start = i + 1;
            }
        }

        let Some(&(ks, ke)) = lines.first() else {
            return Ok(None);
        };

        let key = match std::str::from_utf8(&self.buf[ks..ke]) {
            Ok(k) => k.to_owned(),
            Err(_) => {
                self.consume_lines(&lines, 1);
                return Err(BridgeError::Protocol("key line is not UTF-8".into()));
            }
        };

        let Some(arity) = key_arity(&key) else {
            self.consume_lines(&lines, 1);
            return Err(BridgeError::Protocol(format!("unknown key {key:?}")));
        };

        if lines.len() < 1 + arity {
            return Ok(None);
        }

        let mut args = Vec::with_capacity(arity);
        for &(s, e) in &lines[1..=arity] {
            match std::str::from_utf8(&self.buf[s..e]) {
                Ok(a) => args.push(a.to_owned()),
                Err(_) => {
                    self.consume_lines(&lines, 1 + arity);
                    return Err(BridgeError::Protocol(format!(
                        "argument of {key:?} is not UTF-8"
                    )));
                }
            }
        }

        self.consume_lines(&lines, 1 + arity);
        parse_message(&key, &args).map(Some)
    }

    fn consume_lines(&mut self, lines: &[(usize, usize)], count: usize) {
        let end = lines[count - 1].1 + 1;
        self.buf.drain(..end);
    }
}

fn parse_message(key: &str, args: &[String]) -> Result<Message> {
    let msg = match key {
        "show" => Message::Show,
        "hide" => Message::Hide,
        "focus" => Message::Focus,
        "quit" => Message::Quit,
        "exiting" => Message::Exiting,
        "init" => Message::Init,
        "end" => Message::End,
        "uiTitle" => Message::UiTitle {
            title: unescape(&args[0])?,
        },
        "configure" => Message::Configure {
            key: unescape(&args[0])?,
            value: unescape(&args[1])?,
        },
        "control" => Message::Control {
            index: parse_arg(key, &args[0])?,
            value: parse_arg(key, &args[1])?,
        },
        "program" => Message::Program {
            index: parse_arg(key, &args[0])?,
        },
        "midiprogram" => Message::MidiProgram {
            bank: parse_arg(key, &args[0])?,
            program: parse_arg(key, &args[1])?,
        },
        "note" => Message::Note {
            on: parse_bool(key, &args[0])?,
            channel: parse_arg(key, &args[1])?,
            note: parse_arg(key, &args[2])?,
            velocity: parse_arg(key, &args[3])?,
        },
        "atom" => {
            let port_index: u32 = parse_arg(key, &args[0])?;
            let announced: usize = parse_arg(key, &args[1])?;
            let data = BASE64
                .decode(args[2].as_bytes())
                .map_err(|e| BridgeError::Protocol(format!("atom base64: {e}")))?;
            // Guards against truncation: the announced decoded length must
            // agree with what the base64 text actually holds.
            if data.len() != announced {
                return Err(BridgeError::Protocol(format!(
                    "atom length mismatch: announced {announced}, decoded {}",
                    data.len()
                )));
            }
            Message::Atom { port_index, data }
        }
        "urid" => Message::Urid {
            urid: parse_arg(key, &args[0])?,
            uri: unescape(&args[1])?,
        },
        "uiOptions" => Message::UiOptions {
            sample_rate: parse_arg(key, &args[0])?,
            use_theme: parse_bool(key, &args[1])?,
            window_title: unescape(&args[2])?,
            transient_window_id: parse_arg(key, &args[3])?,
        },
        "error" => Message::Notify {
            severity: Severity::Error,
            text: unescape(&args[0])?,
        },
        "warning" => Message::Notify {
            severity: Severity::Warning,
            text: unescape(&args[0])?,
        },
        "info" => Message::Notify {
            severity: Severity::Info,
            text: unescape(&args[0])?,
        },
        other => match RecordKey::from_str(other) {
            Some(rk) => Message::Field {
                key: rk,
                value: unescape(&args[0])?,
            },
            // key_arity() already filtered unknown keys
            None => unreachable!("key {other:?} passed arity lookup"),
        },
    };

    Ok(msg)
}

fn parse_arg<T: std::str::FromStr>(key: &str, raw: &str) -> Result<T> {
    raw.parse().map_err(|_| {
        BridgeError::Protocol(format!("bad argument {raw:?} for key {key:?}"))
    })
}

fn parse_bool(key: &str, raw: &str) -> Result<bool> {
    match raw {
        "true" => Ok(true),
        "false" => Ok(false),
        _ => Err(BridgeError::Protocol(format!(
            "bad boolean {raw:?} for key {key:?}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(msg: Message) {
        let wire = encode(&msg);
        let mut dec = Decoder::new();
        dec.feed(wire.as_bytes());
        let got = dec.decode_next().unwrap().unwrap();
        assert_eq!(got, msg);
        assert_eq!(dec.pending(), 0);
    }

    #[test]
    fn test_roundtrip_all_shapes() {
        roundtrip(Message::Show);
        roundtrip(Message::Quit);
        roundtrip(Message::Exiting);
        roundtrip(Message::UiTitle {
            title: "My Plugin".into(),
        });
        roundtrip(Message::Configure {
            key: "reuse-ui-host".into(),
            value: "yes".into(),
        });
        roundtrip(Message::Control {
            index: 7,
            value: 0.25,
        });
        roundtrip(Message::Program { index: 3 });
        roundtrip(Message::MidiProgram {
            bank: 1,
            program: 42,
        });
        roundtrip(Message::Note {
            on: true,
            channel: 0,
            note: 60,
            velocity: 100,
        });
        roundtrip(Message::Urid {
            urid: 12,
            uri: "urn:example:atom".into(),
        });
        roundtrip(Message::UiOptions {
            sample_rate: 48000.0,
            use_theme: false,
            window_title: "title".into(),
            transient_window_id: 0xdead,
        });
        roundtrip(Message::Init);
        roundtrip(Message::End);
        roundtrip(Message::Field {
            key: RecordKey::Name,
            value: "Gain".into(),
        });
        roundtrip(Message::Notify {
            severity: Severity::Warning,
            text: "not hard real-time capable".into(),
        });
    }

    #[test]
    fn test_roundtrip_float_exactness() {
        // shortest-roundtrip float formatting must survive the wire
        roundtrip(Message::Control {
            index: 0,
            value: 0.1,
        });
        roundtrip(Message::Control {
            index: 1,
            value: f32::MIN_POSITIVE,
        });
        roundtrip(Message::UiOptions {
            sample_rate: 44100.5,
            use_theme: true,
            window_title: String::new(),
            transient_window_id: 0,
        });
    }

    #[test]
    fn test_string_with_newlines_survives() {
        roundtrip(Message::Notify {
            severity: Severity::Error,
            text: "line one\nline two\r\nwith \\backslash\\".into(),
        });
        roundtrip(Message::Configure {
            key: "multi\nline".into(),
            value: "\\n is not a newline".into(),
        });
    }

    #[test]
    fn test_atom_roundtrip() {
        roundtrip(Message::Atom {
            port_index: 2,
            data: (0u8..=255).collect(),
        });
        roundtrip(Message::Atom {
            port_index: 0,
            data: Vec::new(),
        });
    }

    #[test]
    fn test_atom_length_mismatch_rejected() {
        let mut wire = String::new();
        wire.push_str("atom\n0\n16\n");
        wire.push_str(&BASE64.encode([1u8, 2, 3, 4]));
        wire.push('\n');

        let mut dec = Decoder::new();
        dec.feed(wire.as_bytes());
        let err = dec.decode_next().unwrap_err();
        assert!(matches!(err, BridgeError::Protocol(_)), "{err}");
    }

    #[test]
    fn test_incomplete_message_buffers() {
        let wire = encode(&Message::Configure {
            key: "k".into(),
            value: "v".into(),
        });
        let mut dec = Decoder::new();

        // feed everything except the last line
        let cut = wire.len() - 2;
        dec.feed(&wire.as_bytes()[..cut]);
        assert!(dec.decode_next().unwrap().is_none());

        dec.feed(&wire.as_bytes()[cut..]);
        assert_eq!(
            dec.decode_next().unwrap().unwrap(),
            Message::Configure {
                key: "k".into(),
                value: "v".into()
            }
        );
    }

    #[test]
    fn test_unknown_key_rejected_channel_survives() {
        let mut dec = Decoder::new();
        dec.feed(b"reticulate\nshow\n");
        assert!(dec.decode_next().is_err());
        // next message is still decodable
        assert_eq!(dec.decode_next().unwrap().unwrap(), Message::Show);
    }

    #[test]
    fn test_bad_typed_argument_rejected() {
        let mut dec = Decoder::new();
        dec.feed(b"control\nnot-a-number\n1.0\nfocus\n");
        assert!(dec.decode_next().is_err());
        assert_eq!(dec.decode_next().unwrap().unwrap(), Message::Focus);
    }

    #[test]
    fn test_back_to_back_messages() {
        let mut dec = Decoder::new();
        let mut wire = encode(&Message::Init);
        wire.push_str(&encode(&Message::Field {
            key: RecordKey::Name,
            value: "A".into(),
        }));
        wire.push_str(&encode(&Message::End));
        dec.feed(wire.as_bytes());

        assert_eq!(dec.decode_next().unwrap().unwrap(), Message::Init);
        assert_eq!(
            dec.decode_next().unwrap().unwrap(),
            Message::Field {
                key: RecordKey::Name,
                value: "A".into()
            }
        );
        assert_eq!(dec.decode_next().unwrap().unwrap(), Message::End);
        assert!(dec.decode_next().unwrap().is_none());
    }
}
