//! Child-side scan cycle.
//!
//! Runs inside the scanner process, far away from the host: whatever a
//! plugin binary does on load here, the host only ever observes a dead
//! pipe. Results stream out record by record, so everything reported
//! before a crash survives it.

use crate::error::{DiscoveryError, Result};
use crate::format::{FormatProbe, PluginFormat};
use bravura_bridge::{ControlPipe, Message, Severity};
use std::io::Write;
use std::path::Path;

/// Exercise parameters for the behavioral pass.
pub const EXERCISE_SAMPLE_RATE: f64 = 44100.0;
pub const EXERCISE_BLOCK_SIZE: usize = 1024;

/// Prefix for text-mode output lines.
pub const TEXT_PREFIX: &str = "bravura-discovery";

/// Where scan output goes. Pipe mode talks the wire protocol back to a
/// waiting parent; text mode prints greppable lines for manual runs. Both
/// carry the identical message vocabulary.
pub enum ReportSink {
    Pipe(ControlPipe),
    Text,
    /// In-memory sink for tests.
    Capture(Vec<Message>),
}

impl ReportSink {
    pub fn emit(&mut self, msg: &Message) -> Result<()> {
        match self {
            ReportSink::Pipe(pipe) => pipe.send(msg).map_err(DiscoveryError::Bridge),
            ReportSink::Text => {
                let mut stdout = std::io::stdout().lock();
                writeln!(stdout, "{}", text_line(msg))?;
                Ok(())
            }
            ReportSink::Capture(messages) => {
                messages.push(msg.clone());
                Ok(())
            }
        }
    }

    fn error(&mut self, text: impl Into<String>) -> Result<()> {
        self.emit(&Message::Notify {
            severity: Severity::Error,
            text: text.into(),
        })
    }

    fn warning(&mut self, text: impl Into<String>) -> Result<()> {
        self.emit(&Message::Notify {
            severity: Severity::Warning,
            text: text.into(),
        })
    }
}

/// Text-mode rendering: `bravura-discovery::key` or
/// `bravura-discovery::key::arg[::arg...]`. Empty argument values render
/// as an empty trailing segment, same as on the pipe.
fn text_line(msg: &Message) -> String {
    let encoded = bravura_bridge::encode(msg);
    let mut parts: Vec<&str> = encoded.split('\n').collect();
    // the final element is the artifact of the trailing newline
    parts.pop();
    format!("{TEXT_PREFIX}::{}", parts.join("::"))
}

/// Scan one candidate binary and stream results into `sink`.
///
/// A binary that fails to load or exposes no entry point is a completed
/// scan attempt: the loader text goes out as an error notification and the
/// function returns `Ok`. Only sink failures (a vanished parent) surface
/// as errors.
pub fn scan(
    format: PluginFormat,
    path: &Path,
    probe: &mut dyn FormatProbe,
    exercise: bool,
    sink: &mut ReportSink,
) -> Result<()> {
    tracing::info!(%format, path = %path.display(), exercise, "scanning candidate");

    if let Err(e) = probe.open(path) {
        sink.error(e.to_string())?;
        return Ok(());
    }

    for index in 0..probe.unit_count() {
        let record = match probe.introspect_unit(index) {
            Ok(record) => record,
            Err(e) => {
                sink.warning(format!("unit {index}: {e}"))?;
                continue;
            }
        };

        if exercise {
            if let Err(e) = probe.exercise_unit(index, EXERCISE_SAMPLE_RATE, EXERCISE_BLOCK_SIZE) {
                sink.warning(format!("unit {index} failed its exercise pass: {e}"))?;
                continue;
            }
        }

        sink.emit(&Message::Init)?;
        for (key, value) in record.fields() {
            sink.emit(&Message::Field {
                key,
                value: value.to_string(),
            })?;
        }
        sink.emit(&Message::End)?;
    }

    probe.close();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::PluginRecord;
    use bravura_bridge::RecordKey;

    /// Scripted probe: a fixed set of units, some of which fail.
    struct FakeProbe {
        fail_open: Option<String>,
        units: Vec<(PluginRecord, bool)>,
    }

    impl FormatProbe for FakeProbe {
        fn open(&mut self, _path: &Path) -> Result<()> {
            match self.fail_open.take() {
                Some(text) => Err(DiscoveryError::Load(text)),
                None => Ok(()),
            }
        }

        fn unit_count(&self) -> usize {
            self.units.len()
        }

        fn introspect_unit(&mut self, index: usize) -> Result<PluginRecord> {
            Ok(self.units[index].0.clone())
        }

        fn exercise_unit(&mut self, index: usize, _: f64, _: usize) -> Result<()> {
            if self.units[index].1 {
                Ok(())
            } else {
                Err(DiscoveryError::Load("exercise blew up".into()))
            }
        }

        fn close(&mut self) {}
    }

    fn unit(name: &str) -> PluginRecord {
        let mut record = PluginRecord::default();
        record.set(RecordKey::Name, name);
        record
    }

    fn capture(sink: ReportSink) -> Vec<Message> {
        match sink {
            ReportSink::Capture(messages) => messages,
            _ => unreachable!(),
        }
    }

    #[test]
    fn test_load_failure_reports_error_and_completes() {
        let mut probe = FakeProbe {
            fail_open: Some("wrong ELF class: ELFCLASS32".into()),
            units: vec![],
        };
        let mut sink = ReportSink::Capture(Vec::new());
        scan(
            PluginFormat::Ladspa,
            Path::new("/x.so"),
            &mut probe,
            true,
            &mut sink,
        )
        .unwrap();

        let messages = capture(sink);
        assert_eq!(messages.len(), 1);
        assert!(matches!(
            &messages[0],
            Message::Notify { severity: Severity::Error, text } if text.contains("wrong ELF class")
        ));
    }

    #[test]
    fn test_failed_unit_keeps_earlier_records() {
        let mut probe = FakeProbe {
            fail_open: None,
            units: vec![(unit("good"), true), (unit("bad"), false), (unit("late"), true)],
        };
        let mut sink = ReportSink::Capture(Vec::new());
        scan(
            PluginFormat::Vst2,
            Path::new("/x.so"),
            &mut probe,
            true,
            &mut sink,
        )
        .unwrap();

        let messages = capture(sink);
        let inits = messages.iter().filter(|m| **m == Message::Init).count();
        let ends = messages.iter().filter(|m| **m == Message::End).count();
        let warnings = messages
            .iter()
            .filter(|m| matches!(m, Message::Notify { severity: Severity::Warning, .. }))
            .count();
        assert_eq!((inits, ends, warnings), (2, 2, 1));
    }

    #[test]
    fn test_inspection_only_skips_exercise() {
        let mut probe = FakeProbe {
            fail_open: None,
            // would fail if exercised
            units: vec![(unit("fragile"), false)],
        };
        let mut sink = ReportSink::Capture(Vec::new());
        scan(
            PluginFormat::Clap,
            Path::new("/x.clap"),
            &mut probe,
            false,
            &mut sink,
        )
        .unwrap();

        let messages = capture(sink);
        assert!(messages.contains(&Message::Init));
        assert!(messages.contains(&Message::End));
    }

    #[test]
    fn test_text_line_rendering() {
        assert_eq!(text_line(&Message::Init), "bravura-discovery::init");
        assert_eq!(
            text_line(&Message::Field {
                key: RecordKey::AudioOuts,
                value: "2".into()
            }),
            "bravura-discovery::audio.outs::2"
        );
        assert_eq!(
            text_line(&Message::Notify {
                severity: Severity::Warning,
                text: "careful".into()
            }),
            "bravura-discovery::warning::careful"
        );
    }

    #[test]
    fn test_text_line_keeps_empty_values() {
        assert_eq!(
            text_line(&Message::Field {
                key: RecordKey::Maker,
                value: String::new()
            }),
            "bravura-discovery::maker::"
        );
        assert_eq!(
            text_line(&Message::Configure {
                key: String::new(),
                value: "v".into()
            }),
            "bravura-discovery::configure::::v"
        );
    }
}
