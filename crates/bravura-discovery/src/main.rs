//! Scanner binary. Spawned per candidate by the host-side prober, or run
//! by hand in text mode:
//!
//! ```text
//! bravura-discovery <format> <path>                      # text mode
//! bravura-discovery <format> <path> <fd> <fd> <fd> <fd>  # pipe mode
//! ```

use bravura_bridge::ControlPipe;
use bravura_discovery::{scan, LibraryProbe, PluginFormat, ReportSink};
use std::path::PathBuf;
use std::time::Duration;

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    // loader error text must stay pattern-matchable upstream
    std::env::set_var("LC_ALL", "C");

    std::process::exit(run());
}

fn usage() -> i32 {
    eprintln!("usage: bravura-discovery <format> <path> [<fd> <fd> <fd> <fd>]");
    eprintln!("formats: ladspa dssi lv2 vst2 vst3 clap");
    1
}

fn run() -> i32 {
    let args: Vec<String> = std::env::args().skip(1).collect();

    let (format_arg, path_arg, pipe_args) = match args.as_slice() {
        [format, path] => (format, path, None),
        [format, path, rest @ ..] if rest.len() == 4 => (format, path, Some(rest)),
        _ => return usage(),
    };

    let format: PluginFormat = match format_arg.parse() {
        Ok(format) => format,
        Err(e) => {
            eprintln!("{e}");
            return usage();
        }
    };
    let path = PathBuf::from(path_arg);

    let mut sink = match pipe_args {
        Some(rest) => match ControlPipe::from_inherited_args(rest) {
            Ok(pipe) => ReportSink::Pipe(pipe),
            Err(e) => {
                eprintln!("cannot attach to parent pipe: {e}");
                return 1;
            }
        },
        None => ReportSink::Text,
    };

    let exercise = std::env::var("BRAVURA_DISCOVERY_NO_INIT").as_deref() != Ok("1");

    let mut probe = LibraryProbe::new(format);
    if let Err(e) = scan(format, &path, &mut probe, exercise, &mut sink) {
        // a sink failure means the parent is gone; nothing left to report to
        tracing::error!(error = %e, "scan aborted");
        return 1;
    }

    if let ReportSink::Pipe(mut pipe) = sink {
        if !pipe.close_gracefully(Duration::from_secs(2)) {
            tracing::debug!("parent did not acknowledge shutdown");
        }
    }

    0
}
