//! Plugin format descriptions and the probing seam.
//!
//! Everything format-specific sits behind [`FormatProbe`]; the scan cycle
//! in `scanner` only ever talks to the trait. [`LibraryProbe`] covers the
//! uniform part every shared-library format has in common.

use crate::error::{DiscoveryError, Result};
use crate::record::PluginRecord;
use bravura_bridge::RecordKey;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PluginFormat {
    Ladspa,
    Dssi,
    Lv2,
    Vst2,
    Vst3,
    Clap,
}

impl PluginFormat {
    pub const ALL: [PluginFormat; 6] = [
        PluginFormat::Ladspa,
        PluginFormat::Dssi,
        PluginFormat::Lv2,
        PluginFormat::Vst2,
        PluginFormat::Vst3,
        PluginFormat::Clap,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            PluginFormat::Ladspa => "ladspa",
            PluginFormat::Dssi => "dssi",
            PluginFormat::Lv2 => "lv2",
            PluginFormat::Vst2 => "vst2",
            PluginFormat::Vst3 => "vst3",
            PluginFormat::Clap => "clap",
        }
    }

    /// Entry-point symbols, in the order they should be tried.
    pub fn entry_symbols(&self) -> &'static [&'static str] {
        match self {
            PluginFormat::Ladspa => &["ladspa_descriptor"],
            PluginFormat::Dssi => &["dssi_descriptor"],
            PluginFormat::Lv2 => &["lv2_descriptor", "lv2_lib_descriptor"],
            // older VST2 binaries only export the unprefixed name
            PluginFormat::Vst2 => &["VSTPluginMain", "main"],
            PluginFormat::Vst3 => &["GetPluginFactory"],
            PluginFormat::Clap => &["clap_entry"],
        }
    }

    /// Environment variable that overrides this format's search path.
    pub fn path_env(&self) -> &'static str {
        match self {
            PluginFormat::Ladspa => "BRAVURA_LADSPA_PATH",
            PluginFormat::Dssi => "BRAVURA_DSSI_PATH",
            PluginFormat::Lv2 => "BRAVURA_LV2_PATH",
            PluginFormat::Vst2 => "BRAVURA_VST2_PATH",
            PluginFormat::Vst3 => "BRAVURA_VST3_PATH",
            PluginFormat::Clap => "BRAVURA_CLAP_PATH",
        }
    }

    /// Colon-separated search paths: the env override when set, otherwise
    /// the conventional system locations.
    pub fn search_paths(&self) -> Vec<PathBuf> {
        if let Ok(joined) = std::env::var(self.path_env()) {
            return std::env::split_paths(&joined).collect();
        }

        let home = std::env::var("HOME").unwrap_or_default();
        let (user_dir, system_dir) = match self {
            PluginFormat::Ladspa => (".ladspa", "/usr/lib/ladspa"),
            PluginFormat::Dssi => (".dssi", "/usr/lib/dssi"),
            PluginFormat::Lv2 => (".lv2", "/usr/lib/lv2"),
            PluginFormat::Vst2 => (".vst", "/usr/lib/vst"),
            PluginFormat::Vst3 => (".vst3", "/usr/lib/vst3"),
            PluginFormat::Clap => (".clap", "/usr/lib/clap"),
        };

        vec![Path::new(&home).join(user_dir), PathBuf::from(system_dir)]
    }
}

impl fmt::Display for PluginFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PluginFormat {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "ladspa" => Ok(PluginFormat::Ladspa),
            "dssi" => Ok(PluginFormat::Dssi),
            "lv2" => Ok(PluginFormat::Lv2),
            "vst2" | "vst" => Ok(PluginFormat::Vst2),
            "vst3" => Ok(PluginFormat::Vst3),
            "clap" => Ok(PluginFormat::Clap),
            other => Err(format!("unknown plugin format {other:?}")),
        }
    }
}

/// Format-specific probing operations for one candidate binary.
///
/// `open` and `close` bracket every other call. Unit indices are
/// `0..unit_count()`.
pub trait FormatProbe {
    fn open(&mut self, path: &Path) -> Result<()>;

    fn unit_count(&self) -> usize;

    /// Metadata for one unit. Must not run plugin code beyond what
    /// enumeration requires.
    fn introspect_unit(&mut self, index: usize) -> Result<PluginRecord>;

    /// Bounded behavioral check: instantiate, process a little silence,
    /// release. `sample_rate` and `block_size` are the fixed exercise
    /// parameters.
    fn exercise_unit(&mut self, index: usize, sample_rate: f64, block_size: usize) -> Result<()>;

    fn close(&mut self);
}

/// The uniform shared-library probe: load the binary, confirm the format's
/// entry symbol resolves, and report one conservatively-described unit per
/// matched symbol.
pub struct LibraryProbe {
    format: PluginFormat,
    library: Option<libloading::Library>,
    matched_symbols: Vec<&'static str>,
    path: PathBuf,
}

impl LibraryProbe {
    pub fn new(format: PluginFormat) -> Self {
        Self {
            format,
            library: None,
            matched_symbols: Vec::new(),
            path: PathBuf::new(),
        }
    }

    fn symbol_exists(library: &libloading::Library, name: &str) -> bool {
        // resolution only, the pointer is never called
        unsafe { library.get::<*const ()>(name.as_bytes()).is_ok() }
    }
}

impl FormatProbe for LibraryProbe {
    fn open(&mut self, path: &Path) -> Result<()> {
        // loader error text is kept verbatim so the parent can recognize
        // architecture mismatches
        let library = unsafe {
            libloading::Library::new(path).map_err(|e| DiscoveryError::Load(e.to_string()))?
        };

        self.matched_symbols = self
            .format
            .entry_symbols()
            .iter()
            .copied()
            .filter(|name| Self::symbol_exists(&library, name))
            .collect();

        if self.matched_symbols.is_empty() {
            return Err(DiscoveryError::Load(format!(
                "no {} entry point in {}",
                self.format,
                path.display()
            )));
        }

        self.path = path.to_path_buf();
        self.library = Some(library);
        Ok(())
    }

    fn unit_count(&self) -> usize {
        self.matched_symbols.len()
    }

    fn introspect_unit(&mut self, index: usize) -> Result<PluginRecord> {
        let symbol = self
            .matched_symbols
            .get(index)
            .ok_or_else(|| DiscoveryError::Load(format!("unit index {index} out of range")))?;

        let stem = self
            .path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();

        let mut record = PluginRecord::default();
        record.set(RecordKey::Build, "native");
        record.set(RecordKey::Hints, "0");
        record.set(RecordKey::Category, "none");
        record.set(RecordKey::Name, stem.clone());
        record.set(RecordKey::Label, format!("{stem}:{symbol}"));
        record.set(RecordKey::UniqueId, "0");
        Ok(record)
    }

    fn exercise_unit(&mut self, index: usize, _sample_rate: f64, _block_size: usize) -> Result<()> {
        // the uniform exercise is a clean reload cycle; running arbitrary
        // entry points without the format's ABI would be undefined behavior
        if index >= self.matched_symbols.len() {
            return Err(DiscoveryError::Load(format!(
                "unit index {index} out of range"
            )));
        }
        let reloaded = unsafe {
            libloading::Library::new(&self.path).map_err(|e| DiscoveryError::Load(e.to_string()))?
        };
        if !Self::symbol_exists(&reloaded, self.matched_symbols[index]) {
            return Err(DiscoveryError::Load(format!(
                "entry point {} vanished on reload",
                self.matched_symbols[index]
            )));
        }
        drop(reloaded);
        Ok(())
    }

    fn close(&mut self) {
        self.library = None;
        self.matched_symbols.clear();
    }
}
