//! Engine settings
//!
//! Settings live in a TOML file, by default `<config dir>/cdb-engine/settings.toml`.
//! A missing file is not an error: every field has a default.

use std::{
    borrow::Cow,
    io,
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};

/// Directory below the platform configuration directory.
pub const APPLICATION_DIRECTORY: &str = "cdb-engine";

/// Name of the settings file.
pub const SETTINGS_FILE: &str = "settings.toml";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("reading settings file {path}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("writing settings file {path}")]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("parsing settings file {path}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("serializing settings")]
    Serialize(#[from] toml::ser::Error),
}

/// Maps a path prefix as seen by the debugger (for example a build machine
/// directory) to where the sources live locally.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourcePathMapping {
    pub debugger: String,
    pub source: String,
}

impl SourcePathMapping {
    pub fn new(debugger: impl Into<String>, source: impl Into<String>) -> Self {
        Self {
            debugger: debugger.into(),
            source: source.into(),
        }
    }
}

/// Settings shared by every debugging session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Path to `cdb.exe`; looked up on `PATH` when unset
    pub cdb_executable: Option<PathBuf>,

    /// Directory containing the helper extension library
    pub extension_directory: Option<PathBuf>,

    /// Symbol search paths passed with `-y`
    pub symbol_paths: Vec<String>,

    /// Source search paths passed with `-srcpath`
    pub source_paths: Vec<String>,

    /// Extra command line arguments, split on whitespace
    pub additional_arguments: String,

    /// Commands run once the session is set up
    pub additional_commands: Vec<String>,

    /// Events to break on, passed to `sxe`
    pub break_events: Vec<String>,

    /// Pass `-x` so first chance access violations do not stop
    pub ignore_first_chance_access_violation: bool,

    /// Move file/line breakpoints to the nearest line with code
    pub breakpoint_correction: bool,

    /// Maximum length of strings displayed by the extension
    pub max_string_length: u32,

    pub source_path_mappings: Vec<SourcePathMapping>,

    /// Run the debuggee in its own console (`-2`)
    pub use_terminal: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            cdb_executable: None,
            extension_directory: None,
            symbol_paths: Vec::new(),
            source_paths: Vec::new(),
            additional_arguments: String::new(),
            additional_commands: Vec::new(),
            break_events: Vec::new(),
            ignore_first_chance_access_violation: false,
            breakpoint_correction: true,
            max_string_length: 10000,
            source_path_mappings: Vec::new(),
            use_terminal: false,
        }
    }
}

impl Settings {
    /// Expand `~` in every configured path.
    pub fn expand_paths(mut self) -> Self {
        let expand = |p: &mut PathBuf| {
            if let Cow::Owned(expanded) = normalise_path(p) {
                *p = expanded;
            }
        };
        if let Some(p) = self.cdb_executable.as_mut() {
            expand(p);
        }
        if let Some(p) = self.extension_directory.as_mut() {
            expand(p);
        }
        for mapping in &mut self.source_path_mappings {
            if let Cow::Owned(expanded) = normalise_path(Path::new(&mapping.source)) {
                mapping.source = expanded.display().to_string();
            }
        }
        self
    }
}

/// Location of the default settings file.
pub fn default_path() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join(APPLICATION_DIRECTORY).join(SETTINGS_FILE))
}

/// Load settings from the default location, falling back to defaults.
pub fn load() -> Result<Settings, ConfigError> {
    match default_path() {
        Some(path) => load_from(path),
        None => {
            tracing::warn!("cannot determine configuration directory, using default settings");
            Ok(Settings::default())
        }
    }
}

/// Load settings from `path`; a missing file yields the defaults.
pub fn load_from(path: impl AsRef<Path>) -> Result<Settings, ConfigError> {
    let path = path.as_ref();
    let contents = match std::fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            tracing::debug!(path = %path.display(), "no settings file, using defaults");
            return Ok(Settings::default());
        }
        Err(source) => {
            return Err(ConfigError::Read {
                path: path.to_path_buf(),
                source,
            });
        }
    };
    let settings: Settings = toml::from_str(&contents).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })?;
    tracing::debug!(path = %path.display(), "settings loaded");
    Ok(settings.expand_paths())
}

/// Write settings to `path`, creating parent directories.
pub fn save_to(settings: &Settings, path: impl AsRef<Path>) -> Result<(), ConfigError> {
    let path = path.as_ref();
    let contents = toml::to_string_pretty(settings)?;
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|source| ConfigError::Write {
            path: parent.to_path_buf(),
            source,
        })?;
    }
    std::fs::write(path, contents).map_err(|source| ConfigError::Write {
        path: path.to_path_buf(),
        source,
    })
}

/// Expand a leading `~` to the home directory.
pub fn normalise_path(path: &Path) -> Cow<'_, Path> {
    if let Ok(stripped) = path.strip_prefix("~") {
        if let Some(home) = dirs::home_dir() {
            return Cow::Owned(home.join(stripped));
        }
        tracing::warn!("cannot determine home directory, using path as-is");
    }
    Cow::Borrowed(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let settings = load_from(dir.path().join("absent.toml")).unwrap();
        assert_eq!(settings, Settings::default());
        assert!(settings.breakpoint_correction);
    }

    #[test]
    fn partial_file_keeps_other_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(SETTINGS_FILE);
        std::fs::write(
            &path,
            r#"
symbol_paths = ["srv*C:\\symbols*https://msdl.microsoft.com/download/symbols"]
break_events = ["eh", "ld:app.dll"]
use_terminal = true

[[source_path_mappings]]
debugger = "X:\\build"
source = "C:\\src"
"#,
        )
        .unwrap();

        let settings = load_from(&path).unwrap();
        assert_eq!(settings.symbol_paths.len(), 1);
        assert_eq!(settings.break_events, vec!["eh", "ld:app.dll"]);
        assert!(settings.use_terminal);
        assert_eq!(
            settings.source_path_mappings,
            vec![SourcePathMapping::new("X:\\build", "C:\\src")]
        );
        assert_eq!(settings.max_string_length, 10000);
    }

    #[test]
    fn invalid_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(SETTINGS_FILE);
        std::fs::write(&path, "use_terminal = \"perhaps\"").unwrap();
        assert!(matches!(load_from(&path), Err(ConfigError::Parse { .. })));
    }

    #[test]
    fn save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join(SETTINGS_FILE);
        let settings = Settings {
            additional_commands: vec![".reload".to_string()],
            max_string_length: 256,
            ..Default::default()
        };
        save_to(&settings, &path).unwrap();
        assert_eq!(load_from(&path).unwrap(), settings);
    }

    #[test]
    fn tilde_expansion() {
        if let Some(home) = dirs::home_dir() {
            let path = PathBuf::from("~").join("cdb");
            assert_eq!(normalise_path(&path), Cow::<Path>::Owned(home.join("cdb")));
        }
        let absolute = Path::new("/opt/cdb");
        assert_eq!(normalise_path(absolute), Cow::Borrowed(absolute));
    }
}
