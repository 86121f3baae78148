//! Translating file names between the debugger and the local checkout
use std::{
    collections::HashMap,
    ffi::{OsStr, OsString},
    path::{Component, Path, PathBuf},
};

use config::SourcePathMapping;

/// Ordered prefix mappings plus a cache of normalized file names.
///
/// The mappings are fixed for the life of a session.
#[derive(Debug, Default)]
pub struct SourceMapper {
    mappings: Vec<SourcePathMapping>,
    cache: HashMap<String, NormalizedFile>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NormalizedFile {
    pub path: String,
    /// The file exists locally
    pub usable: bool,
}

#[derive(Clone, Copy)]
enum Direction {
    ToSource,
    ToDebugger,
}

impl SourceMapper {
    /// Configured mappings take precedence over `extra` ones.
    pub fn new(configured: &[SourcePathMapping], extra: &[SourcePathMapping]) -> Self {
        Self {
            mappings: configured.iter().chain(extra).cloned().collect(),
            cache: HashMap::new(),
        }
    }

    pub fn mappings(&self) -> &[SourcePathMapping] {
        &self.mappings
    }

    /// Debugger file name to local file name.
    pub fn map_to_source(&self, file: &str) -> String {
        self.map(file, Direction::ToSource)
    }

    /// Local file name to debugger file name.
    pub fn map_to_debugger(&self, file: &str) -> String {
        self.map(file, Direction::ToDebugger)
    }

    fn map(&self, file: &str, direction: Direction) -> String {
        for mapping in &self.mappings {
            let (from, to) = match direction {
                Direction::ToSource => (&mapping.debugger, &mapping.source),
                Direction::ToDebugger => (&mapping.source, &mapping.debugger),
            };
            if from.is_empty() || file.len() <= from.len() || !file.is_char_boundary(from.len()) {
                continue;
            }
            let (head, tail) = file.split_at(from.len());
            if head.eq_ignore_ascii_case(from) && tail.starts_with(['\\', '/']) {
                return format!("{to}{tail}");
            }
        }
        file.to_string()
    }

    /// Map a debugger file name and fix up its case against the filesystem.
    ///
    /// Results are cached per debugger file name.
    pub fn normalize(&mut self, file: &str) -> NormalizedFile {
        if let Some(cached) = self.cache.get(file) {
            return cached.clone();
        }
        let mapped = self.map_to_source(file);
        let normalized = match case_normalized(Path::new(&mapped)) {
            Some(path) => NormalizedFile {
                usable: path.is_file(),
                path: path.display().to_string(),
            },
            None => NormalizedFile {
                path: uppercase_drive(mapped),
                usable: false,
            },
        };
        tracing::trace!(%file, path = %normalized.path, usable = normalized.usable, "normalized file name");
        self.cache.insert(file.to_string(), normalized.clone());
        normalized
    }
}

fn uppercase_drive(mut path: String) -> String {
    let bytes = path.as_bytes();
    if bytes.len() > 2 && bytes[1] == b':' && bytes[0].is_ascii_lowercase() {
        path[..1].make_ascii_uppercase();
    }
    path
}

/// The existing path matching `path` case-insensitively, spelled as on disk.
fn case_normalized(path: &Path) -> Option<PathBuf> {
    if !path.exists() {
        return None;
    }
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Normal(name) => {
                let parent = if out.as_os_str().is_empty() {
                    Path::new(".")
                } else {
                    out.as_path()
                };
                let on_disk = disk_name(parent, name);
                out.push(on_disk.as_deref().unwrap_or(name));
            }
            other => out.push(other.as_os_str()),
        }
    }
    Some(out)
}

fn disk_name(directory: &Path, name: &OsStr) -> Option<OsString> {
    let names: Vec<OsString> = std::fs::read_dir(directory)
        .ok()?
        .filter_map(Result::ok)
        .map(|entry| entry.file_name())
        .collect();
    if names.iter().any(|n| n == name) {
        return Some(name.to_os_string());
    }
    let wanted = name.to_string_lossy();
    names
        .into_iter()
        .find(|n| n.to_string_lossy().eq_ignore_ascii_case(&wanted))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mapper() -> SourceMapper {
        SourceMapper::new(
            &[SourcePathMapping::new(r"X:\build", r"C:\src")],
            &[SourcePathMapping::new(r"X:\", r"D:\other")],
        )
    }

    #[test]
    fn maps_case_insensitively_at_directory_boundaries() {
        let mapper = mapper();
        assert_eq!(mapper.map_to_source(r"x:\BUILD\main.cpp"), r"C:\src\main.cpp");
        assert_eq!(mapper.map_to_source(r"X:\build/lib/a.cpp"), r"C:\src/lib/a.cpp");
        // prefix must end at a separator
        assert_eq!(mapper.map_to_source(r"X:\builder\main.cpp"), r"X:\builder\main.cpp");
        assert_eq!(mapper.map_to_source(r"X:\build"), r"X:\build");
        assert_eq!(mapper.map_to_source(r"E:\main.cpp"), r"E:\main.cpp");
    }

    #[test]
    fn first_mapping_wins() {
        let mapper = SourceMapper::new(
            &[SourcePathMapping::new(r"X:\build", r"C:\first")],
            &[SourcePathMapping::new(r"X:\build", r"C:\second")],
        );
        assert_eq!(mapper.map_to_source(r"X:\build\a.cpp"), r"C:\first\a.cpp");
        assert_eq!(mapper.mappings().len(), 2);
    }

    #[test]
    fn maps_back_to_debugger() {
        let mapper = mapper();
        assert_eq!(mapper.map_to_debugger(r"c:\SRC\main.cpp"), r"X:\build\main.cpp");
    }

    #[test]
    fn missing_files_get_uppercase_drive() {
        let mut mapper = SourceMapper::default();
        let normalized = mapper.normalize(r"c:\nowhere\main.cpp");
        assert_eq!(normalized.path, r"C:\nowhere\main.cpp");
        assert!(!normalized.usable);
    }

    #[test]
    fn existing_files_are_usable_and_cached() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("main.cpp");
        std::fs::write(&file, "int main() {}").unwrap();
        let name = file.display().to_string();

        let mut mapper = SourceMapper::default();
        let normalized = mapper.normalize(&name);
        assert!(normalized.usable);
        assert_eq!(normalized.path, name);

        std::fs::remove_file(&file).unwrap();
        assert!(mapper.normalize(&name).usable);
    }
}
