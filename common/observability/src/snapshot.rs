//! Mounted configuration sources.
//!
//! A mount directory holds one subdirectory per source (for example
//! `/etc/config/config-logging`). Every regular, non-hidden file inside a
//! source is one key, and its contents are the value. This is how Kubernetes
//! projects a ConfigMap volume: the visible files are symlinks through a
//! hidden `..data` directory, which is swapped atomically on update.

use std::fs;
use std::io;
use std::path::Path;

use tracing::debug;

use crate::aspect::ConfigData;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConfigSnapshot {
    pub name: String,
    pub data: ConfigData,
}

impl ConfigSnapshot {
    pub fn new(name: impl Into<String>, data: ConfigData) -> Self {
        Self {
            name: name.into(),
            data,
        }
    }

    pub fn empty(name: impl Into<String>) -> Self {
        Self::new(name, ConfigData::new())
    }
}

/// Read one source directory. A missing directory yields an empty snapshot.
pub fn load_source(mount: &Path, name: &str) -> io::Result<ConfigSnapshot> {
    let dir = mount.join(name);
    let entries = match fs::read_dir(&dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(ConfigSnapshot::empty(name)),
        Err(e) => return Err(e),
    };

    let mut data = ConfigData::new();
    for entry in entries {
        let entry = entry?;
        let Some(key) = entry.file_name().to_str().map(str::to_string) else {
            continue;
        };
        if is_hidden(&key) {
            continue;
        }
        // fs::metadata follows the ConfigMap symlinks.
        let path = entry.path();
        match fs::metadata(&path) {
            Ok(meta) if meta.is_file() => {}
            Ok(_) => continue,
            Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
            Err(e) => return Err(e),
        }
        let value = fs::read_to_string(&path)?;
        data.insert(key, value.trim_end().to_string());
    }

    debug!(source = name, keys = data.len(), "loaded config source");
    Ok(ConfigSnapshot::new(name, data))
}

/// Read every source under `mount`, sorted by name. A missing mount
/// directory yields no snapshots.
pub fn load_mount(mount: &Path) -> io::Result<Vec<ConfigSnapshot>> {
    let entries = match fs::read_dir(mount) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            debug!(mount = %mount.display(), "config mount not found, using defaults");
            return Ok(Vec::new());
        }
        Err(e) => return Err(e),
    };

    let mut names = Vec::new();
    for entry in entries {
        let entry = entry?;
        let Some(name) = entry.file_name().to_str().map(str::to_string) else {
            continue;
        };
        if !is_hidden(&name) && fs::metadata(entry.path())?.is_dir() {
            names.push(name);
        }
    }
    names.sort();

    names
        .iter()
        .map(|name| load_source(mount, name))
        .collect()
}

pub(crate) fn is_hidden(name: &str) -> bool {
    name.starts_with('.')
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write(dir: &Path, source: &str, key: &str, value: &str) {
        let source_dir = dir.join(source);
        fs::create_dir_all(&source_dir).unwrap();
        fs::write(source_dir.join(key), value).unwrap();
    }

    #[test]
    fn reads_sources_and_trims_values() {
        let mount = tempfile::tempdir().unwrap();
        write(mount.path(), "config-logging", "loglevel", "debug\n");
        write(mount.path(), "config-observability", "profiling.enable", "true");
        write(mount.path(), "config-observability", ".hidden", "ignored");

        let snapshots = load_mount(mount.path()).unwrap();
        assert_eq!(snapshots.len(), 2);
        assert_eq!(snapshots[0].name, "config-logging");
        assert_eq!(snapshots[0].data.get("loglevel").unwrap(), "debug");
        assert_eq!(snapshots[1].name, "config-observability");
        assert_eq!(snapshots[1].data.len(), 1);
    }

    #[test]
    fn missing_mount_yields_nothing() {
        let mount = tempfile::tempdir().unwrap();
        let snapshots = load_mount(&mount.path().join("absent")).unwrap();
        assert!(snapshots.is_empty());
    }

    #[test]
    fn missing_source_is_empty() {
        let mount = tempfile::tempdir().unwrap();
        let snapshot = load_source(mount.path(), "config-tracing").unwrap();
        assert_eq!(snapshot, ConfigSnapshot::empty("config-tracing"));
    }

    #[cfg(unix)]
    #[test]
    fn follows_configmap_symlinks() {
        let mount = tempfile::tempdir().unwrap();
        let source = mount.path().join("config-tracing");
        let data_dir = source.join("..2024_01_01");
        fs::create_dir_all(&data_dir).unwrap();
        fs::write(data_dir.join("backend"), "otlp").unwrap();
        std::os::unix::fs::symlink("..2024_01_01", source.join("..data")).unwrap();
        std::os::unix::fs::symlink("..data/backend", source.join("backend")).unwrap();

        let snapshot = load_source(mount.path(), "config-tracing").unwrap();
        assert_eq!(snapshot.data.len(), 1);
        assert_eq!(snapshot.data.get("backend").unwrap(), "otlp");
    }
}
