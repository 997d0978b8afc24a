//! DriveFS trait - low-level filesystem interface for CP/M drives.

use std::path::{Path, PathBuf};

use crate::error::{CpmError, CpmResult};

/// Filesystem interface for a single CP/M drive (A-P).
/// All filenames are normalized to CP/M 8.3 format.
pub trait DriveFS: Send + Sync {
    /// Read file content. Returns None if file does not exist.
    fn read_file(&self, name: &str) -> Option<Vec<u8>>;

    /// Write file content.
    fn write_file(&mut self, name: &str, data: &[u8]) -> CpmResult<()>;

    /// Delete a file. Returns true if file existed and was deleted.
    fn delete_file(&mut self, name: &str) -> bool;

    /// List all files on this drive.
    fn list_files(&self) -> Vec<String>;

    /// Check if file exists.
    fn exists(&self, name: &str) -> bool;

    /// Whether a write to `name` should be treated as a fatal error rather
    /// than a soft failure — true for a file served from a read-only
    /// backing with no writable shadow (see `VirtualVolumeFS`).
    fn is_read_only_file(&self, _name: &str) -> bool {
        false
    }
}

/// Convert filename to CP/M 8.3 format.
///
/// - Uppercases everything
/// - Truncates name to 8 chars, extension to 3 chars
/// - Removes invalid characters
///
/// # Examples
/// ```
/// use cpm_core::to_8_3;
/// assert_eq!(to_8_3("hello.txt"), "HELLO.TXT");
/// assert_eq!(to_8_3("VeryLongName.extension"), "VERYLONG.EXT");
/// assert_eq!(to_8_3("noext"), "NOEXT");
/// ```
pub fn to_8_3(filename: &str) -> String {
    let upper = filename.to_uppercase();
    let (name, ext) = match upper.rfind('.') {
        Some(pos) => (&upper[..pos], &upper[pos + 1..]),
        None => (upper.as_str(), ""),
    };

    // Valid CP/M characters: A-Z, 0-9, $ # @ ! % ' ` ( ) { } ~ ^ - _
    fn clean(s: &str) -> String {
        s.chars()
            .filter(|c| c.is_ascii_alphanumeric() || "$#@!%'`(){}~^-_".contains(*c))
            .collect()
    }

    let clean_name: String = clean(name).chars().take(8).collect();
    let clean_ext: String = clean(ext).chars().take(3).collect();

    // Name must be at least 1 char
    let final_name = if clean_name.is_empty() {
        "_".to_string()
    } else {
        clean_name
    };

    if clean_ext.is_empty() {
        final_name
    } else {
        format!("{}.{}", final_name, clean_ext)
    }
}

/// A `DriveFS` backed by a real host directory.
///
/// Filenames are resolved case-insensitively: if a directory entry matches
/// the requested name ignoring case, its actual on-disk spelling is used.
#[derive(Debug, Clone)]
pub struct HostDriveFS {
    root: PathBuf,
}

impl HostDriveFS {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve `name` (CP/M-style, e.g. `FOO.TXT`) to a host path, preferring
    /// an existing entry whose case differs from the request.
    pub fn resolve(&self, name: &str) -> PathBuf {
        if let Some(actual) = self.find_case_insensitive(name) {
            return self.root.join(actual);
        }
        self.root.join(name)
    }

    fn find_case_insensitive(&self, name: &str) -> Option<String> {
        let target = name.to_ascii_uppercase();
        let entries = std::fs::read_dir(&self.root).ok()?;
        for entry in entries.flatten() {
            let entry_name = entry.file_name().to_str()?.to_string();
            if entry_name.to_ascii_uppercase() == target {
                return Some(entry_name);
            }
        }
        None
    }
}

impl DriveFS for HostDriveFS {
    fn read_file(&self, name: &str) -> Option<Vec<u8>> {
        std::fs::read(self.resolve(name)).ok()
    }

    fn write_file(&mut self, name: &str, data: &[u8]) -> CpmResult<()> {
        std::fs::write(self.resolve(name), data).map_err(CpmError::from)
    }

    fn delete_file(&mut self, name: &str) -> bool {
        std::fs::remove_file(self.resolve(name)).is_ok()
    }

    fn list_files(&self) -> Vec<String> {
        let Ok(entries) = std::fs::read_dir(&self.root) else {
            return Vec::new();
        };
        entries
            .flatten()
            .filter(|e| e.path().is_file())
            .filter_map(|e| e.file_name().to_str().map(|s| s.to_ascii_uppercase()))
            .collect()
    }

    fn exists(&self, name: &str) -> bool {
        self.resolve(name).is_file()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_to_8_3_basic() {
        assert_eq!(to_8_3("hello.txt"), "HELLO.TXT");
        assert_eq!(to_8_3("HELLO.TXT"), "HELLO.TXT");
    }

    #[test]
    fn test_to_8_3_truncation() {
        assert_eq!(to_8_3("verylongname.extension"), "VERYLONG.EXT");
    }

    #[test]
    fn test_to_8_3_no_extension() {
        assert_eq!(to_8_3("noext"), "NOEXT");
    }

    #[test]
    fn test_to_8_3_special_chars() {
        assert_eq!(to_8_3("test$file.com"), "TEST$FIL.COM");
        assert_eq!(to_8_3("hello world.txt"), "HELLOWOR.TXT"); // space removed, truncated to 8
    }

    #[test]
    fn test_to_8_3_empty_name() {
        assert_eq!(to_8_3(".txt"), "_.TXT");
    }

    #[test]
    fn host_drive_fs_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let mut fs = HostDriveFS::new(dir.path());
        fs.write_file("HELLO.TXT", b"hi").unwrap();
        assert!(fs.exists("HELLO.TXT"));
        assert_eq!(fs.read_file("hello.txt"), Some(b"hi".to_vec()));
        assert!(fs.delete_file("HELLO.TXT"));
        assert!(!fs.exists("HELLO.TXT"));
    }

    #[test]
    fn host_drive_fs_case_insensitive_resolution() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("MixedCase.txt"), b"data").unwrap();
        let fs = HostDriveFS::new(dir.path());
        assert_eq!(fs.read_file("MIXEDCASE.TXT"), Some(b"data".to_vec()));
    }
}
