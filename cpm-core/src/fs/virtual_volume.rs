//! Embedded read-only volume.
//!
//! A fixed table of files exposed as extra directory entries on every drive.
//! Entries are never writable; `UnionDriveFS` layers a host directory over
//! this as a fallback.

use crate::error::{CpmError, CpmResult};
use crate::fs::DriveFS;

/// One embedded file: CP/M-style upper-case name and its bytes.
pub struct VirtualEntry {
    pub name: &'static str,
    pub bytes: &'static [u8],
}

/// `CTRLC.COM`: `DI ; HALT` — a minimal placeholder program that simply
/// halts the CPU, standing in for a real sample program binary (the actual
/// bytes of any bundled sample program are supplied by the embedding
/// application, not by this emulator core).
const CTRLC_COM: &[u8] = &[0xF3, 0x76];

/// The embedded volume. Extend this table to bundle more sample programs.
pub static VOLUME: &[VirtualEntry] = &[VirtualEntry {
    name: "CTRLC.COM",
    bytes: CTRLC_COM,
}];

/// Look up an embedded file by CP/M-style name (case-insensitive).
pub fn lookup(name: &str) -> Option<&'static VirtualEntry> {
    let upper = name.to_ascii_uppercase();
    VOLUME.iter().find(|e| e.name == upper)
}

/// A read-only `DriveFS` over the embedded volume.
#[derive(Debug, Clone, Copy, Default)]
pub struct VirtualVolumeFS;

impl DriveFS for VirtualVolumeFS {
    fn read_file(&self, name: &str) -> Option<Vec<u8>> {
        lookup(name).map(|e| e.bytes.to_vec())
    }

    fn write_file(&mut self, _name: &str, _data: &[u8]) -> CpmResult<()> {
        Err(CpmError::ReadOnly)
    }

    fn delete_file(&mut self, _name: &str) -> bool {
        false
    }

    fn list_files(&self) -> Vec<String> {
        VOLUME.iter().map(|e| e.name.to_string()).collect()
    }

    fn exists(&self, name: &str) -> bool {
        lookup(name).is_some()
    }

    fn is_read_only_file(&self, name: &str) -> bool {
        lookup(name).is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_is_case_insensitive() {
        assert!(lookup("ctrlc.com").is_some());
        assert!(lookup("NOPE.COM").is_none());
    }

    #[test]
    fn writes_are_read_only_errors() {
        let mut fs = VirtualVolumeFS;
        assert!(matches!(fs.write_file("CTRLC.COM", &[]), Err(CpmError::ReadOnly)));
    }
}
