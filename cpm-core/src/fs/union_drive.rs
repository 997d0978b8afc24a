//! Union of a host directory and the embedded read-only volume.
//!
//! Reads and listings see both; the host copy wins on name collision; writes
//! and deletes pass straight through to the host (the embedded volume is
//! never mutated — see `virtual_volume::VirtualVolumeFS`).

use super::drive_fs::{to_8_3, DriveFS};
use super::virtual_volume::VirtualVolumeFS;
use crate::error::CpmResult;

/// `DriveFS` composing a host-backed base with the embedded volume as a
/// read-only fallback.
pub struct UnionDriveFS<B: DriveFS> {
    host: B,
    virtual_fs: VirtualVolumeFS,
}

impl<B: DriveFS> UnionDriveFS<B> {
    pub fn new(host: B) -> Self {
        Self {
            host,
            virtual_fs: VirtualVolumeFS,
        }
    }

    pub fn host(&self) -> &B {
        &self.host
    }

    pub fn host_mut(&mut self) -> &mut B {
        &mut self.host
    }
}

impl<B: DriveFS> DriveFS for UnionDriveFS<B> {
    fn read_file(&self, name: &str) -> Option<Vec<u8>> {
        self.host
            .read_file(name)
            .or_else(|| self.virtual_fs.read_file(name))
    }

    fn write_file(&mut self, name: &str, data: &[u8]) -> CpmResult<()> {
        self.host.write_file(name, data)
    }

    fn delete_file(&mut self, name: &str) -> bool {
        self.host.delete_file(name)
    }

    fn list_files(&self) -> Vec<String> {
        let mut names: Vec<String> = self.host.list_files();
        let host_set: std::collections::HashSet<String> = names.iter().cloned().collect();
        for name in self.virtual_fs.list_files() {
            if !host_set.contains(&to_8_3(&name)) {
                names.push(name);
            }
        }
        names.sort();
        names.dedup();
        names
    }

    fn exists(&self, name: &str) -> bool {
        self.host.exists(name) || self.virtual_fs.exists(name)
    }

    fn is_read_only_file(&self, name: &str) -> bool {
        !self.host.exists(name) && self.virtual_fs.exists(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::MemoryDriveFS;

    #[test]
    fn host_entry_wins_on_collision() {
        let mut host = MemoryDriveFS::new();
        host.add_file("CTRLC.COM", vec![0xAA]);
        let union = UnionDriveFS::new(host);
        assert_eq!(union.read_file("CTRLC.COM"), Some(vec![0xAA]));
    }

    #[test]
    fn virtual_entry_visible_when_absent_from_host() {
        let host = MemoryDriveFS::new();
        let union = UnionDriveFS::new(host);
        assert!(union.exists("CTRLC.COM"));
        assert!(union.list_files().contains(&"CTRLC.COM".to_string()));
    }
}
