//! File-handle cache and find-first/find-next state.
//!
//! One open file per FCB cache key, independent of how many copies of that
//! FCB the guest keeps in memory. See `Fcb::cache_key`. The whole file is
//! buffered in memory between open and close, matching `DriveFS`'s
//! whole-file `read_file`/`write_file` contract; `is_modified` tracks
//! whether the buffer needs writing back on close.

use std::collections::VecDeque;

/// One open file, keyed by FCB cache key.
pub struct FileHandle {
    pub drive: u8,
    pub filename: String,
    pub data: Vec<u8>,
    pub modified: bool,
    /// True for a file served out of the embedded read-only volume: writes
    /// to it are a fatal error, not merely an A=0xFF result.
    pub read_only: bool,
    /// True if this handle was opened against a `$$$.SUB` spool file — used
    /// by F_CLOSE's truncation rule.
    pub is_submit_spool: bool,
}

/// Cache of open file handles, keyed by `Fcb::cache_key`.
#[derive(Default)]
pub struct FileHandleCache {
    handles: std::collections::HashMap<u64, FileHandle>,
}

impl FileHandleCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: u64, handle: FileHandle) {
        self.handles.insert(key, handle);
    }

    pub fn get(&self, key: u64) -> Option<&FileHandle> {
        self.handles.get(&key)
    }

    pub fn get_mut(&mut self, key: u64) -> Option<&mut FileHandle> {
        self.handles.get_mut(&key)
    }

    pub fn remove(&mut self, key: u64) -> Option<FileHandle> {
        self.handles.remove(&key)
    }

    pub fn contains(&self, key: u64) -> bool {
        self.handles.contains_key(&key)
    }

    /// Evict every cached handle whose remembered filename matches `name`
    /// case-insensitively (used before F_MAKE/F_DELETE so a stale handle
    /// never outlives the file it names).
    pub fn evict_by_name(&mut self, name: &str) {
        let upper = name.to_ascii_uppercase();
        self.handles
            .retain(|_, h| h.filename.to_ascii_uppercase() != upper);
    }

    /// Drain every still-open handle, giving the caller a chance to flush
    /// modified ones back to their drive (used on program exit / warm boot).
    pub fn drain(&mut self) -> Vec<FileHandle> {
        self.handles.drain().map(|(_, h)| h).collect()
    }

    pub fn clear(&mut self) {
        self.handles.clear();
    }
}

/// Find-first/find-next state: a drained queue of not-yet-returned matches.
#[derive(Default)]
pub struct FindState {
    pending: VecDeque<String>,
    /// Drive index the current search was started against, so F_SNEXT
    /// looks up file sizes on the same drive F_SFIRST enumerated.
    drive: u8,
}

impl FindState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a new search against `drive`, replacing whatever was pending.
    pub fn start(&mut self, drive: u8, matches: Vec<String>) {
        self.drive = drive;
        self.pending = matches.into_iter().collect();
    }

    /// Pop the next match, if any.
    pub fn next(&mut self) -> Option<String> {
        self.pending.pop_front()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Drive the current search was started against.
    pub fn drive(&self) -> u8 {
        self.drive
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn find_state_drains_in_order() {
        let mut state = FindState::new();
        state.start(0, vec!["A.TXT".into(), "B.TXT".into()]);
        assert_eq!(state.next().as_deref(), Some("A.TXT"));
        assert_eq!(state.next().as_deref(), Some("B.TXT"));
        assert_eq!(state.next(), None);
        assert!(state.is_empty());
    }

    #[test]
    fn restarting_find_replaces_queue() {
        let mut state = FindState::new();
        state.start(0, vec!["OLD.TXT".into()]);
        state.start(2, vec!["NEW.TXT".into()]);
        assert_eq!(state.drive(), 2);
        assert_eq!(state.next().as_deref(), Some("NEW.TXT"));
        assert_eq!(state.next(), None);
    }

    #[test]
    fn evict_by_name_is_case_insensitive() {
        let mut cache = FileHandleCache::new();
        cache.insert(
            1,
            FileHandle {
                drive: 0,
                filename: "foo.txt".into(),
                data: Vec::new(),
                modified: false,
                read_only: false,
                is_submit_spool: false,
            },
        );
        cache.evict_by_name("FOO.TXT");
        assert!(!cache.contains(1));
    }
}
