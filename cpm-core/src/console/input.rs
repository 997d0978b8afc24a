//! Interchangeable keystroke sources.
//!
//! Each driver exposes the same small capability set; the emulator talks to
//! whichever one is active through `ConsoleInput` without knowing its
//! concrete type, the same pattern `DriveFS` uses for storage backends.

use std::collections::VecDeque;
use std::io::Read;
use std::sync::mpsc;
use std::time::Duration;

use crossterm::event::{self, Event, KeyCode, KeyEventKind, KeyModifiers};
use crossterm::terminal;

use crate::error::{CpmError, CpmResult};

/// A source of guest keystrokes, pluggable by name via `-input NAME[:OPTS]`.
pub trait ConsoleInput: Send {
    /// Prepare the driver (e.g. enter raw mode, spawn a poller).
    fn setup(&mut self) -> CpmResult<()> {
        Ok(())
    }

    /// Release whatever `setup` acquired.
    fn teardown(&mut self) -> CpmResult<()> {
        Ok(())
    }

    /// Is a byte available without blocking?
    fn pending(&mut self) -> bool;

    /// Block until a byte is available and return it, without echo.
    fn read_no_echo(&mut self) -> CpmResult<u8>;

    /// Driver name, as selected via `-input`/BIOS extension function 7.
    fn name(&self) -> &'static str;

    /// Push a string ahead of any live input; makes `pending()` true.
    fn stuff(&mut self, s: &str);

    fn set_cmd_prefix(&mut self, prefix: String);

    fn get_cmd_prefix(&self) -> &str;
}

/// Shared stuffing queue, embedded in every concrete driver below.
#[derive(Default)]
struct Stuffed {
    queue: VecDeque<u8>,
}

impl Stuffed {
    fn push(&mut self, s: &str) {
        self.queue.extend(s.as_bytes().iter().copied());
    }

    fn pop(&mut self) -> Option<u8> {
        self.queue.pop_front()
    }

    fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}

/// "stty": cooked mode for typing, raw only for the span of a single read.
#[derive(Default)]
pub struct CookedInput {
    stuffed: Stuffed,
    cmd_prefix: String,
}

impl CookedInput {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ConsoleInput for CookedInput {
    fn pending(&mut self) -> bool {
        if !self.stuffed.is_empty() {
            return true;
        }
        event::poll(Duration::from_millis(1)).unwrap_or(false)
    }

    fn read_no_echo(&mut self) -> CpmResult<u8> {
        if let Some(b) = self.stuffed.pop() {
            return Ok(b);
        }
        terminal::enable_raw_mode()?;
        let result = block_for_key_byte();
        terminal::disable_raw_mode()?;
        result
    }

    fn name(&self) -> &'static str {
        "stty"
    }

    fn stuff(&mut self, s: &str) {
        self.stuffed.push(s);
    }

    fn set_cmd_prefix(&mut self, prefix: String) {
        self.cmd_prefix = prefix;
    }

    fn get_cmd_prefix(&self) -> &str {
        &self.cmd_prefix
    }
}

/// "term": the terminal stays in raw mode for the driver's whole lifetime; a
/// background thread polls crossterm and feeds a byte queue.
pub struct RawBackgroundInput {
    stuffed: Stuffed,
    cmd_prefix: String,
    rx: Option<mpsc::Receiver<u8>>,
    stop: Option<mpsc::Sender<()>>,
    handle: Option<std::thread::JoinHandle<()>>,
    buffered: VecDeque<u8>,
}

impl Default for RawBackgroundInput {
    fn default() -> Self {
        Self {
            stuffed: Stuffed::default(),
            cmd_prefix: String::new(),
            rx: None,
            stop: None,
            handle: None,
            buffered: VecDeque::new(),
        }
    }
}

impl RawBackgroundInput {
    pub fn new() -> Self {
        Self::default()
    }

    fn drain_channel(&mut self) {
        let Some(rx) = &self.rx else { return };
        while let Ok(b) = rx.try_recv() {
            self.buffered.push_back(b);
        }
    }
}

impl ConsoleInput for RawBackgroundInput {
    fn setup(&mut self) -> CpmResult<()> {
        terminal::enable_raw_mode()?;
        let (tx, rx) = mpsc::channel::<u8>();
        let (stop_tx, stop_rx) = mpsc::channel::<()>();
        self.rx = Some(rx);
        self.stop = Some(stop_tx);
        self.handle = Some(std::thread::spawn(move || loop {
            if stop_rx.try_recv().is_ok() {
                return;
            }
            if let Ok(true) = event::poll(Duration::from_millis(10)) {
                if let Ok(Event::Key(key)) = event::read() {
                    if key.kind == KeyEventKind::Press {
                        if let Some(byte) = key_to_byte(key.code, key.modifiers) {
                            if tx.send(byte).is_err() {
                                return;
                            }
                        }
                    }
                }
            }
        }));
        Ok(())
    }

    fn teardown(&mut self) -> CpmResult<()> {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
        self.rx = None;
        terminal::disable_raw_mode()?;
        Ok(())
    }

    fn pending(&mut self) -> bool {
        if !self.stuffed.is_empty() || !self.buffered.is_empty() {
            return true;
        }
        self.drain_channel();
        !self.buffered.is_empty()
    }

    fn read_no_echo(&mut self) -> CpmResult<u8> {
        if let Some(b) = self.stuffed.pop() {
            return Ok(b);
        }
        loop {
            if let Some(b) = self.buffered.pop_front() {
                return Ok(b);
            }
            self.drain_channel();
            if self.buffered.is_empty() {
                std::thread::sleep(Duration::from_millis(1));
            }
        }
    }

    fn name(&self) -> &'static str {
        "term"
    }

    fn stuff(&mut self, s: &str) {
        self.stuffed.push(s);
    }

    fn set_cmd_prefix(&mut self, prefix: String) {
        self.cmd_prefix = prefix;
    }

    fn get_cmd_prefix(&self) -> &str {
        &self.cmd_prefix
    }
}

/// "file": replays `input.txt` (or `$INPUT_FILE`) once, with an artificial
/// per-byte delay and a longer pause on a literal `#`.
pub struct ScriptedFileInput {
    stuffed: Stuffed,
    cmd_prefix: String,
    content: VecDeque<u8>,
}

/// How `\n` bytes in the script content are emitted to the guest.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NewlineMode {
    Lf,
    Cr,
    CrLf,
}

impl ScriptedFileInput {
    pub fn from_path(path: &std::path::Path) -> CpmResult<Self> {
        let mut raw = String::new();
        std::fs::File::open(path)?.read_to_string(&mut raw)?;
        Ok(Self::parse(&raw))
    }

    /// Parse the `key: value` header (terminated by a bare `--` line) and the
    /// script body that follows it.
    fn parse(raw: &str) -> Self {
        let mut newline_mode = NewlineMode::Lf;
        let mut body_start = None;

        for (i, line) in raw.lines().enumerate() {
            if line.trim() == "--" {
                body_start = Some(i + 1);
                break;
            }
            if let Some((key, value)) = line.split_once(':') {
                if key.trim() == "newline" {
                    newline_mode = match value.trim() {
                        "m" => NewlineMode::Cr,
                        "both" => NewlineMode::CrLf,
                        _ => NewlineMode::Lf,
                    };
                }
            } else if !line.trim_start().starts_with('#') && !line.trim().is_empty() {
                // Not a header line and no `--` seen yet: there is no header.
                break;
            }
        }

        let body: String = match body_start {
            Some(start) => raw.lines().skip(start).collect::<Vec<_>>().join("\n"),
            None => raw.to_string(),
        };

        let mut content = VecDeque::new();
        for ch in body.chars() {
            if ch == '\n' {
                match newline_mode {
                    NewlineMode::Lf => content.push_back(b'\n'),
                    NewlineMode::Cr => content.push_back(b'\r'),
                    NewlineMode::CrLf => {
                        content.push_back(b'\r');
                        content.push_back(b'\n');
                    }
                }
            } else {
                let mut buf = [0u8; 4];
                for b in ch.encode_utf8(&mut buf).as_bytes() {
                    content.push_back(*b);
                }
            }
        }

        Self {
            stuffed: Stuffed::default(),
            cmd_prefix: String::new(),
            content,
        }
    }
}

impl ConsoleInput for ScriptedFileInput {
    fn pending(&mut self) -> bool {
        !self.stuffed.is_empty() || !self.content.is_empty()
    }

    fn read_no_echo(&mut self) -> CpmResult<u8> {
        if let Some(b) = self.stuffed.pop() {
            return Ok(b);
        }
        match self.content.pop_front() {
            Some(b) => {
                if b == b'#' {
                    std::thread::sleep(Duration::from_secs(1));
                } else {
                    std::thread::sleep(Duration::from_millis(5));
                }
                Ok(b)
            }
            None => Err(CpmError::Eof),
        }
    }

    fn name(&self) -> &'static str {
        "file"
    }

    fn stuff(&mut self, s: &str) {
        self.stuffed.push(s);
    }

    fn set_cmd_prefix(&mut self, prefix: String) {
        self.cmd_prefix = prefix;
    }

    fn get_cmd_prefix(&self) -> &str {
        &self.cmd_prefix
    }
}

/// Testing-only driver: always claims input is pending, and every read fails.
#[derive(Default)]
pub struct ErrorInput {
    cmd_prefix: String,
}

impl ConsoleInput for ErrorInput {
    fn pending(&mut self) -> bool {
        true
    }

    fn read_no_echo(&mut self) -> CpmResult<u8> {
        Err(CpmError::Io(std::io::Error::new(
            std::io::ErrorKind::Other,
            "error input driver",
        )))
    }

    fn name(&self) -> &'static str {
        "error"
    }

    fn stuff(&mut self, _s: &str) {}

    fn set_cmd_prefix(&mut self, prefix: String) {
        self.cmd_prefix = prefix;
    }

    fn get_cmd_prefix(&self) -> &str {
        &self.cmd_prefix
    }
}

fn block_for_key_byte() -> CpmResult<u8> {
    loop {
        if event::poll(Duration::from_millis(50))? {
            if let Event::Key(key) = event::read()? {
                if key.kind == KeyEventKind::Press {
                    if let Some(b) = key_to_byte(key.code, key.modifiers) {
                        return Ok(b);
                    }
                }
            }
        }
    }
}

/// Map a crossterm key event to the single CP/M byte it represents.
fn key_to_byte(code: KeyCode, mods: KeyModifiers) -> Option<u8> {
    match code {
        KeyCode::Char(c) if mods.contains(KeyModifiers::CONTROL) => {
            let upper = c.to_ascii_uppercase();
            if upper.is_ascii_alphabetic() {
                Some((upper as u8) & 0x1F)
            } else {
                None
            }
        }
        KeyCode::Char(c) => Some(c as u8),
        KeyCode::Enter => Some(b'\r'),
        KeyCode::Backspace => Some(0x08),
        KeyCode::Delete => Some(0x7F),
        KeyCode::Esc => Some(0x1B),
        KeyCode::Tab => Some(b'\t'),
        _ => None,
    }
}

/// Construct a driver from a `-input`-style spec: `NAME` or `NAME:OPTS`.
pub fn make(spec: &str) -> CpmResult<Box<dyn ConsoleInput>> {
    let (name, opts) = spec.split_once(':').unwrap_or((spec, ""));
    match name {
        "stty" => Ok(Box::new(CookedInput::new())),
        "term" => Ok(Box::new(RawBackgroundInput::new())),
        "file" => {
            let path = if opts.is_empty() {
                std::env::var("INPUT_FILE").unwrap_or_else(|_| "input.txt".to_string())
            } else {
                opts.to_string()
            };
            Ok(Box::new(ScriptedFileInput::from_path(std::path::Path::new(
                &path,
            ))?))
        }
        "error" => Ok(Box::new(ErrorInput::default())),
        other => Err(CpmError::Unimplemented(
            other.bytes().next().unwrap_or(0),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stuffed_input_takes_priority() {
        let mut input = CookedInput::new();
        input.stuff("ab");
        assert!(input.pending());
        assert_eq!(input.read_no_echo().unwrap(), b'a');
        assert_eq!(input.read_no_echo().unwrap(), b'b');
    }

    #[test]
    fn error_driver_always_pending_and_fails() {
        let mut input = ErrorInput::default();
        assert!(input.pending());
        assert!(input.read_no_echo().is_err());
    }

    #[test]
    fn scripted_file_parses_header_and_body() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("script.txt");
        std::fs::write(&path, "newline: m\n--\nAB\n").unwrap();
        let mut input = ScriptedFileInput::from_path(&path).unwrap();
        assert_eq!(input.read_no_echo().unwrap(), b'A');
        assert_eq!(input.read_no_echo().unwrap(), b'B');
        assert_eq!(input.read_no_echo().unwrap(), b'\r');
        assert!(input.read_no_echo().is_err());
    }

    #[test]
    fn scripted_file_without_header_plays_whole_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("script.txt");
        std::fs::write(&path, "hi").unwrap();
        let mut input = ScriptedFileInput::from_path(&path).unwrap();
        assert_eq!(input.read_no_echo().unwrap(), b'h');
        assert_eq!(input.read_no_echo().unwrap(), b'i');
    }

    #[test]
    fn make_unknown_driver_is_unimplemented() {
        assert!(make("bogus").is_err());
    }
}
