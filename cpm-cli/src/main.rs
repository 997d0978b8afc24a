//! CP/M CLI - run CP/M 2.2 programs from the command line.
//!
//! Usage:
//!   cpm [flags] [program [args...]]
//!
//! With no program given, the embedded CCP shell runs and reads commands
//! interactively; the 7-bit wrapper around `cpm-core` only wires flags to
//! emulator configuration and owns the terminal.

use std::cell::RefCell;
use std::io::Write;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::Parser;

use cpm_core::console::input::{self, ConsoleInput};
use cpm_core::emulator::CancellationToken;
use cpm_core::fs::virtual_volume;
use cpm_core::{CpmConsole, CpmEmulator, DriveFS, ExitReason, HostDriveFS, UnionDriveFS};

/// Run CP/M 2.2 programs.
#[derive(Parser, Debug)]
#[command(name = "cpm", version, about = "CP/M 2.2 user-space emulator")]
struct Args {
    /// Change to this directory before doing anything else
    #[arg(long = "cd")]
    cd: Option<PathBuf>,

    /// Keystroke source driver: stty, term, file[:PATH], or error
    #[arg(long = "input", default_value = "term")]
    input: String,

    /// Console output driver name (metadata; the byte-stream post-processor
    /// itself is a separate collaborator this crate does not implement)
    #[arg(long = "console", default_value = "ansi")]
    console: String,

    /// Embedded CCP name (metadata only — exactly one shell image is loaded)
    #[arg(long = "ccp", default_value = "ccp")]
    ccp: String,

    /// Map drives A..P to like-named subdirectories of the working directory
    #[arg(long = "directories")]
    directories: bool,

    /// Create mapped drive subdirectories if they don't exist
    #[arg(long = "create")]
    create: bool,

    /// Write structured JSON logs here
    #[arg(long = "log-path")]
    log_path: Option<PathBuf>,

    /// Printer output file
    #[arg(long = "prn-path", default_value = "printer.log")]
    prn_path: PathBuf,

    /// Host-command escape prefix recognized by the line editor (disabled by default)
    #[arg(long = "exec", default_value = "")]
    exec: String,

    /// Abort the run after N seconds
    #[arg(long = "timeout")]
    timeout: Option<u64>,

    /// List the embedded read-only volume and exit
    #[arg(long = "list-volume")]
    list_volume: bool,

    /// Enable BDOS/BIOS syscall tracing
    #[arg(short, long)]
    trace: bool,

    /// Program and arguments to run instead of the interactive shell
    #[arg(trailing_var_arg = true)]
    program: Vec<String>,
}

/// `CpmConsole` over stdout plus a pluggable `ConsoleInput` keystroke source.
///
/// `has_key` needs `&self` but `ConsoleInput::pending` needs `&mut self`;
/// the `RefCell` absorbs that mismatch the same way an interior-mutability
/// cache would for any trait whose read-only probe must drive I/O.
struct TerminalConsole {
    input: RefCell<Box<dyn ConsoleInput>>,
}

impl TerminalConsole {
    fn new(input: Box<dyn ConsoleInput>) -> Self {
        Self {
            input: RefCell::new(input),
        }
    }

    fn setup(&mut self) -> cpm_core::CpmResult<()> {
        self.input.get_mut().setup()
    }

    fn teardown(&mut self) -> cpm_core::CpmResult<()> {
        self.input.get_mut().teardown()
    }
}

impl CpmConsole for TerminalConsole {
    fn write(&mut self, ch: u8) {
        let stdout = std::io::stdout();
        let mut handle = stdout.lock();
        match ch {
            0x08 => {
                let _ = handle.write_all(b"\x08 \x08");
            }
            _ => {
                let _ = handle.write_all(&[ch]);
            }
        }
        let _ = handle.flush();
    }

    fn has_key(&self) -> bool {
        self.input.borrow_mut().pending()
    }

    fn get_key(&mut self) -> Option<u8> {
        let input = self.input.get_mut();
        if input.pending() {
            input.read_no_echo().ok()
        } else {
            None
        }
    }

    fn wait_for_key(&mut self) -> u8 {
        self.input.get_mut().read_no_echo().unwrap_or(0)
    }
}

fn init_logging(log_path: Option<&PathBuf>) -> Result<()> {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

    match log_path {
        Some(path) => {
            let file = std::fs::File::create(path)
                .with_context(|| format!("creating log file {}", path.display()))?;
            fmt()
                .json()
                .with_env_filter(filter)
                .with_writer(file)
                .init();
        }
        None => {
            fmt().with_env_filter(filter).with_writer(std::io::stderr).init();
        }
    }
    Ok(())
}

/// Names tried, in order, when no program is given and the shell must be
/// found on drive A: or the embedded volume.
const SHELL_NAMES: &[&str] = &["XCCP.COM", "CCP.COM", "ZCCP.COM"];

/// Look up the CCP image by name on drive A:, trying each of `SHELL_NAMES`.
fn find_shell(emu: &CpmEmulator<TerminalConsole, UnionDriveFS<HostDriveFS>>) -> Option<Vec<u8>> {
    let drive = emu.drive(0)?;
    SHELL_NAMES.iter().find_map(|name| drive.read_file(name))
}

/// Mount drive A: (and, with `-directories`, B:..P: from like-named
/// subdirectories of the working directory) over the embedded read-only
/// volume.
fn mount_drives(
    emu: &mut CpmEmulator<TerminalConsole, UnionDriveFS<HostDriveFS>>,
    directories: bool,
    create: bool,
) -> Result<()> {
    let cwd = std::env::current_dir().context("reading working directory")?;
    if directories {
        for letter in b'A'..=b'P' {
            let dir = cwd.join((letter as char).to_string());
            if create {
                std::fs::create_dir_all(&dir)
                    .with_context(|| format!("creating drive directory {}", dir.display()))?;
            }
            if dir.is_dir() {
                emu.mount((letter - b'A') as u8, UnionDriveFS::new(HostDriveFS::new(dir)));
            }
        }
    } else {
        emu.mount(0, UnionDriveFS::new(HostDriveFS::new(cwd)));
    }
    Ok(())
}

fn main() -> Result<()> {
    let args = Args::parse();

    if let Some(dir) = &args.cd {
        std::env::set_current_dir(dir)
            .with_context(|| format!("changing directory to {}", dir.display()))?;
    }

    init_logging(args.log_path.as_ref())?;

    if args.list_volume {
        for name in virtual_volume::VOLUME.iter().map(|e| e.name) {
            println!("{}", name);
        }
        return Ok(());
    }

    let input_driver = input::make(&args.input).with_context(|| format!("-input {}", args.input))?;
    let mut console = TerminalConsole::new(input_driver);
    console.setup().context("setting up console input")?;

    let mut emu: CpmEmulator<TerminalConsole, UnionDriveFS<HostDriveFS>> = CpmEmulator::new(console);
    emu.trace = args.trace;
    emu.set_printer_path(&args.prn_path);
    emu.set_cmd_prefix(&args.exec);
    emu.set_console_name(&args.console);
    emu.set_input_name(&args.input);
    emu.set_ccp_name(&args.ccp);

    mount_drives(&mut emu, args.directories, args.create)?;

    let cancel = args.timeout.map(|_| CancellationToken::new());
    if let (Some(seconds), Some(token)) = (args.timeout, cancel.clone()) {
        std::thread::spawn(move || {
            std::thread::sleep(Duration::from_secs(seconds));
            token.cancel();
        });
    }

    let result = if !args.program.is_empty() {
        let program_bytes = emu
            .drive(0)
            .and_then(|d| d.read_file(&args.program[0]))
            .with_context(|| format!("reading {}", args.program[0]))?;
        emu.stage_args(&args.program[1..]);
        emu.load_com(&program_bytes);
        emu.run_from(cpm_core::bdos::addr::TPA, None, cancel.as_ref())
    } else {
        let shell = find_shell(&emu).with_context(|| {
            format!(
                "no shell found on drive A: (tried {})",
                SHELL_NAMES.join(", ")
            )
        })?;
        emu.set_shell(&shell, cpm_core::bdos::addr::TPA);
        emu.run_shell(cancel.as_ref())
    };

    let _ = emu.console_mut().teardown();

    match result {
        Ok(info) => {
            tracing::info!(reason = ?info.reason, pc = info.pc, t_states = info.t_states, "run finished");
            match info.reason {
                ExitReason::Exit | ExitReason::Halt | ExitReason::Boot => Ok(()),
                ExitReason::Timeout => bail!("run cancelled after timeout"),
                ExitReason::Interrupted => bail!("interrupted"),
                ExitReason::Unimplemented(f) => bail!("unimplemented BDOS/BIOS function {}", f),
                ExitReason::ShowOutput(_) => Ok(()),
                ExitReason::Error(e) => bail!("emulator error: {}", e),
            }
        }
        Err(e) => bail!("emulator error: {}", e),
    }
}
