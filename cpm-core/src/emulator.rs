//! CP/M Emulator - integrates Z80 CPU with BDOS/BIOS handling.

use std::collections::VecDeque;
use std::num::NonZeroU16;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use z80emu::host::TsCounter;
use z80emu::{Clock, Cpu, Io, Memory as Z80Memory, Reg8, StkReg16, Z80NMOS};

use crate::bdos::handles::FileHandle;
use crate::bdos::{addr, fcb::FCB_SIZE, BdosFunction, Fcb, FileHandleCache, FindState, RECORD_SIZE};
use crate::console::CpmConsole;
use crate::error::{CpmError, CpmResult};
use crate::fs::DriveFS;
use crate::memory::Memory;
use crate::printer::PrinterSink;
use crate::{CpmExitInfo, ExitReason};

type TsClock = TsCounter<i32>;

const CTRL_N: u8 = 0x0E;
const CTRL_P: u8 = 0x10;
const CTRL_C: u8 = 0x03;
const ESC: u8 = 0x1B;
const BACKSPACE: u8 = 0x08;
const DEL: u8 = 0x7F;

/// A shared flag a caller can flip from another thread to abort a run in
/// progress; checked between instruction steps.
#[derive(Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// CPU bus: memory plus the port-0xFF BIOS trap. Borrowed for the span of a
/// single `execute_next` call.
struct Bus<'a> {
    memory: &'a mut Memory,
    bios_trap: &'a mut Option<u8>,
}

impl Z80Memory for Bus<'_> {
    type Timestamp = i32;

    fn read_debug(&self, addr: u16) -> u8 {
        self.memory.read_byte(addr)
    }

    fn read_mem(&self, addr: u16, _ts: Self::Timestamp) -> u8 {
        self.memory.read_byte(addr)
    }

    fn write_mem(&mut self, addr: u16, value: u8, _ts: Self::Timestamp) {
        self.memory.write_byte(addr, value);
    }
}

impl Io for Bus<'_> {
    type Timestamp = i32;
    type WrIoBreak = ();
    type RetiBreak = ();

    fn read_io(&mut self, _port: u16, _ts: Self::Timestamp) -> (u8, Option<NonZeroU16>) {
        (0xFF, None)
    }

    fn write_io(
        &mut self,
        port: u16,
        value: u8,
        _ts: Self::Timestamp,
    ) -> (Option<Self::WrIoBreak>, Option<NonZeroU16>) {
        if (port as u8) == addr::BIOS_TRAP_PORT {
            *self.bios_trap = Some(value);
        }
        (None, None)
    }
}

/// CP/M 2.2 emulator state: CPU, memory, drives, console, and everything the
/// BDOS/BIOS dispatchers need to fake a running system.
pub struct CpmEmulator<C: CpmConsole, D: DriveFS> {
    cpu: Z80NMOS,
    clock: TsClock,
    memory: Memory,
    console: C,
    drives: [Option<D>; 16],
    current_drive: u8,
    current_user: u8,
    dma: u16,
    handles: FileHandleCache,
    find_state: FindState,
    printer: PrinterSink,
    bdos_addr: u16,
    bios_addr: u16,
    bios_trap: Option<u8>,
    shell_binary: Option<Vec<u8>>,
    shell_address: u16,
    injected: VecDeque<u8>,
    history: Vec<String>,
    history_index: Option<usize>,
    ctrl_c_count: u32,
    ctrl_c_threshold: u32,
    cmd_prefix: String,
    console_name: String,
    input_name: String,
    ccp_name: String,
    banner: String,
    pub trace: bool,
}

impl<C: CpmConsole, D: DriveFS> CpmEmulator<C, D> {
    pub fn new(console: C) -> Self {
        let bdos_addr = addr::bdos_address();
        let bios_addr = addr::bios_address();
        let mut emu = Self {
            cpu: Z80NMOS::default(),
            clock: TsClock::default(),
            memory: Memory::new(),
            console,
            drives: Default::default(),
            current_drive: 0,
            current_user: 0,
            dma: addr::DEFAULT_DMA,
            handles: FileHandleCache::new(),
            find_state: FindState::new(),
            printer: PrinterSink::default(),
            bdos_addr,
            bios_addr,
            bios_trap: None,
            shell_binary: None,
            shell_address: addr::TPA,
            injected: VecDeque::new(),
            history: Vec::new(),
            history_index: None,
            ctrl_c_count: 0,
            ctrl_c_threshold: 2,
            cmd_prefix: String::new(),
            console_name: "term".to_string(),
            input_name: "term".to_string(),
            ccp_name: "ccp".to_string(),
            banner: "cpmulator\r\n".to_string(),
            trace: false,
        };
        emu.init_memory();
        emu
    }

    /// Patch the low-memory vectors and rebuild the BIOS jump table. Called
    /// on construction and again after every shell reload.
    fn init_memory(&mut self) {
        self.memory.write_byte(0x0000, 0x76); // HALT
        self.memory
            .write_word(0x0001, self.bios_addr.wrapping_add(3));

        self.memory.write_byte(0x0003, 0x00); // IOByte
        self.memory
            .write_byte(0x0004, (self.current_user << 4) | self.current_drive);

        self.memory.write_byte(0x0005, 0x76); // HALT
        self.memory
            .write_word(0x0006, self.bdos_addr.wrapping_add(6));

        self.memory.write_byte(self.bdos_addr, 0xC9); // RET, defensive marker

        let table = self.bios_addr as usize;
        let trampolines = table + addr::CBIOS_ENTRIES * 3;
        for n in 0..addr::CBIOS_ENTRIES {
            let entry = (table + n * 3) as u16;
            let target = (trampolines + n * 5) as u16;
            self.memory.write_byte(entry, 0xC3); // JP
            self.memory.write_word(entry.wrapping_add(1), target);

            self.memory.write_byte(target, 0x3E); // LD A,n
            self.memory.write_byte(target.wrapping_add(1), n as u8);
            self.memory.write_byte(target.wrapping_add(2), 0xD3); // OUT (0xFF),A
            self.memory
                .write_byte(target.wrapping_add(3), addr::BIOS_TRAP_PORT);
            self.memory.write_byte(target.wrapping_add(4), 0xC9); // RET
        }
    }

    pub fn mount(&mut self, drive: u8, fs: D) {
        if (drive as usize) < self.drives.len() {
            self.drives[drive as usize] = Some(fs);
        }
    }

    pub fn unmount(&mut self, drive: u8) {
        if (drive as usize) < self.drives.len() {
            self.drives[drive as usize] = None;
        }
    }

    pub fn drive(&self, drive: u8) -> Option<&D> {
        self.drives.get(drive as usize).and_then(|d| d.as_ref())
    }

    pub fn drive_mut(&mut self, drive: u8) -> Option<&mut D> {
        self.drives.get_mut(drive as usize).and_then(|d| d.as_mut())
    }

    pub fn console(&self) -> &C {
        &self.console
    }

    pub fn console_mut(&mut self) -> &mut C {
        &mut self.console
    }

    pub fn set_printer_path(&mut self, path: impl Into<std::path::PathBuf>) {
        self.printer = PrinterSink::new(path);
    }

    pub fn set_cmd_prefix(&mut self, prefix: impl Into<String>) {
        self.cmd_prefix = prefix.into();
    }

    pub fn set_console_name(&mut self, name: impl Into<String>) {
        self.console_name = name.into();
    }

    pub fn set_input_name(&mut self, name: impl Into<String>) {
        self.input_name = name.into();
    }

    pub fn set_ccp_name(&mut self, name: impl Into<String>) {
        self.ccp_name = name.into();
    }

    /// Queue bytes ahead of live console input (used for autoexec).
    pub fn inject(&mut self, s: &str) {
        self.injected.extend(s.bytes());
    }

    pub fn load_com(&mut self, data: &[u8]) {
        self.load_at(addr::TPA, data);
    }

    pub fn load_at(&mut self, address: u16, data: &[u8]) {
        self.memory.write_range(address, data);
    }

    /// Set the embedded shell (CCP) image used by `run_shell`.
    pub fn set_shell(&mut self, data: &[u8], address: u16) {
        self.shell_binary = Some(data.to_vec());
        self.shell_address = address;
    }

    pub fn set_pc(&mut self, address: u16) {
        self.cpu.set_pc(address);
    }

    /// Build FCB #1/#2 from the first two CLI arguments and the upper-cased
    /// command tail at 0x0080.
    pub fn stage_args(&mut self, args: &[String]) {
        if let Some(arg) = args.first() {
            let fcb = Fcb::parse_filename(arg);
            self.memory.write_range(addr::FCB1, &fcb.to_bytes());
        }
        if let Some(arg) = args.get(1) {
            let fcb = Fcb::parse_filename(arg);
            self.memory.write_range(addr::FCB2, &fcb.to_bytes());
        }

        let tail = args.join(" ").to_ascii_uppercase();
        let bytes = tail.as_bytes();
        let len = bytes.len().min(127);
        self.memory.write_byte(addr::CMDLINE, len as u8);
        self.memory
            .write_range(addr::CMDLINE.wrapping_add(1), &bytes[..len]);
    }

    pub fn run(&mut self) -> CpmResult<CpmExitInfo> {
        self.run_from(addr::TPA, None, None)
    }

    /// Run a single program (or shell image) to completion, starting at
    /// `start`. `entry_c` seeds the C register before the first instruction
    /// (the CCP reads it as `user<<4|drive` on entry).
    pub fn run_from(
        &mut self,
        start: u16,
        entry_c: Option<u8>,
        cancel: Option<&CancellationToken>,
    ) -> CpmResult<CpmExitInfo> {
        self.cpu.reset();
        self.cpu.set_pc(start);
        self.cpu.set_sp(self.bdos_addr.wrapping_sub(2));
        if let Some(c) = entry_c {
            self.cpu.set_reg(Reg8::C, None, c);
        }

        loop {
            if let Some(token) = cancel {
                if token.is_cancelled() {
                    return Ok(self.exit_info(ExitReason::Timeout));
                }
            }

            let pc = self.cpu.get_pc();

            if pc == 0x0000 {
                return Ok(self.exit_info(ExitReason::Boot));
            }

            if pc == 0x0005 || pc == self.bdos_addr {
                match self.handle_bdos()? {
                    Some(info) => return Ok(info),
                    None => {
                        let ret = self.pop16();
                        self.cpu.set_pc(ret);
                        continue;
                    }
                }
            }

            self.bios_trap = None;
            {
                let mut bus = Bus {
                    memory: &mut self.memory,
                    bios_trap: &mut self.bios_trap,
                };
                let _ = self
                    .cpu
                    .execute_next(&mut bus, &mut self.clock, None::<fn(z80emu::CpuDebug)>);
            }

            if let Some(func) = self.bios_trap.take() {
                if let Some(info) = self.handle_cbios(func)? {
                    return Ok(info);
                }
                continue;
            }

            if self.cpu.is_halt() {
                self.flush_open_files();
                return Ok(self.exit_info(ExitReason::Halt));
            }
        }
    }

    /// Repeatedly load and run the embedded CCP image, restarting it on
    /// every reboot/exit and preserving drive/user across invocations.
    /// Panics if `set_shell` was never called.
    pub fn run_shell(&mut self, cancel: Option<&CancellationToken>) -> CpmResult<CpmExitInfo> {
        let shell = self
            .shell_binary
            .clone()
            .expect("set_shell must be called before run_shell");
        let mut first_entry = true;

        loop {
            self.flush_open_files();
            self.load_at(self.shell_address, &shell);
            self.init_memory();
            self.dma = addr::DEFAULT_DMA;

            if first_entry {
                first_entry = false;
                if self.current_drive_has_autoexec() {
                    self.inject("SUBMIT AUTOEXEC\r");
                }
            }

            let entry_c = (self.current_user << 4) | self.current_drive;
            let info = self.run_from(self.shell_address, Some(entry_c), cancel)?;
            match info.reason {
                ExitReason::Boot | ExitReason::Exit => continue,
                _ => return Ok(info),
            }
        }
    }

    fn current_drive_has_autoexec(&self) -> bool {
        let Some(drive) = self.drives.get(self.current_drive as usize).and_then(|d| d.as_ref())
        else {
            return false;
        };
        let files = drive.list_files();
        files.iter().any(|f| f == "SUBMIT.COM") && files.iter().any(|f| f == "AUTOEXEC.SUB")
    }

    fn flush_open_files(&mut self) {
        for handle in self.handles.drain() {
            if handle.modified && !handle.read_only {
                if let Some(drive) = self.drives.get_mut(handle.drive as usize).and_then(|d| d.as_mut()) {
                    let _ = drive.write_file(&handle.filename, &handle.data);
                }
            }
        }
    }

    fn pop16(&mut self) -> u16 {
        let sp = self.cpu.get_sp();
        let lo = self.memory.read_byte(sp);
        let hi = self.memory.read_byte(sp.wrapping_add(1));
        self.cpu.set_sp(sp.wrapping_add(2));
        u16::from_le_bytes([lo, hi])
    }

    fn exit_info(&self, reason: ExitReason) -> CpmExitInfo {
        CpmExitInfo {
            reason,
            t_states: self.clock.as_timestamp() as u64,
            pc: self.cpu.get_pc(),
        }
    }

    /// Set A and mirror its value into HL's low byte, per the BDOS calling
    /// convention guests rely on.
    fn set_result(&mut self, a: u8) {
        self.cpu.set_reg(Reg8::A, None, a);
        let hl = self.cpu.get_reg16(StkReg16::HL);
        self.cpu.set_reg16(StkReg16::HL, (hl & 0xFF00) | a as u16);
    }

    fn set_result16(&mut self, hl: u16) {
        self.cpu.set_reg16(StkReg16::HL, hl);
        self.cpu.set_reg(Reg8::A, None, (hl & 0xFF) as u8);
    }

    fn read_fcb(&self, addr: u16) -> Fcb {
        let mut bytes = [0u8; FCB_SIZE];
        bytes.copy_from_slice(self.memory.read_range(addr, FCB_SIZE));
        Fcb::from_bytes(&bytes)
    }

    fn write_fcb(&mut self, addr: u16, fcb: &Fcb) {
        self.memory.write_range(addr, &fcb.to_bytes());
    }

    /// Resolve an FCB's drive byte (0 = default/current) to a 0-based index.
    fn effective_drive(&self, fcb_drive: u8) -> u8 {
        if fcb_drive == 0 {
            self.current_drive
        } else {
            fcb_drive.saturating_sub(1)
        }
    }

    fn handle_bdos(&mut self) -> CpmResult<Option<CpmExitInfo>> {
        let c = self.cpu.get_reg(Reg8::C, None);
        let e = self.cpu.get_reg(Reg8::E, None);
        let de = self.cpu.get_reg16(StkReg16::DE);

        if self.trace {
            tracing::trace!(function = c, de, "bdos call");
        }

        match BdosFunction::try_from(c) {
            Ok(func) => self.dispatch_bdos(func, e, de),
            Err(unknown) => {
                tracing::warn!(function = unknown, "unimplemented bdos function");
                Err(CpmError::Unimplemented(unknown))
            }
        }
    }

    fn dispatch_bdos(&mut self, func: BdosFunction, e: u8, de: u16) -> CpmResult<Option<CpmExitInfo>> {
        use BdosFunction::*;

        match func {
            SystemReset => return Ok(Some(self.exit_info(ExitReason::Exit))),

            ConsoleInput => {
                let ch = self.next_input_byte();
                self.console.write(ch);
                self.set_result(ch);
            }

            ConsoleOutput => self.console.write(e),

            ReaderInput => {
                let ch = self.next_input_byte();
                self.set_result(ch);
            }

            PunchOutput => self.console.write(e),

            ListOutput => self.printer.write_byte(e)?,

            DirectConsoleIO => {
                let result = match e {
                    0xFF => self.console.get_key().unwrap_or(0),
                    0xFE => {
                        if self.console.has_key() {
                            0xFF
                        } else {
                            0
                        }
                    }
                    0xFD => self.next_input_byte(),
                    other => {
                        self.console.write(other);
                        0
                    }
                };
                self.set_result(result);
            }

            GetIOByte => self.set_result(self.memory.read_byte(0x0003)),
            SetIOByte => self.memory.write_byte(0x0003, e),

            PrintString => {
                let mut a = de;
                loop {
                    let ch = self.memory.read_byte(a);
                    if ch == b'$' {
                        break;
                    }
                    self.console.write(ch);
                    a = a.wrapping_add(1);
                }
            }

            ReadConsoleBuffer => {
                let base = if de == 0 { self.dma } else { de };
                let max_len = self.memory.read_byte(base) as usize;
                match self.read_console_line(max_len) {
                    Ok(line) => {
                        self.memory.write_byte(base.wrapping_add(1), line.len() as u8);
                        self.memory.write_range(base.wrapping_add(2), line.as_bytes());
                    }
                    Err(CpmError::Interrupted) => return Ok(Some(self.exit_info(ExitReason::Boot))),
                    Err(other) => return Err(other),
                }
            }

            ConsoleStatus => self.set_result(if self.console.has_key() { 0xFF } else { 0 }),

            ReturnVersion => self.set_result16(0x0022),

            ResetDiskSystem => {
                self.current_drive = 0;
                self.dma = addr::DEFAULT_DMA;
                self.handles.clear();
                self.find_state = FindState::new();
                let submit_queued = self.drives[self.current_drive as usize]
                    .as_ref()
                    .map(|d| d.list_files().iter().any(|name| name.contains('$')))
                    .unwrap_or(false);
                self.set_result(if submit_queued { 0xFF } else { 0 });
            }

            SelectDisk => {
                self.current_drive = e.min(15);
                self.memory
                    .write_byte(0x0004, (self.current_user << 4) | self.current_drive);
                let ok = self.drives[self.current_drive as usize].is_some();
                self.set_result(if ok { 0 } else { 0xFF });
            }

            ReturnCurrentDisk => self.set_result(self.current_drive),

            SetDmaAddress => self.dma = de,

            GetAllocationVector => self.set_result16(0),
            WriteProtectDisk => self.set_result(0),
            GetReadOnlyVector => self.set_result16(0),
            SetFileAttributes => self.set_result(0),
            GetDiskParameters => self.set_result16(0),
            ResetDrive => self.set_result(0),
            ErrorMode => {}
            GetTime => {}
            DirectScreenFunctions => {}

            ReturnLoginVector => self.set_result16(0xFFFF),

            UserCode => {
                if e == 0xFF {
                    self.set_result(self.current_user);
                } else {
                    self.current_user = e & 0x0F;
                    self.memory
                        .write_byte(0x0004, (self.current_user << 4) | self.current_drive);
                }
            }

            OpenFile => self.bdos_open(de)?,
            CloseFile => self.bdos_close(de)?,
            SearchFirst => self.bdos_search_first(de)?,
            SearchNext => self.bdos_search_next()?,
            DeleteFile => self.bdos_delete(de)?,
            ReadSequential => self.bdos_read_sequential(de)?,
            WriteSequential => self.bdos_write_sequential(de)?,
            MakeFile => self.bdos_make(de)?,
            RenameFile => self.bdos_rename(de)?,
            ReadRandom => self.bdos_read_random(de)?,
            WriteRandom | WriteRandomZeroFill => self.bdos_write_random(de)?,
            ComputeFileSize => self.bdos_compute_size(de),
            SetRandomRecord => self.bdos_set_random_record(de),
        }

        Ok(None)
    }

    fn next_input_byte(&mut self) -> u8 {
        if let Some(b) = self.injected.pop_front() {
            return b;
        }
        self.console.wait_for_key()
    }

    // --- File operations ---------------------------------------------------

    fn bdos_open(&mut self, de: u16) -> CpmResult<()> {
        let mut fcb = self.read_fcb(de);
        let filename = fcb.filename();
        if filename.is_empty() {
            self.set_result(0xFF);
            return Ok(());
        }
        let drive_idx = self.effective_drive(fcb.drive);
        let key = fcb.cache_key(drive_idx);

        let Some(drive) = self.drives.get(drive_idx as usize).and_then(|d| d.as_ref()) else {
            self.set_result(0xFF);
            return Ok(());
        };
        let Some(data) = drive.read_file(&filename) else {
            self.set_result(0xFF);
            return Ok(());
        };
        let read_only = drive.is_read_only_file(&filename);

        let size = data.len();
        let rc = ((size / RECORD_SIZE).min(128) + if size % RECORD_SIZE != 0 { 1 } else { 0 }) as u8;

        fcb.reset_extent();
        fcb.rc = rc;
        self.write_fcb(de, &fcb);

        self.handles.insert(
            key,
            FileHandle {
                drive: drive_idx,
                filename: filename.clone(),
                data,
                modified: false,
                read_only,
                is_submit_spool: filename.ends_with("$$$.SUB"),
            },
        );
        self.set_result(0);
        Ok(())
    }

    fn bdos_close(&mut self, de: u16) -> CpmResult<()> {
        let fcb = self.read_fcb(de);
        let drive_idx = self.effective_drive(fcb.drive);
        let key = fcb.cache_key(drive_idx);

        let Some(mut handle) = self.handles.remove(key) else {
            self.set_result(0xFF);
            return Ok(());
        };

        if handle.is_submit_spool {
            let host_extent = handle.data.len() as u32 / 16384;
            let seq_ext = fcb.ex as u32 * 32 + (fcb.s2 as u32 & 0x3F);
            if host_extent == seq_ext {
                let threshold = (handle.data.len() as u32 % 16384) / RECORD_SIZE as u32;
                if (fcb.rc as u32) < threshold {
                    let new_len = 16384 * seq_ext + RECORD_SIZE as u32 * fcb.rc as u32;
                    handle.data.truncate(new_len as usize);
                    handle.modified = true;
                }
            }
        }

        if handle.modified {
            if handle.read_only {
                return Err(CpmError::ReadOnly);
            }
            if let Some(drive) = self.drives.get_mut(drive_idx as usize).and_then(|d| d.as_mut()) {
                drive.write_file(&handle.filename, &handle.data)?;
            }
        }
        self.set_result(0);
        Ok(())
    }

    fn bdos_search_first(&mut self, de: u16) -> CpmResult<()> {
        let pattern = self.read_fcb(de);
        let drive_idx = self.effective_drive(pattern.drive);
        let Some(drive) = self.drives.get(drive_idx as usize).and_then(|d| d.as_ref()) else {
            self.set_result(0xFF);
            return Ok(());
        };
        let mut matches: Vec<String> = drive
            .list_files()
            .into_iter()
            .filter(|name| pattern.matches(name))
            .collect();
        matches.sort();
        matches.dedup();
        self.find_state.start(drive_idx, matches);
        self.bdos_search_next()
    }

    fn bdos_search_next(&mut self) -> CpmResult<()> {
        match self.find_state.next() {
            Some(name) => {
                let mut result = Fcb::parse_filename(&name);
                let size = self
                    .drives
                    .get(self.find_state.drive() as usize)
                    .and_then(|d| d.as_ref())
                    .and_then(|d| d.read_file(&name))
                    .map(|d| d.len())
                    .unwrap_or(0);
                result.rc =
                    ((size / RECORD_SIZE).min(128) + if size % RECORD_SIZE != 0 { 1 } else { 0 }) as u8;
                let dma = self.dma;
                self.memory.write_range(dma, &result.to_bytes());
                self.set_result(0);
            }
            None => self.set_result(0xFF),
        }
        Ok(())
    }

    fn bdos_delete(&mut self, de: u16) -> CpmResult<()> {
        let pattern = self.read_fcb(de);
        let drive_idx = self.effective_drive(pattern.drive);
        let Some(drive) = self.drives.get_mut(drive_idx as usize).and_then(|d| d.as_mut()) else {
            self.set_result(0xFF);
            return Ok(());
        };
        let matching: Vec<String> = drive
            .list_files()
            .into_iter()
            .filter(|name| pattern.matches(name))
            .collect();
        if matching.is_empty() {
            self.set_result(0xFF);
            return Ok(());
        }
        for name in &matching {
            self.handles.evict_by_name(name);
            drive.delete_file(name);
        }
        self.set_result(0);
        Ok(())
    }

    fn bdos_make(&mut self, de: u16) -> CpmResult<()> {
        let mut fcb = self.read_fcb(de);
        let filename = fcb.filename();
        if filename.is_empty() {
            self.set_result(0xFF);
            return Ok(());
        }
        let drive_idx = self.effective_drive(fcb.drive);
        let key = fcb.cache_key(drive_idx);
        self.handles.evict_by_name(&filename);

        let Some(drive) = self.drives.get_mut(drive_idx as usize).and_then(|d| d.as_mut()) else {
            self.set_result(0xFF);
            return Ok(());
        };
        drive.write_file(&filename, &[])?;

        fcb.reset_extent();
        self.write_fcb(de, &fcb);

        self.handles.insert(
            key,
            FileHandle {
                drive: drive_idx,
                filename: filename.clone(),
                data: Vec::new(),
                modified: false,
                read_only: false,
                is_submit_spool: filename.ends_with("$$$.SUB"),
            },
        );
        self.set_result(0);
        Ok(())
    }

    fn bdos_rename(&mut self, de: u16) -> CpmResult<()> {
        let src = self.read_fcb(de);
        let dst = self.read_fcb(de.wrapping_add(16));
        let drive_idx = self.effective_drive(src.drive);
        let src_name = src.filename();
        let dst_name = dst.filename();

        let Some(drive) = self.drives.get_mut(drive_idx as usize).and_then(|d| d.as_mut()) else {
            self.set_result(0xFF);
            return Ok(());
        };
        let Some(data) = drive.read_file(&src_name) else {
            self.set_result(0xFF);
            return Ok(());
        };
        self.handles.evict_by_name(&src_name);
        drive.write_file(&dst_name, &data)?;
        drive.delete_file(&src_name);
        self.set_result(0);
        Ok(())
    }

    fn bdos_read_sequential(&mut self, de: u16) -> CpmResult<()> {
        let mut fcb = self.read_fcb(de);
        let drive_idx = self.effective_drive(fcb.drive);
        let key = fcb.cache_key(drive_idx);
        let offset = fcb.sequential_offset() as usize;
        let dma = self.dma;

        let Some(handle) = self.handles.get(key) else {
            self.set_result(0xFF);
            return Ok(());
        };
        if offset >= handle.data.len() {
            self.set_result(1);
            return Ok(());
        }
        let end = (offset + RECORD_SIZE).min(handle.data.len());
        let mut record = [0x1Au8; RECORD_SIZE];
        record[..end - offset].copy_from_slice(&handle.data[offset..end]);
        self.memory.write_range(dma, &record);

        fcb.advance_sequential();
        self.write_fcb(de, &fcb);
        self.set_result(0);
        Ok(())
    }

    fn bdos_write_sequential(&mut self, de: u16) -> CpmResult<()> {
        let mut fcb = self.read_fcb(de);
        let drive_idx = self.effective_drive(fcb.drive);
        let key = fcb.cache_key(drive_idx);
        let offset = fcb.sequential_offset() as usize;
        let record = self.memory.read_range(self.dma, RECORD_SIZE).to_vec();

        let Some(handle) = self.handles.get_mut(key) else {
            self.set_result(0xFF);
            return Ok(());
        };
        if handle.read_only {
            return Err(CpmError::ReadOnly);
        }
        if handle.data.len() < offset + RECORD_SIZE {
            handle.data.resize(offset + RECORD_SIZE, 0);
        }
        handle.data[offset..offset + RECORD_SIZE].copy_from_slice(&record);
        handle.modified = true;

        fcb.advance_sequential();
        fcb.rc = fcb.rc.saturating_add(1);
        self.write_fcb(de, &fcb);
        self.set_result(0);
        Ok(())
    }

    fn bdos_read_random(&mut self, de: u16) -> CpmResult<()> {
        let fcb = self.read_fcb(de);
        let drive_idx = self.effective_drive(fcb.drive);
        let key = fcb.cache_key(drive_idx);
        let offset = fcb.random_record() as usize * RECORD_SIZE;
        let dma = self.dma;

        let Some(handle) = self.handles.get(key) else {
            self.set_result(0xFF);
            return Ok(());
        };
        if offset >= handle.data.len() {
            self.memory.fill(dma, RECORD_SIZE, 0x1A);
            self.set_result(6);
            return Ok(());
        }
        let end = (offset + RECORD_SIZE).min(handle.data.len());
        let mut record = [0x1Au8; RECORD_SIZE];
        record[..end - offset].copy_from_slice(&handle.data[offset..end]);
        self.memory.write_range(dma, &record);
        self.set_result(if end - offset < RECORD_SIZE { 1 } else { 0 });
        Ok(())
    }

    fn bdos_write_random(&mut self, de: u16) -> CpmResult<()> {
        let fcb = self.read_fcb(de);
        let drive_idx = self.effective_drive(fcb.drive);
        let key = fcb.cache_key(drive_idx);
        let offset = fcb.random_record() as usize * RECORD_SIZE;
        let record = self.memory.read_range(self.dma, RECORD_SIZE).to_vec();

        let Some(handle) = self.handles.get_mut(key) else {
            self.set_result(0xFF);
            return Ok(());
        };
        if handle.read_only {
            return Err(CpmError::ReadOnly);
        }
        if handle.data.len() < offset + RECORD_SIZE {
            handle.data.resize(offset + RECORD_SIZE, 0);
        }
        handle.data[offset..offset + RECORD_SIZE].copy_from_slice(&record);
        handle.modified = true;
        self.set_result(0);
        Ok(())
    }

    fn bdos_compute_size(&mut self, de: u16) {
        let mut fcb = self.read_fcb(de);
        let drive_idx = self.effective_drive(fcb.drive);
        let filename = fcb.filename();
        let size = self
            .drives
            .get(drive_idx as usize)
            .and_then(|d| d.as_ref())
            .and_then(|d| d.read_file(&filename))
            .map(|d| d.len())
            .unwrap_or(0);
        let records = ((size + RECORD_SIZE - 1) / RECORD_SIZE).min(65536) as u32;
        fcb.set_random_record(records);
        self.write_fcb(de, &fcb);
    }

    fn bdos_set_random_record(&mut self, de: u16) {
        let mut fcb = self.read_fcb(de);
        let record = fcb.sequential_record();
        fcb.set_random_record(record);
        self.write_fcb(de, &fcb);
    }

    // --- Console line editing (BDOS 10) ------------------------------------

    fn read_console_line(&mut self, max: usize) -> CpmResult<String> {
        let mut buf = String::new();
        loop {
            let byte = self.next_input_byte();
            if byte != CTRL_C {
                self.ctrl_c_count = 0;
            }

            match byte {
                b'\r' | b'\n' => {
                    if !self.cmd_prefix.is_empty() && buf.starts_with(self.cmd_prefix.as_str()) {
                        let remainder = buf[self.cmd_prefix.len()..].trim().to_string();
                        if let Some(dir) = remainder.strip_prefix("cd ") {
                            let _ = std::env::set_current_dir(dir.trim());
                        } else {
                            let output = run_host_command(&remainder);
                            for b in output.bytes() {
                                self.console.write(b);
                            }
                        }
                        buf.clear();
                        continue;
                    }
                    buf.truncate(max);
                    self.history.push(buf.clone());
                    self.history_index = None;
                    return Ok(buf);
                }
                BACKSPACE | DEL => {
                    if buf.pop().is_some() {
                        self.console.write(BACKSPACE);
                        self.console.write(b' ');
                        self.console.write(BACKSPACE);
                    }
                }
                ESC => {
                    for _ in 0..buf.chars().count() {
                        self.console.write(BACKSPACE);
                        self.console.write(b' ');
                        self.console.write(BACKSPACE);
                    }
                    buf.clear();
                }
                CTRL_P => {
                    if let Some(entry) = self.step_history(-1) {
                        self.replace_buffer(&mut buf, &entry);
                    }
                }
                CTRL_N => {
                    let entry = self.step_history(1).unwrap_or_default();
                    self.replace_buffer(&mut buf, &entry);
                }
                CTRL_C => {
                    self.ctrl_c_count += 1;
                    if self.ctrl_c_count >= self.ctrl_c_threshold {
                        self.ctrl_c_count = 0;
                        return Err(CpmError::Interrupted);
                    }
                }
                printable if buf.chars().count() < max => {
                    buf.push(printable as char);
                    self.console.write(printable);
                }
                _ => {}
            }
        }
    }

    fn step_history(&mut self, delta: i32) -> Option<String> {
        if self.history.is_empty() {
            return None;
        }
        let last = self.history.len() - 1;
        let next_index = match (self.history_index, delta) {
            (None, d) if d < 0 => Some(last),
            (None, _) => None,
            (Some(i), d) if d < 0 => Some(i.saturating_sub(1)),
            (Some(i), _) if i < last => Some(i + 1),
            (Some(_), _) => None,
        };
        self.history_index = next_index;
        next_index.map(|i| self.history[i].clone())
    }

    fn replace_buffer(&mut self, buf: &mut String, new_value: &str) {
        for _ in 0..buf.chars().count() {
            self.console.write(BACKSPACE);
            self.console.write(b' ');
            self.console.write(BACKSPACE);
        }
        buf.clear();
        buf.push_str(new_value);
        for b in buf.bytes() {
            self.console.write(b);
        }
    }

    // --- BIOS dispatch -------------------------------------------------------

    fn handle_cbios(&mut self, func: u8) -> CpmResult<Option<CpmExitInfo>> {
        if self.trace {
            tracing::trace!(function = func, "bios call");
        }

        match func {
            0 => {
                // COLDBOOT
                self.current_drive = 0;
                self.current_user = 0;
                self.dma = addr::DEFAULT_DMA;
                self.handles.clear();
                return Ok(Some(self.exit_info(ExitReason::Boot)));
            }
            1 => return Ok(Some(self.exit_info(ExitReason::Boot))), // WARMBOOT
            2 => self.set_result(if self.console.has_key() { 0xFF } else { 0 }), // CONST
            3 => {
                // CONIN
                let ch = self.next_input_byte();
                self.set_result(ch);
            }
            4 => {
                // CONOUT
                let c = self.cpu.get_reg(Reg8::C, None);
                self.console.write(c);
            }
            5 => {
                // LIST
                let c = self.cpu.get_reg(Reg8::C, None);
                self.printer.write_byte(c)?;
            }
            15 | 17 | 18 | 19 => self.set_result(0xFF), // LISTST/CONOST/AUXIST/AUXOST
            31 => self.handle_bios_extension()?,
            other => return Err(CpmError::Unimplemented(other)),
        }
        self.set_zero_flag_from_a();
        Ok(None)
    }

    /// Sets the Z80 flag register's Z bit to match whether A is zero,
    /// leaving the other flag bits untouched.
    fn set_zero_flag_from_a(&mut self) {
        const ZERO_FLAG: u8 = 0x40;
        let a = self.cpu.get_reg(Reg8::A, None);
        let f = self.cpu.get_reg(Reg8::F, None);
        let f = if a == 0 { f | ZERO_FLAG } else { f & !ZERO_FLAG };
        self.cpu.set_reg(Reg8::F, None, f);
    }

    fn handle_bios_extension(&mut self) -> CpmResult<()> {
        let h = self.cpu.get_reg(Reg8::H, None);
        let c = self.cpu.get_reg(Reg8::C, None);
        let de = self.cpu.get_reg16(StkReg16::DE);

        match h {
            0 => {
                // "Am I cpmulator?"
                self.cpu.set_reg(Reg8::H, None, b'S');
                self.cpu.set_reg(Reg8::L, None, b'K');
                self.cpu.set_reg(Reg8::A, None, b'X');
                let banner = self.banner.replace('\n', "\r\n");
                let dma = self.dma;
                self.memory.write_range(dma, banner.as_bytes());
            }
            1 => {
                if c == 0xFF {
                    self.cpu.set_reg(Reg8::A, None, self.ctrl_c_threshold as u8);
                } else {
                    self.ctrl_c_threshold = c as u32;
                }
            }
            2 => self.driver_name_transaction(de, false),
            3 => self.ccp_name_transaction(de),
            5 => {
                let (cols, rows) = crossterm::terminal::size().unwrap_or((80, 24));
                self.cpu.set_reg(Reg8::H, None, rows.min(255) as u8);
                self.cpu.set_reg(Reg8::L, None, cols.min(255) as u8);
            }
            6 => {
                if c == 0xFF {
                    self.cpu.set_reg(Reg8::C, None, self.trace as u8);
                } else {
                    self.trace = c != 0;
                }
            }
            7 => self.driver_name_transaction(de, true),
            8 => {
                if de == 0 {
                    let dma = self.dma;
                    self.memory.write_range(dma, self.cmd_prefix.as_bytes());
                    self.memory
                        .write_byte(dma.wrapping_add(self.cmd_prefix.len() as u16), 0);
                } else {
                    self.cmd_prefix = self.read_name_at(de);
                }
            }
            _ => {}
        }
        Ok(())
    }

    fn driver_name_transaction(&mut self, de: u16, is_input: bool) {
        if de == 0 {
            let name = if is_input {
                self.input_name.clone()
            } else {
                self.console_name.clone()
            };
            let dma = self.dma;
            self.memory.write_range(dma, name.as_bytes());
            self.memory.write_byte(dma.wrapping_add(name.len() as u16), 0);
        } else {
            let name = self.read_name_at(de);
            if is_input {
                self.input_name = name;
            } else {
                self.console_name = name;
            }
        }
    }

    fn ccp_name_transaction(&mut self, de: u16) {
        if de == 0 {
            let dma = self.dma;
            self.memory.write_range(dma, self.ccp_name.as_bytes());
            self.memory
                .write_byte(dma.wrapping_add(self.ccp_name.len() as u16), 0);
        } else {
            self.ccp_name = self.read_name_at(de);
        }
    }

    /// Read a NUL- or space-terminated name out of guest memory, case-folded
    /// to lowercase for driver-registry lookups.
    fn read_name_at(&self, addr: u16) -> String {
        let mut s = String::new();
        let mut a = addr;
        loop {
            let b = self.memory.read_byte(a);
            if b == 0 || b == b' ' {
                break;
            }
            s.push((b as char).to_ascii_lowercase());
            a = a.wrapping_add(1);
            if s.len() > 32 {
                break;
            }
        }
        s
    }
}

fn run_host_command(command: &str) -> String {
    let output = std::process::Command::new("sh").arg("-c").arg(command).output();
    match output {
        Ok(out) => String::from_utf8_lossy(&out.stdout).into_owned(),
        Err(e) => format!("{}", e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::console::HeadlessConsole;
    use crate::fs::MemoryDriveFS;

    fn make_emulator() -> CpmEmulator<HeadlessConsole, MemoryDriveFS> {
        std::env::remove_var("BDOS_ADDRESS");
        std::env::remove_var("BIOS_ADDRESS");
        CpmEmulator::new(HeadlessConsole::new())
    }

    #[test]
    fn test_emulator_creation() {
        let emu = make_emulator();
        assert_eq!(emu.memory.read_byte(0x0000), 0x76);
        assert_eq!(emu.memory.read_word(0x0006), addr::BDOS.wrapping_add(6));
    }

    #[test]
    fn test_hello_world() {
        let mut emu = make_emulator();
        emu.mount(0, MemoryDriveFS::new());
        // LD E,'H' ; LD C,2 (C_WRITE) ; CALL 5 ; LD C,0 (P_TERMCPM) ; CALL 5
        let prog = [
            0x1E, b'H', // LD E,'H'
            0x0E, 0x02, // LD C,2
            0xCD, 0x05, 0x00, // CALL 5
            0x0E, 0x00, // LD C,0
            0xCD, 0x05, 0x00, // CALL 5
        ];
        emu.load_com(&prog);
        let info = emu.run().unwrap();
        assert_eq!(info.reason, ExitReason::Exit);
        assert_eq!(emu.console().output(), b"H");
    }

    #[test]
    fn bios_jump_table_traps_to_port_ff() {
        let mut emu = make_emulator();
        let bios = emu.bios_addr;
        // CALL into BIOS entry 4 (CONOUT) with C='!' then HALT.
        let mut prog = vec![0x0E, b'!']; // LD C,'!'
        prog.push(0xCD);
        prog.extend_from_slice(&(bios + 4 * 3).to_le_bytes());
        prog.push(0x76); // HALT
        emu.load_com(&prog);
        let info = emu.run().unwrap();
        assert_eq!(info.reason, ExitReason::Halt);
        assert_eq!(emu.console().output(), b"!");
    }

    #[test]
    fn open_nonexistent_file_returns_ff() {
        let mut emu = make_emulator();
        emu.mount(0, MemoryDriveFS::new());
        let fcb = Fcb::parse_filename("NOPE.TXT");
        emu.memory.write_range(addr::FCB1, &fcb.to_bytes());
        emu.bdos_open(addr::FCB1).unwrap();
        assert_eq!(emu.cpu.get_reg(Reg8::A, None), 0xFF);
    }

    #[test]
    fn write_then_read_sequential_round_trips() {
        let mut emu = make_emulator();
        let mut fs = MemoryDriveFS::new();
        fs.add_file("FOO.TXT", Vec::new());
        emu.mount(0, fs);

        let fcb = Fcb::parse_filename("FOO.TXT");
        emu.memory.write_range(addr::FCB1, &fcb.to_bytes());
        let payload = b"hello cpm";
        emu.memory.fill(addr::DEFAULT_DMA, RECORD_SIZE, 0);
        emu.memory.write_range(addr::DEFAULT_DMA, payload);

        emu.bdos_open(addr::FCB1).unwrap();
        assert_eq!(emu.cpu.get_reg(Reg8::A, None), 0);
        emu.bdos_write_sequential(addr::FCB1).unwrap();
        assert_eq!(emu.cpu.get_reg(Reg8::A, None), 0);

        let fcb = Fcb::parse_filename("FOO.TXT");
        emu.memory.write_range(addr::FCB1, &fcb.to_bytes());
        emu.memory.fill(addr::DEFAULT_DMA, RECORD_SIZE, 0);
        emu.bdos_read_sequential(addr::FCB1).unwrap();
        assert_eq!(&emu.memory.read_range(addr::DEFAULT_DMA, payload.len()), &payload);
    }

    #[test]
    fn find_first_enumerates_matching_files() {
        let mut emu = make_emulator();
        let mut fs = MemoryDriveFS::new();
        fs.add_file("A.TXT", b"x".to_vec());
        fs.add_file("B.TXT", b"y".to_vec());
        fs.add_file("C.COM", b"z".to_vec());
        emu.mount(0, fs);

        let pattern = Fcb::parse_filename("*.TXT");
        emu.memory.write_range(addr::FCB1, &pattern.to_bytes());
        emu.bdos_search_first(addr::FCB1).unwrap();
        assert_eq!(emu.cpu.get_reg(Reg8::A, None), 0);
        emu.bdos_search_next().unwrap();
        assert_eq!(emu.cpu.get_reg(Reg8::A, None), 0);
        emu.bdos_search_next().unwrap();
        assert_eq!(emu.cpu.get_reg(Reg8::A, None), 0xFF);
    }

    #[test]
    fn find_first_on_non_default_drive_reads_size_from_that_drive() {
        let mut emu = make_emulator();
        emu.mount(0, MemoryDriveFS::new());
        let mut fs_b = MemoryDriveFS::new();
        fs_b.add_file("R.DAT", vec![0u8; 200]); // 2 records
        emu.mount(1, fs_b);

        let pattern = Fcb::parse_filename("B:R.DAT");
        emu.memory.write_range(addr::FCB1, &pattern.to_bytes());
        emu.bdos_search_first(addr::FCB1).unwrap();
        assert_eq!(emu.cpu.get_reg(Reg8::A, None), 0);

        let result = Fcb::from_bytes(emu.memory.read_range(emu.dma, FCB_SIZE).try_into().unwrap());
        assert_eq!(result.rc, 2);
    }

    #[test]
    fn read_random_past_eof_fills_ctrl_z_and_returns_six() {
        let mut emu = make_emulator();
        let mut fs = MemoryDriveFS::new();
        fs.add_file("R.DAT", vec![0u8; 10]);
        emu.mount(0, fs);

        let fcb = Fcb::parse_filename("R.DAT");
        emu.memory.write_range(addr::FCB1, &fcb.to_bytes());
        emu.bdos_open(addr::FCB1).unwrap();

        let mut fcb = emu.read_fcb(addr::FCB1);
        fcb.set_random_record(5);
        emu.write_fcb(addr::FCB1, &fcb);
        emu.bdos_read_random(addr::FCB1).unwrap();
        assert_eq!(emu.cpu.get_reg(Reg8::A, None), 6);
        assert_eq!(emu.memory.read_byte(addr::DEFAULT_DMA), 0x1A);
    }

    #[test]
    fn compute_size_rounds_up_to_whole_records() {
        let mut emu = make_emulator();
        let mut fs = MemoryDriveFS::new();
        fs.add_file("S.DAT", vec![0u8; 200]); // 2 records (ceil(200/128) == 2)
        emu.mount(0, fs);

        let fcb = Fcb::parse_filename("S.DAT");
        emu.memory.write_range(addr::FCB1, &fcb.to_bytes());
        emu.bdos_compute_size(addr::FCB1);

        let fcb = emu.read_fcb(addr::FCB1);
        assert_eq!(fcb.random_record(), 2);
    }

    #[test]
    fn line_editor_truncates_to_max_length() {
        let mut emu = make_emulator();
        emu.injected = "abcdef\r".bytes().collect();
        let line = emu.read_console_line(3).unwrap();
        assert_eq!(line, "abc");
    }

    #[test]
    fn line_editor_double_ctrl_c_interrupts() {
        let mut emu = make_emulator();
        emu.injected = [CTRL_C, CTRL_C].into_iter().collect();
        let err = emu.read_console_line(10).unwrap_err();
        assert!(matches!(err, CpmError::Interrupted));
    }

    #[test]
    fn select_disk_invariant_drive_user_byte() {
        let mut emu = make_emulator();
        emu.mount(1, MemoryDriveFS::new());
        emu.dispatch_bdos(BdosFunction::SelectDisk, 1, 0).unwrap();
        assert_eq!(emu.memory.read_byte(0x0004), 0x01);
        assert_eq!(emu.cpu.get_reg(Reg8::A, None), 0);
    }
}
