// The BIOS/DOS service layer (C4): a dispatch table of synthesised
// interrupt handlers built on top of the 8086 interpreter's registered-
// handler seam. Registers itself against a `Cpu` the same
// way the teacher's MFP wired fixed vectors to hardware state, except the
// "hardware" here is a video framebuffer, a FAT12 engine, and a free-bump
// allocator.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use chrono::{Datelike, Timelike};

use crate::errors::DosError;
use crate::fat12::{DirEntry, Fat12, ATTR_DIRECTORY, ATTR_HIDDEN, ATTR_SYSTEM, ATTR_VOLUME_LABEL};
use crate::fields::{bit, Reg16, Reg8, SegReg};
use crate::memory::physical_address;
use crate::processor::{Cpu, HaltReason};
use crate::storage::SectorStore;

const VIDEO_MEMORY: usize = 0xB8000;
const GRAPHICS_MEMORY: usize = 0xA0000;
const GRAPHICS_WIDTH: usize = 320;
const COLUMNS: u8 = 80;
const ROWS: u8 = 25;
const DEFAULT_ATTR: u8 = 0x07;

/// Renders the 80x25 text framebuffer at 0xB8000 as plain lines, for hosts
/// (like `dosrun --debug`) that want a quick look without a real renderer.
pub fn render_text_screen(cpu: &Cpu) -> String {
    let mut out = String::with_capacity((COLUMNS as usize + 1) * ROWS as usize);
    for row in 0..ROWS {
        for col in 0..COLUMNS {
            let addr = VIDEO_MEMORY + (row as usize * COLUMNS as usize + col as usize) * 2;
            let ch = cpu.memory.read_u8(addr);
            out.push(if ch.is_ascii_graphic() || ch == b' ' { ch as char } else { ' ' });
        }
        out.push('\n');
    }
    out
}

struct VideoState {
    mode: u8,
    cursor_row: u8,
    cursor_col: u8,
}

impl Default for VideoState {
    fn default() -> Self {
        VideoState { mode: 0x03, cursor_row: 0, cursor_col: 0 }
    }
}

impl VideoState {
    fn cell_address(&self, row: u8, col: u8) -> usize {
        VIDEO_MEMORY + (row as usize * COLUMNS as usize + col as usize) * 2
    }

    fn scroll_up(&self, cpu: &mut Cpu) {
        for row in 1..ROWS {
            for col in 0..COLUMNS {
                let from = self.cell_address(row, col);
                let to = self.cell_address(row - 1, col);
                let ch = cpu.memory.read_u8(from);
                let attr = cpu.memory.read_u8(from + 1);
                cpu.memory.write_u8(to, ch);
                cpu.memory.write_u8(to + 1, attr);
            }
        }
        for col in 0..COLUMNS {
            let addr = self.cell_address(ROWS - 1, col);
            cpu.memory.write_u8(addr, b' ');
            cpu.memory.write_u8(addr + 1, DEFAULT_ATTR);
        }
    }

    fn advance(&mut self, cpu: &mut Cpu) {
        self.cursor_col += 1;
        if self.cursor_col >= COLUMNS {
            self.cursor_col = 0;
            self.newline(cpu);
        }
    }

    fn newline(&mut self, cpu: &mut Cpu) {
        if self.cursor_row + 1 >= ROWS {
            self.scroll_up(cpu);
        } else {
            self.cursor_row += 1;
        }
    }

    fn teletype(&mut self, cpu: &mut Cpu, ch: u8) {
        match ch {
            0x07 => {}
            0x08 => self.cursor_col = self.cursor_col.saturating_sub(1),
            0x0A => self.newline(cpu),
            0x0D => self.cursor_col = 0,
            _ => {
                let addr = self.cell_address(self.cursor_row, self.cursor_col);
                cpu.memory.write_u8(addr, ch);
                cpu.memory.write_u8(addr + 1, DEFAULT_ATTR);
                self.advance(cpu);
            }
        }
    }
}

struct OpenFile {
    dir: Vec<String>,
    name: String,
    contents: Vec<u8>,
    position: usize,
    mode: u8,
    modified: bool,
    date: u16,
    time: u16,
}

struct MemoryAllocator {
    next_free: u16,
    allocations: Vec<(u16, u16, u16)>,
}

const CONVENTIONAL_MEMORY_TOP: u16 = 0xA000;

impl MemoryAllocator {
    fn new() -> Self {
        MemoryAllocator { next_free: 0x1000, allocations: Vec::new() }
    }

    fn largest_available(&self) -> u16 {
        CONVENTIONAL_MEMORY_TOP.saturating_sub(self.next_free)
    }

    fn allocate(&mut self, paragraphs: u16, owner_psp: u16) -> Option<u16> {
        let end = self.next_free.checked_add(paragraphs)?;
        if end > CONVENTIONAL_MEMORY_TOP {
            return None;
        }
        let segment = self.next_free;
        self.allocations.push((segment, paragraphs, owner_psp));
        self.next_free = end;
        Some(segment)
    }

    fn free(&mut self, segment: u16) -> bool {
        match self.allocations.iter().position(|&(s, _, _)| s == segment) {
            Some(i) => {
                self.allocations.remove(i);
                true
            }
            None => false,
        }
    }
}

#[derive(Default)]
struct MouseState {
    x: u16,
    y: u16,
    buttons: u8,
    visible: bool,
}

struct FindState {
    entries: Vec<DirEntry>,
    next: usize,
}

/// Owns every piece of machine state a BIOS/DOS handler needs besides the
/// `Cpu` itself: the filesystem, open files, the video cursor, and the
/// memory allocator. Shared across handler closures via `Rc<RefCell<_>>`
/// since each vector is registered as an independent `FnMut`.
pub struct Bios<S: SectorStore> {
    fs: Fat12<S>,
    open_files: HashMap<u8, OpenFile>,
    next_handle: u8,
    video: VideoState,
    allocator: MemoryAllocator,
    mouse: MouseState,
    cwd: Vec<String>,
    dta: (u16, u16),
    find: Option<FindState>,
}

impl<S: SectorStore + 'static> Bios<S> {
    pub fn new(fs: Fat12<S>, psp_segment: u16) -> Rc<RefCell<Self>> {
        Rc::new(RefCell::new(Bios {
            fs,
            open_files: HashMap::new(),
            next_handle: 5,
            video: VideoState::default(),
            allocator: MemoryAllocator::new(),
            mouse: MouseState::default(),
            cwd: Vec::new(),
            dta: (psp_segment, 0x80),
            find: None,
        }))
    }

    /// Registers every synthesised interrupt vector the BIOS/DOS layer serves onto `cpu`.
    pub fn install(cpu: &mut Cpu, bios: &Rc<RefCell<Bios<S>>>) {
        macro_rules! handler {
            ($method:ident) => {{
                let bios = bios.clone();
                Box::new(move |cpu: &mut Cpu| bios.borrow_mut().$method(cpu))
            }};
        }
        cpu.register_handler(0x10, handler!(int10));
        cpu.register_handler(0x11, handler!(int11));
        cpu.register_handler(0x12, handler!(int12));
        cpu.register_handler(0x13, handler!(int13));
        cpu.register_handler(0x14, handler!(int14));
        cpu.register_handler(0x15, handler!(int15));
        cpu.register_handler(0x16, handler!(int16));
        cpu.register_handler(0x17, handler!(int17));
        cpu.register_handler(0x19, handler!(int19));
        cpu.register_handler(0x1A, handler!(int1a));
        cpu.register_handler(0x20, handler!(terminate));
        cpu.register_handler(0x21, handler!(int21));
        cpu.register_handler(0x22, handler!(noop));
        cpu.register_handler(0x23, handler!(noop));
        cpu.register_handler(0x24, handler!(noop));
        cpu.register_handler(0x27, handler!(terminate));
        cpu.register_handler(0x28, handler!(noop));
        cpu.register_handler(0x2F, handler!(noop));
        cpu.register_handler(0x33, handler!(int33));
    }

    /// Flushes the filesystem out to its backing medium, if any.
    pub fn persist(&mut self) -> std::io::Result<()> {
        self.fs.persist()
    }

    fn noop(&mut self, _cpu: &mut Cpu) {}

    fn terminate(&mut self, cpu: &mut Cpu) {
        cpu.halt(HaltReason::ProgramExit);
    }

    // ---- INT 10h: video ----------------------------------------------

    fn int10(&mut self, cpu: &mut Cpu) {
        match cpu.reg8(Reg8::Ah) {
            0x00 => self.video.mode = cpu.reg8(Reg8::Al),
            0x02 => {
                self.video.cursor_row = cpu.reg8(Reg8::Dh);
                self.video.cursor_col = cpu.reg8(Reg8::Dl);
            }
            0x03 => {
                cpu.set_reg8(Reg8::Dh, self.video.cursor_row);
                cpu.set_reg8(Reg8::Dl, self.video.cursor_col);
                cpu.set_reg16(Reg16::Cx, 0);
            }
            0x06 | 0x07 => self.video.scroll_up(cpu),
            0x08 => {
                let addr = self.video.cell_address(self.video.cursor_row, self.video.cursor_col);
                cpu.set_reg8(Reg8::Al, cpu.memory.read_u8(addr));
                cpu.set_reg8(Reg8::Ah, cpu.memory.read_u8(addr + 1));
            }
            0x09 => {
                let ch = cpu.reg8(Reg8::Al);
                let attr = cpu.reg8(Reg8::Bl);
                let count = cpu.reg16(Reg16::Cx);
                let (row, mut col) = (self.video.cursor_row, self.video.cursor_col);
                for _ in 0..count {
                    let addr = self.video.cell_address(row, col);
                    cpu.memory.write_u8(addr, ch);
                    cpu.memory.write_u8(addr + 1, attr);
                    col = col.saturating_add(1).min(COLUMNS - 1);
                }
            }
            0x0A => {
                let ch = cpu.reg8(Reg8::Al);
                let count = cpu.reg16(Reg16::Cx);
                let (row, mut col) = (self.video.cursor_row, self.video.cursor_col);
                for _ in 0..count {
                    let addr = self.video.cell_address(row, col);
                    cpu.memory.write_u8(addr, ch);
                    col = col.saturating_add(1).min(COLUMNS - 1);
                }
            }
            0x0E => {
                let ch = cpu.reg8(Reg8::Al);
                self.video.teletype(cpu, ch);
            }
            0x0C => {
                let x = cpu.reg16(Reg16::Cx) as usize;
                let y = cpu.reg16(Reg16::Dx) as usize;
                let color = cpu.reg8(Reg8::Al);
                cpu.memory.write_u8(GRAPHICS_MEMORY + y * GRAPHICS_WIDTH + x, color);
            }
            0x0D => {
                let x = cpu.reg16(Reg16::Cx) as usize;
                let y = cpu.reg16(Reg16::Dx) as usize;
                cpu.set_reg8(Reg8::Al, cpu.memory.read_u8(GRAPHICS_MEMORY + y * GRAPHICS_WIDTH + x));
            }
            0x0F => {
                cpu.set_reg8(Reg8::Al, self.video.mode);
                cpu.set_reg8(Reg8::Ah, COLUMNS);
                cpu.set_reg8(Reg8::Bh, 0);
            }
            ah => log::trace!("int10: ignoring unsupported AH={ah:#04x}"),
        }
    }

    // ---- INT 11h/12h: equipment/memory size ---------------------------

    fn int11(&mut self, cpu: &mut Cpu) {
        cpu.set_reg16(Reg16::Ax, 0x0021);
    }

    fn int12(&mut self, cpu: &mut Cpu) {
        cpu.set_reg16(Reg16::Ax, 640);
    }

    // ---- INT 13h: disk --------------------------------------------------

    fn int13(&mut self, cpu: &mut Cpu) {
        const HEADS: u16 = 2;
        const SECTORS_PER_TRACK: u16 = 18;
        match cpu.reg8(Reg8::Ah) {
            0x00 => cpu.flags.set(bit::CF, false),
            0x02 => {
                let sector_count = cpu.reg8(Reg8::Al) as u16;
                let cylinder = cpu.reg8(Reg8::Ch) as u16;
                let head = cpu.reg8(Reg8::Dh) as u16;
                let sector = cpu.reg8(Reg8::Cl) as u16;
                let lba = (cylinder * HEADS + head) * SECTORS_PER_TRACK + (sector - 1);
                let dest_seg = cpu.seg(SegReg::Es);
                let dest_off = cpu.reg16(Reg16::Bx);
                let mut dest = physical_address(dest_seg, dest_off);
                for s in 0..sector_count {
                    match self.fs.read_raw_sector(lba as u32 + s as u32) {
                        Some(bytes) => {
                            for byte in bytes {
                                cpu.memory.write_u8(dest, byte);
                                dest += 1;
                            }
                        }
                        None => {
                            cpu.flags.set(bit::CF, true);
                            cpu.set_reg8(Reg8::Ah, 0x04);
                            return;
                        }
                    }
                }
                cpu.flags.set(bit::CF, false);
                cpu.set_reg8(Reg8::Ah, 0x00);
            }
            0x08 => {
                cpu.set_reg8(Reg8::Bl, 0x04);
                cpu.set_reg8(Reg8::Ch, 79);
                cpu.set_reg8(Reg8::Cl, (SECTORS_PER_TRACK & 0x3f) as u8);
                cpu.set_reg8(Reg8::Dh, (HEADS - 1) as u8);
                cpu.set_reg8(Reg8::Dl, 1);
                cpu.flags.set(bit::CF, false);
            }
            0x15 => {
                cpu.set_reg8(Reg8::Ah, 0x01);
                cpu.set_reg16(Reg16::Cx, 2880);
                cpu.set_reg16(Reg16::Dx, 0);
                cpu.flags.set(bit::CF, false);
            }
            ah => log::trace!("int13: ignoring unsupported AH={ah:#04x}"),
        }
    }

    // ---- INT 14h: serial (always reports timeout) ----------------------

    fn int14(&mut self, cpu: &mut Cpu) {
        cpu.set_reg8(Reg8::Ah, 0x80);
    }

    // ---- INT 15h: system services ---------------------------------------

    fn int15(&mut self, cpu: &mut Cpu) {
        match cpu.reg8(Reg8::Ah) {
            0x86 => {
                let micros = ((cpu.reg16(Reg16::Cx) as u32) << 16) | cpu.reg16(Reg16::Dx) as u32;
                log::trace!("int15 AH=86: busy-wait for {micros} microseconds (coarse proxy, not actually delayed)");
                cpu.flags.set(bit::CF, false);
            }
            0x88 => cpu.set_reg16(Reg16::Ax, 0),
            0x24 => cpu.flags.set(bit::CF, false),
            ah => log::trace!("int15: ignoring unsupported AH={ah:#04x}"),
        }
    }

    // ---- INT 16h: keyboard -----------------------------------------------

    fn int16(&mut self, cpu: &mut Cpu) {
        match cpu.reg8(Reg8::Ah) {
            0x00 | 0x10 => match cpu.keyboard.pop() {
                Some(word) => cpu.set_reg16(Reg16::Ax, word),
                None => {
                    cpu.ip = cpu.ip.wrapping_sub(2);
                    cpu.halt(HaltReason::KeyWait);
                }
            },
            0x01 | 0x11 => match cpu.keyboard.peek() {
                Some(word) => {
                    cpu.set_reg16(Reg16::Ax, word);
                    cpu.flags.set(bit::ZF, false);
                }
                None => cpu.flags.set(bit::ZF, true),
            },
            0x02 => cpu.set_reg8(Reg8::Al, 0),
            ah => log::trace!("int16: ignoring unsupported AH={ah:#04x}"),
        }
    }

    // ---- INT 17h: printer (stub) -----------------------------------------

    fn int17(&mut self, cpu: &mut Cpu) {
        cpu.set_reg8(Reg8::Ah, 0x00);
    }

    // ---- INT 19h: bootstrap -----------------------------------------------

    fn int19(&mut self, cpu: &mut Cpu) {
        self.int13(cpu);
        cpu.cs = 0;
        cpu.ip = 0x7C00;
    }

    // ---- INT 1Ah: clock ---------------------------------------------------

    fn int1a(&mut self, cpu: &mut Cpu) {
        let now = chrono::Local::now();
        match cpu.reg8(Reg8::Ah) {
            0x00 => {
                cpu.set_reg16(Reg16::Cx, 0);
                cpu.set_reg16(Reg16::Dx, 0);
                cpu.set_reg8(Reg8::Al, 0);
            }
            0x02 => {
                cpu.set_reg8(Reg8::Ch, to_bcd(now.hour() as u8));
                cpu.set_reg8(Reg8::Cl, to_bcd(now.minute() as u8));
                cpu.set_reg8(Reg8::Dh, to_bcd(now.second() as u8));
                cpu.set_reg8(Reg8::Dl, 0);
                cpu.flags.set(bit::CF, false);
            }
            0x04 => {
                cpu.set_reg8(Reg8::Ch, to_bcd((now.year() / 100) as u8));
                cpu.set_reg8(Reg8::Cl, to_bcd((now.year() % 100) as u8));
                cpu.set_reg8(Reg8::Dh, to_bcd(now.month() as u8));
                cpu.set_reg8(Reg8::Dl, to_bcd(now.day() as u8));
                cpu.flags.set(bit::CF, false);
            }
            ah => log::trace!("int1a: ignoring unsupported AH={ah:#04x}"),
        }
    }

    // ---- INT 33h: mouse -----------------------------------------------------

    fn int33(&mut self, cpu: &mut Cpu) {
        match cpu.reg16(Reg16::Ax) {
            0x0000 => {
                cpu.set_reg16(Reg16::Ax, 0xFFFF);
                cpu.set_reg16(Reg16::Bx, 2);
            }
            0x0001 => self.mouse.visible = true,
            0x0002 => self.mouse.visible = false,
            0x0003 => {
                cpu.set_reg16(Reg16::Bx, self.mouse.buttons as u16);
                cpu.set_reg16(Reg16::Cx, self.mouse.x);
                cpu.set_reg16(Reg16::Dx, self.mouse.y);
            }
            0x0004 => {
                self.mouse.x = cpu.reg16(Reg16::Cx);
                self.mouse.y = cpu.reg16(Reg16::Dx);
            }
            0x000B => {
                cpu.set_reg16(Reg16::Cx, 0);
                cpu.set_reg16(Reg16::Dx, 0);
            }
            ax => log::trace!("int33: ignoring unsupported AX={ax:#06x}"),
        }
    }

    // ---- INT 21h: DOS ---------------------------------------------------

    fn int21(&mut self, cpu: &mut Cpu) {
        match cpu.reg8(Reg8::Ah) {
            0x01 | 0x07 | 0x08 => self.dos_char_input(cpu, cpu.reg8(Reg8::Ah) == 0x01),
            0x02 => self.video.teletype(cpu, cpu.reg8(Reg8::Dl)),
            0x06 => {
                let dl = cpu.reg8(Reg8::Dl);
                if dl == 0xFF {
                    match cpu.keyboard.pop() {
                        Some(word) => {
                            cpu.set_reg8(Reg8::Al, (word & 0xff) as u8);
                            cpu.flags.set(bit::ZF, false);
                        }
                        None => cpu.flags.set(bit::ZF, true),
                    }
                } else {
                    self.video.teletype(cpu, dl);
                }
            }
            0x09 => self.dos_print_dollar_string(cpu),
            0x0A => self.dos_buffered_input(cpu),
            0x1A => self.dta = (cpu.seg(SegReg::Ds), cpu.reg16(Reg16::Dx)),
            0x25 => {
                let vector = cpu.reg8(Reg8::Al);
                let addr = physical_address(0, vector as u16 * 4);
                cpu.memory.write_u16(addr, cpu.reg16(Reg16::Dx));
                cpu.memory.write_u16(addr + 2, cpu.seg(SegReg::Ds));
            }
            0x35 => {
                let vector = cpu.reg8(Reg8::Al);
                let addr = physical_address(0, vector as u16 * 4);
                cpu.set_reg16(Reg16::Bx, cpu.memory.read_u16(addr));
                cpu.set_seg(SegReg::Es, cpu.memory.read_u16(addr + 2));
            }
            0x2A => {
                let now = chrono::Local::now();
                cpu.set_reg16(Reg16::Cx, now.year() as u16);
                cpu.set_reg8(Reg8::Dh, now.month() as u8);
                cpu.set_reg8(Reg8::Dl, now.day() as u8);
                cpu.set_reg8(Reg8::Al, now.weekday().num_days_from_sunday() as u8);
            }
            0x2C => {
                let now = chrono::Local::now();
                cpu.set_reg8(Reg8::Ch, now.hour() as u8);
                cpu.set_reg8(Reg8::Cl, now.minute() as u8);
                cpu.set_reg8(Reg8::Dh, now.second() as u8);
                cpu.set_reg8(Reg8::Dl, (now.timestamp_subsec_millis() / 10) as u8);
            }
            0x30 => {
                cpu.set_reg8(Reg8::Al, 5);
                cpu.set_reg8(Reg8::Ah, 0);
                cpu.set_reg16(Reg16::Bx, 0);
                cpu.set_reg16(Reg16::Cx, 0);
            }
            0x3B => self.dos_chdir(cpu),
            0x3C => self.dos_create(cpu),
            0x3D => self.dos_open(cpu),
            0x3E => self.dos_close(cpu),
            0x3F => self.dos_read(cpu),
            0x40 => self.dos_write(cpu),
            0x41 => self.dos_delete(cpu),
            0x42 => self.dos_seek(cpu),
            0x43 => self.dos_attributes(cpu),
            0x44 => succeed(cpu),
            0x47 => self.dos_cwd(cpu),
            0x48 => self.dos_allocate(cpu),
            0x49 => self.dos_free(cpu),
            0x4A => self.dos_resize(cpu),
            0x4B => fail(cpu, DosError::FileNotFound),
            0x4C => cpu.halt(HaltReason::ProgramExit),
            0x4E => self.dos_find_first(cpu),
            0x4F => self.dos_find_next(cpu),
            0x56 => self.dos_rename(cpu),
            0x57 => self.dos_file_date_time(cpu),
            ah => log::trace!("int21: ignoring unsupported AH={ah:#04x}"),
        }
    }

    fn dos_char_input(&mut self, cpu: &mut Cpu, echo: bool) {
        match cpu.keyboard.pop() {
            Some(word) => {
                let ascii = (word & 0xff) as u8;
                cpu.set_reg8(Reg8::Al, ascii);
                if echo {
                    self.video.teletype(cpu, ascii);
                }
            }
            None => {
                cpu.ip = cpu.ip.wrapping_sub(2);
                cpu.halt(HaltReason::KeyWait);
            }
        }
    }

    fn dos_print_dollar_string(&mut self, cpu: &mut Cpu) {
        let seg = cpu.seg(SegReg::Ds);
        let mut offset = cpu.reg16(Reg16::Dx);
        loop {
            let ch = cpu.memory.read_u8(physical_address(seg, offset));
            if ch == b'$' {
                break;
            }
            self.video.teletype(cpu, ch);
            offset = offset.wrapping_add(1);
        }
    }

    fn dos_buffered_input(&mut self, cpu: &mut Cpu) {
        let seg = cpu.seg(SegReg::Ds);
        let offset = cpu.reg16(Reg16::Dx);
        let base = physical_address(seg, offset);
        let max_len = cpu.memory.read_u8(base).max(1) as usize - 1;
        let mut read = 0;
        while read < max_len {
            match cpu.keyboard.pop() {
                Some(word) => {
                    let ascii = (word & 0xff) as u8;
                    if ascii == 0x0D {
                        break;
                    }
                    cpu.memory.write_u8(base + 2 + read, ascii);
                    self.video.teletype(cpu, ascii);
                    read += 1;
                }
                None => break,
            }
        }
        cpu.memory.write_u8(base + 1, read as u8);
    }

    fn dos_chdir(&mut self, cpu: &mut Cpu) {
        let (dir, name) = split_dos_path(&read_asciiz(cpu, cpu.seg(SegReg::Ds), cpu.reg16(Reg16::Dx)));
        let mut path = dir;
        path.push(name);
        match self.fs.list_dir(&path) {
            Ok(_) => {
                self.cwd = path;
                succeed(cpu);
            }
            Err(_) => fail(cpu, DosError::PathNotFound),
        }
    }

    fn dos_cwd(&mut self, cpu: &mut Cpu) {
        let text = self.cwd.join("\\");
        write_asciiz(cpu, cpu.seg(SegReg::Ds), cpu.reg16(Reg16::Si), &text);
        succeed(cpu);
    }

    fn resolve_path(&self, raw: &str) -> (Vec<String>, String) {
        let (mut dir, name) = split_dos_path(raw);
        if dir.is_empty() {
            dir = self.cwd.clone();
        }
        (dir, name)
    }

    fn dos_create(&mut self, cpu: &mut Cpu) {
        let path = read_asciiz(cpu, cpu.seg(SegReg::Ds), cpu.reg16(Reg16::Dx));
        let (dir, name) = self.resolve_path(&path);
        match self.fs.write_file(&dir, &name, &[]) {
            Ok(()) => {
                let handle = self.next_handle;
                self.next_handle += 1;
                let (date, time) = current_date_time();
                self.open_files.insert(handle, OpenFile { dir, name, contents: Vec::new(), position: 0, mode: 2, modified: false, date, time });
                cpu.set_reg16(Reg16::Ax, handle as u16);
                succeed(cpu);
            }
            Err(e) => fail(cpu, e.into()),
        }
    }

    fn dos_open(&mut self, cpu: &mut Cpu) {
        let path = read_asciiz(cpu, cpu.seg(SegReg::Ds), cpu.reg16(Reg16::Dx));
        let (dir, name) = self.resolve_path(&path);
        let mode = cpu.reg8(Reg8::Al);
        match self.fs.read_file(&dir, &name) {
            Ok(contents) => {
                let entry = self.fs.list_dir(&dir).ok().and_then(|entries| entries.into_iter().find(|e| e.name == name.to_uppercase()));
                let (date, time) = entry.map(|e| (e.date, e.time)).unwrap_or_default();
                let handle = self.next_handle;
                self.next_handle += 1;
                self.open_files.insert(handle, OpenFile { dir, name, contents, position: 0, mode, modified: false, date, time });
                cpu.set_reg16(Reg16::Ax, handle as u16);
                succeed(cpu);
            }
            Err(_) => fail(cpu, DosError::FileNotFound),
        }
    }

    fn dos_close(&mut self, cpu: &mut Cpu) {
        let handle = cpu.reg16(Reg16::Bx) as u8;
        match self.open_files.remove(&handle) {
            Some(file) => {
                if file.modified {
                    match self.fs.write_file(&file.dir, &file.name, &file.contents) {
                        Ok(()) => succeed(cpu),
                        Err(e) => fail(cpu, e.into()),
                    }
                } else {
                    succeed(cpu);
                }
            }
            None => fail(cpu, DosError::InvalidHandle),
        }
    }

    fn dos_read(&mut self, cpu: &mut Cpu) {
        let handle = cpu.reg16(Reg16::Bx) as u8;
        let count = cpu.reg16(Reg16::Cx) as usize;
        let dest_seg = cpu.seg(SegReg::Ds);
        let dest_off = cpu.reg16(Reg16::Dx);
        let Some(file) = self.open_files.get_mut(&handle) else {
            fail(cpu, DosError::InvalidHandle);
            return;
        };
        let available = file.contents.len().saturating_sub(file.position);
        let n = count.min(available);
        let base = physical_address(dest_seg, dest_off);
        for i in 0..n {
            cpu.memory.write_u8(base + i, file.contents[file.position + i]);
        }
        file.position += n;
        cpu.set_reg16(Reg16::Ax, n as u16);
        succeed(cpu);
    }

    fn dos_write(&mut self, cpu: &mut Cpu) {
        let handle = cpu.reg16(Reg16::Bx) as u8;
        let count = cpu.reg16(Reg16::Cx) as usize;
        let src_seg = cpu.seg(SegReg::Ds);
        let src_off = cpu.reg16(Reg16::Dx);
        let Some(file) = self.open_files.get_mut(&handle) else {
            fail(cpu, DosError::InvalidHandle);
            return;
        };
        if file.mode & 0x03 == 0 {
            fail(cpu, DosError::AccessDenied);
            return;
        }
        let base = physical_address(src_seg, src_off);
        for i in 0..count {
            let byte = cpu.memory.read_u8(base + i);
            if file.position < file.contents.len() {
                file.contents[file.position] = byte;
            } else {
                file.contents.push(byte);
            }
            file.position += 1;
        }
        file.modified = true;
        cpu.set_reg16(Reg16::Ax, count as u16);
        succeed(cpu);
    }

    fn dos_delete(&mut self, cpu: &mut Cpu) {
        let path = read_asciiz(cpu, cpu.seg(SegReg::Ds), cpu.reg16(Reg16::Dx));
        let (dir, name) = self.resolve_path(&path);
        match self.fs.delete_entry(&dir, &name) {
            Ok(true) => succeed(cpu),
            Ok(false) => fail(cpu, DosError::FileNotFound),
            Err(e) => fail(cpu, e.into()),
        }
    }

    fn dos_seek(&mut self, cpu: &mut Cpu) {
        let handle = cpu.reg16(Reg16::Bx) as u8;
        let mode = cpu.reg8(Reg8::Al);
        let offset = ((cpu.reg16(Reg16::Cx) as u32) << 16 | cpu.reg16(Reg16::Dx) as u32) as i64;
        let Some(file) = self.open_files.get_mut(&handle) else {
            fail(cpu, DosError::InvalidHandle);
            return;
        };
        let base = match mode {
            0 => 0i64,
            1 => file.position as i64,
            _ => file.contents.len() as i64,
        };
        let new_pos = (base + offset).max(0) as usize;
        file.position = new_pos;
        cpu.set_reg16(Reg16::Ax, (new_pos & 0xffff) as u16);
        cpu.set_reg16(Reg16::Dx, (new_pos >> 16) as u16);
        succeed(cpu);
    }

    fn dos_attributes(&mut self, cpu: &mut Cpu) {
        let path = read_asciiz(cpu, cpu.seg(SegReg::Ds), cpu.reg16(Reg16::Dx));
        let (dir, name) = self.resolve_path(&path);
        if cpu.reg8(Reg8::Al) == 0x01 {
            log::trace!("int21 AH=43 AL=01: attribute mutation is not modelled by the FAT12 engine, ignoring");
            succeed(cpu);
            return;
        }
        match self.fs.list_dir(&dir).ok().and_then(|entries| entries.into_iter().find(|e| e.name == name.to_uppercase())) {
            Some(entry) => {
                cpu.set_reg16(Reg16::Cx, entry.attributes as u16);
                succeed(cpu);
            }
            None => fail(cpu, DosError::FileNotFound),
        }
    }

    fn dos_allocate(&mut self, cpu: &mut Cpu) {
        let paragraphs = cpu.reg16(Reg16::Bx);
        match self.allocator.allocate(paragraphs, cpu.cs) {
            Some(segment) => {
                cpu.set_reg16(Reg16::Ax, segment);
                succeed(cpu);
            }
            None => {
                cpu.set_reg16(Reg16::Bx, self.allocator.largest_available());
                fail(cpu, DosError::InsufficientMemory);
            }
        }
    }

    fn dos_free(&mut self, cpu: &mut Cpu) {
        let segment = cpu.seg(SegReg::Es);
        if self.allocator.free(segment) {
            succeed(cpu);
        } else {
            fail(cpu, DosError::InvalidHandle);
        }
    }

    fn dos_resize(&mut self, cpu: &mut Cpu) {
        let segment = cpu.seg(SegReg::Es);
        let paragraphs = cpu.reg16(Reg16::Bx);
        self.allocator.free(segment);
        match self.allocator.allocate(paragraphs, cpu.cs) {
            Some(_) => succeed(cpu),
            None => {
                cpu.set_reg16(Reg16::Bx, self.allocator.largest_available());
                fail(cpu, DosError::InsufficientMemory);
            }
        }
    }

    fn dos_find_first(&mut self, cpu: &mut Cpu) {
        let path = read_asciiz(cpu, cpu.seg(SegReg::Ds), cpu.reg16(Reg16::Dx));
        let (dir, pattern) = self.resolve_path(&path);
        let attr_mask = cpu.reg16(Reg16::Cx) as u8;
        let entries = self.fs.list_dir(&dir).unwrap_or_default();
        let visible: Vec<DirEntry> = entries
            .into_iter()
            .filter(|e| glob_match(&pattern, &e.name))
            .filter(|e| e.attributes & (ATTR_HIDDEN | ATTR_SYSTEM) == 0 || e.attributes & attr_mask & (ATTR_HIDDEN | ATTR_SYSTEM) != 0)
            .filter(|e| e.attributes & ATTR_DIRECTORY == 0 || attr_mask & ATTR_DIRECTORY != 0)
            .filter(|e| e.attributes & ATTR_VOLUME_LABEL == 0 || attr_mask & ATTR_VOLUME_LABEL != 0)
            .collect();
        log::trace!("find-first in {dir:?} matching {pattern:?}: {} entries", visible.len());
        self.find = Some(FindState { entries: visible, next: 0 });
        self.emit_find_result(cpu);
    }

    fn dos_find_next(&mut self, cpu: &mut Cpu) {
        self.emit_find_result(cpu);
    }

    fn emit_find_result(&mut self, cpu: &mut Cpu) {
        let Some(state) = self.find.as_mut() else {
            fail(cpu, DosError::NoMoreFiles);
            return;
        };
        let Some(entry) = state.entries.get(state.next).cloned() else {
            fail(cpu, DosError::NoMoreFiles);
            return;
        };
        state.next += 1;
        let (seg, off) = self.dta;
        let base = physical_address(seg, off);
        cpu.memory.write_u8(base + 0x15, entry.attributes);
        cpu.memory.write_u16(base + 0x16, entry.time);
        cpu.memory.write_u16(base + 0x18, entry.date);
        cpu.memory.write_u16(base + 0x1A, (entry.size & 0xffff) as u16);
        cpu.memory.write_u16(base + 0x1C, (entry.size >> 16) as u16);
        for (i, &byte) in entry.name.as_bytes().iter().enumerate().take(12) {
            cpu.memory.write_u8(base + 0x1E + i, byte);
        }
        cpu.memory.write_u8(base + 0x1E + entry.name.len().min(12), 0);
        succeed(cpu);
    }

    fn dos_rename(&mut self, cpu: &mut Cpu) {
        let old_path = read_asciiz(cpu, cpu.seg(SegReg::Ds), cpu.reg16(Reg16::Dx));
        let new_path = read_asciiz(cpu, cpu.seg(SegReg::Es), cpu.reg16(Reg16::Di));
        let (old_dir, old_name) = self.resolve_path(&old_path);
        let (new_dir, new_name) = self.resolve_path(&new_path);
        if old_dir != new_dir {
            fail(cpu, DosError::PathNotFound);
            return;
        }
        match self.fs.rename_entry(&old_dir, &old_name, &new_name) {
            Ok(()) => succeed(cpu),
            Err(e) => fail(cpu, e.into()),
        }
    }

    fn dos_file_date_time(&mut self, cpu: &mut Cpu) {
        let handle = cpu.reg16(Reg16::Bx) as u8;
        let set = cpu.reg8(Reg8::Al) == 1;
        let Some(file) = self.open_files.get_mut(&handle) else {
            fail(cpu, DosError::InvalidHandle);
            return;
        };
        if set {
            file.time = cpu.reg16(Reg16::Cx);
            file.date = cpu.reg16(Reg16::Dx);
        } else {
            cpu.set_reg16(Reg16::Cx, file.time);
            cpu.set_reg16(Reg16::Dx, file.date);
        }
        succeed(cpu);
    }
}

fn fail(cpu: &mut Cpu, err: DosError) {
    cpu.flags.set(bit::CF, true);
    cpu.set_reg16(Reg16::Ax, err.code());
}

fn succeed(cpu: &mut Cpu) {
    cpu.flags.set(bit::CF, false);
}

fn to_bcd(value: u8) -> u8 {
    ((value / 10) << 4) | (value % 10)
}

fn current_date_time() -> (u16, u16) {
    let now = chrono::Local::now();
    let date = (((now.year() - 1980).max(0) as u16) << 9) | ((now.month() as u16) << 5) | now.day() as u16;
    let time = ((now.hour() as u16) << 11) | ((now.minute() as u16) << 5) | (now.second() as u16 / 2);
    (date, time)
}

fn read_asciiz(cpu: &Cpu, seg: u16, offset: u16) -> String {
    let mut bytes = Vec::new();
    let mut addr = physical_address(seg, offset);
    loop {
        let byte = cpu.memory.read_u8(addr);
        if byte == 0 {
            break;
        }
        bytes.push(byte);
        addr += 1;
    }
    String::from_utf8_lossy(&bytes).into_owned()
}

fn write_asciiz(cpu: &mut Cpu, seg: u16, offset: u16, text: &str) {
    let mut addr = physical_address(seg, offset);
    for &byte in text.as_bytes() {
        cpu.memory.write_u8(addr, byte);
        addr += 1;
    }
    cpu.memory.write_u8(addr, 0);
}

/// Splits a DOS-style path (optional drive letter, `\`-separated
/// components) into directory components and a trailing filename.
fn split_dos_path(path: &str) -> (Vec<String>, String) {
    let without_drive = match path.split_once(':') {
        Some((_, rest)) => rest,
        None => path,
    };
    let mut components: Vec<String> =
        without_drive.split(['\\', '/']).filter(|c| !c.is_empty()).map(|c| c.to_uppercase()).collect();
    let name = components.pop().unwrap_or_default();
    (components, name)
}

/// Classic DOS 8.3 wildcard matching: `*` consumes the remainder of the
/// current field, `?` matches exactly one character, everything else must
/// match literally (case-insensitive, both sides already uppercased).
fn glob_match(pattern: &str, name: &str) -> bool {
    fn matches(pattern: &[u8], name: &[u8]) -> bool {
        match (pattern.first(), name.first()) {
            (None, None) => true,
            (Some(b'*'), _) => {
                matches(&pattern[1..], name) || (!name.is_empty() && matches(pattern, &name[1..]))
            }
            (Some(b'?'), Some(_)) => matches(&pattern[1..], &name[1..]),
            (Some(p), Some(n)) if p.eq_ignore_ascii_case(n) => matches(&pattern[1..], &name[1..]),
            _ => false,
        }
    }
    matches(pattern.as_bytes(), name.as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemorySectorStore;

    fn setup() -> (Cpu, Rc<RefCell<Bios<MemorySectorStore>>>) {
        let mut cpu = Cpu::new();
        let mut fs = Fat12::new(MemorySectorStore::new());
        fs.format("TESTVOL");
        let bios = Bios::new(fs, 0x1000);
        Bios::install(&mut cpu, &bios);
        (cpu, bios)
    }

    #[test]
    fn teletype_writes_char_and_attribute_then_advances_cursor() {
        let (mut cpu, _bios) = setup();
        cpu.set_reg8(Reg8::Ah, 0x0E);
        cpu.set_reg8(Reg8::Al, b'H');
        cpu.interrupt(0x10);
        assert_eq!(cpu.memory.read_u8(VIDEO_MEMORY), b'H');
        assert_eq!(cpu.memory.read_u8(VIDEO_MEMORY + 1), 0x07);
    }

    #[test]
    fn int20_halts_with_program_exit() {
        let (mut cpu, _bios) = setup();
        cpu.interrupt(0x20);
        assert!(cpu.halted);
        assert_eq!(cpu.halt_reason, HaltReason::ProgramExit);
    }

    #[test]
    fn int21_ah4c_halts_with_program_exit() {
        let (mut cpu, _bios) = setup();
        cpu.set_reg8(Reg8::Ah, 0x4C);
        cpu.interrupt(0x21);
        assert!(cpu.halted);
        assert_eq!(cpu.halt_reason, HaltReason::ProgramExit);
    }

    #[test]
    fn blocking_keyboard_read_on_empty_buffer_sets_key_wait_and_rewinds_ip() {
        let (mut cpu, _bios) = setup();
        cpu.ip = 0x100;
        cpu.set_reg8(Reg8::Ah, 0x00);
        cpu.interrupt(0x16);
        assert!(cpu.halted);
        assert_eq!(cpu.halt_reason, HaltReason::KeyWait);
    }

    #[test]
    fn blocking_keyboard_read_pops_buffered_key() {
        let (mut cpu, _bios) = setup();
        cpu.keyboard.push(0x1E, b'a');
        cpu.set_reg8(Reg8::Ah, 0x00);
        cpu.interrupt(0x16);
        assert!(!cpu.halted);
        assert_eq!(cpu.reg8(Reg8::Al), b'a');
    }

    #[test]
    fn create_write_close_then_open_read_round_trips_through_fat12() {
        let (mut cpu, _bios) = setup();
        cpu.ds = 0;
        write_asciiz(&mut cpu, 0, 0x200, "A.TXT");
        cpu.set_reg8(Reg8::Ah, 0x3C);
        cpu.set_reg16(Reg16::Dx, 0x200);
        cpu.interrupt(0x21);
        let handle = cpu.reg16(Reg16::Ax);

        write_asciiz(&mut cpu, 0, 0x300, "hi");
        cpu.set_reg8(Reg8::Ah, 0x40);
        cpu.set_reg16(Reg16::Bx, handle);
        cpu.set_reg16(Reg16::Cx, 2);
        cpu.set_reg16(Reg16::Dx, 0x300);
        cpu.interrupt(0x21);
        assert_eq!(cpu.reg16(Reg16::Ax), 2);

        cpu.set_reg8(Reg8::Ah, 0x3E);
        cpu.set_reg16(Reg16::Bx, handle);
        cpu.interrupt(0x21);

        cpu.set_reg8(Reg8::Ah, 0x3D);
        cpu.set_reg8(Reg8::Al, 0);
        cpu.set_reg16(Reg16::Dx, 0x200);
        cpu.interrupt(0x21);
        let handle2 = cpu.reg16(Reg16::Ax);

        cpu.set_reg8(Reg8::Ah, 0x3F);
        cpu.set_reg16(Reg16::Bx, handle2);
        cpu.set_reg16(Reg16::Cx, 2);
        cpu.set_reg16(Reg16::Dx, 0x400);
        cpu.interrupt(0x21);
        assert_eq!(cpu.reg16(Reg16::Ax), 2);
        assert_eq!(cpu.memory.read_u8(0x400), b'h');
        assert_eq!(cpu.memory.read_u8(0x401), b'i');
    }

    #[test]
    fn closing_a_modified_file_on_a_full_disk_reports_insufficient_memory() {
        let (mut cpu, bios) = setup();
        {
            // Leave exactly one free cluster: enough for `B.TXT`'s initial
            // (empty) creation below, none left over for the larger content
            // its close tries to flush.
            let mut bios = bios.borrow_mut();
            let free_bytes = (bios.fs.free_clusters() - 1) * 512;
            bios.fs.write_file(&[], "FILLER.BIN", &vec![0u8; free_bytes]).unwrap();
            assert_eq!(bios.fs.free_clusters(), 1);
        }

        cpu.ds = 0;
        write_asciiz(&mut cpu, 0, 0x200, "B.TXT");
        cpu.set_reg8(Reg8::Ah, 0x3C);
        cpu.set_reg16(Reg16::Dx, 0x200);
        cpu.interrupt(0x21);
        let handle = cpu.reg16(Reg16::Ax);
        assert!(!cpu.flags.cf());

        let payload = vec![b'x'; 600];
        for (i, &b) in payload.iter().enumerate() {
            cpu.memory.write_u8(0x5000 + i, b);
        }
        cpu.set_reg8(Reg8::Ah, 0x40);
        cpu.set_reg16(Reg16::Bx, handle);
        cpu.set_reg16(Reg16::Cx, payload.len() as u16);
        cpu.set_reg16(Reg16::Dx, 0x5000);
        cpu.interrupt(0x21);
        assert!(!cpu.flags.cf());

        cpu.set_reg8(Reg8::Ah, 0x3E);
        cpu.set_reg16(Reg16::Bx, handle);
        cpu.interrupt(0x21);

        assert!(cpu.flags.cf());
        assert_eq!(cpu.reg16(Reg16::Ax), DosError::InsufficientMemory.code());
    }

    #[test]
    fn opening_a_missing_file_reports_file_not_found_with_carry_set() {
        let (mut cpu, _bios) = setup();
        write_asciiz(&mut cpu, 0, 0x200, "GHOST.TXT");
        cpu.set_reg8(Reg8::Ah, 0x3D);
        cpu.set_reg8(Reg8::Al, 0);
        cpu.set_reg16(Reg16::Dx, 0x200);
        cpu.interrupt(0x21);
        assert!(cpu.flags.get(bit::CF));
        assert_eq!(cpu.reg16(Reg16::Ax), 0x02);
    }

    #[test]
    fn allocate_then_free_memory_block() {
        let (mut cpu, _bios) = setup();
        cpu.set_reg8(Reg8::Ah, 0x48);
        cpu.set_reg16(Reg16::Bx, 0x100);
        cpu.interrupt(0x21);
        assert!(!cpu.flags.get(bit::CF));
        let segment = cpu.reg16(Reg16::Ax);
        assert_eq!(segment, 0x1000);

        cpu.set_reg8(Reg8::Ah, 0x49);
        cpu.set_seg(SegReg::Es, segment);
        cpu.interrupt(0x21);
        assert!(!cpu.flags.get(bit::CF));
    }

    #[test]
    fn glob_match_supports_star_and_question_mark() {
        assert!(glob_match("*.TXT", "A.TXT"));
        assert!(glob_match("A?.TXT", "AB.TXT"));
        assert!(!glob_match("A?.TXT", "ABC.TXT"));
        assert!(glob_match("*.*", "README.MD"));
    }
}
