// Program loading and the session scheduler (C5): recognising COM/MZ
// images, building the PSP, and driving the interpreter in wall-clock
// bounded ticks.

use std::cell::RefCell;
use std::rc::Rc;
use std::time::{Duration, Instant};

use crate::bios::Bios;
use crate::errors::LoadError;
use crate::fields::{Reg16, SegReg};
use crate::memory::physical_address;
use crate::processor::{Cpu, HaltReason};
use crate::psp::{self, PSP_SIZE};
use crate::storage::SectorStore;

const MZ_SIGNATURE: [u8; 2] = [0x4D, 0x5A];
const MZ_HEADER_LEN: usize = 28;
const STEPS_PER_TICK: u32 = 100_000;
const TICK_BUDGET: Duration = Duration::from_millis(14);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ImageKind {
    Com,
    Mz,
}

fn recognise(image: &[u8]) -> Result<ImageKind, LoadError> {
    if image.is_empty() {
        return Err(LoadError::EmptyImage);
    }
    if image.len() >= 2 && image[0..2] == MZ_SIGNATURE {
        Ok(ImageKind::Mz)
    } else {
        Ok(ImageKind::Com)
    }
}

/// Loads `image` into a fresh PSP-prefixed segment and leaves `cpu` poised
/// at the program's entry point, ready to run.
pub fn load(
    cpu: &mut Cpu,
    image: &[u8],
    psp_segment: u16,
    env_segment: u16,
    command_tail: &str,
    program_name: &str,
) -> Result<(), LoadError> {
    match recognise(image)? {
        ImageKind::Com => load_com(cpu, image, psp_segment, env_segment, command_tail, program_name),
        ImageKind::Mz => load_mz(cpu, image, psp_segment, env_segment, command_tail, program_name),
    }
}

fn load_com(
    cpu: &mut Cpu,
    image: &[u8],
    psp_segment: u16,
    env_segment: u16,
    command_tail: &str,
    program_name: &str,
) -> Result<(), LoadError> {
    let top_of_memory = psp_segment.wrapping_add(0x1000);
    psp::write_psp(&mut cpu.memory, psp_segment, top_of_memory, env_segment, command_tail);
    psp::write_environment_block(&mut cpu.memory, env_segment, program_name);

    let base = physical_address(psp_segment, PSP_SIZE);
    for (i, &byte) in image.iter().enumerate() {
        cpu.memory.write_u8(base + i, byte);
    }

    cpu.cs = psp_segment;
    cpu.ds = psp_segment;
    cpu.set_seg(SegReg::Es, psp_segment);
    cpu.set_seg(SegReg::Ss, psp_segment);
    cpu.ip = PSP_SIZE;
    cpu.set_reg16(Reg16::Sp, 0xFFFE);
    let sp = cpu.reg16(Reg16::Sp);
    cpu.memory.write_u16(physical_address(psp_segment, sp), 0x0000);
    Ok(())
}

fn load_mz(
    cpu: &mut Cpu,
    image: &[u8],
    psp_segment: u16,
    env_segment: u16,
    command_tail: &str,
    program_name: &str,
) -> Result<(), LoadError> {
    if image.len() < MZ_HEADER_LEN {
        return Err(LoadError::TruncatedHeader);
    }
    let header_paragraphs = u16::from_le_bytes([image[8], image[9]]);
    let reloc_count = u16::from_le_bytes([image[6], image[7]]);
    let reloc_table_offset = u16::from_le_bytes([image[24], image[25]]) as usize;
    let initial_ss = u16::from_le_bytes([image[14], image[15]]);
    let initial_sp = u16::from_le_bytes([image[16], image[17]]);
    let initial_ip = u16::from_le_bytes([image[20], image[21]]);
    let initial_cs = u16::from_le_bytes([image[22], image[23]]);

    let header_size = header_paragraphs as usize * 16;
    if header_size > image.len() {
        return Err(LoadError::TruncatedHeader);
    }

    let load_segment = psp_segment.wrapping_add(PSP_SIZE / 16);
    psp::write_psp(&mut cpu.memory, psp_segment, psp_segment.wrapping_add(0x1000), env_segment, command_tail);
    psp::write_environment_block(&mut cpu.memory, env_segment, program_name);

    let body = &image[header_size..];
    let base = physical_address(load_segment, 0);
    for (i, &byte) in body.iter().enumerate() {
        cpu.memory.write_u8(base + i, byte);
    }

    for i in 0..reloc_count as usize {
        let entry_off = reloc_table_offset + i * 4;
        if entry_off + 4 > image.len() {
            return Err(LoadError::BadRelocation);
        }
        let offset = u16::from_le_bytes([image[entry_off], image[entry_off + 1]]);
        let segment = u16::from_le_bytes([image[entry_off + 2], image[entry_off + 3]]);
        let patch_addr = physical_address(load_segment.wrapping_add(segment), offset);
        let current = cpu.memory.read_u16(patch_addr);
        cpu.memory.write_u16(patch_addr, current.wrapping_add(load_segment));
    }

    cpu.cs = initial_cs.wrapping_add(load_segment);
    cpu.ip = initial_ip;
    cpu.set_seg(SegReg::Ss, initial_ss.wrapping_add(load_segment));
    cpu.set_reg16(Reg16::Sp, initial_sp);
    cpu.ds = psp_segment;
    cpu.set_seg(SegReg::Es, psp_segment);
    Ok(())
}

/// Parameters the orchestrator needs to start a session: everything
/// `load` takes, plus the segments the session lives at.
pub struct SessionConfig {
    pub psp_segment: u16,
    pub env_segment: u16,
    pub command_tail: String,
    pub program_name: String,
}

impl Default for SessionConfig {
    fn default() -> Self {
        SessionConfig {
            psp_segment: 0x1000,
            env_segment: 0x0FF0,
            command_tail: String::new(),
            program_name: String::new(),
        }
    }
}

/// Drives `cpu` in wall-clock-bounded ticks until the program exits.
/// `on_tick` runs once per tick (e.g. to render the framebuffer) and
/// `pump_keyboard` is consulted whenever the interpreter is halted on a
/// key-wait, so the host can feed input and wake it back up.
pub fn run_session<S: SectorStore>(
    cpu: &mut Cpu,
    _bios: &Rc<RefCell<Bios<S>>>,
    mut on_tick: impl FnMut(&Cpu),
    mut pump_keyboard: impl FnMut(&mut Cpu) -> bool,
) {
    loop {
        let tick_start = Instant::now();
        let mut steps_this_tick = 0;
        while steps_this_tick < STEPS_PER_TICK && tick_start.elapsed() < TICK_BUDGET {
            if cpu.halted {
                break;
            }
            cpu.step();
            steps_this_tick += 1;
        }
        on_tick(cpu);
        if cpu.halted {
            match cpu.halt_reason {
                HaltReason::ProgramExit | HaltReason::Hlt => return,
                HaltReason::KeyWait => {
                    if pump_keyboard(cpu) {
                        cpu.resume_from_key_wait();
                    }
                }
                HaltReason::None => unreachable!("halted with reason None"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fields::Reg8;
    use crate::processor::Cpu;

    #[test]
    fn empty_image_is_rejected() {
        let mut cpu = Cpu::new();
        let err = load(&mut cpu, &[], 0x1000, 0x0FF0, "", "").unwrap_err();
        assert!(matches!(err, LoadError::EmptyImage));
    }

    #[test]
    fn com_image_loads_at_offset_0x100_with_psp_segments() {
        let mut cpu = Cpu::new();
        let image = [0xB4, 0x4C, 0xCD, 0x21];
        load(&mut cpu, &image, 0x1000, 0x0FF0, "", "").unwrap();
        assert_eq!(cpu.cs, 0x1000);
        assert_eq!(cpu.ds, 0x1000);
        assert_eq!(cpu.ip, 0x100);
        assert_eq!(cpu.reg16(Reg16::Sp), 0xFFFE);
        let base = physical_address(0x1000, 0x100);
        assert_eq!(cpu.memory.read_u8(base), 0xB4);
    }

    #[test]
    fn com_image_writes_program_name_not_command_tail_into_environment_block() {
        let mut cpu = Cpu::new();
        load(&mut cpu, &[0x90], 0x1000, 0x0FF0, "/C dir", "C:\\BIN\\DIR.COM").unwrap();
        let base = physical_address(0x0FF0, 0);
        // COMSPEC, PATH, PROMPT, TEMP each NUL-terminated, then an empty
        // string, then the u16 var count, then the program name.
        let vars_len = "COMSPEC=C:\\COMMAND.COM\0PATH=C:\\\0PROMPT=$P$G\0TEMP=C:\\TEMP\0".len();
        let name_base = base + vars_len + 1 + 2;
        let mut name = Vec::new();
        let mut i = 0;
        loop {
            let b = cpu.memory.read_u8(name_base + i);
            if b == 0 {
                break;
            }
            name.push(b);
            i += 1;
        }
        assert_eq!(String::from_utf8(name).unwrap(), "C:\\BIN\\DIR.COM");
    }

    #[test]
    fn com_image_pushes_zero_return_address_at_top_of_stack() {
        let mut cpu = Cpu::new();
        load(&mut cpu, &[0x90], 0x1000, 0x0FF0, "", "").unwrap();
        let addr = physical_address(0x1000, 0xFFFE);
        assert_eq!(cpu.memory.read_u16(addr), 0x0000);
    }

    #[test]
    fn truncated_mz_header_is_rejected() {
        let mut cpu = Cpu::new();
        let image = [0x4D, 0x5A, 0, 0];
        let err = load(&mut cpu, &image, 0x1000, 0x0FF0, "", "").unwrap_err();
        assert!(matches!(err, LoadError::TruncatedHeader));
    }

    #[test]
    fn mz_image_relocates_a_segment_fixup_by_the_load_segment() {
        // Header occupies 3 paragraphs (48 bytes): the 28-byte fixed header
        // plus one 4-byte relocation entry at offset 28, padded out to the
        // paragraph boundary. The body (what gets relocated) starts right
        // after, at byte 48.
        let mut header = [0u8; 48];
        header[0..2].copy_from_slice(&MZ_SIGNATURE);
        header[6..8].copy_from_slice(&1u16.to_le_bytes()); // reloc count
        header[8..10].copy_from_slice(&3u16.to_le_bytes()); // header paragraphs
        header[14..16].copy_from_slice(&0u16.to_le_bytes()); // initial SS
        header[16..18].copy_from_slice(&0xFFFEu16.to_le_bytes()); // initial SP
        header[20..22].copy_from_slice(&0u16.to_le_bytes()); // initial IP
        header[22..24].copy_from_slice(&0u16.to_le_bytes()); // initial CS
        header[24..26].copy_from_slice(&28u16.to_le_bytes()); // reloc table offset
        header[28..30].copy_from_slice(&0u16.to_le_bytes()); // reloc entry: offset 0
        header[30..32].copy_from_slice(&0u16.to_le_bytes()); // reloc entry: segment 0 (patches load_segment:0)
        let mut image = header.to_vec();
        image.extend_from_slice(&0x9090u16.to_le_bytes()); // the word to relocate, at body offset 0

        let mut cpu = Cpu::new();
        load(&mut cpu, &image, 0x1000, 0x0FF0, "", "").unwrap();
        let load_segment = 0x1000u16.wrapping_add(PSP_SIZE / 16);
        let patched = cpu.memory.read_u16(physical_address(load_segment, 0));
        assert_eq!(patched, 0x9090u16.wrapping_add(load_segment));
    }

    #[test]
    fn session_tears_down_when_program_exits() {
        let mut cpu = Cpu::new();
        let fs = crate::fat12::Fat12::new(crate::storage::MemorySectorStore::new());
        let bios = Bios::new(fs, 0x1000);
        Bios::install(&mut cpu, &bios);
        load(&mut cpu, &[0xB4, 0x4C, 0xCD, 0x21], 0x1000, 0x0FF0, "", "").unwrap();
        let mut ticks = 0;
        run_session(&mut cpu, &bios, |_| ticks += 1, |_| false);
        assert!(cpu.halted);
        assert_eq!(cpu.halt_reason, HaltReason::ProgramExit);
        assert!(ticks >= 1);
    }

    #[test]
    fn session_wakes_from_key_wait_when_keyboard_pump_supplies_input() {
        let mut cpu = Cpu::new();
        let fs = crate::fat12::Fat12::new(crate::storage::MemorySectorStore::new());
        let bios = Bios::new(fs, 0x1000);
        Bios::install(&mut cpu, &bios);
        // INT 16h AH=0 then INT 20h: blocks until a key arrives, then exits.
        load(&mut cpu, &[0xB4, 0x00, 0xCD, 0x16, 0xCD, 0x20], 0x1000, 0x0FF0, "", "").unwrap();
        let mut fed = false;
        run_session(
            &mut cpu,
            &bios,
            |_| {},
            |cpu| {
                if !fed {
                    cpu.keyboard.push(0x1E, b'a');
                    fed = true;
                }
                true
            },
        );
        assert!(cpu.halted);
        assert_eq!(cpu.halt_reason, HaltReason::ProgramExit);
        assert_eq!(cpu.reg8(Reg8::Al), b'a');
    }
}
