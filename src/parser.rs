// Opcode dispatch: `decode` consumes prefix bytes (segment override, LOCK,
// REP/REPNE), then the single primary opcode byte, and builds the matching
// `Instruction`. Unrecognised opcodes are logged and turned into a no-op
// rather than panicking, since a real program occasionally hits an FPU
// escape or a reserved encoding this machine doesn't model.

use crate::conversions::{sign_extend_16, sign_extend_8};
use crate::fields::{
    AluOp, Condition, EffectiveAddress, Reg16, Reg8, RepeatPrefix, SegReg, SegmentOverride, Size, Value,
};
use crate::instructions::{Instruction, LoopKind, PortSource, ShiftCount, ShiftKind};
use crate::processor::Cpu;

fn rel8(cpu: &mut Cpu) -> u16 {
    let d = sign_extend_8(cpu.fetch_u8());
    (cpu.ip as i32 + d) as u16
}

fn rel16(cpu: &mut Cpu) -> u16 {
    let d = sign_extend_16(cpu.fetch_u16());
    (cpu.ip as i32 + d) as u16
}

fn modrm_pair(cpu: &mut Cpu, size: Size) -> (EffectiveAddress, EffectiveAddress) {
    let (reg, rm) = cpu.decode_modrm(size);
    let reg_ea = match size {
        Size::Byte => EffectiveAddress::Reg8(Reg8::from_code(reg)),
        Size::Word => EffectiveAddress::Reg16(Reg16::from_code(reg)),
    };
    (reg_ea, rm)
}

fn grp1(cpu: &mut Cpu, size: Size, sign_extend_imm8: bool) -> Instruction {
    let (reg_field, dst) = cpu.decode_modrm(size);
    let op = AluOp::from_code(reg_field);
    let imm = if sign_extend_imm8 {
        Value::from_u32(size, sign_extend_8(cpu.fetch_u8()) as u32)
    } else {
        match size {
            Size::Byte => Value::Byte(cpu.fetch_u8()),
            Size::Word => Value::Word(cpu.fetch_u16()),
        }
    };
    Instruction::AluImmediate { op, dst, imm }
}

fn grp3(cpu: &mut Cpu, size: Size) -> Instruction {
    let (reg_field, dst) = cpu.decode_modrm(size);
    match reg_field & 0x7 {
        0 | 1 => {
            let imm = match size {
                Size::Byte => Value::Byte(cpu.fetch_u8()),
                Size::Word => Value::Word(cpu.fetch_u16()),
            };
            Instruction::TestImmediate { dst, imm }
        }
        2 => Instruction::Not { dst },
        3 => Instruction::Neg { dst },
        4 => Instruction::Mul { src: dst, signed: false },
        5 => Instruction::Mul { src: dst, signed: true },
        6 => Instruction::Div { src: dst, signed: false },
        _ => Instruction::Div { src: dst, signed: true },
    }
}

fn grp_shift(cpu: &mut Cpu, size: Size, count: ShiftCount) -> Instruction {
    let (reg_field, dst) = cpu.decode_modrm(size);
    Instruction::Shift { dst, size, kind: ShiftKind::from_code(reg_field), count }
}

/// `decode` itself never advances the instruction boundary by more than one
/// primary opcode's worth of bytes; prefixes loop until a non-prefix byte is
/// seen, then fall through into the big match.
pub fn decode(cpu: &mut Cpu) -> Instruction {
    loop {
        let opcode = cpu.fetch_u8();
        match opcode {
            0x26 => cpu.segment_override = SegmentOverride::Es,
            0x2E => cpu.segment_override = SegmentOverride::Cs,
            0x36 => cpu.segment_override = SegmentOverride::Ss,
            0x3E => cpu.segment_override = SegmentOverride::Ds,
            0xF0 => {}
            0xF2 => cpu.repeat_prefix = RepeatPrefix::RepneWhileNotEqual,
            0xF3 => cpu.repeat_prefix = RepeatPrefix::RepeWhileEqual,
            0x9B => {}
            _ => return decode_opcode(cpu, opcode),
        }
    }
}

fn decode_opcode(cpu: &mut Cpu, opcode: u8) -> Instruction {
    match opcode {
        0x00..=0x3D if (opcode & 0xc0) == 0x00 && (opcode & 0x07) < 6 && opcode != 0x0f => {
            let op = AluOp::from_code(opcode >> 3);
            match opcode & 0x7 {
                0 => {
                    let (reg, rm) = modrm_pair(cpu, Size::Byte);
                    Instruction::Alu { op, dst: rm, src: reg }
                }
                1 => {
                    let (reg, rm) = modrm_pair(cpu, Size::Word);
                    Instruction::Alu { op, dst: rm, src: reg }
                }
                2 => {
                    let (reg, rm) = modrm_pair(cpu, Size::Byte);
                    Instruction::Alu { op, dst: reg, src: rm }
                }
                3 => {
                    let (reg, rm) = modrm_pair(cpu, Size::Word);
                    Instruction::Alu { op, dst: reg, src: rm }
                }
                4 => Instruction::AluImmediate { op, dst: EffectiveAddress::Reg8(Reg8::Al), imm: Value::Byte(cpu.fetch_u8()) },
                _ => Instruction::AluImmediate { op, dst: EffectiveAddress::Reg16(Reg16::Ax), imm: Value::Word(cpu.fetch_u16()) },
            }
        }
        0x06 => Instruction::PushSeg { seg: SegReg::Es },
        0x07 => Instruction::PopSeg { seg: SegReg::Es },
        0x0E => Instruction::PushSeg { seg: SegReg::Cs },
        0x0F => decode_0f(cpu),
        0x16 => Instruction::PushSeg { seg: SegReg::Ss },
        0x17 => Instruction::PopSeg { seg: SegReg::Ss },
        0x1E => Instruction::PushSeg { seg: SegReg::Ds },
        0x1F => Instruction::PopSeg { seg: SegReg::Ds },
        0x27 => Instruction::Daa,
        0x2F => Instruction::Das,
        0x37 => Instruction::Aaa,
        0x3F => Instruction::Aas,
        0x40..=0x47 => Instruction::IncDec { dst: EffectiveAddress::Reg16(Reg16::from_code(opcode)), size: Size::Word, increment: true },
        0x48..=0x4F => Instruction::IncDec { dst: EffectiveAddress::Reg16(Reg16::from_code(opcode)), size: Size::Word, increment: false },
        0x50..=0x57 => Instruction::Push { src: EffectiveAddress::Reg16(Reg16::from_code(opcode)) },
        0x58..=0x5F => Instruction::Pop { dst: EffectiveAddress::Reg16(Reg16::from_code(opcode)) },
        0x60 => Instruction::Pusha,
        0x61 => Instruction::Popa,
        0x70..=0x7F => {
            let condition = Condition::from_code(opcode);
            let target = rel8(cpu);
            Instruction::Jcc { condition, target }
        }
        0x80 => grp1(cpu, Size::Byte, false),
        0x81 => grp1(cpu, Size::Word, false),
        0x82 => grp1(cpu, Size::Byte, false),
        0x83 => grp1(cpu, Size::Word, true),
        0x84 => {
            let (reg, rm) = modrm_pair(cpu, Size::Byte);
            Instruction::Test { dst: rm, src: reg }
        }
        0x85 => {
            let (reg, rm) = modrm_pair(cpu, Size::Word);
            Instruction::Test { dst: rm, src: reg }
        }
        0x86 => {
            let (reg, rm) = modrm_pair(cpu, Size::Byte);
            Instruction::Xchg { a: rm, b: reg }
        }
        0x87 => {
            let (reg, rm) = modrm_pair(cpu, Size::Word);
            Instruction::Xchg { a: rm, b: reg }
        }
        0x88 => {
            let (reg, rm) = modrm_pair(cpu, Size::Byte);
            Instruction::Mov { dst: rm, src: reg }
        }
        0x89 => {
            let (reg, rm) = modrm_pair(cpu, Size::Word);
            Instruction::Mov { dst: rm, src: reg }
        }
        0x8A => {
            let (reg, rm) = modrm_pair(cpu, Size::Byte);
            Instruction::Mov { dst: reg, src: rm }
        }
        0x8B => {
            let (reg, rm) = modrm_pair(cpu, Size::Word);
            Instruction::Mov { dst: reg, src: rm }
        }
        0x8C => {
            let (reg_field, rm) = cpu.decode_modrm(Size::Word);
            Instruction::MovFromSeg { dst: rm, seg: SegReg::from_code(reg_field) }
        }
        0x8D => {
            let (reg_field, _, offset) = cpu.decode_modrm_with_offset(Size::Word);
            Instruction::Lea { dst: Reg16::from_code(reg_field), offset: offset.unwrap_or(0) }
        }
        0x8E => {
            let (reg_field, rm) = cpu.decode_modrm(Size::Word);
            Instruction::MovToSeg { seg: SegReg::from_code(reg_field), src: rm }
        }
        0x8F => {
            let (_, rm) = cpu.decode_modrm(Size::Word);
            Instruction::Pop { dst: rm }
        }
        0x90 => Instruction::Nop,
        0x91..=0x97 => Instruction::Xchg { a: EffectiveAddress::Reg16(Reg16::Ax), b: EffectiveAddress::Reg16(Reg16::from_code(opcode)) },
        0x98 => Instruction::Cbw,
        0x99 => Instruction::Cwd,
        0x9A => {
            let offset = cpu.fetch_u16();
            let seg = cpu.fetch_u16();
            let return_ip = cpu.ip;
            Instruction::CallFar { seg, offset, return_ip }
        }
        0x9C => Instruction::Pushf,
        0x9D => Instruction::Popf,
        0x9E => Instruction::Sahf,
        0x9F => Instruction::Lahf,
        0xA0 => Instruction::MovMoffs { to_accumulator: true, size: Size::Byte, offset: cpu.fetch_u16() },
        0xA1 => Instruction::MovMoffs { to_accumulator: true, size: Size::Word, offset: cpu.fetch_u16() },
        0xA2 => Instruction::MovMoffs { to_accumulator: false, size: Size::Byte, offset: cpu.fetch_u16() },
        0xA3 => Instruction::MovMoffs { to_accumulator: false, size: Size::Word, offset: cpu.fetch_u16() },
        0xA4 => Instruction::MovsString { size: Size::Byte },
        0xA5 => Instruction::MovsString { size: Size::Word },
        0xA6 => Instruction::CmpsString { size: Size::Byte },
        0xA7 => Instruction::CmpsString { size: Size::Word },
        0xA8 => Instruction::TestImmediate { dst: EffectiveAddress::Reg8(Reg8::Al), imm: Value::Byte(cpu.fetch_u8()) },
        0xA9 => Instruction::TestImmediate { dst: EffectiveAddress::Reg16(Reg16::Ax), imm: Value::Word(cpu.fetch_u16()) },
        0xAA => Instruction::StosString { size: Size::Byte },
        0xAB => Instruction::StosString { size: Size::Word },
        0xAC => Instruction::LodsString { size: Size::Byte },
        0xAD => Instruction::LodsString { size: Size::Word },
        0xAE => Instruction::ScasString { size: Size::Byte },
        0xAF => Instruction::ScasString { size: Size::Word },
        0xB0..=0xB7 => Instruction::MovImmediate { dst: EffectiveAddress::Reg8(Reg8::from_code(opcode)), imm: Value::Byte(cpu.fetch_u8()) },
        0xB8..=0xBF => Instruction::MovImmediate { dst: EffectiveAddress::Reg16(Reg16::from_code(opcode)), imm: Value::Word(cpu.fetch_u16()) },
        0xC2 => {
            let pop = cpu.fetch_u16();
            Instruction::RetNear { pop }
        }
        0xC3 => Instruction::RetNear { pop: 0 },
        0xC4 => {
            let (reg_field, ea) = cpu.decode_modrm(Size::Word);
            let addr = match ea {
                EffectiveAddress::Memory(addr) => addr,
                _ => 0,
            };
            Instruction::Les { dst: Reg16::from_code(reg_field), addr }
        }
        0xC5 => {
            let (reg_field, ea) = cpu.decode_modrm(Size::Word);
            let addr = match ea {
                EffectiveAddress::Memory(addr) => addr,
                _ => 0,
            };
            Instruction::Lds { dst: Reg16::from_code(reg_field), addr }
        }
        0xC6 => {
            let (_, dst) = cpu.decode_modrm(Size::Byte);
            Instruction::MovImmediate { dst, imm: Value::Byte(cpu.fetch_u8()) }
        }
        0xC7 => {
            let (_, dst) = cpu.decode_modrm(Size::Word);
            Instruction::MovImmediate { dst, imm: Value::Word(cpu.fetch_u16()) }
        }
        0xC8 => {
            let size = cpu.fetch_u16();
            let level = cpu.fetch_u8();
            Instruction::Enter { size, level }
        }
        0xC9 => Instruction::Leave,
        0xCA => {
            let pop = cpu.fetch_u16();
            Instruction::RetFar { pop }
        }
        0xCB => Instruction::RetFar { pop: 0 },
        0xCC => Instruction::Int3,
        0xCD => Instruction::Int { vector: cpu.fetch_u8() },
        0xCE => Instruction::Into,
        0xCF => Instruction::Iret,
        0xD0 => grp_shift(cpu, Size::Byte, ShiftCount::One),
        0xD1 => grp_shift(cpu, Size::Word, ShiftCount::One),
        0xD2 => grp_shift(cpu, Size::Byte, ShiftCount::Cl),
        0xD3 => grp_shift(cpu, Size::Word, ShiftCount::Cl),
        0xD4 => {
            let base = cpu.fetch_u8();
            Instruction::Aam { base }
        }
        0xD5 => {
            let base = cpu.fetch_u8();
            Instruction::Aad { base }
        }
        0xD7 => Instruction::Xlat,
        0xD8..=0xDF => {
            // FPU escape: this machine has no coprocessor, so just consume the
            // ModR/M byte (and any displacement it implies) and move on.
            cpu.decode_modrm(Size::Word);
            log::trace!("ignoring FPU escape opcode {:#04x}", opcode);
            Instruction::Unknown
        }
        0xE0 => {
            let target = rel8(cpu);
            Instruction::Loop { kind: LoopKind::WhileNotEqual, target }
        }
        0xE1 => {
            let target = rel8(cpu);
            Instruction::Loop { kind: LoopKind::WhileEqual, target }
        }
        0xE2 => {
            let target = rel8(cpu);
            Instruction::Loop { kind: LoopKind::Always, target }
        }
        0xE3 => {
            let target = rel8(cpu);
            Instruction::Loop { kind: LoopKind::CxZero, target }
        }
        0xE4 => Instruction::In { size: Size::Byte, port: PortSource::Fixed(cpu.fetch_u8()) },
        0xE5 => Instruction::In { size: Size::Word, port: PortSource::Fixed(cpu.fetch_u8()) },
        0xE6 => Instruction::Out { size: Size::Byte, port: PortSource::Fixed(cpu.fetch_u8()) },
        0xE7 => Instruction::Out { size: Size::Word, port: PortSource::Fixed(cpu.fetch_u8()) },
        0xE8 => {
            let target = rel16(cpu);
            let return_ip = cpu.ip;
            Instruction::CallNear { target, return_ip }
        }
        0xE9 => Instruction::JmpNear { target: rel16(cpu) },
        0xEA => {
            let offset = cpu.fetch_u16();
            let seg = cpu.fetch_u16();
            Instruction::JmpFar { seg, offset }
        }
        0xEB => Instruction::JmpNear { target: rel8(cpu) },
        0xEC => Instruction::In { size: Size::Byte, port: PortSource::Dx },
        0xED => Instruction::In { size: Size::Word, port: PortSource::Dx },
        0xEE => Instruction::Out { size: Size::Byte, port: PortSource::Dx },
        0xEF => Instruction::Out { size: Size::Word, port: PortSource::Dx },
        0xF4 => Instruction::Hlt,
        0xF5 => Instruction::Cmc,
        0xF6 => grp3(cpu, Size::Byte),
        0xF7 => grp3(cpu, Size::Word),
        0xF8 => Instruction::Clc,
        0xF9 => Instruction::Stc,
        0xFA => Instruction::Cli,
        0xFB => Instruction::Sti,
        0xFC => Instruction::Cld,
        0xFD => Instruction::Std,
        0xFE => {
            let (reg_field, dst) = cpu.decode_modrm(Size::Byte);
            Instruction::IncDec { dst, size: Size::Byte, increment: reg_field == 0 }
        }
        0xFF => decode_grp5(cpu),
        _ => {
            log::trace!("unknown opcode {:#04x} at {:04x}:{:04x}", opcode, cpu.cs, cpu.ip);
            Instruction::Unknown
        }
    }
}

fn decode_grp5(cpu: &mut Cpu) -> Instruction {
    let (reg_field, dst) = cpu.decode_modrm(Size::Word);
    match reg_field & 0x7 {
        0 => Instruction::IncDec { dst, size: Size::Word, increment: true },
        1 => Instruction::IncDec { dst, size: Size::Word, increment: false },
        2 => {
            let return_ip = cpu.ip;
            Instruction::CallIndirect { target: dst, return_ip }
        }
        3 => {
            let return_ip = cpu.ip;
            match dst {
                EffectiveAddress::Memory(addr) => Instruction::CallFarIndirect { addr, return_ip },
                _ => Instruction::Unknown,
            }
        }
        4 => Instruction::JmpIndirect { target: dst },
        5 => match dst {
            EffectiveAddress::Memory(addr) => Instruction::JmpFarIndirect { addr },
            _ => Instruction::Unknown,
        },
        6 => Instruction::Push { src: dst },
        _ => Instruction::Unknown,
    }
}

fn decode_0f(cpu: &mut Cpu) -> Instruction {
    let opcode2 = cpu.fetch_u8();
    match opcode2 {
        0xB6 => {
            let (reg_field, rm) = cpu.decode_modrm(Size::Byte);
            Instruction::Movzx { dst: Reg16::from_code(reg_field), src: rm, src_size: Size::Byte }
        }
        0xBE => {
            let (reg_field, rm) = cpu.decode_modrm(Size::Byte);
            Instruction::Movsx { dst: Reg16::from_code(reg_field), src: rm, src_size: Size::Byte }
        }
        0x80..=0x8F => {
            let condition = Condition::from_code(opcode2);
            let target = rel16(cpu);
            Instruction::Jcc { condition, target }
        }
        _ => {
            log::trace!("unknown two-byte opcode 0f {:#04x}", opcode2);
            Instruction::Unknown
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::processor::Cpu;

    fn cpu_with(bytes: &[u8]) -> Cpu {
        let mut cpu = Cpu::new();
        cpu.memory.load(0, bytes);
        cpu
    }

    #[test]
    fn decodes_mov_reg_immediate() {
        let mut cpu = cpu_with(&[0xB8, 0x34, 0x12]);
        match decode(&mut cpu) {
            Instruction::MovImmediate { dst: EffectiveAddress::Reg16(Reg16::Ax), imm: Value::Word(0x1234) } => {}
            _ => panic!("expected mov ax,0x1234"),
        }
        assert_eq!(cpu.ip, 3);
    }

    #[test]
    fn decodes_add_rm8_r8() {
        let mut cpu = cpu_with(&[0x00, 0xD8]); // add al,bl
        match decode(&mut cpu) {
            Instruction::Alu { op: AluOp::Add, dst: EffectiveAddress::Reg8(Reg8::Al), src: EffectiveAddress::Reg8(Reg8::Bl), .. } => {}
            _ => panic!("expected add al,bl"),
        }
    }

    #[test]
    fn rep_prefix_is_consumed_before_opcode() {
        let mut cpu = cpu_with(&[0xF3, 0xAA]); // rep stosb
        let instruction = decode(&mut cpu);
        assert_eq!(cpu.repeat_prefix, RepeatPrefix::RepeWhileEqual);
        assert!(matches!(instruction, Instruction::StosString { size: Size::Byte }));
    }

    #[test]
    fn segment_override_prefix_applies_to_following_modrm() {
        let mut cpu = cpu_with(&[0x26, 0x8A, 0x07]); // es: mov al,[bx]
        cpu.es = 0x2000;
        cpu.bx = 0x10;
        let instruction = decode(&mut cpu);
        match instruction {
            Instruction::Mov { src: EffectiveAddress::Memory(addr), .. } => {
                assert_eq!(addr, crate::memory::physical_address(0x2000, 0x10));
            }
            _ => panic!("expected mov al,es:[bx]"),
        }
    }

    #[test]
    fn decodes_jcc_with_forward_displacement() {
        let mut cpu = cpu_with(&[0x74, 0x05]); // je +5
        match decode(&mut cpu) {
            Instruction::Jcc { condition: Condition::E, target } => assert_eq!(target, 2 + 5),
            _ => panic!("expected je"),
        }
    }

    #[test]
    fn decodes_near_jcc_with_16_bit_displacement() {
        let mut cpu = cpu_with(&[0x0F, 0x84, 0x00, 0x01]); // je near +0x100
        match decode(&mut cpu) {
            Instruction::Jcc { condition: Condition::E, target } => assert_eq!(target, 4 + 0x100),
            _ => panic!("expected near je"),
        }
    }

    #[test]
    fn decodes_grp3_div_from_reg_field() {
        let mut cpu = cpu_with(&[0xF6, 0xF3]); // div bl
        match decode(&mut cpu) {
            Instruction::Div { src: EffectiveAddress::Reg8(Reg8::Bl), signed: false } => {}
            _ => panic!("expected div bl"),
        }
    }
}
