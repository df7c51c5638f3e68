// One variant per decoded instruction family; `parser::decode` builds these
// from CS:IP and `execute` is the only place that mutates CPU state for
// that family. Exhaustive matching here is what catches a missing opcode
// handler at compile time instead of at runtime.

use crate::fields::{
    add_with_flags, and_with_flags, dec_with_flags, inc_with_flags, neg_with_flags, or_with_flags, sub_with_flags,
    xor_with_flags, bit, AluOp, Condition, EffectiveAddress, Reg16, Reg8, RepeatPrefix, SegReg, Size,
    Value,
};
use crate::conversions::{sign_extend_16, sign_extend_8, Truncate};
use crate::memory::physical_address;
use crate::processor::{Cpu, HaltReason};

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ShiftKind {
    Rol,
    Ror,
    Rcl,
    Rcr,
    Shl,
    Shr,
    Sar,
}

impl ShiftKind {
    pub fn from_code(code: u8) -> Self {
        match code & 0x7 {
            0 => ShiftKind::Rol,
            1 => ShiftKind::Ror,
            2 => ShiftKind::Rcl,
            3 => ShiftKind::Rcr,
            4 | 6 => ShiftKind::Shl,
            5 => ShiftKind::Shr,
            _ => ShiftKind::Sar,
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ShiftCount {
    One,
    Cl,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum LoopKind {
    Always,
    WhileEqual,
    WhileNotEqual,
    CxZero,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum PortSource {
    Fixed(u8),
    Dx,
}

pub enum Instruction {
    Nop,
    Unknown,
    Alu { op: AluOp, dst: EffectiveAddress, src: EffectiveAddress },
    AluImmediate { op: AluOp, dst: EffectiveAddress, imm: Value },
    Test { dst: EffectiveAddress, src: EffectiveAddress },
    TestImmediate { dst: EffectiveAddress, imm: Value },
    Mov { dst: EffectiveAddress, src: EffectiveAddress },
    MovImmediate { dst: EffectiveAddress, imm: Value },
    MovFromSeg { dst: EffectiveAddress, seg: SegReg },
    MovToSeg { seg: SegReg, src: EffectiveAddress },
    MovMoffs { to_accumulator: bool, size: Size, offset: u16 },
    Lds { dst: Reg16, addr: usize },
    Les { dst: Reg16, addr: usize },
    Lea { dst: Reg16, offset: u16 },
    Xchg { a: EffectiveAddress, b: EffectiveAddress },
    Push { src: EffectiveAddress },
    PushSeg { seg: SegReg },
    Pop { dst: EffectiveAddress },
    PopSeg { seg: SegReg },
    Pusha,
    Popa,
    Pushf,
    Popf,
    IncDec { dst: EffectiveAddress, size: Size, increment: bool },
    Neg { dst: EffectiveAddress },
    Not { dst: EffectiveAddress },
    Mul { src: EffectiveAddress, signed: bool },
    Div { src: EffectiveAddress, signed: bool },
    Shift { dst: EffectiveAddress, size: Size, kind: ShiftKind, count: ShiftCount },
    MovsString { size: Size },
    CmpsString { size: Size },
    StosString { size: Size },
    LodsString { size: Size },
    ScasString { size: Size },
    Daa,
    Das,
    Aaa,
    Aas,
    Aam { base: u8 },
    Aad { base: u8 },
    JmpNear { target: u16 },
    JmpFar { seg: u16, offset: u16 },
    JmpIndirect { target: EffectiveAddress },
    JmpFarIndirect { addr: usize },
    CallNear { target: u16, return_ip: u16 },
    CallFar { seg: u16, offset: u16, return_ip: u16 },
    CallIndirect { target: EffectiveAddress, return_ip: u16 },
    CallFarIndirect { addr: usize, return_ip: u16 },
    RetNear { pop: u16 },
    RetFar { pop: u16 },
    Jcc { condition: Condition, target: u16 },
    Loop { kind: LoopKind, target: u16 },
    Int { vector: u8 },
    Int3,
    Into,
    Iret,
    Hlt,
    Clc,
    Stc,
    Cmc,
    Cli,
    Sti,
    Cld,
    Std,
    Enter { size: u16, level: u8 },
    Leave,
    Movzx { dst: Reg16, src: EffectiveAddress, src_size: Size },
    Movsx { dst: Reg16, src: EffectiveAddress, src_size: Size },
    In { size: Size, port: PortSource },
    Out { size: Size, port: PortSource },
    Cbw,
    Cwd,
    Lahf,
    Sahf,
    Xlat,
}

fn mask(width: u32) -> u32 {
    if width == 8 {
        0xff
    } else {
        0xffff
    }
}

fn shift_rotate(flags: &mut crate::fields::Flags, size: Size, kind: ShiftKind, mut value: u32, count: u8) -> u32 {
    let width = match size {
        Size::Byte => 8,
        Size::Word => 16,
    };
    let count = count & 0x1f;
    if count == 0 {
        return value;
    }
    let original_msb = (value >> (width - 1)) & 1 == 1;
    let mut cf = flags.cf();
    for _ in 0..count {
        match kind {
            ShiftKind::Shl => {
                cf = (value >> (width - 1)) & 1 == 1;
                value = (value << 1) & mask(width);
            }
            ShiftKind::Shr => {
                cf = value & 1 == 1;
                value >>= 1;
            }
            ShiftKind::Sar => {
                cf = value & 1 == 1;
                let sign = (value >> (width - 1)) & 1;
                value = (value >> 1) | (sign << (width - 1));
            }
            ShiftKind::Rol => {
                let top = (value >> (width - 1)) & 1;
                value = ((value << 1) | top) & mask(width);
                cf = top == 1;
            }
            ShiftKind::Ror => {
                let bottom = value & 1;
                value = (value >> 1) | (bottom << (width - 1));
                cf = bottom == 1;
            }
            ShiftKind::Rcl => {
                let top = (value >> (width - 1)) & 1;
                value = ((value << 1) | (cf as u32)) & mask(width);
                cf = top == 1;
            }
            ShiftKind::Rcr => {
                let bottom = value & 1;
                value = (value >> 1) | ((cf as u32) << (width - 1));
                cf = bottom == 1;
            }
        }
    }
    flags.set(bit::CF, cf);
    let result_msb = (value >> (width - 1)) & 1 == 1;
    if count == 1 {
        let of = match kind {
            ShiftKind::Shl | ShiftKind::Rol | ShiftKind::Rcl => result_msb != cf,
            ShiftKind::Shr => original_msb,
            ShiftKind::Sar => false,
            ShiftKind::Ror | ShiftKind::Rcr => {
                let second_bit = (value >> (width - 2)) & 1 == 1;
                result_msb != second_bit
            }
        };
        flags.set(bit::OF, of);
    }
    if matches!(kind, ShiftKind::Shl | ShiftKind::Shr | ShiftKind::Sar) {
        flags.set(bit::ZF, value & mask(width) == 0);
        flags.set(bit::SF, result_msb);
        flags.set(bit::PF, (value as u8).count_ones().is_multiple_of(2));
    }
    value
}

fn daa(flags: &mut crate::fields::Flags, al: u8) -> u8 {
    let old_al = al;
    let old_cf = flags.cf();
    let mut new_al = al;
    let mut cf = false;
    if (new_al & 0x0f) > 9 || flags.af() {
        cf = old_cf || new_al as u16 + 6 > 0xff;
        new_al = new_al.wrapping_add(6);
        flags.set(bit::AF, true);
    } else {
        flags.set(bit::AF, false);
    }
    if old_al > 0x99 || old_cf {
        new_al = new_al.wrapping_add(0x60);
        cf = true;
    }
    flags.set(bit::CF, cf);
    flags.set(bit::ZF, new_al == 0);
    flags.set(bit::SF, new_al & 0x80 != 0);
    flags.set(bit::PF, new_al.count_ones().is_multiple_of(2));
    new_al
}

fn das(flags: &mut crate::fields::Flags, al: u8) -> u8 {
    let old_al = al;
    let old_cf = flags.cf();
    let mut new_al = al;
    let mut cf = false;
    if (new_al & 0x0f) > 9 || flags.af() {
        cf = old_cf || new_al < 6;
        new_al = new_al.wrapping_sub(6);
        flags.set(bit::AF, true);
    } else {
        flags.set(bit::AF, false);
    }
    if old_al > 0x99 || old_cf {
        new_al = new_al.wrapping_sub(0x60);
        cf = true;
    }
    flags.set(bit::CF, cf);
    flags.set(bit::ZF, new_al == 0);
    flags.set(bit::SF, new_al & 0x80 != 0);
    flags.set(bit::PF, new_al.count_ones().is_multiple_of(2));
    new_al
}

fn string_step(size: Size, df: bool) -> i32 {
    let stride = size as i32;
    if df {
        -stride
    } else {
        stride
    }
}

fn default_data_seg(cpu: &Cpu) -> SegReg {
    cpu.segment_override.as_seg().unwrap_or(SegReg::Ds)
}

fn mul(cpu: &mut Cpu, src: Value, signed: bool) {
    match src {
        Value::Byte(b) => {
            let al = cpu.reg8(Reg8::Al);
            let (result, overflow) = if signed {
                let product = sign_extend_8(al) * sign_extend_8(b);
                (product as u16, !(-128..=127).contains(&product))
            } else {
                let product = al as u32 * b as u32;
                (product as u16, product > 0xff)
            };
            cpu.set_reg16(Reg16::Ax, result);
            cpu.flags.set(bit::CF, overflow);
            cpu.flags.set(bit::OF, overflow);
        }
        Value::Word(w) => {
            let ax = cpu.reg16(Reg16::Ax);
            let (dx, ax_result, overflow) = if signed {
                let product = sign_extend_16(ax) as i64 * sign_extend_16(w) as i64;
                ((product >> 16) as u16, product as u16, !(-32768..=32767).contains(&product))
            } else {
                let product = ax as u32 * w as u32;
                ((product >> 16) as u16, product as u16, product > 0xffff)
            };
            cpu.set_reg16(Reg16::Ax, ax_result);
            cpu.set_reg16(Reg16::Dx, dx);
            cpu.flags.set(bit::CF, overflow);
            cpu.flags.set(bit::OF, overflow);
        }
    }
}

fn div(cpu: &mut Cpu, src: Value, signed: bool) {
    match src {
        Value::Byte(divisor) => {
            if divisor == 0 {
                cpu.interrupt(0);
                return;
            }
            let dividend = cpu.reg16(Reg16::Ax);
            if signed {
                let dividend = sign_extend_16(dividend);
                let divisor = sign_extend_8(divisor);
                let quotient = dividend / divisor;
                if !(-128..=127).contains(&quotient) {
                    cpu.interrupt(0);
                    return;
                }
                let remainder = dividend % divisor;
                cpu.set_reg8(Reg8::Al, quotient.truncate());
                cpu.set_reg8(Reg8::Ah, remainder.truncate());
            } else {
                let divisor = divisor as u32;
                let dividend = dividend as u32;
                let quotient = dividend / divisor;
                if quotient > 0xff {
                    cpu.interrupt(0);
                    return;
                }
                cpu.set_reg8(Reg8::Al, quotient as u8);
                cpu.set_reg8(Reg8::Ah, (dividend % divisor) as u8);
            }
        }
        Value::Word(divisor) => {
            if divisor == 0 {
                cpu.interrupt(0);
                return;
            }
            let dividend = ((cpu.reg16(Reg16::Dx) as u32) << 16) | cpu.reg16(Reg16::Ax) as u32;
            if signed {
                let dividend = dividend as i32;
                let divisor = sign_extend_16(divisor);
                let quotient = dividend / divisor;
                if !(-32768..=32767).contains(&quotient) {
                    cpu.interrupt(0);
                    return;
                }
                let remainder = dividend % divisor;
                cpu.set_reg16(Reg16::Ax, quotient.truncate());
                cpu.set_reg16(Reg16::Dx, remainder.truncate());
            } else {
                let divisor = divisor as u32;
                let quotient = dividend / divisor;
                if quotient > 0xffff {
                    cpu.interrupt(0);
                    return;
                }
                cpu.set_reg16(Reg16::Ax, quotient as u16);
                cpu.set_reg16(Reg16::Dx, (dividend % divisor) as u16);
            }
        }
    }
}

impl Instruction {
    pub fn execute(&self, cpu: &mut Cpu) {
        use Instruction::*;
        match self {
            Nop | Unknown => {}
            Alu { op, dst, src } => {
                let a = cpu.read_ea(*dst, size_of(dst));
                let b = cpu.read_ea(*src, size_of(src));
                let (result, flags) = alu(*op, a, b, cpu.flags.cf());
                flags.apply(&mut cpu.flags);
                if *op != AluOp::Cmp {
                    cpu.write_ea(*dst, result);
                }
            }
            AluImmediate { op, dst, imm } => {
                let a = cpu.read_ea(*dst, imm.size());
                let (result, flags) = alu(*op, a, *imm, cpu.flags.cf());
                flags.apply(&mut cpu.flags);
                if *op != AluOp::Cmp {
                    cpu.write_ea(*dst, result);
                }
            }
            Test { dst, src } => {
                let a = cpu.read_ea(*dst, size_of(dst));
                let b = cpu.read_ea(*src, size_of(src));
                let (_, flags) = and_with_flags(a, b);
                flags.apply(&mut cpu.flags);
            }
            TestImmediate { dst, imm } => {
                let a = cpu.read_ea(*dst, imm.size());
                let (_, flags) = and_with_flags(a, *imm);
                flags.apply(&mut cpu.flags);
            }
            Mov { dst, src } => {
                let value = cpu.read_ea(*src, size_of(src));
                cpu.write_ea(*dst, value);
            }
            MovImmediate { dst, imm } => cpu.write_ea(*dst, *imm),
            MovFromSeg { dst, seg } => cpu.write_ea(*dst, Value::Word(cpu.seg(*seg))),
            MovToSeg { seg, src } => {
                let value = cpu.read_ea(*src, Size::Word).as_u16();
                cpu.set_seg(*seg, value);
            }
            MovMoffs { to_accumulator, size, offset } => {
                let addr = physical_address(cpu.seg(default_data_seg(cpu)), *offset);
                if *to_accumulator {
                    match size {
                        Size::Byte => cpu.set_reg8(Reg8::Al, cpu.memory.read_u8(addr)),
                        Size::Word => cpu.set_reg16(Reg16::Ax, cpu.memory.read_u16(addr)),
                    }
                } else {
                    match size {
                        Size::Byte => cpu.memory.write_u8(addr, cpu.reg8(Reg8::Al)),
                        Size::Word => cpu.memory.write_u16(addr, cpu.reg16(Reg16::Ax)),
                    }
                }
            }
            Lds { dst, addr } => {
                let offset = cpu.memory.read_u16(*addr);
                let seg = cpu.memory.read_u16(addr.wrapping_add(2));
                cpu.set_reg16(*dst, offset);
                cpu.ds = seg;
            }
            Les { dst, addr } => {
                let offset = cpu.memory.read_u16(*addr);
                let seg = cpu.memory.read_u16(addr.wrapping_add(2));
                cpu.set_reg16(*dst, offset);
                cpu.es = seg;
            }
            Lea { dst, offset } => cpu.set_reg16(*dst, *offset),
            Xchg { a, b } => {
                let size = size_of(a);
                let va = cpu.read_ea(*a, size);
                let vb = cpu.read_ea(*b, size);
                cpu.write_ea(*a, vb);
                cpu.write_ea(*b, va);
            }
            Push { src } => {
                let value = cpu.read_ea(*src, Size::Word).as_u16();
                cpu.push_u16(value);
            }
            PushSeg { seg } => cpu.push_u16(cpu.seg(*seg)),
            Pop { dst } => {
                let value = cpu.pop_u16();
                cpu.write_ea(*dst, Value::Word(value));
            }
            PopSeg { seg } => {
                let value = cpu.pop_u16();
                cpu.set_seg(*seg, value);
            }
            Pusha => {
                let sp = cpu.sp;
                for r in [Reg16::Ax, Reg16::Cx, Reg16::Dx, Reg16::Bx] {
                    cpu.push_u16(cpu.reg16(r));
                }
                cpu.push_u16(sp);
                for r in [Reg16::Bp, Reg16::Si, Reg16::Di] {
                    cpu.push_u16(cpu.reg16(r));
                }
            }
            Popa => {
                for r in [Reg16::Di, Reg16::Si, Reg16::Bp] {
                    let v = cpu.pop_u16();
                    cpu.set_reg16(r, v);
                }
                cpu.pop_u16();
                for r in [Reg16::Bx, Reg16::Dx, Reg16::Cx, Reg16::Ax] {
                    let v = cpu.pop_u16();
                    cpu.set_reg16(r, v);
                }
            }
            Pushf => cpu.push_u16(cpu.flags.raw()),
            Popf => {
                let value = cpu.pop_u16();
                cpu.flags = crate::fields::Flags::from_raw(value);
            }
            IncDec { dst, size, increment } => {
                let value = cpu.read_ea(*dst, *size);
                let (result, flags) = if *increment { inc_with_flags(value) } else { dec_with_flags(value) };
                flags.apply(&mut cpu.flags);
                cpu.write_ea(*dst, result);
            }
            Neg { dst } => {
                let value = cpu.read_ea(*dst, size_of(dst));
                let (result, flags) = neg_with_flags(value);
                flags.apply(&mut cpu.flags);
                cpu.write_ea(*dst, result);
            }
            Not { dst } => {
                let value = cpu.read_ea(*dst, size_of(dst));
                let result = Value::from_u32(value.size(), !value.as_u32());
                cpu.write_ea(*dst, result);
            }
            Mul { src, signed } => {
                let value = cpu.read_ea(*src, size_of(src));
                mul(cpu, value, *signed);
            }
            Div { src, signed } => {
                let value = cpu.read_ea(*src, size_of(src));
                div(cpu, value, *signed);
            }
            Shift { dst, size, kind, count } => {
                let raw = cpu.read_ea(*dst, *size).as_u32();
                let count = match count {
                    ShiftCount::One => 1,
                    ShiftCount::Cl => cpu.reg8(Reg8::Cl),
                };
                let result = shift_rotate(&mut cpu.flags, *size, *kind, raw, count);
                cpu.write_ea(*dst, Value::from_u32(*size, result));
            }
            MovsString { size } => exec_rep(cpu, false, |cpu| {
                let src = physical_address(cpu.seg(default_data_seg(cpu)), cpu.si);
                let dst = physical_address(cpu.es, cpu.di);
                match size {
                    Size::Byte => {
                        let b = cpu.memory.read_u8(src);
                        cpu.memory.write_u8(dst, b);
                    }
                    Size::Word => {
                        let w = cpu.memory.read_u16(src);
                        cpu.memory.write_u16(dst, w);
                    }
                }
                let step = string_step(*size, cpu.flags.df());
                cpu.si = (cpu.si as i32 + step) as u16;
                cpu.di = (cpu.di as i32 + step) as u16;
            }),
            CmpsString { size } => exec_rep(cpu, true, |cpu| {
                let src = physical_address(cpu.seg(default_data_seg(cpu)), cpu.si);
                let dst = physical_address(cpu.es, cpu.di);
                let (a, b) = match size {
                    Size::Byte => (Value::Byte(cpu.memory.read_u8(src)), Value::Byte(cpu.memory.read_u8(dst))),
                    Size::Word => (Value::Word(cpu.memory.read_u16(src)), Value::Word(cpu.memory.read_u16(dst))),
                };
                let (_, flags) = sub_with_flags(a, b, false);
                flags.apply(&mut cpu.flags);
                let step = string_step(*size, cpu.flags.df());
                cpu.si = (cpu.si as i32 + step) as u16;
                cpu.di = (cpu.di as i32 + step) as u16;
            }),
            StosString { size } => exec_rep(cpu, false, |cpu| {
                let dst = physical_address(cpu.es, cpu.di);
                match size {
                    Size::Byte => cpu.memory.write_u8(dst, cpu.reg8(Reg8::Al)),
                    Size::Word => cpu.memory.write_u16(dst, cpu.reg16(Reg16::Ax)),
                }
                let step = string_step(*size, cpu.flags.df());
                cpu.di = (cpu.di as i32 + step) as u16;
            }),
            LodsString { size } => exec_rep(cpu, false, |cpu| {
                let src = physical_address(cpu.seg(default_data_seg(cpu)), cpu.si);
                match size {
                    Size::Byte => cpu.set_reg8(Reg8::Al, cpu.memory.read_u8(src)),
                    Size::Word => cpu.set_reg16(Reg16::Ax, cpu.memory.read_u16(src)),
                }
                let step = string_step(*size, cpu.flags.df());
                cpu.si = (cpu.si as i32 + step) as u16;
            }),
            ScasString { size } => exec_rep(cpu, true, |cpu| {
                let dst = physical_address(cpu.es, cpu.di);
                let (a, b) = match size {
                    Size::Byte => (Value::Byte(cpu.reg8(Reg8::Al)), Value::Byte(cpu.memory.read_u8(dst))),
                    Size::Word => (Value::Word(cpu.reg16(Reg16::Ax)), Value::Word(cpu.memory.read_u16(dst))),
                };
                let (_, flags) = sub_with_flags(a, b, false);
                flags.apply(&mut cpu.flags);
                let step = string_step(*size, cpu.flags.df());
                cpu.di = (cpu.di as i32 + step) as u16;
            }),
            Daa => {
                let al_in = cpu.reg8(Reg8::Al);
                let al = daa(&mut cpu.flags, al_in);
                cpu.set_reg8(Reg8::Al, al);
            }
            Das => {
                let al_in = cpu.reg8(Reg8::Al);
                let al = das(&mut cpu.flags, al_in);
                cpu.set_reg8(Reg8::Al, al);
            }
            Aaa => {
                let al = cpu.reg8(Reg8::Al);
                if (al & 0x0f) > 9 || cpu.flags.af() {
                    cpu.set_reg8(Reg8::Al, al.wrapping_add(6));
                    cpu.set_reg8(Reg8::Ah, cpu.reg8(Reg8::Ah).wrapping_add(1));
                    cpu.flags.set(bit::AF, true);
                    cpu.flags.set(bit::CF, true);
                } else {
                    cpu.flags.set(bit::AF, false);
                    cpu.flags.set(bit::CF, false);
                }
                cpu.set_reg8(Reg8::Al, cpu.reg8(Reg8::Al) & 0x0f);
            }
            Aas => {
                let al = cpu.reg8(Reg8::Al);
                if (al & 0x0f) > 9 || cpu.flags.af() {
                    cpu.set_reg8(Reg8::Al, al.wrapping_sub(6));
                    cpu.set_reg8(Reg8::Ah, cpu.reg8(Reg8::Ah).wrapping_sub(1));
                    cpu.flags.set(bit::AF, true);
                    cpu.flags.set(bit::CF, true);
                } else {
                    cpu.flags.set(bit::AF, false);
                    cpu.flags.set(bit::CF, false);
                }
                cpu.set_reg8(Reg8::Al, cpu.reg8(Reg8::Al) & 0x0f);
            }
            Aam { base } => {
                if *base == 0 {
                    cpu.interrupt(0);
                } else {
                    let al = cpu.reg8(Reg8::Al);
                    cpu.set_reg8(Reg8::Ah, al / base);
                    let al = al % base;
                    cpu.set_reg8(Reg8::Al, al);
                    cpu.flags.set(bit::ZF, al == 0);
                    cpu.flags.set(bit::SF, al & 0x80 != 0);
                    cpu.flags.set(bit::PF, al.count_ones().is_multiple_of(2));
                }
            }
            Aad { base } => {
                let al = cpu.reg8(Reg8::Al);
                let ah = cpu.reg8(Reg8::Ah);
                let result = al.wrapping_add(ah.wrapping_mul(*base));
                cpu.set_reg8(Reg8::Al, result);
                cpu.set_reg8(Reg8::Ah, 0);
                cpu.flags.set(bit::ZF, result == 0);
                cpu.flags.set(bit::SF, result & 0x80 != 0);
                cpu.flags.set(bit::PF, result.count_ones() % 2 == 0);
            }
            JmpNear { target } => cpu.ip = *target,
            JmpFar { seg, offset } => {
                cpu.cs = *seg;
                cpu.ip = *offset;
            }
            JmpIndirect { target } => cpu.ip = cpu.read_ea(*target, Size::Word).as_u16(),
            JmpFarIndirect { addr } => {
                cpu.ip = cpu.memory.read_u16(*addr);
                cpu.cs = cpu.memory.read_u16(addr.wrapping_add(2));
            }
            CallNear { target, return_ip } => {
                cpu.push_u16(*return_ip);
                cpu.ip = *target;
            }
            CallFar { seg, offset, return_ip } => {
                cpu.push_u16(cpu.cs);
                cpu.push_u16(*return_ip);
                cpu.cs = *seg;
                cpu.ip = *offset;
            }
            CallIndirect { target, return_ip } => {
                let new_ip = cpu.read_ea(*target, Size::Word).as_u16();
                cpu.push_u16(*return_ip);
                cpu.ip = new_ip;
            }
            CallFarIndirect { addr, return_ip } => {
                let new_ip = cpu.memory.read_u16(*addr);
                let new_cs = cpu.memory.read_u16(addr.wrapping_add(2));
                cpu.push_u16(cpu.cs);
                cpu.push_u16(*return_ip);
                cpu.cs = new_cs;
                cpu.ip = new_ip;
            }
            RetNear { pop } => {
                cpu.ip = cpu.pop_u16();
                cpu.sp = cpu.sp.wrapping_add(*pop);
            }
            RetFar { pop } => {
                cpu.ip = cpu.pop_u16();
                cpu.cs = cpu.pop_u16();
                cpu.sp = cpu.sp.wrapping_add(*pop);
            }
            Jcc { condition, target } => {
                if condition.evaluate(&cpu.flags) {
                    cpu.ip = *target;
                }
            }
            Loop { kind, target } => {
                let taken = match kind {
                    LoopKind::CxZero => cpu.cx == 0,
                    LoopKind::Always => {
                        cpu.cx = cpu.cx.wrapping_sub(1);
                        cpu.cx != 0
                    }
                    LoopKind::WhileEqual => {
                        cpu.cx = cpu.cx.wrapping_sub(1);
                        cpu.cx != 0 && cpu.flags.zf()
                    }
                    LoopKind::WhileNotEqual => {
                        cpu.cx = cpu.cx.wrapping_sub(1);
                        cpu.cx != 0 && !cpu.flags.zf()
                    }
                };
                if taken {
                    cpu.ip = *target;
                }
            }
            Int { vector } => cpu.interrupt(*vector),
            Int3 => cpu.interrupt(3),
            Into => {
                if cpu.flags.of() {
                    cpu.interrupt(4);
                }
            }
            Iret => cpu.iret(),
            Hlt => cpu.halt(HaltReason::Hlt),
            Clc => cpu.flags.set(bit::CF, false),
            Stc => cpu.flags.set(bit::CF, true),
            Cmc => {
                let cf = cpu.flags.cf();
                cpu.flags.set(bit::CF, !cf);
            }
            Cli => cpu.flags.set(bit::IF, false),
            Sti => cpu.flags.set(bit::IF, true),
            Cld => cpu.flags.set(bit::DF, false),
            Std => cpu.flags.set(bit::DF, true),
            Enter { size, level } => {
                cpu.push_u16(cpu.bp);
                let frame_temp = cpu.sp;
                if *level > 0 {
                    for _ in 1..*level {
                        cpu.bp = cpu.bp.wrapping_sub(2);
                        let v = cpu.memory.read_u16(physical_address(cpu.ss, cpu.bp));
                        cpu.push_u16(v);
                    }
                    cpu.push_u16(frame_temp);
                }
                cpu.bp = frame_temp;
                cpu.sp = cpu.sp.wrapping_sub(*size);
            }
            Leave => {
                cpu.sp = cpu.bp;
                cpu.bp = cpu.pop_u16();
            }
            Movzx { dst, src, src_size } => {
                let value = cpu.read_ea(*src, *src_size).as_u16();
                cpu.set_reg16(*dst, value);
            }
            Movsx { dst, src, src_size } => {
                let value = cpu.read_ea(*src, *src_size);
                let extended = value.sign_extend_to_i32() as u16;
                cpu.set_reg16(*dst, extended);
            }
            In { size, port } => {
                let port_num = resolve_port(cpu, *port);
                match size {
                    Size::Byte => {
                        let value = cpu.io.read(port_num);
                        cpu.set_reg8(Reg8::Al, value);
                    }
                    Size::Word => {
                        let lo = cpu.io.read(port_num) as u16;
                        let hi = cpu.io.read(port_num.wrapping_add(1)) as u16;
                        cpu.set_reg16(Reg16::Ax, lo | (hi << 8));
                    }
                }
            }
            Out { size, port } => {
                let port_num = resolve_port(cpu, *port);
                match size {
                    Size::Byte => cpu.io.write(port_num, cpu.reg8(Reg8::Al)),
                    Size::Word => {
                        let value = cpu.reg16(Reg16::Ax);
                        cpu.io.write(port_num, (value & 0xff) as u8);
                        cpu.io.write(port_num.wrapping_add(1), (value >> 8) as u8);
                    }
                }
            }
            Cbw => {
                let al = sign_extend_8(cpu.reg8(Reg8::Al)) as u16;
                cpu.set_reg16(Reg16::Ax, al);
            }
            Cwd => {
                let ax = cpu.reg16(Reg16::Ax) as i16;
                cpu.set_reg16(Reg16::Dx, if ax < 0 { 0xffff } else { 0 });
            }
            Lahf => cpu.set_reg8(Reg8::Ah, (cpu.flags.raw() & 0xff) as u8),
            Sahf => {
                let ah = cpu.reg8(Reg8::Ah);
                let raw = (cpu.flags.raw() & 0xff00) | ah as u16;
                cpu.flags = crate::fields::Flags::from_raw(raw);
            }
            Xlat => {
                let addr = physical_address(cpu.seg(default_data_seg(cpu)), cpu.bx.wrapping_add(cpu.reg8(Reg8::Al) as u16));
                let value = cpu.memory.read_u8(addr);
                cpu.set_reg8(Reg8::Al, value);
            }
        }
    }
}

fn size_of(ea: &EffectiveAddress) -> Size {
    match ea {
        EffectiveAddress::Reg8(_) => Size::Byte,
        EffectiveAddress::Reg16(_) => Size::Word,
        EffectiveAddress::Memory(_) => Size::Word,
    }
}

fn alu(op: AluOp, a: Value, b: Value, carry_in: bool) -> (Value, crate::fields::FlagUpdate) {
    match op {
        AluOp::Add => add_with_flags(a, b, false),
        AluOp::Adc => add_with_flags(a, b, carry_in),
        AluOp::Sub | AluOp::Cmp => sub_with_flags(a, b, false),
        AluOp::Sbb => sub_with_flags(a, b, carry_in),
        AluOp::And => and_with_flags(a, b),
        AluOp::Or => or_with_flags(a, b),
        AluOp::Xor => xor_with_flags(a, b),
    }
}

fn resolve_port(cpu: &Cpu, port: PortSource) -> u16 {
    match port {
        PortSource::Fixed(p) => p as u16,
        PortSource::Dx => cpu.dx,
    }
}

/// Repeat-prefixed string ops loop here, atomically from the scheduler's
/// point of view. `predicated` ops (CMPS/SCAS) additionally
/// stop when the post-iteration ZF disagrees with the prefix.
fn exec_rep(cpu: &mut Cpu, predicated: bool, mut step: impl FnMut(&mut Cpu)) {
    match cpu.repeat_prefix {
        RepeatPrefix::None => step(cpu),
        prefix => {
            while cpu.cx != 0 {
                step(cpu);
                cpu.cx = cpu.cx.wrapping_sub(1);
                if predicated {
                    let stop = match prefix {
                        RepeatPrefix::RepeWhileEqual => !cpu.flags.zf(),
                        RepeatPrefix::RepneWhileNotEqual => cpu.flags.zf(),
                        RepeatPrefix::None => unreachable!(),
                    };
                    if stop {
                        break;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fields::SegmentOverride;

    fn cpu_with_code(bytes: &[u8]) -> Cpu {
        let mut cpu = Cpu::new();
        cpu.cs = 0;
        cpu.ip = 0;
        cpu.memory.load(0, bytes);
        cpu
    }

    #[test]
    fn rep_stosb_fills_and_advances_di() {
        let mut cpu = cpu_with_code(&[]);
        cpu.es = 0;
        cpu.di = 0x200;
        cpu.cx = 4;
        cpu.set_reg8(Reg8::Al, 0xff);
        cpu.repeat_prefix = RepeatPrefix::RepeWhileEqual;
        Instruction::StosString { size: Size::Byte }.execute(&mut cpu);
        assert_eq!(cpu.cx, 0);
        assert_eq!(cpu.di, 0x204);
        for addr in 0x200..0x204 {
            assert_eq!(cpu.memory.read_u8(addr), 0xff);
        }
    }

    #[test]
    fn rep_movsb_with_cx_zero_is_a_no_op() {
        let mut cpu = cpu_with_code(&[]);
        cpu.memory.write_u8(0x300, 0xAB);
        cpu.si = 0x300;
        cpu.di = 0x400;
        cpu.cx = 0;
        cpu.repeat_prefix = RepeatPrefix::RepeWhileEqual;
        Instruction::MovsString { size: Size::Byte }.execute(&mut cpu);
        assert_eq!(cpu.si, 0x300);
        assert_eq!(cpu.di, 0x400);
        assert_eq!(cpu.memory.read_u8(0x400), 0);
    }

    #[test]
    fn shifted_multiply_sets_carry_and_overflow() {
        let mut cpu = cpu_with_code(&[]);
        cpu.set_reg16(Reg16::Ax, 0x8000);
        cpu.set_reg16(Reg16::Bx, 0x0002);
        let bx = cpu.reg16(Reg16::Bx);
        mul(&mut cpu, Value::Word(bx), false);
        assert_eq!(cpu.reg16(Reg16::Dx), 1);
        assert_eq!(cpu.reg16(Reg16::Ax), 0);
        assert!(cpu.flags.cf());
        assert!(cpu.flags.of());
    }

    #[test]
    fn idiv_truncates_toward_zero() {
        let mut cpu = cpu_with_code(&[]);
        cpu.set_reg16(Reg16::Ax, (-7i16) as u16);
        cpu.set_reg16(Reg16::Dx, if (-7i16) < 0 { 0xffff } else { 0 });
        div(&mut cpu, Value::Byte(2), true);
        assert_eq!(cpu.reg8(Reg8::Al) as i8, -3);
        assert_eq!(cpu.reg8(Reg8::Ah) as i8, -1);
    }

    #[test]
    fn divide_by_zero_raises_interrupt_zero() {
        let mut cpu = cpu_with_code(&[]);
        cpu.memory.write_u16(0, 0x1234);
        cpu.memory.write_u16(2, 0x0050);
        cpu.ss = 0x3000;
        cpu.sp = 0x100;
        div(&mut cpu, Value::Byte(0), false);
        assert_eq!(cpu.ip, 0x1234);
        assert_eq!(cpu.cs, 0x0050);
    }

    #[test]
    fn decode_modrm_is_unaffected_by_segment_override_state() {
        let mut cpu = cpu_with_code(&[]);
        cpu.segment_override = SegmentOverride::Es;
        cpu.es = 0x2000;
        cpu.ds = 0x1000;
        cpu.bx = 0x10;
        cpu.si = 0x4;
        cpu.memory.load(0, &[0x00]); // mod=00 rm=000 -> [BX+SI]
        let (_, ea) = cpu.decode_modrm(Size::Byte);
        if let EffectiveAddress::Memory(addr) = ea {
            assert_eq!(addr, physical_address(0x2000, 0x14));
        } else {
            panic!("expected memory operand");
        }
    }
}
