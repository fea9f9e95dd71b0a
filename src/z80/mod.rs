//! Z80 interpreter.
//!
//! Implements the stepping-engine contract for the three board CPUs:
//! the full unprefixed matrix, the CB prefix, the common ED block and
//! DD/FD index addressing via HL substitution. Interrupts are serviced
//! between instructions only; IM2 vectors combine the I register with
//! the byte injected by the board. Timing uses the standard per-opcode
//! tables, with indexed forms approximated (cycle exactness is not a
//! goal of this board model).

use crate::bus::CpuId;
use crate::cpu::{BusHandle, CpuCore, CpuState, Registers, StepFault};

pub const FLAG_CARRY: u8 = 0x01;
pub const FLAG_ADD_SUB: u8 = 0x02;
pub const FLAG_PARITY: u8 = 0x04;
pub const FLAG_X: u8 = 0x08;
pub const FLAG_HALF: u8 = 0x10;
pub const FLAG_Y: u8 = 0x20;
pub const FLAG_ZERO: u8 = 0x40;
pub const FLAG_SIGN: u8 = 0x80;

const NMI_VECTOR: u16 = 0x0066;
const IRQ_IM1_VECTOR: u16 = 0x0038;

/// Which register pair stands in for HL under a DD/FD prefix.
#[derive(Clone, Copy, PartialEq, Eq)]
enum Index {
    Hl,
    Ix,
    Iy,
}

pub struct Z80 {
    id: CpuId,
    regs: Registers,
    halted: bool,
    iff1: bool,
    iff2: bool,
    im: u8,
    irq_pending: bool,
    irq_vector: u8,
    nmi_pending: bool,
    // EI enables interrupts only after the following instruction.
    ei_delay: bool,
}

impl Z80 {
    pub fn new(id: CpuId) -> Self {
        Self {
            id,
            regs: Registers::default(),
            halted: false,
            iff1: false,
            iff2: false,
            im: 0,
            irq_pending: false,
            irq_vector: 0,
            nmi_pending: false,
            ei_delay: false,
        }
    }

    pub fn id(&self) -> CpuId {
        self.id
    }

    pub fn registers(&self) -> &Registers {
        &self.regs
    }

    fn fault(&self, reason: String) -> StepFault {
        StepFault::Device {
            cpu: self.id,
            reason,
        }
    }

    // --- fetch/stack helpers -------------------------------------------

    fn fetch8(&mut self, bus: &mut BusHandle<'_>) -> Result<u8, StepFault> {
        let byte = bus.read8(self.regs.pc)?;
        self.regs.pc = self.regs.pc.wrapping_add(1);
        Ok(byte)
    }

    fn fetch16(&mut self, bus: &mut BusHandle<'_>) -> Result<u16, StepFault> {
        let lo = self.fetch8(bus)? as u16;
        let hi = self.fetch8(bus)? as u16;
        Ok((hi << 8) | lo)
    }

    fn push16(&mut self, bus: &mut BusHandle<'_>, value: u16) -> Result<(), StepFault> {
        self.regs.sp = self.regs.sp.wrapping_sub(1);
        bus.write8(self.regs.sp, (value >> 8) as u8)?;
        self.regs.sp = self.regs.sp.wrapping_sub(1);
        bus.write8(self.regs.sp, (value & 0xFF) as u8)?;
        Ok(())
    }

    fn pop16(&mut self, bus: &mut BusHandle<'_>) -> Result<u16, StepFault> {
        let lo = bus.read8(self.regs.sp)? as u16;
        self.regs.sp = self.regs.sp.wrapping_add(1);
        let hi = bus.read8(self.regs.sp)? as u16;
        self.regs.sp = self.regs.sp.wrapping_add(1);
        Ok((hi << 8) | lo)
    }

    fn bump_r(&mut self) {
        self.regs.r = (self.regs.r & 0x80) | (self.regs.r.wrapping_add(1) & 0x7F);
    }

    // --- register access -----------------------------------------------

    fn bc(&self) -> u16 {
        u16::from_be_bytes([self.regs.b, self.regs.c])
    }

    fn de(&self) -> u16 {
        u16::from_be_bytes([self.regs.d, self.regs.e])
    }

    fn hl(&self, index: Index) -> u16 {
        match index {
            Index::Hl => u16::from_be_bytes([self.regs.h, self.regs.l]),
            Index::Ix => self.regs.ix,
            Index::Iy => self.regs.iy,
        }
    }

    fn set_bc(&mut self, value: u16) {
        [self.regs.b, self.regs.c] = value.to_be_bytes();
    }

    fn set_de(&mut self, value: u16) {
        [self.regs.d, self.regs.e] = value.to_be_bytes();
    }

    fn set_hl(&mut self, index: Index, value: u16) {
        match index {
            Index::Hl => [self.regs.h, self.regs.l] = value.to_be_bytes(),
            Index::Ix => self.regs.ix = value,
            Index::Iy => self.regs.iy = value,
        }
    }

    fn af(&self) -> u16 {
        u16::from_be_bytes([self.regs.a, self.regs.f])
    }

    fn set_af(&mut self, value: u16) {
        [self.regs.a, self.regs.f] = value.to_be_bytes();
    }

    /// 8-bit register by encoding 0..7 (6 is the memory slot and must not
    /// reach here). Under an index prefix, H/L map to the index halves.
    fn get8(&self, code: u8, index: Index) -> u8 {
        match (code, index) {
            (0, _) => self.regs.b,
            (1, _) => self.regs.c,
            (2, _) => self.regs.d,
            (3, _) => self.regs.e,
            (4, Index::Hl) => self.regs.h,
            (5, Index::Hl) => self.regs.l,
            (4, Index::Ix) => (self.regs.ix >> 8) as u8,
            (5, Index::Ix) => (self.regs.ix & 0xFF) as u8,
            (4, Index::Iy) => (self.regs.iy >> 8) as u8,
            (5, Index::Iy) => (self.regs.iy & 0xFF) as u8,
            (7, _) => self.regs.a,
            _ => unreachable!("memory operand handled by caller"),
        }
    }

    fn set8(&mut self, code: u8, index: Index, value: u8) {
        match (code, index) {
            (0, _) => self.regs.b = value,
            (1, _) => self.regs.c = value,
            (2, _) => self.regs.d = value,
            (3, _) => self.regs.e = value,
            (4, Index::Hl) => self.regs.h = value,
            (5, Index::Hl) => self.regs.l = value,
            (4, Index::Ix) => self.regs.ix = (self.regs.ix & 0x00FF) | ((value as u16) << 8),
            (5, Index::Ix) => self.regs.ix = (self.regs.ix & 0xFF00) | value as u16,
            (4, Index::Iy) => self.regs.iy = (self.regs.iy & 0x00FF) | ((value as u16) << 8),
            (5, Index::Iy) => self.regs.iy = (self.regs.iy & 0xFF00) | value as u16,
            (7, _) => self.regs.a = value,
            _ => unreachable!("memory operand handled by caller"),
        }
    }

    /// Effective address of the memory operand: HL, or IX/IY plus a
    /// displacement fetched from the instruction stream.
    fn mem_addr(&mut self, bus: &mut BusHandle<'_>, index: Index) -> Result<u16, StepFault> {
        match index {
            Index::Hl => Ok(self.hl(Index::Hl)),
            _ => {
                let d = self.fetch8(bus)? as i8;
                Ok(self.hl(index).wrapping_add(d as i16 as u16))
            }
        }
    }

    // --- flag helpers --------------------------------------------------

    fn set_flag(&mut self, flag: u8, on: bool) {
        if on {
            self.regs.f |= flag;
        } else {
            self.regs.f &= !flag;
        }
    }

    fn flag(&self, flag: u8) -> bool {
        self.regs.f & flag != 0
    }

    fn sz_xy(value: u8) -> u8 {
        let mut f = value & (FLAG_SIGN | FLAG_X | FLAG_Y);
        if value == 0 {
            f |= FLAG_ZERO;
        }
        f
    }

    fn parity(value: u8) -> bool {
        value.count_ones() % 2 == 0
    }

    fn condition(&self, code: u8) -> bool {
        match code {
            0 => !self.flag(FLAG_ZERO),
            1 => self.flag(FLAG_ZERO),
            2 => !self.flag(FLAG_CARRY),
            3 => self.flag(FLAG_CARRY),
            4 => !self.flag(FLAG_PARITY),
            5 => self.flag(FLAG_PARITY),
            6 => !self.flag(FLAG_SIGN),
            7 => self.flag(FLAG_SIGN),
            _ => unreachable!(),
        }
    }

    // --- 8-bit ALU -----------------------------------------------------

    fn add8(&mut self, value: u8, carry_in: bool) {
        let a = self.regs.a;
        let c = u8::from(carry_in && self.flag(FLAG_CARRY));
        let result = a.wrapping_add(value).wrapping_add(c);
        let carry = (a as u16 + value as u16 + c as u16) > 0xFF;
        let half = (a & 0x0F) + (value & 0x0F) + c > 0x0F;
        let overflow = !(a ^ value) & (a ^ result) & 0x80 != 0;
        self.regs.f = Self::sz_xy(result);
        self.set_flag(FLAG_CARRY, carry);
        self.set_flag(FLAG_HALF, half);
        self.set_flag(FLAG_PARITY, overflow);
        self.regs.a = result;
    }

    fn sub8(&mut self, value: u8, carry_in: bool, keep_result: bool) {
        let a = self.regs.a;
        let c = u8::from(carry_in && self.flag(FLAG_CARRY));
        let result = a.wrapping_sub(value).wrapping_sub(c);
        let carry = (value as u16 + c as u16) > a as u16;
        let half = (value & 0x0F) + c > (a & 0x0F);
        let overflow = (a ^ value) & (a ^ result) & 0x80 != 0;
        self.regs.f = Self::sz_xy(result);
        if !keep_result {
            // CP copies the undocumented X/Y bits from the operand.
            self.regs.f = (self.regs.f & !(FLAG_X | FLAG_Y)) | (value & (FLAG_X | FLAG_Y));
        }
        self.regs.f |= FLAG_ADD_SUB;
        self.set_flag(FLAG_CARRY, carry);
        self.set_flag(FLAG_HALF, half);
        self.set_flag(FLAG_PARITY, overflow);
        if keep_result {
            self.regs.a = result;
        }
    }

    fn logic8(&mut self, value: u8, op: u8) {
        let result = match op {
            4 => self.regs.a & value,
            5 => self.regs.a ^ value,
            _ => self.regs.a | value,
        };
        self.regs.f = Self::sz_xy(result);
        self.set_flag(FLAG_PARITY, Self::parity(result));
        self.set_flag(FLAG_HALF, op == 4);
        self.regs.a = result;
    }

    /// Dispatch the ALU group by operation code 0..7.
    fn alu8(&mut self, op: u8, value: u8) {
        match op {
            0 => self.add8(value, false),
            1 => self.add8(value, true),
            2 => self.sub8(value, false, true),
            3 => self.sub8(value, true, true),
            4 | 5 | 6 => self.logic8(value, op),
            _ => self.sub8(value, false, false),
        }
    }

    fn inc8(&mut self, value: u8) -> u8 {
        let result = value.wrapping_add(1);
        let carry = self.flag(FLAG_CARRY);
        self.regs.f = Self::sz_xy(result);
        self.set_flag(FLAG_CARRY, carry);
        self.set_flag(FLAG_HALF, value & 0x0F == 0x0F);
        self.set_flag(FLAG_PARITY, value == 0x7F);
        result
    }

    fn dec8(&mut self, value: u8) -> u8 {
        let result = value.wrapping_sub(1);
        let carry = self.flag(FLAG_CARRY);
        self.regs.f = Self::sz_xy(result) | FLAG_ADD_SUB;
        self.set_flag(FLAG_CARRY, carry);
        self.set_flag(FLAG_HALF, value & 0x0F == 0x00);
        self.set_flag(FLAG_PARITY, value == 0x80);
        result
    }

    fn add16(&mut self, lhs: u16, rhs: u16) -> u16 {
        let result = lhs.wrapping_add(rhs);
        let half = (lhs & 0x0FFF) + (rhs & 0x0FFF) > 0x0FFF;
        self.set_flag(FLAG_CARRY, (lhs as u32 + rhs as u32) > 0xFFFF);
        self.set_flag(FLAG_HALF, half);
        self.set_flag(FLAG_ADD_SUB, false);
        let high = (result >> 8) as u8;
        self.regs.f = (self.regs.f & !(FLAG_X | FLAG_Y)) | (high & (FLAG_X | FLAG_Y));
        result
    }

    fn adc16(&mut self, lhs: u16, rhs: u16) -> u16 {
        let c = u16::from(self.flag(FLAG_CARRY));
        let result = lhs.wrapping_add(rhs).wrapping_add(c);
        let carry = lhs as u32 + rhs as u32 + c as u32 > 0xFFFF;
        let half = (lhs & 0x0FFF) + (rhs & 0x0FFF) + c > 0x0FFF;
        let overflow = !(lhs ^ rhs) & (lhs ^ result) & 0x8000 != 0;
        let high = (result >> 8) as u8;
        self.regs.f = high & (FLAG_SIGN | FLAG_X | FLAG_Y);
        if result == 0 {
            self.regs.f |= FLAG_ZERO;
        }
        self.set_flag(FLAG_CARRY, carry);
        self.set_flag(FLAG_HALF, half);
        self.set_flag(FLAG_PARITY, overflow);
        result
    }

    fn sbc16(&mut self, lhs: u16, rhs: u16) -> u16 {
        let c = u16::from(self.flag(FLAG_CARRY));
        let result = lhs.wrapping_sub(rhs).wrapping_sub(c);
        let carry = (rhs as u32 + c as u32) > lhs as u32;
        let half = (rhs & 0x0FFF) + c > (lhs & 0x0FFF);
        let overflow = (lhs ^ rhs) & (lhs ^ result) & 0x8000 != 0;
        let high = (result >> 8) as u8;
        self.regs.f = (high & (FLAG_SIGN | FLAG_X | FLAG_Y)) | FLAG_ADD_SUB;
        if result == 0 {
            self.regs.f |= FLAG_ZERO;
        }
        self.set_flag(FLAG_CARRY, carry);
        self.set_flag(FLAG_HALF, half);
        self.set_flag(FLAG_PARITY, overflow);
        result
    }

    // --- rotates / shifts ----------------------------------------------

    fn rotate_a(&mut self, opcode: u8) {
        let a = self.regs.a;
        let carry = self.flag(FLAG_CARRY);
        let (result, carry_out) = match opcode {
            0x07 => (a.rotate_left(1), a & 0x80 != 0),
            0x0F => (a.rotate_right(1), a & 0x01 != 0),
            0x17 => ((a << 1) | u8::from(carry), a & 0x80 != 0),
            _ => ((a >> 1) | (u8::from(carry) << 7), a & 0x01 != 0),
        };
        self.regs.a = result;
        self.set_flag(FLAG_CARRY, carry_out);
        self.set_flag(FLAG_HALF, false);
        self.set_flag(FLAG_ADD_SUB, false);
        self.regs.f = (self.regs.f & !(FLAG_X | FLAG_Y)) | (result & (FLAG_X | FLAG_Y));
    }

    fn cb_rotate(&mut self, op: u8, value: u8) -> u8 {
        let carry = self.flag(FLAG_CARRY);
        let (result, carry_out) = match op {
            0 => (value.rotate_left(1), value & 0x80 != 0),
            1 => (value.rotate_right(1), value & 0x01 != 0),
            2 => ((value << 1) | u8::from(carry), value & 0x80 != 0),
            3 => ((value >> 1) | (u8::from(carry) << 7), value & 0x01 != 0),
            4 => (value << 1, value & 0x80 != 0),
            5 => ((value >> 1) | (value & 0x80), value & 0x01 != 0),
            // SLL: undocumented, shifts in a 1.
            6 => ((value << 1) | 1, value & 0x80 != 0),
            _ => (value >> 1, value & 0x01 != 0),
        };
        self.regs.f = Self::sz_xy(result);
        self.set_flag(FLAG_PARITY, Self::parity(result));
        self.set_flag(FLAG_CARRY, carry_out);
        result
    }

    fn bit_test(&mut self, bit: u8, value: u8) {
        let set = value & (1 << bit) != 0;
        let carry = self.flag(FLAG_CARRY);
        self.regs.f = value & (FLAG_X | FLAG_Y);
        self.set_flag(FLAG_ZERO, !set);
        self.set_flag(FLAG_PARITY, !set);
        self.set_flag(FLAG_SIGN, set && bit == 7);
        self.regs.f |= FLAG_HALF;
        self.set_flag(FLAG_CARRY, carry);
    }

    fn daa(&mut self) {
        let a = self.regs.a;
        let mut adjust = 0u8;
        let mut carry = self.flag(FLAG_CARRY);
        if self.flag(FLAG_HALF) || (a & 0x0F) > 9 {
            adjust |= 0x06;
        }
        if carry || a > 0x99 {
            adjust |= 0x60;
            carry = true;
        }
        let result = if self.flag(FLAG_ADD_SUB) {
            a.wrapping_sub(adjust)
        } else {
            a.wrapping_add(adjust)
        };
        let n = self.flag(FLAG_ADD_SUB);
        let half = if n {
            self.flag(FLAG_HALF) && (a & 0x0F) < 6
        } else {
            (a & 0x0F) > 9
        };
        self.regs.f = Self::sz_xy(result);
        self.set_flag(FLAG_PARITY, Self::parity(result));
        self.set_flag(FLAG_ADD_SUB, n);
        self.set_flag(FLAG_HALF, half);
        self.set_flag(FLAG_CARRY, carry);
        self.regs.a = result;
    }

    // --- interrupt servicing -------------------------------------------

    fn service_nmi(&mut self, bus: &mut BusHandle<'_>) -> Result<u32, StepFault> {
        self.nmi_pending = false;
        self.halted = false;
        self.iff2 = self.iff1;
        self.iff1 = false;
        let pc = self.regs.pc;
        self.push16(bus, pc)?;
        self.regs.pc = NMI_VECTOR;
        Ok(11)
    }

    fn service_irq(&mut self, bus: &mut BusHandle<'_>) -> Result<u32, StepFault> {
        self.irq_pending = false;
        self.halted = false;
        self.iff1 = false;
        self.iff2 = false;
        let pc = self.regs.pc;
        self.push16(bus, pc)?;
        match self.im {
            2 => {
                let table = ((self.regs.i as u16) << 8) | self.irq_vector as u16;
                self.regs.pc = bus.read16(table)?;
                Ok(19)
            }
            // IM0 is treated as IM1; nothing on this board places opcodes
            // on the data bus.
            _ => {
                self.regs.pc = IRQ_IM1_VECTOR;
                Ok(13)
            }
        }
    }

    // --- prefixed groups ------------------------------------------------

    fn step_cb(&mut self, bus: &mut BusHandle<'_>, index: Index) -> Result<u32, StepFault> {
        // DDCB/FDCB carry the displacement before the final opcode and
        // always operate on memory.
        let (addr, opcode) = match index {
            Index::Hl => (None, self.fetch8(bus)?),
            _ => {
                let d = self.fetch8(bus)? as i8;
                let addr = self.hl(index).wrapping_add(d as i16 as u16);
                (Some(addr), self.fetch8(bus)?)
            }
        };

        let group = opcode >> 6;
        let bit = (opcode >> 3) & 0x07;
        let reg = opcode & 0x07;
        let memory = addr.is_some() || reg == 6;
        let target = match addr {
            Some(a) => Some(a),
            None if reg == 6 => Some(self.hl(Index::Hl)),
            None => None,
        };

        let value = match target {
            Some(a) => bus.read8(a)?,
            None => self.get8(reg, Index::Hl),
        };

        match group {
            0 => {
                let result = self.cb_rotate(bit, value);
                match target {
                    Some(a) => bus.write8(a, result)?,
                    None => self.set8(reg, Index::Hl, result),
                }
            }
            1 => self.bit_test(bit, value),
            2 => {
                let result = value & !(1 << bit);
                match target {
                    Some(a) => bus.write8(a, result)?,
                    None => self.set8(reg, Index::Hl, result),
                }
            }
            _ => {
                let result = value | (1 << bit);
                match target {
                    Some(a) => bus.write8(a, result)?,
                    None => self.set8(reg, Index::Hl, result),
                }
            }
        }

        Ok(match (memory, group, index) {
            (false, _, _) => 8,
            (true, 1, Index::Hl) => 12,
            (true, _, Index::Hl) => 15,
            (true, 1, _) => 20,
            (true, _, _) => 23,
        })
    }

    fn step_ed(&mut self, bus: &mut BusHandle<'_>) -> Result<u32, StepFault> {
        let opcode = self.fetch8(bus)?;
        match opcode {
            // IN r,(C) / IN (C)
            0x40 | 0x48 | 0x50 | 0x58 | 0x60 | 0x68 | 0x70 | 0x78 => {
                let value = bus.device_read(self.regs.c);
                let reg = (opcode >> 3) & 0x07;
                if reg != 6 {
                    self.set8(reg, Index::Hl, value);
                }
                let carry = self.flag(FLAG_CARRY);
                self.regs.f = Self::sz_xy(value);
                self.set_flag(FLAG_PARITY, Self::parity(value));
                self.set_flag(FLAG_CARRY, carry);
                Ok(12)
            }
            // OUT (C),r / OUT (C),0
            0x41 | 0x49 | 0x51 | 0x59 | 0x61 | 0x69 | 0x71 | 0x79 => {
                let reg = (opcode >> 3) & 0x07;
                let value = if reg == 6 { 0 } else { self.get8(reg, Index::Hl) };
                bus.device_write(self.regs.c, value);
                Ok(12)
            }
            // SBC HL,ss / ADC HL,ss
            0x42 | 0x52 | 0x62 | 0x72 | 0x4A | 0x5A | 0x6A | 0x7A => {
                let pair = (opcode >> 4) & 0x03;
                let rhs = match pair {
                    0 => self.bc(),
                    1 => self.de(),
                    2 => self.hl(Index::Hl),
                    _ => self.regs.sp,
                };
                let hl = self.hl(Index::Hl);
                let result = if opcode & 0x08 == 0 {
                    self.sbc16(hl, rhs)
                } else {
                    self.adc16(hl, rhs)
                };
                self.set_hl(Index::Hl, result);
                Ok(15)
            }
            // LD (nn),ss / LD ss,(nn)
            0x43 | 0x53 | 0x63 | 0x73 | 0x4B | 0x5B | 0x6B | 0x7B => {
                let pair = (opcode >> 4) & 0x03;
                let addr = self.fetch16(bus)?;
                if opcode & 0x08 == 0 {
                    let value = match pair {
                        0 => self.bc(),
                        1 => self.de(),
                        2 => self.hl(Index::Hl),
                        _ => self.regs.sp,
                    };
                    bus.write16(addr, value)?;
                } else {
                    let value = bus.read16(addr)?;
                    match pair {
                        0 => self.set_bc(value),
                        1 => self.set_de(value),
                        2 => self.set_hl(Index::Hl, value),
                        _ => self.regs.sp = value,
                    }
                }
                Ok(20)
            }
            // NEG (documented and mirrors)
            0x44 | 0x4C | 0x54 | 0x5C | 0x64 | 0x6C | 0x74 | 0x7C => {
                let a = self.regs.a;
                self.regs.a = 0;
                self.sub8(a, false, true);
                Ok(8)
            }
            // RETN (and mirrors) / RETI
            0x45 | 0x4D | 0x55 | 0x5D | 0x65 | 0x6D | 0x75 | 0x7D => {
                self.regs.pc = self.pop16(bus)?;
                self.iff1 = self.iff2;
                Ok(14)
            }
            // IM 0/1/2 (and mirrors)
            0x46 | 0x4E | 0x66 | 0x6E => {
                self.im = 0;
                Ok(8)
            }
            0x56 | 0x76 => {
                self.im = 1;
                Ok(8)
            }
            0x5E | 0x7E => {
                self.im = 2;
                Ok(8)
            }
            0x47 => {
                self.regs.i = self.regs.a;
                Ok(9)
            }
            0x4F => {
                self.regs.r = self.regs.a;
                Ok(9)
            }
            0x57 | 0x5F => {
                let value = if opcode == 0x57 { self.regs.i } else { self.regs.r };
                self.regs.a = value;
                let carry = self.flag(FLAG_CARRY);
                self.regs.f = Self::sz_xy(value);
                self.set_flag(FLAG_PARITY, self.iff2);
                self.set_flag(FLAG_CARRY, carry);
                Ok(9)
            }
            // RRD / RLD
            0x67 | 0x6F => {
                let addr = self.hl(Index::Hl);
                let mem = bus.read8(addr)?;
                let a = self.regs.a;
                let (new_a, new_mem) = if opcode == 0x67 {
                    ((a & 0xF0) | (mem & 0x0F), (a << 4) | (mem >> 4))
                } else {
                    ((a & 0xF0) | (mem >> 4), (mem << 4) | (a & 0x0F))
                };
                bus.write8(addr, new_mem)?;
                self.regs.a = new_a;
                let carry = self.flag(FLAG_CARRY);
                self.regs.f = Self::sz_xy(new_a);
                self.set_flag(FLAG_PARITY, Self::parity(new_a));
                self.set_flag(FLAG_CARRY, carry);
                Ok(18)
            }
            // LDI / LDD / LDIR / LDDR
            0xA0 | 0xA8 | 0xB0 | 0xB8 => {
                let value = bus.read8(self.hl(Index::Hl))?;
                bus.write8(self.de(), value)?;
                let delta: u16 = if opcode & 0x08 == 0 { 1 } else { 0xFFFF };
                self.set_hl(Index::Hl, self.hl(Index::Hl).wrapping_add(delta));
                self.set_de(self.de().wrapping_add(delta));
                let bc = self.bc().wrapping_sub(1);
                self.set_bc(bc);
                self.set_flag(FLAG_HALF, false);
                self.set_flag(FLAG_ADD_SUB, false);
                self.set_flag(FLAG_PARITY, bc != 0);
                let n = value.wrapping_add(self.regs.a);
                self.set_flag(FLAG_Y, n & 0x02 != 0);
                self.set_flag(FLAG_X, n & FLAG_X != 0);
                if opcode & 0x10 != 0 && bc != 0 {
                    self.regs.pc = self.regs.pc.wrapping_sub(2);
                    Ok(21)
                } else {
                    Ok(16)
                }
            }
            // CPI / CPD / CPIR / CPDR
            0xA1 | 0xA9 | 0xB1 | 0xB9 => {
                let value = bus.read8(self.hl(Index::Hl))?;
                let a = self.regs.a;
                let result = a.wrapping_sub(value);
                let half = (value & 0x0F) > (a & 0x0F);
                let delta: u16 = if opcode & 0x08 == 0 { 1 } else { 0xFFFF };
                self.set_hl(Index::Hl, self.hl(Index::Hl).wrapping_add(delta));
                let bc = self.bc().wrapping_sub(1);
                self.set_bc(bc);
                let carry = self.flag(FLAG_CARRY);
                self.regs.f = Self::sz_xy(result) | FLAG_ADD_SUB;
                self.set_flag(FLAG_HALF, half);
                self.set_flag(FLAG_PARITY, bc != 0);
                self.set_flag(FLAG_CARRY, carry);
                if opcode & 0x10 != 0 && bc != 0 && result != 0 {
                    self.regs.pc = self.regs.pc.wrapping_sub(2);
                    Ok(21)
                } else {
                    Ok(16)
                }
            }
            // INI / IND / INIR / INDR
            0xA2 | 0xAA | 0xB2 | 0xBA => {
                let value = bus.device_read(self.regs.c);
                bus.write8(self.hl(Index::Hl), value)?;
                let delta: u16 = if opcode & 0x08 == 0 { 1 } else { 0xFFFF };
                self.set_hl(Index::Hl, self.hl(Index::Hl).wrapping_add(delta));
                self.regs.b = self.regs.b.wrapping_sub(1);
                let b = self.regs.b;
                self.regs.f = Self::sz_xy(b) | FLAG_ADD_SUB;
                if opcode & 0x10 != 0 && b != 0 {
                    self.regs.pc = self.regs.pc.wrapping_sub(2);
                    Ok(21)
                } else {
                    Ok(16)
                }
            }
            // OUTI / OUTD / OTIR / OTDR
            0xA3 | 0xAB | 0xB3 | 0xBB => {
                let value = bus.read8(self.hl(Index::Hl))?;
                bus.device_write(self.regs.c, value);
                let delta: u16 = if opcode & 0x08 == 0 { 1 } else { 0xFFFF };
                self.set_hl(Index::Hl, self.hl(Index::Hl).wrapping_add(delta));
                self.regs.b = self.regs.b.wrapping_sub(1);
                let b = self.regs.b;
                self.regs.f = Self::sz_xy(b) | FLAG_ADD_SUB;
                if opcode & 0x10 != 0 && b != 0 {
                    self.regs.pc = self.regs.pc.wrapping_sub(2);
                    Ok(21)
                } else {
                    Ok(16)
                }
            }
            _ => Err(self.fault(format!(
                "undefined ED opcode {opcode:#04X} at {:#06X}",
                self.regs.pc.wrapping_sub(2)
            ))),
        }
    }

    // --- main dispatch --------------------------------------------------

    fn execute(
        &mut self,
        bus: &mut BusHandle<'_>,
        opcode: u8,
        index: Index,
    ) -> Result<u32, StepFault> {
        // Indexed forms pay the prefix fetch; displacement timing is
        // folded in approximately.
        let prefix_cost: u32 = if index == Index::Hl { 0 } else { 4 };

        // LD r,r' block (0x40-0x7F minus HALT).
        if (0x40..=0x7F).contains(&opcode) && opcode != 0x76 {
            let dst = (opcode >> 3) & 0x07;
            let src = opcode & 0x07;
            return Ok(match (dst, src) {
                (6, s) => {
                    let addr = self.mem_addr(bus, index)?;
                    // The register operand beside (IX+d) is the real one.
                    let value = self.get8(s, Index::Hl);
                    bus.write8(addr, value)?;
                    7 + prefix_cost * 3
                }
                (d, 6) => {
                    let addr = self.mem_addr(bus, index)?;
                    let value = bus.read8(addr)?;
                    self.set8(d, Index::Hl, value);
                    7 + prefix_cost * 3
                }
                (d, s) => {
                    let value = self.get8(s, index);
                    self.set8(d, index, value);
                    4 + prefix_cost
                }
            });
        }

        // ALU block (0x80-0xBF).
        if (0x80..=0xBF).contains(&opcode) {
            let op = (opcode >> 3) & 0x07;
            let src = opcode & 0x07;
            let (value, cycles) = if src == 6 {
                let addr = self.mem_addr(bus, index)?;
                (bus.read8(addr)?, 7 + prefix_cost * 3)
            } else {
                (self.get8(src, index), 4 + prefix_cost)
            };
            self.alu8(op, value);
            return Ok(cycles);
        }

        match opcode {
            0x00 => Ok(4),
            0x76 => {
                self.halted = true;
                Ok(4)
            }

            // LD dd,nn
            0x01 | 0x11 | 0x21 | 0x31 => {
                let value = self.fetch16(bus)?;
                match opcode {
                    0x01 => self.set_bc(value),
                    0x11 => self.set_de(value),
                    0x21 => self.set_hl(index, value),
                    _ => self.regs.sp = value,
                }
                Ok(10 + prefix_cost)
            }

            // LD (BC)/(DE),A and back
            0x02 => {
                bus.write8(self.bc(), self.regs.a)?;
                Ok(7)
            }
            0x12 => {
                bus.write8(self.de(), self.regs.a)?;
                Ok(7)
            }
            0x0A => {
                self.regs.a = bus.read8(self.bc())?;
                Ok(7)
            }
            0x1A => {
                self.regs.a = bus.read8(self.de())?;
                Ok(7)
            }

            // LD (nn),HL / LD HL,(nn) / LD (nn),A / LD A,(nn)
            0x22 => {
                let addr = self.fetch16(bus)?;
                bus.write16(addr, self.hl(index))?;
                Ok(16 + prefix_cost)
            }
            0x2A => {
                let addr = self.fetch16(bus)?;
                let value = bus.read16(addr)?;
                self.set_hl(index, value);
                Ok(16 + prefix_cost)
            }
            0x32 => {
                let addr = self.fetch16(bus)?;
                bus.write8(addr, self.regs.a)?;
                Ok(13)
            }
            0x3A => {
                let addr = self.fetch16(bus)?;
                self.regs.a = bus.read8(addr)?;
                Ok(13)
            }

            // INC/DEC dd
            0x03 | 0x13 | 0x23 | 0x33 => {
                match opcode {
                    0x03 => self.set_bc(self.bc().wrapping_add(1)),
                    0x13 => self.set_de(self.de().wrapping_add(1)),
                    0x23 => self.set_hl(index, self.hl(index).wrapping_add(1)),
                    _ => self.regs.sp = self.regs.sp.wrapping_add(1),
                }
                Ok(6 + prefix_cost)
            }
            0x0B | 0x1B | 0x2B | 0x3B => {
                match opcode {
                    0x0B => self.set_bc(self.bc().wrapping_sub(1)),
                    0x1B => self.set_de(self.de().wrapping_sub(1)),
                    0x2B => self.set_hl(index, self.hl(index).wrapping_sub(1)),
                    _ => self.regs.sp = self.regs.sp.wrapping_sub(1),
                }
                Ok(6 + prefix_cost)
            }

            // INC/DEC r and (HL)/(IX+d)
            0x04 | 0x0C | 0x14 | 0x1C | 0x24 | 0x2C | 0x3C => {
                let reg = (opcode >> 3) & 0x07;
                let value = self.get8(reg, index);
                let result = self.inc8(value);
                self.set8(reg, index, result);
                Ok(4 + prefix_cost)
            }
            0x05 | 0x0D | 0x15 | 0x1D | 0x25 | 0x2D | 0x3D => {
                let reg = (opcode >> 3) & 0x07;
                let value = self.get8(reg, index);
                let result = self.dec8(value);
                self.set8(reg, index, result);
                Ok(4 + prefix_cost)
            }
            0x34 => {
                let addr = self.mem_addr(bus, index)?;
                let value = bus.read8(addr)?;
                let result = self.inc8(value);
                bus.write8(addr, result)?;
                Ok(11 + prefix_cost * 3)
            }
            0x35 => {
                let addr = self.mem_addr(bus, index)?;
                let value = bus.read8(addr)?;
                let result = self.dec8(value);
                bus.write8(addr, result)?;
                Ok(11 + prefix_cost * 3)
            }

            // LD r,n / LD (HL),n
            0x06 | 0x0E | 0x16 | 0x1E | 0x26 | 0x2E | 0x3E => {
                let reg = (opcode >> 3) & 0x07;
                let value = self.fetch8(bus)?;
                self.set8(reg, index, value);
                Ok(7 + prefix_cost)
            }
            0x36 => {
                let addr = self.mem_addr(bus, index)?;
                let value = self.fetch8(bus)?;
                bus.write8(addr, value)?;
                Ok(10 + prefix_cost * 2)
            }

            // rotates on A, DAA, CPL, SCF, CCF
            0x07 | 0x0F | 0x17 | 0x1F => {
                self.rotate_a(opcode);
                Ok(4)
            }
            0x27 => {
                self.daa();
                Ok(4)
            }
            0x2F => {
                self.regs.a = !self.regs.a;
                self.set_flag(FLAG_HALF, true);
                self.set_flag(FLAG_ADD_SUB, true);
                self.regs.f =
                    (self.regs.f & !(FLAG_X | FLAG_Y)) | (self.regs.a & (FLAG_X | FLAG_Y));
                Ok(4)
            }
            0x37 => {
                self.set_flag(FLAG_CARRY, true);
                self.set_flag(FLAG_HALF, false);
                self.set_flag(FLAG_ADD_SUB, false);
                self.regs.f =
                    (self.regs.f & !(FLAG_X | FLAG_Y)) | (self.regs.a & (FLAG_X | FLAG_Y));
                Ok(4)
            }
            0x3F => {
                let carry = self.flag(FLAG_CARRY);
                self.set_flag(FLAG_HALF, carry);
                self.set_flag(FLAG_CARRY, !carry);
                self.set_flag(FLAG_ADD_SUB, false);
                self.regs.f =
                    (self.regs.f & !(FLAG_X | FLAG_Y)) | (self.regs.a & (FLAG_X | FLAG_Y));
                Ok(4)
            }

            // ADD HL,ss
            0x09 | 0x19 | 0x29 | 0x39 => {
                let rhs = match opcode {
                    0x09 => self.bc(),
                    0x19 => self.de(),
                    0x29 => self.hl(index),
                    _ => self.regs.sp,
                };
                let result = self.add16(self.hl(index), rhs);
                self.set_hl(index, result);
                Ok(11 + prefix_cost)
            }

            // EX AF,AF' / EXX / DJNZ / JR / JR cc
            0x08 => {
                std::mem::swap(&mut self.regs.a, &mut self.regs.alt_a);
                std::mem::swap(&mut self.regs.f, &mut self.regs.alt_f);
                Ok(4)
            }
            0xD9 => {
                std::mem::swap(&mut self.regs.b, &mut self.regs.alt_b);
                std::mem::swap(&mut self.regs.c, &mut self.regs.alt_c);
                std::mem::swap(&mut self.regs.d, &mut self.regs.alt_d);
                std::mem::swap(&mut self.regs.e, &mut self.regs.alt_e);
                std::mem::swap(&mut self.regs.h, &mut self.regs.alt_h);
                std::mem::swap(&mut self.regs.l, &mut self.regs.alt_l);
                Ok(4)
            }
            0x10 => {
                let offset = self.fetch8(bus)? as i8;
                self.regs.b = self.regs.b.wrapping_sub(1);
                if self.regs.b != 0 {
                    self.regs.pc = self.regs.pc.wrapping_add(offset as i16 as u16);
                    Ok(13)
                } else {
                    Ok(8)
                }
            }
            0x18 => {
                let offset = self.fetch8(bus)? as i8;
                self.regs.pc = self.regs.pc.wrapping_add(offset as i16 as u16);
                Ok(12)
            }
            0x20 | 0x28 | 0x30 | 0x38 => {
                let offset = self.fetch8(bus)? as i8;
                let cond = (opcode >> 3) & 0x03;
                if self.condition(cond) {
                    self.regs.pc = self.regs.pc.wrapping_add(offset as i16 as u16);
                    Ok(12)
                } else {
                    Ok(7)
                }
            }

            // RET cc / RET / conditional jumps and calls
            0xC0 | 0xC8 | 0xD0 | 0xD8 | 0xE0 | 0xE8 | 0xF0 | 0xF8 => {
                let cond = (opcode >> 3) & 0x07;
                if self.condition(cond) {
                    self.regs.pc = self.pop16(bus)?;
                    Ok(11)
                } else {
                    Ok(5)
                }
            }
            0xC9 => {
                self.regs.pc = self.pop16(bus)?;
                Ok(10)
            }
            0xC2 | 0xCA | 0xD2 | 0xDA | 0xE2 | 0xEA | 0xF2 | 0xFA => {
                let target = self.fetch16(bus)?;
                let cond = (opcode >> 3) & 0x07;
                if self.condition(cond) {
                    self.regs.pc = target;
                }
                Ok(10)
            }
            0xC3 => {
                self.regs.pc = self.fetch16(bus)?;
                Ok(10)
            }
            0xC4 | 0xCC | 0xD4 | 0xDC | 0xE4 | 0xEC | 0xF4 | 0xFC => {
                let target = self.fetch16(bus)?;
                let cond = (opcode >> 3) & 0x07;
                if self.condition(cond) {
                    let pc = self.regs.pc;
                    self.push16(bus, pc)?;
                    self.regs.pc = target;
                    Ok(17)
                } else {
                    Ok(10)
                }
            }
            0xCD => {
                let target = self.fetch16(bus)?;
                let pc = self.regs.pc;
                self.push16(bus, pc)?;
                self.regs.pc = target;
                Ok(17)
            }

            // RST
            0xC7 | 0xCF | 0xD7 | 0xDF | 0xE7 | 0xEF | 0xF7 | 0xFF => {
                let pc = self.regs.pc;
                self.push16(bus, pc)?;
                self.regs.pc = (opcode & 0x38) as u16;
                Ok(11)
            }

            // PUSH/POP
            0xC5 | 0xD5 | 0xE5 | 0xF5 => {
                let value = match opcode {
                    0xC5 => self.bc(),
                    0xD5 => self.de(),
                    0xE5 => self.hl(index),
                    _ => self.af(),
                };
                self.push16(bus, value)?;
                Ok(11 + prefix_cost)
            }
            0xC1 | 0xD1 | 0xE1 | 0xF1 => {
                let value = self.pop16(bus)?;
                match opcode {
                    0xC1 => self.set_bc(value),
                    0xD1 => self.set_de(value),
                    0xE1 => self.set_hl(index, value),
                    _ => self.set_af(value),
                }
                Ok(10 + prefix_cost)
            }

            // ALU A,n
            0xC6 | 0xCE | 0xD6 | 0xDE | 0xE6 | 0xEE | 0xF6 | 0xFE => {
                let value = self.fetch8(bus)?;
                self.alu8((opcode >> 3) & 0x07, value);
                Ok(7)
            }

            // Exchanges and HL specials
            0xE3 => {
                let sp = self.regs.sp;
                let mem = bus.read16(sp)?;
                bus.write16(sp, self.hl(index))?;
                self.set_hl(index, mem);
                Ok(19 + prefix_cost)
            }
            0xEB => {
                let de = self.de();
                let hl = self.hl(Index::Hl);
                self.set_de(hl);
                self.set_hl(Index::Hl, de);
                Ok(4)
            }
            0xE9 => {
                self.regs.pc = self.hl(index);
                Ok(4 + prefix_cost)
            }
            0xF9 => {
                self.regs.sp = self.hl(index);
                Ok(6 + prefix_cost)
            }

            // I/O through device ports
            0xD3 => {
                let port = self.fetch8(bus)?;
                bus.device_write(port, self.regs.a);
                Ok(11)
            }
            0xDB => {
                let port = self.fetch8(bus)?;
                self.regs.a = bus.device_read(port);
                Ok(11)
            }

            // Interrupt enables
            0xF3 => {
                self.iff1 = false;
                self.iff2 = false;
                Ok(4)
            }
            0xFB => {
                self.iff1 = true;
                self.iff2 = true;
                self.ei_delay = true;
                Ok(4)
            }

            0xCB => Ok(self.step_cb(bus, index)?),
            0xED => Ok(self.step_ed(bus)?),

            _ => Err(self.fault(format!(
                "undecoded opcode {opcode:#04X} at {:#06X}",
                self.regs.pc.wrapping_sub(1)
            ))),
        }
    }
}

impl CpuCore for Z80 {
    fn step(&mut self, bus: &mut BusHandle<'_>) -> Result<u32, StepFault> {
        let ei_shadow = self.ei_delay;
        self.ei_delay = false;

        if self.nmi_pending {
            self.bump_r();
            return self.service_nmi(bus);
        }
        if self.irq_pending && self.iff1 && !ei_shadow {
            self.bump_r();
            return self.service_irq(bus);
        }
        if self.halted {
            // HALT keeps fetching NOPs until an interrupt arrives.
            self.bump_r();
            return Ok(4);
        }

        self.bump_r();
        let mut opcode = self.fetch8(bus)?;
        let mut index = Index::Hl;
        // Chains of DD/FD prefixes resolve to the last one seen.
        while opcode == 0xDD || opcode == 0xFD {
            index = if opcode == 0xDD { Index::Ix } else { Index::Iy };
            self.bump_r();
            opcode = self.fetch8(bus)?;
        }
        self.execute(bus, opcode, index)
    }

    fn inject_maskable(&mut self, vector_low: u8) {
        self.irq_pending = true;
        self.irq_vector = vector_low;
    }

    fn inject_nmi(&mut self) {
        self.nmi_pending = true;
    }

    fn interrupts_enabled(&self) -> bool {
        self.iff1
    }

    fn pc(&self) -> u16 {
        self.regs.pc
    }

    fn halted(&self) -> bool {
        self.halted
    }

    fn state(&self) -> CpuState {
        CpuState {
            registers: self.regs,
            halted: self.halted,
            iff1: self.iff1,
            iff2: self.iff2,
            im: self.im,
        }
    }

    fn restore(&mut self, state: &CpuState) {
        self.regs = state.registers;
        self.halted = state.halted;
        self.iff1 = state.iff1;
        self.iff2 = state.iff2;
        self.im = state.im;
        self.irq_pending = false;
        self.nmi_pending = false;
        self.ei_delay = false;
    }
}

#[cfg(test)]
mod tests;
