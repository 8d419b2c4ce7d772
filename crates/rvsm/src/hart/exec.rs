//! The general (32-bit form) instruction executor.
//!
//! Decode extracts the primary opcode and the funct3/funct7 selectors and
//! dispatches through one big match, raising IllegalInstruction for every
//! encoding hole. Handlers either fall through to the common PC increment or
//! redirect control flow via `Hart::jump`.
//!
//! RV32 and RV64 share these handlers: register values are kept canonical
//! (RV32 results sign-extended to 64 bits by `Hart::set_x`), which preserves
//! signed and unsigned comparison order, and the few operations whose
//! semantics genuinely differ (shifts, M-extension upper halves, the *W
//! forms) branch on the hart's XLEN.

use std::sync::atomic::{fence, AtomicU64, Ordering};
use std::thread;

use crate::csr::file::{csr_op, CsrOp};
use crate::csr::{ENVCFG_CBCFE, ENVCFG_CBIE, ENVCFG_CBZE};
use crate::hart::{amo, fpu, Hart};
use crate::mmu::{self, RmwTarget};
use crate::trap::{Exception, PrivilegeMode};

/// Cache-block size for the Zicbom/Zicboz operations.
const CACHE_BLOCK: u64 = 64;

/// Execute one 32-bit instruction form.
pub fn execute(hart: &mut Hart, insn: u32) -> Result<(), Exception> {
    let opcode = insn & 0x7f;
    let rd = insn >> 7 & 0x1f;
    let funct3 = insn >> 12 & 7;
    let rs1 = insn >> 15 & 0x1f;
    let rs2 = insn >> 20 & 0x1f;
    let funct7 = insn >> 25;
    let illegal = || Exception::IllegalInstruction(insn as u64);

    match opcode {
        0x03 => {
            // LOAD
            // imm[11:0] = inst[31:20]
            let offset = (insn as i32 >> 20) as i64 as u64;
            let addr = hart.virt_addr(hart.xregs.read(rs1).wrapping_add(offset));
            match funct3 {
                0x0 => {
                    // lb
                    let mut buf = [0u8; 1];
                    mmu::load(hart, addr, &mut buf)?;
                    hart.set_x(rd, buf[0] as i8 as i64 as u64);
                }
                0x1 => {
                    // lh
                    let mut buf = [0u8; 2];
                    mmu::load(hart, addr, &mut buf)?;
                    hart.set_x(rd, i16::from_le_bytes(buf) as i64 as u64);
                }
                0x2 => {
                    // lw
                    let mut buf = [0u8; 4];
                    mmu::load(hart, addr, &mut buf)?;
                    hart.set_x(rd, i32::from_le_bytes(buf) as i64 as u64);
                }
                0x3 if hart.rv64 => {
                    // ld
                    let mut buf = [0u8; 8];
                    mmu::load(hart, addr, &mut buf)?;
                    hart.set_x(rd, u64::from_le_bytes(buf));
                }
                0x4 => {
                    // lbu
                    let mut buf = [0u8; 1];
                    mmu::load(hart, addr, &mut buf)?;
                    hart.set_x(rd, buf[0] as u64);
                }
                0x5 => {
                    // lhu
                    let mut buf = [0u8; 2];
                    mmu::load(hart, addr, &mut buf)?;
                    hart.set_x(rd, u16::from_le_bytes(buf) as u64);
                }
                0x6 if hart.rv64 => {
                    // lwu
                    let mut buf = [0u8; 4];
                    mmu::load(hart, addr, &mut buf)?;
                    hart.set_x(rd, u32::from_le_bytes(buf) as u64);
                }
                _ => return Err(illegal()),
            }
        }
        0x07 => fpu::exec_load_fp(hart, insn)?,
        0x0f => exec_misc_mem(hart, insn)?,
        0x13 => {
            // OP-IMM
            let imm = (insn as i32 >> 20) as i64 as u64;
            let a = hart.xregs.read(rs1);
            match funct3 {
                0x0 => hart.set_x(rd, a.wrapping_add(imm)), // addi
                0x1 => {
                    // slli
                    let shamt = shamt_imm(hart, insn)?;
                    hart.set_x(rd, a << shamt);
                }
                0x2 => hart.set_x(rd, ((a as i64) < imm as i64) as u64), // slti
                0x3 => hart.set_x(rd, (a < imm) as u64),                 // sltiu
                0x4 => hart.set_x(rd, a ^ imm),                          // xori
                0x5 => {
                    let shamt = shamt_imm(hart, insn)?;
                    match funct7 >> 1 {
                        0x00 => {
                            // srli
                            let v = if hart.rv64 {
                                a >> shamt
                            } else {
                                (a as u32 >> shamt) as u64
                            };
                            hart.set_x(rd, v);
                        }
                        0x10 => {
                            // srai
                            let v = if hart.rv64 {
                                (a as i64 >> shamt) as u64
                            } else {
                                (a as i32 >> shamt) as i64 as u64
                            };
                            hart.set_x(rd, v);
                        }
                        _ => return Err(illegal()),
                    }
                }
                0x6 => hart.set_x(rd, a | imm), // ori
                0x7 => hart.set_x(rd, a & imm), // andi
                _ => unreachable!(),
            }
        }
        0x17 => {
            // auipc
            let imm = (insn & 0xffff_f000) as i32 as i64 as u64;
            hart.set_x(rd, hart.pc.wrapping_add(imm));
        }
        0x1b if hart.rv64 => {
            // OP-IMM-32
            let imm = (insn as i32 >> 20) as i64 as u64;
            let a = hart.xregs.read(rs1);
            match funct3 {
                0x0 => {
                    // addiw
                    hart.set_x(rd, a.wrapping_add(imm) as i32 as i64 as u64);
                }
                0x1 => {
                    // slliw
                    if funct7 != 0 {
                        return Err(illegal());
                    }
                    let shamt = rs2;
                    hart.set_x(rd, ((a as u32) << shamt) as i32 as i64 as u64);
                }
                0x5 => {
                    let shamt = rs2;
                    match funct7 {
                        0x00 => {
                            // srliw
                            hart.set_x(rd, (a as u32 >> shamt) as i32 as i64 as u64);
                        }
                        0x20 => {
                            // sraiw
                            hart.set_x(rd, (a as i32 >> shamt) as i64 as u64);
                        }
                        _ => return Err(illegal()),
                    }
                }
                _ => return Err(illegal()),
            }
        }
        0x23 => {
            // STORE
            // offset[11:5|4:0] = inst[31:25|11:7]
            let offset = ((insn as i32 >> 25 << 5) as i64 as u64) | (insn >> 7 & 0x1f) as u64;
            let addr = hart.virt_addr(hart.xregs.read(rs1).wrapping_add(offset));
            let value = hart.xregs.read(rs2);
            match funct3 {
                0x0 => mmu::store(hart, addr, &(value as u8).to_le_bytes())?, // sb
                0x1 => mmu::store(hart, addr, &(value as u16).to_le_bytes())?, // sh
                0x2 => mmu::store(hart, addr, &(value as u32).to_le_bytes())?, // sw
                0x3 if hart.rv64 => mmu::store(hart, addr, &value.to_le_bytes())?, // sd
                _ => return Err(illegal()),
            }
        }
        0x27 => fpu::exec_store_fp(hart, insn)?,
        0x2f => amo::exec_amo(hart, insn)?,
        0x33 => {
            // OP
            let a = hart.xregs.read(rs1);
            let b = hart.xregs.read(rs2);
            let shamt = b as u32 & if hart.rv64 { 0x3f } else { 0x1f };
            match (funct3, funct7) {
                (0x0, 0x00) => hart.set_x(rd, a.wrapping_add(b)), // add
                (0x0, 0x20) => hart.set_x(rd, a.wrapping_sub(b)), // sub
                (0x1, 0x00) => hart.set_x(rd, a << shamt),        // sll
                (0x2, 0x00) => hart.set_x(rd, ((a as i64) < b as i64) as u64), // slt
                (0x3, 0x00) => hart.set_x(rd, (a < b) as u64),    // sltu
                (0x4, 0x00) => hart.set_x(rd, a ^ b),             // xor
                (0x5, 0x00) => {
                    // srl
                    let v = if hart.rv64 {
                        a >> shamt
                    } else {
                        (a as u32 >> shamt) as u64
                    };
                    hart.set_x(rd, v);
                }
                (0x5, 0x20) => {
                    // sra
                    let v = if hart.rv64 {
                        (a as i64 >> shamt) as u64
                    } else {
                        (a as i32 >> shamt) as i64 as u64
                    };
                    hart.set_x(rd, v);
                }
                (0x6, 0x00) => hart.set_x(rd, a | b), // or
                (0x7, 0x00) => hart.set_x(rd, a & b), // and
                (_, 0x01) => exec_mul_div(hart, rd, a, b, funct3),
                _ => return Err(illegal()),
            }
        }
        0x37 => {
            // lui
            hart.set_x(rd, (insn & 0xffff_f000) as i32 as i64 as u64);
        }
        0x3b if hart.rv64 => {
            // OP-32
            let a = hart.xregs.read(rs1);
            let b = hart.xregs.read(rs2);
            let shamt = b as u32 & 0x1f;
            match (funct3, funct7) {
                (0x0, 0x00) => {
                    // addw
                    hart.set_x(rd, a.wrapping_add(b) as i32 as i64 as u64);
                }
                (0x0, 0x20) => {
                    // subw
                    hart.set_x(rd, a.wrapping_sub(b) as i32 as i64 as u64);
                }
                (0x1, 0x00) => {
                    // sllw
                    hart.set_x(rd, ((a as u32) << shamt) as i32 as i64 as u64);
                }
                (0x5, 0x00) => {
                    // srlw
                    hart.set_x(rd, (a as u32 >> shamt) as i32 as i64 as u64);
                }
                (0x5, 0x20) => {
                    // sraw
                    hart.set_x(rd, (a as i32 >> shamt) as i64 as u64);
                }
                (0x0, 0x01) => {
                    // mulw
                    let v = (a as i32).wrapping_mul(b as i32);
                    hart.set_x(rd, v as i64 as u64);
                }
                (0x4, 0x01) => {
                    // divw
                    let (a, b) = (a as i32, b as i32);
                    let v = if b == 0 {
                        -1
                    } else if a == i32::MIN && b == -1 {
                        a
                    } else {
                        a.wrapping_div(b)
                    };
                    hart.set_x(rd, v as i64 as u64);
                }
                (0x5, 0x01) => {
                    // divuw
                    let (a, b) = (a as u32, b as u32);
                    let v = if b == 0 { u32::MAX } else { a / b };
                    hart.set_x(rd, v as i32 as i64 as u64);
                }
                (0x6, 0x01) => {
                    // remw
                    let (a, b) = (a as i32, b as i32);
                    let v = if b == 0 {
                        a
                    } else if a == i32::MIN && b == -1 {
                        0
                    } else {
                        a.wrapping_rem(b)
                    };
                    hart.set_x(rd, v as i64 as u64);
                }
                (0x7, 0x01) => {
                    // remuw
                    let (a, b) = (a as u32, b as u32);
                    let v = if b == 0 { a } else { a % b };
                    hart.set_x(rd, v as i32 as i64 as u64);
                }
                _ => return Err(illegal()),
            }
        }
        0x43 | 0x47 | 0x4b | 0x4f => fpu::exec_fma(hart, insn)?,
        0x53 => fpu::exec_op_fp(hart, insn)?,
        0x63 => {
            // BRANCH
            // imm[12|10:5|4:1|11] = inst[31|30:25|11:8|7]
            let imm = ((insn as i32 >> 31 << 12) as u64
                | ((insn >> 25 & 0x3f) << 5) as u64
                | ((insn >> 8 & 0xf) << 1) as u64
                | ((insn >> 7 & 1) << 11) as u64) as i64 as u64;
            let a = hart.xregs.read(rs1);
            let b = hart.xregs.read(rs2);
            let taken = match funct3 {
                0x0 => a == b,                   // beq
                0x1 => a != b,                   // bne
                0x4 => (a as i64) < b as i64,    // blt
                0x5 => (a as i64) >= b as i64,   // bge
                0x6 => a < b,                    // bltu
                0x7 => a >= b,                   // bgeu
                _ => return Err(illegal()),
            };
            if taken {
                hart.jump(hart.pc.wrapping_add(imm));
            }
        }
        0x67 => {
            // jalr
            if funct3 != 0 {
                return Err(illegal());
            }
            let imm = (insn as i32 >> 20) as i64 as u64;
            let target = hart.xregs.read(rs1).wrapping_add(imm) & !1;
            let link = hart.pc.wrapping_add(hart.insn_len);
            hart.jump(target);
            hart.set_x(rd, link);
        }
        0x6f => {
            // jal
            // imm[20|10:1|11|19:12] = inst[31|30:21|20|19:12]
            let imm = ((insn as i32 >> 31 << 20) as u64
                | ((insn >> 21 & 0x3ff) << 1) as u64
                | ((insn >> 20 & 1) << 11) as u64
                | (insn & 0xff000) as u64) as i64 as u64;
            let link = hart.pc.wrapping_add(hart.insn_len);
            hart.jump(hart.pc.wrapping_add(imm));
            hart.set_x(rd, link);
        }
        0x73 => exec_system(hart, insn, rd, funct3, rs1, rs2, funct7)?,
        _ => return Err(illegal()),
    }
    Ok(())
}

/// Shift amounts in OP-IMM: 6 bits on RV64, 5 on RV32 (bit 25 reserved).
fn shamt_imm(hart: &Hart, insn: u32) -> Result<u32, Exception> {
    let shamt = insn >> 20 & 0x3f;
    if !hart.rv64 && shamt >= 32 {
        return Err(Exception::IllegalInstruction(insn as u64));
    }
    Ok(shamt)
}

/// The M extension on full-width operands.
fn exec_mul_div(hart: &mut Hart, rd: u32, a: u64, b: u64, funct3: u32) {
    let value = if hart.rv64 {
        match funct3 {
            0x0 => a.wrapping_mul(b), // mul
            0x1 => {
                // mulh
                ((a as i64 as i128).wrapping_mul(b as i64 as i128) >> 64) as u64
            }
            0x2 => {
                // mulhsu
                ((a as i64 as i128).wrapping_mul(b as u128 as i128) >> 64) as u64
            }
            0x3 => {
                // mulhu
                ((a as u128).wrapping_mul(b as u128) >> 64) as u64
            }
            0x4 => {
                // div
                let (a, b) = (a as i64, b as i64);
                if b == 0 {
                    u64::MAX
                } else if a == i64::MIN && b == -1 {
                    a as u64
                } else {
                    a.wrapping_div(b) as u64
                }
            }
            0x5 => {
                // divu
                if b == 0 {
                    u64::MAX
                } else {
                    a / b
                }
            }
            0x6 => {
                // rem
                let (a, b) = (a as i64, b as i64);
                if b == 0 {
                    a as u64
                } else if a == i64::MIN && b == -1 {
                    0
                } else {
                    a.wrapping_rem(b) as u64
                }
            }
            _ => {
                // remu
                if b == 0 {
                    a
                } else {
                    a % b
                }
            }
        }
    } else {
        let (a32, b32) = (a as i32, b as i32);
        match funct3 {
            0x0 => a.wrapping_mul(b),
            0x1 => ((a32 as i64).wrapping_mul(b32 as i64) >> 32) as u64,
            0x2 => ((a32 as i64).wrapping_mul(b as u32 as i64) >> 32) as u64,
            0x3 => ((a as u32 as u64).wrapping_mul(b as u32 as u64) >> 32) as u64,
            0x4 => {
                if b32 == 0 {
                    u64::MAX
                } else if a32 == i32::MIN && b32 == -1 {
                    a32 as u64
                } else {
                    a32.wrapping_div(b32) as u64
                }
            }
            0x5 => {
                let (a, b) = (a as u32, b as u32);
                if b == 0 {
                    u32::MAX as u64
                } else {
                    (a / b) as u64
                }
            }
            0x6 => {
                if b32 == 0 {
                    a32 as u64
                } else if a32 == i32::MIN && b32 == -1 {
                    0
                } else {
                    a32.wrapping_rem(b32) as u64
                }
            }
            _ => {
                let (a, b) = (a as u32, b as u32);
                if b == 0 {
                    a as u64
                } else {
                    (a % b) as u64
                }
            }
        }
    };
    hart.set_x(rd, value);
}

/// MISC-MEM: FENCE, FENCE.I and the cache-block operations.
fn exec_misc_mem(hart: &mut Hart, insn: u32) -> Result<(), Exception> {
    let rd = insn >> 7 & 0x1f;
    let rs1 = insn >> 15 & 0x1f;
    let illegal = || Exception::IllegalInstruction(insn as u64);
    match insn >> 12 & 7 {
        0x0 => {
            // fence / pause
            if insn == 0x0100_000f {
                // The PAUSE hint yields the host scheduler.
                thread::yield_now();
                return Ok(());
            }
            let pw = insn >> 24 & 1;
            let sr = insn >> 21 & 1;
            if pw != 0 && sr != 0 {
                // A StoreLoad fence needs total ordering.
                fence(Ordering::SeqCst);
            } else {
                fence(Ordering::AcqRel);
            }
        }
        0x1 => {
            // fence.i
            hart.machine.jit.flush();
        }
        0x2 => {
            // CBO.*
            if rd != 0 {
                return Err(illegal());
            }
            let addr = hart.virt_addr(hart.xregs.read(rs1)) & !(CACHE_BLOCK - 1);
            match insn >> 20 {
                0x000 => {
                    // cbo.inval
                    if !cbo_allowed(hart, ENVCFG_CBIE) {
                        return Err(illegal());
                    }
                    fence(Ordering::AcqRel);
                }
                0x001 | 0x002 => {
                    // cbo.clean / cbo.flush; emulated devices are coherent,
                    // so a barrier is all that is architecturally visible.
                    if !cbo_allowed(hart, ENVCFG_CBCFE) {
                        return Err(illegal());
                    }
                    fence(Ordering::AcqRel);
                }
                0x004 => {
                    // cbo.zero
                    if !cbo_allowed(hart, ENVCFG_CBZE) {
                        return Err(illegal());
                    }
                    match mmu::rmw_translate(hart, addr, CACHE_BLOCK)? {
                        RmwTarget::Ptr(ptr) => unsafe {
                            for i in 0..CACHE_BLOCK / 8 {
                                (*(ptr.add(i as usize * 8) as *const AtomicU64))
                                    .store(0, Ordering::Relaxed);
                            }
                        },
                        RmwTarget::Mmio(paddr) => {
                            let zeros = [0u8; CACHE_BLOCK as usize];
                            if !hart.machine.phys_write(paddr, &zeros) {
                                return Err(Exception::StoreAccessFault(addr));
                            }
                        }
                    }
                }
                _ => return Err(illegal()),
            }
        }
        _ => return Err(illegal()),
    }
    Ok(())
}

/// Zicbom/Zicboz gating through menvcfg/senvcfg at the current privilege.
fn cbo_allowed(hart: &Hart, mask: u64) -> bool {
    match hart.privilege {
        PrivilegeMode::Machine => true,
        PrivilegeMode::Supervisor => hart.csr.menvcfg & mask != 0,
        PrivilegeMode::User => {
            hart.csr.menvcfg & mask != 0 && hart.csr.senvcfg & mask != 0
        }
    }
}

/// SYSTEM: environment calls, trap returns, WFI, SFENCE.VMA and Zicsr.
fn exec_system(
    hart: &mut Hart,
    insn: u32,
    rd: u32,
    funct3: u32,
    rs1: u32,
    rs2: u32,
    funct7: u32,
) -> Result<(), Exception> {
    let illegal = || Exception::IllegalInstruction(insn as u64);
    match funct3 {
        0x0 => match (funct7, rs2) {
            (0x00, 0x0) => {
                // ecall
                return Err(match hart.privilege {
                    PrivilegeMode::User => Exception::EnvironmentCallFromUMode,
                    PrivilegeMode::Supervisor => Exception::EnvironmentCallFromSMode,
                    PrivilegeMode::Machine => Exception::EnvironmentCallFromMMode,
                });
            }
            (0x00, 0x1) => {
                // ebreak
                return Err(Exception::Breakpoint(hart.pc));
            }
            (0x08, 0x2) => hart.xret(false, insn)?, // sret
            (0x18, 0x2) => hart.xret(true, insn)?,  // mret
            (0x08, 0x5) => hart.wfi(insn)?,         // wfi
            (0x09, _) => sfence_vma(hart, insn, rs1)?,
            _ => return Err(illegal()),
        },
        0x1 | 0x2 | 0x3 => {
            let addr = (insn >> 20) as u16;
            let value = hart.xregs.read(rs1);
            let op = match funct3 {
                0x1 => CsrOp::Swap,
                0x2 => CsrOp::SetBits,
                _ => CsrOp::ClearBits,
            };
            // csrrs/csrrc with rs1=x0 performs no write at all.
            let value = if funct3 != 0x1 && rs1 == 0 { 0 } else { value };
            let prev = csr_op(hart, addr, op, value).map_err(|_| illegal())?;
            hart.set_x(rd, prev);
        }
        0x5 | 0x6 | 0x7 => {
            let addr = (insn >> 20) as u16;
            let zimm = rs1 as u64;
            let op = match funct3 {
                0x5 => CsrOp::Swap,
                0x6 => CsrOp::SetBits,
                _ => CsrOp::ClearBits,
            };
            let prev = csr_op(hart, addr, op, zimm).map_err(|_| illegal())?;
            hart.set_x(rd, prev);
        }
        _ => return Err(illegal()),
    }
    Ok(())
}

/// SFENCE.VMA: flush one page or the whole per-hart TLB. Remote harts keep
/// their stale translations until they fence themselves.
fn sfence_vma(hart: &mut Hart, insn: u32, rs1: u32) -> Result<(), Exception> {
    if hart.privilege < PrivilegeMode::Supervisor {
        return Err(Exception::IllegalInstruction(insn as u64));
    }
    if hart.privilege == PrivilegeMode::Supervisor
        && hart.csr.mstatus & crate::csr::MSTATUS_TVM != 0
    {
        return Err(Exception::IllegalInstruction(insn as u64));
    }
    hart.reservation = None;
    if rs1 == 0 {
        hart.tlb.flush();
        hart.restart_dispatch();
    } else {
        let vaddr = hart.virt_addr(hart.xregs.read(rs1));
        if hart.tlb.flush_page(vaddr) {
            hart.restart_dispatch();
        }
    }
    Ok(())
}
