//! C-extension decode.
//!
//! Compressed instructions are expanded into their 32-bit equivalents and
//! dispatched through the general executor; the dispatcher still retires
//! them with a 2-byte PC increment. Reserved encodings (including the
//! all-zero parcel) decode to an illegal-instruction trap carrying the raw
//! 16 bits.

use crate::trap::Exception;

const OP_LOAD: u32 = 0x03;
const OP_LOAD_FP: u32 = 0x07;
const OP_IMM: u32 = 0x13;
const OP_IMM_32: u32 = 0x1b;
const OP_STORE: u32 = 0x23;
const OP_STORE_FP: u32 = 0x27;
const OP_REG: u32 = 0x33;
const OP_REG_32: u32 = 0x3b;
const OP_LUI: u32 = 0x37;
const OP_BRANCH: u32 = 0x63;
const OP_JALR: u32 = 0x67;
const OP_JAL: u32 = 0x6f;
const OP_SYSTEM: u32 = 0x73;

fn r_type(funct7: u32, rs2: u32, rs1: u32, funct3: u32, rd: u32, opcode: u32) -> u32 {
    funct7 << 25 | rs2 << 20 | rs1 << 15 | funct3 << 12 | rd << 7 | opcode
}

fn i_type(imm: i32, rs1: u32, funct3: u32, rd: u32, opcode: u32) -> u32 {
    (imm as u32) << 20 | rs1 << 15 | funct3 << 12 | rd << 7 | opcode
}

fn s_type(imm: i32, rs2: u32, rs1: u32, funct3: u32, opcode: u32) -> u32 {
    let imm = imm as u32;
    (imm >> 5 & 0x7f) << 25
        | rs2 << 20
        | rs1 << 15
        | funct3 << 12
        | (imm & 0x1f) << 7
        | opcode
}

fn b_type(imm: i32, rs2: u32, rs1: u32, funct3: u32, opcode: u32) -> u32 {
    let imm = imm as u32;
    (imm >> 12 & 1) << 31
        | (imm >> 5 & 0x3f) << 25
        | rs2 << 20
        | rs1 << 15
        | funct3 << 12
        | (imm >> 1 & 0xf) << 8
        | (imm >> 11 & 1) << 7
        | opcode
}

fn u_type(imm: u32, rd: u32, opcode: u32) -> u32 {
    imm & 0xffff_f000 | rd << 7 | opcode
}

fn j_type(imm: i32, rd: u32, opcode: u32) -> u32 {
    let imm = imm as u32;
    (imm >> 20 & 1) << 31
        | (imm >> 1 & 0x3ff) << 21
        | (imm >> 11 & 1) << 20
        | (imm >> 12 & 0xff) << 12
        | rd << 7
        | opcode
}

/// Expand one compressed parcel into its 32-bit form.
pub fn expand(insn: u16, rv64: bool) -> Result<u32, Exception> {
    let illegal = Err(Exception::IllegalInstruction(insn as u64));
    let insn = insn as u32;
    let op = insn & 3;
    let funct3 = insn >> 13 & 7;
    // Full-width register fields (quadrant 2) and the compressed x8..x15
    // primes (quadrants 0 and 1).
    let rd = insn >> 7 & 0x1f;
    let rs2 = insn >> 2 & 0x1f;
    let rd_p = 8 + (insn >> 2 & 7);
    let rs1_p = 8 + (insn >> 7 & 7);

    let expanded = match (op, funct3) {
        // --- Quadrant 0 ---------------------------------------------------
        (0, 0) => {
            // c.addi4spn
            let imm = (insn >> 7 & 0xf) << 6
                | (insn >> 11 & 3) << 4
                | (insn >> 5 & 1) << 3
                | (insn >> 6 & 1) << 2;
            if imm == 0 {
                return illegal;
            }
            i_type(imm as i32, 2, 0, rd_p, OP_IMM)
        }
        (0, 1) => {
            // c.fld
            let imm = (insn >> 10 & 7) << 3 | (insn >> 5 & 3) << 6;
            i_type(imm as i32, rs1_p, 3, rd_p, OP_LOAD_FP)
        }
        (0, 2) => {
            // c.lw
            let imm = (insn >> 10 & 7) << 3 | (insn >> 6 & 1) << 2 | (insn >> 5 & 1) << 6;
            i_type(imm as i32, rs1_p, 2, rd_p, OP_LOAD)
        }
        (0, 3) => {
            let imm_d = (insn >> 10 & 7) << 3 | (insn >> 5 & 3) << 6;
            if rv64 {
                // c.ld
                i_type(imm_d as i32, rs1_p, 3, rd_p, OP_LOAD)
            } else {
                // c.flw
                let imm =
                    (insn >> 10 & 7) << 3 | (insn >> 6 & 1) << 2 | (insn >> 5 & 1) << 6;
                i_type(imm as i32, rs1_p, 2, rd_p, OP_LOAD_FP)
            }
        }
        (0, 5) => {
            // c.fsd
            let imm = (insn >> 10 & 7) << 3 | (insn >> 5 & 3) << 6;
            s_type(imm as i32, rd_p, rs1_p, 3, OP_STORE_FP)
        }
        (0, 6) => {
            // c.sw
            let imm = (insn >> 10 & 7) << 3 | (insn >> 6 & 1) << 2 | (insn >> 5 & 1) << 6;
            s_type(imm as i32, rd_p, rs1_p, 2, OP_STORE)
        }
        (0, 7) => {
            if rv64 {
                // c.sd
                let imm = (insn >> 10 & 7) << 3 | (insn >> 5 & 3) << 6;
                s_type(imm as i32, rd_p, rs1_p, 3, OP_STORE)
            } else {
                // c.fsw
                let imm =
                    (insn >> 10 & 7) << 3 | (insn >> 6 & 1) << 2 | (insn >> 5 & 1) << 6;
                s_type(imm as i32, rd_p, rs1_p, 2, OP_STORE_FP)
            }
        }

        // --- Quadrant 1 ---------------------------------------------------
        (1, 0) => {
            // c.addi / c.nop
            let imm = sext6(insn);
            i_type(imm, rd, 0, rd, OP_IMM)
        }
        (1, 1) => {
            if rv64 {
                // c.addiw
                if rd == 0 {
                    return illegal;
                }
                i_type(sext6(insn), rd, 0, rd, OP_IMM_32)
            } else {
                // c.jal
                j_type(cj_imm(insn), 1, OP_JAL)
            }
        }
        (1, 2) => {
            // c.li
            i_type(sext6(insn), 0, 0, rd, OP_IMM)
        }
        (1, 3) => {
            if rd == 2 {
                // c.addi16sp
                let raw = (insn >> 12 & 1) << 9
                    | (insn >> 6 & 1) << 4
                    | (insn >> 5 & 1) << 6
                    | (insn >> 3 & 3) << 7
                    | (insn >> 2 & 1) << 5;
                let imm = ((raw << 22) as i32) >> 22;
                if imm == 0 {
                    return illegal;
                }
                i_type(imm, 2, 0, 2, OP_IMM)
            } else {
                // c.lui
                let raw = (insn >> 12 & 1) << 17 | (insn >> 2 & 0x1f) << 12;
                let imm = ((raw << 14) as i32) >> 14;
                if imm == 0 || rd == 0 {
                    return illegal;
                }
                u_type(imm as u32, rd, OP_LUI)
            }
        }
        (1, 4) => {
            let shamt = (insn >> 12 & 1) << 5 | insn >> 2 & 0x1f;
            match insn >> 10 & 3 {
                0 => {
                    // c.srli
                    if !rv64 && shamt >= 32 {
                        return illegal;
                    }
                    i_type(shamt as i32, rs1_p, 5, rs1_p, OP_IMM)
                }
                1 => {
                    // c.srai
                    if !rv64 && shamt >= 32 {
                        return illegal;
                    }
                    i_type(shamt as i32 | 0x400, rs1_p, 5, rs1_p, OP_IMM)
                }
                2 => {
                    // c.andi
                    i_type(sext6(insn), rs1_p, 7, rs1_p, OP_IMM)
                }
                _ => {
                    let rs2_p = rd_p;
                    match (insn >> 12 & 1, insn >> 5 & 3) {
                        (0, 0) => r_type(0x20, rs2_p, rs1_p, 0, rs1_p, OP_REG), // c.sub
                        (0, 1) => r_type(0, rs2_p, rs1_p, 4, rs1_p, OP_REG),    // c.xor
                        (0, 2) => r_type(0, rs2_p, rs1_p, 6, rs1_p, OP_REG),    // c.or
                        (0, 3) => r_type(0, rs2_p, rs1_p, 7, rs1_p, OP_REG),    // c.and
                        (1, 0) if rv64 => r_type(0x20, rs2_p, rs1_p, 0, rs1_p, OP_REG_32), // c.subw
                        (1, 1) if rv64 => r_type(0, rs2_p, rs1_p, 0, rs1_p, OP_REG_32), // c.addw
                        _ => return illegal,
                    }
                }
            }
        }
        (1, 5) => {
            // c.j
            j_type(cj_imm(insn), 0, OP_JAL)
        }
        (1, 6) => {
            // c.beqz
            b_type(cb_imm(insn), 0, rs1_p, 0, OP_BRANCH)
        }
        (1, 7) => {
            // c.bnez
            b_type(cb_imm(insn), 0, rs1_p, 1, OP_BRANCH)
        }

        // --- Quadrant 2 ---------------------------------------------------
        (2, 0) => {
            // c.slli
            let shamt = (insn >> 12 & 1) << 5 | insn >> 2 & 0x1f;
            if !rv64 && shamt >= 32 {
                return illegal;
            }
            i_type(shamt as i32, rd, 1, rd, OP_IMM)
        }
        (2, 1) => {
            // c.fldsp
            let imm = (insn >> 12 & 1) << 5 | (insn >> 5 & 3) << 3 | (insn >> 2 & 7) << 6;
            i_type(imm as i32, 2, 3, rd, OP_LOAD_FP)
        }
        (2, 2) => {
            // c.lwsp
            if rd == 0 {
                return illegal;
            }
            let imm = (insn >> 12 & 1) << 5 | (insn >> 4 & 7) << 2 | (insn >> 2 & 3) << 6;
            i_type(imm as i32, 2, 2, rd, OP_LOAD)
        }
        (2, 3) => {
            if rv64 {
                // c.ldsp
                if rd == 0 {
                    return illegal;
                }
                let imm =
                    (insn >> 12 & 1) << 5 | (insn >> 5 & 3) << 3 | (insn >> 2 & 7) << 6;
                i_type(imm as i32, 2, 3, rd, OP_LOAD)
            } else {
                // c.flwsp
                let imm =
                    (insn >> 12 & 1) << 5 | (insn >> 4 & 7) << 2 | (insn >> 2 & 3) << 6;
                i_type(imm as i32, 2, 2, rd, OP_LOAD_FP)
            }
        }
        (2, 4) => {
            match (insn >> 12 & 1, rd, rs2) {
                (0, 0, _) => return illegal,
                (0, _, 0) => i_type(0, rd, 0, 0, OP_JALR), // c.jr
                (0, _, _) => r_type(0, rs2, 0, 0, rd, OP_REG), // c.mv
                (1, 0, 0) => i_type(1, 0, 0, 0, OP_SYSTEM), // c.ebreak
                (1, _, 0) => i_type(0, rd, 0, 1, OP_JALR), // c.jalr
                (1, _, _) => r_type(0, rs2, rd, 0, rd, OP_REG), // c.add
                _ => unreachable!(),
            }
        }
        (2, 5) => {
            // c.fsdsp
            let imm = (insn >> 10 & 7) << 3 | (insn >> 7 & 7) << 6;
            s_type(imm as i32, rs2, 2, 3, OP_STORE_FP)
        }
        (2, 6) => {
            // c.swsp
            let imm = (insn >> 9 & 0xf) << 2 | (insn >> 7 & 3) << 6;
            s_type(imm as i32, rs2, 2, 2, OP_STORE)
        }
        (2, 7) => {
            if rv64 {
                // c.sdsp
                let imm = (insn >> 10 & 7) << 3 | (insn >> 7 & 7) << 6;
                s_type(imm as i32, rs2, 2, 3, OP_STORE)
            } else {
                // c.fswsp
                let imm = (insn >> 9 & 0xf) << 2 | (insn >> 7 & 3) << 6;
                s_type(imm as i32, rs2, 2, 2, OP_STORE_FP)
            }
        }

        _ => return illegal,
    };
    Ok(expanded)
}

/// The 6-bit immediate of c.addi/c.li/c.andi, sign-extended.
fn sext6(insn: u32) -> i32 {
    let raw = (insn >> 12 & 1) << 5 | insn >> 2 & 0x1f;
    ((raw << 26) as i32) >> 26
}

/// The scrambled 12-bit c.j/c.jal target offset.
fn cj_imm(insn: u32) -> i32 {
    let raw = (insn >> 12 & 1) << 11
        | (insn >> 11 & 1) << 4
        | (insn >> 9 & 3) << 8
        | (insn >> 8 & 1) << 10
        | (insn >> 7 & 1) << 6
        | (insn >> 6 & 1) << 7
        | (insn >> 3 & 7) << 1
        | (insn >> 2 & 1) << 5;
    ((raw << 20) as i32) >> 20
}

/// The 9-bit c.beqz/c.bnez offset.
fn cb_imm(insn: u32) -> i32 {
    let raw = (insn >> 12 & 1) << 8
        | (insn >> 10 & 3) << 3
        | (insn >> 5 & 3) << 6
        | (insn >> 3 & 3) << 1
        | (insn >> 2 & 1) << 5;
    ((raw << 23) as i32) >> 23
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_parcel_is_illegal() {
        assert!(expand(0, true).is_err());
        assert!(expand(0, false).is_err());
    }

    #[test]
    fn c_addi_expands() {
        // c.addi x10, -1  => 0x157d
        let insn = expand(0x157d, true).unwrap();
        // addi x10, x10, -1
        assert_eq!(insn, 0xfff5_0513);
    }

    #[test]
    fn c_li_and_c_lui() {
        // c.li x8, 5 => 0x4415
        assert_eq!(expand(0x4415, true).unwrap(), 0x0050_0413);
        // c.lui x8, 0x1 => 0x6405
        assert_eq!(expand(0x6405, true).unwrap(), 0x0000_1437);
    }

    #[test]
    fn c_mv_and_c_add() {
        // c.mv x10, x11 => 0x852e  -> add x10, x0, x11
        assert_eq!(expand(0x852e, true).unwrap(), 0x00b0_0533);
        // c.add x10, x11 => 0x952e -> add x10, x10, x11
        assert_eq!(expand(0x952e, true).unwrap(), 0x00b5_0533);
    }

    #[test]
    fn c_lw_sw_field_scramble() {
        // c.lw x9, 4(x10) => 0x4144 -> lw x9, 4(x10)
        assert_eq!(expand(0x4144, true).unwrap(), 0x0045_2483);
        // c.sw x9, 4(x10) => 0xc144 -> sw x9, 4(x10)
        assert_eq!(expand(0xc144, true).unwrap(), 0x0095_2223);
    }

    #[test]
    fn c_jr_and_c_jalr() {
        // c.jr x1 => 0x8082 -> jalr x0, 0(x1)
        assert_eq!(expand(0x8082, true).unwrap(), 0x0000_8067);
        // c.jalr x5 => 0x9282 -> jalr x1, 0(x5)
        assert_eq!(expand(0x9282, true).unwrap(), 0x0002_80e7);
    }

    #[test]
    fn c_ebreak() {
        assert_eq!(expand(0x9002, true).unwrap(), 0x0010_0073);
    }

    #[test]
    fn quadrant0_ld_is_flw_on_rv32() {
        // funct3=011 parcel: c.ld on RV64, c.flw on RV32.
        let parcel = 0x6188; // c.ld x10, 0(x11)
        let rv64 = expand(parcel, true).unwrap();
        assert_eq!(rv64 & 0x7f, 0x03);
        assert_eq!(rv64 >> 12 & 7, 3);
        let rv32 = expand(parcel, false).unwrap();
        assert_eq!(rv32 & 0x7f, 0x07);
        assert_eq!(rv32 >> 12 & 7, 2);
    }

    #[test]
    fn rv32_only_shifts_reject_high_shamt() {
        // c.slli with shamt 33 is reserved on RV32.
        let parcel = 0x1086; // c.slli x1, 33
        assert!(expand(parcel, true).is_ok());
        assert!(expand(parcel, false).is_err());
    }
}
