//! Shared helpers for the machine-level tests: a tiny instruction encoder
//! and machine construction shortcuts.
#![allow(dead_code)]

use rvsm::machine::{Machine, MachineConfig};

pub const RAM_BASE: u64 = 0x8000_0000;

/// Honor RUST_LOG in test runs; repeated calls are fine.
pub fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};
    let _ = fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .try_init();
}

pub fn small_machine(harts: usize) -> Machine {
    Machine::new(MachineConfig {
        ram_size: 4 << 20,
        hart_count: harts,
        ..Default::default()
    })
    .expect("machine construction")
}

pub fn load_words(machine: &mut Machine, addr: u64, words: &[u32]) {
    let mut image = Vec::with_capacity(words.len() * 4);
    for w in words {
        image.extend_from_slice(&w.to_le_bytes());
    }
    machine.load_image(addr, &image).expect("image fits ram");
}

// --- Instruction encoders -------------------------------------------------

pub fn r_type(funct7: u32, rs2: u32, rs1: u32, funct3: u32, rd: u32, opcode: u32) -> u32 {
    funct7 << 25 | rs2 << 20 | rs1 << 15 | funct3 << 12 | rd << 7 | opcode
}

pub fn i_type(imm: i32, rs1: u32, funct3: u32, rd: u32, opcode: u32) -> u32 {
    (imm as u32) << 20 | rs1 << 15 | funct3 << 12 | rd << 7 | opcode
}

pub fn s_type(imm: i32, rs2: u32, rs1: u32, funct3: u32) -> u32 {
    let imm = imm as u32;
    (imm >> 5 & 0x7f) << 25 | rs2 << 20 | rs1 << 15 | funct3 << 12 | (imm & 0x1f) << 7 | 0x23
}

pub fn b_type(imm: i32, rs2: u32, rs1: u32, funct3: u32) -> u32 {
    let imm = imm as u32;
    (imm >> 12 & 1) << 31
        | (imm >> 5 & 0x3f) << 25
        | rs2 << 20
        | rs1 << 15
        | funct3 << 12
        | (imm >> 1 & 0xf) << 8
        | (imm >> 11 & 1) << 7
        | 0x63
}

pub fn j_type(imm: i32, rd: u32) -> u32 {
    let imm = imm as u32;
    (imm >> 20 & 1) << 31
        | (imm >> 1 & 0x3ff) << 21
        | (imm >> 11 & 1) << 20
        | (imm >> 12 & 0xff) << 12
        | rd << 7
        | 0x6f
}

pub fn addi(rd: u32, rs1: u32, imm: i32) -> u32 {
    i_type(imm, rs1, 0, rd, 0x13)
}

pub fn lw(rd: u32, rs1: u32, imm: i32) -> u32 {
    i_type(imm, rs1, 2, rd, 0x03)
}

pub fn ld(rd: u32, rs1: u32, imm: i32) -> u32 {
    i_type(imm, rs1, 3, rd, 0x03)
}

pub fn sw(rs2: u32, rs1: u32, imm: i32) -> u32 {
    s_type(imm, rs2, rs1, 2)
}

pub fn sd(rs2: u32, rs1: u32, imm: i32) -> u32 {
    s_type(imm, rs2, rs1, 3)
}

pub fn jal(rd: u32, imm: i32) -> u32 {
    j_type(imm, rd)
}

pub fn bne(rs1: u32, rs2: u32, imm: i32) -> u32 {
    b_type(imm, rs2, rs1, 1)
}

pub fn lr_w(rd: u32, rs1: u32) -> u32 {
    r_type(0x02 << 2, 0, rs1, 2, rd, 0x2f)
}

pub fn sc_w(rd: u32, rs2: u32, rs1: u32) -> u32 {
    r_type(0x03 << 2, rs2, rs1, 2, rd, 0x2f)
}

pub fn amoadd_w(rd: u32, rs2: u32, rs1: u32) -> u32 {
    r_type(0x00, rs2, rs1, 2, rd, 0x2f)
}

pub fn csrrw(rd: u32, csr: u32, rs1: u32) -> u32 {
    i_type(csr as i32, rs1, 1, rd, 0x73)
}

pub fn csrrs(rd: u32, csr: u32, rs1: u32) -> u32 {
    i_type(csr as i32, rs1, 2, rd, 0x73)
}

pub fn csrrsi(csr: u32, zimm: u32) -> u32 {
    i_type(csr as i32, zimm, 6, 0, 0x73)
}

pub fn wfi() -> u32 {
    0x1050_0073
}

pub fn mret() -> u32 {
    0x3020_0073
}
