//! Threaded machine tests: concurrency and timer delivery.

mod common;

use std::time::{Duration, Instant};

use common::*;
use rvsm::machine::Machine;

/// Poll a guest RAM word until it becomes non-zero or the timeout expires.
fn wait_for_flag(machine: &Machine, addr: u64, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        let mut buf = [0u8; 4];
        assert!(machine.state().ram.read(addr, &mut buf));
        if u32::from_le_bytes(buf) != 0 {
            return true;
        }
        std::thread::sleep(Duration::from_millis(1));
    }
    false
}

#[test]
fn lr_sc_and_amo_increments_are_never_lost() {
    init_tracing();
    const ITERATIONS: u64 = 10_000;
    let counter = RAM_BASE + 0x1000;
    let done0 = RAM_BASE + 0x2000;
    let done1 = RAM_BASE + 0x2100;

    let mut machine = small_machine(2);
    // Hart 0: LR/SC increment loop with retry.
    load_words(
        &mut machine,
        RAM_BASE,
        &[
            lr_w(6, 10),
            addi(6, 6, 1),
            sc_w(7, 6, 10),
            bne(7, 0, -12),
            addi(11, 11, -1),
            bne(11, 0, -20),
            addi(6, 0, 1),
            sw(6, 12, 0),
            jal(0, 0),
        ],
    );
    // Hart 1: AMO increment loop.
    load_words(
        &mut machine,
        RAM_BASE + 0x100,
        &[
            addi(6, 0, 1),
            amoadd_w(0, 6, 10),
            addi(11, 11, -1),
            bne(11, 0, -8),
            sw(6, 12, 0),
            jal(0, 0),
        ],
    );
    for (hart, entry, done) in [(0, RAM_BASE, done0), (1, RAM_BASE + 0x100, done1)] {
        machine
            .with_hart(hart, |h| {
                h.pc = entry;
                h.xregs.write(10, counter);
                h.xregs.write(11, ITERATIONS);
                h.xregs.write(12, done);
            })
            .unwrap();
    }

    machine.start();
    assert!(wait_for_flag(&machine, done0, Duration::from_secs(60)));
    assert!(wait_for_flag(&machine, done1, Duration::from_secs(60)));
    machine.pause();

    let mut buf = [0u8; 4];
    assert!(machine.state().ram.read(counter, &mut buf));
    assert_eq!(u32::from_le_bytes(buf) as u64, 2 * ITERATIONS);
}

#[test]
fn timer_interrupt_wakes_wfi() {
    init_tracing();
    let flag = RAM_BASE + 0x2000;
    let handler = RAM_BASE + 0x100;

    let mut machine = small_machine(1);
    load_words(
        &mut machine,
        RAM_BASE,
        &[
            csrrw(0, 0x305, 5), // mtvec <- handler
            csrrs(0, 0x304, 6), // mie <- MTIP
            csrrsi(0x300, 8),   // mstatus.MIE
            wfi(),
            jal(0, 0),
        ],
    );
    load_words(
        &mut machine,
        handler,
        &[
            csrrs(7, 0x342, 0), // t2 <- mcause
            sd(7, 12, 0),
            jal(0, 0),
        ],
    );
    let timer_freq = 10_000_000u64;
    machine
        .with_hart(0, |hart| {
            hart.xregs.write(5, handler);
            hart.xregs.write(6, 0x80);
            hart.xregs.write(12, flag);
            let deadline = hart.machine.timer.now() + timer_freq / 100;
            hart.shared
                .mtimecmp
                .store(deadline, std::sync::atomic::Ordering::Relaxed);
        })
        .unwrap();

    let started = Instant::now();
    machine.start();
    assert!(wait_for_flag(&machine, flag, Duration::from_secs(5)));
    let elapsed = started.elapsed();
    machine.pause();

    let mut buf = [0u8; 8];
    assert!(machine.state().ram.read(flag, &mut buf));
    assert_eq!(u64::from_le_bytes(buf), 1 << 63 | 7);
    // 10 ms of guest timer plus scheduling slack.
    assert!(elapsed < Duration::from_millis(1500), "took {elapsed:?}");
}

#[test]
fn pause_preserves_execution_state() {
    let mut machine = small_machine(1);
    // Free-running counter in x1.
    load_words(&mut machine, RAM_BASE, &[addi(1, 1, 1), jal(0, -4)]);
    machine.start();
    std::thread::sleep(Duration::from_millis(20));
    machine.pause();
    let first = machine.with_hart(0, |h| h.xregs.read(1)).unwrap();
    assert!(first > 0);
    machine.resume();
    std::thread::sleep(Duration::from_millis(20));
    machine.pause();
    let second = machine.with_hart(0, |h| h.xregs.read(1)).unwrap();
    assert!(second > first);
}

#[test]
fn software_interrupt_via_clint_crosses_harts() {
    let flag = RAM_BASE + 0x2000;
    let handler = RAM_BASE + 0x100;
    let mut machine = small_machine(2);
    // Hart 0 sleeps in WFI until MSIP fires.
    load_words(
        &mut machine,
        RAM_BASE,
        &[
            csrrw(0, 0x305, 5),
            csrrs(0, 0x304, 6),
            csrrsi(0x300, 8),
            wfi(),
            jal(0, 0),
        ],
    );
    load_words(
        &mut machine,
        handler,
        &[csrrs(7, 0x342, 0), sd(7, 12, 0), jal(0, 0)],
    );
    // Hart 1 pokes hart 0's MSWI word: clint base 0x02000000, hart index 0.
    load_words(
        &mut machine,
        RAM_BASE + 0x200,
        &[
            addi(6, 0, 1),
            sw(6, 10, 0),
            jal(0, 0),
        ],
    );
    machine
        .with_hart(0, |h| {
            h.xregs.write(5, handler);
            h.xregs.write(6, 0x8); // mie.MSIP
            h.xregs.write(12, flag);
        })
        .unwrap();
    machine
        .with_hart(1, |h| {
            h.pc = RAM_BASE + 0x200;
            h.xregs.write(10, 0x0200_0000);
        })
        .unwrap();

    machine.start();
    assert!(wait_for_flag(&machine, flag, Duration::from_secs(5)));
    machine.pause();

    let mut buf = [0u8; 8];
    assert!(machine.state().ram.read(flag, &mut buf));
    assert_eq!(u64::from_le_bytes(buf), 1 << 63 | 3);
}
