//! Runs a self-modifying x86 snippet against a read-only code page.
//!
//! The snippet calls backwards, pops its own return address and stores into
//! its own data bytes. Both stores must be refused, and the bytes must read
//! back unchanged.
//!
//! ## Usage
//!
//! ```sh
//! cargo run -p mmu-core --example lazy_stack
//! cargo run -p mmu-core --example lazy_stack -- --map-stack
//! ```
//!
//! Without `--map-stack` the stack is mapped on demand by a fault hook the
//! first time the `call` pushes below `ESP`.

#![allow(clippy::pedantic)]

use bitflags as _;
use log as _;
use mmu_core::{
    page_align_up, AccessKind, EmulationError, Emulator, FaultContext, FaultDecision, FaultKind,
    FaultKinds, FaultRecord, MapError, Permissions, Register, RunLimits, PAGE_SIZE,
};
use proptest as _;
use rstest as _;
#[cfg(feature = "serde")]
use serde as _;
use thiserror as _;

const CODE_BASE: u32 = 0x0040_0000;
const STACK_TOP: u32 = 0x0050_5000;

const CODE: [u8; 33] = [
    0xEB, 0x1A, 0x58, 0x83, 0xC0, 0x04, 0x83, 0xE0, 0xFC, 0x83, 0xC0, 0x01, 0xC7, 0x00, 0x78, 0x56,
    0x34, 0x12, 0x83, 0xC0, 0x07, 0xC7, 0x00, 0x21, 0x43, 0x65, 0x87, 0x90, 0xE8, 0xE1, 0xFF, 0xFF,
    0xFF,
];
const DATA: &[u8; 16] = b"xxxxAAAAxxxBBBB\0";

fn lazy_stack(ctx: &mut FaultContext<'_>, fault: &FaultRecord) -> FaultDecision {
    let esp = ctx.registers().esp();
    println!(
        "  hook: {:?} {} at {:#010x}, esp={esp:#010x}",
        fault.kind, fault.access, fault.address
    );
    if fault.kind != FaultKind::Unmapped
        || fault.access != AccessKind::Write
        || u64::from(esp) != u64::from(fault.address) + fault.length as u64
    {
        return FaultDecision::Stop;
    }
    let Some(top) = page_align_up(esp) else {
        return FaultDecision::Stop;
    };
    match ctx.memory().map(top - 0x8000, 0x8000, Permissions::RW) {
        Ok(()) => {
            println!("  hook: mapped stack {:#010x}..{top:#010x}", top - 0x8000);
            FaultDecision::Continue
        }
        Err(err) => {
            println!("  hook: stack map failed: {err}");
            FaultDecision::Stop
        }
    }
}

fn exec_on_demand(ctx: &mut FaultContext<'_>, fault: &FaultRecord) -> FaultDecision {
    let page = fault.fault_address & !(PAGE_SIZE - 1);
    match ctx.memory().protect(page, PAGE_SIZE, Permissions::RX) {
        Ok(()) => FaultDecision::Continue,
        Err(_) => FaultDecision::Pass,
    }
}

fn setup(map_stack: bool) -> Result<Emulator, MapError> {
    let mut emu = Emulator::default();
    let mut memory = emu.memory();
    memory.map(0x0010_0000, 0x1000, Permissions::ALL)?;
    memory.map(0x0020_0000, 0x2000, Permissions::ALL)?;
    memory.map(0x0030_0000, 0x3000, Permissions::ALL)?;
    memory.map(CODE_BASE, 0x4000, Permissions::READ)?;
    memory.write(CODE_BASE, &CODE)?;
    memory.write(CODE_BASE + CODE.len() as u32, DATA)?;
    if map_stack {
        memory.map(0x0050_0000, 0x5000, Permissions::RW)?;
    }

    emu.registers_mut().set_esp(STACK_TOP);
    emu.add_fault_hook(FaultKinds::EXEC_PROTECTED, None, exec_on_demand);
    emu.add_fault_hook(FaultKinds::ALL, None, lazy_stack);
    Ok(emu)
}

fn report(label: &str, result: Result<mmu_core::RunSummary, EmulationError>) -> bool {
    match result {
        Ok(summary) => {
            println!("{label}: unexpected success {summary:?}");
            false
        }
        Err(err) => {
            println!("{label}: {err} (code {:#04x})", err.code().as_u8());
            err.code() == mmu_core::FaultCode::ReadOnlyViolation
        }
    }
}

fn main() -> Result<(), MapError> {
    let map_stack = std::env::args().any(|arg| arg == "--map-stack");
    let mut emu = setup(map_stack)?;
    let end = CODE_BASE + (CODE.len() + DATA.len()) as u32;

    let first = emu.run(CODE_BASE, RunLimits::new().until(end).max_instructions(10));
    let mut ok = report("store #1", first);

    emu.registers_mut().set(Register::Eax, 0x0040_002C);
    let second = emu.run(
        CODE_BASE + 0x15,
        RunLimits::new().until(end).max_instructions(2),
    );
    ok &= report("store #2", second);

    let esp = emu.registers().esp();
    let memory = emu.memory();
    let checks = [
        ("data #1", 0x0040_0025, 0x4141_4141),
        ("data #2", 0x0040_002C, 0x4242_4242),
        ("return address", esp - 4, CODE_BASE + 0x21),
    ];
    for (label, address, expected) in checks {
        let value = memory.read_u32(address)?;
        println!("{label} at {address:#010x}: {value:#010x}");
        ok &= value == expected;
    }

    println!("{}", if ok { "PASS" } else { "FAIL" });
    if !ok {
        std::process::exit(1);
    }
    Ok(())
}
