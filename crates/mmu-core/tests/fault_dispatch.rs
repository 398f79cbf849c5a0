//! Fault hook dispatch through the access gateway and the run loop.

#![allow(clippy::pedantic, clippy::nursery, clippy::unreadable_literal)]

use std::cell::RefCell;
use std::rc::Rc;

use bitflags as _;
use log as _;
use mmu_core::{
    AccessError, AccessKind, AddressSpace, EmulationError, Emulator, EmulatorConfig, FaultCode,
    FaultContext, FaultDecision, FaultKind, FaultKinds, FaultRecord, Permissions, Register,
    RegisterFile, RunLimits, TraceEvent, TraceSink,
};
use proptest as _;
use rstest::rstest;
#[cfg(feature = "serde")]
use serde as _;
use thiserror as _;

type Log = Rc<RefCell<Vec<String>>>;

fn log() -> Log {
    Rc::new(RefCell::new(Vec::new()))
}

fn space_with(base: u32, size: u32, perms: Permissions) -> AddressSpace {
    let mut space = AddressSpace::new(4);
    space.mutator().map(base, size, perms).unwrap();
    space
}

#[test]
fn hooks_are_offered_in_registration_order_until_one_decides() {
    let mut space = AddressSpace::new(4);
    let mut regs = RegisterFile::new();
    let calls = log();

    let first = Rc::clone(&calls);
    space.hooks_mut().add(
        FaultKinds::ALL,
        None,
        Box::new(move |_: &mut FaultContext<'_>, _: &FaultRecord| {
            first.borrow_mut().push("first".into());
            FaultDecision::Pass
        }),
    );
    let second = Rc::clone(&calls);
    space.hooks_mut().add(
        FaultKinds::UNMAPPED,
        None,
        Box::new(move |ctx: &mut FaultContext<'_>, fault: &FaultRecord| {
            second.borrow_mut().push(format!("second {}", fault.attempt));
            ctx.memory()
                .map(0x0800_0000, 0x1000, Permissions::RW)
                .unwrap();
            FaultDecision::Continue
        }),
    );
    let third = Rc::clone(&calls);
    space.hooks_mut().add(
        FaultKinds::ALL,
        None,
        Box::new(move |_: &mut FaultContext<'_>, _: &FaultRecord| {
            third.borrow_mut().push("third".into());
            FaultDecision::Stop
        }),
    );

    space
        .write(&mut regs, 0x0800_0010, &0xDEAD_BEEF_u32.to_le_bytes())
        .unwrap();

    assert_eq!(*calls.borrow(), ["first", "second 0"]);
    assert_eq!(
        space.read(&mut regs, 0x0800_0010, 4).unwrap(),
        0xDEAD_BEEF_u32.to_le_bytes()
    );
}

#[test]
fn hooks_outside_their_range_or_kinds_are_skipped() {
    let mut space = space_with(0x1000, 0x1000, Permissions::READ);
    let mut regs = RegisterFile::new();
    let calls = log();

    let wrong_kind = Rc::clone(&calls);
    space.hooks_mut().add(
        FaultKinds::UNMAPPED,
        None,
        Box::new(move |_: &mut FaultContext<'_>, _: &FaultRecord| {
            wrong_kind.borrow_mut().push("unmapped".into());
            FaultDecision::Continue
        }),
    );
    let wrong_range = Rc::clone(&calls);
    space.hooks_mut().add(
        FaultKinds::PROTECTION,
        Some(0x3000..=0x3FFF),
        Box::new(move |_: &mut FaultContext<'_>, _: &FaultRecord| {
            wrong_range.borrow_mut().push("elsewhere".into());
            FaultDecision::Continue
        }),
    );
    let matching = Rc::clone(&calls);
    space.hooks_mut().add(
        FaultKinds::WRITE_PROTECTED,
        Some(0x1000..=0x1FFF),
        Box::new(move |_: &mut FaultContext<'_>, fault: &FaultRecord| {
            matching
                .borrow_mut()
                .push(format!("{:?} {:#x}", fault.kind, fault.fault_address));
            FaultDecision::Stop
        }),
    );

    let err = space.write(&mut regs, 0x1800, &[1, 2]).unwrap_err();

    assert_eq!(err.code(), FaultCode::ReadOnlyViolation);
    assert_eq!(*calls.borrow(), ["WriteProtected 0x1800"]);
}

#[test]
fn removed_hook_is_never_called_again() {
    let mut emu = Emulator::default();
    let calls = log();
    let seen = Rc::clone(&calls);
    let id = emu.add_fault_hook(
        FaultKinds::ALL,
        None,
        move |_: &mut FaultContext<'_>, _: &FaultRecord| {
            seen.borrow_mut().push("hook".into());
            FaultDecision::Stop
        },
    );

    assert!(emu.remove_fault_hook(id));
    assert!(!emu.remove_fault_hook(id));

    let err = emu.run(0x0040_0000, RunLimits::new()).unwrap_err();
    assert_eq!(err.code(), FaultCode::UnmappedAccess);
    assert!(calls.borrow().is_empty());
}

#[test]
fn unmapping_in_a_hook_is_reported_as_unmapped_on_recheck() {
    let mut space = space_with(0x2000, 0x2000, Permissions::READ);
    let mut regs = RegisterFile::new();
    let kinds = Rc::new(RefCell::new(Vec::new()));

    let seen = Rc::clone(&kinds);
    space.hooks_mut().add(
        FaultKinds::ALL,
        None,
        Box::new(move |ctx: &mut FaultContext<'_>, fault: &FaultRecord| {
            seen.borrow_mut().push((fault.kind, fault.attempt));
            match fault.kind {
                FaultKind::WriteProtected => {
                    ctx.memory().unmap(0x2000, 0x2000).unwrap();
                    FaultDecision::Continue
                }
                _ => FaultDecision::Stop,
            }
        }),
    );

    let err = space.write(&mut regs, 0x2004, &[0xAA]).unwrap_err();

    assert_eq!(
        *kinds.borrow(),
        [(FaultKind::WriteProtected, 0), (FaultKind::Unmapped, 1)]
    );
    let AccessError::Unresolved(fault) = err else {
        panic!("expected unresolved fault, got {err:?}");
    };
    assert_eq!(fault.kind, FaultKind::Unmapped);
    assert_eq!(fault.fault_address, 0x2004);
    assert!(space.regions().is_empty());
}

#[test]
fn reprotecting_in_a_hook_keeps_region_contents() {
    let mut space = space_with(0x4000, 0x3000, Permissions::READ);
    let mut regs = RegisterFile::new();
    space.mutator().write(0x4000, b"keep").unwrap();
    space.mutator().write(0x6FFC, b"tail").unwrap();
    space.hooks_mut().add(
        FaultKinds::WRITE_PROTECTED,
        None,
        Box::new(|ctx: &mut FaultContext<'_>, fault: &FaultRecord| {
            let page = fault.fault_address & !0xFFF;
            ctx.memory().protect(page, 0x1000, Permissions::RW).unwrap();
            FaultDecision::Continue
        }),
    );

    space.write(&mut regs, 0x5000, b"new!").unwrap();

    let infos = space.regions().infos();
    assert_eq!(infos.len(), 3);
    assert_eq!(infos[1].perms, Permissions::RW);
    assert_eq!(space.read(&mut regs, 0x4000, 4).unwrap(), b"keep");
    assert_eq!(space.read(&mut regs, 0x5000, 4).unwrap(), b"new!");
    assert_eq!(space.read(&mut regs, 0x6FFC, 4).unwrap(), b"tail");
}

#[rstest]
#[case(0)]
#[case(1)]
#[case(5)]
fn retry_budget_bounds_hook_invocations(#[case] budget: u32) {
    let mut emu = Emulator::new(EmulatorConfig {
        fault_retry_budget: budget,
        ..EmulatorConfig::default()
    });
    emu.memory().map(0x1000, 0x1000, Permissions::RX).unwrap();
    // mov dword [eax], 0x12345678
    emu.memory()
        .write(0x1000, &[0xC7, 0x00, 0x78, 0x56, 0x34, 0x12])
        .unwrap();
    emu.registers_mut().set(Register::Eax, 0x1800);
    let attempts = Rc::new(RefCell::new(Vec::new()));
    let seen = Rc::clone(&attempts);
    emu.add_fault_hook(
        FaultKinds::WRITE_PROTECTED,
        None,
        move |_: &mut FaultContext<'_>, fault: &FaultRecord| {
            seen.borrow_mut().push((fault.attempt, fault.value));
            FaultDecision::Continue
        },
    );

    let err = emu.run(0x1000, RunLimits::new()).unwrap_err();

    assert_eq!(err.code(), FaultCode::RetryBudgetExceeded);
    let EmulationError::Memory(AccessError::RetryBudgetExceeded { fault, budget: seen_budget }) =
        err
    else {
        panic!("expected retry budget error, got {err:?}");
    };
    assert_eq!(seen_budget, budget);
    assert_eq!(fault.kind, FaultKind::WriteProtected);
    let expected: Vec<_> = (0..=budget).map(|attempt| (attempt, Some(0x1234_5678))).collect();
    assert_eq!(*attempts.borrow(), expected);
}

#[test]
fn register_edits_from_a_stopping_hook_survive_the_failed_run() {
    let mut emu = Emulator::default();
    emu.memory().map(0x1000, 0x1000, Permissions::RX).unwrap();
    // push eax
    emu.memory().write(0x1000, &[0x50]).unwrap();
    emu.registers_mut().set_esp(0x9000);
    emu.add_fault_hook(
        FaultKinds::UNMAPPED,
        None,
        |ctx: &mut FaultContext<'_>, fault: &FaultRecord| {
            assert_eq!(ctx.registers().esp(), 0x9000);
            ctx.registers_mut().set(Register::Ecx, fault.fault_address);
            FaultDecision::Stop
        },
    );

    let err = emu.run(0x1000, RunLimits::new()).unwrap_err();

    assert_eq!(err.code(), FaultCode::UnmappedAccess);
    assert_eq!(emu.registers().get(Register::Ecx), 0x8FFC);
    assert_eq!(emu.registers().esp(), 0x9000);
    assert_eq!(emu.registers().eip(), 0x1000);
}

#[test]
fn load_from_write_only_region_is_a_read_violation() {
    let mut space = space_with(0x1000, 0x1000, Permissions::WRITE);
    let mut regs = RegisterFile::new();
    let kinds = Rc::new(RefCell::new(Vec::new()));
    let seen = Rc::clone(&kinds);
    space.hooks_mut().add(
        FaultKinds::READ_PROTECTED,
        None,
        Box::new(move |_: &mut FaultContext<'_>, fault: &FaultRecord| {
            seen.borrow_mut().push((fault.access, fault.value));
            FaultDecision::Pass
        }),
    );

    let err = space.read(&mut regs, 0x1000, 4).unwrap_err();

    assert_eq!(err.code(), FaultCode::ReadViolation);
    assert_eq!(*kinds.borrow(), [(AccessKind::Read, None)]);
    space.write(&mut regs, 0x1000, &[9]).unwrap();
}

#[test]
fn wrapping_access_fails_without_dispatch() {
    let mut space = AddressSpace::new(4);
    let mut regs = RegisterFile::new();
    let calls = log();
    let seen = Rc::clone(&calls);
    space.hooks_mut().add(
        FaultKinds::ALL,
        None,
        Box::new(move |_: &mut FaultContext<'_>, _: &FaultRecord| {
            seen.borrow_mut().push("hook".into());
            FaultDecision::Continue
        }),
    );

    let err = space.read(&mut regs, 0xFFFF_FFFE, 4).unwrap_err();

    assert_eq!(err.code(), FaultCode::AddressOverflow);
    assert!(err.fault().is_none());
    assert!(calls.borrow().is_empty());
}

#[test]
fn permitted_accesses_never_reach_hooks() {
    let mut space = space_with(0x1000, 0x1000, Permissions::ALL);
    space.mutator().map(0x2000, 0x1000, Permissions::ALL).unwrap();
    let mut regs = RegisterFile::new();
    let calls = log();
    let seen = Rc::clone(&calls);
    space.hooks_mut().add(
        FaultKinds::ALL,
        None,
        Box::new(move |_: &mut FaultContext<'_>, fault: &FaultRecord| {
            seen.borrow_mut().push(format!("{:?}", fault.kind));
            FaultDecision::Stop
        }),
    );

    space.write(&mut regs, 0x1800, &[1, 2, 3, 4]).unwrap();
    assert_eq!(space.read(&mut regs, 0x1800, 4).unwrap(), [1, 2, 3, 4]);
    space.fetch(&mut regs, 0x1800, 4).unwrap();

    // Spans the boundary between the two regions.
    space.write(&mut regs, 0x1FFE, &[5, 6, 7, 8]).unwrap();
    assert_eq!(space.read(&mut regs, 0x1FFE, 4).unwrap(), [5, 6, 7, 8]);
    assert_eq!(space.fetch(&mut regs, 0x1FFE, 4).unwrap(), [5, 6, 7, 8]);

    assert!(calls.borrow().is_empty());
}

#[test]
fn straddling_write_into_read_only_region_changes_nothing() {
    let mut space = space_with(0x1000, 0x1000, Permissions::RW);
    space.mutator().map(0x2000, 0x1000, Permissions::READ).unwrap();
    let mut regs = RegisterFile::new();

    let err = space
        .write(&mut regs, 0x1FFC, &[0xFF; 8])
        .unwrap_err();

    let AccessError::Unresolved(fault) = err else {
        panic!("expected unresolved fault, got {err:?}");
    };
    assert_eq!(fault.kind, FaultKind::WriteProtected);
    assert_eq!(fault.address, 0x1FFC);
    assert_eq!(fault.fault_address, 0x2000);
    assert_eq!(space.read(&mut regs, 0x1FFC, 8).unwrap(), [0; 8]);
}

struct SharedTrace(Rc<RefCell<Vec<TraceEvent>>>);

impl TraceSink for SharedTrace {
    fn on_event(&mut self, event: TraceEvent) {
        self.0.borrow_mut().push(event);
    }
}

#[test]
fn trace_reports_fault_after_hook_declines() {
    let mut emu = Emulator::new(EmulatorConfig {
        tracing_enabled: true,
        ..EmulatorConfig::default()
    });
    emu.memory().map(0x1000, 0x1000, Permissions::READ).unwrap();
    // nop
    emu.memory().write(0x1000, &[0x90]).unwrap();
    let events = Rc::new(RefCell::new(Vec::new()));
    emu.set_trace_sink(Box::new(SharedTrace(Rc::clone(&events))));

    let err = emu.run(0x1000, RunLimits::new()).unwrap_err();

    assert_eq!(err.code(), FaultCode::ExecViolation);
    assert_eq!(
        *events.borrow(),
        [TraceEvent::FaultRaised {
            cause: FaultCode::ExecViolation,
            eip: 0x1000,
        }]
    );
}
