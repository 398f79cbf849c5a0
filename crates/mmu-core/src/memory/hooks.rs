//! Fault hook registrations and synchronous dispatch.
//!
//! Hooks run in registration order. The dispatcher hands each one a
//! [`FaultContext`] that borrows the region table and register file, so a
//! mapping made by a hook is visible to the re-check that follows it.

use std::ops::RangeInclusive;

use log::debug;

use super::{AccessKind, GuestAddr, RegionMutator, RegionTable};
use crate::state::RegisterFile;
use crate::{FaultKind, FaultKinds};

/// Read-only description of a violation handed to fault hooks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FaultRecord {
    /// Violation kind.
    pub kind: FaultKind,
    /// Kind of the guest access that faulted.
    pub access: AccessKind,
    /// First address of the access.
    pub address: GuestAddr,
    /// Length of the access in bytes.
    pub length: usize,
    /// First address at which the access failed.
    pub fault_address: GuestAddr,
    /// Little-endian value being stored, for writes up to eight bytes.
    pub value: Option<u64>,
    /// Retries already spent on this access.
    pub attempt: u32,
}

/// Verdict returned by a fault hook.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FaultDecision {
    /// The fault was handled; re-check and retry the access.
    Continue,
    /// Give up; the access fails and the run stops.
    Stop,
    /// Not handled here; offer the fault to the next matching hook.
    Pass,
}

/// Result of offering a fault to the registered hooks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DispatchOutcome {
    /// A hook asked for the access to be retried.
    Retry,
    /// A hook stopped the access, or none handled it.
    Abort,
}

/// Mutable view of emulator state available to a fault hook.
pub struct FaultContext<'a> {
    regions: &'a mut RegionTable,
    regs: &'a mut RegisterFile,
}

impl<'a> FaultContext<'a> {
    pub(crate) fn new(regions: &'a mut RegionTable, regs: &'a mut RegisterFile) -> Self {
        Self { regions, regs }
    }

    /// Region mutation handle; changes apply before the retry re-check.
    pub fn memory(&mut self) -> RegionMutator<'_> {
        RegionMutator::new(self.regions)
    }

    /// Register state as of the faulting access.
    #[must_use]
    pub fn registers(&self) -> &RegisterFile {
        self.regs
    }

    /// Mutable register state.
    pub fn registers_mut(&mut self) -> &mut RegisterFile {
        self.regs
    }
}

/// Host callback invoked on memory access violations.
pub trait FaultHandler {
    /// Handles one violation and decides how the access proceeds.
    fn on_fault(&mut self, ctx: &mut FaultContext<'_>, fault: &FaultRecord) -> FaultDecision;
}

impl<F> FaultHandler for F
where
    F: FnMut(&mut FaultContext<'_>, &FaultRecord) -> FaultDecision,
{
    fn on_fault(&mut self, ctx: &mut FaultContext<'_>, fault: &FaultRecord) -> FaultDecision {
        self(ctx, fault)
    }
}

/// Handle identifying one hook registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HookId(u32);

struct HookEntry {
    id: HookId,
    kinds: FaultKinds,
    range: Option<RangeInclusive<GuestAddr>>,
    handler: Box<dyn FaultHandler>,
}

impl HookEntry {
    fn matches(&self, record: &FaultRecord) -> bool {
        let in_range = match &self.range {
            Some(range) => range.contains(&record.fault_address),
            None => true,
        };
        in_range && self.kinds.matches(record.kind)
    }
}

/// Ordered list of fault hook registrations.
#[derive(Default)]
pub struct HookTable {
    next_id: u32,
    entries: Vec<HookEntry>,
}

impl std::fmt::Debug for HookTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list()
            .entries(
                self.entries
                    .iter()
                    .map(|entry| (entry.id, entry.kinds, entry.range.clone())),
            )
            .finish()
    }
}

impl HookTable {
    /// Creates an empty hook table.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            next_id: 0,
            entries: Vec::new(),
        }
    }

    /// Registers `handler` for faults of `kinds`, optionally limited to
    /// faults whose first failing byte lies in `range`.
    pub fn add(
        &mut self,
        kinds: FaultKinds,
        range: Option<RangeInclusive<GuestAddr>>,
        handler: Box<dyn FaultHandler>,
    ) -> HookId {
        let id = HookId(self.next_id);
        self.next_id = self.next_id.wrapping_add(1);
        self.entries.push(HookEntry {
            id,
            kinds,
            range,
            handler,
        });
        id
    }

    /// Removes a registration. Returns `false` when `id` is unknown.
    pub fn remove(&mut self, id: HookId) -> bool {
        let before = self.entries.len();
        self.entries.retain(|entry| entry.id != id);
        self.entries.len() != before
    }

    /// Number of registrations.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns `true` when no hook is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Offers `record` to matching hooks in registration order.
    ///
    /// The first [`FaultDecision::Continue`] or [`FaultDecision::Stop`] is
    /// final. If every matching hook passes, or none matches, the access is
    /// aborted.
    pub fn dispatch(
        &mut self,
        regions: &mut RegionTable,
        regs: &mut RegisterFile,
        record: &FaultRecord,
    ) -> DispatchOutcome {
        debug!(
            "dispatch {:?} {} {:#010x}+{:#x} at {:#010x} attempt {}",
            record.kind,
            record.access,
            record.address,
            record.length,
            record.fault_address,
            record.attempt
        );

        for entry in self.entries.iter_mut().filter(|entry| entry.matches(record)) {
            let mut ctx = FaultContext::new(regions, regs);
            match entry.handler.on_fault(&mut ctx, record) {
                FaultDecision::Continue => return DispatchOutcome::Retry,
                FaultDecision::Stop => return DispatchOutcome::Abort,
                FaultDecision::Pass => {}
            }
        }

        DispatchOutcome::Abort
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::rc::Rc;

    use super::{DispatchOutcome, FaultContext, FaultDecision, FaultRecord, HookTable};
    use crate::memory::{AccessKind, Permissions, RegionTable};
    use crate::state::RegisterFile;
    use crate::{FaultKind, FaultKinds};

    fn record(kind: FaultKind, fault_address: u32) -> FaultRecord {
        FaultRecord {
            kind,
            access: AccessKind::Write,
            address: fault_address,
            length: 4,
            fault_address,
            value: Some(0x1234_5678),
            attempt: 0,
        }
    }

    fn recorder(
        log: &Rc<RefCell<Vec<&'static str>>>,
        name: &'static str,
        decision: FaultDecision,
    ) -> Box<dyn super::FaultHandler> {
        let log = Rc::clone(log);
        Box::new(move |_: &mut FaultContext<'_>, _: &FaultRecord| {
            log.borrow_mut().push(name);
            decision
        })
    }

    #[test]
    fn no_hooks_means_abort() {
        let mut hooks = HookTable::new();
        let mut regions = RegionTable::new();
        let mut regs = RegisterFile::new();
        assert_eq!(
            hooks.dispatch(
                &mut regions,
                &mut regs,
                &record(FaultKind::Unmapped, 0x1000)
            ),
            DispatchOutcome::Abort
        );
    }

    #[test]
    fn hooks_run_in_registration_order_until_definitive() {
        let log = Rc::new(RefCell::new(Vec::new()));
        let mut hooks = HookTable::new();
        hooks.add(FaultKinds::ALL, None, recorder(&log, "a", FaultDecision::Pass));
        hooks.add(
            FaultKinds::ALL,
            None,
            recorder(&log, "b", FaultDecision::Continue),
        );
        hooks.add(FaultKinds::ALL, None, recorder(&log, "c", FaultDecision::Stop));

        let mut regions = RegionTable::new();
        let mut regs = RegisterFile::new();
        let outcome = hooks.dispatch(
            &mut regions,
            &mut regs,
            &record(FaultKind::Unmapped, 0x1000),
        );

        assert_eq!(outcome, DispatchOutcome::Retry);
        assert_eq!(*log.borrow(), vec!["a", "b"]);
    }

    #[test]
    fn kind_and_range_filters_skip_non_matching_hooks() {
        let log = Rc::new(RefCell::new(Vec::new()));
        let mut hooks = HookTable::new();
        hooks.add(
            FaultKinds::UNMAPPED,
            None,
            recorder(&log, "unmapped", FaultDecision::Continue),
        );
        hooks.add(
            FaultKinds::WRITE_PROTECTED,
            Some(0x2000..=0x2fff),
            recorder(&log, "ranged", FaultDecision::Stop),
        );

        let mut regions = RegionTable::new();
        let mut regs = RegisterFile::new();

        let outside = hooks.dispatch(
            &mut regions,
            &mut regs,
            &record(FaultKind::WriteProtected, 0x3000),
        );
        assert_eq!(outside, DispatchOutcome::Abort);
        assert!(log.borrow().is_empty());

        let inside = hooks.dispatch(
            &mut regions,
            &mut regs,
            &record(FaultKind::WriteProtected, 0x2ffc),
        );
        assert_eq!(inside, DispatchOutcome::Abort);
        assert_eq!(*log.borrow(), vec!["ranged"]);
    }

    #[test]
    fn removed_hook_is_not_called() {
        let log = Rc::new(RefCell::new(Vec::new()));
        let mut hooks = HookTable::new();
        let id = hooks.add(
            FaultKinds::ALL,
            None,
            recorder(&log, "gone", FaultDecision::Continue),
        );

        assert!(hooks.remove(id));
        assert!(!hooks.remove(id));
        assert!(hooks.is_empty());

        let mut regions = RegionTable::new();
        let mut regs = RegisterFile::new();
        hooks.dispatch(
            &mut regions,
            &mut regs,
            &record(FaultKind::Unmapped, 0x1000),
        );
        assert!(log.borrow().is_empty());
    }

    #[test]
    fn hook_mutations_are_visible_after_dispatch() {
        let mut hooks = HookTable::new();
        hooks.add(
            FaultKinds::UNMAPPED,
            None,
            Box::new(|ctx: &mut FaultContext<'_>, fault: &FaultRecord| {
                let base = fault.fault_address & !0xfff;
                match ctx.memory().map(base, 0x1000, Permissions::RW) {
                    Ok(()) => FaultDecision::Continue,
                    Err(_) => FaultDecision::Stop,
                }
            }),
        );

        let mut regions = RegionTable::new();
        let mut regs = RegisterFile::new();
        let outcome = hooks.dispatch(
            &mut regions,
            &mut regs,
            &record(FaultKind::Unmapped, 0x0050_4ffc),
        );

        assert_eq!(outcome, DispatchOutcome::Retry);
        assert!(regions.lookup(0x0050_4ffc).is_some());
    }
}
