//! Public host-facing API for embedding the emulator.

use std::ops::RangeInclusive;
use std::time::{Duration, Instant};

use log::debug;
use thiserror::Error;

use crate::decoder::DecodeError;
use crate::execute::{step_one, ExecContext, StepOutcome};
use crate::memory::{
    AccessKind, AddressSpace, FaultHandler, GuestAddr, HookId, RegionInfo, RegionMutator,
    RegionTable,
};
use crate::state::{RegisterFile, RunState};
use crate::{AccessError, FaultCode, FaultKinds};

/// Default number of retries a single access may request from fault hooks.
pub const DEFAULT_FAULT_RETRY_BUDGET: u32 = 8;

/// Top-level configuration for an emulator instance.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
pub struct EmulatorConfig {
    /// Retries allowed per access before it fails with
    /// [`AccessError::RetryBudgetExceeded`].
    pub fault_retry_budget: u32,
    /// Enables trace callback dispatch.
    pub tracing_enabled: bool,
}

impl Default for EmulatorConfig {
    fn default() -> Self {
        Self {
            fault_retry_budget: DEFAULT_FAULT_RETRY_BUDGET,
            tracing_enabled: false,
        }
    }
}

/// Stop conditions for [`Emulator::run`]. Unset limits never trigger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RunLimits {
    /// Stop before executing the instruction at this address.
    pub until: Option<GuestAddr>,
    /// Stop after this many instructions have retired.
    pub max_instructions: Option<u64>,
    /// Stop at the first instruction boundary after this much wall-clock time.
    pub timeout: Option<Duration>,
}

impl RunLimits {
    /// No limits; the run ends on `HLT` or a fault.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            until: None,
            max_instructions: None,
            timeout: None,
        }
    }

    /// Sets the stop address.
    #[must_use]
    pub const fn until(mut self, address: GuestAddr) -> Self {
        self.until = Some(address);
        self
    }

    /// Sets the instruction limit.
    #[must_use]
    pub const fn max_instructions(mut self, count: u64) -> Self {
        self.max_instructions = Some(count);
        self
    }

    /// Sets the wall-clock limit.
    #[must_use]
    pub const fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Why a run ended without error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
pub enum StopReason {
    /// `EIP` reached [`RunLimits::until`].
    ReachedUntil,
    /// [`RunLimits::max_instructions`] instructions retired.
    InstructionLimit,
    /// [`RunLimits::timeout`] elapsed.
    Timeout,
    /// The guest executed `HLT`.
    Halted,
}

/// Result of a run that ended without error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
pub struct RunSummary {
    /// Instructions retired during this run.
    pub instructions: u64,
    /// Why the run ended.
    pub stop: StopReason,
}

/// Failure that ends a run or step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Error)]
pub enum EmulationError {
    /// A fetch, load or store could not be completed.
    #[error(transparent)]
    Memory(#[from] AccessError),
    /// Fetched bytes are not a supported instruction.
    #[error("invalid instruction at {address:#010x}: {source}")]
    InvalidInstruction {
        /// Address of the first instruction byte.
        address: GuestAddr,
        /// Decoder failure.
        source: DecodeError,
    },
}

impl EmulationError {
    /// Returns the stable status code for this error.
    #[must_use]
    pub const fn code(&self) -> FaultCode {
        match self {
            Self::Memory(err) => err.code(),
            Self::InvalidInstruction { source, .. } => source.code(),
        }
    }
}

/// Trace events emitted in program order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
pub enum TraceEvent {
    /// Instruction fetched and decoded.
    InstructionStart {
        /// Address of the instruction.
        eip: GuestAddr,
        /// Encoded length in bytes.
        length: usize,
    },
    /// Instruction committed.
    InstructionRetired {
        /// Address of the retired instruction.
        eip: GuestAddr,
    },
    /// Completed data access.
    MemoryAccess {
        /// Access target address.
        address: GuestAddr,
        /// 32-bit value read or written.
        value: u32,
        /// Read or write.
        access: AccessKind,
    },
    /// Step ended with an error.
    FaultRaised {
        /// Stable status code.
        cause: FaultCode,
        /// Address of the faulting instruction.
        eip: GuestAddr,
    },
}

/// Sink trait for trace hooks.
pub trait TraceSink {
    /// Records an event in execution order.
    fn on_event(&mut self, event: TraceEvent);
}

/// One guest CPU with its own address space, fault hooks and registers.
///
/// Instances share nothing. Fault hooks are not required to be `Send`, so an
/// `Emulator` stays on the thread that created it.
pub struct Emulator {
    config: EmulatorConfig,
    regs: RegisterFile,
    mem: AddressSpace,
    run_state: RunState,
    trace: Option<Box<dyn TraceSink>>,
    instructions_retired: u64,
}

impl std::fmt::Debug for Emulator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Emulator")
            .field("config", &self.config)
            .field("regs", &self.regs)
            .field("mem", &self.mem)
            .field("run_state", &self.run_state)
            .field("instructions_retired", &self.instructions_retired)
            .finish_non_exhaustive()
    }
}

impl Default for Emulator {
    fn default() -> Self {
        Self::new(EmulatorConfig::default())
    }
}

impl Emulator {
    /// Creates an emulator with an empty address space and zeroed registers.
    #[must_use]
    pub fn new(config: EmulatorConfig) -> Self {
        let mem = AddressSpace::new(config.fault_retry_budget);
        Self {
            config,
            regs: RegisterFile::new(),
            mem,
            run_state: RunState::Ready,
            trace: None,
            instructions_retired: 0,
        }
    }

    /// Active configuration.
    #[must_use]
    pub const fn config(&self) -> &EmulatorConfig {
        &self.config
    }

    /// Register state.
    #[must_use]
    pub const fn registers(&self) -> &RegisterFile {
        &self.regs
    }

    /// Mutable register state.
    pub fn registers_mut(&mut self) -> &mut RegisterFile {
        &mut self.regs
    }

    /// Host handle for mapping, unmapping, protecting and copying guest memory.
    pub fn memory(&mut self) -> RegionMutator<'_> {
        self.mem.mutator()
    }

    /// Read-only view of the region table.
    #[must_use]
    pub const fn regions(&self) -> &RegionTable {
        self.mem.regions()
    }

    /// Mapped regions in ascending address order.
    #[must_use]
    pub fn mem_regions(&self) -> Vec<RegionInfo> {
        self.mem.regions().infos()
    }

    /// Registers a fault hook for `kinds`, optionally limited to faults whose
    /// first failing byte lies in `range`.
    pub fn add_fault_hook<H>(
        &mut self,
        kinds: FaultKinds,
        range: Option<RangeInclusive<GuestAddr>>,
        handler: H,
    ) -> HookId
    where
        H: FaultHandler + 'static,
    {
        self.mem.hooks_mut().add(kinds, range, Box::new(handler))
    }

    /// Removes a fault hook. Returns `false` when `id` is unknown.
    pub fn remove_fault_hook(&mut self, id: HookId) -> bool {
        self.mem.hooks_mut().remove(id)
    }

    /// Installs a trace sink; events flow only while tracing is enabled.
    pub fn set_trace_sink(&mut self, sink: Box<dyn TraceSink>) {
        self.trace = Some(sink);
    }

    /// Removes and returns the installed trace sink.
    pub fn take_trace_sink(&mut self) -> Option<Box<dyn TraceSink>> {
        self.trace.take()
    }

    /// Current run state.
    #[must_use]
    pub const fn run_state(&self) -> RunState {
        self.run_state
    }

    /// Instructions retired over the lifetime of this instance.
    #[must_use]
    pub const fn instructions_retired(&self) -> u64 {
        self.instructions_retired
    }

    fn step_inner(&mut self) -> Result<StepOutcome, EmulationError> {
        let trace = match self.trace.as_mut() {
            Some(sink) if self.config.tracing_enabled => {
                let sink: &mut dyn TraceSink = sink.as_mut();
                Some(sink)
            }
            _ => None,
        };
        let outcome = step_one(&mut ExecContext {
            regs: &mut self.regs,
            mem: &mut self.mem,
            trace,
        })?;
        self.instructions_retired += 1;
        Ok(outcome)
    }

    fn finish(
        &mut self,
        result: Result<StepOutcome, EmulationError>,
    ) -> Result<StepOutcome, EmulationError> {
        self.run_state = match &result {
            Ok(StepOutcome::Retired) => RunState::Ready,
            Ok(StepOutcome::Halted) => RunState::Halted,
            Err(err) => {
                debug!("run stopped at {:#010x}: {err}", self.regs.eip());
                RunState::FaultLatched(err.code())
            }
        };
        result
    }

    /// Executes one instruction at the current `EIP`.
    ///
    /// # Errors
    ///
    /// Returns [`EmulationError`] when the instruction faults; the instruction
    /// commits no register effects and the fault is latched in
    /// [`Self::run_state`]. Register edits made by fault hooks persist.
    pub fn step(&mut self) -> Result<StepOutcome, EmulationError> {
        self.run_state = RunState::Running;
        let result = self.step_inner();
        self.finish(result)
    }

    /// Runs from `begin` until a limit triggers, the guest halts or an access
    /// cannot be resolved.
    ///
    /// Limits are checked at instruction boundaries in the order `until`,
    /// `max_instructions`, `timeout`. Any previously latched fault is cleared.
    ///
    /// # Errors
    ///
    /// Returns [`EmulationError`] for the faulting instruction; it commits
    /// nothing, while earlier instructions and hook mutations stay in effect.
    pub fn run(
        &mut self,
        begin: GuestAddr,
        limits: RunLimits,
    ) -> Result<RunSummary, EmulationError> {
        self.regs.set_eip(begin);
        self.run_state = RunState::Running;
        debug!("run from {begin:#010x} with {limits:?}");

        let started = Instant::now();
        let mut instructions = 0_u64;
        let stop = loop {
            if limits.until == Some(self.regs.eip()) {
                break StopReason::ReachedUntil;
            }
            if limits.max_instructions.is_some_and(|max| instructions >= max) {
                break StopReason::InstructionLimit;
            }
            if limits
                .timeout
                .is_some_and(|timeout| started.elapsed() >= timeout)
            {
                break StopReason::Timeout;
            }

            let result = self.step_inner();
            match self.finish(result) {
                Ok(StepOutcome::Retired) => instructions += 1,
                Ok(StepOutcome::Halted) => {
                    instructions += 1;
                    break StopReason::Halted;
                }
                Err(err) => return Err(err),
            }
            self.run_state = RunState::Running;
        };

        if stop != StopReason::Halted {
            self.run_state = RunState::Ready;
        }
        debug!("run stopped after {instructions} instructions: {stop:?}");
        Ok(RunSummary { instructions, stop })
    }
}
