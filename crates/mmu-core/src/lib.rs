//! Guest memory virtualization core: permissioned regions, access checks,
//! synchronous fault hooks, and a small x86-32 execution loop that drives them.

/// Guest memory model: regions, permission checks, fault dispatch and access gateway.
pub mod memory;
pub use memory::{
    check, page_align_down, page_align_up, AccessKind, AddressSpace, DispatchOutcome,
    FaultContext, FaultDecision, FaultHandler, FaultRecord, GuestAddr, HookId, HookTable,
    Permissions, Region, RegionInfo, RegionMutator, RegionTable, Segment, Violation,
    ADDRESS_SPACE_END, PAGE_SIZE,
};

/// Public host-facing API and integration types.
pub mod api;
pub use api::{
    EmulationError, Emulator, EmulatorConfig, RunLimits, RunSummary, StopReason, TraceEvent,
    TraceSink, DEFAULT_FAULT_RETRY_BUDGET,
};

/// Guest CPU state primitives.
pub mod state;
pub use state::{Register, RegisterFile, RunState, GENERAL_REGISTER_COUNT};

/// Opcode classification table for the supported x86 subset.
pub mod encoding;
pub use encoding::{classify_opcode, ImmWidth, OpcodeEncoding, OpcodeEntry, OPCODE_TABLE};

/// Instruction decoder.
pub mod decoder;
pub use decoder::{
    AluOp, Condition, DecodeError, DecodedInstruction, Decoder, MemOperand, Operand, Operation,
    MAX_INSTRUCTION_LENGTH,
};

/// Fault taxonomy and error types.
pub mod fault;
pub use fault::{
    AccessError, AccessFault, FaultClass, FaultCode, FaultKind, FaultKinds, MapError,
};

/// Instruction execution pipeline.
pub mod execute;
pub use execute::{
    commit_execution, execute_instruction, fetch_instruction, step_one, ExecContext,
    ExecuteState, FlagsUpdate, StepOutcome,
};

#[cfg(test)]
use proptest as _;
