//! Instruction execution pipeline.
//!
//! Each step runs in three phases:
//! 1. Fetch, decode, and perform memory reads through the access gateway
//! 2. Perform the single memory write, if any, through the gateway
//! 3. Commit register writes, EFLAGS and `EIP`
//!
//! Faults are precise: an instruction whose access is not resolved commits
//! nothing. The write happens before the register commit so fault hooks see
//! the pre-instruction `ESP`.

mod flags;
mod helpers;

pub use flags::FlagsUpdate;
pub use helpers::alu;

use helpers::length_offset;

use crate::decoder::{
    AluOp, Condition, DecodeError, DecodedInstruction, Decoder, Operand, Operation,
    MAX_INSTRUCTION_LENGTH,
};
use crate::memory::{AccessKind, AddressSpace, GuestAddr};
use crate::state::{Register, RegisterFile};
use crate::{AccessError, EmulationError, TraceEvent, TraceSink};

/// Outcome of a retired instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StepOutcome {
    /// Instruction retired; execution may continue.
    Retired,
    /// `HLT` retired; execution stops.
    Halted,
}

/// Side effects accumulated before commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ExecuteState {
    /// New `ESP`, applied before `dest`.
    pub esp: Option<u32>,
    /// Destination register write.
    pub dest: Option<(Register, u32)>,
    /// EFLAGS update to apply.
    pub flags: FlagsUpdate,
    /// `EIP` after commit.
    pub next_eip: u32,
    /// Whether the instruction was `HLT`.
    pub halt: bool,
}

impl ExecuteState {
    /// Creates an execute state that falls through to `next_eip`.
    #[must_use]
    pub fn new(next_eip: u32) -> Self {
        Self {
            next_eip,
            ..Self::default()
        }
    }
}

/// Borrowed emulator state one step operates on.
pub struct ExecContext<'a> {
    /// Register file.
    pub regs: &'a mut RegisterFile,
    /// Guest address space.
    pub mem: &'a mut AddressSpace,
    /// Trace sink, when tracing is enabled.
    pub trace: Option<&'a mut dyn TraceSink>,
}

impl ExecContext<'_> {
    fn emit(&mut self, event: TraceEvent) {
        if let Some(sink) = self.trace.as_deref_mut() {
            sink.on_event(event);
        }
    }

    fn load_u32(&mut self, address: GuestAddr) -> Result<u32, AccessError> {
        let mut buf = [0; 4];
        self.mem.read_into(self.regs, address, &mut buf)?;
        let value = u32::from_le_bytes(buf);
        self.emit(TraceEvent::MemoryAccess {
            address,
            value,
            access: AccessKind::Read,
        });
        Ok(value)
    }

    fn store_u32(&mut self, address: GuestAddr, value: u32) -> Result<(), AccessError> {
        self.mem.write(self.regs, address, &value.to_le_bytes())?;
        self.emit(TraceEvent::MemoryAccess {
            address,
            value,
            access: AccessKind::Write,
        });
        Ok(())
    }

    fn read_operand(&mut self, operand: Operand) -> Result<u32, AccessError> {
        match operand {
            Operand::Reg(reg) => Ok(self.regs.get(reg)),
            Operand::Imm(value) => Ok(value),
            Operand::Mem(mem) => {
                let address = mem.effective_address(self.regs);
                self.load_u32(address)
            }
        }
    }

    fn write_operand(
        &mut self,
        exec: &mut ExecuteState,
        operand: Operand,
        value: u32,
    ) -> Result<(), AccessError> {
        match operand {
            Operand::Reg(reg) => {
                exec.dest = Some((reg, value));
                Ok(())
            }
            Operand::Mem(mem) => {
                let address = mem.effective_address(self.regs);
                self.store_u32(address, value)
            }
            // The decoder never produces an immediate destination.
            Operand::Imm(_) => Ok(()),
        }
    }

    fn push(&mut self, exec: &mut ExecuteState, value: u32) -> Result<(), AccessError> {
        let esp = self.regs.esp().wrapping_sub(4);
        self.store_u32(esp, value)?;
        exec.esp = Some(esp);
        Ok(())
    }

    fn pop(&mut self, exec: &mut ExecuteState) -> Result<u32, AccessError> {
        let esp = self.regs.esp();
        let value = self.load_u32(esp)?;
        exec.esp = Some(esp.wrapping_add(4));
        Ok(value)
    }
}

/// Fetches and decodes the instruction at `eip`.
///
/// Fetching grows with what the decoder reports it needs, and every fetch
/// covers the instruction from its first byte, so an instruction that runs
/// into unmapped or non-executable memory faults as a whole.
///
/// # Errors
///
/// Returns [`EmulationError::Memory`] when the fetch cannot be completed and
/// [`EmulationError::InvalidInstruction`] for unsupported encodings.
pub fn fetch_instruction(
    ctx: &mut ExecContext<'_>,
    eip: GuestAddr,
) -> Result<DecodedInstruction, EmulationError> {
    let mut buf = [0_u8; MAX_INSTRUCTION_LENGTH];
    let mut want = 1;
    loop {
        ctx.mem.fetch_into(ctx.regs, eip, &mut buf[..want])?;
        match Decoder::decode(&buf[..want]) {
            Ok(instruction) => return Ok(instruction),
            Err(DecodeError::Truncated { needed })
                if needed > want && needed <= MAX_INSTRUCTION_LENGTH =>
            {
                want = needed;
            }
            Err(source) => {
                return Err(EmulationError::InvalidInstruction {
                    address: eip,
                    source,
                })
            }
        }
    }
}

/// Executes `instr` located at `eip`, performing its memory accesses.
///
/// Register effects are returned for [`commit_execution`]; on error nothing
/// has been written.
///
/// # Errors
///
/// Returns [`AccessError`] when a load or the store cannot be completed.
pub fn execute_instruction(
    ctx: &mut ExecContext<'_>,
    instr: &DecodedInstruction,
    eip: GuestAddr,
) -> Result<ExecuteState, AccessError> {
    let next_eip = eip.wrapping_add(length_offset(instr.length));
    let mut exec = ExecuteState::new(next_eip);

    match instr.operation {
        Operation::Nop => {}
        Operation::Halt => exec.halt = true,
        Operation::Push(src) => {
            let value = ctx.read_operand(src)?;
            ctx.push(&mut exec, value)?;
        }
        Operation::Pop(reg) => {
            let value = ctx.pop(&mut exec)?;
            exec.dest = Some((reg, value));
        }
        Operation::Mov { dst, src } => {
            let value = ctx.read_operand(src)?;
            ctx.write_operand(&mut exec, dst, value)?;
        }
        Operation::Alu { op, dst, src } => {
            let left = ctx.read_operand(dst)?;
            let right = ctx.read_operand(src)?;
            let (result, flags) = alu(op, left, right);
            exec.flags = flags;
            if op != AluOp::Cmp {
                ctx.write_operand(&mut exec, dst, result)?;
            }
        }
        Operation::Jump { cond, rel } => {
            let zero = ctx.regs.flag_is_set(crate::state::EFLAGS_ZF);
            let taken = match cond {
                Condition::Always => true,
                Condition::Zero => zero,
                Condition::NotZero => !zero,
            };
            if taken {
                exec.next_eip = next_eip.wrapping_add(rel);
            }
        }
        Operation::Call { rel } => {
            ctx.push(&mut exec, next_eip)?;
            exec.next_eip = next_eip.wrapping_add(rel);
        }
        Operation::Ret => {
            exec.next_eip = ctx.pop(&mut exec)?;
        }
    }

    Ok(exec)
}

/// Applies accumulated side effects to the register file.
pub fn commit_execution(regs: &mut RegisterFile, exec: &ExecuteState) {
    if let Some(esp) = exec.esp {
        regs.set_esp(esp);
    }
    if let Some((reg, value)) = exec.dest {
        regs.set(reg, value);
    }
    exec.flags.apply(regs);
    regs.set_eip(exec.next_eip);
}

/// Fetches, executes and commits one instruction at the current `EIP`.
///
/// # Errors
///
/// Returns [`EmulationError`] when fetch, decode or a data access fails; the
/// register file is left as it was before the step.
pub fn step_one(ctx: &mut ExecContext<'_>) -> Result<StepOutcome, EmulationError> {
    let eip = ctx.regs.eip();

    let result = fetch_instruction(ctx, eip).and_then(|instr| {
        ctx.emit(TraceEvent::InstructionStart {
            eip,
            length: instr.length,
        });
        execute_instruction(ctx, &instr, eip).map_err(EmulationError::from)
    });

    match result {
        Ok(exec) => {
            commit_execution(ctx.regs, &exec);
            ctx.emit(TraceEvent::InstructionRetired { eip });
            Ok(if exec.halt {
                StepOutcome::Halted
            } else {
                StepOutcome::Retired
            })
        }
        Err(err) => {
            ctx.emit(TraceEvent::FaultRaised {
                cause: err.code(),
                eip,
            });
            Err(err)
        }
    }
}
