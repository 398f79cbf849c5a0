//! Guest CPU state primitives.

/// Register file types and storage model.
pub mod registers;
/// Host-observable run state.
pub mod run_state;

pub use registers::{
    Register, RegisterFile, EFLAGS_CF, EFLAGS_OF, EFLAGS_SF, EFLAGS_ZF, GENERAL_REGISTER_COUNT,
};
pub use run_state::RunState;
