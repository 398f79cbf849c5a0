use crate::FaultCode;

/// Host-observable execution state of an emulator instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
pub enum RunState {
    /// No run in progress; the next `run` or `step` may start.
    #[default]
    Ready,
    /// Inside `run` or `step`, including while fault hooks execute.
    Running,
    /// The guest executed `HLT`.
    Halted,
    /// The last run ended on a fault; cleared by the next `run`.
    FaultLatched(FaultCode),
}

impl RunState {
    /// Returns the currently latched fault, if this state is fault-latched.
    #[must_use]
    pub const fn latched_fault(self) -> Option<FaultCode> {
        match self {
            Self::FaultLatched(cause) => Some(cause),
            Self::Ready | Self::Running | Self::Halted => None,
        }
    }
}
