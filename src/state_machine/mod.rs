mod transition;
mod workload;

pub use transition::TransitionTable;
pub use workload::{
    HandlerResult, PhaseEnv, PhaseHook, SkipFn, StateEnv, StateHandler, WorkloadConfig,
    WorkloadOverrides, compose, expected_error_codes,
};
