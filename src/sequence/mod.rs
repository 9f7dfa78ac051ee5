//! Calibration sequencing: step definitions and the run state machine.

pub mod runner;
pub mod step;

pub use runner::{
    evaluate_channel, CalibrationRun, ChannelSummary, RunCommand, RunControl, RunEvent, RunMode,
    RunOutcome, SampleRecord, StepSummary, Verdict,
};
pub use step::{parse_soak, CalibrationStep, StepKind, Tolerance};
