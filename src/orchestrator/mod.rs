pub mod context;
pub mod controller;
pub mod executor;
pub mod state;

pub use context::RunContext;
pub use controller::{PhasePlan, PipelineController, RunArtifacts};
pub use executor::{PhaseExecution, StepExecutor};
pub use state::{PhaseState, PipelineRun, RunOutcome};
