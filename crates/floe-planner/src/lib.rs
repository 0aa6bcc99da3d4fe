//! Autonomous planner: an LLM picks the next action, the planner validates
//! it against the tool catalog, runs it through floe nodes and records the
//! observation, until the run finishes, pauses for a human or exhausts its
//! budget.

pub mod action;
pub mod catalog;
pub mod pause;
pub mod planner;
pub mod prompts;
pub mod trajectory;

pub use action::{ActionKind, JoinSpec, JoinStrategy, PauseSpec, PlanStep, PlannerAction};
pub use catalog::{NodeSpec, ToolCatalog, ToolPolicy};
pub use pause::{PauseStore, PlannerPause, PlannerSnapshot};
pub use planner::{Planner, PlannerOutcome, RunRequest};
pub use trajectory::{Trajectory, TrajectoryStep};
