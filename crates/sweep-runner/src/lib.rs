//! Parameter sweeps to batch-job scripts: sweep sequences, templated
//! scheduler namespaces, job-step expansion, pluggable backends and a
//! persisted project lifecycle.

pub mod archive;
pub mod condition;
pub mod config;
pub mod error;
pub mod jobstep;
pub mod lifecycle;
pub mod namespace;
pub mod project;
pub mod prompts;
pub mod scheduler;
pub mod sequence;
pub mod store;
pub mod template;
pub mod util;

pub use config::{load_sweep_file, SweepConfig, DEFAULT_SWEEP_FILE};
pub use error::{SweepError, SweepResult};
pub use lifecycle::{allowed_actions, Lifecycle, Outcome, State, UserCommand};
pub use project::{Listing, Project, ProjectOptions};
pub use scheduler::{BatchScript, Scheduler, SchedulerRegistry};
pub use sequence::{generator_from_config, scale_up_generator, Scalar, SweepSpec};
pub use store::{ProjectStore, DEFAULT_STORE_FILE};
