//! Drives a browser through a job application: snapshot the page, classify
//! where in the flow it is, plan candidate actions, execute them, detect
//! success or blockage, repeat.

pub mod artifacts;
pub mod brain;
pub mod classify;
pub mod config;
pub mod detect;
pub mod dom;
pub mod error;
pub mod executor;
pub mod hands;
pub mod page;
pub mod planner;
pub mod profile;
pub mod purpose;
pub mod resolve;
pub mod run;
pub mod types;

pub use config::Config;
pub use error::{AgentError, PageError};
pub use page::{NetworkBuffer, PageHandle};
pub use run::{RunControl, RunLoop, RunRequest};
pub use types::{Action, FlowState, ProgressEvent, RunResult, RunStatus, Snapshot};
