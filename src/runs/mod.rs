//! Run tracking.
//!
//! A [`Run`] is one invocation of the pipeline; each configured unit gets a
//! [`UnitRun`] beneath it. Both move through their status vocabularies only
//! via [`transition`], which refuses to leave a terminal status.
//!
//! ```rust,ignore
//! use forecast_forge::runs::{Run, RunStatus, RunStore};
//!
//! let store = RunStore::new(database);
//! let mut run = Run::new(&run_config);
//! store.insert_run(&mut run).await?;
//! store.update_run_status(&mut run, RunStatus::Preprocess).await?;
//! ```

pub mod model;
pub mod status;
pub mod store;

pub use model::{transition, Run, Tracked, UnitRun};
pub use status::{RunStatus, StatusValue, UnitRunStatus, UnknownStatus};
pub use store::RunStore;
