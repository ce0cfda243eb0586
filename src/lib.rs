pub mod api;
pub mod cli;
pub mod config;
pub mod error;
pub mod logging;
pub mod remote;
pub mod server;
pub mod supervisor;
pub mod worker;

pub use config::{AppConfig, CliOverrides};
pub use error::{HatcheryError, Result};
pub use remote::{RemoteCommand, RemoteStateClient, RemoteStore};
pub use supervisor::{Supervisor, WorkerState, WorkerSummary};
pub use worker::{WorkerEvent, WorkerLauncher, WorkerSpec};
