pub mod config;
mod console;
mod container;
mod error;
pub mod events;
mod grpc;
pub mod harness;
mod pio;
mod process;
mod registry;
pub mod runtime;
pub mod service;
mod signal_runner;

pub use config::ShimConfig;
pub use error::ShimError;
pub use events::{Event, GrpcPublisher, LogPublisher, Publisher, forward_events};
pub use grpc::TaskServiceGrpc;
pub use harness::{LogProxy, Reexec, init_logging, install_panic_hook};
pub use pio::StdioPaths;
pub use process::PRIMARY_ID;
pub use runtime::Runtime;
pub use service::{CreateParams, ExecParams, TaskService, VmDefaults};
pub use signal_runner::{KILLED_EXIT, PANIC_EXIT, RunnerStatus, TRANSPORT_ERROR_EXIT};
