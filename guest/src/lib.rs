//! Guest side of the skiff shim: the agent that runs container processes
//! behind the `GuestService` RPC, and a local hypervisor that hosts it.

mod agent;
mod error;
mod local;
pub mod process;
mod server;

pub use agent::GuestAgent;
pub use error::AgentError;
pub use local::{AGENT_REEXEC_NAME, AgentMode, LocalHypervisor};
pub use server::{run_agent, serve_unix};
