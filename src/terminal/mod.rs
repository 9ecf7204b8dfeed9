pub mod bridge;
pub mod classifier;
pub mod executor;
pub mod pty_process;
pub mod registry;

pub use classifier::CompletionState;
pub use executor::{CommandExecutor, ExecuteParams, ExecuteResult};
pub use registry::{SessionInfo, SessionRegistry, TerminalSession};
