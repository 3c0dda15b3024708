pub mod agent;
pub mod capture;
pub mod cli;
pub mod config;
pub mod error;
pub mod logging;
pub mod pretty;
pub mod queue;
pub mod scan;
pub mod scanner;
pub mod scope;
pub mod services;
pub mod state;
pub mod target;
pub mod types;

// Re-export key types and functions at the crate root
pub use agent::{Agent, AgentReport, TaskSource};
pub use capture::CaptureOrchestrator;
pub use config::Config;
pub use error::{CaptureError, QueueError, ScopeError};
pub use logging::{get_log_file_path, init_logging};
pub use queue::{RequeuePolicy, TaskQueue};
pub use scanner::Scanner;
pub use scope::ScopeStore;
pub use state::StateFile;
pub use target::Target;
pub use types::{RescanTask, ScopeEntry};
