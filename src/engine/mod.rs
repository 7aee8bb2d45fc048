pub use app_error::{EngineError, EngineResult};
pub use config::{EngineConfig, ExecutorConfig, MuxMode, SocketType};
pub use executor::{Executor, TaskHandler};
pub use shutdown::Shutdown;
pub use timer::{Timer, TimerQueue};
pub use tracing_config::{setup_file_tracing, setup_local_tracing, LogGuard};

mod app_error;
mod config;
mod executor;
mod shutdown;
mod timer;
mod tracing_config;
