pub use app_error::{AppError, AppResult, FailureClass};
pub use config::{
    DialerConfig, GeneralConfig, KeepaliveConfig, NetworkConfig, NodeConfig, WorkerPoolConfig,
};
pub use node::{LoggingHandler, Node};
pub use tracing_config::{setup_local_tracing, setup_tracing};

mod app_error;
mod config;
mod node;
mod tracing_config;
