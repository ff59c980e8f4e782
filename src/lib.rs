pub mod manager;
pub mod network;
pub mod reactor;
mod service;

pub use manager::{
    Channel, ChannelHandler, ConnectionManager, DialStatus, Dialer, DialerState, Direction,
};
pub use network::{ChannelPurpose, Message, NetAddress, PeerId, Preamble};
pub use service::{
    setup_local_tracing, setup_tracing, AppError, AppResult, DialerConfig, FailureClass,
    GeneralConfig, KeepaliveConfig, LoggingHandler, NetworkConfig, Node, NodeConfig,
    WorkerPoolConfig,
};
