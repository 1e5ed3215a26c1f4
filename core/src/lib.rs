// Mosaic Core Library
// Runtime composition core for micro-frontend sites

pub mod bus;
pub mod dom;
pub mod durable;
pub mod event_log;
pub mod host;
pub mod mount;
pub mod navigation;
pub mod remote;
pub mod routes;
pub mod shell;
pub mod styles;
pub mod telemetry;

// Export core types
pub use bus::{BusConfig, BusError, Callback, CallbackError, Message, MessageBus, PublishOptions, Subscription};
pub use durable::{
    ConnectionError, ConnectionState, DurableBus, DurableClient, DurableConfig, MemoryTransport,
    NavigationMessage, PubAck, PullSubscription, SubscriptionError,
};
pub use host::{HostContext, HostError};
pub use mount::{FrameworkAdapter, HeadlessAdapter, MountBridge, MountError, MountOutcome, MountRequest};
pub use remote::{Framework, HttpFetcher, ModuleFetcher, ModuleLoadError, RemoteResolver};
pub use routes::RouteTable;
pub use shell::{RemoteApp, Shell, ShellOptions};
pub use styles::{StyleConfig, StyleCoordinator};

// Error types
use thiserror::Error;

#[derive(Error, Debug)]
pub enum MosaicError {
    #[error("Bus error: {0}")]
    Bus(#[from] BusError),

    #[error("Durable connection error: {0}")]
    Connection(#[from] ConnectionError),

    #[error("Durable subscription error: {0}")]
    Subscription(#[from] SubscriptionError),

    #[error("Module load error: {0}")]
    ModuleLoad(#[from] ModuleLoadError),

    #[error("Mount error: {0}")]
    Mount(#[from] MountError),

    #[error("Host error: {0}")]
    Host(#[from] HostError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),
}
pub type Result<T> = std::result::Result<T, MosaicError>;
