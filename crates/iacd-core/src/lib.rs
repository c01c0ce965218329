pub mod config;
pub mod dispatcher;
pub mod event_bus;
pub mod log_storage;
pub mod notifier;
pub mod status_poller;
pub mod storage;

pub use config::*;
pub use dispatcher::*;
pub use event_bus::*;
pub use log_storage::*;
pub use notifier::*;
pub use status_poller::*;
pub use storage::*;
