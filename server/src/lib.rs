pub mod config;
pub mod dispatch;
pub mod logging;
pub mod metrics;
pub mod session;
pub mod signal;
pub mod supervisor;
pub mod worker;

pub use config::Config;
pub use supervisor::Server;
