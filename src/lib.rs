pub mod api;
pub mod config;
pub mod indexer;
pub mod preview;
pub mod registry;
pub mod session;
pub mod shutdown;
pub mod tls;
