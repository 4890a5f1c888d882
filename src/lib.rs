pub mod broadcast;
pub mod config;
pub mod coordination;
pub mod error;
pub mod events;
pub mod execution;
pub mod http;
pub mod lock;
pub mod node;
pub mod shutdown;
pub mod transport;
