pub mod breaker;
pub mod cache;
pub mod chunking;
pub mod config;
pub mod dispatch;
pub mod dispatcher;
pub mod error;
pub mod events;
pub mod queue;
pub mod response;
pub mod router;
pub mod server;
pub mod tools;
