pub mod config;
pub mod coordinator;
pub mod error;
pub mod events;
pub mod health;
pub mod kernel;
pub mod link;
pub mod mqtt;
pub mod outbound;
pub mod pool;
pub mod protocol;
pub mod recorder;
pub mod round;
pub mod router;
pub mod state;
pub mod transport;
