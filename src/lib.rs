pub mod card;
pub mod case;
pub mod config;
pub mod dedup;
pub mod dispatch;
pub mod error;
pub mod events;
pub mod gateway;
pub mod handlers;
pub mod lifecycle;
pub mod listen_api;
pub mod processors;
pub mod queue;
pub mod store;
pub mod types;
