pub mod chat;
pub mod message;
pub mod snapshot;
pub mod user;
pub mod websocket;
