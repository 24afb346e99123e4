pub mod client;
pub mod connection;
pub mod device;
pub mod list;
pub mod poller;
pub mod protocol;
pub mod seat;
pub mod server;
pub mod terminal;
