pub mod driver;
pub mod network;
pub mod node;
pub mod poller;
pub mod status;
