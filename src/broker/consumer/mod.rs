pub mod assignor;
pub mod coordinator;
pub mod group;
pub mod heartbeat;
