pub mod ack;
pub mod record;
