pub mod decoder;
pub mod pipeline;
pub mod poller;
