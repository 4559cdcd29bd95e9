pub mod analysis;
pub mod fanout;
pub mod notifier;
pub mod persistence;
