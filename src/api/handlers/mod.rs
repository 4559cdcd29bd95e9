pub mod alerts;
pub mod analysis;
pub mod health;
pub mod markets;
pub mod metrics;
pub mod stats;
pub mod trades;
pub mod ws;
