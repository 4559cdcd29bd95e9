pub mod gamma_client;

pub use gamma_client::GammaClient;
