pub mod broker;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod notify;
pub mod relay;
pub mod store;
pub mod tunnel;

pub use config::AuthoriserConfig;
pub use coordinator::{shutdown_signal, Coordinator, Phase};
pub use error::{AuthoriserError, AuthoriserResult};
