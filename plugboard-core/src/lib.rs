pub mod config;
pub mod error;
pub mod routes;
pub mod settings;

pub use config::HookConfig;
pub use error::ProxyError;
pub use routes::{Adapter, RouteTable};
pub use settings::Settings;
