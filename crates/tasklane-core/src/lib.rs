pub mod cache_store;
pub mod config;
pub mod draft;
pub mod error;
pub mod event_bus;
pub mod http_api;
pub mod merge;
pub mod mutation_client;
pub mod push_channel;
pub mod reconciler;
pub mod session;

pub const DEFAULT_SERVER_HOST: &str = "127.0.0.1";
pub const DEFAULT_SERVER_PORT: u16 = 3000;

pub use cache_store::*;
pub use config::*;
pub use draft::*;
pub use error::*;
pub use event_bus::*;
pub use http_api::*;
pub use mutation_client::*;
pub use push_channel::*;
pub use reconciler::*;
pub use session::*;
