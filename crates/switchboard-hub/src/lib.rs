pub mod activity;
pub mod blobs;
pub mod config;
pub mod connections;
pub mod dispatcher;
pub mod enrich;
pub mod http;
pub mod hub;
pub mod logging;
pub mod pending;
pub mod roster;
pub mod router;
pub mod ws;

pub use config::Config;
pub use http::serve;
pub use hub::Hub;
