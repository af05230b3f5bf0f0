pub mod chat;
pub mod config;
pub mod db;
pub mod expansion;
pub mod models;
pub mod openrouter;
pub mod random;
pub mod rate_limit;
pub mod selector;
pub mod server;
pub mod store;

pub use config::AppConfig;
pub use selector::QuotationSelector;
pub use server::run_server;
