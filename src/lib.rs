pub mod app;
pub mod auth;
pub mod cache;
pub mod catalog;
pub mod credentials;
pub mod dispatch;
pub mod error;
pub mod handlers;
pub mod ledger;
pub mod providers;
pub mod request_log;
pub mod upstream;
pub mod wire;
