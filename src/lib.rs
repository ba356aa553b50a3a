pub mod catalog;
pub mod comparator;
pub mod config;
pub mod database;
pub mod engine;
pub mod queue;
pub mod recorder;
pub mod routes;
pub mod sandbox;
pub mod service;
pub mod store;
pub mod validator;
pub mod verdict;
pub mod web_server;
pub mod worker;

pub fn create_timestamp() -> String {
    use chrono::{SecondsFormat, Utc};
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}
