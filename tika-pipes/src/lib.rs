pub mod alloc;
pub mod config;
pub mod dispatch;
pub mod domain;
pub mod health;
pub mod metrics_http;
pub mod plugins;
pub mod registry;
pub mod service;
pub mod stream;
pub mod worker;
