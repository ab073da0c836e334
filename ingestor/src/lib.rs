pub mod auth;
pub mod config;
pub mod errors;
pub mod gateway;
pub mod metrics;
pub mod model;
pub mod mqtt;
pub mod pipeline;
pub mod query;
pub mod rest;
pub mod store;
pub mod sync;
pub mod timestamp;
pub mod validate;
pub mod writer;
