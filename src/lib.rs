pub mod app;
pub mod catalog;
pub mod config;
pub mod domain;
pub mod error;
pub mod fs_util;
pub mod http;
pub mod openrosa;
pub mod output;
pub mod reconcile;
pub mod stage;
pub mod store;
pub mod task;
pub mod upload;
