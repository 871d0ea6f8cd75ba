pub mod api;
pub mod config;
pub mod humanize;
pub mod observability;
pub mod producer;
pub mod queue;
pub mod storage;
pub mod worker;
