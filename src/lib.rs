pub mod logger;
pub mod settings;

pub mod domain;
pub mod infra;
pub mod infra_mysql;
pub mod infra_redis;
