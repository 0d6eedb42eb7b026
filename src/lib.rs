pub mod balancer;
pub mod config;
pub mod db;
pub mod gateway;
pub mod migration;
pub mod notifications;
pub mod provisioning;
pub mod sync;
