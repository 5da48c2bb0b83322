pub mod config;
pub mod jobid;
pub mod publish;
pub mod server;
pub mod web;
