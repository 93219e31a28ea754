//! Device agent: distributes remote jobs across a fixed pool of device
//! slots and runs each one through a staged execution session.

pub mod agent;
pub mod config;
pub mod device;
pub mod dispatch;
pub mod error;
pub mod jobs;
pub mod playbook;
pub mod session;
pub mod source;
pub mod status;
pub mod verification;
