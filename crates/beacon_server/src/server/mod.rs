#![forbid(unsafe_code)]

pub mod auth;
pub mod broadcast;
pub mod credentials;
pub mod health;
pub mod registry;
pub mod session;
pub mod store;
pub mod wire;



#[cfg(test)]
mod session_tests;
