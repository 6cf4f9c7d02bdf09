pub mod address;
pub mod auth;
pub mod connection;
pub mod protocol;
