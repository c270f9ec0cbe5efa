#![forbid(unsafe_code)]

pub mod auth;
pub mod client;
pub mod codec;
pub mod config;
pub mod dcerpc;
pub mod dispatch;
pub mod error;
pub mod ntlm;
pub mod resource;
pub mod server;
pub mod smb2;
pub mod spnego;
pub mod transport;
pub mod vfs;
