//! `meshkv` node runner and interactive client.
//!
//! ## Getting started
//!
//! ```doc
//! ❯ ./meshkv --config node1.toml
//!
//! ██  ██  █        █
//! ██ ██   ██      ██
//! ███      ██    ██
//! ██ ██     ██  ██
//! ██  ██     ████  meshkv CLI
//!
//! Welcome to meshkv.
//! Binding node 1 on 127.0.0.1:7070.
//!
//! meshkv > PUT order_key xxx
//! OK ~
//!
//! meshkv > GET order_key
//! xxx
//!
//! meshkv > DEL order_key
//! OK ~
//!
//! meshkv > GET order_key
//! N/A ~
//! ```

pub mod config;
pub mod progress;
pub mod rusty;
pub mod session;
pub mod show;
pub mod trace;
