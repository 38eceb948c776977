//! HTTP request handlers.

pub mod admin;
pub mod artifacts;
pub mod channel;
pub mod common;
pub mod manifests;
pub mod updates;

pub use admin::*;
pub use artifacts::*;
pub use channel::*;
pub use common::*;
pub use manifests::*;
pub use updates::*;
