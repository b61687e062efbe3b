//! Application boundary
//!
//! Apps talk to their node over any byte stream using length-prefixed
//! protobuf frames (see [`frame`]). [`AppClient`] is the app-side handle.

mod client;
pub mod frame;

pub use client::{AppClient, AppEvent};
