#![forbid(unsafe_code)]

// OpenMic library - group chat server with a moderated speaking queue

pub mod error;
pub mod metrics;
pub mod persistence;
pub mod registry;
pub mod room;
pub mod signaling;
pub mod upload;
