//! Talkline - peer-to-peer video calls between a talker and a listener
//!
//! This crate provides call negotiation over a best-effort signal relay,
//! the relay itself, and the media plumbing around a WebRTC peer connection.

pub mod config;
pub mod error;
pub mod events;
pub mod media;
pub mod relay;
pub mod webrtc;

pub use error::{AppError, Result};
