#![forbid(unsafe_code)]

//! Library behind the `upload_video` binary.
//!
//! The pieces are split so each can be exercised on its own: metadata merge
//! and validation, credential handling, and the platform client. The binary
//! only wires them together.

pub mod config;
pub mod error;
pub mod metadata;
pub mod oauth;
pub mod token;
pub mod upload;
pub mod youtube;

#[cfg(test)]
mod mock_http;

pub use error::{ApiError, Error};
pub use metadata::{PartialMetadata, Privacy, VideoMetadata};
