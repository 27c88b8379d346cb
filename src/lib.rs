//! voice-coach - Realtime voice coaching for flashcard study sessions
//!
//! This crate provides the relay that bridges browser or desktop clients to
//! the upstream realtime speech service, plus the client-side pipeline that
//! captures microphone audio, schedules the coach's spoken replies, and keeps
//! the session grounded in the active flashcard.

pub mod audio;
pub mod coach;
pub mod config;
pub mod error;
pub mod events;
pub mod protocol;
pub mod relay;
pub mod state;
pub mod web;

pub use error::{AppError, Result};
