//! Real-time voice bridge between a telephony media-stream WebSocket and a
//! conversational-AI agent WebSocket. The binary entry point is thin; the
//! pieces live here so integration tests can drive a whole call in-process.

pub mod buffer;
pub mod call;
pub mod config;
pub mod connector;
pub mod listener;
pub mod pacer;
pub mod turn;
