//! Voice session pipeline: capture, chunked playback, and the coordinator
//! that serializes them.

pub mod capture;
pub mod coordinator;
pub mod messages;
pub mod playback;
