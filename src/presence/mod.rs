mod camera;
mod controller;
mod loop_worker;
mod socket;
mod tracker;

#[cfg(test)]
pub(crate) mod testing;

pub use camera::{encode_frame, FrameFeeder, FrameSource, LatestFrameSource};
pub use controller::PresenceController;
pub use socket::{FrameSink, PresenceChannel, PresenceConnector, WsPresenceConnector};
pub use tracker::{Classification, PresenceLinkState, PresenceSnapshot, PresenceTracker};
