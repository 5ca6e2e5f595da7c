pub mod controller;
pub mod error;
pub mod events;
pub mod runtime;
pub mod state;

pub use controller::{SessionController, END_EARLY_PROMPT};
pub use error::SessionError;
pub use events::{Notice, PenaltySource, PresenceSignal, SessionEffect, SessionEvent};
pub use runtime::{RuntimeDeps, SessionRuntime};
pub use state::{AppLifecycleState, RuntimeTimerState, SessionPhase, SessionSnapshot};
