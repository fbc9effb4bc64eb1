//! The state-synchronization engine: serialized pipeline work, the route
//! cache, spatial filtering, playback and live tracking, assembled by
//! [`controller::Engine`].

pub mod controller;
pub mod historical;
pub mod live;
pub mod notify;
pub mod playback;
pub mod serializer;
pub mod spatial;

pub use controller::{Engine, Intent};
