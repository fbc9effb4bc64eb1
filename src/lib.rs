pub mod api;
pub mod config;
pub mod engine;
pub mod map_view;
pub mod model;

pub use engine::{Engine, Intent};
