//! Domain layer: remote models, settings, press disambiguation and routing.

pub mod error;
pub mod keymap;
pub mod models;
pub mod press;
pub mod registry;
pub mod router;
pub mod settings;
