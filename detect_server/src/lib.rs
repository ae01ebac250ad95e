pub mod config;
pub mod controller;
pub mod detect_loop;
pub mod detector;
pub mod endpoints;
pub mod labels;
pub mod meter;
pub mod nn;
pub mod overlay;
pub mod state;
pub mod utils;
