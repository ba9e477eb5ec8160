pub mod bbox;
pub mod camera;
#[cfg(feature = "opencv")]
pub mod capture;
pub mod config;
pub mod dataset;
pub mod detector;
pub mod fill;
pub mod frame;
pub mod frame_buffer;
pub mod image;
pub mod lifecycle;
pub mod my_types;
pub mod pipeline;
pub mod state;
pub mod tracker;
pub mod visualization;
