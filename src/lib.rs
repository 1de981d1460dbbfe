//! Spot Overlay
//!
//! Overlays per-spot measurements on images, surface meshes and voxel
//! volumes. Heavy work (parsing, mapping) runs in keyed background tasks;
//! the workspace keeps the overlay consistent as inputs change.

pub mod colormap;
pub mod config;
pub mod events;
pub mod geometry;
pub mod loaders;
pub mod logging;
pub mod mapper;
pub mod normalize;
pub mod recolor;
pub mod scene;
pub mod scheduler;
pub mod spots;
pub mod workspace;
