//! Geometry utilities: SE3/Sim3 transforms, camera model.

pub mod camera;
pub mod se3;
pub mod sim3;
pub mod so3;

pub use camera::{CameraModel, ScalePyramid};
pub use se3::SE3;
pub use sim3::Sim3;
