//! Nonlinear optimization for loop closing.
//!
//! - [`sim3_refine`] - Sim3 between two keyframes from two-way reprojection
//! - [`essential_graph`] - Sim3 pose graph over the Essential Graph
//! - [`global_ba`] - full bundle adjustment of poses and landmarks

pub mod essential_graph;
pub mod global_ba;
pub mod sim3_refine;

pub use essential_graph::{
    optimize_essential_graph, EssentialGraphConfig, EssentialGraphResult, KeyFrameAndPose,
    LoopCorrectionInput,
};
pub use global_ba::{
    apply_global_ba_results, collect_global_ba_data, solve_global_ba, GlobalBAConfig,
    GlobalBAProblem, GlobalBAResult,
};
pub use sim3_refine::{optimize_sim3, Sim3Correspondence, Sim3RefineConfig, Sim3RefineResult};
