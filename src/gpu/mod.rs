pub mod fiber;
pub mod instances;
pub mod mesh;
pub mod pass_plan;
pub mod picking;
pub mod pipeline;
pub mod renderer;
pub mod targets;
