// Execution engines
//
// DockerEngine is the only concrete engine this daemon provides; workflows
// select it with `engine: nixery`. The WorkflowEngine trait seam lives in
// spindle-core.

mod docker;
pub mod steps;

pub use docker::{DockerEngine, DockerEngineConfig};
