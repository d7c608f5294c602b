mod registry;
mod selectors;

pub use registry::{ModelRegistry, ModelSpec, VISION};
pub use selectors::{FallbackReason, ModelSelection, ModelSelector};
