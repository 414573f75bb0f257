pub mod executor;
pub mod installer;
pub mod manifest;
pub mod registry;
pub mod validate;

pub use installer::{install_from_github, uninstall};
pub use manifest::{Entrypoint, SkillManifest};
pub use registry::{SkillDescriptor, SkillHandler, SkillRegistry, SkillSource, ToolOutcome};
