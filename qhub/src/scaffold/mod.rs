//! Project workspace scaffolding.

mod scaffolder;
mod templates;

pub use scaffolder::{ProjectScaffolder, LAYOUT_DIRS};
pub use templates::{find_template, template_ids, ProjectTemplate, TemplateFile, TEMPLATES};
