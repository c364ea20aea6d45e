//! 工具层：Tool trait、注册表、参数 schema、执行器与金融用语工具

pub mod executor;
pub mod glossary;
pub mod registry;
pub mod schema;

use std::sync::Arc;

pub use executor::ToolExecutor;
pub use glossary::{GetGlossaryTool, GlossarySource, GlossaryTerm, InMemoryGlossary, LookupTermTool};
pub use registry::{Tool, ToolError, ToolRegistry};
pub use schema::{args_schema, tool_call_schema_json, validate_args};

/// 默认工具集：lookup_term + get_glossary
pub fn create_default_registry(glossary: Arc<dyn GlossarySource>) -> ToolRegistry {
    let mut registry = ToolRegistry::new();
    registry.register(LookupTermTool::new(Arc::clone(&glossary)));
    registry.register(GetGlossaryTool::new(glossary));
    registry
}
