mod report;
mod result;
mod tool;

pub use report::{AttestationReport, Platform, ProjectInfo, Summary};
pub use result::ExecutionResult;
pub use tool::{InstallMethod, ToolRole, ToolSpec};
