use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InstallMethod {
    #[serde(rename = "script")]
    Script,
    #[serde(rename = "package-install")]
    Package,
    #[serde(rename = "interpreter-package")]
    InterpreterPackage,
    #[serde(rename = "built-in")]
    BuiltIn,
}

impl InstallMethod {
    pub const fn as_str(self) -> &'static str {
        match self {
            InstallMethod::Script => "script",
            InstallMethod::Package => "package-install",
            InstallMethod::InterpreterPackage => "interpreter-package",
            InstallMethod::BuiltIn => "built-in",
        }
    }
}

impl fmt::Display for InstallMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for InstallMethod {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('_', "-").as_str() {
            "script" => Ok(InstallMethod::Script),
            "package-install" | "go-install" => Ok(InstallMethod::Package),
            "interpreter-package" | "pip" => Ok(InstallMethod::InterpreterPackage),
            "built-in" | "builtin" => Ok(InstallMethod::BuiltIn),
            other => Err(format!("unknown install method: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ToolRole {
    Linter,
    SecurityScanner,
    VulnerabilityChecker,
    Sast,
    Sbom,
    TestRunner,
}

impl ToolRole {
    pub const fn as_str(self) -> &'static str {
        match self {
            ToolRole::Linter => "linter",
            ToolRole::SecurityScanner => "security-scanner",
            ToolRole::VulnerabilityChecker => "vulnerability-checker",
            ToolRole::Sast => "sast",
            ToolRole::Sbom => "sbom",
            ToolRole::TestRunner => "test-runner",
        }
    }
}

impl fmt::Display for ToolRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ToolRole {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('_', "-").as_str() {
            "linter" => Ok(ToolRole::Linter),
            "security-scanner" | "scanner" => Ok(ToolRole::SecurityScanner),
            "vulnerability-checker" | "vulncheck" => Ok(ToolRole::VulnerabilityChecker),
            "sast" => Ok(ToolRole::Sast),
            "sbom" => Ok(ToolRole::Sbom),
            "test-runner" | "tests" => Ok(ToolRole::TestRunner),
            other => Err(format!("unknown tool role: {other}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ToolSpec {
    pub name: String,
    /// `None` when the configured role is unknown; such tools are installed
    /// but have nothing to run.
    pub role: Option<ToolRole>,
    pub version: String,
    pub install_method: InstallMethod,
    pub install_source: String,
    pub check_command: Vec<String>,
    pub run_command: Vec<String>,
    pub output_file: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auth_env: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fallback: Option<String>,
}

impl ToolSpec {
    pub fn executable(&self) -> &str {
        let first = self
            .run_command
            .first()
            .or_else(|| self.check_command.first())
            .map(String::as_str)
            .unwrap_or(self.name.as_str());
        Path::new(first)
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or(first)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(name: &str, run: &[&str]) -> ToolSpec {
        ToolSpec {
            name: name.to_string(),
            role: Some(ToolRole::Linter),
            version: "1.0.0".to_string(),
            install_method: InstallMethod::BuiltIn,
            install_source: String::new(),
            check_command: vec![name.to_string(), "--version".to_string()],
            run_command: run.iter().map(|s| s.to_string()).collect(),
            output_file: format!("{name}.txt"),
            auth_env: None,
            fallback: None,
        }
    }

    #[test]
    fn executable_is_base_name_of_run_command() {
        let tool = spec("gosec", &["/usr/local/bin/gosec", "./..."]);
        assert_eq!(tool.executable(), "gosec");
    }

    #[test]
    fn executable_falls_back_to_name() {
        let mut tool = spec("syft", &[]);
        tool.check_command.clear();
        assert_eq!(tool.executable(), "syft");
    }

    #[test]
    fn role_parses_aliases() {
        assert_eq!("SBOM".parse::<ToolRole>(), Ok(ToolRole::Sbom));
        assert_eq!("test_runner".parse::<ToolRole>(), Ok(ToolRole::TestRunner));
        assert!("formatter".parse::<ToolRole>().is_err());
    }

    #[test]
    fn install_method_uses_kebab_names() {
        let v = serde_json::to_value(InstallMethod::InterpreterPackage).expect("serialize");
        assert_eq!(v, serde_json::json!("interpreter-package"));
        let m: InstallMethod = serde_json::from_str("\"built-in\"").expect("parse");
        assert_eq!(m, InstallMethod::BuiltIn);
    }
}
