use std::path::{Component, Path};

use crate::core::InstallMethod;
use crate::gate::{GateError, validate_arg};

const MAX_VERSION_LEN: usize = 64;

pub fn validate_version(version: &str) -> Result<(), GateError> {
    if version.is_empty() {
        return Err(GateError::InvalidParameter("version is empty".to_string()));
    }
    if version.len() > MAX_VERSION_LEN {
        return Err(GateError::InvalidParameter(format!(
            "version is longer than {MAX_VERSION_LEN} characters"
        )));
    }
    if version.contains("..") {
        return Err(GateError::InvalidParameter(format!(
            "version contains a traversal sequence: {version:?}"
        )));
    }
    if !version
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '+' | '-'))
    {
        return Err(GateError::InvalidParameter(format!(
            "version contains disallowed characters: {version:?}"
        )));
    }
    if version.starts_with('-') {
        return Err(GateError::InvalidParameter(format!(
            "version must not look like a flag: {version:?}"
        )));
    }
    Ok(())
}

pub fn validate_source(method: InstallMethod, source: &str) -> Result<(), GateError> {
    if method == InstallMethod::BuiltIn {
        return Ok(());
    }
    if source.trim().is_empty() {
        return Err(GateError::InvalidParameter(format!(
            "{method} install source is empty"
        )));
    }
    if source.contains("..") {
        return Err(GateError::InvalidParameter(format!(
            "install source contains a traversal sequence: {source:?}"
        )));
    }
    if source.starts_with('-') {
        return Err(GateError::InvalidParameter(format!(
            "install source must not look like a flag: {source:?}"
        )));
    }
    validate_arg(source).map_err(GateError::InvalidParameter)?;

    match method {
        InstallMethod::Script => {
            let Some(rest) = source.strip_prefix("https://") else {
                return Err(GateError::InvalidParameter(format!(
                    "install script must be fetched over https: {source:?}"
                )));
            };
            if rest.is_empty() || rest.starts_with('/') || rest.contains(char::is_whitespace) {
                return Err(GateError::InvalidParameter(format!(
                    "install script URL is malformed: {source:?}"
                )));
            }
        }
        InstallMethod::Package => {
            if source.contains("://") || source.starts_with('/') {
                return Err(GateError::InvalidParameter(format!(
                    "module path must not be a URL or absolute path: {source:?}"
                )));
            }
            if !source
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-' | '/' | '~'))
            {
                return Err(GateError::InvalidParameter(format!(
                    "module path contains disallowed characters: {source:?}"
                )));
            }
        }
        InstallMethod::InterpreterPackage => {
            if !source
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-' | '[' | ']'))
            {
                return Err(GateError::InvalidParameter(format!(
                    "package name contains disallowed characters: {source:?}"
                )));
            }
        }
        InstallMethod::BuiltIn => {}
    }
    Ok(())
}

pub fn validate_install_dir(dir: &Path) -> Result<(), GateError> {
    if dir.as_os_str().is_empty() {
        return Err(GateError::InvalidParameter(
            "install directory is empty".to_string(),
        ));
    }
    if !dir.is_absolute() {
        return Err(GateError::InvalidParameter(format!(
            "install directory must be absolute: {}",
            dir.display()
        )));
    }
    if dir.components().any(|c| matches!(c, Component::ParentDir)) {
        return Err(GateError::InvalidParameter(format!(
            "install directory contains '..': {}",
            dir.display()
        )));
    }
    let Some(s) = dir.to_str() else {
        return Err(GateError::InvalidParameter(
            "install directory is not valid UTF-8".to_string(),
        ));
    };
    validate_arg(s).map_err(GateError::InvalidParameter)
}
