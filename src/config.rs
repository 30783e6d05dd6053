//! Interpreter configuration file.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::{Result, ShellError};

/// Settings read from a TOML file.
///
/// ```toml
/// prompt = "mspsim> "
/// script_path = ["scripts", "/usr/share/emu/scripts"]
/// history_file = ".emu_history"
/// autoload_script = "boot.sc"
///
/// [symbols]
/// main = 0x4400
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ShellConfig {
    /// Prompt of the interactive loop.
    pub prompt: String,
    /// Directories searched for scripts invoked by name.
    pub script_path: Vec<PathBuf>,
    /// Persistent history of the interactive loop.
    pub history_file: Option<PathBuf>,
    /// Script sourced before the first prompt.
    pub autoload_script: Option<PathBuf>,
    /// Symbol table seed, name to address.
    pub symbols: BTreeMap<String, u32>,
}

impl Default for ShellConfig {
    fn default() -> Self {
        Self {
            prompt: default_prompt(),
            script_path: vec![PathBuf::from(".")],
            history_file: None,
            autoload_script: None,
            symbols: BTreeMap::new(),
        }
    }
}

fn default_prompt() -> String {
    "> ".to_string()
}

impl ShellConfig {
    pub fn from_toml_str(toml_str: &str) -> Result<Self> {
        toml::from_str(toml_str).map_err(|e| ShellError::Config(e.to_string()))
    }

    /// Read and parse a configuration file.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| ShellError::Config(format!("{}: {e}", path.display())))?;
        toml::from_str(&text).map_err(|e| ShellError::Config(format!("{}: {e}", path.display())))
    }
}
