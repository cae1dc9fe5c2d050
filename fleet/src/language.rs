use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{FleetError, FleetResult};

const FILE_PLACEHOLDER: &str = "{file}";
const SOURCE_STEM: &str = "task";

/// A language the sandbox image knows how to build and run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Language {
    pub name: String,
    /// File extension, without the leading dot.
    pub ending: String,
    /// Shell command run inside the container. `{file}` is replaced by the source
    /// path; without a placeholder the path is appended as the last argument.
    #[serde(rename = "compileCommand")]
    pub compile_command: String,
}

impl Language {
    pub fn new(
        name: impl Into<String>,
        ending: impl Into<String>,
        compile_command: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            ending: ending.into(),
            compile_command: compile_command.into(),
        }
    }

    /// Container path the source is written to before execution.
    pub fn source_path(&self, dir: &str) -> String {
        let dir = dir.trim_end_matches('/');
        let ending = self.ending.trim_start_matches('.');
        if ending.is_empty() {
            format!("{dir}/{SOURCE_STEM}")
        } else {
            format!("{dir}/{SOURCE_STEM}.{ending}")
        }
    }

    pub fn command_for(&self, source_path: &str) -> String {
        if self.compile_command.contains(FILE_PLACEHOLDER) {
            self.compile_command.replace(FILE_PLACEHOLDER, source_path)
        } else {
            format!("{} {source_path}", self.compile_command.trim_end())
        }
    }
}

/// The set of supported languages, as shipped in `languages.json`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LanguageCatalog {
    pub languages: Vec<Language>,
}

impl LanguageCatalog {
    pub fn from_json(json: &str) -> FleetResult<Self> {
        serde_json::from_str(json).map_err(|e| FleetError::Config(format!("parse languages: {e}")))
    }

    pub async fn load(path: &Path) -> FleetResult<Self> {
        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| FleetError::Config(format!("read {}: {e}", path.display())))?;
        Self::from_json(&content)
    }

    /// Case-insensitive lookup by name.
    pub fn find(&self, name: &str) -> Option<&Language> {
        self.languages
            .iter()
            .find(|lang| lang.name.eq_ignore_ascii_case(name))
    }
}
