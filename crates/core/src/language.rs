//! Execution languages understood by the loop and the kernel.

use serde::{Deserialize, Serialize};

/// A language a code directive can be written in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    #[default]
    Python,
    TypeScript,
    JavaScript,
}

impl Language {
    /// Canonical lowercase name (also the fenced-block info string).
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Python => "python",
            Self::TypeScript => "typescript",
            Self::JavaScript => "javascript",
        }
    }

    /// The native directive tag for this language.
    pub fn tag(&self) -> &'static str {
        match self {
            Self::Python => "py-script",
            Self::TypeScript => "ts-script",
            Self::JavaScript => "js-script",
        }
    }

    /// Parse a loose language name (`py`, `Python`, `ts`, ...).
    pub fn from_name(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "python" | "py" | "python3" => Some(Self::Python),
            "typescript" | "ts" => Some(Self::TypeScript),
            "javascript" | "js" => Some(Self::JavaScript),
            _ => None,
        }
    }
}

impl std::fmt::Display for Language {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
