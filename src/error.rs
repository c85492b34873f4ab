use thiserror::Error;

use crate::scripts::ScriptLanguage;

#[derive(Debug, Error)]
pub enum ScriptError {
    #[error("unknown script language in '{path}'")]
    UnknownLanguage { path: String },

    #[error("failed to compile '{name}': {message}")]
    Compile { name: String, message: String },

    #[error("{from:?} stages into {to:?}, which stages again; only one staging hop is allowed")]
    StagingCycle { from: ScriptLanguage, to: ScriptLanguage },

    #[error("no host registered for {0:?}")]
    MissingHost(ScriptLanguage),

    #[error("unsupported operation: {0}")]
    UnsupportedOperation(&'static str),

    #[error("resource '{path}' not found")]
    ResourceNotFound { path: String },

    #[error("invalid definition for '{name}': {message}")]
    InvalidDefinition { name: String, message: String },

    #[error("script '{name}' is not compiled")]
    NotCompiled { name: String },

    #[error("{0:?} scripts cannot be executed directly")]
    NotExecutable(ScriptLanguage),

    #[error("script '{name}' failed: {message}")]
    Runtime { name: String, message: String },
}

impl ScriptError {
    pub fn compile(name: impl Into<String>, message: impl ToString) -> Self {
        Self::Compile { name: name.into(), message: message.to_string() }
    }

    pub fn runtime(name: impl Into<String>, message: impl ToString) -> Self {
        Self::Runtime { name: name.into(), message: message.to_string() }
    }
}
