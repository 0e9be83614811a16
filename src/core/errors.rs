use thiserror::Error;

#[derive(Error, Debug)]
pub enum DecksmithError {
    #[error("I/O error: {0}")]
    Io(Box<std::io::Error>),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Regex error: {0}")]
    Regex(#[from] regex::Error),

    #[error("Invalid glob pattern: {0}")]
    GlobPattern(#[from] glob::PatternError),

    #[error("Glob error: {0}")]
    Glob(#[from] glob::GlobError),

    #[error("Invalid uuid: {0}")]
    Uuid(#[from] uuid::Error),

    #[error("Cannot load '{path}': {reason}")]
    Document { path: String, reason: String },

    #[error("Duplicate note identity key '{key}' (notes '{first}' and '{second}').")]
    DuplicateIdentityKey { key: String, first: String, second: String },

    #[error("Duplicate guid generated for note '{0}'. Run 'index --full'.")]
    DuplicateGuid(String),

    #[error("Note '{note}' references unknown model '{model}'.")]
    UnknownModel { note: String, model: String },

    #[error("Note '{note}' uses model '{model}' not enabled for deck '{deck}'.")]
    ModelNotEnabled { note: String, model: String, deck: String },

    #[error("Missing field '{field}' in note '{note}' for model '{model}'.")]
    MissingField { note: String, field: String, model: String },

    #[error("Cannot render value_template for level '{level}' and path '{path}': no value for '{{{placeholder}}}'")]
    UnresolvedPlaceholder { level: String, path: String, placeholder: String },

    #[error("DecksmithError: {0}")]
    Custom(String),
}

impl From<std::io::Error> for DecksmithError {
    fn from(error: std::io::Error) -> Self {
        DecksmithError::Io(Box::new(error))
    }
}

impl DecksmithError {
    pub fn document(path: impl AsRef<std::path::Path>, reason: impl ToString) -> Self {
        DecksmithError::Document {
            path: path.as_ref().display().to_string(),
            reason: reason.to_string(),
        }
    }

    pub fn custom(message: impl ToString) -> Self {
        DecksmithError::Custom(message.to_string())
    }
}
