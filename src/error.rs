//! Error types with fix suggestions

use thiserror::Error;

/// Trait for errors that provide fix suggestions
pub trait FixSuggestion {
    fn fix_suggestion(&self) -> Option<&str>;
}

pub type Result<T> = std::result::Result<T, SuiteError>;

#[derive(Error, Debug)]
pub enum SuiteError {
    #[error("JSON parse error: {0}")]
    JsonParse(#[from] serde_json::Error),

    #[error("YAML parse error: {0}")]
    YamlParse(#[from] serde_yaml::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    // ─────────────────────────────────────────────────────────────
    // Setup errors (DFT-010 to DFT-013)
    // ─────────────────────────────────────────────────────────────

    #[error("DFT-010: Can not find the test setting file '{path}'")]
    ParamNotFound { path: String },

    #[error("DFT-011: Invalid configuration: {reason}")]
    Config { reason: String },

    #[error("DFT-012: Invalid example pattern '{pattern}': {details}")]
    Pattern { pattern: String, details: String },

    #[error("DFT-013: Failed to prepare examples: {details}")]
    Prepare { details: String },

    // ─────────────────────────────────────────────────────────────
    // Remote engine errors (DFT-020 to DFT-023)
    // ─────────────────────────────────────────────────────────────

    #[error("DFT-020: Workflow submission failed: {details}")]
    Submit { details: String },

    #[error("DFT-021: Workflow engine error: {details}")]
    Engine { details: String },

    #[error("DFT-022: Failed to download outputs of step '{step}': {details}")]
    Download { step: String, details: String },

    #[error("DFT-023: Step '{step}' has no output artifact")]
    MissingArtifact { step: String },

    #[error("DFT-024: Failed to prepare save folder '{path}' for step '{step}': {details}")]
    SaveFolder {
        step: String,
        path: String,
        details: String,
    },

    // ─────────────────────────────────────────────────────────────
    // Report errors (DFT-030 to DFT-031)
    // ─────────────────────────────────────────────────────────────

    #[error("DFT-030: Report error: {details}")]
    Report { details: String },

    #[error("DFT-031: Invalid criteria '{expr}': {details}")]
    Criteria { expr: String, details: String },
}

impl FixSuggestion for SuiteError {
    fn fix_suggestion(&self) -> Option<&str> {
        match self {
            SuiteError::JsonParse(_) => Some("Check JSON syntax of the job description"),
            SuiteError::YamlParse(_) => Some("Check YAML syntax: indentation and quoting"),
            SuiteError::Io(_) => Some("Check file path and permissions"),
            SuiteError::Http(_) => Some("Check dflow_host and network access to the engine"),
            SuiteError::Csv(_) => Some("Check the table file is valid CSV with a header row"),
            SuiteError::ParamNotFound { .. } => Some("Pass an existing job file with -p/--param"),
            SuiteError::Config { .. } => {
                Some("Check the \"config\" block of the job file or the matching env vars")
            }
            SuiteError::Pattern { .. } => Some("Use glob syntax such as examples/*/"),
            SuiteError::Prepare { .. } => {
                Some("Check example_template points at existing example folders")
            }
            SuiteError::Submit { .. } => Some("Check dflow_host, dflow_token and the namespace"),
            SuiteError::Engine { .. } => Some("Check the workflow on the engine dashboard"),
            SuiteError::Download { .. } => Some("Download the artifact manually from the dashboard"),
            SuiteError::MissingArtifact { .. } => {
                Some("Make sure the step writes its results into the outputs folder")
            }
            SuiteError::SaveFolder { .. } => {
                Some("Check save_path is a writable folder and not an existing file")
            }
            SuiteError::Report { .. } => Some("Check the \"report\" block of the job file"),
            SuiteError::Criteria { .. } => {
                Some("Use expressions over x such as \"x > 0\" or \"abs(x) < 1e-3 and x != 0\"")
            }
        }
    }
}
