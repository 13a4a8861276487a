//! Subcommand implementations.

pub mod add;
pub mod manage;
pub mod monitor;
pub mod read;

/// Top-level command error, tagging each failure as configuration or
/// runtime so `main` can pick the exit code.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid configuration: {message}")]
    Config { message: String },

    #[error("{source}")]
    Add {
        #[from]
        source: add::Error,
    },

    #[error("{source}")]
    Read {
        #[from]
        source: read::Error,
    },

    #[error("{source}")]
    Monitor {
        #[from]
        source: monitor::Error,
    },

    #[error("{source}")]
    Manage {
        #[from]
        source: manage::Error,
    },
}

impl Error {
    /// Whether this failure maps to exit code 2 (configuration) rather
    /// than 3 (runtime).
    pub fn is_config_error(&self) -> bool {
        match self {
            Self::Config { .. } => true,
            Self::Add { source } => source.is_config_error(),
            Self::Read { source } => source.is_config_error(),
            Self::Monitor { source } => source.is_config_error(),
            Self::Manage { source } => source.is_config_error(),
        }
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Read the statement from `--query` or `--query-file`.
pub(crate) fn load_query(
    query: Option<String>,
    query_file: Option<std::path::PathBuf>,
) -> Result<String> {
    match (query, query_file) {
        (Some(query), None) => Ok(query),
        (None, Some(path)) => std::fs::read_to_string(&path).map_err(|e| Error::Config {
            message: format!("cannot read {}: {e}", path.display()),
        }),
        _ => Err(Error::Config {
            message: "pass exactly one of --query or --query-file".to_string(),
        }),
    }
}
