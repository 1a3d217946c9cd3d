use thiserror::Error;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Invalid duration '{input}': {reason}")]
    InvalidDurationFormat { input: String, reason: String },

    #[error("Unparseable timestamp '{0}'")]
    UnparseableTimestamp(String),

    #[error("Failed to resolve kube contexts: {0}")]
    ContextResolution(String),

    #[error("Failed to query images in context {context}: {message}")]
    ClusterQuery { context: String, message: String },

    #[error("Failed to switch to subscription {subscription}: {message}")]
    AccountSwitch {
        subscription: String,
        message: String,
    },

    #[error("Failed to fetch manifest metadata for {repository}: {message}")]
    MetadataFetch { repository: String, message: String },

    #[error("Failed to parse manifest metadata: {0}")]
    MetadataParse(#[from] serde_json::Error),

    #[error("Image with tag {tag} is running in the k8s context {context}")]
    ImageInUse { tag: String, context: String },

    #[error("Deletion of {target} failed: {message}")]
    DeletionExecution { target: String, message: String },

    #[error("Invalid tag pattern: {0}")]
    InvalidPattern(#[from] regex::Error),
}

impl AppError {
    /// Short taxonomy name, used as the prefix of log lines
    pub fn kind(&self) -> &'static str {
        match self {
            AppError::Config(_) => "ConfigError",
            AppError::InvalidDurationFormat { .. } => "InvalidDurationFormat",
            AppError::UnparseableTimestamp(_) => "UnparseableTimestamp",
            AppError::ContextResolution(_) => "ContextResolutionError",
            AppError::ClusterQuery { .. } => "ClusterQueryError",
            AppError::AccountSwitch { .. } => "AccountSwitchError",
            AppError::MetadataFetch { .. } => "MetadataFetchError",
            AppError::MetadataParse(_) => "MetadataParseError",
            AppError::ImageInUse { .. } => "ImageInUseError",
            AppError::DeletionExecution { .. } => "DeletionExecutionError",
            AppError::InvalidPattern(_) => "ConfigError",
        }
    }

    /// Whether the error belongs to the parse family (duration, timestamp, JSON)
    pub fn is_parse_error(&self) -> bool {
        matches!(
            self,
            AppError::InvalidDurationFormat { .. }
                | AppError::UnparseableTimestamp(_)
                | AppError::MetadataParse(_)
        )
    }
}
