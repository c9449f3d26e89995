use std::path::PathBuf;

use crate::models::FieldKey;

#[derive(Debug, thiserror::Error)]
pub enum NotifyError {
    #[error("could not read {}: {reason}", path.display())]
    FileUnreadable { path: PathBuf, reason: String },

    #[error("no data found in {}", path.display())]
    EmptyDataset { path: PathBuf },

    #[error("mapping incomplete, unmapped fields: {}", join_fields(missing))]
    IncompleteMapping { missing: Vec<FieldKey> },

    #[error("the template name for {mode} is not configured in settings")]
    MissingTemplateConfiguration { mode: String },

    #[error("API settings not found in database")]
    SettingsUnavailable,

    #[error("incomplete API settings, missing: {}", missing.join(", "))]
    IncompleteSettings { missing: Vec<&'static str> },

    /// Carries the provider's own message, shown to the operator verbatim.
    #[error("{message}")]
    ProviderRequestFailed { status: u16, message: String },

    #[error("network failure: {0}")]
    NetworkFailure(#[from] reqwest::Error),

    #[error("settings store error: {0}")]
    Store(#[from] sqlx::Error),
}

fn join_fields(fields: &[FieldKey]) -> String {
    fields
        .iter()
        .map(|field| field.as_str())
        .collect::<Vec<_>>()
        .join(", ")
}
