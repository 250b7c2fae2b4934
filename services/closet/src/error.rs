//! Error types for the closet item lifecycle.
//!
//! Each collaborator boundary has its own closed error enum, produced once
//! by its adapter. [`ClosetError`] is what callers of the item service see.

use crate::keys::ObjectKey;
use crate::model::ItemId;
use std::fmt;
use std::future::Future;
use std::time::Duration;
use thiserror::Error;

/// Identity provider failures
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AuthError {
    #[error("Invalid credentials")]
    InvalidCredentials,

    #[error("User not found")]
    UserNotFound,

    #[error("Account has not been verified")]
    NotVerified,

    #[error("No active session")]
    NoSession,

    #[error("Identity provider error: {0}")]
    Unknown(String),
}

/// Object store failures
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("Object {0} not found")]
    NotFound(String),

    #[error("Object store call timed out after {0:?}")]
    Timeout(Duration),

    #[error("Object store error: {0}")]
    Backend(String),
}

impl StoreError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound(_))
    }
}

/// Data API failures
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DataError {
    #[error("Record {0} not found")]
    NotFound(String),

    #[error("Record rejected: {}", .0.join("; "))]
    Validation(Vec<String>),

    #[error("Data API call timed out after {0:?}")]
    Timeout(Duration),

    #[error("Data API error: {0}")]
    Backend(String),
}

/// One invalid form field
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldError {
    pub field: &'static str,
    pub message: String,
}

impl FieldError {
    pub fn new(field: &'static str, message: impl Into<String>) -> Self {
        Self {
            field,
            message: message.into(),
        }
    }
}

impl fmt::Display for FieldError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

/// Every problem found in a submitted form
#[derive(Error, Debug, Clone, Default, PartialEq, Eq)]
pub struct ValidationErrors {
    pub fields: Vec<FieldError>,
}

impl ValidationErrors {
    pub fn new(fields: Vec<FieldError>) -> Self {
        Self { fields }
    }

    pub fn has_field(&self, field: &str) -> bool {
        self.fields.iter().any(|e| e.field == field)
    }
}

impl fmt::Display for ValidationErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let messages: Vec<String> = self.fields.iter().map(ToString::to_string).collect();
        f.write_str(&messages.join(", "))
    }
}

/// Errors surfaced by the item service
#[derive(Error, Debug)]
pub enum ClosetError {
    #[error("Invalid item: {0}")]
    Validation(#[from] ValidationErrors),

    #[error("Not signed in: {0}")]
    Auth(#[from] AuthError),

    #[error("Photo {} could not be uploaded, nothing was saved: {source}", .index + 1)]
    Upload {
        index: usize,
        #[source]
        source: StoreError,
        /// Photos written before the failure that could not be removed again
        orphaned: Vec<ObjectKey>,
    },

    #[error("Photos uploaded but the item could not be saved: {source}")]
    Persist {
        #[source]
        source: DataError,
        orphaned: Vec<ObjectKey>,
    },

    #[error("Item {0} not found")]
    NotFound(ItemId),

    #[error("Photo {key} could not be removed, the item was kept: {source}")]
    PhotoRemoval {
        key: ObjectKey,
        #[source]
        source: StoreError,
    },

    #[error(transparent)]
    Data(#[from] DataError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("Operation interrupted: {0}")]
    Interrupted(String),
}

impl ClosetError {
    /// Whether repeating the same call may succeed
    pub fn is_retryable(&self) -> bool {
        match self {
            ClosetError::Validation(_) | ClosetError::NotFound(_) => false,
            ClosetError::Auth(AuthError::Unknown(_)) => true,
            ClosetError::Auth(_) => false,
            ClosetError::Upload { .. }
            | ClosetError::Persist { .. }
            | ClosetError::PhotoRemoval { .. }
            | ClosetError::Interrupted(_) => true,
            ClosetError::Data(DataError::Validation(_)) | ClosetError::Data(DataError::NotFound(_)) => {
                false
            }
            ClosetError::Data(_) => true,
            ClosetError::Store(e) => !e.is_not_found(),
        }
    }

    /// Stored photos this failure left without a record
    pub fn orphaned(&self) -> &[ObjectKey] {
        match self {
            ClosetError::Upload { orphaned, .. } | ClosetError::Persist { orphaned, .. } => orphaned,
            _ => &[],
        }
    }
}

/// Bound a collaborator call, mapping expiry to the boundary's timeout error
pub(crate) async fn within<T, E, F>(limit: Duration, fut: F, on_timeout: fn(Duration) -> E) -> Result<T, E>
where
    F: Future<Output = Result<T, E>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => Err(on_timeout(limit)),
    }
}
