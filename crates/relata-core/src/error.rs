//! Error types for Relata operations.

use std::fmt;

/// The primary error type for all Relata operations.
///
/// Errors are `Clone` so that a single backend failure can be handed to every
/// operation that shared the failing backend call.
#[derive(Debug, Clone)]
pub enum Error {
    /// A required lookup returned nothing
    NotFound(NotFoundError),
    /// Malformed input or an invalid query shape
    BadRequest(BadRequestError),
    /// A `restrict` delete policy was violated
    Restricted(RestrictedError),
    /// A unique index was violated by a backend
    Duplicate(DuplicateError),
    /// Transaction tree errors
    Transaction(TransactionError),
    /// Errors surfaced by a backend adapter
    Backend(BackendError),
    /// Schema construction / lookup errors
    Schema(SchemaError),
    /// Serialization/deserialization errors
    Serde(String),
    /// Operation was cancelled via asupersync
    Cancelled,
    /// Custom error with message
    Custom(String),
}

#[derive(Debug, Clone)]
pub struct NotFoundError {
    pub model: String,
    pub message: String,
}

#[derive(Debug, Clone)]
pub struct BadRequestError {
    pub model: Option<String>,
    pub field: Option<String>,
    pub message: String,
}

#[derive(Debug, Clone)]
pub struct RestrictedError {
    /// The model whose document was being deleted.
    pub model: String,
    /// The model holding the reference that blocks the delete.
    pub referenced_by: String,
    /// Storage path of the referencing field.
    pub field: String,
    /// Number of dependents found.
    pub count: u64,
}

#[derive(Debug, Clone)]
pub struct DuplicateError {
    pub model: String,
    pub field: String,
    pub value: String,
}

#[derive(Debug, Clone)]
pub struct TransactionError {
    pub kind: TransactionErrorKind,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionErrorKind {
    /// Already committed
    AlreadyCommitted,
    /// Already rolled back
    AlreadyRolledBack,
    /// A descendant scope was rolled back, so the ancestor cannot commit
    RolledBackDescendant,
    /// Commit was requested while recorded operations were never executed
    UnexecutedOperations,
}

#[derive(Debug, Clone)]
pub struct BackendError {
    pub backend: String,
    pub message: String,
}

#[derive(Debug, Clone)]
pub struct SchemaError {
    pub kind: SchemaErrorKind,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchemaErrorKind {
    /// Model not registered
    UnknownModel,
    /// Field not present on a model
    UnknownField,
    /// Backend not registered
    UnknownBackend,
    /// Two models registered under the same name
    DuplicateModel,
    /// Inconsistent relationship definition
    Invalid,
}

impl Error {
    pub fn not_found(model: impl Into<String>, message: impl Into<String>) -> Self {
        Error::NotFound(NotFoundError {
            model: model.into(),
            message: message.into(),
        })
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Error::BadRequest(BadRequestError {
            model: None,
            field: None,
            message: message.into(),
        })
    }

    pub fn bad_model_request(model: impl Into<String>, message: impl Into<String>) -> Self {
        Error::BadRequest(BadRequestError {
            model: Some(model.into()),
            field: None,
            message: message.into(),
        })
    }

    pub fn bad_field(
        model: impl Into<String>,
        field: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Error::BadRequest(BadRequestError {
            model: Some(model.into()),
            field: Some(field.into()),
            message: message.into(),
        })
    }

    pub fn backend(backend: impl Into<String>, message: impl Into<String>) -> Self {
        Error::Backend(BackendError {
            backend: backend.into(),
            message: message.into(),
        })
    }

    pub fn schema(kind: SchemaErrorKind, message: impl Into<String>) -> Self {
        Error::Schema(SchemaError {
            kind,
            message: message.into(),
        })
    }

    pub fn transaction(kind: TransactionErrorKind, message: impl Into<String>) -> Self {
        Error::Transaction(TransactionError {
            kind,
            message: message.into(),
        })
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound(_))
    }

    pub fn is_bad_request(&self) -> bool {
        matches!(self, Error::BadRequest(_))
    }

    pub fn is_restricted(&self) -> bool {
        matches!(self, Error::Restricted(_))
    }

    pub fn is_duplicate(&self) -> bool {
        matches!(self, Error::Duplicate(_))
    }

    /// The model named by this error, if it names one.
    pub fn model(&self) -> Option<&str> {
        match self {
            Error::NotFound(e) => Some(&e.model),
            Error::BadRequest(e) => e.model.as_deref(),
            Error::Restricted(e) => Some(&e.model),
            Error::Duplicate(e) => Some(&e.model),
            _ => None,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::NotFound(e) => write!(f, "Not found: {}", e),
            Error::BadRequest(e) => write!(f, "Bad request: {}", e),
            Error::Restricted(e) => write!(f, "Restricted: {}", e),
            Error::Duplicate(e) => write!(f, "Duplicate: {}", e),
            Error::Transaction(e) => write!(f, "Transaction error: {}", e.message),
            Error::Backend(e) => write!(f, "Backend error ({}): {}", e.backend, e.message),
            Error::Schema(e) => write!(f, "Schema error: {}", e.message),
            Error::Serde(msg) => write!(f, "Serialization error: {}", msg),
            Error::Cancelled => write!(f, "Operation cancelled"),
            Error::Custom(msg) => write!(f, "{}", msg),
        }
    }
}

impl std::error::Error for Error {}

impl fmt::Display for NotFoundError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.model, self.message)
    }
}

impl fmt::Display for BadRequestError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.model, &self.field) {
            (Some(model), Some(field)) => write!(f, "{}.{}: {}", model, field, self.message),
            (Some(model), None) => write!(f, "{}: {}", model, self.message),
            _ => write!(f, "{}", self.message),
        }
    }
}

impl fmt::Display for RestrictedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "cannot delete {}: referenced by {} {} document(s) through '{}'",
            self.model, self.count, self.referenced_by, self.field
        )
    }
}

impl fmt::Display for DuplicateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}.{} already has a document with value {}",
            self.model, self.field, self.value
        )
    }
}

impl fmt::Display for TransactionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl fmt::Display for BackendError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.backend, self.message)
    }
}

impl fmt::Display for SchemaError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl From<NotFoundError> for Error {
    fn from(err: NotFoundError) -> Self {
        Error::NotFound(err)
    }
}

impl From<BadRequestError> for Error {
    fn from(err: BadRequestError) -> Self {
        Error::BadRequest(err)
    }
}

impl From<RestrictedError> for Error {
    fn from(err: RestrictedError) -> Self {
        Error::Restricted(err)
    }
}

impl From<DuplicateError> for Error {
    fn from(err: DuplicateError) -> Self {
        Error::Duplicate(err)
    }
}

impl From<TransactionError> for Error {
    fn from(err: TransactionError) -> Self {
        Error::Transaction(err)
    }
}

impl From<BackendError> for Error {
    fn from(err: BackendError) -> Self {
        Error::Backend(err)
    }
}

impl From<SchemaError> for Error {
    fn from(err: SchemaError) -> Self {
        Error::Schema(err)
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serde(err.to_string())
    }
}

/// Result type alias for Relata operations.
pub type Result<T> = std::result::Result<T, Error>;
