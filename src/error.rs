use std::path::PathBuf;

use thiserror::Error;

/// Main error type covering every failure a validation run can hit
#[derive(Error, Debug)]
pub enum ValidationError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("HTTP status error: {status} for {url} - {message}")]
    HttpStatus {
        url: String,
        status: u16,
        message: String,
    },

    #[error("Request timeout: {url} after {timeout_seconds} seconds")]
    Timeout { url: String, timeout_seconds: u64 },

    #[error("Malformed input at line {line}: {details}")]
    MalformedInput { line: usize, details: String },

    #[error("Unresolved reference: {system_id}")]
    UnresolvedReference { system_id: String },

    #[error("Invalid rule set: {path} - {details}")]
    InvalidRuleSet { path: PathBuf, details: String },

    #[error("Invalid transform: {path} - {details}")]
    InvalidTransform { path: PathBuf, details: String },

    #[error("Unreadable rule output: {details}")]
    Svrl { details: String },

    #[error("Ambiguous archive: {path} has {root_files} root files, expected exactly one")]
    AmbiguousArchive { path: PathBuf, root_files: usize },

    #[error("Invalid path expression `{expression}`: {details}")]
    XPath { expression: String, details: String },

    #[error("Unknown validation type: {validation_type}")]
    UnknownValidationType { validation_type: String },

    #[error("External {kind} artifacts: {details}")]
    ExternalArtifact { kind: String, details: String },

    #[error("Cache error: {0}")]
    Cache(String),

    #[error("Report serialization failed: {0}")]
    Serialization(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("LibXML2 internal error: {details}")]
    LibXml2Internal { details: String },

    #[error("Concurrent operation error: {details}")]
    Concurrency { details: String },
}

impl ValidationError {
    /// Errors that invalidate the whole request rather than one artifact
    pub fn is_request_level(&self) -> bool {
        matches!(
            self,
            ValidationError::AmbiguousArchive { .. }
                | ValidationError::UnknownValidationType { .. }
                | ValidationError::ExternalArtifact { .. }
                | ValidationError::Config(_)
        )
    }
}

/// Cache-specific error types
#[derive(Error, Debug)]
pub enum CacheError {
    #[error("Cache write error: {key} - {details}")]
    WriteError { key: String, details: String },

    #[error("Cache read error: {key} - {details}")]
    ReadError { key: String, details: String },
}

/// LibXML2 and libxslt error types
///
/// Kept `Clone` so compilation failures can be handed out of the transform cache.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LibXml2Error {
    #[error("Schema parsing failed: {details}")]
    SchemaParseFailed { details: String },

    #[error("Validation context creation failed")]
    ValidationContextCreationFailed,

    #[error("File validation failed with code {code}: {file}")]
    ValidationFailed { code: i32, file: PathBuf },

    #[error("Stylesheet compilation failed: {file}")]
    StylesheetParseFailed { file: PathBuf },

    #[error("Transformation failed: {details}")]
    TransformFailed { details: String },

    #[error("Document parsing failed: {details}")]
    DocumentParseFailed { details: String },

    #[error("Unresolved reference: {system_id}")]
    UnresolvedReference { system_id: String },

    #[error("Path is not representable as a C string: {path}")]
    InvalidPath { path: PathBuf },
}

impl From<crate::config::ConfigError> for ValidationError {
    fn from(err: crate::config::ConfigError) -> Self {
        ValidationError::Config(err.to_string())
    }
}

impl From<CacheError> for ValidationError {
    fn from(err: CacheError) -> Self {
        ValidationError::Cache(err.to_string())
    }
}

impl From<LibXml2Error> for ValidationError {
    fn from(err: LibXml2Error) -> Self {
        match err {
            LibXml2Error::UnresolvedReference { system_id } => {
                ValidationError::UnresolvedReference { system_id }
            }
            other => ValidationError::LibXml2Internal {
                details: other.to_string(),
            },
        }
    }
}

/// Result type alias for convenience
pub type Result<T> = std::result::Result<T, ValidationError>;

/// LibXML2 result type alias
pub type LibXml2Result<T> = std::result::Result<T, LibXml2Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation_error_display() {
        let io_error = ValidationError::Io(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            "File not found",
        ));
        assert!(io_error.to_string().contains("IO error"));

        let unresolved = ValidationError::UnresolvedReference {
            system_id: "common/types.xsd".to_string(),
        };
        assert!(unresolved.to_string().contains("common/types.xsd"));

        let archive = ValidationError::AmbiguousArchive {
            path: PathBuf::from("/tmp/upload"),
            root_files: 2,
        };
        assert!(archive.to_string().contains("2 root files"));
    }

    #[test]
    fn test_request_level_classification() {
        assert!(
            ValidationError::AmbiguousArchive {
                path: PathBuf::from("x"),
                root_files: 0
            }
            .is_request_level()
        );
        assert!(
            ValidationError::UnknownValidationType {
                validation_type: "ubl".to_string()
            }
            .is_request_level()
        );
        assert!(
            !ValidationError::InvalidRuleSet {
                path: PathBuf::from("rules.sch"),
                details: "no patterns".to_string()
            }
            .is_request_level()
        );
    }

    #[test]
    fn test_cache_error_conversion() {
        let cache_error = CacheError::WriteError {
            key: "test_key".to_string(),
            details: "test details".to_string(),
        };
        let validation_error: ValidationError = cache_error.into();

        match validation_error {
            ValidationError::Cache(message) => assert!(message.contains("test_key")),
            _ => panic!("Expected ValidationError::Cache"),
        }
    }

    #[test]
    fn test_libxml2_unresolved_reference_keeps_system_id() {
        let err: ValidationError = LibXml2Error::UnresolvedReference {
            system_id: "http://example.com/missing.xsd".to_string(),
        }
        .into();

        match err {
            ValidationError::UnresolvedReference { system_id } => {
                assert_eq!(system_id, "http://example.com/missing.xsd")
            }
            other => panic!("Expected UnresolvedReference, got {:?}", other),
        }
    }

    #[test]
    fn test_libxml2_error_conversion() {
        let validation_error: ValidationError = LibXml2Error::ValidationContextCreationFailed.into();

        match validation_error {
            ValidationError::LibXml2Internal { .. } => (),
            _ => panic!("Expected ValidationError::LibXml2Internal"),
        }
    }

    #[test]
    fn test_error_source_chain() {
        use std::error::Error;

        let io_error = std::io::Error::new(std::io::ErrorKind::NotFound, "File not found");
        let validation_error = ValidationError::Io(io_error);

        let source = validation_error.source().unwrap();
        assert_eq!(source.to_string(), "File not found");
    }
}
