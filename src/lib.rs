//! # xml-conformance
//!
//! Validates XML documents against XML Schema grammars and Schematron rule sets
//! and merges the findings into one line-mapped report per input.

pub mod artifact;
pub mod cache;
pub mod cli;
pub mod config;
pub mod document;
pub mod error;
pub mod http_client;
pub mod libxml2;
pub mod location;
pub mod namespace;
pub mod output;
pub mod report;
pub mod resolver;
pub mod schema;
pub mod schematron;
pub mod validator;
pub mod xpath;

pub use artifact::{ArtifactKind, ArtifactReference, ArtifactResolver, Provenance, UserArtifact};
pub use cache::{RemoteArtifactCache, TransformCache};
pub use cli::{Cli, OutputFormat, VerbosityLevel};
pub use config::{ArtifactDeclaration, Config, ConfigManager, ExternalArtifactSupport, ValidationProfile};
pub use document::LineAnnotatedDocument;
pub use error::{Result, ValidationError};
pub use http_client::{AsyncHttpClient, HttpClientConfig, RemoteFetcher};
pub use libxml2::LibXml2Wrapper;
pub use location::{LocationPolicy, PathLocationTranslator};
pub use namespace::NamespaceResolver;
pub use output::Output;
pub use report::{Counters, Diagnostic, Report, ReportAggregator, Severity, Verdict};
pub use resolver::ResourceChain;
pub use schema::SchemaValidator;
pub use schematron::RuleValidator;
pub use validator::{
    EngineOptions, RuleValidation, SchemaValidation, ValidationEngine, ValidationRequest,
};
