use thiserror::Error;

#[derive(Error, Debug)]
pub enum DomainError {
    #[error("Malformed domain document: {0}")]
    MalformedDocument(String),

    #[error("XML parsing error: {0}")]
    XmlParsing(String),

    #[error("Not implemented: {0}")]
    NotImplemented(&'static str),

    #[error("Stale definition: decoded at revision {expected}, hypervisor now at {actual}")]
    StaleDefinition { expected: String, actual: String },

    #[error("Virtual machine not found: {0}")]
    VmNotFound(String),

    #[error("virsh invocation failed: {0}")]
    VirshFailed(String),

    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, DomainError>;
