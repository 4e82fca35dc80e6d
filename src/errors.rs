use miette::Diagnostic;
use thiserror::Error;

/// Operational errors: I/O, configuration, LDAP, hashing. Validation
/// failures are not in here — they travel as `validation::ValidationError`
/// values and never abort anything.
#[derive(Debug, Error, Diagnostic)]
pub enum PortunusError {
    #[error("I/O error: {0}")]
    #[diagnostic(code(portunus::io))]
    Io(#[from] std::io::Error),

    #[error("Config error: {0}")]
    #[diagnostic(code(portunus::config))]
    Config(#[from] config::ConfigError),

    #[error("Serialization error: {0}")]
    #[diagnostic(code(portunus::serde))]
    Serde(#[from] serde_json::Error),

    #[error("File watch error: {0}")]
    #[diagnostic(code(portunus::watch))]
    Watch(#[from] notify::Error),

    #[error("LDAP error: {0}")]
    #[diagnostic(code(portunus::ldap))]
    Ldap(#[from] ldap3::LdapError),

    #[error("Seed error: {0}")]
    #[diagnostic(code(portunus::seed))]
    Seed(String),

    #[error("Crypt error: {0}")]
    #[diagnostic(code(portunus::crypt))]
    Crypt(String),

    #[error("{0}")]
    #[diagnostic(code(portunus::other))]
    Other(String),
}
