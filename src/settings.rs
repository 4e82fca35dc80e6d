use miette::{miette, IntoDiagnostic, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

static LDAP_SUFFIX_RX: LazyLock<regex::Regex> =
    LazyLock::new(|| regex::Regex::new(r"^dc=[^,]+(,dc=[^,]+)*$").unwrap());

/// Runtime configuration. Keys mirror the `PORTUNUS_*` environment
/// contract one to one, e.g. `PORTUNUS_SERVER_STATE_DIR` →
/// `server_state_dir`.
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    /// Lowers the default log level to debug and turns on slapd debug
    /// logging.
    pub debug: bool,
    /// Directory holding `database.json`.
    pub server_state_dir: PathBuf,
    pub server_http_listen: String,
    /// Whether the HTTP frontend is reached via HTTPS (through a reverse
    /// proxy); enables strict transport headers.
    pub server_http_secure: bool,
    /// The DN suffix of the LDAP directory, e.g. `dc=example,dc=org`.
    pub ldap_suffix: String,
    /// Optional fixed service-user password; generated fresh on every
    /// start when unset.
    pub ldap_password: Option<String>,
    pub seed_path: Option<PathBuf>,
    pub slapd_binary: String,
    pub slapd_user: String,
    pub slapd_group: String,
    pub slapd_schema_dir: PathBuf,
    pub slapd_state_dir: PathBuf,
    pub slapd_tls_certificate: Option<PathBuf>,
    pub slapd_tls_private_key: Option<PathBuf>,
    pub slapd_tls_ca_certificate: Option<PathBuf>,
    pub slapd_tls_domain_name: Option<String>,
}

impl Settings {
    pub fn load(path: &str) -> Result<Self> {
        let mut builder = config::Config::builder()
            .set_default("debug", false)
            .into_diagnostic()?
            .set_default("server_state_dir", "/var/lib/portunus")
            .into_diagnostic()?
            .set_default("server_http_listen", "127.0.0.1:8080")
            .into_diagnostic()?
            .set_default("server_http_secure", true)
            .into_diagnostic()?
            .set_default("slapd_binary", "slapd")
            .into_diagnostic()?
            .set_default("slapd_user", "ldap")
            .into_diagnostic()?
            .set_default("slapd_group", "ldap")
            .into_diagnostic()?
            .set_default("slapd_schema_dir", "/etc/openldap/schema")
            .into_diagnostic()?
            .set_default("slapd_state_dir", "/var/run/portunus-slapd")
            .into_diagnostic()?;

        // Optional file
        if Path::new(path).exists() {
            builder = builder.add_source(config::File::with_name(path));
        }

        // Environment overrides: PORTUNUS_LDAP_SUFFIX, PORTUNUS_DEBUG, etc.
        builder = builder.add_source(
            config::Environment::with_prefix("PORTUNUS").try_parsing(true),
        );

        let cfg = builder.build().into_diagnostic()?;
        let settings: Settings = cfg.try_deserialize().into_diagnostic()?;
        settings.validate()?;
        Ok(settings)
    }

    fn validate(&self) -> Result<()> {
        if !LDAP_SUFFIX_RX.is_match(&self.ldap_suffix) {
            return Err(miette!(
                "PORTUNUS_LDAP_SUFFIX must be a sequence of dc= components, got {:?}",
                self.ldap_suffix
            ));
        }
        let tls_parts = [
            self.slapd_tls_certificate.is_some(),
            self.slapd_tls_private_key.is_some(),
            self.slapd_tls_domain_name.is_some(),
        ];
        if tls_parts.iter().any(|set| *set) && !tls_parts.iter().all(|set| *set) {
            return Err(miette!(
                "PORTUNUS_SLAPD_TLS_CERTIFICATE, PORTUNUS_SLAPD_TLS_PRIVATE_KEY and \
                 PORTUNUS_SLAPD_TLS_DOMAIN_NAME must be configured together"
            ));
        }
        Ok(())
    }

    pub fn database_path(&self) -> PathBuf {
        self.server_state_dir.join("database.json")
    }

    pub fn tls_enabled(&self) -> bool {
        self.slapd_tls_certificate.is_some()
    }

    /// The URL the projector connects to. With TLS, the connection has to
    /// go through the certificate's domain name for verification to pass.
    pub fn ldap_url(&self) -> String {
        match &self.slapd_tls_domain_name {
            Some(domain) if self.tls_enabled() => format!("ldaps://{domain}"),
            _ => "ldap://localhost".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings_with_suffix(suffix: &str) -> Settings {
        Settings {
            debug: false,
            server_state_dir: "/var/lib/portunus".into(),
            server_http_listen: "127.0.0.1:8080".into(),
            server_http_secure: true,
            ldap_suffix: suffix.into(),
            ldap_password: None,
            seed_path: None,
            slapd_binary: "slapd".into(),
            slapd_user: "ldap".into(),
            slapd_group: "ldap".into(),
            slapd_schema_dir: "/etc/openldap/schema".into(),
            slapd_state_dir: "/var/run/portunus-slapd".into(),
            slapd_tls_certificate: None,
            slapd_tls_private_key: None,
            slapd_tls_ca_certificate: None,
            slapd_tls_domain_name: None,
        }
    }

    #[test]
    fn test_suffix_validation() {
        assert!(settings_with_suffix("dc=example,dc=org").validate().is_ok());
        assert!(settings_with_suffix("dc=example").validate().is_ok());
        assert!(settings_with_suffix("o=example").validate().is_err());
        assert!(settings_with_suffix("dc=a,ou=b").validate().is_err());
        assert!(settings_with_suffix("").validate().is_err());
    }

    #[test]
    fn test_tls_settings_must_be_complete() {
        let mut settings = settings_with_suffix("dc=example,dc=org");
        settings.slapd_tls_certificate = Some("/etc/ssl/cert.pem".into());
        assert!(settings.validate().is_err());

        settings.slapd_tls_private_key = Some("/etc/ssl/key.pem".into());
        settings.slapd_tls_domain_name = Some("ldap.example.org".into());
        assert!(settings.validate().is_ok());
        assert_eq!(settings.ldap_url(), "ldaps://ldap.example.org");
    }

    #[test]
    fn test_ldap_url_without_tls() {
        let settings = settings_with_suffix("dc=example,dc=org");
        assert_eq!(settings.ldap_url(), "ldap://localhost");
        assert_eq!(
            settings.database_path(),
            PathBuf::from("/var/lib/portunus/database.json")
        );
    }
}
