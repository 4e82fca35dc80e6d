//! Supervision of the embedded slapd: renders its configuration and the
//! custom schema into the slapd state directory, starts the daemon, and
//! takes the whole process down when it exits.

use std::os::unix::fs::PermissionsExt;
use tokio::process::Command;

use crate::errors::PortunusError;
use crate::settings::Settings;

// Notes on this configuration:
//   - Only the portunus service user has any sort of write access.
//   - The cn=portunus-viewers virtual group corresponds to the
//     can_read_ldap permission.
//   - Users can read their own object, so that applications not using a
//     service user can discover group memberships of a logged-in user.
//   - TLSProtocolMin 3.3 means "TLS 1.2 or higher".
const CONFIG_TEMPLATE: &str = r#"
include %SCHEMA_DIR%/core.schema
include %SCHEMA_DIR%/cosine.schema
include %SCHEMA_DIR%/inetorgperson.schema
include %SCHEMA_DIR%/nis.schema

include %STATE_DIR%/portunus.schema

access to dn.base="" by * read
access to dn.base="cn=Subschema" by * read

access to *
	by dn.base="cn=portunus,%SUFFIX%" write
	by group.exact="cn=portunus-viewers,%SUFFIX%" read
	by self read
	by anonymous auth

TLSCACertificateFile  "%STATE_DIR%/ca.pem"
TLSCertificateFile    "%STATE_DIR%/cert.pem"
TLSCertificateKeyFile "%STATE_DIR%/key.pem"
TLSProtocolMin 3.3

database   mdb
maxsize    1073741824
suffix     "%SUFFIX%"
rootdn     "cn=portunus,%SUFFIX%"
rootpw     "%ROOT_PASSWORD_HASH%"
directory  "%STATE_DIR%/data"

index objectClass eq
"#;

// The memberof overlay is not used because portunus-server computes the
// back-references itself. The attribute is called isMemberOf rather than
// memberOf since some OpenLDAP builds define memberOf even without the
// overlay enabled.
//
// The trailing empty line is important, otherwise slapd cannot parse
// this file.
const PORTUNUS_SCHEMA: &str = r#"
attributetype ( 9999.1.1 NAME 'isMemberOf'
	DESC 'back-reference to groups this user is a member of'
	SUP distinguishedName )

attributetype ( 9999.1.2 NAME 'sshPublicKey'
	DESC 'SSH public key used by this user'
	SUP name )

objectclass ( 9999.2.1 NAME 'portunusPerson'
	DESC 'addon to objectClass person that adds Portunus-specific attributes'
	SUP top AUXILIARY
	MAY ( isMemberOf $ sshPublicKey ) )

"#;

pub fn render_config(settings: &Settings, root_password_hash: &str) -> String {
    let mut rendered = CONFIG_TEMPLATE.to_string();
    if !settings.tls_enabled() {
        rendered = rendered
            .lines()
            .filter(|line| !line.starts_with("TLS"))
            .collect::<Vec<_>>()
            .join("\n");
        rendered.push('\n');
    }

    let substitutions = [
        ("%SCHEMA_DIR%", settings.slapd_schema_dir.display().to_string()),
        ("%STATE_DIR%", settings.slapd_state_dir.display().to_string()),
        ("%SUFFIX%", settings.ldap_suffix.clone()),
        ("%ROOT_PASSWORD_HASH%", root_password_hash.to_string()),
    ];
    for (placeholder, value) in substitutions {
        rendered = rendered.replace(placeholder, &value);
    }
    rendered
}

/// Creates the slapd state directory and fills it with everything the
/// rendered configuration refers to.
pub fn prepare_state_dir(settings: &Settings, root_password_hash: &str) -> Result<(), PortunusError> {
    let state_dir = &settings.slapd_state_dir;
    std::fs::create_dir_all(state_dir.join("data"))?;

    std::fs::write(state_dir.join("portunus.schema"), PORTUNUS_SCHEMA)?;

    let config_path = state_dir.join("slapd.conf");
    std::fs::write(&config_path, render_config(settings, root_password_hash))?;
    // the config contains the rootpw hash
    std::fs::set_permissions(&config_path, std::fs::Permissions::from_mode(0o640))?;

    if settings.tls_enabled() {
        if let Some(cert) = &settings.slapd_tls_certificate {
            std::fs::copy(cert, state_dir.join("cert.pem"))?;
        }
        if let Some(key) = &settings.slapd_tls_private_key {
            std::fs::copy(key, state_dir.join("key.pem"))?;
        }
        if let Some(ca) = &settings.slapd_tls_ca_certificate {
            std::fs::copy(ca, state_dir.join("ca.pem"))?;
        }
    }
    Ok(())
}

/// Runs slapd in the foreground and waits for it. Only returns on error;
/// slapd exiting is always an error for a long-running directory service.
pub async fn run(settings: &Settings) -> PortunusError {
    // with debug enabled, turn on all slapd debug logging except package
    // traces, which might reveal user passwords when bind requests are
    // logged
    let debug_flags: u64 = if settings.debug { 0xFFFF & !0x12 } else { 0 };
    let bind_url = if settings.tls_enabled() { "ldaps:///" } else { "ldap:///" };

    tracing::info!(binary = %settings.slapd_binary, url = bind_url, "starting slapd");
    let result = Command::new(&settings.slapd_binary)
        .arg("-u")
        .arg(&settings.slapd_user)
        .arg("-g")
        .arg(&settings.slapd_group)
        .arg("-h")
        .arg(bind_url)
        .arg("-f")
        .arg(settings.slapd_state_dir.join("slapd.conf"))
        // passing -d keeps slapd in the foreground even when the flags
        // are 0
        .arg("-d")
        .arg(debug_flags.to_string())
        .status()
        .await;

    match result {
        Ok(status) => {
            PortunusError::Other(format!("slapd exited unexpectedly ({status}); check syslog for details"))
        }
        Err(err) => PortunusError::Io(err),
    }
}
