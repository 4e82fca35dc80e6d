//! Password handling. Stored hashes are crypt(3)-style blobs (`$5$`/`$6$`),
//! which slapd accepts verbatim under the `{CRYPT}` scheme — the same
//! format therefore serves the database file, the LDAP tree, and the
//! rendered `rootpw`.

use base64ct::{Base64UrlUnpadded, Encoding};
use rand::RngCore;
use sha_crypt::{sha256_check, sha512_check, sha512_simple, Sha512Params};

use crate::errors::PortunusError;

/// Generates a fresh random password, e.g. for the LDAP service user or
/// the first-boot admin account.
pub fn generate_password() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    Base64UrlUnpadded::encode_string(&bytes)
}

/// Hashes a password into the SHA-512 crypt format (`$6$...`).
pub fn hash_password(password: &str) -> Result<String, PortunusError> {
    let params = Sha512Params::default();
    sha512_simple(password, &params)
        .map_err(|err| PortunusError::Crypt(format!("password hashing failed: {err:?}")))
}

/// Checks a password against a stored crypt-style hash. Unknown hash
/// formats never verify.
pub fn verify_password(password: &str, hash: &str) -> bool {
    if hash.starts_with("$6$") {
        sha512_check(password, hash).is_ok()
    } else if hash.starts_with("$5$") {
        sha256_check(password, hash).is_ok()
    } else {
        false
    }
}
