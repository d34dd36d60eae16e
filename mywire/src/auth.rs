//! Authentication plugins
//!
//! A plugin computes the response to the nonce sent by the server, and may continue
//! the exchange when the server sends extra data (`0x01` packages).
use std::{collections::HashMap, sync::Arc};

use sha1::{Digest, Sha1};

use crate::error::{ConnectionErrorContent, ConnectionResult};

/// Input available to an authentication plugin
pub struct AuthContext<'a> {
    /// The password of the user
    pub password: &'a str,
    /// Nonce (scramble) sent by the server, without trailing zero
    pub nonce: &'a [u8],
    /// True if the connection is encrypted or local
    pub secure: bool,
    /// Pem encoded RSA public key of the server, if configured
    pub server_public_key: Option<&'a [u8]>,
    /// May we ask the server for its RSA public key
    pub allow_public_key_retrieval: bool,
    /// May the password be sent in clear text over an insecure connection
    pub allow_cleartext_password: bool,
}

/// What to do after the server sent extra authentication data
#[derive(Debug, PartialEq, Eq)]
pub enum AuthContinuation {
    /// Nothing to send, read the next package from the server
    Wait,
    /// Send these bytes to the server
    Send(Vec<u8>),
}

/// An authentication method
pub trait AuthPlugin: Send + Sync {
    /// The name the server uses for the plugin
    fn name(&self) -> &str;

    /// The response sent in the handshake response or after an authentication switch
    fn initial_response(&self, ctx: &AuthContext<'_>) -> ConnectionResult<Vec<u8>>;

    /// React to extra data sent by the server
    fn continue_auth(
        &self,
        _ctx: &AuthContext<'_>,
        _data: &[u8],
    ) -> ConnectionResult<AuthContinuation> {
        Err(ConnectionErrorContent::Authentication(format!(
            "Unexpected extra authentication data for {}",
            self.name()
        ))
        .into())
    }
}

/// Authentication plugins by name
#[derive(Clone)]
pub struct AuthPluginRegistry {
    /// The plugins
    plugins: HashMap<String, Arc<dyn AuthPlugin>>,
}

impl AuthPluginRegistry {
    /// A registry without any plugins
    pub fn empty() -> Self {
        Self {
            plugins: HashMap::new(),
        }
    }

    /// Add a plugin, replacing any plugin of the same name
    pub fn register(mut self, plugin: impl AuthPlugin + 'static) -> Self {
        self.plugins.insert(plugin.name().to_string(), Arc::new(plugin));
        self
    }

    /// Find a plugin by name
    pub fn get(&self, name: &str) -> Option<Arc<dyn AuthPlugin>> {
        self.plugins.get(name).cloned()
    }

    /// Names of the registered plugins
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.plugins.keys().map(String::as_str)
    }
}

/// The registry contains mysql_native_password, mysql_clear_password
/// and with the `sha2_auth` feature caching_sha2_password and sha256_password
impl Default for AuthPluginRegistry {
    fn default() -> Self {
        let r = Self::empty()
            .register(NativePassword)
            .register(ClearPassword);
        #[cfg(feature = "sha2_auth")]
        let r = r.register(CachingSha2Password).register(Sha256Password);
        r
    }
}

impl std::fmt::Debug for AuthPluginRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names: Vec<_> = self.names().collect();
        names.sort_unstable();
        f.debug_tuple("AuthPluginRegistry").field(&names).finish()
    }
}

/// Compute the mysql_native_password scramble
///
/// SHA1( password ) ^ SHA1( nonce + SHA1( SHA1( password ) ) )
/// <https://mariadb.com/kb/en/connection/#mysql_native_password-plugin>
pub(crate) fn scramble_native(password: &str, nonce: &[u8]) -> [u8; 20] {
    let mut pw_hash: [u8; 20] = Sha1::digest(password.as_bytes()).into();
    let pw_hash_hash = Sha1::digest(pw_hash);
    let mut ctx = Sha1::new();
    ctx.update(nonce);
    ctx.update(pw_hash_hash);
    let pw_seed_hash_hash = ctx.finalize();
    for (a, b) in pw_hash.iter_mut().zip(pw_seed_hash_hash) {
        *a ^= b;
    }
    pw_hash
}

/// The `mysql_native_password` plugin
pub struct NativePassword;

impl AuthPlugin for NativePassword {
    fn name(&self) -> &str {
        "mysql_native_password"
    }

    fn initial_response(&self, ctx: &AuthContext<'_>) -> ConnectionResult<Vec<u8>> {
        if ctx.password.is_empty() {
            return Ok(Vec::new());
        }
        let nonce = &ctx.nonce[..ctx.nonce.len().min(20)];
        Ok(scramble_native(ctx.password, nonce).to_vec())
    }
}

/// The password followed by a zero byte
fn password_null(password: &str) -> Vec<u8> {
    let mut v = Vec::with_capacity(password.len() + 1);
    v.extend_from_slice(password.as_bytes());
    v.push(0);
    v
}

/// The `mysql_clear_password` plugin
pub struct ClearPassword;

impl AuthPlugin for ClearPassword {
    fn name(&self) -> &str {
        "mysql_clear_password"
    }

    fn initial_response(&self, ctx: &AuthContext<'_>) -> ConnectionResult<Vec<u8>> {
        if !ctx.secure && !ctx.allow_cleartext_password {
            return Err(ConnectionErrorContent::Authentication(
                "mysql_clear_password requires a secure connection".to_string(),
            )
            .into());
        }
        Ok(password_null(ctx.password))
    }
}

#[cfg(feature = "sha2_auth")]
pub use sha2_plugins::{CachingSha2Password, Sha256Password};

/// Plugins based on sha256 and RSA
#[cfg(feature = "sha2_auth")]
mod sha2_plugins {
    use rand::rngs::OsRng;
    use rsa::{Oaep, RsaPublicKey, pkcs1::DecodeRsaPublicKey, pkcs8::DecodePublicKey};
    use sha1::Sha1;
    use sha2::{Digest, Sha256};

    use super::{AuthContext, AuthContinuation, AuthPlugin, password_null};
    use crate::error::{ConnectionErrorContent, ConnectionResult};

    /// Server says the cached fast authentication succeeded
    const FAST_AUTH_SUCCESS: u8 = 0x03;
    /// Server asks for the full password
    const PERFORM_FULL_AUTH: u8 = 0x04;
    /// Ask caching_sha2_password for the public key
    const CACHING_SHA2_REQUEST_PUBLIC_KEY: u8 = 0x02;
    /// Ask sha256_password for the public key
    const SHA256_REQUEST_PUBLIC_KEY: u8 = 0x01;

    /// Compute the caching_sha2_password scramble
    ///
    /// SHA256( password ) ^ SHA256( SHA256( SHA256( password ) ) + nonce )
    pub(crate) fn scramble_sha256(password: &str, nonce: &[u8]) -> [u8; 32] {
        let mut pw_hash: [u8; 32] = Sha256::digest(password.as_bytes()).into();
        let pw_hash_hash = Sha256::digest(pw_hash);
        let mut ctx = Sha256::new();
        ctx.update(pw_hash_hash);
        ctx.update(nonce);
        let scramble = ctx.finalize();
        for (a, b) in pw_hash.iter_mut().zip(scramble) {
            *a ^= b;
        }
        pw_hash
    }

    /// Encrypt the password xor the nonce with the servers public key
    pub(crate) fn encrypt_password(
        password: &str,
        nonce: &[u8],
        pem: &[u8],
    ) -> ConnectionResult<Vec<u8>> {
        if nonce.is_empty() {
            return Err(ConnectionErrorContent::Authentication("Empty nonce".to_string()).into());
        }
        let mut pw = password_null(password);
        for (i, b) in pw.iter_mut().enumerate() {
            *b ^= nonce[i % nonce.len()];
        }
        let pem = std::str::from_utf8(pem).map_err(|_| {
            ConnectionErrorContent::Authentication("Public key is not valid pem".to_string())
        })?;
        let key = RsaPublicKey::from_public_key_pem(pem.trim())
            .or_else(|_| RsaPublicKey::from_pkcs1_pem(pem.trim()))
            .map_err(|e| {
                ConnectionErrorContent::Authentication(format!("Invalid RSA public key: {e}"))
            })?;
        key.encrypt(&mut OsRng, Oaep::new::<Sha1>(), &pw)
            .map_err(|e| {
                ConnectionErrorContent::Authentication(format!("RSA encryption failed: {e}"))
                    .into()
            })
    }

    /// Send the full password, in clear text over secure connections and
    /// RSA encrypted otherwise
    fn full_auth(ctx: &AuthContext<'_>, request_key: u8) -> ConnectionResult<Vec<u8>> {
        if ctx.secure {
            Ok(password_null(ctx.password))
        } else if let Some(pem) = ctx.server_public_key {
            encrypt_password(ctx.password, ctx.nonce, pem)
        } else if ctx.allow_public_key_retrieval {
            Ok(vec![request_key])
        } else {
            Err(ConnectionErrorContent::Authentication(
                "Full authentication requires TLS, a configured server public key or allowing public key retrieval"
                    .to_string(),
            )
            .into())
        }
    }

    /// The `caching_sha2_password` plugin
    pub struct CachingSha2Password;

    impl AuthPlugin for CachingSha2Password {
        fn name(&self) -> &str {
            "caching_sha2_password"
        }

        fn initial_response(&self, ctx: &AuthContext<'_>) -> ConnectionResult<Vec<u8>> {
            if ctx.password.is_empty() {
                return Ok(Vec::new());
            }
            Ok(scramble_sha256(ctx.password, ctx.nonce).to_vec())
        }

        fn continue_auth(
            &self,
            ctx: &AuthContext<'_>,
            data: &[u8],
        ) -> ConnectionResult<AuthContinuation> {
            match data {
                [FAST_AUTH_SUCCESS] => Ok(AuthContinuation::Wait),
                [PERFORM_FULL_AUTH] => Ok(AuthContinuation::Send(full_auth(
                    ctx,
                    CACHING_SHA2_REQUEST_PUBLIC_KEY,
                )?)),
                pem => Ok(AuthContinuation::Send(encrypt_password(
                    ctx.password,
                    ctx.nonce,
                    pem,
                )?)),
            }
        }
    }

    /// The `sha256_password` plugin
    pub struct Sha256Password;

    impl AuthPlugin for Sha256Password {
        fn name(&self) -> &str {
            "sha256_password"
        }

        fn initial_response(&self, ctx: &AuthContext<'_>) -> ConnectionResult<Vec<u8>> {
            if ctx.password.is_empty() {
                return Ok(vec![0]);
            }
            full_auth(ctx, SHA256_REQUEST_PUBLIC_KEY)
        }

        fn continue_auth(
            &self,
            ctx: &AuthContext<'_>,
            pem: &[u8],
        ) -> ConnectionResult<AuthContinuation> {
            Ok(AuthContinuation::Send(encrypt_password(
                ctx.password,
                ctx.nonce,
                pem,
            )?))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Context used by the tests
    fn ctx<'a>(password: &'a str, nonce: &'a [u8], secure: bool) -> AuthContext<'a> {
        AuthContext {
            password,
            nonce,
            secure,
            server_public_key: None,
            allow_public_key_retrieval: false,
            allow_cleartext_password: false,
        }
    }

    #[test]
    fn native_password_matches_mysql_scramble() {
        // With a nonce of all zeros the scramble is
        // SHA1(pw) ^ SHA1(zeros + SHA1(SHA1(pw))), compute it independently
        let nonce = [0u8; 20];
        let stage1 = Sha1::digest(b"secret");
        let stage2 = Sha1::digest(stage1);
        let mut h = Sha1::new();
        h.update(nonce);
        h.update(stage2);
        let stage3 = h.finalize();
        let expected: Vec<u8> = stage1.iter().zip(stage3).map(|(a, b)| a ^ b).collect();
        let r = NativePassword
            .initial_response(&ctx("secret", &nonce, false))
            .unwrap();
        assert_eq!(r, expected);
        // Only the first 20 bytes of the nonce are used
        let mut long = nonce.to_vec();
        long.push(0);
        assert_eq!(
            NativePassword
                .initial_response(&ctx("secret", &long, false))
                .unwrap(),
            expected
        );
    }

    #[test]
    fn empty_password_sends_nothing() {
        let r = NativePassword
            .initial_response(&ctx("", b"12345678901234567890", false))
            .unwrap();
        assert!(r.is_empty());
    }

    #[test]
    fn clear_password_requires_secure() {
        assert!(
            ClearPassword
                .initial_response(&ctx("pw", b"", false))
                .is_err()
        );
        assert_eq!(
            ClearPassword
                .initial_response(&ctx("pw", b"", true))
                .unwrap(),
            b"pw\0"
        );
    }

    #[test]
    fn default_registry() {
        let r = AuthPluginRegistry::default();
        assert!(r.get("mysql_native_password").is_some());
        assert!(r.get("mysql_clear_password").is_some());
        #[cfg(feature = "sha2_auth")]
        assert!(r.get("caching_sha2_password").is_some());
        assert!(r.get("dialog").is_none());
    }

    #[cfg(feature = "sha2_auth")]
    #[test]
    fn caching_sha2_continuation() {
        let nonce = b"abcdefghijklmnopqrst";
        let p = CachingSha2Password;
        assert_eq!(p.initial_response(&ctx("pw", nonce, false)).unwrap().len(), 32);
        assert_eq!(
            p.continue_auth(&ctx("pw", nonce, false), &[0x03]).unwrap(),
            AuthContinuation::Wait
        );
        assert_eq!(
            p.continue_auth(&ctx("pw", nonce, true), &[0x04]).unwrap(),
            AuthContinuation::Send(b"pw\0".to_vec())
        );
        // No TLS, no key and no retrieval allowed
        assert!(p.continue_auth(&ctx("pw", nonce, false), &[0x04]).is_err());
        let mut c = ctx("pw", nonce, false);
        c.allow_public_key_retrieval = true;
        assert_eq!(
            p.continue_auth(&c, &[0x04]).unwrap(),
            AuthContinuation::Send(vec![0x02])
        );
    }

    #[cfg(feature = "sha2_auth")]
    #[test]
    fn rsa_encrypt_password() {
        use rsa::{Oaep, RsaPrivateKey, pkcs8::EncodePublicKey};

        let key = RsaPrivateKey::new(&mut rand::rngs::OsRng, 1024).unwrap();
        let pem = key
            .to_public_key()
            .to_public_key_pem(rsa::pkcs8::LineEnding::LF)
            .unwrap();
        let nonce = b"abcdefghijklmnopqrst";
        let encrypted = super::sha2_plugins::encrypt_password("pw", nonce, pem.as_bytes()).unwrap();
        let decrypted = key.decrypt(Oaep::new::<Sha1>(), &encrypted).unwrap();
        let plain: Vec<u8> = decrypted
            .iter()
            .enumerate()
            .map(|(i, b)| b ^ nonce[i % nonce.len()])
            .collect();
        assert_eq!(plain, b"pw\0");
    }
}
