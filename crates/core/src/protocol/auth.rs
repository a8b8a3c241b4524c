//! RTSP authentication (RFC 2326 §D, RFC 2617).
//!
//! Cameras answer an unauthenticated request with `401 Unauthorized` and one
//! or more `WWW-Authenticate` challenges. Digest is preferred over Basic when
//! both are offered.
//!
//! Digest response computation (MD5):
//!
//! ```text
//! HA1      = MD5(username:realm:password)
//! HA2      = MD5(method:uri)
//! response = MD5(HA1:nonce:HA2)                          (no qop)
//! response = MD5(HA1:nonce:nc:cnonce:auth:HA2)           (qop=auth)
//! ```

use base64::prelude::{BASE64_STANDARD, Engine as _};

/// A parsed `WWW-Authenticate` challenge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Challenge {
    Basic {
        realm: String,
    },
    Digest {
        realm: String,
        nonce: String,
        opaque: Option<String>,
        /// `true` when the server offered `qop=auth`.
        qop_auth: bool,
    },
}

impl Challenge {
    /// Parse one `WWW-Authenticate` header value.
    ///
    /// Returns `None` for unknown schemes and Digest challenges that are
    /// missing a nonce or use an algorithm other than MD5.
    pub fn parse(value: &str) -> Option<Self> {
        let value = value.trim();
        let (scheme, rest) = value.split_once(char::is_whitespace).unwrap_or((value, ""));
        let params = parse_params(rest);
        let param = |name: &str| {
            params
                .iter()
                .find(|(k, _)| k.eq_ignore_ascii_case(name))
                .map(|(_, v)| v.clone())
        };

        if scheme.eq_ignore_ascii_case("Basic") {
            return Some(Self::Basic {
                realm: param("realm").unwrap_or_default(),
            });
        }
        if !scheme.eq_ignore_ascii_case("Digest") {
            return None;
        }
        if let Some(algorithm) = param("algorithm")
            && !algorithm.eq_ignore_ascii_case("MD5")
        {
            tracing::warn!(algorithm, "unsupported digest algorithm");
            return None;
        }

        Some(Self::Digest {
            realm: param("realm").unwrap_or_default(),
            nonce: param("nonce")?,
            opaque: param("opaque"),
            qop_auth: param("qop").is_some_and(|qop| {
                qop.split(',').any(|q| q.trim().eq_ignore_ascii_case("auth"))
            }),
        })
    }

    /// Pick the strongest supported challenge among several header values.
    pub fn select<'a>(values: impl IntoIterator<Item = &'a str>) -> Option<Self> {
        let mut basic = None;
        for value in values {
            match Self::parse(value) {
                Some(digest @ Self::Digest { .. }) => return Some(digest),
                Some(b @ Self::Basic { .. }) => basic = basic.or(Some(b)),
                None => {}
            }
        }
        basic
    }
}

/// Split `key=value, key="quoted, value"` into pairs.
fn parse_params(input: &str) -> Vec<(String, String)> {
    let mut params = Vec::new();
    let mut rest = input.trim();

    while !rest.is_empty() {
        let Some((key, after)) = rest.split_once('=') else {
            break;
        };
        let key = key.trim().trim_start_matches(',').trim().to_string();
        let after = after.trim_start();

        let (value, remaining) = if let Some(quoted) = after.strip_prefix('"') {
            match quoted.find('"') {
                Some(end) => (&quoted[..end], &quoted[end + 1..]),
                None => (quoted, ""),
            }
        } else {
            match after.find(',') {
                Some(end) => (after[..end].trim(), &after[end..]),
                None => (after.trim(), ""),
            }
        };

        params.push((key, value.to_string()));
        rest = remaining.trim_start().trim_start_matches(',').trim_start();
    }
    params
}

/// Produces `Authorization` header values for one set of credentials.
#[derive(Debug, Clone)]
pub struct Authenticator {
    username: String,
    password: String,
    challenge: Challenge,
    nonce_count: u32,
}

impl Authenticator {
    pub fn new(username: &str, password: &str, challenge: Challenge) -> Self {
        Self {
            username: username.to_string(),
            password: password.to_string(),
            challenge,
            nonce_count: 0,
        }
    }

    pub fn challenge(&self) -> &Challenge {
        &self.challenge
    }

    /// Compute the `Authorization` value for a request.
    pub fn authorization(&mut self, method: &str, uri: &str) -> String {
        let cnonce = format!("{:016x}", rand::random::<u64>());
        self.authorization_with_cnonce(method, uri, &cnonce)
    }

    fn authorization_with_cnonce(&mut self, method: &str, uri: &str, cnonce: &str) -> String {
        match &self.challenge {
            Challenge::Basic { .. } => {
                let token = BASE64_STANDARD.encode(format!("{}:{}", self.username, self.password));
                format!("Basic {token}")
            }
            Challenge::Digest {
                realm,
                nonce,
                opaque,
                qop_auth,
            } => {
                let ha1 = md5_hex(&format!("{}:{realm}:{}", self.username, self.password));
                let ha2 = md5_hex(&format!("{method}:{uri}"));

                let mut value = format!(
                    "Digest username=\"{}\", realm=\"{realm}\", nonce=\"{nonce}\", uri=\"{uri}\"",
                    self.username
                );
                if *qop_auth {
                    self.nonce_count += 1;
                    let nc = format!("{:08x}", self.nonce_count);
                    let response = md5_hex(&format!("{ha1}:{nonce}:{nc}:{cnonce}:auth:{ha2}"));
                    value.push_str(&format!(
                        ", response=\"{response}\", qop=auth, nc={nc}, cnonce=\"{cnonce}\""
                    ));
                } else {
                    let response = md5_hex(&format!("{ha1}:{nonce}:{ha2}"));
                    value.push_str(&format!(", response=\"{response}\""));
                }
                if let Some(opaque) = opaque {
                    value.push_str(&format!(", opaque=\"{opaque}\""));
                }
                value.push_str(", algorithm=MD5");
                value
            }
        }
    }
}

fn md5_hex(input: &str) -> String {
    format!("{:x}", md5::compute(input))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_digest_challenge() {
        let challenge = Challenge::parse(
            r#"Digest realm="AXIS_ACCC8E000000", nonce="0002f7b5Y1Kd", qop="auth,auth-int", opaque="xyz""#,
        )
        .unwrap();
        assert_eq!(
            challenge,
            Challenge::Digest {
                realm: "AXIS_ACCC8E000000".into(),
                nonce: "0002f7b5Y1Kd".into(),
                opaque: Some("xyz".into()),
                qop_auth: true,
            }
        );
    }

    #[test]
    fn digest_without_nonce_is_rejected() {
        assert!(Challenge::parse(r#"Digest realm="x""#).is_none());
        assert!(Challenge::parse(r#"Digest realm="x", nonce="n", algorithm=SHA-256"#).is_none());
        assert!(Challenge::parse("Bearer token").is_none());
    }

    #[test]
    fn select_prefers_digest() {
        let selected = Challenge::select([
            r#"Basic realm="AXIS""#,
            r#"Digest realm="AXIS", nonce="abc""#,
        ])
        .unwrap();
        assert!(matches!(selected, Challenge::Digest { .. }));

        let basic = Challenge::select([r#"Basic realm="AXIS""#]).unwrap();
        assert!(matches!(basic, Challenge::Basic { .. }));
    }

    #[test]
    fn basic_authorization() {
        let challenge = Challenge::Basic {
            realm: "AXIS".into(),
        };
        let mut auth = Authenticator::new("root", "pass", challenge);
        assert_eq!(auth.authorization("DESCRIBE", "rtsp://cam/"), "Basic cm9vdDpwYXNz");
    }

    #[test]
    fn rfc2617_digest_vector() {
        // RFC 2617 §3.5 example, with the HTTP method and URI.
        let challenge = Challenge::Digest {
            realm: "testrealm@host.com".into(),
            nonce: "dcd98b7102dd2f0e8b11d0f600bfb0c093".into(),
            opaque: Some("5ccc069c403ebaf9f0171e9517f40e41".into()),
            qop_auth: true,
        };
        let mut auth = Authenticator::new("Mufasa", "Circle Of Life", challenge);
        let value = auth.authorization_with_cnonce("GET", "/dir/index.html", "0a4f113b");
        assert!(value.contains(r#"response="6629fae49393a05397450978507c4ef1""#), "{value}");
        assert!(value.contains("nc=00000001"));
        assert!(value.contains(r#"opaque="5ccc069c403ebaf9f0171e9517f40e41""#));

        let second = auth.authorization_with_cnonce("GET", "/dir/index.html", "0a4f113b");
        assert!(second.contains("nc=00000002"));
    }

    #[test]
    fn digest_without_qop() {
        let challenge = Challenge::Digest {
            realm: "r".into(),
            nonce: "n".into(),
            opaque: None,
            qop_auth: false,
        };
        let mut auth = Authenticator::new("u", "p", challenge);
        let value = auth.authorization("PLAY", "rtsp://cam/");
        let ha1 = md5_hex("u:r:p");
        let ha2 = md5_hex("PLAY:rtsp://cam/");
        let expected = md5_hex(&format!("{ha1}:n:{ha2}"));
        assert!(value.contains(&format!("response=\"{expected}\"")));
        assert!(!value.contains("qop"));
    }
}
