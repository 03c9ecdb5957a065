//! HTTP message signatures (draft-cavage, as deployed on the Fediverse).

use std::collections::BTreeMap;
use std::iter::Peekable;
use std::str::Chars;

use anyhow::{Context, Result, anyhow, bail};
use aws_lc_rs::signature::{
    ED25519, RSA_PKCS1_2048_8192_SHA256, RSA_PSS_2048_8192_SHA256, UnparsedPublicKey,
    VerificationAlgorithm,
};
use axum::http::request::Parts;
use axum::http::{HeaderName, HeaderValue, Method};
use base64ct::{Base64, Encoding};
use const_oid::db::rfc5912::RSA_ENCRYPTION;
use const_oid::db::rfc8410::ID_ED_25519;
use jiff::Timestamp;
use reqwest::Url;
use reqwest::header::{self, HeaderMap};
use sha2::{Digest, Sha256, Sha512};
use spki::SubjectPublicKeyInfoRef;
use tracing::{debug, warn};

use super::keys::SigningKey;

const HTTP_DATE_FMT: &str = "%a, %d %b %Y %H:%M:%S GMT";

/// What to sign. `body` is present for POST deliveries.
pub(crate) struct SignRequest<'a> {
    pub(crate) method: &'a Method,
    pub(crate) url: &'a str,
    pub(crate) body: Option<&'a [u8]>,
}

/// Signs with the current time as `Date`.
pub(crate) fn sign_now(key: &SigningKey, request: SignRequest<'_>) -> Result<HeaderMap> {
    sign(key, request, Timestamp::now())
}

/// Builds `Host`, `Date`, `Digest` (when there is a body) and `Signature`
/// headers covering `(request-target) host date [digest]`.
pub(crate) fn sign(key: &SigningKey, request: SignRequest<'_>, date: Timestamp) -> Result<HeaderMap> {
    let url = Url::parse(request.url)?;
    let host = url
        .host_str()
        .context("url should have a host component")?;
    let host = match url.port() {
        Some(port) => format!("{host}:{port}"),
        None => host.to_string(),
    };
    let target = request_target(request.method, url.path(), url.query());
    let date = date.strftime(HTTP_DATE_FMT).to_string();
    let digest = request
        .body
        .map(|body| format!("SHA-256={}", base64_sha256_string(body)));

    let mut sig_body = format!("(request-target): {target}\nhost: {host}\ndate: {date}");
    let mut sig_headers = "(request-target) host date".to_string();
    if let Some(digest) = &digest {
        sig_body.push_str(&format!("\ndigest: {digest}"));
        sig_headers.push_str(" digest");
    }
    let signature = Base64::encode_string(&key.sign(sig_body.as_bytes())?);

    let mut headers = HeaderMap::new();
    headers.insert(header::HOST, host.parse()?);
    headers.insert(header::DATE, date.parse()?);
    if let Some(digest) = digest {
        headers.insert(HeaderName::from_static("digest"), digest.parse()?);
    }
    let key_id = key.key_id();
    headers.insert(
        HeaderName::from_static("signature"),
        HeaderValue::from_str(&format!(
            "keyId=\"{key_id}\",algorithm=\"rsa-sha256\",headers=\"{sig_headers}\",signature=\"{signature}\""
        ))?,
    );
    Ok(headers)
}

fn request_target(method: &Method, path: &str, query: Option<&str>) -> String {
    let method = method.as_str().to_ascii_lowercase();
    match query {
        Some(query) => format!("{method} {path}?{query}"),
        None => format!("{method} {path}"),
    }
}

fn base64_sha256_string(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    Base64::encode_string(hasher.finalize().as_slice())
}

fn base64_sha512_string(bytes: &[u8]) -> String {
    let mut hasher = Sha512::new();
    hasher.update(bytes);
    Base64::encode_string(hasher.finalize().as_slice())
}

/// A public key as published by its owner.
#[derive(Debug, Clone)]
pub(crate) struct PublicKey {
    pub(crate) owner: String,
    pub(crate) pem: String,
}

/// Looks up the key of the actor named by a signature's `keyId`.
pub(crate) trait KeyResolver: Sync {
    fn public_key(&self, actor_iri: &str) -> impl Future<Output = Result<PublicKey>> + Send;
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct Verification {
    pub(crate) verified: bool,
    pub(crate) actor_id: Option<String>,
}

/// Verifies the `Signature` header of an inbound request. Fails closed: any
/// parse error, missing header or key fetch failure yields `verified: false`.
pub(crate) async fn verify<K: KeyResolver>(parts: &Parts, body: &[u8], keys: &K) -> Verification {
    match try_verify(parts, body, keys).await {
        Ok(actor_id) => Verification {
            verified: true,
            actor_id: Some(actor_id),
        },
        Err(error) => {
            debug!(target: "apub", error = format!("{error:#}"), "http signature rejected");
            Verification::default()
        }
    }
}

async fn try_verify<K: KeyResolver>(parts: &Parts, body: &[u8], keys: &K) -> Result<String> {
    let headers = &parts.headers;
    let signature_header = headers
        .get("signature")
        .context("missing signature header")?
        .to_str()?;
    let sig_params = parse_sig_params(signature_header)?;
    if let Some(algorithm) = sig_params.get("algorithm") {
        if !["hs2019", "rsa-sha256"].contains(&algorithm.as_str()) {
            warn!(
                target: "apub",
                algorithm, "unknown http signature algorithm used, verification will likely fail"
            );
        }
    }
    let signature = Base64::decode_vec(sig_params.get("signature").context("missing signature")?)
        .map_err(|e| anyhow!("invalid signature encoding: {e}"))?;
    let sig_headers = match sig_params.get("headers") {
        Some(list) => parse_headers(list)?,
        None => vec!["date".to_string()],
    };
    if sig_headers.is_empty() {
        bail!("empty signed header list");
    }
    let key_id = sig_params.get("keyId").context("missing keyId")?;
    let actor_iri = key_id.split('#').next().unwrap_or(key_id);

    let mut sig_body = String::new();
    for header in &sig_headers {
        match header.as_str() {
            "(request-target)" => {
                let path = parts.uri.path();
                let target = request_target(&parts.method, path, parts.uri.query());
                sig_body.push_str(&format!("(request-target): {target}\n"));
            }
            "(created)" | "(expires)" => {
                let name = header.trim_matches(|c| c == '(' || c == ')');
                let value = sig_params
                    .get(name)
                    .with_context(|| format!("missing {name} parameter"))?;
                sig_body.push_str(&format!("{header}: {value}\n"));
            }
            "digest" => {
                let client_digest = headers
                    .get("digest")
                    .context("missing digest header")?
                    .to_str()?;
                let (alg, _) = client_digest
                    .split_once('=')
                    .context("malformed digest header")?;
                let digest = match alg.to_ascii_lowercase().as_str() {
                    "sha-256" => base64_sha256_string(body),
                    "sha-512" => base64_sha512_string(body),
                    _ => bail!("unsupported digest algorithm {alg}"),
                };
                sig_body.push_str(&format!("digest: {alg}={digest}\n"));
            }
            field => {
                let value = headers
                    .get(field)
                    .with_context(|| format!("missing signed header {field}"))?;
                sig_body.push_str(&format!("{field}: {}\n", value.to_str()?));
            }
        }
    }
    // Remove trailing newline
    let sig_body = sig_body.trim_end_matches('\n');

    let public_key = keys.public_key(actor_iri).await?;
    verify_with_pem(&public_key.pem, sig_body.as_bytes(), &signature)?;
    Ok(public_key.owner)
}

fn verify_with_pem(pem: &str, message: &[u8], signature: &[u8]) -> Result<()> {
    let (label, der) =
        pem_rfc7468::decode_vec(pem.as_bytes()).map_err(|e| anyhow!("invalid pem: {e}"))?;
    if label != "PUBLIC KEY" {
        bail!("unsupported pem label {label}");
    }
    let spki = SubjectPublicKeyInfoRef::try_from(der.as_ref())
        .map_err(|e| anyhow!("invalid public key: {e}"))?;
    let spk = spki
        .subject_public_key
        .as_bytes()
        .context("public key is not byte aligned")?;

    let algorithms: &[&'static dyn VerificationAlgorithm] = match spki.algorithm.oid {
        RSA_ENCRYPTION => &[
            &RSA_PKCS1_2048_8192_SHA256 as &dyn VerificationAlgorithm,
            &RSA_PSS_2048_8192_SHA256 as &dyn VerificationAlgorithm,
        ],
        ID_ED_25519 => &[&ED25519 as &dyn VerificationAlgorithm],
        oid => bail!("unsupported key algorithm {oid}"),
    };
    if !algorithms.iter().any(|&alg| {
        UnparsedPublicKey::new(alg, spk)
            .verify(message, signature)
            .is_ok()
    }) {
        bail!("signature mismatch");
    }
    Ok(())
}

/// Parses `keyId="..",headers="..",signature=".."` into its parameters.
fn parse_sig_params(input: &str) -> Result<BTreeMap<String, String>> {
    let mut params = BTreeMap::new();
    let mut cursor = ParamCursor::new(input);
    while !cursor.at_end() {
        let name = cursor.token()?;
        cursor.expect('=')?;
        let value = if cursor.peek() == Some('"') {
            cursor.quoted()?
        } else {
            cursor.token()?
        };
        params.insert(name, value);
        if !cursor.at_end() {
            cursor.expect(',')?;
        }
    }
    Ok(params)
}

fn parse_headers(input: &str) -> Result<Vec<String>> {
    Ok(input
        .split_ascii_whitespace()
        .map(str::to_ascii_lowercase)
        .collect())
}

/// Walks an auth-param list, skipping whitespace between items.
struct ParamCursor<'a> {
    chars: Peekable<Chars<'a>>,
}

impl<'a> ParamCursor<'a> {
    fn new(input: &'a str) -> ParamCursor<'a> {
        ParamCursor {
            chars: input.chars().peekable(),
        }
    }
    fn skip_whitespace(&mut self) {
        while self.chars.next_if(char::is_ascii_whitespace).is_some() {}
    }
    fn peek(&mut self) -> Option<char> {
        self.skip_whitespace();
        self.chars.peek().copied()
    }
    fn at_end(&mut self) -> bool {
        self.peek().is_none()
    }
    fn expect(&mut self, wanted: char) -> Result<()> {
        match self.peek() {
            Some(c) if c == wanted => {
                self.chars.next();
                Ok(())
            }
            Some(c) => bail!("expected '{wanted}' in signature parameters, found '{c}'"),
            None => bail!("expected '{wanted}' in signature parameters"),
        }
    }
    fn token(&mut self) -> Result<String> {
        self.skip_whitespace();
        let token: String = std::iter::from_fn(|| self.chars.next_if(is_tchar)).collect();
        if token.is_empty() {
            bail!("expected a token in signature parameters");
        }
        Ok(token)
    }
    /// A quoted-string; backslash escapes the next character.
    fn quoted(&mut self) -> Result<String> {
        self.expect('"')?;
        let mut value = String::new();
        loop {
            match self.chars.next() {
                Some('"') => return Ok(value),
                Some('\\') => {
                    if let Some(escaped) = self.chars.next() {
                        value.push(escaped);
                    }
                }
                Some(c) => value.push(c),
                None => bail!("unterminated quoted string in signature parameters"),
            }
        }
    }
}

fn is_tchar(c: &char) -> bool {
    c.is_ascii_alphanumeric() || "!#$%&'*+-.^_`|~".contains(*c)
}

#[cfg(test)]
mod tests {
    use std::sync::LazyLock;

    use anyhow::{Result, bail};
    use axum::http::request::Parts;
    use axum::http::{HeaderMap, Method, Request};
    use jiff::Timestamp;
    use secrecy::ExposeSecret;

    use super::{
        KeyResolver, PublicKey, SignRequest, parse_headers, parse_sig_params, sign, sign_now,
        verify,
    };
    use crate::activity_pub::keys::{KeyMaterial, SigningKey, generate_key_material};

    static KEYS: LazyLock<KeyMaterial> =
        LazyLock::new(|| generate_key_material().expect("key generation"));

    const ALICE: &str = "https://x.example/actors/alice";

    struct StaticKeys;

    impl KeyResolver for StaticKeys {
        async fn public_key(&self, actor_iri: &str) -> Result<PublicKey> {
            if actor_iri != ALICE {
                bail!("unknown actor {actor_iri}");
            }
            Ok(PublicKey {
                owner: ALICE.to_string(),
                pem: KEYS.public_pem.clone(),
            })
        }
    }

    fn signing_key() -> SigningKey {
        SigningKey::from_pem(format!("{ALICE}#main-key"), KEYS.private_pem.expose_secret()).unwrap()
    }

    fn request_parts(method: Method, path: &str, headers: HeaderMap) -> Parts {
        let mut request = Request::builder().method(method).uri(path).body(()).unwrap();
        request.headers_mut().extend(headers);
        request.into_parts().0
    }

    #[test]
    fn test_parse_sig_params() {
        let signature = r#"keyId="id=\"123\"",algorithm="hs2019",
            created=1402170695, expires=1402170995,
            headers="(request-target) (created) (expires)
               host date digest content-length",
            signature="6QQ1ckyr6Tge+t0sBe99S3qyMjW6AF6kLeL7bV6ByzM=""#;
        let params = parse_sig_params(signature).unwrap();

        assert_eq!(params.get("keyId"), Some(&"id=\"123\"".to_string()));
        assert_eq!(params.get("algorithm"), Some(&"hs2019".to_string()));
        assert_eq!(params.get("created"), Some(&"1402170695".to_string()));
        assert_eq!(params.get("expires"), Some(&"1402170995".to_string()));
        assert_eq!(
            params.get("signature"),
            Some(&"6QQ1ckyr6Tge+t0sBe99S3qyMjW6AF6kLeL7bV6ByzM=".to_string())
        );
    }

    #[test]
    fn malformed_sig_params() {
        for input in [
            r#"keyId="https://x/a#main-key"#,
            r#"keyId "https://x/a#main-key""#,
            r#"keyId="a" headers="date""#,
            r#"="a""#,
        ] {
            assert!(parse_sig_params(input).is_err(), "{input}");
        }
        let params = parse_sig_params(r#" keyId = "a\"b" , algorithm=hs2019 "#).unwrap();
        assert_eq!(params["keyId"], "a\"b");
        assert_eq!(params["algorithm"], "hs2019");
    }

    #[test]
    fn test_parse_headers() {
        let input = "(request-target) (created) (expires)\n               host Date digest ";
        let headers = parse_headers(input).unwrap();
        assert_eq!(
            headers,
            vec!["(request-target)", "(created)", "(expires)", "host", "date", "digest"]
        );
    }

    #[test]
    fn signature_header_structure() -> Result<()> {
        let date = Timestamp::from_second(1_700_000_000)?;
        let headers = sign(
            &signing_key(),
            SignRequest {
                method: &Method::POST,
                url: "https://y.example:8443/users/bob/inbox",
                body: Some(b"{}"),
            },
            date,
        )?;
        assert_eq!(headers["host"], "y.example:8443");
        assert_eq!(headers["date"], "Tue, 14 Nov 2023 22:13:20 GMT");
        assert_eq!(
            headers["digest"],
            "SHA-256=RBNvo1WzZ4oRRq0W9+hknpT7T8If536DEMBg9hyq/4o="
        );
        let signature = headers["signature"].to_str()?;
        let params = parse_sig_params(signature)?;
        assert_eq!(params["keyId"], format!("{ALICE}#main-key"));
        assert_eq!(params["algorithm"], "rsa-sha256");
        assert_eq!(params["headers"], "(request-target) host date digest");
        Ok(())
    }

    #[test]
    fn get_requests_sign_without_digest() -> Result<()> {
        let headers = sign_now(
            &signing_key(),
            SignRequest {
                method: &Method::GET,
                url: "https://y.example/users/bob",
                body: None,
            },
        )?;
        assert!(headers.get("digest").is_none());
        let params = parse_sig_params(headers["signature"].to_str()?)?;
        assert_eq!(params["headers"], "(request-target) host date");
        Ok(())
    }

    #[tokio::test]
    async fn sign_then_verify() -> Result<()> {
        for body in [None, Some(&br#"{"type":"Like"}"#[..])] {
            let method = if body.is_some() { Method::POST } else { Method::GET };
            let headers = sign_now(
                &signing_key(),
                SignRequest {
                    method: &method,
                    url: "https://y.example/actors/bob/inbox?x=1",
                    body,
                },
            )?;
            let parts = request_parts(method, "/actors/bob/inbox?x=1", headers);
            let verification = verify(&parts, body.unwrap_or_default(), &StaticKeys).await;
            assert!(verification.verified);
            assert_eq!(verification.actor_id.as_deref(), Some(ALICE));
        }
        Ok(())
    }

    #[tokio::test]
    async fn tampered_body_fails() -> Result<()> {
        let body = br#"{"type":"Like","object":"https://y.example/actors/bob/status/1"}"#;
        let headers = sign_now(
            &signing_key(),
            SignRequest {
                method: &Method::POST,
                url: "https://y.example/actors/bob/inbox",
                body: Some(body),
            },
        )?;
        let parts = request_parts(Method::POST, "/actors/bob/inbox", headers);
        let mut tampered = body.to_vec();
        tampered[3] ^= 0x01;
        let verification = verify(&parts, &tampered, &StaticKeys).await;
        assert!(!verification.verified);
        assert!(verification.actor_id.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn wrong_target_or_missing_header_fails() -> Result<()> {
        let headers = sign_now(
            &signing_key(),
            SignRequest {
                method: &Method::POST,
                url: "https://y.example/actors/bob/inbox",
                body: Some(b"{}"),
            },
        )?;
        let parts = request_parts(Method::POST, "/actors/carol/inbox", headers.clone());
        assert!(!verify(&parts, b"{}", &StaticKeys).await.verified);

        let mut without_date = headers;
        without_date.remove("date");
        let parts = request_parts(Method::POST, "/actors/bob/inbox", without_date);
        assert!(!verify(&parts, b"{}", &StaticKeys).await.verified);

        let parts = request_parts(Method::POST, "/actors/bob/inbox", HeaderMap::new());
        assert!(!verify(&parts, b"{}", &StaticKeys).await.verified);
        Ok(())
    }

    #[tokio::test]
    async fn unknown_key_fails() -> Result<()> {
        let key = SigningKey::from_pem(
            "https://z.example/users/mallory#main-key".to_string(),
            KEYS.private_pem.expose_secret(),
        )?;
        let headers = sign_now(
            &key,
            SignRequest {
                method: &Method::POST,
                url: "https://y.example/actors/bob/inbox",
                body: Some(b"{}"),
            },
        )?;
        let parts = request_parts(Method::POST, "/actors/bob/inbox", headers);
        assert!(!verify(&parts, b"{}", &StaticKeys).await.verified);
        Ok(())
    }
}
