mod fetch_cache;
mod oidc;
mod store;

use anyhow::Result;
use aws_lc_rs::rand::{SecureRandom, SystemRandom};
use base64ct::{Base64UrlUnpadded, Encoding};

pub(crate) use fetch_cache::FetchCache;
pub(crate) use oidc::{IdentityProvider, OidcProvider, TokenSet, pkce, web_id_from_id_token};
pub(crate) use store::{PendingSession, Session, SessionStore};

/// An unguessable URL-safe token: session ids, OAuth state, PKCE verifiers.
pub(crate) fn random_token() -> Result<String> {
    let mut bytes = [0u8; 32];
    SystemRandom::new().fill(&mut bytes)?;
    Ok(Base64UrlUnpadded::encode_string(&bytes))
}

#[cfg(test)]
mod tests {
    use anyhow::Result;

    use super::random_token;

    #[test]
    fn tokens_are_distinct_and_url_safe() -> Result<()> {
        let a = random_token()?;
        let b = random_token()?;
        assert_ne!(a, b);
        assert_eq!(a.len(), 43);
        assert!(
            a.chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        );
        Ok(())
    }
}
