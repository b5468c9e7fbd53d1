//! Capability-token parsing.
//!
//! A permission grant arrives as one string of the form
//! `"<host:port> id#seq"`: the address of the claimed execution host,
//! a space, then the capability token. The claim-id — the key the match
//! table is indexed by — is the token's prefix before the `#`; the
//! suffix is a per-grant nonce the host verifies but the scheduler never
//! interprets.

use crate::error::{WireError, WireResult};

/// A parsed permission grant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClaimToken {
    /// Address of the claimed host, without the angle brackets.
    pub peer: String,
    /// Match-table key: token prefix before `#`.
    pub claim_id: String,
    /// The full capability token (`id#seq`), passed through to the host
    /// and the shadow verbatim.
    pub token: String,
}

impl ClaimToken {
    /// Parse a grant string.
    pub fn parse(grant: &str) -> WireResult<Self> {
        let grant = grant.trim();
        let (peer, token) = grant
            .split_once(' ')
            .ok_or_else(|| WireError::MalformedClaim(grant.to_string()))?;

        let peer = peer
            .strip_prefix('<')
            .and_then(|p| p.strip_suffix('>'))
            .unwrap_or(peer);
        if peer.is_empty() || token.is_empty() {
            return Err(WireError::MalformedClaim(grant.to_string()));
        }

        let claim_id = match token.split_once('#') {
            Some((id, _)) => id,
            None => token,
        };
        if claim_id.is_empty() {
            return Err(WireError::MalformedClaim(grant.to_string()));
        }

        Ok(Self {
            peer: peer.to_string(),
            claim_id: claim_id.to_string(),
            token: token.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_bracketed_grant() {
        let claim = ClaimToken::parse("<10.0.0.7:9618> T#cap").unwrap();
        assert_eq!(claim.peer, "10.0.0.7:9618");
        assert_eq!(claim.claim_id, "T");
        assert_eq!(claim.token, "T#cap");
    }

    #[test]
    fn parses_unbracketed_peer() {
        let claim = ClaimToken::parse("10.0.0.7:9618 abc123#9f").unwrap();
        assert_eq!(claim.peer, "10.0.0.7:9618");
        assert_eq!(claim.claim_id, "abc123");
    }

    #[test]
    fn token_without_nonce_is_its_own_claim_id() {
        let claim = ClaimToken::parse("<h:1> tok").unwrap();
        assert_eq!(claim.claim_id, "tok");
        assert_eq!(claim.token, "tok");
    }

    #[test]
    fn missing_token_is_malformed() {
        assert!(ClaimToken::parse("<10.0.0.7:9618>").is_err());
        assert!(ClaimToken::parse("").is_err());
        assert!(ClaimToken::parse("<h:1> ").is_err());
    }
}
