//! Expiry extraction from session tokens
//!
//! Signatures are not verified; the backend issued the token over the
//! authenticated channel and only the `exp` claim is needed for refresh timing.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use serde::Deserialize;

#[derive(Debug, Deserialize)]
struct Claims {
    exp: i64,
}

/// Read the `exp` claim (epoch seconds) of a JWT
pub fn parse_expiry(token: &str) -> Result<i64, String> {
    let mut parts = token.split('.');
    let payload = match (parts.next(), parts.next(), parts.next()) {
        (Some(_), Some(payload), Some(_)) => payload,
        _ => return Err("token is not a three-part JWT".to_string()),
    };

    let decoded = URL_SAFE_NO_PAD
        .decode(payload.trim_end_matches('='))
        .map_err(|e| format!("token payload is not base64url: {e}"))?;
    let claims: Claims = serde_json::from_slice(&decoded)
        .map_err(|e| format!("token payload has no usable exp claim: {e}"))?;

    Ok(claims.exp)
}

#[cfg(test)]
pub(crate) fn encode_test_token(exp: i64) -> String {
    let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"HS256","typ":"JWT"}"#);
    let payload = URL_SAFE_NO_PAD.encode(format!(r#"{{"role":"user","exp":{exp}}}"#));
    format!("{header}.{payload}.c2lnbmF0dXJl")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_expiry() {
        let token = encode_test_token(1_700_000_000);
        assert_eq!(parse_expiry(&token), Ok(1_700_000_000));
    }

    #[test]
    fn test_padded_payload_is_accepted() {
        let header = URL_SAFE_NO_PAD.encode(b"{}");
        let payload = format!("{}==", URL_SAFE_NO_PAD.encode(br#"{"exp":42}"#));
        assert_eq!(parse_expiry(&format!("{header}.{payload}.sig")), Ok(42));
    }

    #[test]
    fn test_malformed_tokens() {
        assert!(parse_expiry("").is_err());
        assert!(parse_expiry("only.two").is_err());
        assert!(parse_expiry("a.!!!.c").is_err());

        let no_exp = format!("a.{}.c", URL_SAFE_NO_PAD.encode(br#"{"sub":"x"}"#));
        assert!(parse_expiry(&no_exp).is_err());
    }
}
