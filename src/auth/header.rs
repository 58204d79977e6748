//! Authorization header parsing for the bearer and Basic schemes.

use axum::http::{header::AUTHORIZATION, HeaderMap};
use base64::{engine::general_purpose::STANDARD, Engine};

use crate::error::{GateError, Scheme};

/// Raw `Authorization` value, if present. Non-visible-ASCII values are malformed.
pub fn authorization(headers: &HeaderMap, scheme: Scheme) -> Result<Option<&str>, GateError> {
    match headers.get(AUTHORIZATION) {
        None => Ok(None),
        Some(value) => value
            .to_str()
            .map(Some)
            .map_err(|_| malformed(scheme, "header is not valid ASCII")),
    }
}

/// `Bearer <token>` -> `<token>`.
pub fn parse_bearer(header: Option<&str>) -> Result<&str, GateError> {
    let token = split_scheme(header, "Bearer", Scheme::Bearer)?;
    if token.is_empty() {
        return Err(malformed(Scheme::Bearer, "token is empty"));
    }
    Ok(token)
}

/// `Basic <base64(user:pass)>` -> `(user, pass)`.
pub fn parse_basic(header: Option<&str>) -> Result<(String, String), GateError> {
    let encoded = split_scheme(header, "Basic", Scheme::Basic)?;

    let decoded = STANDARD
        .decode(encoded)
        .map_err(|_| malformed(Scheme::Basic, "credentials are not valid base64"))?;
    let decoded = String::from_utf8(decoded)
        .map_err(|_| malformed(Scheme::Basic, "credentials are not valid UTF-8"))?;

    let (user, pass) = decoded
        .split_once(':')
        .ok_or_else(|| malformed(Scheme::Basic, "credentials must be user:pass"))?;

    Ok((user.to_string(), pass.to_string()))
}

fn split_scheme<'a>(
    header: Option<&'a str>,
    expected: &str,
    scheme: Scheme,
) -> Result<&'a str, GateError> {
    let header = match header {
        Some(h) if !h.is_empty() => h,
        _ => return Err(GateError::MissingCredentials(scheme)),
    };

    let parts: Vec<&str> = header.split(' ').collect();
    match parts.as_slice() {
        [name, value] if *name == expected => Ok(*value),
        _ => Err(malformed(
            scheme,
            &format!("expected '{expected} <credentials>'"),
        )),
    }
}

fn malformed(scheme: Scheme, reason: &str) -> GateError {
    GateError::MalformedCredentials {
        scheme,
        reason: reason.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn test_bearer_parsing() {
        assert_eq!(parse_bearer(Some("Bearer abc.def.ghi")).unwrap(), "abc.def.ghi");

        assert!(matches!(
            parse_bearer(None),
            Err(GateError::MissingCredentials(Scheme::Bearer))
        ));
        assert!(matches!(
            parse_bearer(Some("")),
            Err(GateError::MissingCredentials(Scheme::Bearer))
        ));

        for bad in ["Token abc", "Bearer", "bearer abc", "Bearer a b", "Bearer "] {
            assert!(
                matches!(
                    parse_bearer(Some(bad)),
                    Err(GateError::MalformedCredentials { .. })
                ),
                "{bad:?} should be malformed"
            );
        }
    }

    #[test]
    fn test_basic_parsing() {
        let encoded = STANDARD.encode("ops:pa:ss");
        let (user, pass) = parse_basic(Some(&format!("Basic {encoded}"))).unwrap();
        assert_eq!(user, "ops");
        assert_eq!(pass, "pa:ss");

        assert!(matches!(
            parse_basic(None),
            Err(GateError::MissingCredentials(Scheme::Basic))
        ));

        let no_colon = STANDARD.encode("opspass");
        for bad in [
            "Basic".to_string(),
            "Basic !!!not-base64!!!".to_string(),
            format!("Basic {no_colon}"),
            format!("Bearer {encoded}"),
        ] {
            assert!(
                matches!(
                    parse_basic(Some(&bad)),
                    Err(GateError::MalformedCredentials {
                        scheme: Scheme::Basic,
                        ..
                    })
                ),
                "{bad:?} should be malformed"
            );
        }
    }

    #[test]
    fn test_authorization_header_lookup() {
        let mut headers = HeaderMap::new();
        assert!(authorization(&headers, Scheme::Bearer).unwrap().is_none());

        headers.insert(AUTHORIZATION, HeaderValue::from_static("Bearer t"));
        assert_eq!(
            authorization(&headers, Scheme::Bearer).unwrap(),
            Some("Bearer t")
        );

        headers.insert(AUTHORIZATION, HeaderValue::from_bytes(b"Bearer \xff").unwrap());
        assert!(authorization(&headers, Scheme::Bearer).is_err());
    }
}
