//! AWS Signature Version 4 for single-chunk requests.

use chrono::{DateTime, Utc};

use crate::credentials::AwsCredentials;
use crate::security::{hmac_sha256, sha256_hex};

const ALGORITHM: &str = "AWS4-HMAC-SHA256";

pub struct SigningRequest<'a> {
    pub method: &'a str,
    pub path: &'a str,
    pub query: &'a str,
    /// Every header to sign, including `host` and `x-amz-date`.
    pub headers: &'a [(&'a str, String)],
    pub payload: &'a [u8],
}

pub struct Scope<'a> {
    pub region: &'a str,
    pub service: &'a str,
    pub time: DateTime<Utc>,
}

pub fn amz_date(time: DateTime<Utc>) -> String {
    time.format("%Y%m%dT%H%M%SZ").to_string()
}

/// Value of the `Authorization` header for `request`.
pub fn authorization(
    request: &SigningRequest<'_>,
    scope: &Scope<'_>,
    credentials: &AwsCredentials,
) -> String {
    let (signed_headers, signature) = sign(request, scope, credentials.secret_access_key.expose());
    format!(
        "{ALGORITHM} Credential={}/{}, SignedHeaders={signed_headers}, Signature={signature}",
        credentials.access_key_id,
        credential_scope(scope)
    )
}

fn credential_scope(scope: &Scope<'_>) -> String {
    format!(
        "{}/{}/{}/aws4_request",
        scope.time.format("%Y%m%d"),
        scope.region,
        scope.service
    )
}

fn canonical_request(request: &SigningRequest<'_>) -> (String, String) {
    let mut headers: Vec<(String, String)> = request
        .headers
        .iter()
        .map(|(name, value)| (name.to_ascii_lowercase(), collapse_whitespace(value)))
        .collect();
    headers.sort();

    let canonical_headers: String = headers
        .iter()
        .map(|(name, value)| format!("{name}:{value}\n"))
        .collect();
    let signed_headers = headers
        .iter()
        .map(|(name, _)| name.as_str())
        .collect::<Vec<_>>()
        .join(";");

    let canonical = format!(
        "{}\n{}\n{}\n{canonical_headers}\n{signed_headers}\n{}",
        request.method,
        request.path,
        request.query,
        sha256_hex(request.payload)
    );
    (canonical, signed_headers)
}

fn sign(request: &SigningRequest<'_>, scope: &Scope<'_>, secret: &str) -> (String, String) {
    let (canonical, signed_headers) = canonical_request(request);
    let string_to_sign = format!(
        "{ALGORITHM}\n{}\n{}\n{}",
        amz_date(scope.time),
        credential_scope(scope),
        sha256_hex(canonical.as_bytes())
    );

    let date = scope.time.format("%Y%m%d").to_string();
    let k_date = hmac_sha256(format!("AWS4{secret}").as_bytes(), date.as_bytes());
    let k_region = hmac_sha256(&k_date, scope.region.as_bytes());
    let k_service = hmac_sha256(&k_region, scope.service.as_bytes());
    let k_signing = hmac_sha256(&k_service, b"aws4_request");

    let signature = hex::encode(hmac_sha256(&k_signing, string_to_sign.as_bytes()));
    (signed_headers, signature)
}

fn collapse_whitespace(value: &str) -> String {
    value.split_whitespace().collect::<Vec<_>>().join(" ")
}
