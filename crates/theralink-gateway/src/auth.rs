use jsonwebtoken::{DecodingKey, Validation, decode};

use theralink_types::api::Claims;

/// Verify a session token issued by the identity provider and return its claims.
pub fn decode_claims(token: &str, secret: &str) -> Result<Claims, jsonwebtoken::errors::Error> {
    decode::<Claims>(
        token,
        &DecodingKey::from_secret(secret.as_bytes()),
        &Validation::default(),
    )
    .map(|data| data.claims)
}
