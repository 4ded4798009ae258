//! JSON Web Key wire types per RFC 7517.

use serde::{Deserialize, Serialize};

/// JSON Web Key.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Jwk {
    /// Key type (RSA).
    pub kty: String,
    /// Key ID.
    pub kid: String,
    /// Key use (sig).
    #[serde(rename = "use")]
    pub key_use: String,
    /// Algorithm.
    pub alg: String,
    /// RSA modulus, base64url.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub n: Option<String>,
    /// RSA exponent, base64url.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub e: Option<String>,
}

/// JSON Web Key Set.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Jwks {
    /// Array of public keys.
    pub keys: Vec<Jwk>,
}

impl Jwks {
    /// Create an empty JWKS.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a key to the set.
    pub fn add_key(&mut self, key: Jwk) {
        self.keys.push(key);
    }

    /// Find a key by ID.
    #[must_use]
    pub fn find_key(&self, kid: &str) -> Option<&Jwk> {
        self.keys.iter().find(|k| k.kid == kid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_key(kid: &str) -> Jwk {
        Jwk {
            kty: "RSA".to_string(),
            kid: kid.to_string(),
            key_use: "sig".to_string(),
            alg: "RS256".to_string(),
            n: Some("test-n".to_string()),
            e: Some("AQAB".to_string()),
        }
    }

    #[test]
    fn test_find_key() {
        let mut jwks = Jwks::new();
        jwks.add_key(test_key("key-1"));
        jwks.add_key(test_key("key-2"));

        assert!(jwks.find_key("key-1").is_some());
        assert!(jwks.find_key("key-3").is_none());
    }

    #[test]
    fn test_serialization_shape() {
        let mut jwks = Jwks::new();
        jwks.add_key(test_key("key-1"));

        let json = serde_json::to_value(&jwks).unwrap();
        assert!(json["keys"].is_array());
        assert_eq!(json["keys"][0]["use"], "sig");
        assert_eq!(json["keys"][0]["kid"], "key-1");
    }
}
