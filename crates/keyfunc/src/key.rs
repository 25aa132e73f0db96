//! Verification keys
//!
//! A [`Key`] is one validated JWK entry: its identifying metadata plus a ready
//! [`DecodingKey`]. The algorithm checks here are the guard against algorithm
//! confusion: a key is only ever handed out for an algorithm its metadata and its
//! key type allow.

use std::fmt;
use std::str::FromStr;

use jsonwebtoken::jwk::{AlgorithmParameters, EllipticCurve, Jwk, PublicKeyUse};
use jsonwebtoken::{Algorithm, DecodingKey};

/// Key type (`kty`)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KeyType {
    /// RSA
    Rsa,
    /// Elliptic curve
    Ec,
    /// Symmetric secret
    Oct,
    /// Octet key pair (Edwards curves)
    Okp,
}

impl fmt::Display for KeyType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kty = match self {
            KeyType::Rsa => "RSA",
            KeyType::Ec => "EC",
            KeyType::Oct => "oct",
            KeyType::Okp => "OKP",
        };
        f.write_str(kty)
    }
}

/// Reason a JWK entry could not become a [`Key`]
#[derive(Debug, thiserror::Error)]
#[error("invalid key material: {0}")]
pub struct InvalidKey(#[from] jsonwebtoken::errors::Error);

/// A verification key taken from a key set
#[derive(Clone)]
pub struct Key {
    kid: Option<String>,
    key_type: KeyType,
    /// `alg` as published, kept as a string so encryption algorithms are still visible
    algorithm: Option<String>,
    key_use: Option<PublicKeyUse>,
    jwk: Jwk,
    decoding_key: DecodingKey,
}

impl fmt::Debug for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Key")
            .field("kid", &self.kid)
            .field("key_type", &self.key_type)
            .field("algorithm", &self.algorithm)
            .field("key_use", &self.key_use)
            .finish_non_exhaustive()
    }
}

impl Key {
    /// Build a key from a parsed JWK, checking the key material is structurally usable
    pub fn from_jwk(jwk: Jwk) -> Result<Self, InvalidKey> {
        let decoding_key = DecodingKey::from_jwk(&jwk)?;

        let key_type = match &jwk.algorithm {
            AlgorithmParameters::RSA(_) => KeyType::Rsa,
            AlgorithmParameters::EllipticCurve(_) => KeyType::Ec,
            AlgorithmParameters::OctetKey(_) => KeyType::Oct,
            AlgorithmParameters::OctetKeyPair(_) => KeyType::Okp,
        };

        let algorithm = jwk
            .common
            .key_algorithm
            .as_ref()
            .and_then(|alg| serde_json::to_value(alg).ok())
            .and_then(|value| value.as_str().map(str::to_owned));

        Ok(Self {
            kid: jwk.common.key_id.clone().filter(|kid| !kid.is_empty()),
            key_type,
            algorithm,
            key_use: jwk.common.public_key_use.clone(),
            jwk,
            decoding_key,
        })
    }

    /// Key id, if the entry carried a non-empty one
    pub fn kid(&self) -> Option<&str> {
        self.kid.as_deref()
    }

    /// Key type
    pub fn key_type(&self) -> KeyType {
        self.key_type
    }

    /// Published algorithm restriction
    pub fn algorithm(&self) -> Option<&str> {
        self.algorithm.as_deref()
    }

    /// Published usage
    pub fn key_use(&self) -> Option<&PublicKeyUse> {
        self.key_use.as_ref()
    }

    /// The JWK this key was built from
    pub fn jwk(&self) -> &Jwk {
        &self.jwk
    }

    /// Key ready to hand to `jsonwebtoken::decode`
    pub fn decoding_key(&self) -> &DecodingKey {
        &self.decoding_key
    }

    /// Whether the key may verify signatures (`use` absent or `sig`)
    pub fn is_signing_key(&self) -> bool {
        matches!(self.key_use, None | Some(PublicKeyUse::Signature))
    }

    /// `use` value for error reporting
    pub(crate) fn key_use_label(&self) -> String {
        match &self.key_use {
            None => "unspecified".to_string(),
            Some(PublicKeyUse::Signature) => "sig".to_string(),
            Some(PublicKeyUse::Encryption) => "enc".to_string(),
            Some(PublicKeyUse::Other(other)) => other.clone(),
        }
    }

    /// What the key permits, for error reporting
    pub(crate) fn permitted_label(&self) -> String {
        match &self.algorithm {
            Some(alg) => alg.clone(),
            None => format!("any {} algorithm", self.key_type),
        }
    }

    /// Whether a token declaring `declared` may be verified with this key.
    ///
    /// Both the published `alg` (when present) and the key type must agree with the
    /// declared algorithm. EC keys additionally need the curve that belongs to it.
    pub fn permits(&self, declared: Algorithm) -> bool {
        if let Some(alg) = &self.algorithm {
            match Algorithm::from_str(alg) {
                Ok(permitted) if permitted == declared => {}
                _ => return false,
            }
        }

        match &self.jwk.algorithm {
            AlgorithmParameters::RSA(_) => matches!(
                declared,
                Algorithm::RS256
                    | Algorithm::RS384
                    | Algorithm::RS512
                    | Algorithm::PS256
                    | Algorithm::PS384
                    | Algorithm::PS512
            ),
            AlgorithmParameters::EllipticCurve(params) => matches!(
                (declared, &params.curve),
                (Algorithm::ES256, EllipticCurve::P256) | (Algorithm::ES384, EllipticCurve::P384)
            ),
            AlgorithmParameters::OctetKey(_) => matches!(
                declared,
                Algorithm::HS256 | Algorithm::HS384 | Algorithm::HS512
            ),
            AlgorithmParameters::OctetKeyPair(params) => {
                declared == Algorithm::EdDSA && matches!(params.curve, EllipticCurve::Ed25519)
            }
        }
    }
}
