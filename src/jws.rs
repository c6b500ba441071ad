use crate::error::*;
use crate::helpers::*;
use openssl::bn::BigNum;
use openssl::bn::BigNumContext;
use openssl::ecdsa::EcdsaSig;
use openssl::hash::hash;
use openssl::hash::MessageDigest;
use openssl::nid::Nid;
use openssl::pkey::Id;
use openssl::pkey::PKey;
use openssl::pkey::Private;
use openssl::sign::Signer;
use serde::Deserialize;
use serde::Serialize;
use serde_json::json;

#[derive(Serialize, Deserialize, Clone, Default)]
struct JwsHeader {
  #[serde(skip_serializing_if = "Option::is_none")]
  nonce: Option<String>,
  alg: String,
  url: String,
  #[serde(skip_serializing_if = "Option::is_none")]
  kid: Option<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  jwk: Option<Jwk>,
}

/// The public half of an account key. Members are declared in lexicographic
/// order, so the serialized form is the canonical RFC 7638 thumbprint input.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(untagged)]
pub enum Jwk {
  Ec {
    crv: String,
    kty: String,
    x: String,
    y: String,
  },
  Rsa {
    e: String,
    kty: String,
    n: String,
  },
}

impl Jwk {
  pub fn new(pkey: &PKey<Private>) -> Result<Jwk, Error> {
    match pkey.id() {
      Id::RSA => {
        let rsa = pkey.rsa()?;
        Ok(Jwk::Rsa {
          e: b64(&rsa.e().to_vec()),
          kty: "RSA".to_string(),
          n: b64(&rsa.n().to_vec()),
        })
      }
      Id::EC => {
        let ec = pkey.ec_key()?;
        let group = ec.group();
        if group.curve_name() != Some(Nid::X9_62_PRIME256V1) {
          return Err(Error::Validation("only P-256 EC keys are supported"));
        }
        let mut ctx = BigNumContext::new()?;
        let mut x = BigNum::new()?;
        let mut y = BigNum::new()?;
        ec.public_key()
          .affine_coordinates_gfp(group, &mut x, &mut y, &mut ctx)?;
        Ok(Jwk::Ec {
          crv: "P-256".to_string(),
          kty: "EC".to_string(),
          x: b64(&x.to_vec_padded(32)?),
          y: b64(&y.to_vec_padded(32)?),
        })
      }
      _ => Err(Error::Validation("unsupported account key type")),
    }
  }

  pub fn thumbprint(&self) -> Result<Thumbprint, Error> {
    let canonical = serde_json::to_string(self)?;
    let digest = hash(MessageDigest::sha256(), canonical.as_bytes())?;
    Ok(Thumbprint(b64(&digest)))
  }
}

/// The base64url encoded SHA-256 thumbprint of an account key, as used in
/// key authorizations.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(transparent)]
pub struct Thumbprint(String);

impl Thumbprint {
  /// Wrap an already computed thumbprint.
  pub fn new(thumbprint: impl Into<String>) -> Self {
    Thumbprint(thumbprint.into())
  }

  pub fn from_private_key(pkey: &PKey<Private>) -> Result<Self, Error> {
    Jwk::new(pkey)?.thumbprint()
  }

  pub fn as_str(&self) -> &str {
    &self.0
  }
}

impl std::fmt::Display for Thumbprint {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.write_str(&self.0)
  }
}

pub(crate) fn jws(
  url: &str,
  nonce: Option<String>,
  payload: &str,
  pkey: &PKey<Private>,
  account_id: Option<&str>,
) -> Result<String, Error> {
  let payload_b64 = b64(payload.as_bytes());

  let alg = match pkey.id() {
    Id::RSA => "RS256",
    Id::EC => "ES256",
    _ => return Err(Error::Validation("unsupported account key type")),
  };

  let mut header = JwsHeader {
    nonce,
    alg: alg.to_string(),
    url: url.to_string(),
    ..Default::default()
  };

  if let Some(kid) = account_id {
    header.kid = Some(kid.to_string());
  } else {
    header.jwk = Some(Jwk::new(pkey)?);
  }

  let protected_b64 = b64(&serde_json::to_string(&header)?.into_bytes());

  let signature_b64 = {
    let mut signer = Signer::new(MessageDigest::sha256(), pkey)?;
    signer
      .update(&format!("{}.{}", protected_b64, payload_b64).into_bytes())?;
    let signature = signer.sign_to_vec()?;
    match pkey.id() {
      // JWS wants the raw r || s form rather than DER.
      Id::EC => {
        let sig = EcdsaSig::from_der(&signature)?;
        let mut raw = sig.r().to_vec_padded(32)?;
        raw.extend(sig.s().to_vec_padded(32)?);
        b64(&raw)
      }
      _ => b64(&signature),
    }
  };

  Ok(serde_json::to_string(&json!({
    "protected": protected_b64,
    "payload": payload_b64,
    "signature": signature_b64
  }))?)
}
