//! Derivation of the proof artifacts that satisfy a challenge.

use crate::authorization::Authorization;
use crate::authorization::Challenge;
use crate::authorization::ChallengeType;
use crate::error::*;
use crate::jws::Thumbprint;
use serde::Deserialize;
use serde::Serialize;

/// Path prefix under which HTTP-01 responses are served.
pub const HTTP01_PATH_PREFIX: &str = "/.well-known/acme-challenge/";

/// Media type of an HTTP-01 response.
pub const HTTP01_CONTENT_TYPE: &str = "text/plain";

/// Everything needed to publish the response to one challenge and to find
/// it again for retraction.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ChallengeProof {
  pub challenge_type: ChallengeType,
  /// The DNS name the proof is for.
  pub identifier: String,
  pub authorization_url: String,
  pub challenge_url: String,
  pub token: String,
  /// Where the validating server will fetch the proof.
  pub resource_url: String,
  pub resource_path: String,
  pub content_type: String,
  /// The key authorization the server expects to read.
  pub value: String,
}

/// Derive the proof for `challenge`, dispatching on its type.
pub fn resolve(
  authorization: &Authorization,
  challenge: &Challenge,
  thumbprint: &Thumbprint,
) -> Result<ChallengeProof, Error> {
  match &challenge.typ {
    ChallengeType::Http01 => {
      resolve_http01(authorization, challenge, thumbprint)
    }
    other => Err(Error::UnsupportedChallengeType(other.clone())),
  }
}

/// Derive the HTTP-01 proof: the key authorization `token.thumbprint`
/// served as plain text at `/.well-known/acme-challenge/<token>`.
pub fn resolve_http01(
  authorization: &Authorization,
  challenge: &Challenge,
  thumbprint: &Thumbprint,
) -> Result<ChallengeProof, Error> {
  if challenge.typ != ChallengeType::Http01 {
    return Err(Error::UnsupportedChallengeType(challenge.typ.clone()));
  }
  if authorization.is_wildcard() {
    return Err(Error::Validation(
      "http-01 cannot prove control of a wildcard identifier",
    ));
  }

  let token = challenge.token.as_deref().unwrap_or_default();
  validate_token(token)?;

  let identifier = authorization.identifier.value.clone();
  let resource_path = format!("{}{}", HTTP01_PATH_PREFIX, token);

  Ok(ChallengeProof {
    challenge_type: ChallengeType::Http01,
    resource_url: format!("http://{}{}", identifier, resource_path),
    identifier,
    authorization_url: authorization.url.clone(),
    challenge_url: challenge.url.clone(),
    token: token.to_string(),
    resource_path,
    content_type: HTTP01_CONTENT_TYPE.to_string(),
    value: key_authorization(token, thumbprint),
  })
}

pub fn key_authorization(token: &str, thumbprint: &Thumbprint) -> String {
  format!("{}.{}", token, thumbprint)
}

/// Tokens end up in a URL path and a file name, so only the base64url
/// alphabet is accepted.
pub fn validate_token(token: &str) -> Result<(), Error> {
  let valid = !token.is_empty()
    && token
      .bytes()
      .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_');
  if valid {
    Ok(())
  } else {
    Err(Error::MalformedToken(token.to_string()))
  }
}
