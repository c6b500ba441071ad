use crate::error::ServerError;
use crate::helpers::Identifier;
use serde::Deserialize;
use serde::Serialize;
use std::fmt;

#[derive(Deserialize, Serialize, Debug, Eq, PartialEq, Clone, Copy)]
#[serde(rename_all = "camelCase")]
/// The status of this authorization. Possible values are "pending",
/// "valid", "invalid", "deactivated", "expired", and "revoked".
pub enum AuthorizationStatus {
  Pending,
  Valid,
  Invalid,
  Deactivated,
  Expired,
  Revoked,
}

impl AuthorizationStatus {
  pub fn as_str(&self) -> &'static str {
    match self {
      AuthorizationStatus::Pending => "pending",
      AuthorizationStatus::Valid => "valid",
      AuthorizationStatus::Invalid => "invalid",
      AuthorizationStatus::Deactivated => "deactivated",
      AuthorizationStatus::Expired => "expired",
      AuthorizationStatus::Revoked => "revoked",
    }
  }
}

impl fmt::Display for AuthorizationStatus {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
/// An ACME authorization object represents a server's authorization
/// for an account to represent an identifier.
pub struct Authorization {
  /// The URL of this authorization. Not part of the server document, filled
  /// in by the transport.
  #[serde(default)]
  pub url: String,

  /// The identifier that the account is authorized to represent.
  pub identifier: Identifier,
  /// The status of this authorization.
  pub status: AuthorizationStatus,
  /// The timestamp after which the server will consider this
  /// authorization invalid.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub expires: Option<String>,
  /// For pending authorizations, the challenges that the client can
  /// fulfill in order to prove possession of the identifier. For
  /// valid authorizations, the challenge that was validated. For
  /// invalid authorizations, the challenge that was attempted and
  /// failed.
  pub challenges: Vec<Challenge>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub wildcard: Option<bool>,
}

impl Authorization {
  /// The first challenge of the given type, if the server offered one.
  pub fn get_challenge(&self, typ: &ChallengeType) -> Option<&Challenge> {
    self.challenges.iter().find(|c| &c.typ == typ)
  }

  /// The challenges this crate can resolve, in server order. Other types
  /// are skipped rather than reported.
  pub fn supported_challenges(&self) -> impl Iterator<Item = &Challenge> {
    self.challenges.iter().filter(|c| c.typ.is_supported())
  }

  pub fn challenge_by_url(&self, url: &str) -> Option<&Challenge> {
    self.challenges.iter().find(|c| c.url == url)
  }

  pub fn is_wildcard(&self) -> bool {
    self.wildcard.unwrap_or(false)
  }
}

#[derive(Deserialize, Serialize, Debug, Eq, PartialEq, Clone, Copy)]
#[serde(rename_all = "camelCase")]
/// The status of this challenge. Possible values are "pending",
/// "processing", "valid", and "invalid".
pub enum ChallengeStatus {
  Pending,
  Processing,
  Valid,
  Invalid,
}

impl ChallengeStatus {
  pub fn as_str(&self) -> &'static str {
    match self {
      ChallengeStatus::Pending => "pending",
      ChallengeStatus::Processing => "processing",
      ChallengeStatus::Valid => "valid",
      ChallengeStatus::Invalid => "invalid",
    }
  }
}

impl fmt::Display for ChallengeStatus {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

/// The type of a challenge. Types this crate does not know about are kept
/// as [`ChallengeType::Other`] so the document still round trips.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Hash)]
#[serde(from = "String", into = "String")]
pub enum ChallengeType {
  Http01,
  Dns01,
  TlsAlpn01,
  Other(String),
}

impl ChallengeType {
  pub fn as_str(&self) -> &str {
    match self {
      ChallengeType::Http01 => "http-01",
      ChallengeType::Dns01 => "dns-01",
      ChallengeType::TlsAlpn01 => "tls-alpn-01",
      ChallengeType::Other(other) => other,
    }
  }

  /// Whether a proof can be derived for this type.
  pub fn is_supported(&self) -> bool {
    matches!(self, ChallengeType::Http01)
  }
}

impl From<String> for ChallengeType {
  fn from(typ: String) -> Self {
    match typ.as_str() {
      "http-01" => ChallengeType::Http01,
      "dns-01" => ChallengeType::Dns01,
      "tls-alpn-01" => ChallengeType::TlsAlpn01,
      _ => ChallengeType::Other(typ),
    }
  }
}

impl From<ChallengeType> for String {
  fn from(typ: ChallengeType) -> Self {
    match typ {
      ChallengeType::Other(other) => other,
      known => known.as_str().to_string(),
    }
  }
}

impl fmt::Display for ChallengeType {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Challenge {
  #[serde(rename = "type")]
  /// The type of challenge encoded in the object.
  pub typ: ChallengeType,
  /// The URL to which a response can be posted.
  pub url: String,
  /// The status of this challenge.
  pub status: ChallengeStatus,
  /// The time at which the server validated this challenge.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub validated: Option<String>,

  /// Error that occurred while the server was validating the
  /// challenge, if any.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub error: Option<ServerError>,

  /// A random value that uniquely identifies the challenge.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub token: Option<String>,
}
