use crate::authorization::AuthorizationStatus;
use crate::authorization::ChallengeStatus;
use crate::authorization::ChallengeType;
use crate::order::OrderStatus;
use serde::Deserialize;
use serde::Serialize;

#[derive(Debug, thiserror::Error)]
pub enum Error {
  #[error("the server returned an order for {actual:?}, expected {expected:?}")]
  DuplicateOrderMismatch {
    expected: Vec<String>,
    actual: Vec<String>,
  },

  #[error("no resolver for challenge type {0}")]
  UnsupportedChallengeType(ChallengeType),

  #[error("challenge token {0:?} is not a base64url token")]
  MalformedToken(String),

  #[error("authorization for {identifier} offers no supported challenge")]
  NoSupportedChallenge { identifier: String },

  #[error("two proofs share the resource path {path}")]
  ProofPathCollision { path: String },

  #[error("challenge for {identifier} was rejected with status {status}")]
  ChallengeRejected {
    identifier: String,
    status: ChallengeStatus,
    error: Option<ServerError>,
  },

  #[error("authorization for {identifier} was rejected with status {status}")]
  AuthorizationRejected {
    identifier: String,
    status: AuthorizationStatus,
  },

  #[error("order was rejected with status {status}")]
  OrderRejected {
    status: OrderStatus,
    error: Option<ServerError>,
  },

  #[error("challenge for {identifier} not valid after {attempts} attempts (last status: {last_status:?})")]
  ChallengeTimeout {
    identifier: String,
    attempts: u32,
    last_status: Option<ChallengeStatus>,
  },

  #[error("authorization for {identifier} not valid after {attempts} attempts (last status: {last_status:?})")]
  AuthorizationTimeout {
    identifier: String,
    attempts: u32,
    last_status: Option<AuthorizationStatus>,
  },

  #[error("order not done after {attempts} attempts (last status: {last_status:?})")]
  OrderTimeout {
    attempts: u32,
    last_status: Option<OrderStatus>,
  },

  #[error("proof at {path} not visible after {attempts} attempts")]
  ProofNotVisible { path: String, attempts: u32 },

  #[error("proof at {path} still visible after {attempts} attempts")]
  ProofStillVisible { path: String, attempts: u32 },

  #[error("the maximum poll attempts ({attempts}) have been exceeded (last state: {last:?})")]
  PollBudgetExhausted { attempts: u32, last: Option<String> },

  #[error("the operation was cancelled")]
  Cancelled,

  #[error("at least one domain name is required")]
  EmptyIdentifiers,

  #[error("invalid domain name {0:?}")]
  InvalidIdentifier(String),

  #[error("csr covers {actual:?} but the order is for {expected:?}")]
  CsrMismatch {
    expected: Vec<String>,
    actual: Vec<String>,
  },

  #[error("validation error: {0}")]
  Validation(&'static str),

  #[error(transparent)]
  Server(#[from] ServerError),

  #[error(transparent)]
  Transport(Box<dyn std::error::Error + Send + Sync>),

  #[error(transparent)]
  Other(Box<dyn std::error::Error + Send + Sync>),
}

impl Error {
  /// Whether this error is one of the poll budget exhaustion errors.
  pub fn is_timeout(&self) -> bool {
    matches!(
      self,
      Error::ChallengeTimeout { .. }
        | Error::AuthorizationTimeout { .. }
        | Error::OrderTimeout { .. }
        | Error::ProofNotVisible { .. }
        | Error::ProofStillVisible { .. }
        | Error::PollBudgetExhausted { .. }
    )
  }

  /// Whether a retry of the same request may succeed. Network failures and
  /// server side (5xx) errors are transient, protocol rejections are not.
  pub fn is_transient(&self) -> bool {
    match self {
      Error::Transport(_) => true,
      Error::Server(err) => err.status.map_or(false, |s| s >= 500),
      _ => false,
    }
  }
}

#[derive(Debug, thiserror::Error)]
#[error("transport error: {0}")]
pub struct TransportError(&'static str);

pub fn transport_err(msg: &'static str) -> Error {
  Error::Transport(Box::new(TransportError(msg)))
}

pub fn map_transport_err<T, E: std::error::Error + Send + Sync + 'static>(
  res: Result<T, E>,
) -> Result<T, Error> {
  res.map_err(|err| Error::Transport(Box::new(err)))
}

impl From<reqwest::Error> for Error {
  fn from(err: reqwest::Error) -> Self {
    // decode failures are not transient
    if err.is_decode() {
      return Self::Other(Box::new(err));
    }
    Self::Transport(Box::new(err))
  }
}

impl From<serde_json::Error> for Error {
  fn from(err: serde_json::Error) -> Self {
    Self::Other(Box::new(err))
  }
}

impl From<openssl::error::ErrorStack> for Error {
  fn from(err: openssl::error::ErrorStack) -> Self {
    Self::Other(Box::new(err))
  }
}

impl From<std::io::Error> for Error {
  fn from(err: std::io::Error) -> Self {
    Self::Other(Box::new(err))
  }
}

/// The result of an operation that can return a [`ServerError`].
#[derive(Deserialize)]
#[serde(rename_all = "camelCase", untagged)]
pub enum ServerResult<T> {
  Ok(T),
  Err(ServerError),
}

impl<T> From<ServerResult<T>> for Result<T, Error> {
  fn from(res: ServerResult<T>) -> Self {
    match res {
      ServerResult::Ok(t) => Ok(t),
      ServerResult::Err(err) => Err(err.into()),
    }
  }
}

/// This is an error as returned by the ACME server.
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[serde(rename_all = "camelCase")]
#[error("ServerError({}): {}: {}", r#type.clone().unwrap_or_default(), title.clone().unwrap_or_default(), detail.clone().unwrap_or_default())]
pub struct ServerError {
  /// The type of this error.
  pub r#type: Option<String>,
  /// The human readable title of this error.
  pub title: Option<String>,
  /// The status code of this error.
  pub status: Option<u16>,
  /// The human readable extra description for this error.
  pub detail: Option<String>,
}

impl ServerError {
  pub(crate) fn is_bad_nonce(&self) -> bool {
    self.r#type.as_deref() == Some("urn:ietf:params:acme:error:badNonce")
  }
}
