use crate::error::*;
use crate::poll::PollPolicy;
use serde::Deserialize;
use serde::Serialize;
use std::time::Duration;

/// Settings of an [`OrderOrchestrator`](crate::OrderOrchestrator). Can be
/// read from JSON; missing fields take their default.
///
/// ```json
/// {
///   "challengePolicy": { "maxAttempts": 20, "intervalMs": 5000 },
///   "concurrentAuthorizations": false
/// }
/// ```
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase", default)]
pub struct OrchestratorConfig {
  /// Polling of an answered challenge until it is valid.
  pub challenge_policy: PollPolicy,
  /// Polling of an authorization once its challenge is valid.
  pub authorization_policy: PollPolicy,
  /// Polling of the order, both for readiness and for issuance.
  pub order_policy: PollPolicy,
  /// Polling of a published proof until it is observable.
  pub visibility_policy: PollPolicy,
  /// Work on all authorizations of an order at the same time.
  pub concurrent_authorizations: bool,
}

impl Default for OrchestratorConfig {
  fn default() -> Self {
    OrchestratorConfig {
      challenge_policy: PollPolicy::new(20, Duration::from_secs(5)),
      authorization_policy: PollPolicy::new(10, Duration::from_secs(2)),
      order_policy: PollPolicy::new(20, Duration::from_secs(5)),
      visibility_policy: PollPolicy::new(10, Duration::from_secs(1)),
      concurrent_authorizations: true,
    }
  }
}

impl OrchestratorConfig {
  pub fn from_json(json: &str) -> Result<Self, Error> {
    let config: OrchestratorConfig =
      serde_json::from_str(json).map_err(|err| Error::Other(Box::new(err)))?;
    config.validate()?;
    Ok(config)
  }

  pub fn validate(&self) -> Result<(), Error> {
    let policies = [
      self.challenge_policy,
      self.authorization_policy,
      self.order_policy,
      self.visibility_policy,
    ];
    if policies.iter().any(|p| p.max_attempts == 0) {
      return Err(Error::Validation(
        "every poll policy needs at least one attempt",
      ));
    }
    Ok(())
  }
}
