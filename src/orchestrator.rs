use crate::authorization::*;
use crate::challenge;
use crate::challenge::ChallengeProof;
use crate::config::OrchestratorConfig;
use crate::error::*;
use crate::helpers::DomainNames;
use crate::jws::Thumbprint;
use crate::order::*;
use crate::poll::*;
use crate::publisher::*;
use crate::transport::AcmeTransport;
use futures_util::stream::FuturesUnordered;
use futures_util::StreamExt;
use serde::Deserialize;
use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::debug;
use tracing::field;
use tracing::info;
use tracing::info_span;
use tracing::instrument;
use tracing::warn;
use tracing::Level;
use tracing::Span;
use tracing_futures::Instrument;

/// Everything the workflow has learned about an order so far. Owned by the
/// caller and passed to each step.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct OrderWorkflowState {
  pub order: Order,
  pub authorizations: Vec<Authorization>,
  #[serde(default)]
  pub proofs: Vec<ChallengeProof>,
}

impl OrderWorkflowState {
  pub fn proof_for(&self, authorization_url: &str) -> Option<&ChallengeProof> {
    self
      .proofs
      .iter()
      .find(|p| p.authorization_url == authorization_url)
  }

  /// Whether every authorization of the order has been validated.
  pub fn is_authorized(&self) -> bool {
    self
      .authorizations
      .iter()
      .all(|a| a.status == AuthorizationStatus::Valid)
  }
}

/// A finalized order together with the URL its certificate can be
/// downloaded from.
#[derive(Debug, Clone)]
pub struct Finalized {
  pub order: Order,
  pub certificate_url: String,
}

pub struct OrchestratorBuilder {
  transport: Arc<dyn AcmeTransport>,
  publisher: Arc<dyn ResponsePublisher>,
  probe: Option<Arc<dyn ProofProbe>>,
  config: OrchestratorConfig,
  cancellation: Cancellation,
}

impl OrchestratorBuilder {
  pub fn new(
    transport: Arc<dyn AcmeTransport>,
    publisher: Arc<dyn ResponsePublisher>,
  ) -> Self {
    OrchestratorBuilder {
      transport,
      publisher,
      probe: None,
      config: OrchestratorConfig::default(),
      cancellation: Cancellation::new(),
    }
  }

  pub fn config(&mut self, config: OrchestratorConfig) -> &mut Self {
    self.config = config;
    self
  }

  /// Check that published proofs are observable before answering a
  /// challenge. Without a probe, challenges are answered right after
  /// publishing.
  pub fn probe(&mut self, probe: Arc<dyn ProofProbe>) -> &mut Self {
    self.probe = Some(probe);
    self
  }

  /// Cancelling this (or reaching its deadline) aborts every poll of the
  /// orchestrator with [`Error::Cancelled`].
  pub fn cancellation(&mut self, cancellation: Cancellation) -> &mut Self {
    self.cancellation = cancellation;
    self
  }

  pub fn build(&mut self) -> Result<OrderOrchestrator, Error> {
    self.config.validate()?;
    let thumbprint = self.transport.thumbprint()?;

    Ok(OrderOrchestrator {
      transport: self.transport.clone(),
      publisher: self.publisher.clone(),
      probe: self.probe.clone(),
      config: self.config.clone(),
      cancellation: self.cancellation.clone(),
      thumbprint,
    })
  }
}

/// Drives an ACME order from creation to a downloaded certificate, using
/// HTTP-01 challenges.
///
/// The individual steps are public so a caller can run them one by one
/// against an [`OrderWorkflowState`]; [`OrderOrchestrator::issue`] runs all
/// of them.
pub struct OrderOrchestrator {
  transport: Arc<dyn AcmeTransport>,
  publisher: Arc<dyn ResponsePublisher>,
  probe: Option<Arc<dyn ProofProbe>>,
  config: OrchestratorConfig,
  cancellation: Cancellation,
  thumbprint: Thumbprint,
}

impl OrderOrchestrator {
  pub fn config(&self) -> &OrchestratorConfig {
    &self.config
  }

  pub fn cancellation(&self) -> &Cancellation {
    &self.cancellation
  }

  pub fn thumbprint(&self) -> &Thumbprint {
    &self.thumbprint
  }

  /// Create an order for `names`. Servers may hand back an existing pending
  /// order for the same names instead of a new one; either is accepted as
  /// long as it covers exactly `names`.
  #[instrument(level = Level::INFO, name = "acme2_orchestrator::OrderOrchestrator::create_order", err, skip(self, names), fields(names = ?names.as_slice(), order = field::Empty))]
  pub async fn create_order(
    &self,
    names: &DomainNames,
  ) -> Result<Order, Error> {
    let order = self.transport.create_order(&names.to_identifiers()).await?;

    let actual = order.dns_names();
    if !names.same_set(&actual) {
      return Err(Error::DuplicateOrderMismatch {
        expected: names.as_slice().to_vec(),
        actual,
      });
    }

    Span::current().record("order", &field::display(&order.url));
    Ok(order)
  }

  /// Create the same order again. The server is expected to deduplicate.
  #[instrument(level = Level::INFO, name = "acme2_orchestrator::OrderOrchestrator::create_duplicate_order", err, skip(self, existing), fields(existing = %existing.url))]
  pub async fn create_duplicate_order(
    &self,
    existing: &Order,
  ) -> Result<Order, Error> {
    let names = DomainNames::new(existing.dns_names())?;
    let order = self.create_order(&names).await?;
    if order.url != existing.url {
      debug!(
        { existing = %existing.url, returned = %order.url },
        "Server returned a different order for the same identifiers"
      );
    }
    Ok(order)
  }

  #[instrument(level = Level::INFO, name = "acme2_orchestrator::OrderOrchestrator::authorizations", err, skip(self, order), fields(order = %order.url, authorization_urls = ?order.authorization_urls))]
  pub async fn authorizations(
    &self,
    order: &Order,
  ) -> Result<Vec<Authorization>, Error> {
    let mut authorizations = vec![];
    for url in &order.authorization_urls {
      authorizations.push(self.transport.fetch_authorization(url).await?);
    }
    Ok(authorizations)
  }

  /// Derive the proof for a challenge. Pure; nothing is published.
  pub fn resolve_challenge(
    &self,
    authorization: &Authorization,
    challenge: &Challenge,
  ) -> Result<ChallengeProof, Error> {
    challenge::resolve(authorization, challenge, &self.thumbprint)
  }

  #[instrument(level = Level::INFO, name = "acme2_orchestrator::OrderOrchestrator::publish_proof", err, skip(self, proof), fields(identifier = %proof.identifier, path = %proof.resource_path))]
  pub async fn publish_proof(
    &self,
    proof: &ChallengeProof,
  ) -> Result<(), Error> {
    self
      .publisher
      .publish(
        &proof.resource_path,
        &proof.content_type,
        proof.value.as_bytes(),
      )
      .await
  }

  #[instrument(level = Level::INFO, name = "acme2_orchestrator::OrderOrchestrator::retract_proof", err, skip(self, proof), fields(identifier = %proof.identifier, path = %proof.resource_path))]
  pub async fn retract_proof(
    &self,
    proof: &ChallengeProof,
  ) -> Result<(), Error> {
    self.publisher.retract(&proof.resource_path).await
  }

  /// Wait until the configured probe sees the published proof. Returns
  /// immediately when no probe is configured.
  pub async fn await_proof_visible(
    &self,
    proof: &ChallengeProof,
    policy: &PollPolicy,
  ) -> Result<(), Error> {
    self
      .probe_until(proof, policy, &self.cancellation, ProbeOutcome::Matches)
      .await
  }

  /// Wait until the configured probe no longer finds the proof. Returns
  /// immediately when no probe is configured.
  pub async fn await_proof_retracted(
    &self,
    proof: &ChallengeProof,
    policy: &PollPolicy,
  ) -> Result<(), Error> {
    self
      .probe_until(proof, policy, &self.cancellation, ProbeOutcome::Missing)
      .await
  }

  #[instrument(level = Level::INFO, name = "acme2_orchestrator::OrderOrchestrator::answer_challenge", err, skip(self, authorization, challenge), fields(identifier = %authorization.identifier.value, url = %challenge.url))]
  pub async fn answer_challenge(
    &self,
    authorization: &Authorization,
    challenge: &Challenge,
  ) -> Result<Challenge, Error> {
    self.transport.answer_challenge(authorization, challenge).await
  }

  pub async fn await_challenge_valid(
    &self,
    authorization: &Authorization,
    challenge: &Challenge,
    policy: &PollPolicy,
  ) -> Result<Challenge, Error> {
    self
      .poll_challenge(authorization, challenge, policy, &self.cancellation)
      .await
  }

  pub async fn await_authorization_valid(
    &self,
    authorization: &Authorization,
    policy: &PollPolicy,
  ) -> Result<Authorization, Error> {
    self
      .poll_authorization(authorization, policy, &self.cancellation)
      .await
  }

  /// Wait until the order is ready to be finalized (or already past that).
  #[instrument(level = Level::INFO, name = "acme2_orchestrator::OrderOrchestrator::await_order_ready", err, skip(self, order, policy), fields(order = %order.url))]
  pub async fn await_order_ready(
    &self,
    order: &Order,
    policy: &PollPolicy,
  ) -> Result<Order, Error> {
    let transport = &self.transport;
    let res = poll(policy, &self.cancellation, |attempt| async move {
      match transport.refresh_order(order).await {
        Ok(current) => match current.status {
          OrderStatus::Ready | OrderStatus::Processing | OrderStatus::Valid => {
            PollResult::Done(current)
          }
          OrderStatus::Pending => PollResult::Retry(Some(current.status)),
          status @ OrderStatus::Invalid => PollResult::Fatal(
            Error::OrderRejected {
              status,
              error: current.error,
            },
          ),
        },
        Err(err) if err.is_transient() => {
          warn!(
            { attempt, error = %err },
            "Transient error while polling order"
          );
          PollResult::Retry(None)
        }
        Err(err) => PollResult::Fatal(err),
      }
    })
    .await;

    res.map_err(order_poll_error)
  }

  /// Submit the CSR and wait for the certificate. The order must report
  /// `valid` and carry a certificate URL; some servers report `valid`
  /// before the URL is populated, so both are waited for.
  #[instrument(level = Level::INFO, name = "acme2_orchestrator::OrderOrchestrator::finalize_and_await_certificate", err, skip(self, order, csr, policy), fields(order = %order.url, certificate_url = field::Empty))]
  pub async fn finalize_and_await_certificate(
    &self,
    order: &Order,
    csr: &CertificateRequest,
    policy: &PollPolicy,
  ) -> Result<Finalized, Error> {
    if !csr.matches(order) {
      return Err(Error::CsrMismatch {
        expected: order.dns_names(),
        actual: csr.names().as_slice().to_vec(),
      });
    }

    let finalized = self.transport.finalize_order(order, csr.der()).await?;

    let finalized = &finalized;
    let transport = &self.transport;
    let res = poll(policy, &self.cancellation, |attempt| async move {
      // the finalize response is the first observation
      let current = if attempt == 1 {
        Ok(finalized.clone())
      } else {
        transport.refresh_order(finalized).await
      };

      match current {
        Ok(current) => match (current.status, current.certificate_url.clone()) {
          (OrderStatus::Valid, Some(certificate_url)) => {
            PollResult::Done(Finalized {
              order: current,
              certificate_url,
            })
          }
          (OrderStatus::Valid, None) => {
            debug!("Order is valid, waiting for the certificate URL");
            PollResult::Retry(Some(OrderStatus::Valid))
          }
          (OrderStatus::Pending | OrderStatus::Processing, _) => {
            PollResult::Retry(Some(current.status))
          }
          (status, _) => PollResult::Fatal(Error::OrderRejected {
            status,
            error: current.error,
          }),
        },
        Err(err) if err.is_transient() => {
          warn!(
            { attempt, error = %err },
            "Transient error while polling order"
          );
          PollResult::Retry(None)
        }
        Err(err) => PollResult::Fatal(err),
      }
    })
    .await;

    let finalized = res.map_err(order_poll_error)?;
    Span::current()
      .record("certificate_url", &field::display(&finalized.certificate_url));
    Ok(finalized)
  }

  pub async fn fetch_certificate(&self, url: &str) -> Result<Vec<u8>, Error> {
    self.transport.fetch_certificate(url).await
  }

  /// Create the order and fetch its authorizations.
  pub async fn begin(
    &self,
    names: &DomainNames,
  ) -> Result<OrderWorkflowState, Error> {
    let order = self.create_order(names).await?;
    let authorizations = self.authorizations(&order).await?;
    Ok(OrderWorkflowState {
      order,
      authorizations,
      proofs: vec![],
    })
  }

  /// Derive one proof per authorization that still needs validating, using
  /// the first supported challenge the server offered.
  pub fn prepare_proofs(
    &self,
    state: &mut OrderWorkflowState,
  ) -> Result<(), Error> {
    let mut proofs = vec![];
    let mut paths = HashSet::new();

    for authorization in &state.authorizations {
      match authorization.status {
        AuthorizationStatus::Valid => continue,
        AuthorizationStatus::Pending => {}
        status => {
          return Err(Error::AuthorizationRejected {
            identifier: authorization.identifier.value.clone(),
            status,
          })
        }
      }

      let challenge =
        authorization.supported_challenges().next().ok_or_else(|| {
          Error::NoSupportedChallenge {
            identifier: authorization.identifier.value.clone(),
          }
        })?;
      let proof = self.resolve_challenge(authorization, challenge)?;

      if !paths.insert(proof.resource_path.clone()) {
        return Err(Error::ProofPathCollision {
          path: proof.resource_path,
        });
      }
      proofs.push(proof);
    }

    state.proofs = proofs;
    Ok(())
  }

  /// Publish, answer and poll every pending authorization of `state`. If one
  /// fails the others are cancelled; every published proof is retracted
  /// either way and the first failure is returned.
  #[instrument(level = Level::INFO, name = "acme2_orchestrator::OrderOrchestrator::validate_authorizations", err, skip(self, state), fields(order = %state.order.url))]
  pub async fn validate_authorizations(
    &self,
    state: &mut OrderWorkflowState,
  ) -> Result<(), Error> {
    let mut work = vec![];
    for authorization in &state.authorizations {
      if authorization.status == AuthorizationStatus::Valid {
        continue;
      }
      let proof = state
        .proof_for(&authorization.url)
        .cloned()
        .ok_or(Error::Validation("no proof prepared for an authorization"))?;
      work.push((authorization.clone(), proof));
    }

    let cancellation = self.cancellation.child();
    let mut validated = vec![];
    let mut failure = None;

    if self.config.concurrent_authorizations {
      let mut tasks: FuturesUnordered<_> = work
        .into_iter()
        .map(|(authorization, proof)| {
          let span = info_span!(
            "authorization",
            identifier = %authorization.identifier.value
          );
          self
            .validate_authorization(authorization, proof, cancellation.clone())
            .instrument(span)
        })
        .collect();

      while let Some(res) = tasks.next().await {
        match res {
          Ok(authorization) => validated.push(authorization),
          Err(err) => {
            if failure.is_none() {
              cancellation.cancel();
              failure = Some(err);
            }
          }
        }
      }
    } else {
      for (authorization, proof) in work {
        match self
          .validate_authorization(authorization, proof, cancellation.clone())
          .await
        {
          Ok(authorization) => validated.push(authorization),
          Err(err) => {
            failure = Some(err);
            break;
          }
        }
      }
    }

    if let Some(err) = failure {
      return Err(err);
    }

    for authorization in validated {
      if let Some(slot) = state
        .authorizations
        .iter_mut()
        .find(|a| a.url == authorization.url)
      {
        *slot = authorization;
      }
    }
    Ok(())
  }

  /// Run the whole lifecycle for `names` and return the issued certificate.
  #[instrument(level = Level::INFO, name = "acme2_orchestrator::OrderOrchestrator::issue", err, skip(self, names, csr), fields(names = ?names.as_slice(), order = field::Empty))]
  pub async fn issue(
    &self,
    names: &DomainNames,
    csr: &CertificateRequest,
  ) -> Result<IssuedCertificate, Error> {
    if !csr.names().same_set(names.as_slice()) {
      return Err(Error::CsrMismatch {
        expected: names.as_slice().to_vec(),
        actual: csr.names().as_slice().to_vec(),
      });
    }

    let mut state = self.begin(names).await?;
    Span::current().record("order", &field::display(&state.order.url));

    self.prepare_proofs(&mut state)?;
    self.validate_authorizations(&mut state).await?;

    let order = self
      .await_order_ready(&state.order, &self.config.order_policy)
      .await?;
    let finalized = self
      .finalize_and_await_certificate(&order, csr, &self.config.order_policy)
      .await?;
    let pem = self.fetch_certificate(&finalized.certificate_url).await?;

    info!(certificate_url = %finalized.certificate_url, "Certificate issued");
    Ok(IssuedCertificate {
      order: finalized.order,
      certificate_url: finalized.certificate_url,
      pem,
    })
  }

  async fn validate_authorization(
    &self,
    authorization: Authorization,
    proof: ChallengeProof,
    cancellation: Cancellation,
  ) -> Result<Authorization, Error> {
    let challenge = authorization
      .challenge_by_url(&proof.challenge_url)
      .ok_or(Error::Validation("proof does not belong to the authorization"))?;

    let result = async {
      self.publish_proof(&proof).await?;
      self
        .probe_until(
          &proof,
          &self.config.visibility_policy,
          &cancellation,
          ProbeOutcome::Matches,
        )
        .await?;
      let answered = self.answer_challenge(&authorization, challenge).await?;
      self
        .poll_challenge(
          &authorization,
          &answered,
          &self.config.challenge_policy,
          &cancellation,
        )
        .await?;
      self
        .poll_authorization(
          &authorization,
          &self.config.authorization_policy,
          &cancellation,
        )
        .await
    }
    .await;

    let retracted = self.retract_proof(&proof).await;

    match (result, retracted) {
      (Ok(authorization), Ok(())) => Ok(authorization),
      (Ok(_), Err(err)) => Err(err),
      (Err(err), Ok(())) => Err(err),
      (Err(err), Err(retract_err)) => {
        warn!(
          { path = %proof.resource_path, error = %retract_err },
          "Failed to retract challenge response"
        );
        Err(err)
      }
    }
  }

  async fn poll_challenge(
    &self,
    authorization: &Authorization,
    challenge: &Challenge,
    policy: &PollPolicy,
    cancellation: &Cancellation,
  ) -> Result<Challenge, Error> {
    let identifier = authorization.identifier.value.as_str();
    let transport = &self.transport;

    let res = poll(policy, cancellation, |attempt| async move {
      match transport.refresh_challenge(authorization, challenge).await {
        Ok(current) => match current.status {
          ChallengeStatus::Valid => PollResult::Done(current),
          ChallengeStatus::Pending | ChallengeStatus::Processing => {
            PollResult::Retry(Some(current.status))
          }
          status @ ChallengeStatus::Invalid => {
            PollResult::Fatal(Error::ChallengeRejected {
              identifier: identifier.to_string(),
              status,
              error: current.error,
            })
          }
        },
        Err(err) if err.is_transient() => {
          warn!(
            { attempt, identifier, error = %err },
            "Transient error while polling challenge"
          );
          PollResult::Retry(None)
        }
        Err(err) => PollResult::Fatal(err),
      }
    })
    .await;

    res.map_err(|err| match err {
      PollError::Exhausted { attempts, last } => Error::ChallengeTimeout {
        identifier: identifier.to_string(),
        attempts,
        last_status: last,
      },
      PollError::Cancelled => Error::Cancelled,
      PollError::Fatal(err) => err,
    })
  }

  async fn poll_authorization(
    &self,
    authorization: &Authorization,
    policy: &PollPolicy,
    cancellation: &Cancellation,
  ) -> Result<Authorization, Error> {
    let identifier = authorization.identifier.value.as_str();
    let transport = &self.transport;

    let res = poll(policy, cancellation, |attempt| async move {
      match transport.refresh_authorization(authorization).await {
        Ok(current) => match current.status {
          AuthorizationStatus::Valid => PollResult::Done(current),
          AuthorizationStatus::Pending => {
            PollResult::Retry(Some(current.status))
          }
          status => PollResult::Fatal(Error::AuthorizationRejected {
            identifier: identifier.to_string(),
            status,
          }),
        },
        Err(err) if err.is_transient() => {
          warn!(
            { attempt, identifier, error = %err },
            "Transient error while polling authorization"
          );
          PollResult::Retry(None)
        }
        Err(err) => PollResult::Fatal(err),
      }
    })
    .await;

    res.map_err(|err| match err {
      PollError::Exhausted { attempts, last } => Error::AuthorizationTimeout {
        identifier: identifier.to_string(),
        attempts,
        last_status: last,
      },
      PollError::Cancelled => Error::Cancelled,
      PollError::Fatal(err) => err,
    })
  }

  async fn probe_until(
    &self,
    proof: &ChallengeProof,
    policy: &PollPolicy,
    cancellation: &Cancellation,
    wanted: ProbeOutcome,
  ) -> Result<(), Error> {
    let probe = match &self.probe {
      Some(probe) => probe,
      None => return Ok(()),
    };

    let res = poll(policy, cancellation, |attempt| async move {
      match probe.probe(proof).await {
        Ok(outcome) if outcome == wanted => PollResult::Done(()),
        Ok(outcome) => PollResult::Retry(Some(outcome)),
        Err(err) => {
          debug!(
            { attempt, error = %err },
            "Probing challenge response failed"
          );
          PollResult::Retry(None)
        }
      }
    })
    .await;

    res.map_err(|err| match err {
      PollError::Exhausted { attempts, .. } => match wanted {
        ProbeOutcome::Missing => Error::ProofStillVisible {
          path: proof.resource_path.clone(),
          attempts,
        },
        _ => Error::ProofNotVisible {
          path: proof.resource_path.clone(),
          attempts,
        },
      },
      PollError::Cancelled => Error::Cancelled,
      PollError::Fatal(err) => err,
    })
  }
}

fn order_poll_error(err: PollError<OrderStatus>) -> Error {
  match err {
    PollError::Exhausted { attempts, last } => Error::OrderTimeout {
      attempts,
      last_status: last,
    },
    PollError::Cancelled => Error::Cancelled,
    PollError::Fatal(err) => err,
  }
}
