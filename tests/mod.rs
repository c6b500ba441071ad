use crate::common::fake_acme::*;
use crate::common::recording::*;
use acme2_orchestrator::*;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;


struct Harness {
  acme: Arc<FakeAcme>,
  publisher: Arc<RecordingPublisher>,
  events: EventLog,
}

fn harness() -> Harness {
  let events = EventLog::default();
  Harness {
    acme: Arc::new(FakeAcme::new(events.clone())),
    publisher: Arc::new(RecordingPublisher::new(events.clone())),
    events,
  }
}

impl Harness {
  fn builder(&self) -> OrchestratorBuilder {
    let mut builder =
      OrchestratorBuilder::new(self.acme.clone(), self.publisher.clone());
    builder.config(fast_config());
    builder
  }

  fn orchestrator(&self) -> OrderOrchestrator {
    self.builder().build().unwrap()
  }
}

fn secs(secs: u64) -> Duration {
  Duration::from_secs(secs)
}

fn fast_config() -> OrchestratorConfig {
  OrchestratorConfig {
    challenge_policy: PollPolicy::new(5, secs(1)),
    authorization_policy: PollPolicy::new(3, secs(1)),
    order_policy: PollPolicy::new(5, secs(1)),
    visibility_policy: PollPolicy::new(5, secs(1)),
    concurrent_authorizations: true,
  }
}

fn names(names: &[&str]) -> DomainNames {
  DomainNames::new(names).unwrap()
}

fn csr(names: &DomainNames) -> CertificateRequest {
  let pkey = gen_ec_p256_private_key().unwrap();
  CertificateRequest::generate(&pkey, names).unwrap()
}

fn pending_then(status: ChallengeStatus, pending: usize) -> Vec<Step> {
  let mut steps = vec![Step::Status(ChallengeStatus::Pending); pending];
  steps.push(Step::Status(status));
  steps
}

#[tokio::test(start_paused = true)]
async fn test_duplicate_order_is_equivalent() {
  let h = harness();
  let orchestrator = h.orchestrator();

  let first = orchestrator
    .create_order(&names(&["b.example.com", "a.example.com"]))
    .await
    .unwrap();
  let second = orchestrator
    .create_order(&names(&["a.example.com", "b.example.com"]))
    .await
    .unwrap();
  assert_eq!(first.url, second.url);
  assert_eq!(first.status, OrderStatus::Pending);

  let duplicate = orchestrator.create_duplicate_order(&first).await.unwrap();
  assert_eq!(duplicate.url, first.url);
  assert_eq!(duplicate.dns_names(), vec!["a.example.com", "b.example.com"]);
  assert_eq!(h.events.count("create_order"), 3);
}

#[tokio::test(start_paused = true)]
async fn test_duplicate_order_mismatch() {
  let h = harness();
  h.acme.rewrite_identifiers(&["other.example.com"]);
  let orchestrator = h.orchestrator();

  let err = orchestrator
    .create_order(&names(&["a.example.com"]))
    .await
    .unwrap_err();
  match err {
    Error::DuplicateOrderMismatch { expected, actual } => {
      assert_eq!(expected, vec!["a.example.com"]);
      assert_eq!(actual, vec!["other.example.com"]);
    }
    err => panic!("unexpected error: {:?}", err),
  }
}

#[tokio::test(start_paused = true)]
async fn test_prepared_proof_is_key_authorization() {
  let h = harness();
  h.acme.offer(
    "a.example.com",
    vec![ChallengeType::Dns01, ChallengeType::Http01],
  );
  let orchestrator = h.orchestrator();

  let mut state = orchestrator
    .begin(&names(&["a.example.com"]))
    .await
    .unwrap();
  orchestrator.prepare_proofs(&mut state).unwrap();

  let proof = state
    .proof_for(&authorization_url("a.example.com"))
    .unwrap();
  assert_eq!(proof.challenge_type, ChallengeType::Http01);
  assert_eq!(proof.token, token("a.example.com"));
  assert_eq!(
    proof.value,
    format!("{}.{}", token("a.example.com"), FAKE_THUMBPRINT)
  );
  assert_eq!(proof.resource_path, proof_path("a.example.com"));
  assert_eq!(
    proof.resource_url,
    format!("http://a.example.com{}", proof_path("a.example.com"))
  );
  assert_eq!(proof.content_type, "text/plain");

  // nothing is published before validation starts
  assert!(h.publisher.store().is_empty());

  let json = serde_json::to_string(&state).unwrap();
  let restored: OrderWorkflowState = serde_json::from_str(&json).unwrap();
  assert_eq!(restored.proofs, state.proofs);
  assert_eq!(restored.order, state.order);
}

#[tokio::test(start_paused = true)]
async fn test_issue_happy_path() {
  let h = harness();
  h.acme.script_challenge(
    "a.example.com",
    pending_then(ChallengeStatus::Valid, 2),
  );
  h.acme.script_finalize(vec![
    (OrderStatus::Processing, false),
    (OrderStatus::Valid, true),
  ]);
  let orchestrator = h.orchestrator();
  let names = names(&["a.example.com"]);

  let start = Instant::now();
  let issued = orchestrator.issue(&names, &csr(&names)).await.unwrap();

  // two intervals waiting for the challenge, one for the certificate
  assert_eq!(start.elapsed(), secs(3));
  assert_eq!(issued.pem, CERTIFICATE_PEM);
  assert_eq!(issued.order.status, OrderStatus::Valid);
  assert_eq!(
    Some(issued.certificate_url.as_str()),
    issued.order.certificate_url()
  );

  assert_eq!(h.events.count("publish:"), 1);
  assert_eq!(h.events.count("retract:"), 1);
  assert_eq!(h.events.count("poll_challenge:a.example.com"), 3);
  assert_eq!(h.events.count("finalize"), 1);
  assert!(h.publisher.store().is_empty());

  let publish = h.events.position("publish:").unwrap();
  let answer = h.events.position("answer:a.example.com:http-01").unwrap();
  let retract = h.events.position("retract:").unwrap();
  let finalize = h.events.position("finalize").unwrap();
  let fetch = h.events.position("fetch_certificate:").unwrap();
  assert!(publish < answer);
  assert!(answer < retract);
  assert!(retract < finalize);
  assert!(finalize < fetch);
}

#[tokio::test(start_paused = true)]
async fn test_challenge_invalid_stops_workflow() {
  let h = harness();
  h.acme.script_challenge(
    "a.example.com",
    pending_then(ChallengeStatus::Invalid, 1),
  );
  let orchestrator = h.orchestrator();
  let names = names(&["a.example.com"]);

  let start = Instant::now();
  let err = orchestrator.issue(&names, &csr(&names)).await.unwrap_err();

  assert_eq!(start.elapsed(), secs(1));
  match err {
    Error::ChallengeRejected {
      identifier,
      status,
      error,
    } => {
      assert_eq!(identifier, "a.example.com");
      assert_eq!(status, ChallengeStatus::Invalid);
      assert_eq!(error.unwrap().status, Some(403));
    }
    err => panic!("unexpected error: {:?}", err),
  }
  assert_eq!(h.events.count("poll_challenge:"), 2);
  assert_eq!(h.events.count("retract:"), 1);
  assert_eq!(h.events.count("finalize"), 0);
  assert!(h.publisher.store().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_authorizations_run_concurrently() {
  let h = harness();
  for name in ["a.example.com", "b.example.com"] {
    h.acme
      .script_challenge(name, pending_then(ChallengeStatus::Valid, 1));
  }
  let orchestrator = h.orchestrator();
  let names = names(&["a.example.com", "b.example.com"]);

  let start = Instant::now();
  orchestrator.issue(&names, &csr(&names)).await.unwrap();

  assert_eq!(start.elapsed(), secs(1));
  assert_eq!(h.events.count("publish:"), 2);
  assert_eq!(h.events.count("retract:"), 2);
}

#[tokio::test(start_paused = true)]
async fn test_authorizations_run_sequentially() {
  let h = harness();
  for name in ["a.example.com", "b.example.com"] {
    h.acme
      .script_challenge(name, pending_then(ChallengeStatus::Valid, 1));
  }
  let mut config = fast_config();
  config.concurrent_authorizations = false;
  let orchestrator = h.builder().config(config).build().unwrap();
  let names = names(&["a.example.com", "b.example.com"]);

  let start = Instant::now();
  orchestrator.issue(&names, &csr(&names)).await.unwrap();

  assert_eq!(start.elapsed(), secs(2));
  let retract_a = h
    .events
    .position(&format!("retract:{}", proof_path("a.example.com")))
    .unwrap();
  let publish_b = h
    .events
    .position(&format!("publish:{}", proof_path("b.example.com")))
    .unwrap();
  assert!(retract_a < publish_b);
}

#[tokio::test(start_paused = true)]
async fn test_one_failed_authorization_cancels_the_others() {
  let h = harness();
  h.acme.script_challenge(
    "a.example.com",
    pending_then(ChallengeStatus::Valid, 3),
  );
  h.acme.script_challenge(
    "b.example.com",
    pending_then(ChallengeStatus::Invalid, 1),
  );
  let orchestrator = h.orchestrator();
  let names = names(&["a.example.com", "b.example.com"]);

  let start = Instant::now();
  let err = orchestrator.issue(&names, &csr(&names)).await.unwrap_err();

  assert_eq!(start.elapsed(), secs(1));
  assert!(
    matches!(
      &err,
      Error::ChallengeRejected { identifier, .. }
        if identifier == "b.example.com"
    ),
    "unexpected error: {:?}",
    err
  );
  assert_eq!(h.events.count("publish:"), 2);
  assert_eq!(h.events.count("retract:"), 2);
  assert_eq!(h.events.count("finalize"), 0);
  assert!(h.publisher.store().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_authorization_lags_behind_challenge() {
  let h = harness();
  h.acme.script_authorization(
    "a.example.com",
    vec![AuthorizationStatus::Pending, AuthorizationStatus::Valid],
  );
  let orchestrator = h.orchestrator();
  let names = names(&["a.example.com"]);

  let start = Instant::now();
  orchestrator.issue(&names, &csr(&names)).await.unwrap();

  assert_eq!(start.elapsed(), secs(1));
  // one fetch from begin, two while polling
  assert_eq!(h.events.count("fetch_authorization:a.example.com"), 3);
  assert_eq!(h.events.count("retract:"), 1);
  assert_eq!(h.events.count("finalize"), 1);
}

#[tokio::test(start_paused = true)]
async fn test_authorization_timeout() {
  let h = harness();
  h.acme.script_authorization(
    "a.example.com",
    vec![AuthorizationStatus::Pending],
  );
  let orchestrator = h.orchestrator();
  let names = names(&["a.example.com"]);

  let start = Instant::now();
  let err = orchestrator.issue(&names, &csr(&names)).await.unwrap_err();

  assert_eq!(start.elapsed(), secs(2));
  assert!(err.is_timeout());
  match err {
    Error::AuthorizationTimeout {
      identifier,
      attempts,
      last_status,
    } => {
      assert_eq!(identifier, "a.example.com");
      assert_eq!(attempts, 3);
      assert_eq!(last_status, Some(AuthorizationStatus::Pending));
    }
    err => panic!("unexpected error: {:?}", err),
  }
  assert_eq!(h.events.count("retract:"), 1);
  assert_eq!(h.events.count("finalize"), 0);
  assert!(h.publisher.store().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_authorization_expires_after_valid_challenge() {
  let h = harness();
  h.acme.script_authorization(
    "a.example.com",
    vec![AuthorizationStatus::Pending, AuthorizationStatus::Expired],
  );
  let orchestrator = h.orchestrator();
  let names = names(&["a.example.com"]);

  let start = Instant::now();
  let err = orchestrator.issue(&names, &csr(&names)).await.unwrap_err();

  assert_eq!(start.elapsed(), secs(1));
  match err {
    Error::AuthorizationRejected { identifier, status } => {
      assert_eq!(identifier, "a.example.com");
      assert_eq!(status, AuthorizationStatus::Expired);
    }
    err => panic!("unexpected error: {:?}", err),
  }
  assert_eq!(h.events.count("retract:"), 1);
  assert_eq!(h.events.count("finalize"), 0);
}

#[tokio::test(start_paused = true)]
async fn test_shared_token_is_a_path_collision() {
  let h = harness();
  let orchestrator = h.orchestrator();

  let mut state = orchestrator
    .begin(&names(&["a.example.com", "b.example.com"]))
    .await
    .unwrap();
  let token = state.authorizations[0].challenges[0].token.clone();
  state.authorizations[1].challenges[0].token = token;

  let err = orchestrator.prepare_proofs(&mut state).unwrap_err();

  match err {
    Error::ProofPathCollision { path } => {
      assert_eq!(path, proof_path("a.example.com"));
    }
    err => panic!("unexpected error: {:?}", err),
  }
  assert!(state.proofs.is_empty());
  assert_eq!(h.events.count("publish:"), 0);
  assert!(h.publisher.store().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_challenge_timeout() {
  let h = harness();
  h.acme.script_challenge(
    "a.example.com",
    vec![Step::Status(ChallengeStatus::Pending)],
  );
  let orchestrator = h.orchestrator();
  let names = names(&["a.example.com"]);

  let start = Instant::now();
  let err = orchestrator.issue(&names, &csr(&names)).await.unwrap_err();

  assert_eq!(start.elapsed(), secs(4));
  assert!(err.is_timeout());
  match err {
    Error::ChallengeTimeout {
      identifier,
      attempts,
      last_status,
    } => {
      assert_eq!(identifier, "a.example.com");
      assert_eq!(attempts, 5);
      assert_eq!(last_status, Some(ChallengeStatus::Pending));
    }
    err => panic!("unexpected error: {:?}", err),
  }
  assert_eq!(h.events.count("retract:"), 1);
}

#[tokio::test(start_paused = true)]
async fn test_transient_errors_are_retried() {
  let h = harness();
  h.acme.script_challenge(
    "a.example.com",
    vec![
      Step::TransportFailure,
      Step::ServerFailure(503),
      Step::Status(ChallengeStatus::Valid),
    ],
  );
  let orchestrator = h.orchestrator();
  let names = names(&["a.example.com"]);

  let start = Instant::now();
  orchestrator.issue(&names, &csr(&names)).await.unwrap();

  assert_eq!(start.elapsed(), secs(2));
  assert_eq!(h.events.count("poll_challenge:"), 3);
}

#[tokio::test(start_paused = true)]
async fn test_client_errors_are_fatal() {
  let h = harness();
  h.acme
    .script_challenge("a.example.com", vec![Step::ServerFailure(400)]);
  let orchestrator = h.orchestrator();
  let names = names(&["a.example.com"]);

  let start = Instant::now();
  let err = orchestrator.issue(&names, &csr(&names)).await.unwrap_err();

  assert_eq!(start.elapsed(), Duration::ZERO);
  assert!(matches!(&err, Error::Server(e) if e.status == Some(400)));
  assert!(!err.is_transient());
  assert_eq!(h.events.count("retract:"), 1);
}

#[tokio::test(start_paused = true)]
async fn test_deadline_cancels_polling() {
  let h = harness();
  h.acme.script_challenge(
    "a.example.com",
    vec![Step::Status(ChallengeStatus::Pending)],
  );
  let mut config = fast_config();
  config.challenge_policy = PollPolicy::new(20, secs(1));
  let orchestrator = h
    .builder()
    .config(config)
    .cancellation(
      Cancellation::new().with_timeout(Duration::from_millis(2500)),
    )
    .build()
    .unwrap();
  let names = names(&["a.example.com"]);

  let start = Instant::now();
  let err = orchestrator.issue(&names, &csr(&names)).await.unwrap_err();

  assert_eq!(start.elapsed(), Duration::from_millis(2500));
  assert!(matches!(err, Error::Cancelled));
  assert_eq!(h.events.count("retract:"), 1);
  assert!(h.publisher.store().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_explicit_cancellation() {
  let h = harness();
  h.acme.script_challenge(
    "a.example.com",
    vec![Step::Status(ChallengeStatus::Pending)],
  );
  let cancellation = Cancellation::new();
  let orchestrator = h
    .builder()
    .cancellation(cancellation.clone())
    .build()
    .unwrap();
  let names = names(&["a.example.com"]);
  let csr = csr(&names);

  let start = Instant::now();
  let (res, _) = tokio::join!(orchestrator.issue(&names, &csr), async {
    tokio::time::sleep(Duration::from_millis(1500)).await;
    cancellation.cancel();
  });

  assert_eq!(start.elapsed(), Duration::from_millis(1500));
  assert!(matches!(res, Err(Error::Cancelled)));
  assert_eq!(h.events.count("retract:"), 1);
}

#[tokio::test(start_paused = true)]
async fn test_valid_order_without_certificate_url_times_out() {
  let h = harness();
  h.acme.script_finalize(vec![(OrderStatus::Valid, false)]);
  let orchestrator = h.orchestrator();
  let names = names(&["a.example.com"]);

  let start = Instant::now();
  let err = orchestrator.issue(&names, &csr(&names)).await.unwrap_err();

  assert_eq!(start.elapsed(), secs(4));
  match err {
    Error::OrderTimeout {
      attempts,
      last_status,
    } => {
      assert_eq!(attempts, 5);
      assert_eq!(last_status, Some(OrderStatus::Valid));
    }
    err => panic!("unexpected error: {:?}", err),
  }
  assert_eq!(h.events.count("fetch_certificate:"), 0);
}

#[tokio::test(start_paused = true)]
async fn test_order_invalid_after_finalize() {
  let h = harness();
  h.acme.script_finalize(vec![
    (OrderStatus::Processing, false),
    (OrderStatus::Invalid, false),
  ]);
  let orchestrator = h.orchestrator();
  let names = names(&["a.example.com"]);

  let err = orchestrator.issue(&names, &csr(&names)).await.unwrap_err();
  assert!(matches!(
    err,
    Error::OrderRejected {
      status: OrderStatus::Invalid,
      ..
    }
  ));
}

#[tokio::test(start_paused = true)]
async fn test_order_ready_after_finalize_is_fatal() {
  let h = harness();
  h.acme.script_finalize(vec![(OrderStatus::Ready, false)]);
  let orchestrator = h.orchestrator();
  let names = names(&["a.example.com"]);

  let start = Instant::now();
  let err = orchestrator.issue(&names, &csr(&names)).await.unwrap_err();

  assert_eq!(start.elapsed(), Duration::ZERO);
  assert!(matches!(
    err,
    Error::OrderRejected {
      status: OrderStatus::Ready,
      ..
    }
  ));
}

#[tokio::test(start_paused = true)]
async fn test_unsupported_challenges_are_skipped() {
  let h = harness();
  h.acme.offer(
    "a.example.com",
    vec![
      ChallengeType::Dns01,
      ChallengeType::TlsAlpn01,
      ChallengeType::Http01,
    ],
  );
  let orchestrator = h.orchestrator();
  let names = names(&["a.example.com"]);

  orchestrator.issue(&names, &csr(&names)).await.unwrap();

  assert_eq!(h.events.count("answer:a.example.com:http-01"), 1);
  assert_eq!(h.events.count("answer:a.example.com:dns-01"), 0);
  assert_eq!(h.events.count("answer:a.example.com:tls-alpn-01"), 0);
}

#[tokio::test(start_paused = true)]
async fn test_no_supported_challenge() {
  let h = harness();
  h.acme.offer("a.example.com", vec![ChallengeType::Dns01]);
  let orchestrator = h.orchestrator();
  let names = names(&["a.example.com"]);

  let err = orchestrator.issue(&names, &csr(&names)).await.unwrap_err();

  assert!(matches!(
    &err,
    Error::NoSupportedChallenge { identifier } if identifier == "a.example.com"
  ));
  assert_eq!(h.events.count("publish:"), 0);
  assert_eq!(h.events.count("answer:"), 0);
}

#[tokio::test(start_paused = true)]
async fn test_valid_authorizations_are_not_revalidated() {
  let h = harness();
  h.acme.authorize("a.example.com");
  let orchestrator = h.orchestrator();
  let names = names(&["a.example.com", "b.example.com"]);

  orchestrator.issue(&names, &csr(&names)).await.unwrap();

  assert_eq!(h.events.count("publish:"), 1);
  assert_eq!(
    h.events
      .count(&format!("publish:{}", proof_path("b.example.com"))),
    1
  );
  assert_eq!(h.events.count("answer:a.example.com"), 0);
}

#[tokio::test(start_paused = true)]
async fn test_waits_for_proof_visibility() {
  let h = harness();
  let orchestrator = h
    .builder()
    .probe(Arc::new(LaggingProbe::new(h.publisher.clone(), 2)))
    .build()
    .unwrap();
  let names = names(&["a.example.com"]);

  let start = Instant::now();
  orchestrator.issue(&names, &csr(&names)).await.unwrap();

  assert_eq!(start.elapsed(), secs(2));
  assert_eq!(h.events.count("retract:"), 1);
}

#[tokio::test(start_paused = true)]
async fn test_proof_never_visible() {
  let h = harness();
  let orchestrator = h
    .builder()
    .probe(Arc::new(LaggingProbe::new(h.publisher.clone(), 100)))
    .build()
    .unwrap();
  let names = names(&["a.example.com"]);

  let err = orchestrator.issue(&names, &csr(&names)).await.unwrap_err();

  match err {
    Error::ProofNotVisible { path, attempts } => {
      assert_eq!(path, proof_path("a.example.com"));
      assert_eq!(attempts, 5);
    }
    err => panic!("unexpected error: {:?}", err),
  }
  assert_eq!(h.events.count("answer:"), 0);
  assert_eq!(h.events.count("retract:"), 1);
}

#[tokio::test(start_paused = true)]
async fn test_await_proof_retracted() {
  let h = harness();
  let orchestrator = h
    .builder()
    .probe(Arc::new(LaggingProbe::new(h.publisher.clone(), 0)))
    .build()
    .unwrap();

  let mut state = orchestrator
    .begin(&names(&["a.example.com"]))
    .await
    .unwrap();
  orchestrator.prepare_proofs(&mut state).unwrap();
  let proof = state.proofs[0].clone();
  let policy = PollPolicy::new(3, secs(1));

  orchestrator.publish_proof(&proof).await.unwrap();
  orchestrator.await_proof_visible(&proof, &policy).await.unwrap();
  let err = orchestrator
    .await_proof_retracted(&proof, &policy)
    .await
    .unwrap_err();
  assert!(matches!(err, Error::ProofStillVisible { attempts: 3, .. }));

  orchestrator.retract_proof(&proof).await.unwrap();
  orchestrator.await_proof_retracted(&proof, &policy).await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_failed_publish_is_still_retracted() {
  let h = harness();
  h.publisher.fail_publish();
  let orchestrator = h.orchestrator();
  let names = names(&["a.example.com"]);

  let err = orchestrator.issue(&names, &csr(&names)).await.unwrap_err();

  assert!(matches!(err, Error::Transport(_)));
  assert_eq!(h.events.count("answer:"), 0);
  assert_eq!(h.events.count("retract:"), 1);
}

#[tokio::test(start_paused = true)]
async fn test_csr_must_cover_names() {
  let h = harness();
  let orchestrator = h.orchestrator();

  let err = orchestrator
    .issue(
      &names(&["a.example.com"]),
      &csr(&names(&["x.example.com"])),
    )
    .await
    .unwrap_err();

  assert!(matches!(err, Error::CsrMismatch { .. }));
  assert_eq!(h.events.count("create_order"), 0);
}

#[test]
fn test_build_rejects_empty_policy() {
  let h = harness();
  let mut config = fast_config();
  config.order_policy = PollPolicy::new(0, secs(1));

  let res = h.builder().config(config).build();
  assert!(matches!(res, Err(Error::Validation(_))));
}
