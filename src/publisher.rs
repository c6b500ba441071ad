//! Backends that make challenge proofs fetchable by the validating server.

use crate::challenge::ChallengeProof;
use crate::challenge::HTTP01_PATH_PREFIX;
use crate::error::*;
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Duration;
use tracing::debug;
use tracing::instrument;
use tracing::Level;

/// Publishes and retracts proof content at a path the validating server
/// can fetch. Both operations must be idempotent: publishing the same value
/// twice or retracting a missing path is not an error.
#[async_trait]
pub trait ResponsePublisher: Send + Sync {
  async fn publish(
    &self,
    path: &str,
    content_type: &str,
    value: &[u8],
  ) -> Result<(), Error>;

  async fn retract(&self, path: &str) -> Result<(), Error>;
}

/// What a probe saw at a proof's resource location.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeOutcome {
  Missing,
  /// Something is there, but not the expected content or content type.
  Mismatch,
  Matches,
}

/// Checks what is currently served for a proof. Publishing backends are not
/// assumed to be read-after-write consistent, so the orchestrator probes
/// before asking the server to validate.
#[async_trait]
pub trait ProofProbe: Send + Sync {
  async fn probe(&self, proof: &ChallengeProof) -> Result<ProbeOutcome, Error>;
}

/// Keeps proofs in memory. Suitable for an HTTP server that answers
/// `/.well-known/acme-challenge/` requests itself through [`Self::lookup`].
#[derive(Debug, Default)]
pub struct InMemoryPublisher {
  resources: Mutex<HashMap<String, (String, Vec<u8>)>>,
}

impl InMemoryPublisher {
  pub fn new() -> Self {
    Self::default()
  }

  /// The content type and body published at `path`, if any.
  pub fn lookup(&self, path: &str) -> Option<(String, Vec<u8>)> {
    self.lock().get(path).cloned()
  }

  pub fn len(&self) -> usize {
    self.lock().len()
  }

  pub fn is_empty(&self) -> bool {
    self.lock().is_empty()
  }

  fn lock(
    &self,
  ) -> std::sync::MutexGuard<'_, HashMap<String, (String, Vec<u8>)>> {
    self.resources.lock().unwrap_or_else(|e| e.into_inner())
  }
}

#[async_trait]
impl ResponsePublisher for InMemoryPublisher {
  async fn publish(
    &self,
    path: &str,
    content_type: &str,
    value: &[u8],
  ) -> Result<(), Error> {
    debug!(path, "Publishing challenge response");
    self
      .lock()
      .insert(path.to_string(), (content_type.to_string(), value.to_vec()));
    Ok(())
  }

  async fn retract(&self, path: &str) -> Result<(), Error> {
    if self.lock().remove(path).is_some() {
      debug!(path, "Retracted challenge response");
    }
    Ok(())
  }
}

#[async_trait]
impl ProofProbe for InMemoryPublisher {
  async fn probe(&self, proof: &ChallengeProof) -> Result<ProbeOutcome, Error> {
    Ok(match self.lookup(&proof.resource_path) {
      None => ProbeOutcome::Missing,
      Some((content_type, value))
        if content_type == proof.content_type
          && value == proof.value.as_bytes() =>
      {
        ProbeOutcome::Matches
      }
      Some(_) => ProbeOutcome::Mismatch,
    })
  }
}

/// Writes proofs as files below a web server's document root, the way a
/// webroot deployment serves `/.well-known/acme-challenge/`.
#[derive(Debug, Clone)]
pub struct WebrootPublisher {
  root: PathBuf,
}

impl WebrootPublisher {
  pub fn new(root: impl Into<PathBuf>) -> Self {
    WebrootPublisher { root: root.into() }
  }

  /// Only paths below the challenge prefix with a single, plain file name
  /// are accepted, so a proof can never write outside of that directory.
  fn file_path(&self, path: &str) -> Result<PathBuf, Error> {
    let name = path
      .strip_prefix(HTTP01_PATH_PREFIX)
      .ok_or(Error::Validation("proof path outside of the challenge prefix"))?;
    crate::challenge::validate_token(name)?;
    Ok(
      self
        .root
        .join(HTTP01_PATH_PREFIX.trim_matches('/'))
        .join(name),
    )
  }
}

#[async_trait]
impl ResponsePublisher for WebrootPublisher {
  #[instrument(level = Level::DEBUG, name = "acme2_orchestrator::WebrootPublisher::publish", err, skip(self, value))]
  async fn publish(
    &self,
    path: &str,
    content_type: &str,
    value: &[u8],
  ) -> Result<(), Error> {
    let file = self.file_path(path)?;
    if let Some(dir) = file.parent() {
      tokio::fs::create_dir_all(dir).await?;
    }
    tokio::fs::write(&file, value).await?;
    Ok(())
  }

  #[instrument(level = Level::DEBUG, name = "acme2_orchestrator::WebrootPublisher::retract", err, skip(self))]
  async fn retract(&self, path: &str) -> Result<(), Error> {
    let file = self.file_path(path)?;
    match tokio::fs::remove_file(&file).await {
      Ok(()) => Ok(()),
      Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
      Err(err) => Err(err.into()),
    }
  }
}

/// Fetches the proof's resource URL over plain HTTP, as the validating
/// server would.
#[derive(Debug, Clone)]
pub struct HttpProbe {
  http_client: reqwest::Client,
}

impl HttpProbe {
  pub fn new() -> Result<Self, Error> {
    let http_client = reqwest::Client::builder()
      .timeout(Duration::from_secs(10))
      .build()?;
    Ok(HttpProbe { http_client })
  }

  pub fn with_client(http_client: reqwest::Client) -> Self {
    HttpProbe { http_client }
  }
}

#[async_trait]
impl ProofProbe for HttpProbe {
  #[instrument(level = Level::DEBUG, name = "acme2_orchestrator::HttpProbe::probe", err, skip(self, proof), fields(url = %proof.resource_url))]
  async fn probe(&self, proof: &ChallengeProof) -> Result<ProbeOutcome, Error> {
    let resp = self.http_client.get(&proof.resource_url).send().await?;
    if resp.status() == reqwest::StatusCode::NOT_FOUND {
      return Ok(ProbeOutcome::Missing);
    }
    if !resp.status().is_success() {
      return Ok(ProbeOutcome::Mismatch);
    }

    let content_type_ok = resp
      .headers()
      .get(reqwest::header::CONTENT_TYPE)
      .and_then(|v| v.to_str().ok())
      .map_or(false, |v| v.starts_with(&proof.content_type));
    let body = resp.bytes().await?;

    if content_type_ok && &body[..] == proof.value.as_bytes() {
      Ok(ProbeOutcome::Matches)
    } else {
      Ok(ProbeOutcome::Mismatch)
    }
  }
}
