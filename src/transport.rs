use crate::account::Account;
use crate::authorization::Authorization;
use crate::authorization::Challenge;
use crate::error::*;
use crate::helpers::*;
use crate::jws::Thumbprint;
use crate::order::Order;
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::json;
use std::sync::Arc;
use tracing::field;
use tracing::instrument;
use tracing::Level;
use tracing::Span;

/// The signed request client the orchestrator drives. Every returned entity
/// is a fresh snapshot; implementations must carry the entity URL over from
/// the request since servers do not include it in the body.
#[async_trait]
pub trait AcmeTransport: Send + Sync {
  /// The thumbprint of the account key, used in key authorizations.
  fn thumbprint(&self) -> Result<Thumbprint, Error>;

  async fn create_order(
    &self,
    identifiers: &[Identifier],
  ) -> Result<Order, Error>;

  async fn refresh_order(&self, order: &Order) -> Result<Order, Error>;

  async fn fetch_authorization(&self, url: &str)
    -> Result<Authorization, Error>;

  async fn refresh_authorization(
    &self,
    authorization: &Authorization,
  ) -> Result<Authorization, Error> {
    self.fetch_authorization(&authorization.url).await
  }

  async fn refresh_challenge(
    &self,
    authorization: &Authorization,
    challenge: &Challenge,
  ) -> Result<Challenge, Error>;

  /// Tell the server the challenge response is in place.
  async fn answer_challenge(
    &self,
    authorization: &Authorization,
    challenge: &Challenge,
  ) -> Result<Challenge, Error>;

  async fn finalize_order(
    &self,
    order: &Order,
    der_csr: &[u8],
  ) -> Result<Order, Error>;

  /// Download the certificate chain (PEM) from `url`.
  async fn fetch_certificate(&self, url: &str) -> Result<Vec<u8>, Error>;
}

/// [`AcmeTransport`] over HTTPS with JWS signed requests, for an existing
/// [`Account`].
#[derive(Debug, Clone)]
pub struct HttpTransport {
  account: Arc<Account>,
}

impl HttpTransport {
  pub fn new(account: Arc<Account>) -> Self {
    HttpTransport { account }
  }

  pub fn account(&self) -> &Arc<Account> {
    &self.account
  }

  async fn post<T, R>(
    &self,
    url: &str,
    payload: T,
  ) -> Result<(R, reqwest::header::HeaderMap), Error>
  where
    T: Serialize + Send,
    R: DeserializeOwned + Send,
  {
    let (res, headers) = self
      .account
      .directory
      .authenticated_request::<_, R>(
        url,
        payload,
        &self.account.private_key,
        Some(&self.account.id),
      )
      .await?;
    let res: Result<R, Error> = res.into();
    Ok((res?, headers))
  }
}

#[async_trait]
impl AcmeTransport for HttpTransport {
  fn thumbprint(&self) -> Result<Thumbprint, Error> {
    Thumbprint::from_private_key(&self.account.private_key)
  }

  #[instrument(level = Level::INFO, name = "acme2_orchestrator::HttpTransport::create_order", err, skip(self), fields(order = field::Empty))]
  async fn create_order(
    &self,
    identifiers: &[Identifier],
  ) -> Result<Order, Error> {
    let new_order_url = self.account.directory.new_order_url.clone();
    let (mut order, headers) = self
      .post::<_, Order>(&new_order_url, json!({ "identifiers": identifiers }))
      .await?;

    let order_url = map_transport_err(
      headers
        .get(reqwest::header::LOCATION)
        .ok_or_else(|| {
          transport_err("mandatory location header in newOrder not present")
        })?
        .to_str(),
    )?
    .to_string();
    Span::current().record("order", &field::display(&order_url));

    order.url = order_url;
    Ok(order)
  }

  #[instrument(level = Level::DEBUG, name = "acme2_orchestrator::HttpTransport::refresh_order", err, skip(self, order), fields(url = %order.url, status = field::Empty))]
  async fn refresh_order(&self, order: &Order) -> Result<Order, Error> {
    let (mut refreshed, _) = self.post::<_, Order>(&order.url, "").await?;
    refreshed.url = order.url.clone();
    Span::current().record("status", &field::display(&refreshed.status));
    Ok(refreshed)
  }

  #[instrument(level = Level::DEBUG, name = "acme2_orchestrator::HttpTransport::fetch_authorization", err, skip(self), fields(status = field::Empty))]
  async fn fetch_authorization(
    &self,
    url: &str,
  ) -> Result<Authorization, Error> {
    let (mut authorization, _) =
      self.post::<_, Authorization>(url, "").await?;
    authorization.url = url.to_string();
    Span::current().record("status", &field::display(&authorization.status));
    Ok(authorization)
  }

  #[instrument(level = Level::DEBUG, name = "acme2_orchestrator::HttpTransport::refresh_challenge", err, skip(self, _authorization, challenge), fields(url = %challenge.url, status = field::Empty))]
  async fn refresh_challenge(
    &self,
    _authorization: &Authorization,
    challenge: &Challenge,
  ) -> Result<Challenge, Error> {
    let (refreshed, _) = self.post::<_, Challenge>(&challenge.url, "").await?;
    Span::current().record("status", &field::display(&refreshed.status));
    Ok(refreshed)
  }

  #[instrument(level = Level::INFO, name = "acme2_orchestrator::HttpTransport::answer_challenge", err, skip(self, _authorization, challenge), fields(url = %challenge.url, status = field::Empty))]
  async fn answer_challenge(
    &self,
    _authorization: &Authorization,
    challenge: &Challenge,
  ) -> Result<Challenge, Error> {
    let (answered, _) =
      self.post::<_, Challenge>(&challenge.url, json!({})).await?;
    Span::current().record("status", &field::display(&answered.status));
    Ok(answered)
  }

  #[instrument(level = Level::INFO, name = "acme2_orchestrator::HttpTransport::finalize_order", err, skip(self, order, der_csr), fields(url = %order.url))]
  async fn finalize_order(
    &self,
    order: &Order,
    der_csr: &[u8],
  ) -> Result<Order, Error> {
    let finalize_url = order
      .finalize_url
      .as_deref()
      .ok_or(Error::Validation("order has no finalize url"))?;

    let (mut finalized, _) = self
      .post::<_, Order>(finalize_url, json!({ "csr": b64(der_csr) }))
      .await?;
    finalized.url = order.url.clone();
    Ok(finalized)
  }

  #[instrument(level = Level::INFO, name = "acme2_orchestrator::HttpTransport::fetch_certificate", err, skip(self))]
  async fn fetch_certificate(&self, url: &str) -> Result<Vec<u8>, Error> {
    let resp = self
      .account
      .directory
      .authenticated_request_raw(
        url,
        "",
        &self.account.private_key,
        Some(&self.account.id),
      )
      .await?;

    if !resp.status().is_success() {
      let err: ServerError = resp.json().await?;
      return Err(err.into());
    }

    Ok(resp.bytes().await?.to_vec())
  }
}
