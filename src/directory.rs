use crate::error::*;
use crate::jws::jws;
use openssl::pkey::PKey;
use openssl::pkey::Private;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde::Serialize;
use std::sync::Arc;
use std::sync::Mutex;
use tracing::debug;
use tracing::instrument;
use tracing::Level;

const MAX_BAD_NONCE_RETRIES: u32 = 3;

pub struct DirectoryBuilder {
  url: String,
  http_client: Option<reqwest::Client>,
}

impl DirectoryBuilder {
  pub fn new(url: String) -> Self {
    DirectoryBuilder {
      url,
      http_client: None,
    }
  }

  pub fn http_client(&mut self, http_client: reqwest::Client) -> &mut Self {
    self.http_client = Some(http_client);
    self
  }

  #[instrument(level = Level::INFO, name = "acme2_orchestrator::DirectoryBuilder::build", err, skip(self), fields(url = %self.url))]
  pub async fn build(&mut self) -> Result<Arc<Directory>, Error> {
    let http_client = self
      .http_client
      .clone()
      .unwrap_or_else(reqwest::Client::new);

    let resp = http_client.get(&self.url).send().await?;

    let res: Result<Directory, Error> =
      resp.json::<ServerResult<Directory>>().await?.into();
    let mut dir = res?;

    dir.http_client = http_client;
    dir.nonce = Mutex::new(None);

    Ok(Arc::new(dir))
  }
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct Directory {
  #[serde(skip)]
  pub(crate) http_client: reqwest::Client,
  #[serde(skip)]
  pub(crate) nonce: Mutex<Option<String>>,
  #[serde(rename = "newNonce")]
  pub(crate) new_nonce_url: String,
  #[serde(rename = "newAccount")]
  pub(crate) new_account_url: String,
  #[serde(rename = "newOrder")]
  pub(crate) new_order_url: String,
  pub meta: Option<DirectoryMeta>,
}

#[derive(Deserialize, Clone, Debug)]
#[serde(rename_all = "camelCase")]
pub struct DirectoryMeta {
  pub terms_of_service: Option<String>,
  pub website: Option<String>,
  pub caa_identities: Option<Vec<String>>,
  pub external_account_required: Option<bool>,
}

fn extract_nonce_from_response(
  resp: &reqwest::Response,
) -> Result<Option<String>, Error> {
  match resp.headers().get("replay-nonce") {
    Some(hv) => Ok(Some(map_transport_err(hv.to_str())?.to_string())),
    None => Ok(None),
  }
}

impl Directory {
  fn take_nonce(&self) -> Option<String> {
    self.nonce.lock().unwrap_or_else(|e| e.into_inner()).take()
  }

  fn store_nonce(&self, nonce: String) {
    *self.nonce.lock().unwrap_or_else(|e| e.into_inner()) = Some(nonce);
  }

  pub(crate) async fn get_nonce(&self) -> Result<String, Error> {
    if let Some(nonce) = self.take_nonce() {
      return Ok(nonce);
    }

    let resp = self.http_client.get(&self.new_nonce_url).send().await?;
    match extract_nonce_from_response(&resp)? {
      Some(nonce) => Ok(nonce),
      None => Err(transport_err("newNonce request must return a nonce")),
    }
  }

  pub(crate) async fn authenticated_request_raw(
    &self,
    url: &str,
    payload: &str,
    pkey: &PKey<Private>,
    pkey_id: Option<&str>,
  ) -> Result<reqwest::Response, Error> {
    let nonce = self.get_nonce().await?;
    let body = jws(url, Some(nonce), payload, pkey, pkey_id)?;
    let resp = self
      .http_client
      .post(url)
      .header(reqwest::header::CONTENT_TYPE, "application/jose+json")
      .body(body)
      .send()
      .await?;

    if let Some(nonce) = extract_nonce_from_response(&resp)? {
      self.store_nonce(nonce);
    }

    Ok(resp)
  }

  /// Send a signed request and decode the response. A `""` payload is sent
  /// as an empty body, which makes this a POST-as-GET.
  pub(crate) async fn authenticated_request<T, R>(
    &self,
    url: &str,
    payload: T,
    pkey: &PKey<Private>,
    pkey_id: Option<&str>,
  ) -> Result<(ServerResult<R>, reqwest::header::HeaderMap), Error>
  where
    T: Serialize,
    R: DeserializeOwned,
  {
    let mut attempt = 0;
    let payload = serde_json::to_string(&payload)?;
    let payload = if payload == "\"\"" {
      "".to_string()
    } else {
      payload
    };

    loop {
      attempt += 1;

      let resp = self
        .authenticated_request_raw(url, &payload, pkey, pkey_id)
        .await?;

      let headers = resp.headers().clone();

      let res: ServerResult<R> = resp.json().await?;

      if let ServerResult::Err(err) = &res {
        if err.is_bad_nonce() && attempt <= MAX_BAD_NONCE_RETRIES {
          debug!({ attempt, url }, "Server rejected nonce, retrying");
          continue;
        }
      }

      return Ok((res, headers));
    }
  }
}
