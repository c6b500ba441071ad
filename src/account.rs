use crate::directory::Directory;
use crate::error::*;
use openssl::pkey::PKey;
use openssl::pkey::Private;
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use tracing::field;
use tracing::instrument;
use tracing::Level;
use tracing::Span;

/// The status of an [`Account`].
///
/// Possible values are "valid", "deactivated",
/// and "revoked". The value "deactivated" should be used to indicate client-
/// initiated deactivation whereas "revoked" should be used to indicate server-
/// initiated deactivation.
#[derive(Deserialize, Eq, PartialEq, Debug, Clone, Copy)]
#[serde(rename_all = "camelCase")]
pub enum AccountStatus {
  Valid,
  Deactivated,
  Revoked,
}

#[derive(Deserialize)]
struct AccountResource {
  status: AccountStatus,
}

/// An existing ACME account: the key that signs requests and the account
/// URL (key id) the server knows it by. Registering accounts is left to
/// other tooling.
#[derive(Debug)]
pub struct Account {
  pub(crate) directory: Arc<Directory>,
  pub(crate) private_key: PKey<Private>,

  /// The account URL, used as the `kid` of signed requests.
  pub id: String,
  /// The status of this account.
  pub status: AccountStatus,
}

impl Account {
  /// Use an account whose URL is already known. No request is made.
  pub fn from_key_id(
    directory: Arc<Directory>,
    private_key: PKey<Private>,
    id: String,
  ) -> Arc<Account> {
    Arc::new(Account {
      directory,
      private_key,
      id,
      status: AccountStatus::Valid,
    })
  }

  /// Find the account registered for `private_key` with an
  /// `onlyReturnExisting` newAccount request.
  #[instrument(level = Level::INFO, name = "acme2_orchestrator::Account::lookup", err, skip(directory, private_key), fields(account_id = field::Empty))]
  pub async fn lookup(
    directory: Arc<Directory>,
    private_key: PKey<Private>,
  ) -> Result<Arc<Account>, Error> {
    let url = directory.new_account_url.clone();

    let (res, headers) = directory
      .authenticated_request::<_, AccountResource>(
        &url,
        json!({ "onlyReturnExisting": true }),
        &private_key,
        None,
      )
      .await?;
    let res: Result<AccountResource, Error> = res.into();
    let acc = res?;

    let account_id = map_transport_err(
      headers
        .get(reqwest::header::LOCATION)
        .ok_or_else(|| {
          transport_err("mandatory location header in newAccount not present")
        })?
        .to_str(),
    )?
    .to_string();
    Span::current().record("account_id", &field::display(&account_id));

    Ok(Arc::new(Account {
      directory,
      private_key,
      id: account_id,
      status: acc.status,
    }))
  }

  /// Retrieve the private key for this account.
  pub fn private_key(&self) -> &PKey<Private> {
    &self.private_key
  }
}
