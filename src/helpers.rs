use crate::error::*;
use openssl::ec::EcGroup;
use openssl::ec::EcKey;
use openssl::nid::Nid;
use openssl::pkey::PKey;
use openssl::pkey::Private;
use openssl::rsa::Rsa;
use serde::Deserialize;
use serde::Serialize;

/// This is a identifier for a resource that the ACME server
/// can provision certificates for (a domain).
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Identifier {
  /// The type of identifier.
  #[serde(rename = "type")]
  pub typ: String,
  /// The identifier itself.
  pub value: String,
}

impl Identifier {
  pub fn dns(value: impl Into<String>) -> Self {
    Identifier {
      typ: "dns".to_string(),
      value: value.into(),
    }
  }
}

/// A non-empty, deduplicated list of normalized DNS names. Insertion order
/// is kept, so the first name is the one that ends up as the CSR common name.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(try_from = "Vec<String>", into = "Vec<String>")]
pub struct DomainNames(Vec<String>);

impl DomainNames {
  pub fn new<I, S>(names: I) -> Result<Self, Error>
  where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
  {
    let mut normalized: Vec<String> = vec![];
    for name in names {
      let name = normalize_domain(name.as_ref())?;
      if !normalized.contains(&name) {
        normalized.push(name);
      }
    }

    if normalized.is_empty() {
      return Err(Error::EmptyIdentifiers);
    }

    Ok(DomainNames(normalized))
  }

  pub fn as_slice(&self) -> &[String] {
    &self.0
  }

  pub fn iter(&self) -> impl Iterator<Item = &str> {
    self.0.iter().map(String::as_str)
  }

  pub fn to_identifiers(&self) -> Vec<Identifier> {
    self.0.iter().map(Identifier::dns).collect()
  }

  /// Set equality against a list of names, ignoring order and case.
  pub fn same_set<S: AsRef<str>>(&self, other: &[S]) -> bool {
    let mut theirs: Vec<String> = other
      .iter()
      .map(|name| name.as_ref().trim_end_matches('.').to_ascii_lowercase())
      .collect();
    theirs.sort();
    theirs.dedup();

    let mut ours = self.0.clone();
    ours.sort();

    ours == theirs
  }
}

impl TryFrom<Vec<String>> for DomainNames {
  type Error = Error;

  fn try_from(names: Vec<String>) -> Result<Self, Error> {
    DomainNames::new(names)
  }
}

impl From<DomainNames> for Vec<String> {
  fn from(names: DomainNames) -> Self {
    names.0
  }
}

fn normalize_domain(name: &str) -> Result<String, Error> {
  let name = name.trim().trim_end_matches('.').to_ascii_lowercase();
  if name.is_empty() || name.len() > 253 {
    return Err(Error::InvalidIdentifier(name));
  }

  let labels = match name.strip_prefix("*.") {
    Some(rest) => rest,
    None => name.as_str(),
  };

  let valid = labels.split('.').all(|label| {
    !label.is_empty()
      && label.len() <= 63
      && !label.starts_with('-')
      && !label.ends_with('-')
      && label
        .bytes()
        .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
  });
  if !valid {
    return Err(Error::InvalidIdentifier(name));
  }

  Ok(name)
}

pub(crate) fn b64(data: &[u8]) -> String {
  data_encoding::BASE64URL_NOPAD.encode(data)
}

/// Generate a new RSA private key using the specified size,
/// using the system random.
pub fn gen_rsa_private_key(bits: u32) -> Result<PKey<Private>, Error> {
  let rsa = Rsa::generate(bits)?;
  let key = PKey::from_rsa(rsa)?;
  Ok(key)
}

/// Generate a new P-256 EC private key, using the system random.
pub fn gen_ec_p256_private_key() -> Result<PKey<Private>, Error> {
  let group = EcGroup::from_curve_name(Nid::X9_62_PRIME256V1)?;
  let ec = EcKey::generate(&group)?;
  let key = PKey::from_ec_key(ec)?;
  Ok(key)
}
