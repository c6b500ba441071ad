use crate::error::*;
use crate::helpers::*;
use openssl::hash::MessageDigest;
use openssl::pkey::PKey;
use openssl::pkey::Private;
use openssl::stack::Stack;
use openssl::x509::extension::SubjectAlternativeName;
use openssl::x509::X509Name;
use openssl::x509::X509Req;
use openssl::x509::X509;
use serde::Deserialize;
use serde::Serialize;
use std::fmt;

#[derive(Deserialize, Serialize, Debug, Eq, PartialEq, Clone, Copy)]
#[serde(rename_all = "camelCase")]
/// The status of this order.  Possible values are "pending", "ready",
/// processing", "valid", and "invalid".
pub enum OrderStatus {
  Pending,
  Ready,
  Processing,
  Valid,
  Invalid,
}

impl OrderStatus {
  pub fn as_str(&self) -> &'static str {
    match self {
      OrderStatus::Pending => "pending",
      OrderStatus::Ready => "ready",
      OrderStatus::Processing => "processing",
      OrderStatus::Valid => "valid",
      OrderStatus::Invalid => "invalid",
    }
  }
}

impl fmt::Display for OrderStatus {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
/// An ACME order object represents a client's request for a certificate
/// and is used to track the progress of that order through to issuance.
///
/// Orders are snapshots: a refresh returns a new value rather than
/// updating this one.
pub struct Order {
  /// The URL of this order, taken from the `Location` header of the
  /// newOrder response. Stable for the lifetime of the order.
  #[serde(default)]
  pub url: String,

  /// The status of this order.
  pub status: OrderStatus,
  /// The timestamp after which the server will consider this order
  /// invalid.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub expires: Option<String>,
  /// An array of identifier objects that the order pertains to.
  pub identifiers: Vec<Identifier>,
  /// The requested value of the notBefore field in the certificate.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub not_before: Option<String>,
  /// The requested value of the notAfter field in the certificate.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub not_after: Option<String>,

  /// The error that occurred while processing the order, if any.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub error: Option<ServerError>,

  #[serde(rename = "authorizations")]
  /// For pending orders, the authorizations that the client needs to
  /// complete before the requested certificate can be issued. For
  /// final orders (in the "valid" or "invalid" state), the
  /// authorizations that were completed.
  pub authorization_urls: Vec<String>,
  #[serde(rename = "finalize", default)]
  /// A URL that a CSR must be POSTed to once all of the order's
  /// authorizations are satisfied to finalize the order.
  pub finalize_url: Option<String>,
  #[serde(rename = "certificate", default)]
  /// A URL for the certificate that has been issued in response to
  /// this order.
  pub certificate_url: Option<String>,
}

impl Order {
  /// The DNS names this order covers.
  pub fn dns_names(&self) -> Vec<String> {
    self
      .identifiers
      .iter()
      .filter(|i| i.typ == "dns")
      .map(|i| i.value.clone())
      .collect()
  }

  pub fn certificate_url(&self) -> Option<&str> {
    self.certificate_url.as_deref()
  }
}

/// A DER encoded certificate signing request together with the names it
/// binds.
#[derive(Debug, Clone)]
pub struct CertificateRequest {
  der: Vec<u8>,
  names: DomainNames,
}

impl CertificateRequest {
  /// Build and sign a CSR for `names` with `pkey`. The first name becomes
  /// the common name, every name is added as a subject alternative name.
  pub fn generate(
    pkey: &PKey<Private>,
    names: &DomainNames,
  ) -> Result<Self, Error> {
    let csr = gen_csr(pkey, names)?;
    Ok(CertificateRequest {
      der: csr.to_der()?,
      names: names.clone(),
    })
  }

  /// Wrap an externally built CSR. `names` must be the names the CSR
  /// carries as subject alternative names.
  pub fn from_der(der: Vec<u8>, names: DomainNames) -> Result<Self, Error> {
    X509Req::from_der(&der)?;
    Ok(CertificateRequest { der, names })
  }

  pub fn der(&self) -> &[u8] {
    &self.der
  }

  pub fn names(&self) -> &DomainNames {
    &self.names
  }

  /// Whether this CSR covers exactly the identifiers of `order`.
  pub fn matches(&self, order: &Order) -> bool {
    self.names.same_set(&order.dns_names())
  }
}

fn gen_csr(
  pkey: &PKey<Private>,
  names: &DomainNames,
) -> Result<X509Req, Error> {
  let domains = names.as_slice();

  let mut builder = X509Req::builder()?;
  let name = {
    let mut name = X509Name::builder()?;
    name.append_entry_by_text("CN", &domains[0])?;
    name.build()
  };
  builder.set_subject_name(&name)?;

  // Add all domains as SANs
  let san_extension = {
    let mut san = SubjectAlternativeName::new();
    for domain in domains.iter() {
      san.dns(domain);
    }
    san.build(&builder.x509v3_context(None))?
  };
  let mut stack = Stack::new()?;
  stack.push(san_extension)?;
  builder.add_extensions(&stack)?;

  builder.set_pubkey(pkey)?;
  builder.sign(pkey, MessageDigest::sha256())?;

  Ok(builder.build())
}

/// The outcome of a successful order: the final order snapshot and the
/// downloaded PEM certificate chain.
#[derive(Debug, Clone)]
pub struct IssuedCertificate {
  pub order: Order,
  pub certificate_url: String,
  pub pem: Vec<u8>,
}

impl IssuedCertificate {
  /// Parse the downloaded chain, leaf first.
  pub fn chain(&self) -> Result<Vec<X509>, Error> {
    Ok(X509::stack_from_pem(&self.pem)?)
  }
}
