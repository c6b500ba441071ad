use acme2_orchestrator::*;
use anyhow::anyhow;
use anyhow::Result;
use openssl::pkey::PKey;
use std::sync::Arc;

const LETS_ENCRYPT_STAGING_URL: &str =
  "https://acme-staging-v02.api.letsencrypt.org/directory";

// Usage: issue <account-key.pem> <webroot> <domain>...
#[tokio::main]
async fn main() -> Result<()> {
  let mut args = std::env::args().skip(1);
  let key_path = args.next().ok_or_else(|| anyhow!("missing account key"))?;
  let webroot = args.next().ok_or_else(|| anyhow!("missing webroot"))?;
  let names = DomainNames::new(args.collect::<Vec<_>>())?;

  // The account must already be registered for this key.
  let account_key = PKey::private_key_from_pem(&std::fs::read(key_path)?)?;
  let dir = DirectoryBuilder::new(LETS_ENCRYPT_STAGING_URL.to_string())
    .build()
    .await?;
  let account = Account::lookup(dir, account_key).await?;

  // Challenge responses are written below the webroot of the web server
  // that answers for every domain in `names`.
  let mut builder = OrchestratorBuilder::new(
    Arc::new(HttpTransport::new(account)),
    Arc::new(WebrootPublisher::new(webroot)),
  );
  builder.probe(Arc::new(HttpProbe::new()?));
  let orchestrator = builder.build()?;

  let pkey = gen_rsa_private_key(4096)?;
  let csr = CertificateRequest::generate(&pkey, &names)?;
  let issued = orchestrator.issue(&names, &csr).await?;

  for cert in issued.chain()? {
    println!("{}", String::from_utf8(cert.to_pem()?)?);
  }
  println!("{}", String::from_utf8(pkey.private_key_to_pem_pkcs8()?)?);

  Ok(())
}
