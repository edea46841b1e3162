use crate::k8s::{self, ByteString, Secret};
use anyhow::{bail, Context, Result};
use k8s_openapi::api::admissionregistration::v1::ValidatingWebhookConfiguration;
use rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName, DnType, DnValue,
    ExtendedKeyUsagePurpose, IsCa, Issuer, KeyPair, KeyUsagePurpose, SanType,
};
use rcgen::string::Ia5String;
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{debug, info, warn};
use x509_parser::prelude::{FromDer, GeneralName, X509Certificate};

const CA_NAME: &str = "gatekeeper-ca";
const CA_ORGANIZATION: &str = "gatekeeper";

const CA_CERT_KEY: &str = "ca.crt";
const CA_KEY_KEY: &str = "ca.key";
const SERVER_CERT_KEY: &str = "tls.crt";
const SERVER_KEY_KEY: &str = "tls.key";

const ROTATION_CHECK_PERIOD: Duration = Duration::from_secs(12 * 60 * 60);

/// Certificates are rotated when they come within this window of expiry.
const LOOKAHEAD_SECS: i64 = 90 * 24 * 60 * 60;

const VALIDITY_DAYS: i64 = 10 * 365;

/// Maintains the webhook's serving certificate: a self-signed CA and a leaf
/// certificate for the webhook service, persisted in a secret, with the CA
/// bundle mirrored into the webhook configuration.
pub(crate) struct CertRotator {
    client: k8s::Client,
    namespace: String,
    service: String,
    secret_name: String,
    webhook_config_name: String,
}

struct KeyBundle {
    ca_cert: String,
    ca_key: String,
    server_cert: String,
    server_key: String,
}

impl CertRotator {
    pub(crate) fn new(
        client: k8s::Client,
        namespace: String,
        service: String,
        secret_name: String,
        webhook_config_name: String,
    ) -> Self {
        Self {
            client,
            namespace,
            service,
            secret_name,
            webhook_config_name,
        }
    }

    fn dns_name(&self) -> String {
        format!("{}.{}.svc", self.service, self.namespace)
    }

    /// Ensures usable certificates exist before anything serves.
    pub(crate) async fn bootstrap(&self) -> Result<()> {
        self.refresh_if_needed()
            .await
            .context("initial certificate refresh failed")?;
        info!("Certificates ready");
        Ok(())
    }

    /// Re-checks the certificates periodically, rotating them as they near
    /// expiry. Refresh failures are retried on the next period.
    pub(crate) async fn run(self, drain: drain::Watch) {
        let drained = drain.signaled();
        tokio::pin!(drained);
        let mut interval = tokio::time::interval(ROTATION_CHECK_PERIOD);
        interval.tick().await;

        loop {
            tokio::select! {
                _ = &mut drained => return,
                _ = interval.tick() => {}
            }
            if let Err(error) = self.refresh_if_needed().await {
                warn!(%error, "Certificate refresh failed");
            }
        }
    }

    async fn refresh_if_needed(&self) -> Result<()> {
        let api = k8s::Api::<Secret>::namespaced(self.client.clone(), &self.namespace);
        let secret = api
            .get_opt(&self.secret_name)
            .await
            .context("failed to read certificate secret")?;

        let now = unix_now();
        let dns_name = self.dns_name();
        let data = secret.as_ref().and_then(|s| s.data.as_ref());
        let ca_cert = data.and_then(|d| d.get(CA_CERT_KEY));
        let ca_key = data.and_then(|d| d.get(CA_KEY_KEY));
        let server_cert = data.and_then(|d| d.get(SERVER_CERT_KEY));

        let ca_valid = match (ca_cert, ca_key) {
            (Some(cert), Some(key)) => ca_is_valid(&cert.0, &key.0, now),
            _ => false,
        };
        let server_valid = ca_valid
            && match (server_cert, ca_cert) {
                (Some(cert), Some(ca)) => server_cert_is_valid(&cert.0, &ca.0, &dns_name, now),
                _ => false,
            };

        if ca_valid && server_valid {
            debug!("Certificates are current");
            return Ok(());
        }

        let bundle = if ca_valid {
            info!(%dns_name, "Reissuing server certificate");
            let ca_cert = pem_string(ca_cert)?;
            let ca_key = pem_string(ca_key)?;
            let (server_cert, server_key) = issue_server_cert(&ca_cert, &ca_key, &dns_name)?;
            KeyBundle {
                ca_cert,
                ca_key,
                server_cert,
                server_key,
            }
        } else {
            info!(%dns_name, "Generating certificate authority and server certificate");
            generate_certs(&dns_name)?
        };

        // The CA bundle must be trusted by the API server before the serving
        // certificate changes hands, or reviews fail until both converge.
        self.write_ca_bundle(bundle.ca_cert.as_bytes()).await?;
        self.write_secret(&api, secret, &bundle).await?;
        Ok(())
    }

    async fn write_ca_bundle(&self, ca_cert: &[u8]) -> Result<()> {
        let api = k8s::Api::<ValidatingWebhookConfiguration>::all(self.client.clone());
        let mut config = api
            .get(&self.webhook_config_name)
            .await
            .context("failed to read webhook configuration")?;
        for webhook in config.webhooks.iter_mut().flatten() {
            webhook.client_config.ca_bundle = Some(ByteString(ca_cert.to_vec()));
        }
        api.replace(
            &self.webhook_config_name,
            &k8s::PostParams::default(),
            &config,
        )
        .await
        .context("failed to update webhook CA bundle")?;
        Ok(())
    }

    async fn write_secret(
        &self,
        api: &k8s::Api<Secret>,
        existing: Option<Secret>,
        bundle: &KeyBundle,
    ) -> Result<()> {
        let data = BTreeMap::from([
            (
                CA_CERT_KEY.to_string(),
                ByteString(bundle.ca_cert.clone().into_bytes()),
            ),
            (
                CA_KEY_KEY.to_string(),
                ByteString(bundle.ca_key.clone().into_bytes()),
            ),
            (
                SERVER_CERT_KEY.to_string(),
                ByteString(bundle.server_cert.clone().into_bytes()),
            ),
            (
                SERVER_KEY_KEY.to_string(),
                ByteString(bundle.server_key.clone().into_bytes()),
            ),
        ]);

        match existing {
            Some(mut secret) => {
                secret.data = Some(data);
                api.replace(&self.secret_name, &k8s::PostParams::default(), &secret)
                    .await
                    .context("failed to update certificate secret")?;
            }
            None => {
                let secret = Secret {
                    metadata: k8s::ObjectMeta {
                        name: Some(self.secret_name.clone()),
                        namespace: Some(self.namespace.clone()),
                        ..Default::default()
                    },
                    data: Some(data),
                    ..Default::default()
                };
                api.create(&k8s::PostParams::default(), &secret)
                    .await
                    .context("failed to create certificate secret")?;
            }
        }
        Ok(())
    }
}

fn pem_string(data: Option<&ByteString>) -> Result<String> {
    match data {
        Some(bytes) => Ok(String::from_utf8(bytes.0.clone())?),
        None => bail!("certificate secret is missing a key"),
    }
}

fn unix_now() -> i64 {
    time::OffsetDateTime::now_utc().unix_timestamp()
}

fn generate_certs(dns_name: &str) -> Result<KeyBundle> {
    let ca_key = KeyPair::generate()?;
    let mut params = CertificateParams::default();
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, DnValue::Utf8String(CA_NAME.to_string()));
    dn.push(
        DnType::OrganizationName,
        DnValue::Utf8String(CA_ORGANIZATION.to_string()),
    );
    params.distinguished_name = dn;
    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    params.key_usages = vec![
        KeyUsagePurpose::KeyCertSign,
        KeyUsagePurpose::CrlSign,
        KeyUsagePurpose::DigitalSignature,
    ];
    let now = time::OffsetDateTime::now_utc();
    params.not_before = now - time::Duration::hours(1);
    params.not_after = now + time::Duration::days(VALIDITY_DAYS);
    let ca_cert = params.self_signed(&ca_key)?;

    let ca_cert_pem = ca_cert.pem();
    let ca_key_pem = ca_key.serialize_pem();
    let (server_cert, server_key) = issue_server_cert(&ca_cert_pem, &ca_key_pem, dns_name)?;

    Ok(KeyBundle {
        ca_cert: ca_cert_pem,
        ca_key: ca_key_pem,
        server_cert,
        server_key,
    })
}

fn issue_server_cert(
    ca_cert_pem: &str,
    ca_key_pem: &str,
    dns_name: &str,
) -> Result<(String, String)> {
    let ca_key = KeyPair::from_pem(ca_key_pem)?;
    let issuer = Issuer::from_ca_cert_pem(ca_cert_pem, ca_key)?;

    let server_key = KeyPair::generate()?;
    let mut params = CertificateParams::default();
    let mut dn = DistinguishedName::new();
    dn.push(
        DnType::CommonName,
        DnValue::Utf8String(dns_name.to_string()),
    );
    params.distinguished_name = dn;
    params.is_ca = IsCa::NoCa;
    params.key_usages = vec![
        KeyUsagePurpose::DigitalSignature,
        KeyUsagePurpose::KeyEncipherment,
    ];
    params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];
    params
        .subject_alt_names
        .push(SanType::DnsName(Ia5String::try_from(dns_name.to_string())?));
    let now = time::OffsetDateTime::now_utc();
    params.not_before = now - time::Duration::hours(1);
    params.not_after = now + time::Duration::days(VALIDITY_DAYS);

    let cert = params.signed_by(&server_key, &issuer)?;
    Ok((cert.pem(), server_key.serialize_pem()))
}

/// A CA is usable when it is our own (by name), self-signed, its key still
/// parses, and it remains valid past the rotation lookahead.
fn ca_is_valid(cert_pem: &[u8], key_pem: &[u8], now: i64) -> bool {
    let Ok(der) = parse_pem(cert_pem) else {
        return false;
    };
    let Ok((_, cert)) = X509Certificate::from_der(&der) else {
        return false;
    };

    let name_ok = cert
        .subject()
        .iter_common_name()
        .next()
        .and_then(|cn| cn.as_str().ok())
        == Some(CA_NAME);

    name_ok
        && cert.verify_signature(None).is_ok()
        && std::str::from_utf8(key_pem)
            .is_ok_and(|pem| KeyPair::from_pem(pem).is_ok())
        && valid_at(&cert, now)
}

/// A server certificate is usable when the CA signed it, it names the
/// webhook service, and it remains valid past the rotation lookahead.
fn server_cert_is_valid(cert_pem: &[u8], ca_pem: &[u8], dns_name: &str, now: i64) -> bool {
    let Ok(der) = parse_pem(cert_pem) else {
        return false;
    };
    let Ok(ca_der) = parse_pem(ca_pem) else {
        return false;
    };
    let Ok((_, cert)) = X509Certificate::from_der(&der) else {
        return false;
    };
    let Ok((_, ca)) = X509Certificate::from_der(&ca_der) else {
        return false;
    };

    let san_ok = cert
        .subject_alternative_name()
        .ok()
        .flatten()
        .map(|ext| {
            ext.value
                .general_names
                .iter()
                .any(|name| matches!(name, GeneralName::DNSName(d) if *d == dns_name))
        })
        .unwrap_or(false);

    san_ok && cert.verify_signature(Some(ca.public_key())).is_ok() && valid_at(&cert, now)
}

fn valid_at(cert: &X509Certificate<'_>, now: i64) -> bool {
    let validity = cert.validity();
    validity.not_before.timestamp() <= now && now + LOOKAHEAD_SECS <= validity.not_after.timestamp()
}

fn parse_pem(pem: &[u8]) -> Result<Vec<u8>> {
    Ok(::pem::parse(pem)?.contents().to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;

    const DNS: &str = "gatekeeper-webhook-service.gatekeeper-system.svc";

    #[test]
    fn generated_certs_validate() {
        let bundle = generate_certs(DNS).unwrap();
        let now = unix_now();

        assert!(ca_is_valid(
            bundle.ca_cert.as_bytes(),
            bundle.ca_key.as_bytes(),
            now
        ));
        assert!(server_cert_is_valid(
            bundle.server_cert.as_bytes(),
            bundle.ca_cert.as_bytes(),
            DNS,
            now
        ));
    }

    #[test]
    fn certs_survive_the_lookahead_window() {
        let bundle = generate_certs(DNS).unwrap();
        // Just inside ten years minus the ninety-day lookahead.
        let later = unix_now() + (VALIDITY_DAYS - 91) * 24 * 60 * 60;
        assert!(ca_is_valid(
            bundle.ca_cert.as_bytes(),
            bundle.ca_key.as_bytes(),
            later
        ));
    }

    #[test]
    fn expiring_certs_are_rejected() {
        let bundle = generate_certs(DNS).unwrap();
        // Within the lookahead of expiry.
        let near_expiry = unix_now() + (VALIDITY_DAYS - 30) * 24 * 60 * 60;
        assert!(!ca_is_valid(
            bundle.ca_cert.as_bytes(),
            bundle.ca_key.as_bytes(),
            near_expiry
        ));
        assert!(!server_cert_is_valid(
            bundle.server_cert.as_bytes(),
            bundle.ca_cert.as_bytes(),
            DNS,
            near_expiry
        ));
    }

    #[test]
    fn server_cert_requires_matching_dns_name() {
        let bundle = generate_certs(DNS).unwrap();
        assert!(!server_cert_is_valid(
            bundle.server_cert.as_bytes(),
            bundle.ca_cert.as_bytes(),
            "other-service.gatekeeper-system.svc",
            unix_now()
        ));
    }

    #[test]
    fn foreign_ca_is_rejected() {
        let key = KeyPair::generate().unwrap();
        let mut params = CertificateParams::default();
        let mut dn = DistinguishedName::new();
        dn.push(
            DnType::CommonName,
            DnValue::Utf8String("someone-else".to_string()),
        );
        params.distinguished_name = dn;
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        let now = time::OffsetDateTime::now_utc();
        params.not_before = now - time::Duration::hours(1);
        params.not_after = now + time::Duration::days(VALIDITY_DAYS);
        let cert = params.self_signed(&key).unwrap();

        assert!(!ca_is_valid(
            cert.pem().as_bytes(),
            key.serialize_pem().as_bytes(),
            unix_now()
        ));
    }

    #[test]
    fn server_cert_must_be_signed_by_the_ca() {
        let a = generate_certs(DNS).unwrap();
        let b = generate_certs(DNS).unwrap();
        assert!(!server_cert_is_valid(
            a.server_cert.as_bytes(),
            b.ca_cert.as_bytes(),
            DNS,
            unix_now()
        ));
    }
}
