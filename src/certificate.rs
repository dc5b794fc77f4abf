//! Certificate manager for SSL/TLS certificate handling
//! Generates self-signed certificates for `setup` and loads them for serving

use crate::error::{Error, Result};
use chrono::{DateTime, Datelike, NaiveDateTime, Utc};
use p224::pkcs8::{EncodePrivateKey, EncodePublicKey, LineEnding};
use rand::rngs::OsRng;
use rand::RngCore;
use rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose,
    Ia5String, IsCa, KeyPair, KeyUsagePurpose, SanType, SerialNumber, SignatureAlgorithm,
};
use rsa::RsaPrivateKey;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::ServerConfig;
use std::fmt;
use std::fs;
use std::io::BufReader;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use time::OffsetDateTime;
use tracing::info;
use x509_cert::builder::{Builder, CertificateBuilder, Profile};
use x509_cert::der::asn1::{GeneralizedTime, Ia5String as X509Ia5String, OctetString, UtcTime};
use x509_cert::der::oid::db::rfc5280::ID_KP_SERVER_AUTH;
use x509_cert::der::{Decode, EncodePem};
use x509_cert::ext::pkix::name::GeneralName;
use x509_cert::ext::pkix::{
    BasicConstraints as X509BasicConstraints, ExtendedKeyUsage, KeyUsage, KeyUsages,
    SubjectAltName,
};
use x509_cert::name::Name;
use x509_cert::serial_number::SerialNumber as X509Serial;
use x509_cert::spki::SubjectPublicKeyInfoOwned;
use x509_cert::time::{Time, Validity};

type P224SigningKey = ecdsa::SigningKey<p224::NistP224>;
type P224Signature = ecdsa::der::Signature<p224::NistP224>;

pub const CERT_FILE: &str = "cert.pem";
pub const KEY_FILE: &str = "key.pem";

pub const DEFAULT_HOSTS: &str = "local.dev,*.local.dev";
pub const DEFAULT_RSA_BITS: usize = 2048;
pub const DEFAULT_VALIDITY: Duration = Duration::from_secs(365 * 24 * 60 * 60);

/// Layout accepted by `--start-date`, e.g. `Jan 1 15:04:05 2011`
pub const START_DATE_FORMAT: &str = "%b %d %H:%M:%S %Y";

const ORGANIZATION: &str = "tlsmux";

/// Named elliptic curves accepted for key generation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Curve {
    P224,
    P256,
    P384,
    P521,
}

impl FromStr for Curve {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim() {
            "P224" => Ok(Curve::P224),
            "P256" => Ok(Curve::P256),
            "P384" => Ok(Curve::P384),
            "P521" => Ok(Curve::P521),
            other => Err(Error::KeyGen(format!(
                "unrecognized elliptic curve {:?}, expected one of P224, P256, P384, P521",
                other
            ))),
        }
    }
}

impl Curve {
    /// rcgen signing algorithm for this curve; rcgen cannot sign with P224
    fn rcgen_algorithm(self) -> Option<&'static SignatureAlgorithm> {
        match self {
            Curve::P224 => None,
            Curve::P256 => Some(&rcgen::PKCS_ECDSA_P256_SHA256),
            Curve::P384 => Some(&rcgen::PKCS_ECDSA_P384_SHA384),
            Curve::P521 => Some(&rcgen::PKCS_ECDSA_P521_SHA512),
        }
    }
}

impl fmt::Display for Curve {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Curve::P224 => "P224",
            Curve::P256 => "P256",
            Curve::P384 => "P384",
            Curve::P521 => "P521",
        };
        f.write_str(name)
    }
}

/// Private key algorithm
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeySpec {
    Rsa(usize),
    Ec(Curve),
}

impl KeySpec {
    /// A curve, when given, takes precedence over the RSA size
    pub fn from_options(rsa_bits: usize, curve: Option<Curve>) -> Self {
        match curve {
            Some(curve) => KeySpec::Ec(curve),
            None => KeySpec::Rsa(rsa_bits),
        }
    }
}

impl Default for KeySpec {
    fn default() -> Self {
        KeySpec::Rsa(DEFAULT_RSA_BITS)
    }
}

/// Parameters for a self-signed certificate
#[derive(Debug, Clone)]
pub struct CertificateRequest {
    pub hosts: Vec<String>,
    /// Start of validity; `None` means now
    pub valid_from: Option<DateTime<Utc>>,
    pub valid_for: Duration,
    pub is_ca: bool,
    pub key: KeySpec,
}

impl CertificateRequest {
    /// Request for a comma-separated host list with default settings
    pub fn new(hosts: &str) -> Self {
        Self {
            hosts: parse_hosts(hosts),
            valid_from: None,
            valid_for: DEFAULT_VALIDITY,
            is_ca: false,
            key: KeySpec::default(),
        }
    }
}

/// Split a comma-separated host list, dropping blanks
pub fn parse_hosts(hosts: &str) -> Vec<String> {
    hosts
        .split(',')
        .map(str::trim)
        .filter(|h| !h.is_empty())
        .map(str::to_string)
        .collect()
}

/// Parse a `--start-date` value as UTC
pub fn parse_start_date(value: &str) -> Result<DateTime<Utc>> {
    NaiveDateTime::parse_from_str(value.trim(), START_DATE_FORMAT)
        .map(|naive| naive.and_utc())
        .map_err(|e| Error::KeyGen(format!("failed to parse start date {:?}: {}", value, e)))
}

/// PEM encoded certificate and private key
#[derive(Debug, Clone)]
pub struct IssuedCertificate {
    pub cert_pem: String,
    pub key_pem: String,
}

/// Produces certificate and key material from a request
pub trait CertificateAuthority {
    fn issue(&self, request: &CertificateRequest) -> Result<IssuedCertificate>;
}

/// Issues self-signed certificates with `rcgen`
#[derive(Debug, Default, Clone, Copy)]
pub struct SelfSignedAuthority;

impl SelfSignedAuthority {
    fn rsa_key_pair(bits: usize) -> Result<KeyPair> {
        // aws-lc-rs only signs with moduli in this range
        if !(2048..=8192).contains(&bits) {
            return Err(Error::KeyGen(format!(
                "RSA key size {} is not supported, use 2048 to 8192 bits",
                bits
            )));
        }
        let key = RsaPrivateKey::new(&mut OsRng, bits)
            .map_err(|e| Error::KeyGen(format!("failed to generate RSA key: {}", e)))?;
        let der = key
            .to_pkcs8_der()
            .map_err(|e| Error::KeyGen(format!("failed to encode RSA key: {}", e)))?;
        KeyPair::try_from(der.as_bytes())
            .map_err(|e| Error::KeyGen(format!("failed to load RSA key: {}", e)))
    }

    fn params(request: &CertificateRequest) -> Result<CertificateParams> {
        let mut params = CertificateParams::default();

        let mut dn = DistinguishedName::new();
        dn.push(DnType::OrganizationName, ORGANIZATION);
        dn.push(DnType::CommonName, request.hosts[0].as_str());
        params.distinguished_name = dn;

        for host in &request.hosts {
            let san = match host.parse::<IpAddr>() {
                Ok(ip) => SanType::IpAddress(ip),
                Err(_) => SanType::DnsName(
                    Ia5String::try_from(host.as_str())
                        .map_err(|e| Error::KeyGen(format!("invalid host {:?}: {}", host, e)))?,
                ),
            };
            params.subject_alt_names.push(san);
        }

        let (not_before, not_after) = validity_bounds(request)?;
        params.not_before = to_offset(not_before)?;
        params.not_after = to_offset(not_after)?;
        params.serial_number = Some(SerialNumber::from(random_serial().to_vec()));

        params.key_usages = vec![KeyUsagePurpose::DigitalSignature];
        if matches!(request.key, KeySpec::Rsa(_)) {
            params.key_usages.push(KeyUsagePurpose::KeyEncipherment);
        }
        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];

        if request.is_ca {
            params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
            params.key_usages.push(KeyUsagePurpose::KeyCertSign);
        } else {
            params.is_ca = IsCa::NoCa;
        }

        Ok(params)
    }

    /// rcgen has no P224 signer, so these certificates are assembled with
    /// the RustCrypto `x509-cert` builder instead
    fn issue_p224(request: &CertificateRequest) -> Result<IssuedCertificate> {
        let keygen = |what: &str, e: &dyn fmt::Display| Error::KeyGen(format!("{}: {}", what, e));

        let secret = p224::SecretKey::random(&mut OsRng);
        let signer = P224SigningKey::from(&secret);
        let public_der = signer
            .verifying_key()
            .to_public_key_der()
            .map_err(|e| keygen("failed to encode P224 public key", &e))?;
        let spki = SubjectPublicKeyInfoOwned::from_der(public_der.as_bytes())
            .map_err(|e| keygen("failed to encode P224 public key", &e))?;

        let subject = Name::from_str(&format!("CN={},O={}", request.hosts[0], ORGANIZATION))
            .map_err(|e| keygen("invalid subject", &e))?;
        let serial = X509Serial::new(&random_serial()).map_err(|e| keygen("invalid serial", &e))?;
        let (not_before, not_after) = validity_bounds(request)?;
        let validity = Validity {
            not_before: to_x509_time(not_before)?,
            not_after: to_x509_time(not_after)?,
        };

        let mut builder = CertificateBuilder::new(
            Profile::Manual { issuer: None },
            serial,
            validity,
            subject,
            spki,
            &signer,
        )
        .map_err(|e| keygen("failed to prepare certificate", &e))?;

        let mut names = Vec::with_capacity(request.hosts.len());
        for host in &request.hosts {
            let name = match host.parse::<IpAddr>() {
                Ok(IpAddr::V4(ip)) => OctetString::new(ip.octets().to_vec()).map(GeneralName::IpAddress),
                Ok(IpAddr::V6(ip)) => OctetString::new(ip.octets().to_vec()).map(GeneralName::IpAddress),
                Err(_) => X509Ia5String::new(host.as_str()).map(GeneralName::DnsName),
            }
            .map_err(|e| keygen(&format!("invalid host {:?}", host), &e))?;
            names.push(name);
        }

        let mut usage = KeyUsage(KeyUsages::DigitalSignature.into());
        if request.is_ca {
            usage.0 |= KeyUsages::KeyCertSign;
            builder
                .add_extension(&X509BasicConstraints {
                    ca: true,
                    path_len_constraint: None,
                })
                .map_err(|e| keygen("failed to add extension", &e))?;
        }
        builder
            .add_extension(&usage)
            .map_err(|e| keygen("failed to add extension", &e))?;
        builder
            .add_extension(&ExtendedKeyUsage(vec![ID_KP_SERVER_AUTH]))
            .map_err(|e| keygen("failed to add extension", &e))?;
        builder
            .add_extension(&SubjectAltName(names))
            .map_err(|e| keygen("failed to add extension", &e))?;

        let cert = builder
            .build::<P224Signature>()
            .map_err(|e| keygen("failed to sign certificate", &e))?;

        Ok(IssuedCertificate {
            cert_pem: cert
                .to_pem(LineEnding::LF)
                .map_err(|e| keygen("failed to encode certificate", &e))?,
            key_pem: secret
                .to_pkcs8_pem(LineEnding::LF)
                .map_err(|e| keygen("failed to encode P224 key", &e))?
                .to_string(),
        })
    }
}

impl CertificateAuthority for SelfSignedAuthority {
    fn issue(&self, request: &CertificateRequest) -> Result<IssuedCertificate> {
        if request.hosts.is_empty() {
            return Err(Error::KeyGen("at least one host is required".to_string()));
        }

        let params = Self::params(request)?;
        let key_pair = match request.key {
            KeySpec::Rsa(bits) => Self::rsa_key_pair(bits)?,
            KeySpec::Ec(curve) => match curve.rcgen_algorithm() {
                Some(alg) => KeyPair::generate_for(alg).map_err(|e| Error::KeyGen(e.to_string()))?,
                None => return Self::issue_p224(request),
            },
        };
        let cert = params
            .self_signed(&key_pair)
            .map_err(|e| Error::KeyGen(format!("failed to sign certificate: {}", e)))?;

        Ok(IssuedCertificate {
            cert_pem: cert.pem(),
            key_pem: key_pair.serialize_pem(),
        })
    }
}

/// Convert a `--duration` in days, rejecting counts that overflow
pub fn validity_days(days: u64) -> Result<Duration> {
    days.checked_mul(24 * 60 * 60)
        .map(Duration::from_secs)
        .ok_or_else(|| Error::KeyGen(format!("validity of {} days is out of range", days)))
}

/// Start and end of the validity window
fn validity_bounds(request: &CertificateRequest) -> Result<(DateTime<Utc>, DateTime<Utc>)> {
    let out_of_range = || {
        Error::KeyGen(format!(
            "validity of {}s is out of range",
            request.valid_for.as_secs()
        ))
    };

    let not_before = request.valid_from.unwrap_or_else(Utc::now);
    let valid_for = chrono::Duration::from_std(request.valid_for).map_err(|_| out_of_range())?;
    let not_after = not_before
        .checked_add_signed(valid_for)
        .ok_or_else(out_of_range)?;

    Ok((not_before, not_after))
}

/// Positive 128-bit serial number
fn random_serial() -> [u8; 16] {
    let mut serial = [0u8; 16];
    OsRng.fill_bytes(&mut serial);
    serial[0] &= 0x7f;
    serial
}

fn to_offset(at: DateTime<Utc>) -> Result<OffsetDateTime> {
    OffsetDateTime::from_unix_timestamp(at.timestamp())
        .map_err(|e| Error::KeyGen(format!("validity bound {} out of range: {}", at, e)))
}

/// UTCTime through 2049, GeneralizedTime after, as RFC 5280 requires
fn to_x509_time(at: DateTime<Utc>) -> Result<Time> {
    let out_of_range = |e: &dyn fmt::Display| {
        Error::KeyGen(format!("validity bound {} out of range: {}", at, e))
    };

    let since_epoch = u64::try_from(at.timestamp())
        .map(Duration::from_secs)
        .map_err(|e| out_of_range(&e))?;

    if at.year() < 2050 {
        UtcTime::from_unix_duration(since_epoch)
            .map(Time::UtcTime)
            .map_err(|e| out_of_range(&e))
    } else {
        GeneralizedTime::from_unix_duration(since_epoch)
            .map(Time::GeneralTime)
            .map_err(|e| out_of_range(&e))
    }
}

/// Certificate chain and private key the TLS listener presents
pub struct TlsMaterial {
    pub certs: Vec<CertificateDer<'static>>,
    pub key: PrivateKeyDer<'static>,
}

impl TlsMaterial {
    /// Server configuration advertising HTTP/1.1 over ALPN
    pub fn server_config(&self) -> Result<Arc<ServerConfig>> {
        let mut config = ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(self.certs.clone(), self.key.clone_key())?;
        config.alpn_protocols = vec![b"http/1.1".to_vec()];
        Ok(Arc::new(config))
    }
}

/// Certificate manager for the on-disk certificate and key pair
#[derive(Debug, Clone)]
pub struct CertificateManager {
    cert_path: PathBuf,
    key_path: PathBuf,
}

impl CertificateManager {
    pub fn new(cert_path: impl Into<PathBuf>, key_path: impl Into<PathBuf>) -> Self {
        Self {
            cert_path: cert_path.into(),
            key_path: key_path.into(),
        }
    }

    /// Manager for `cert.pem` and `key.pem` inside `dir`
    pub fn in_dir<P: AsRef<Path>>(dir: P) -> Self {
        let dir = dir.as_ref();
        Self::new(dir.join(CERT_FILE), dir.join(KEY_FILE))
    }

    pub fn cert_path(&self) -> &Path {
        &self.cert_path
    }

    pub fn key_path(&self) -> &Path {
        &self.key_path
    }

    /// Issue a certificate and replace any existing pair on disk.
    ///
    /// Nothing is written unless issuing succeeds.
    pub fn generate<A: CertificateAuthority>(
        &self,
        authority: &A,
        request: &CertificateRequest,
    ) -> Result<()> {
        let issued = authority.issue(request)?;

        Self::persist(&self.cert_path, issued.cert_pem.as_bytes())?;
        Self::persist(&self.key_path, issued.key_pem.as_bytes())?;
        restrict_permissions(&self.key_path)?;

        info!(
            "Generated certificate for {} at {}",
            request.hosts.join(", "),
            self.cert_path.display()
        );

        Ok(())
    }

    fn persist(path: &Path, contents: &[u8]) -> Result<()> {
        let persist_err = |source| Error::Persist {
            path: path.to_path_buf(),
            source,
        };

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(persist_err)?;
        }
        fs::write(path, contents).map_err(persist_err)
    }

    /// Load the certificate chain and key for serving
    pub fn load(&self) -> Result<TlsMaterial> {
        for path in [&self.cert_path, &self.key_path] {
            if !path.is_file() {
                return Err(Error::NotFound { path: path.clone() });
            }
        }

        let certs = load_certs(&self.cert_path)?;
        let key = load_key(&self.key_path)?;

        info!("Loaded certificate from {}", self.cert_path.display());

        Ok(TlsMaterial { certs, key })
    }
}

#[cfg(unix)]
fn restrict_permissions(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;

    fs::set_permissions(path, fs::Permissions::from_mode(0o600)).map_err(|source| {
        Error::Persist {
            path: path.to_path_buf(),
            source,
        }
    })
}

#[cfg(not(unix))]
fn restrict_permissions(_path: &Path) -> Result<()> {
    Ok(())
}

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>> {
    let mut reader = BufReader::new(fs::File::open(path)?);
    let certs = rustls_pemfile::certs(&mut reader)
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| Error::InvalidCertificate {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

    if certs.is_empty() {
        return Err(Error::InvalidCertificate {
            path: path.to_path_buf(),
            reason: "no certificates found".to_string(),
        });
    }

    Ok(certs)
}

fn load_key(path: &Path) -> Result<PrivateKeyDer<'static>> {
    let mut reader = BufReader::new(fs::File::open(path)?);
    rustls_pemfile::private_key(&mut reader)
        .map_err(|e| Error::InvalidCertificate {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?
        .ok_or_else(|| Error::InvalidCertificate {
            path: path.to_path_buf(),
            reason: "no private key found".to_string(),
        })
}
