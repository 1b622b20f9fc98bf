use crate::error::{ProxyError, Result};
use anyhow::Context;
use parking_lot::{Mutex, RwLock};
use rcgen::generate_simple_self_signed;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::server::WebPkiClientVerifier;
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_rustls::rustls;
use tracing::{debug, info};

/// 构造 TLS 材料所需的文件路径
#[derive(Debug, Clone, Default)]
pub struct TlsInfo {
    /// 受信 CA（PEM），服务端用于校验客户端证书，客户端用于校验服务端证书
    pub ca_path: PathBuf,
    /// 本端证书链（PEM）
    pub cert_path: PathBuf,
    /// 本端私钥（PEM）
    pub key_path: PathBuf,
    /// 是否校验对端证书
    pub verify_peer: bool,
}

impl TlsInfo {
    pub fn new(
        ca_path: impl Into<PathBuf>,
        cert_path: impl Into<PathBuf>,
        key_path: impl Into<PathBuf>,
    ) -> Self {
        Self {
            ca_path: ca_path.into(),
            cert_path: cert_path.into(),
            key_path: key_path.into(),
            verify_peer: true,
        }
    }
}

/// 已解析的 TLS 材料
///
/// CA 列表可以在运行期通过 [`TlsMaterial::add_ca_pem`] 追加；
/// 生成的 rustls 配置会被缓存，追加 CA 后缓存失效，下一次握手使用新配置。
pub struct TlsMaterial {
    ca_certs: RwLock<Vec<CertificateDer<'static>>>,
    cert_chain: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
    verify_peer: bool,
    server_cache: Mutex<Option<Arc<rustls::ServerConfig>>>,
    client_cache: Mutex<Option<Arc<rustls::ClientConfig>>>,
}

impl std::fmt::Debug for TlsMaterial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsMaterial")
            .field("ca_certs", &self.ca_certs.read().len())
            .field("cert_chain", &self.cert_chain.len())
            .field("verify_peer", &self.verify_peer)
            .finish()
    }
}

impl TlsMaterial {
    /// 从文件加载 TLS 材料，任何文件不可读或格式错误都返回配置错误
    pub fn load(info: &TlsInfo) -> Result<Self> {
        Self::load_inner(info).map_err(|e| ProxyError::config_error(format!("{:#}", e)))
    }

    fn load_inner(info: &TlsInfo) -> anyhow::Result<Self> {
        let cert_chain = load_certs(&info.cert_path)?;
        if cert_chain.is_empty() {
            anyhow::bail!("No certificate found in {:?}", info.cert_path);
        }
        let key = load_private_key(&info.key_path)?;

        let ca_certs = if info.ca_path.as_os_str().is_empty() {
            Vec::new()
        } else {
            load_certs(&info.ca_path)?
        };
        if info.verify_peer && ca_certs.is_empty() {
            anyhow::bail!("Peer verification requires at least one CA certificate");
        }
        // 提前校验 CA 能被信任库接受
        build_root_store(&ca_certs)?;

        debug!(
            "Loaded TLS material: {} cert(s), {} CA(s)",
            cert_chain.len(),
            ca_certs.len()
        );

        Ok(Self {
            ca_certs: RwLock::new(ca_certs),
            cert_chain,
            key,
            verify_peer: info.verify_peer,
            server_cache: Mutex::new(None),
            client_cache: Mutex::new(None),
        })
    }

    /// 追加一个受信 CA（PEM 格式，可包含多张证书）
    pub fn add_ca_pem(&self, pem: &[u8]) -> Result<()> {
        if pem.is_empty() {
            return Err(ProxyError::config_error("CA content is empty"));
        }

        let mut reader = BufReader::new(pem);
        let certs: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut reader)
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| ProxyError::config_error(format!("Invalid CA PEM: {}", e)))?;
        if certs.is_empty() {
            return Err(ProxyError::config_error("No certificate found in CA PEM"));
        }

        // 先在临时信任库里校验，全部通过后再合并
        build_root_store(&certs).map_err(|e| ProxyError::config_error(format!("{:#}", e)))?;

        let count = certs.len();
        self.ca_certs.write().extend(certs);
        self.server_cache.lock().take();
        self.client_cache.lock().take();

        info!("Appended {} trusted CA certificate(s)", count);
        Ok(())
    }

    /// 当前受信 CA 数量
    pub fn ca_count(&self) -> usize {
        self.ca_certs.read().len()
    }

    pub fn verify_peer(&self) -> bool {
        self.verify_peer
    }

    /// 服务端配置：仅 TLS 1.3，开启对端校验时要求客户端证书
    pub fn server_config(&self) -> Result<Arc<rustls::ServerConfig>> {
        let mut cache = self.server_cache.lock();
        if let Some(config) = cache.as_ref() {
            return Ok(config.clone());
        }

        let config = self
            .build_server_config()
            .map_err(|e| ProxyError::config_error(format!("{:#}", e)))?;
        *cache = Some(config.clone());
        Ok(config)
    }

    fn build_server_config(&self) -> anyhow::Result<Arc<rustls::ServerConfig>> {
        let provider = Arc::new(rustls::crypto::aws_lc_rs::default_provider());
        let builder = rustls::ServerConfig::builder_with_provider(provider.clone())
            .with_protocol_versions(&[&rustls::version::TLS13])
            .context("Failed to select TLS protocol versions")?;

        let builder = if self.verify_peer {
            let roots = Arc::new(build_root_store(&self.ca_certs.read())?);
            let verifier = WebPkiClientVerifier::builder_with_provider(roots, provider)
                .build()
                .context("Failed to build client certificate verifier")?;
            builder.with_client_cert_verifier(verifier)
        } else {
            builder.with_no_client_auth()
        };

        let config = builder
            .with_single_cert(self.cert_chain.clone(), self.key.clone_key())
            .context("Failed to create server config")?;

        Ok(Arc::new(config))
    }

    /// 客户端配置：仅 TLS 1.3，始终出示本端证书
    pub fn client_config(&self) -> Result<Arc<rustls::ClientConfig>> {
        let mut cache = self.client_cache.lock();
        if let Some(config) = cache.as_ref() {
            return Ok(config.clone());
        }

        let config = self
            .build_client_config()
            .map_err(|e| ProxyError::config_error(format!("{:#}", e)))?;
        *cache = Some(config.clone());
        Ok(config)
    }

    fn build_client_config(&self) -> anyhow::Result<Arc<rustls::ClientConfig>> {
        let provider = Arc::new(rustls::crypto::aws_lc_rs::default_provider());
        let roots = build_root_store(&self.ca_certs.read())?;

        let mut config = rustls::ClientConfig::builder_with_provider(provider)
            .with_protocol_versions(&[&rustls::version::TLS13])
            .context("Failed to select TLS protocol versions")?
            .with_root_certificates(roots)
            .with_client_auth_cert(self.cert_chain.clone(), self.key.clone_key())
            .context("Failed to create client config")?;

        // 不校验服务端证书（仅用于测试环境）
        if !self.verify_peer {
            config
                .dangerous()
                .set_certificate_verifier(Arc::new(NoCertificateVerification));
        }

        Ok(Arc::new(config))
    }
}

fn load_certs(path: &Path) -> anyhow::Result<Vec<CertificateDer<'static>>> {
    let file =
        File::open(path).with_context(|| format!("Failed to open cert file: {:?}", path))?;
    let mut reader = BufReader::new(file);
    rustls_pemfile::certs(&mut reader)
        .collect::<std::result::Result<Vec<_>, _>>()
        .with_context(|| format!("Failed to parse certificates in {:?}", path))
}

fn load_private_key(path: &Path) -> anyhow::Result<PrivateKeyDer<'static>> {
    let file =
        File::open(path).with_context(|| format!("Failed to open key file: {:?}", path))?;
    let mut reader = BufReader::new(file);
    rustls_pemfile::private_key(&mut reader)
        .context("Failed to parse private key")?
        .context("No private key found")
}

fn build_root_store(certs: &[CertificateDer<'static>]) -> anyhow::Result<rustls::RootCertStore> {
    let mut store = rustls::RootCertStore::empty();
    for cert in certs {
        store
            .add(cert.clone())
            .context("Failed to add CA certificate")?;
    }
    Ok(store)
}

/// 生成自签名证书和私钥并写入指定路径
pub fn generate_self_signed_cert(
    common_name: &str,
    alt_names: &[String],
    cert_out: &Path,
    key_out: &Path,
) -> anyhow::Result<()> {
    // rcgen 至少需要一个 SAN；确保包含 CN
    let mut names: Vec<String> = if alt_names.is_empty() {
        vec![common_name.to_string()]
    } else {
        alt_names.to_vec()
    };

    if !names.iter().any(|n| n == common_name) {
        names.push(common_name.to_string());
    }

    let cert =
        generate_simple_self_signed(names).context("Failed to generate self-signed certificate")?;
    let cert_pem = cert.cert.pem();
    let key_pem = cert.signing_key.serialize_pem();

    std::fs::write(cert_out, cert_pem)
        .with_context(|| format!("Failed to write certificate to {:?}", cert_out))?;
    std::fs::write(key_out, key_pem)
        .with_context(|| format!("Failed to write private key to {:?}", key_out))?;

    Ok(())
}

/// 不验证证书的验证器（仅用于测试）
#[derive(Debug)]
struct NoCertificateVerification;

impl rustls::client::danger::ServerCertVerifier for NoCertificateVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer,
        _intermediates: &[CertificateDer],
        _server_name: &rustls::pki_types::ServerName,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> std::result::Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer,
        _dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer,
        _dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        rustls::crypto::aws_lc_rs::default_provider()
            .signature_verification_algorithms
            .supported_schemes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct TempCert {
        cert: PathBuf,
        key: PathBuf,
    }

    impl TempCert {
        fn new(tag: &str) -> Self {
            let dir = std::env::temp_dir();
            let id = format!("{}-{}-{}", tag, std::process::id(), uuid::Uuid::new_v4());
            let cert = dir.join(format!("ws-link-cert-{}.pem", id));
            let key = dir.join(format!("ws-link-key-{}.pem", id));
            generate_self_signed_cert("localhost", &["127.0.0.1".to_string()], &cert, &key)
                .unwrap();
            Self { cert, key }
        }

        fn info(&self) -> TlsInfo {
            TlsInfo::new(&self.cert, &self.cert, &self.key)
        }
    }

    impl Drop for TempCert {
        fn drop(&mut self) {
            let _ = std::fs::remove_file(&self.cert);
            let _ = std::fs::remove_file(&self.key);
        }
    }

    #[test]
    fn test_load_and_build_configs() {
        let tmp = TempCert::new("load");
        let material = TlsMaterial::load(&tmp.info()).unwrap();
        assert_eq!(material.ca_count(), 1);

        let server = material.server_config().unwrap();
        let again = material.server_config().unwrap();
        assert!(Arc::ptr_eq(&server, &again));
        assert!(material.client_config().is_ok());
    }

    #[test]
    fn test_missing_file_is_config_error() {
        let info = TlsInfo::new("/nonexistent/ca.pem", "/nonexistent/c.pem", "/nonexistent/k.pem");
        let err = TlsMaterial::load(&info).unwrap_err();
        assert!(err.is_config_error());
    }

    #[test]
    fn test_add_ca_pem() {
        let tmp = TempCert::new("ca");
        let other = TempCert::new("other");
        let material = TlsMaterial::load(&tmp.info()).unwrap();
        let before = material.server_config().unwrap();

        assert!(material.add_ca_pem(b"").unwrap_err().is_config_error());
        assert!(material
            .add_ca_pem(b"-----BEGIN GARBAGE-----\nabc\n")
            .unwrap_err()
            .is_config_error());

        let pem = std::fs::read(&other.cert).unwrap();
        material.add_ca_pem(&pem).unwrap();
        assert_eq!(material.ca_count(), 2);

        // 追加 CA 后重新生成配置
        let after = material.server_config().unwrap();
        assert!(!Arc::ptr_eq(&before, &after));
    }

    #[test]
    fn test_verify_peer_requires_ca() {
        let tmp = TempCert::new("noca");
        let mut info = tmp.info();
        info.ca_path = PathBuf::new();
        assert!(TlsMaterial::load(&info).unwrap_err().is_config_error());

        info.verify_peer = false;
        let material = TlsMaterial::load(&info).unwrap();
        assert_eq!(material.ca_count(), 0);
        assert!(material.server_config().is_ok());
    }
}
