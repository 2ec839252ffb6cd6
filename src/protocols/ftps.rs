//! FTPS (FTP over TLS) backend
//!
//! Explicit TLS through `suppaftp::RustlsFtpStream`, ring crypto provider and
//! the platform's native root certificates.

use secrecy::ExposeSecret;
use std::io::Read;
use std::sync::Arc;
use suppaftp::types::{FileType, Mode};
use suppaftp::{RustlsConnector, RustlsFtpStream};

use crate::entry::RemoteEntry;
use crate::error::RemoteError;
use crate::logging::log_with_tag;
use crate::protocols::ftp::parse_listing;
use crate::protocols::{
    ancestor_chain, resolve_addrs, run_sink, ConnectionSettings, RemoteFileOperations,
    RetrieveSink,
};

// Module for insecure certificate verification (for self-signed certs)
mod danger {
    use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
    use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
    use rustls::DigitallySignedStruct;

    /// Certificate verifier that accepts any certificate
    ///
    /// WARNING: only for trusted servers with self-signed certificates.
    #[derive(Debug)]
    pub struct NoCertificateVerification;

    impl ServerCertVerifier for NoCertificateVerification {
        fn verify_server_cert(
            &self,
            _end_entity: &CertificateDer<'_>,
            _intermediates: &[CertificateDer<'_>],
            _server_name: &ServerName<'_>,
            _ocsp_response: &[u8],
            _now: UnixTime,
        ) -> Result<ServerCertVerified, rustls::Error> {
            Ok(ServerCertVerified::assertion())
        }

        fn verify_tls12_signature(
            &self,
            _message: &[u8],
            _cert: &CertificateDer<'_>,
            _dss: &DigitallySignedStruct,
        ) -> Result<HandshakeSignatureValid, rustls::Error> {
            Ok(HandshakeSignatureValid::assertion())
        }

        fn verify_tls13_signature(
            &self,
            _message: &[u8],
            _cert: &CertificateDer<'_>,
            _dss: &DigitallySignedStruct,
        ) -> Result<HandshakeSignatureValid, rustls::Error> {
            Ok(HandshakeSignatureValid::assertion())
        }

        fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
            rustls::crypto::ring::default_provider()
                .signature_verification_algorithms
                .supported_schemes()
        }
    }
}

/// FTP client for explicit FTPS connections
pub struct FtpsClient {
    settings: ConnectionSettings,
    stream: Option<RustlsFtpStream>,
}

impl FtpsClient {
    pub fn new(settings: ConnectionSettings) -> Self {
        FtpsClient {
            settings,
            stream: None,
        }
    }

    fn tls_config(&self) -> Result<Arc<rustls::ClientConfig>, RemoteError> {
        let provider = rustls::crypto::ring::default_provider();
        let builder = rustls::ClientConfig::builder_with_provider(Arc::new(provider))
            .with_safe_default_protocol_versions()
            .map_err(|e| RemoteError::connection(None, e.to_string()))?;

        let config = if self.settings.insecure_skip_verify {
            builder
                .dangerous()
                .with_custom_certificate_verifier(Arc::new(danger::NoCertificateVerification))
                .with_no_client_auth()
        } else {
            let mut root_store = rustls::RootCertStore::empty();
            let certs_result = rustls_native_certs::load_native_certs();
            for cert in certs_result.certs {
                root_store.add(cert).ok();
            }
            if !certs_result.errors.is_empty() {
                let _ = log_with_tag(
                    &format!(
                        "Warning: failed to load some native certificates: {:?}",
                        certs_result.errors
                    ),
                    None,
                );
            }
            builder
                .with_root_certificates(root_store)
                .with_no_client_auth()
        };
        Ok(Arc::new(config))
    }

    fn open(&self) -> Result<RustlsFtpStream, RemoteError> {
        let addrs = resolve_addrs(&self.settings.host, self.settings.port)?;
        let tls_config = self.tls_config()?;

        let mut last_error = None;
        for addr in addrs {
            match RustlsFtpStream::connect_timeout(addr, self.settings.timeout) {
                Ok(plain) => {
                    let connector = RustlsConnector::from(tls_config.clone());
                    match plain.into_secure(connector, &self.settings.host) {
                        Ok(stream) => return Ok(stream),
                        Err(e) => last_error = Some(e),
                    }
                }
                Err(e) => last_error = Some(e),
            }
        }
        Err(last_error
            .map(RemoteError::from)
            .unwrap_or_else(|| RemoteError::connection(None, "no addresses available")))
    }

    fn stream(&mut self) -> Result<&mut RustlsFtpStream, RemoteError> {
        self.stream
            .as_mut()
            .ok_or_else(|| RemoteError::connection(None, "not connected"))
    }
}

impl RemoteFileOperations for FtpsClient {
    fn connect(&mut self) -> Result<(), RemoteError> {
        if self.stream.is_some() {
            return Ok(());
        }
        let mut stream = self.open()?;
        let password = self
            .settings
            .password
            .as_ref()
            .map(|p| p.expose_secret().as_str())
            .unwrap_or("");
        stream.login(self.settings.login.as_str(), password)?;
        // Protect the data channel as well (PROT P)
        stream.custom_command("PBSZ 0", &[suppaftp::Status::CommandOk])?;
        stream.custom_command("PROT P", &[suppaftp::Status::CommandOk])?;
        stream.transfer_type(FileType::Binary)?;
        stream.set_mode(if self.settings.passive {
            Mode::Passive
        } else {
            Mode::Active
        });
        stream.set_passive_nat_workaround(true);
        self.stream = Some(stream);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    fn disconnect(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            let _ = stream.quit();
        }
    }

    fn list_files(&mut self, path: &str) -> Result<Vec<RemoteEntry>, RemoteError> {
        let lines = self.stream()?.list(Some(path))?;
        Ok(parse_listing(path, &lines))
    }

    fn retrieve_file(&mut self, path: &str, sink: &mut RetrieveSink<'_>) -> Result<(), RemoteError> {
        let mut sink_error = None;
        let result = self.stream()?.retr(path, |reader| {
            run_sink(sink, reader, &mut sink_error, suppaftp::FtpError::ConnectionError)
        });
        if let Some(e) = sink_error {
            return Err(RemoteError::Io(e));
        }
        result.map_err(RemoteError::from)
    }

    fn store_file(&mut self, path: &str, mut reader: &mut dyn Read) -> Result<u64, RemoteError> {
        Ok(self.stream()?.put_file(path, &mut reader)?)
    }

    fn append_file(&mut self, path: &str, mut reader: &mut dyn Read) -> Result<u64, RemoteError> {
        Ok(self.stream()?.append_file(path, &mut reader)?)
    }

    fn delete_file(&mut self, path: &str) -> Result<(), RemoteError> {
        Ok(self.stream()?.rm(path)?)
    }

    fn rename_file(&mut self, from: &str, to: &str) -> Result<(), RemoteError> {
        Ok(self.stream()?.rename(from, to)?)
    }

    fn build_directory(&mut self, path: &str, recursive: bool) -> Result<(), RemoteError> {
        let stream = self.stream()?;
        if !recursive {
            return Ok(stream.mkdir(path)?);
        }
        for directory in ancestor_chain(path) {
            if let Err(e) = stream.mkdir(&directory) {
                let e = RemoteError::from(e);
                if e.is_connection_error() {
                    return Err(e);
                }
            }
        }
        Ok(stream.cwd(path)?)
    }

    fn send_noop(&mut self) -> Result<bool, RemoteError> {
        match self.stream.as_mut() {
            None => Ok(false),
            Some(stream) => match stream.noop() {
                Ok(()) => Ok(true),
                Err(e) => {
                    let e = RemoteError::from(e);
                    if e.is_connection_error() {
                        Ok(false)
                    } else {
                        Err(e)
                    }
                }
            },
        }
    }

    fn endpoint(&self) -> String {
        self.settings.endpoint()
    }
}

impl Drop for FtpsClient {
    fn drop(&mut self) {
        self.disconnect();
    }
}
