//! Route and certificate tables for the reverse proxy
//!
//! The tables are rebuilt from the registry file on disk and swapped in
//! atomically; in-flight requests keep whatever table they started with.
//! Hostnames of apps that are not reachable still get an entry, the 503
//! sentinel, so the proxy can answer immediately instead of treating them
//! as unknown.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use rustls::crypto::ring::sign::any_supported_type;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use serde::Deserialize;
use tokio::sync::{mpsc, watch};
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info, warn};

use crate::config::PathsConfig;
use crate::error::{AgentError, AgentResult};
use crate::registry::AppStatus;
use crate::supervisor::SupervisorEvent;

/// Where a hostname's traffic goes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteTarget {
    /// Proxy to `127.0.0.1:<port>`.
    Forward(u16),
    /// Known hostname, app not reachable right now.
    Unavailable,
}

/// One immutable snapshot of the route and certificate tables.
#[derive(Debug)]
pub struct Tables {
    routes: HashMap<String, RouteTarget>,
    certs: HashMap<String, Arc<CertifiedKey>>,
    default_cert: Arc<CertifiedKey>,
}

impl Tables {
    pub fn route(&self, hostname: &str) -> Option<RouteTarget> {
        self.routes.get(hostname).copied()
    }

    /// Certificate served for an SNI name; unknown names get the default.
    pub fn certificate(&self, server_name: &str) -> Arc<CertifiedKey> {
        self.certs
            .get(server_name)
            .cloned()
            .unwrap_or_else(|| self.default_cert.clone())
    }

    pub fn route_count(&self) -> usize {
        self.routes.len()
    }

    fn has_certificate(&self, server_name: &str) -> bool {
        self.certs.contains_key(server_name)
    }
}

/// Shared handle to the current tables. Cheap to clone; every listener and
/// the rebuild loop hold one.
#[derive(Debug, Clone)]
pub struct RoutingTables {
    current: Arc<RwLock<Arc<Tables>>>,
}

impl RoutingTables {
    pub fn new(initial: Tables) -> Self {
        Self {
            current: Arc::new(RwLock::new(Arc::new(initial))),
        }
    }

    /// Snapshot of the current tables.
    pub fn load(&self) -> Arc<Tables> {
        self.current.read().clone()
    }

    pub fn install(&self, tables: Tables) {
        *self.current.write() = Arc::new(tables);
    }
}

/// The registry fields the proxy cares about. Parsed leniently so one
/// mangled record cannot take every hosted domain offline; `status` stays
/// raw JSON so a value this build does not recognize cannot fail the record.
#[derive(Debug, Deserialize)]
struct RoutedRecord {
    id: Option<String>,
    domains: Option<Vec<String>>,
    port: Option<u16>,
    status: Option<serde_json::Value>,
    key: Option<String>,
    cert: Option<String>,
    passphrase: Option<String>,
    ca: Option<String>,
}

pub struct TableBuilder {
    registry_file: PathBuf,
    host_ip: String,
    api_port: u16,
    default_cert: Arc<CertifiedKey>,
}

impl TableBuilder {
    pub fn new(
        registry_file: PathBuf,
        host_ip: String,
        api_port: u16,
        default_cert: Arc<CertifiedKey>,
    ) -> Arc<Self> {
        Arc::new(Self {
            registry_file,
            host_ip,
            api_port,
            default_cert,
        })
    }

    /// Build fresh tables from the registry file on disk. The file is read
    /// anew each time; the registry process may have rewritten it since the
    /// last build. Individual bad records are skipped, an unreadable file
    /// fails the whole build.
    pub async fn build(&self) -> AgentResult<Tables> {
        let contents = tokio::fs::read_to_string(&self.registry_file).await?;
        let values: Vec<serde_json::Value> = serde_json::from_str(&contents).map_err(|e| {
            AgentError::Internal(format!("registry file does not parse: {e}"))
        })?;

        let mut routes = HashMap::new();
        let mut certs = HashMap::new();
        for value in values {
            let record: RoutedRecord = match serde_json::from_value(value) {
                Ok(record) => record,
                Err(err) => {
                    warn!(%err, "skipping unreadable registry record");
                    continue;
                }
            };
            let id = record.id.as_deref().unwrap_or("<unknown>");
            let (Some(domains), Some(port)) = (record.domains.as_ref(), record.port) else {
                warn!(app = %id, "skipping record without domains and port");
                continue;
            };

            // A status that is absent or not a known reachable value keeps
            // the domains mapped to the sentinel, never dropped.
            let reachable = record
                .status
                .and_then(|status| serde_json::from_value::<AppStatus>(status).ok())
                .map(AppStatus::is_reachable)
                .unwrap_or(false);
            let target = if reachable {
                RouteTarget::Forward(port)
            } else {
                RouteTarget::Unavailable
            };
            for domain in domains {
                routes.insert(domain.clone(), target);
            }

            if let (Some(key), Some(cert)) = (&record.key, &record.cert) {
                if record.passphrase.is_some() {
                    warn!(app = %id, "passphrase-protected keys are not supported, serving the default certificate");
                } else {
                    match build_certified_key(key, cert, record.ca.as_deref()) {
                        Ok(certified) => {
                            let certified = Arc::new(certified);
                            for domain in domains {
                                certs.insert(domain.clone(), certified.clone());
                            }
                        }
                        Err(err) => {
                            warn!(app = %id, %err, "app certificate unusable, serving the default certificate");
                        }
                    }
                }
            }
        }

        // The management API is reachable through the proxy at the host's
        // own address.
        routes.insert(self.host_ip.clone(), RouteTarget::Forward(self.api_port));

        Ok(Tables {
            routes,
            certs,
            default_cert: self.default_cert.clone(),
        })
    }
}

/// Build a rustls server certificate from uploaded PEM material. The chain
/// is leaf first, then any CA bundle split into its constituent blocks.
pub fn build_certified_key(
    key_pem: &str,
    cert_pem: &str,
    ca_pem: Option<&str>,
) -> AgentResult<CertifiedKey> {
    let mut chain = read_cert_chain(cert_pem)?;
    if let Some(ca) = ca_pem {
        chain.extend(read_cert_chain(ca)?);
    }
    let key = read_private_key(key_pem)?;
    let signing = any_supported_type(&key)
        .map_err(|e| AgentError::Validation(format!("unsupported private key: {e}")))?;
    Ok(CertifiedKey::new(chain, signing))
}

fn read_cert_chain(pem: &str) -> AgentResult<Vec<CertificateDer<'static>>> {
    let mut reader = pem.as_bytes();
    let certs = rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| AgentError::Validation(format!("certificate does not parse: {e}")))?;
    if certs.is_empty() {
        return Err(AgentError::Validation(
            "no certificates in PEM block".to_string(),
        ));
    }
    Ok(certs)
}

fn read_private_key(pem: &str) -> AgentResult<PrivateKeyDer<'static>> {
    let mut reader = pem.as_bytes();
    loop {
        match rustls_pemfile::read_one(&mut reader)
            .map_err(|e| AgentError::Validation(format!("private key does not parse: {e}")))?
        {
            Some(rustls_pemfile::Item::Pkcs1Key(key)) => return Ok(key.into()),
            Some(rustls_pemfile::Item::Pkcs8Key(key)) => return Ok(key.into()),
            Some(rustls_pemfile::Item::Sec1Key(key)) => return Ok(key.into()),
            None => break,
            _ => continue,
        }
    }
    Err(AgentError::Validation(
        "no private key in PEM block".to_string(),
    ))
}

/// Default certificate for SNI names without uploaded material. Generated
/// self-signed on first boot and persisted next to the registry.
pub async fn load_or_generate_default_cert(
    paths: &PathsConfig,
    host_ip: &str,
) -> AgentResult<Arc<CertifiedKey>> {
    let cert_path = paths.cert_file();
    let key_path = paths.key_file();

    let loaded = match (
        tokio::fs::read_to_string(&cert_path).await,
        tokio::fs::read_to_string(&key_path).await,
    ) {
        (Ok(cert), Ok(key)) => Some((cert, key)),
        _ => None,
    };
    let (cert_pem, key_pem) = match loaded {
        Some(pair) => pair,
        None => {
            let subject_alt_names = vec![host_ip.to_string(), "localhost".to_string()];
            let rcgen::CertifiedKey { cert, key_pair } =
                rcgen::generate_simple_self_signed(subject_alt_names).map_err(|e| {
                    AgentError::Internal(format!("failed to generate default certificate: {e}"))
                })?;
            let cert_pem = cert.pem();
            let key_pem = key_pair.serialize_pem();
            tokio::fs::write(&cert_path, &cert_pem).await?;
            tokio::fs::write(&key_path, &key_pem).await?;
            info!(cert = %cert_path.display(), "generated default self-signed certificate");
            (cert_pem, key_pem)
        }
    };

    Ok(Arc::new(build_certified_key(&key_pem, &cert_pem, None)?))
}

/// Picks the served certificate per TLS connection from the live tables.
#[derive(Debug)]
pub struct SniResolver {
    tables: RoutingTables,
}

impl SniResolver {
    pub fn new(tables: RoutingTables) -> Arc<Self> {
        Arc::new(Self { tables })
    }
}

impl ResolvesServerCert for SniResolver {
    fn resolve(&self, client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        let tables = self.tables.load();
        let name = client_hello.server_name().unwrap_or("");
        Some(tables.certificate(name))
    }
}

pub fn tls_acceptor(tables: RoutingTables) -> TlsAcceptor {
    let config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_cert_resolver(SniResolver::new(tables));
    TlsAcceptor::from(Arc::new(config))
}

/// Rebuild on a timer and on every app start. A failed build keeps the
/// last good tables in place.
pub fn spawn_rebuild_loop(
    builder: Arc<TableBuilder>,
    tables: RoutingTables,
    mut events: mpsc::UnboundedReceiver<SupervisorEvent>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        // The caller built once before spawning; skip the immediate tick.
        let start = tokio::time::Instant::now() + interval;
        let mut ticker = tokio::time::interval_at(start, interval);
        let mut events_open = true;
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    rebuild(&builder, &tables, "interval").await;
                }
                event = events.recv(), if events_open => {
                    match event {
                        Some(SupervisorEvent::Started { id }) => {
                            debug!(app = %id, "rebuilding tables after app start");
                            rebuild(&builder, &tables, "app start").await;
                        }
                        None => events_open = false,
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        debug!("table rebuild loop stopping");
                        break;
                    }
                }
            }
        }
    })
}

async fn rebuild(builder: &TableBuilder, tables: &RoutingTables, reason: &str) {
    match builder.build().await {
        Ok(next) => {
            debug!(reason, routes = next.route_count(), "routing tables rebuilt");
            tables.install(next);
        }
        Err(err) => {
            error!(reason, %err, "table rebuild failed, keeping last good tables");
        }
    }
}
