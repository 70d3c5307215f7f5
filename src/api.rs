//! HTTP management API for the control plane
//!
//! Manual route matching over a hyper service, one handler per endpoint.
//! Everything except the info probe requires the shared secret; rejected
//! credentials are answered late so guessing stays expensive.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use http_body_util::{BodyExt, Full, Limited};
use hyper::body::{Bytes, Incoming};
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::config::{hash_secret, PathsConfig, TimingConfig};
use crate::error::{api_error_response, AgentBody, AgentError, AgentResult};
use crate::info;
use crate::package;
use crate::registry::{AppPatch, AppRegistry, EnvValue, TlsMaterial};
use crate::runtime::{InstallAck, RuntimeManager};
use crate::supervisor::Supervisor;

/// Header carrying the shared secret. The `secret` query parameter is the
/// fallback for callers that cannot set headers.
const SECRET_HEADER: &str = "x-agent-secret";

/// Request body cap. Packages arrive base64-encoded inside a JSON field,
/// so this also bounds the largest accepted upload.
const MAX_BODY_BYTES: usize = 100 * 1024 * 1024;

#[derive(Debug, Deserialize)]
struct CreateAppRequest {
    id: String,
    #[serde(default)]
    env: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct PushRequest {
    #[serde(default)]
    pkg: Option<Value>,
    #[serde(default)]
    skip_install: bool,
}

#[derive(Debug, Deserialize)]
struct SetVarRequest {
    key: String,
    #[serde(default)]
    val: Value,
}

#[derive(Debug, Deserialize)]
struct SslUploadRequest {
    key: String,
    cert: String,
    #[serde(default)]
    passphrase: Option<String>,
    #[serde(default)]
    ca: Option<String>,
}

/// Everything the request handlers reach for, shared across connections.
pub struct ApiContext {
    pub paths: PathsConfig,
    pub timing: TimingConfig,
    pub registry: Arc<AppRegistry>,
    pub supervisor: Arc<Supervisor>,
    pub runtime: Arc<RuntimeManager>,
    /// Hash of the shared secret, as stored in the host identity file.
    pub secret_hash: String,
    pub started_at: Instant,
}

/// The management listener. One task per connection, handlers run inline.
pub struct ApiServer {
    listener: TcpListener,
    context: ApiContext,
    shutdown: watch::Receiver<bool>,
}

impl ApiServer {
    pub async fn bind(
        addr: SocketAddr,
        context: ApiContext,
        shutdown: watch::Receiver<bool>,
    ) -> AgentResult<Arc<Self>> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Arc::new(Self {
            listener,
            context,
            shutdown,
        }))
    }

    pub fn local_addr(&self) -> AgentResult<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub async fn run(self: Arc<Self>) -> AgentResult<()> {
        info!(addr = %self.listener.local_addr()?, "management api listening");

        let mut shutdown = self.shutdown.clone();
        loop {
            tokio::select! {
                accepted = self.listener.accept() => {
                    match accepted {
                        Ok((stream, addr)) => {
                            let server = Arc::clone(&self);
                            tokio::spawn(async move {
                                if let Err(err) = server.serve_connection(stream).await {
                                    debug!(%addr, %err, "api connection error");
                                }
                            });
                        }
                        Err(err) => {
                            error!(%err, "failed to accept api connection");
                        }
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("management api shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }

    async fn serve_connection(self: Arc<Self>, stream: TcpStream) -> AgentResult<()> {
        let io = TokioIo::new(stream);
        let service = service_fn(move |req| {
            let server = Arc::clone(&self);
            async move { Ok::<_, std::convert::Infallible>(server.handle_request(req).await) }
        });

        AutoBuilder::new(TokioExecutor::new())
            .serve_connection(io, service)
            .await
            .map_err(|err| AgentError::Internal(format!("api connection failed: {err}")))?;

        Ok(())
    }

    async fn handle_request(self: Arc<Self>, req: Request<Incoming>) -> Response<AgentBody> {
        let method = req.method().clone();
        let path = req.uri().path().to_string();
        debug!(%method, %path, "api request");

        // The info probe stays open so the control plane can identify an
        // agent before it holds credentials for it.
        if method == Method::GET && path == "/" {
            return self
                .host_info()
                .await
                .unwrap_or_else(|err| api_error_response(&err));
        }

        if !authorized(&req, &self.context.secret_hash) {
            warn!(%method, %path, "api request with missing or wrong secret");
            tokio::time::sleep(self.context.timing.auth_delay()).await;
            return api_error_response(&AgentError::Unauthorized);
        }

        match self.dispatch(method.clone(), &path, req).await {
            Ok(response) => response,
            Err(err) => {
                match &err {
                    AgentError::Io(_) | AgentError::Internal(_) => {
                        error!(%method, %path, %err, "api request failed");
                    }
                    _ => debug!(%method, %path, %err, "api request rejected"),
                }
                api_error_response(&err)
            }
        }
    }

    async fn dispatch(
        &self,
        method: Method,
        path: &str,
        req: Request<Incoming>,
    ) -> AgentResult<Response<AgentBody>> {
        match (method, path) {
            (Method::GET, "/logs") => self.host_logs().await,
            (Method::POST, "/apps") => self.create_app(req).await,

            (Method::GET, path) if path.starts_with("/apps/") && path.ends_with("/logs") => {
                let id = path
                    .strip_prefix("/apps/")
                    .and_then(|p| p.strip_suffix("/logs"))
                    .unwrap_or("");
                self.app_logs(id).await
            }
            (Method::GET, path) if path.starts_with("/apps/") && path.matches('/').count() == 2 => {
                let id = path.strip_prefix("/apps/").unwrap_or("");
                self.get_app(id).await
            }
            (Method::DELETE, path)
                if path.starts_with("/apps/") && path.matches('/').count() == 2 =>
            {
                let id = path.strip_prefix("/apps/").unwrap_or("");
                self.delete_app(id).await
            }

            (Method::PUT, path) if path.ends_with("/pkg") => {
                let id = path
                    .strip_prefix("/apps/")
                    .and_then(|p| p.strip_suffix("/pkg"))
                    .unwrap_or("");
                self.push_app(id, req).await
            }
            (Method::PUT, path) if path.ends_with("/start") => {
                let id = path
                    .strip_prefix("/apps/")
                    .and_then(|p| p.strip_suffix("/start"))
                    .unwrap_or("");
                self.start_app(id).await
            }
            (Method::PUT, path) if path.ends_with("/restart") => {
                let id = path
                    .strip_prefix("/apps/")
                    .and_then(|p| p.strip_suffix("/restart"))
                    .unwrap_or("");
                self.restart_app(id).await
            }
            (Method::PUT, path) if path.ends_with("/kill") => {
                let id = path
                    .strip_prefix("/apps/")
                    .and_then(|p| p.strip_suffix("/kill"))
                    .unwrap_or("");
                self.kill_app(id).await
            }
            (Method::PUT, path) if path.ends_with("/env") => {
                let id = path
                    .strip_prefix("/apps/")
                    .and_then(|p| p.strip_suffix("/env"))
                    .unwrap_or("");
                self.replace_env(id, req).await
            }
            (Method::PUT, path) if path.ends_with("/setvar") => {
                let id = path
                    .strip_prefix("/apps/")
                    .and_then(|p| p.strip_suffix("/setvar"))
                    .unwrap_or("");
                self.set_var(id, req).await
            }
            (Method::PUT, path) if path.ends_with("/ssl") => {
                let id = path
                    .strip_prefix("/apps/")
                    .and_then(|p| p.strip_suffix("/ssl"))
                    .unwrap_or("");
                self.upload_ssl(id, req).await
            }

            (Method::POST, path) if path.starts_with("/node/") => {
                let version = path.strip_prefix("/node/").unwrap_or("");
                self.install_runtime(version).await
            }

            _ => Err(AgentError::NotFound("no route matched".to_string())),
        }
    }

    async fn host_info(&self) -> AgentResult<Response<AgentBody>> {
        let ctx = &self.context;
        let report = info::collect(
            &ctx.paths,
            &ctx.registry,
            &ctx.supervisor,
            &ctx.runtime,
            ctx.started_at,
        )
        .await;
        json_response(StatusCode::OK, &report)
    }

    async fn host_logs(&self) -> AgentResult<Response<AgentBody>> {
        let mut files = serde_json::Map::new();
        for (name, path) in self.context.paths.host_log_files() {
            let value = match tokio::fs::read_to_string(&path).await {
                Ok(contents) => Value::String(contents),
                Err(err) => {
                    warn!(file = %path.display(), %err, "host log file unreadable");
                    Value::Null
                }
            };
            files.insert(name.to_string(), value);
        }
        json_response(StatusCode::OK, &Value::Object(files))
    }

    async fn create_app(&self, req: Request<Incoming>) -> AgentResult<Response<AgentBody>> {
        let body: CreateAppRequest = read_json(req).await?;
        let env = lenient_env(body.env)?;
        let record = self.context.registry.create(&body.id, env).await?;
        json_response(StatusCode::OK, &record)
    }

    async fn get_app(&self, id: &str) -> AgentResult<Response<AgentBody>> {
        let record = self.context.registry.get(id).await?;
        json_response(StatusCode::OK, &record)
    }

    async fn app_logs(&self, id: &str) -> AgentResult<Response<AgentBody>> {
        let record = self.context.registry.get(id).await?;
        let stdout = tokio::fs::read_to_string(&record.stdout_log)
            .await
            .unwrap_or_default();
        let stderr = tokio::fs::read_to_string(&record.stderr_log)
            .await
            .unwrap_or_default();
        json_response(
            StatusCode::OK,
            &serde_json::json!({ "stdout": stdout, "stderr": stderr }),
        )
    }

    async fn push_app(&self, id: &str, req: Request<Incoming>) -> AgentResult<Response<AgentBody>> {
        let body: PushRequest = read_json(req).await?;
        let encoded = match body.pkg {
            Some(Value::String(encoded)) => encoded,
            Some(_) => {
                return Err(AgentError::Validation(
                    "pkg must be a base64-encoded string".to_string(),
                ));
            }
            None => return Err(AgentError::Validation("pkg is required".to_string())),
        };

        let ctx = &self.context;
        let record = package::push_package(
            &ctx.registry,
            &ctx.paths,
            &ctx.runtime,
            id,
            &encoded,
            body.skip_install,
        )
        .await?;
        json_response(StatusCode::OK, &record)
    }

    async fn start_app(&self, id: &str) -> AgentResult<Response<AgentBody>> {
        let record = self.context.supervisor.start(id).await?;
        json_response(StatusCode::OK, &record)
    }

    async fn restart_app(&self, id: &str) -> AgentResult<Response<AgentBody>> {
        let record = self.context.supervisor.restart(id).await?;
        json_response(StatusCode::OK, &record)
    }

    async fn kill_app(&self, id: &str) -> AgentResult<Response<AgentBody>> {
        self.context.supervisor.kill(id).await?;
        json_response(
            StatusCode::OK,
            &serde_json::json!({ "message": format!("{id} was stopped.") }),
        )
    }

    async fn replace_env(
        &self,
        id: &str,
        req: Request<Incoming>,
    ) -> AgentResult<Response<AgentBody>> {
        let body: Value = read_json(req).await?;
        let env = env_map(body)?;
        let patch = AppPatch {
            env: Some(env),
            ..AppPatch::default()
        };
        let record = self.context.registry.update(id, patch).await?;
        json_response(StatusCode::OK, &record)
    }

    async fn set_var(&self, id: &str, req: Request<Incoming>) -> AgentResult<Response<AgentBody>> {
        let body: SetVarRequest = read_json(req).await?;
        let value = EnvValue::coerce(body.val)?;
        let record = self
            .context
            .registry
            .set_env_var(id, &body.key, value)
            .await?;
        json_response(StatusCode::OK, &record)
    }

    async fn upload_ssl(
        &self,
        id: &str,
        req: Request<Incoming>,
    ) -> AgentResult<Response<AgentBody>> {
        let body: SslUploadRequest = read_json(req).await?;
        if body.key.trim().is_empty() || body.cert.trim().is_empty() {
            return Err(AgentError::Validation(
                "key and cert must be non-empty PEM strings".to_string(),
            ));
        }
        let record = self
            .context
            .registry
            .set_tls(
                id,
                TlsMaterial {
                    key: body.key,
                    cert: body.cert,
                    passphrase: body.passphrase,
                    ca: body.ca,
                },
            )
            .await?;
        json_response(StatusCode::OK, &record)
    }

    async fn delete_app(&self, id: &str) -> AgentResult<Response<AgentBody>> {
        match self.context.supervisor.kill(id).await {
            Ok(_) => {}
            // Not running is fine; a failed termination would orphan the
            // process, so it aborts the delete.
            Err(AgentError::NotFound(_)) => {}
            Err(err) => return Err(err),
        }
        let record = self.context.registry.remove(id).await?;
        json_response(StatusCode::OK, &record)
    }

    async fn install_runtime(&self, version: &str) -> AgentResult<Response<AgentBody>> {
        let message = match self.context.runtime.install(version).await? {
            InstallAck::Completed => "install complete",
            InstallAck::Started => "install started",
        };
        json_response(StatusCode::OK, &serde_json::json!({ "message": message }))
    }
}

/// The wire carries the plaintext secret; only its hash is stored, so the
/// presented value is hashed before comparing.
fn authorized<B>(req: &Request<B>, secret_hash: &str) -> bool {
    let provided = req
        .headers()
        .get(SECRET_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .or_else(|| {
            req.uri()
                .query()
                .and_then(|query| query_param(query, "secret"))
        });

    match provided {
        Some(plain) => hash_secret(&plain) == secret_hash,
        None => false,
    }
}

/// Pull one value out of a query string without parsing the rest.
fn query_param(query: &str, name: &str) -> Option<String> {
    query.split('&').find_map(|pair| {
        let (key, value) = pair.split_once('=')?;
        if key != name {
            return None;
        }
        match urlencoding::decode(value) {
            Ok(decoded) => Some(decoded.into_owned()),
            Err(_) => Some(value.to_string()),
        }
    })
}

/// Create accepts `env` either as a JSON object or as a JSON-encoded string
/// of one. A string that does not decode to an object falls back to an empty
/// map rather than failing the create.
fn lenient_env(value: Option<Value>) -> AgentResult<BTreeMap<String, EnvValue>> {
    let value = match value {
        None | Some(Value::Null) => return Ok(BTreeMap::new()),
        Some(Value::String(text)) => match serde_json::from_str::<Value>(&text) {
            Ok(decoded @ Value::Object(_)) => decoded,
            _ => return Ok(BTreeMap::new()),
        },
        Some(other) => other,
    };
    env_map(value)
}

fn env_map(value: Value) -> AgentResult<BTreeMap<String, EnvValue>> {
    let Value::Object(fields) = value else {
        return Err(AgentError::Validation(
            "env must be a JSON object of string or number values".to_string(),
        ));
    };
    let mut env = BTreeMap::new();
    for (key, value) in fields {
        env.insert(key, EnvValue::from_value(value)?);
    }
    Ok(env)
}

/// Collect a request body under the upload cap.
async fn read_body(req: Request<Incoming>) -> AgentResult<Bytes> {
    match Limited::new(req.into_body(), MAX_BODY_BYTES).collect().await {
        Ok(collected) => Ok(collected.to_bytes()),
        Err(err) => {
            if err
                .downcast_ref::<http_body_util::LengthLimitError>()
                .is_some()
            {
                Err(AgentError::TooLarge)
            } else {
                Err(AgentError::Internal(format!(
                    "failed to read request body: {err}"
                )))
            }
        }
    }
}

async fn read_json<T: serde::de::DeserializeOwned>(req: Request<Incoming>) -> AgentResult<T> {
    let bytes = read_body(req).await?;
    serde_json::from_slice(&bytes)
        .map_err(|err| AgentError::Validation(format!("invalid request body: {err}")))
}

fn json_response<T: Serialize>(status: StatusCode, data: &T) -> AgentResult<Response<AgentBody>> {
    let json = serde_json::to_string(data)
        .map_err(|err| AgentError::Internal(format!("response serialization failed: {err}")))?;
    let body = Full::new(Bytes::from(json)).map_err(|e| match e {}).boxed();
    Ok(Response::builder()
        .status(status)
        .header("Content-Type", "application/json")
        .body(body)
        .expect("valid response with StatusCode enum and static headers"))
}
