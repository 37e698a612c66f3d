//! Ingress - HTTP Entry Points for Flows
//!
//! `Trellis::http()` is an ingress builder, not a general web server:
//! it wires one GET/POST pair per flow entry point to the lifecycle
//! engine, plus a read-only `/data` export per flow for live
//! monitoring.

use crate::service::handle_request;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::net::TcpListener;
use trellis_core::BranchSpec;
use trellis_runtime::{BasicRenderer, Engine, EngineConfig, MemoryStore};

/// The Trellis framework entry point.
pub struct Trellis;

impl Trellis {
    /// Create an HTTP ingress builder.
    pub fn http() -> HttpIngress {
        HttpIngress::new()
    }
}

/// One served flow: its entry path and the factory for its root branch.
pub struct FlowDef {
    pub entry: String,
    pub root: Arc<dyn Fn() -> BranchSpec + Send + Sync>,
}

/// HTTP ingress builder.
///
/// # Example
///
/// ```rust,ignore
/// Trellis::http()
///     .bind("127.0.0.1:3000")
///     .flow("/survey", build_survey)
///     .run()
///     .await?;
/// ```
pub struct HttpIngress {
    addr: Option<String>,
    flows: HashMap<String, Arc<FlowDef>>,
    engine: Option<Engine>,
}

impl HttpIngress {
    pub fn new() -> Self {
        Self {
            addr: None,
            flows: HashMap::new(),
            engine: None,
        }
    }

    /// Set the bind address for the server.
    pub fn bind(mut self, addr: impl Into<String>) -> Self {
        self.addr = Some(addr.into());
        self
    }

    /// Use a pre-configured engine (custom store, renderer, job queue).
    pub fn engine(mut self, engine: Engine) -> Self {
        self.engine = Some(engine);
        self
    }

    /// Register a flow entry point. `root` produces the flow's root
    /// branch the first time a session visits `path`.
    pub fn flow<F>(mut self, path: impl Into<String>, root: F) -> Self
    where
        F: Fn() -> BranchSpec + Send + Sync + 'static,
    {
        let entry = path.into();
        self.flows.insert(
            entry.clone(),
            Arc::new(FlowDef {
                entry,
                root: Arc::new(root),
            }),
        );
        self
    }

    /// Run the HTTP server.
    pub async fn run(self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        trellis_core::telemetry::init();
        let addr = self.addr.as_deref().unwrap_or("127.0.0.1:3000").to_string();
        let engine = self.engine.unwrap_or_else(default_engine);
        let flows = Arc::new(self.flows);

        let listener = TcpListener::bind(&addr).await?;
        tracing::info!(%addr, flows = flows.len(), "Trellis HTTP ingress listening");

        loop {
            let (stream, peer) = listener.accept().await?;
            let io = TokioIo::new(stream);
            let engine = engine.clone();
            let flows = flows.clone();

            tokio::task::spawn(async move {
                let service = service_fn(move |req| {
                    handle_request(engine.clone(), flows.clone(), req, Some(peer))
                });
                if let Err(err) = http1::Builder::new().serve_connection(io, service).await {
                    tracing::error!(error = ?err, "error serving connection");
                }
            });
        }
    }
}

impl Default for HttpIngress {
    fn default() -> Self {
        Self::new()
    }
}

fn default_engine() -> Engine {
    let config = EngineConfig::default();
    let jobs = trellis_job::JobRunner::start(config.job_config());
    Engine::new(
        Arc::new(MemoryStore::new()),
        Arc::new(BasicRenderer),
        jobs,
        config,
    )
}
