//! Service supervision
//!
//! A [`ProcessSupervisor`] owns one [`ServiceInstance`] per configured
//! service. Each instance runs at most one child on a pseudo-terminal and
//! streams its output to an [`OutputSink`] from a dedicated reader thread.

use crate::config::ServiceConfig;
use crate::dirs::DirectoryScope;
use crate::pty::{self, PtyProcess, PtyReader, SpawnSpec};
use crate::vars::{TemplateError, VarResolver};
use futures::future::join_all;
use parking_lot::RwLock;
use std::io::{self, Read};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, error, info, warn};

/// Bytes read from a terminal per chunk
const READ_CHUNK_SIZE: usize = 1024;

/// Emitted after output that ended without a newline
pub const MISSING_NEWLINE_MARKER: &str = "%";

/// State of a service instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum InstanceState {
    /// No process
    Stopped,
    /// Resolving the command and spawning
    Starting,
    /// Process spawned and owned by the instance
    Running,
    /// Interrupt sent, waiting for exit
    Stopping,
}

/// One item of a service's output stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputEvent {
    Text(String),
    /// The viewer should clear previous output (sent once per start)
    Clear,
}

/// Receives output events; called from reader threads
pub trait OutputSink: Send + Sync {
    fn emit(&self, event: OutputEvent);
}

impl OutputSink for mpsc::UnboundedSender<OutputEvent> {
    fn emit(&self, event: OutputEvent) {
        // A closed receiver means nobody is watching any more
        let _ = self.send(event);
    }
}

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("service '{service}': failed to create directories: {source}")]
    CreateDirs {
        service: String,
        #[source]
        source: io::Error,
    },

    #[error("service '{service}': {source}")]
    Template {
        service: String,
        #[source]
        source: TemplateError,
    },

    #[error("service '{service}': failed to load env file: {source}")]
    EnvFile {
        service: String,
        #[source]
        source: dotenvy::Error,
    },

    #[error("service '{service}': failed to spawn: {source}")]
    Spawn {
        service: String,
        #[source]
        source: io::Error,
    },
}

/// A configured service and its (at most one) running process
pub struct ServiceInstance {
    config: ServiceConfig,
    scope: DirectoryScope,
    resolver: VarResolver,
    grace_period: Duration,
    state: RwLock<InstanceState>,
    /// Serializes start and stop
    process: Mutex<Option<Box<dyn PtyProcess>>>,
}

impl ServiceInstance {
    pub fn new(
        config: ServiceConfig,
        scope: DirectoryScope,
        resolver: VarResolver,
        grace_period: Duration,
    ) -> Self {
        Self {
            resolver: resolver.with_local(scope.clone()),
            config,
            scope,
            grace_period,
            state: RwLock::new(InstanceState::Stopped),
            process: Mutex::new(None),
        }
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    pub fn scope(&self) -> &DirectoryScope {
        &self.scope
    }

    pub fn state(&self) -> InstanceState {
        *self.state.read()
    }

    fn set_state(&self, state: InstanceState) {
        *self.state.write() = state;
    }

    /// OS process id of the live child, if any
    pub async fn pid(&self) -> Option<u32> {
        self.process.lock().await.as_ref().and_then(|p| p.pid())
    }

    /// Whether a child is alive right now
    pub async fn is_running(&self) -> bool {
        self.process
            .lock()
            .await
            .as_mut()
            .map(|p| p.is_running())
            .unwrap_or(false)
    }

    /// Spawn the service unless it is already running
    pub async fn start(&self, sink: Arc<dyn OutputSink>) -> Result<(), SupervisorError> {
        let mut guard = self.process.lock().await;

        if let Some(process) = guard.as_mut() {
            if process.is_running() {
                debug!(service = %self.name(), "Service already running");
                return Ok(());
            }
            // Exited on its own; reap it before respawning
            debug!(service = %self.name(), "Previous process has exited");
            *guard = None;
        }

        self.set_state(InstanceState::Starting);
        match self.spawn_process(&sink) {
            Ok(process) => {
                info!(service = %self.name(), pid = ?process.pid(), "Service started");
                *guard = Some(process);
                self.set_state(InstanceState::Running);
                Ok(())
            }
            Err(e) => {
                error!(service = %self.name(), error = %e, "Failed to start service");
                sink.emit(OutputEvent::Text(format!("{}\n", e)));
                self.set_state(InstanceState::Stopped);
                Err(e)
            }
        }
    }

    fn spawn_process(
        &self,
        sink: &Arc<dyn OutputSink>,
    ) -> Result<Box<dyn PtyProcess>, SupervisorError> {
        let service = || self.name().to_string();

        self.scope
            .create_all()
            .map_err(|source| SupervisorError::CreateDirs {
                service: service(),
                source,
            })?;

        let argv = self
            .resolver
            .resolve_all(&self.config.argv())
            .map_err(|source| SupervisorError::Template {
                service: service(),
                source,
            })?;

        sink.emit(OutputEvent::Clear);
        sink.emit(OutputEvent::Text(format!(
            "$ cd {} && {}\n",
            self.config.cwd,
            shell_words::join(&argv)
        )));

        let env = self
            .config
            .environment()
            .map_err(|source| SupervisorError::EnvFile {
                service: service(),
                source,
            })?;

        let spec = SpawnSpec {
            argv,
            cwd: self.config.cwd_path(),
            env,
        };
        let mut process = pty::spawn(&spec).map_err(|source| SupervisorError::Spawn {
            service: service(),
            source,
        })?;

        if let Some(reader) = process.take_reader() {
            spawn_output_reader(self.name(), reader, Arc::clone(sink)).map_err(|source| {
                SupervisorError::Spawn {
                    service: service(),
                    source,
                }
            })?;
        }

        Ok(process)
    }

    /// Interrupt, wait for the grace period, then kill. No-op when stopped.
    pub async fn stop(&self) {
        let mut guard = self.process.lock().await;
        let Some(mut process) = guard.take() else {
            debug!(service = %self.name(), "Service not running");
            return;
        };

        self.set_state(InstanceState::Stopping);
        info!(service = %self.name(), pid = ?process.pid(), "Stopping service");

        match process.stop(self.grace_period).await {
            Ok(status) => info!(service = %self.name(), ?status, "Service exited"),
            Err(e) => warn!(service = %self.name(), error = %e, "Error while stopping service"),
        }

        self.set_state(InstanceState::Stopped);
    }

    pub async fn restart(&self, sink: Arc<dyn OutputSink>) -> Result<(), SupervisorError> {
        self.stop().await;
        self.start(sink).await
    }
}

/// Read `reader` to the end on its own thread, forwarding decoded text
fn spawn_output_reader(
    service: &str,
    mut reader: PtyReader,
    sink: Arc<dyn OutputSink>,
) -> io::Result<()> {
    let service = service.to_string();
    std::thread::Builder::new()
        .name(format!("{}-output", service))
        .spawn(move || {
            let mut buf = [0u8; READ_CHUNK_SIZE];
            let mut decoder = Utf8Decoder::default();
            let mut at_line_start = true;

            let mut forward = |text: String| {
                if !text.is_empty() {
                    at_line_start = text.ends_with('\n');
                    sink.emit(OutputEvent::Text(text));
                }
            };

            loop {
                match reader.read(&mut buf) {
                    Ok(0) => break,
                    Ok(n) => forward(decoder.decode(&buf[..n])),
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) => {
                        debug!(service = %service, error = %e, "Output read failed");
                        break;
                    }
                }
            }
            forward(decoder.finish());

            if !at_line_start {
                sink.emit(OutputEvent::Text(MISSING_NEWLINE_MARKER.to_string()));
            }
            debug!(service = %service, "Output stream closed");
        })?;
    Ok(())
}

/// Incremental UTF-8 decoding across chunk boundaries
#[derive(Debug, Default)]
struct Utf8Decoder {
    pending: Vec<u8>,
}

impl Utf8Decoder {
    fn decode(&mut self, chunk: &[u8]) -> String {
        self.pending.extend_from_slice(chunk);
        let mut out = String::new();

        loop {
            match std::str::from_utf8(&self.pending) {
                Ok(text) => {
                    out.push_str(text);
                    self.pending.clear();
                    return out;
                }
                Err(e) => {
                    let valid = e.valid_up_to();
                    out.push_str(&String::from_utf8_lossy(&self.pending[..valid]));
                    match e.error_len() {
                        Some(len) => {
                            out.push(char::REPLACEMENT_CHARACTER);
                            self.pending.drain(..valid + len);
                        }
                        // Incomplete sequence at the end; wait for more bytes
                        None => {
                            self.pending.drain(..valid);
                            return out;
                        }
                    }
                }
            }
        }
    }

    /// Flush whatever is left at end of stream
    fn finish(&mut self) -> String {
        let rest = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        rest
    }
}

/// Owns every service instance of a gateway run
pub struct ProcessSupervisor {
    instances: Vec<Arc<ServiceInstance>>,
}

impl ProcessSupervisor {
    /// One instance per service, in configured order. Nothing is spawned.
    pub fn new(scope: &DirectoryScope, services: &[ServiceConfig], grace_period: Duration) -> Self {
        let resolver = VarResolver::for_services(scope, services.iter().map(|s| s.name.as_str()));
        let instances = services
            .iter()
            .map(|service| {
                Arc::new(ServiceInstance::new(
                    service.clone(),
                    scope.join(&service.name),
                    resolver.clone(),
                    grace_period,
                ))
            })
            .collect();
        Self { instances }
    }

    pub fn instances(&self) -> &[Arc<ServiceInstance>] {
        &self.instances
    }

    pub fn get(&self, name: &str) -> Option<&Arc<ServiceInstance>> {
        self.instances.iter().find(|i| i.name() == name)
    }

    /// Start every instance in order; failures are logged and skipped
    pub async fn start_all<F>(&self, mut sink_for: F)
    where
        F: FnMut(&ServiceInstance) -> Arc<dyn OutputSink>,
    {
        for instance in &self.instances {
            let sink = sink_for(instance);
            if let Err(e) = instance.start(sink).await {
                warn!(service = %instance.name(), error = %e, "Service did not start");
            }
        }
    }

    /// Stop every instance concurrently. Safe to call more than once.
    pub async fn shutdown(&self) {
        info!(count = self.instances.len(), "Stopping all services");
        join_all(self.instances.iter().map(|instance| instance.stop())).await;
        info!("All services stopped");
    }
}
