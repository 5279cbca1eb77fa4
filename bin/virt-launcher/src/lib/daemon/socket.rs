// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The daemon's control socket protocol.
//!
//! Each message is a JSON document carried in a length-delimited frame.
//! Requests carry an id which the daemon echoes in its response; events are
//! unsolicited and may be interleaved with responses at any point.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use domain_api_types::{MigrationPolicy, MigrationTarget};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use serde::de::DeserializeOwned;
use serde_derive::{Deserialize, Serialize};
use slog::{debug, error, info, warn, Logger};
use tokio::net::UnixStream;
use tokio::sync::{mpsc, oneshot};
use tokio_util::codec::{Framed, LengthDelimitedCodec};
use uuid::Uuid;

use super::{
    Connector, Daemon, DaemonError, DaemonEvent, DaemonLink, DomainInfo,
    JobInfo,
};
use crate::spec::DefinitionChange;

#[derive(Debug, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "snake_case", tag = "method", content = "params")]
pub(crate) enum Call {
    LookupByName { name: String },
    Define { name: String, definition: String },
    Undefine { name: String },
    Start { name: String },
    Pause { name: String },
    Resume { name: String },
    Shutdown { name: String },
    Destroy { name: String },
    LiveUpdate {
        name: String,
        definition: String,
        changes: Vec<DefinitionChange>,
    },
    MigrateStart {
        name: String,
        target: MigrationTarget,
        policy: MigrationPolicy,
    },
    MigrateAbort { name: String },
    JobInfo { name: String },
    GuestAgentCommand {
        name: String,
        command: String,
        arguments: serde_json::Value,
        timeout_ms: u64,
    },
}

#[derive(Debug, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "snake_case", tag = "type")]
pub(crate) enum Frame {
    Request { id: u64, call: Call },
    Response { id: u64, result: Result<serde_json::Value, DaemonError> },
    Event { event: DaemonEvent },
}

type FrameSink = SplitSink<Framed<UnixStream, LengthDelimitedCodec>, Bytes>;
type FrameStream = SplitStream<Framed<UnixStream, LengthDelimitedCodec>>;
type Pending =
    HashMap<u64, oneshot::Sender<Result<serde_json::Value, DaemonError>>>;

struct Shared {
    pending: Mutex<Pending>,
    closed: AtomicBool,
}

/// Connects to the daemon's control socket.
pub struct SocketConnector {
    path: PathBuf,
    request_timeout: Duration,
    log: Logger,
}

impl SocketConnector {
    pub fn new(path: PathBuf, request_timeout: Duration, log: Logger) -> Self {
        Self { path, request_timeout, log }
    }
}

#[async_trait]
impl Connector for SocketConnector {
    async fn connect(&self) -> Result<DaemonLink, DaemonError> {
        let stream = UnixStream::connect(&self.path).await.map_err(|e| {
            debug!(self.log, "failed to connect to daemon socket";
                   "path" => %self.path.display(),
                   "error" => %e);
            DaemonError::NotConnected
        })?;
        info!(self.log, "connected to daemon socket";
              "path" => %self.path.display());

        let (sink, stream) =
            Framed::new(stream, LengthDelimitedCodec::new()).split();
        let shared = Arc::new(Shared {
            pending: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
        });
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        tokio::spawn(read_frames(
            stream,
            shared.clone(),
            event_tx,
            self.log.clone(),
        ));

        Ok(DaemonLink {
            daemon: Arc::new(SocketDaemon {
                sink: tokio::sync::Mutex::new(sink),
                shared,
                next_id: AtomicU64::new(1),
                request_timeout: self.request_timeout,
                log: self.log.clone(),
            }),
            events: event_rx,
        })
    }
}

/// Reads frames until the connection closes, completing pending requests
/// and forwarding events. Dropping `events` on exit is what tells the
/// connection manager that this connection is gone.
async fn read_frames(
    mut stream: FrameStream,
    shared: Arc<Shared>,
    events: mpsc::UnboundedSender<DaemonEvent>,
    log: Logger,
) {
    loop {
        let bytes = match stream.next().await {
            Some(Ok(bytes)) => bytes,
            Some(Err(e)) => {
                warn!(log, "error reading from daemon socket"; "error" => %e);
                break;
            }
            None => {
                info!(log, "daemon closed the connection");
                break;
            }
        };

        match serde_json::from_slice::<Frame>(&bytes) {
            Ok(Frame::Response { id, result }) => {
                let waiter = shared.pending.lock().unwrap().remove(&id);
                match waiter {
                    Some(tx) => {
                        let _ = tx.send(result);
                    }
                    None => {
                        debug!(log, "response for unknown request"; "id" => id)
                    }
                }
            }
            Ok(Frame::Event { event }) => {
                if events.send(event).is_err() {
                    break;
                }
            }
            Ok(Frame::Request { id, .. }) => {
                warn!(log, "daemon sent a request frame"; "id" => id);
            }
            Err(e) => {
                error!(log, "undecodable frame from daemon"; "error" => %e);
                break;
            }
        }
    }

    // Requests still waiting were delivered but will never be answered.
    // Dropping their senders completes them with `Disconnected`.
    shared.closed.store(true, Ordering::SeqCst);
    shared.pending.lock().unwrap().clear();
}

struct SocketDaemon {
    sink: tokio::sync::Mutex<FrameSink>,
    shared: Arc<Shared>,
    next_id: AtomicU64,
    request_timeout: Duration,
    log: Logger,
}

impl SocketDaemon {
    async fn call_raw(
        &self,
        call: Call,
        timeout: Duration,
    ) -> Result<serde_json::Value, DaemonError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        {
            let mut pending = self.shared.pending.lock().unwrap();
            if self.shared.closed.load(Ordering::SeqCst) {
                return Err(DaemonError::NotConnected);
            }
            pending.insert(id, tx);
        }

        let frame = serde_json::to_vec(&Frame::Request { id, call })
            .map_err(|e| DaemonError::Protocol(e.to_string()))?;
        if let Err(e) = self.sink.lock().await.send(Bytes::from(frame)).await {
            // A frame that failed to flush was never complete on the wire, so
            // the daemon cannot have acted on it.
            debug!(self.log, "failed to send request"; "id" => id, "error" => %e);
            self.shared.pending.lock().unwrap().remove(&id);
            return Err(DaemonError::NotConnected);
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(DaemonError::Disconnected(
                "connection closed before the daemon replied".to_owned(),
            )),
            Err(_) => {
                self.shared.pending.lock().unwrap().remove(&id);
                Err(DaemonError::Timeout)
            }
        }
    }

    async fn call<T: DeserializeOwned>(&self, call: Call) -> Result<T, DaemonError> {
        let value = self.call_raw(call, self.request_timeout).await?;
        serde_json::from_value(value)
            .map_err(|e| DaemonError::Protocol(e.to_string()))
    }
}

#[async_trait]
impl Daemon for SocketDaemon {
    async fn lookup_by_name(
        &self,
        name: &str,
    ) -> Result<DomainInfo, DaemonError> {
        self.call(Call::LookupByName { name: name.to_owned() }).await
    }

    async fn define(
        &self,
        name: &str,
        definition: &str,
    ) -> Result<Uuid, DaemonError> {
        self.call(Call::Define {
            name: name.to_owned(),
            definition: definition.to_owned(),
        })
        .await
    }

    async fn undefine(&self, name: &str) -> Result<(), DaemonError> {
        self.call(Call::Undefine { name: name.to_owned() }).await
    }

    async fn start(&self, name: &str) -> Result<(), DaemonError> {
        self.call(Call::Start { name: name.to_owned() }).await
    }

    async fn pause(&self, name: &str) -> Result<(), DaemonError> {
        self.call(Call::Pause { name: name.to_owned() }).await
    }

    async fn resume(&self, name: &str) -> Result<(), DaemonError> {
        self.call(Call::Resume { name: name.to_owned() }).await
    }

    async fn shutdown(&self, name: &str) -> Result<(), DaemonError> {
        self.call(Call::Shutdown { name: name.to_owned() }).await
    }

    async fn destroy(&self, name: &str) -> Result<(), DaemonError> {
        self.call(Call::Destroy { name: name.to_owned() }).await
    }

    async fn live_update(
        &self,
        name: &str,
        definition: &str,
        changes: &[DefinitionChange],
    ) -> Result<(), DaemonError> {
        self.call(Call::LiveUpdate {
            name: name.to_owned(),
            definition: definition.to_owned(),
            changes: changes.to_vec(),
        })
        .await
    }

    async fn migrate_start(
        &self,
        name: &str,
        target: &MigrationTarget,
        policy: &MigrationPolicy,
    ) -> Result<(), DaemonError> {
        self.call(Call::MigrateStart {
            name: name.to_owned(),
            target: target.clone(),
            policy: policy.clone(),
        })
        .await
    }

    async fn migrate_abort(&self, name: &str) -> Result<(), DaemonError> {
        self.call(Call::MigrateAbort { name: name.to_owned() }).await
    }

    async fn job_info(&self, name: &str) -> Result<JobInfo, DaemonError> {
        self.call(Call::JobInfo { name: name.to_owned() }).await
    }

    async fn guest_agent_command(
        &self,
        name: &str,
        command: &str,
        arguments: serde_json::Value,
        timeout: Duration,
    ) -> Result<serde_json::Value, DaemonError> {
        // The daemon enforces the agent timeout itself; the transport only
        // needs to outlast it.
        let call = Call::GuestAgentCommand {
            name: name.to_owned(),
            command: command.to_owned(),
            arguments,
            timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
        };
        self.call_raw(call, timeout + Duration::from_secs(1)).await
    }
}

#[cfg(test)]
mod test {
    use tokio::net::UnixListener;

    use super::*;
    use crate::daemon::{DomainEventKind, RawDomainState, ShutoffReason};

    fn logger() -> Logger {
        Logger::root(slog::Discard, slog::o!())
    }

    fn vm0_info() -> DomainInfo {
        DomainInfo {
            uuid: Uuid::nil(),
            state: RawDomainState::Running,
            definition: "<domain><name>vm0</name></domain>".to_owned(),
        }
    }

    async fn read_request(
        framed: &mut Framed<UnixStream, LengthDelimitedCodec>,
    ) -> (u64, Call) {
        let bytes = framed.next().await.unwrap().unwrap();
        match serde_json::from_slice(&bytes).unwrap() {
            Frame::Request { id, call } => (id, call),
            other => panic!("unexpected frame {other:?}"),
        }
    }

    async fn write_frame(
        framed: &mut Framed<UnixStream, LengthDelimitedCodec>,
        frame: &Frame,
    ) {
        let bytes = serde_json::to_vec(frame).unwrap();
        framed.send(Bytes::from(bytes)).await.unwrap();
    }

    #[tokio::test]
    async fn request_response_and_events() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("virtd.sock");
        let listener = UnixListener::bind(&path).unwrap();

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut framed = Framed::new(stream, LengthDelimitedCodec::new());

            let (id, call) = read_request(&mut framed).await;
            assert_eq!(call, Call::LookupByName { name: "vm0".to_owned() });

            // An event may arrive ahead of the response it relates to.
            write_frame(
                &mut framed,
                &Frame::Event {
                    event: DaemonEvent {
                        domain: "vm0".to_owned(),
                        kind: DomainEventKind::Stopped(
                            ShutoffReason::Shutdown,
                        ),
                    },
                },
            )
            .await;
            write_frame(
                &mut framed,
                &Frame::Response {
                    id,
                    result: Ok(serde_json::to_value(vm0_info()).unwrap()),
                },
            )
            .await;

            let (id, _) = read_request(&mut framed).await;
            write_frame(
                &mut framed,
                &Frame::Response {
                    id,
                    result: Err(DaemonError::NoSuchDomain("vm1".to_owned())),
                },
            )
            .await;

            // Read one more request and hang up without answering.
            let _ = read_request(&mut framed).await;
        });

        let connector =
            SocketConnector::new(path, Duration::from_secs(5), logger());
        let DaemonLink { daemon, mut events } = connector.connect().await.unwrap();

        assert_eq!(daemon.lookup_by_name("vm0").await, Ok(vm0_info()));
        let ev = events.recv().await.unwrap();
        assert_eq!(ev.domain, "vm0");

        assert_eq!(
            daemon.start("vm1").await,
            Err(DaemonError::NoSuchDomain("vm1".to_owned()))
        );

        let err = daemon.pause("vm0").await.unwrap_err();
        assert!(err.is_ambiguous(), "unexpected error {err:?}");

        server.await.unwrap();
        assert_eq!(events.recv().await, None);
        assert_eq!(daemon.resume("vm0").await, Err(DaemonError::NotConnected));
    }

    #[tokio::test]
    async fn request_timeout_is_ambiguous() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("virtd.sock");
        let listener = UnixListener::bind(&path).unwrap();

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut framed = Framed::new(stream, LengthDelimitedCodec::new());
            let _ = read_request(&mut framed).await;
            // Keep the connection open without replying.
            tokio::time::sleep(Duration::from_millis(500)).await;
        });

        let connector =
            SocketConnector::new(path, Duration::from_millis(50), logger());
        let link = connector.connect().await.unwrap();
        assert_eq!(link.daemon.destroy("vm0").await, Err(DaemonError::Timeout));
        server.await.unwrap();
    }

    #[tokio::test]
    async fn connect_failure_is_retryable() {
        let dir = tempfile::tempdir().unwrap();
        let connector = SocketConnector::new(
            dir.path().join("missing.sock"),
            Duration::from_secs(1),
            logger(),
        );
        match connector.connect().await {
            Err(e) => assert!(e.is_retryable()),
            Ok(_) => panic!("connected to a socket that does not exist"),
        }
    }
}
