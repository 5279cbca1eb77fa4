// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Owns the process's connection to the virtualization daemon.
//!
//! The connection manager keeps exactly one live link to the daemon. A
//! supervisor task forwards the daemon's events, in delivery order, to the
//! queue of whichever component subscribed to the event's domain. When the
//! link drops, the supervisor tells every subscriber, bumps the connection
//! generation so that every [`DomainHandle`] taken on the old link is
//! rejected, and reconnects with exponential backoff until it succeeds or
//! the manager shuts down.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use backoff::backoff::Backoff;
use launcher_config_toml::ConnectionConfig;
use slog::{debug, error, info, warn, Logger};
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::daemon::{
    Connector, Daemon, DaemonError, DaemonEvent, DaemonLink, DomainEventKind,
    DomainInfo,
};

#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("virtualization daemon unavailable for {0:?}: {1}")]
    Unavailable(Duration, DaemonError),

    #[error("connection manager is shutting down")]
    ShuttingDown,

    #[error(transparent)]
    Daemon(#[from] DaemonError),
}

/// A reference to a daemon-side domain, valid only on the connection it was
/// acquired on.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DomainHandle {
    pub name: String,
    pub uuid: Uuid,
    pub generation: u64,
}

/// What a domain's subscriber receives.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DomainEvent {
    Daemon(DomainEventKind),

    /// The daemon connection dropped. Handles are now stale, and events
    /// emitted while disconnected are lost.
    ConnectionLost,

    /// A new connection is up. Subscribers must re-read anything they care
    /// about.
    Reconnected { generation: u64 },
}

pub type DomainEventRx = mpsc::UnboundedReceiver<DomainEvent>;

/// The current daemon link.
#[derive(Clone)]
pub struct Link {
    pub daemon: Arc<dyn Daemon>,
    pub generation: u64,
}

struct Inner {
    connector: Arc<dyn Connector>,
    config: ConnectionConfig,
    link: watch::Sender<Option<Link>>,
    subscribers: Mutex<HashMap<String, Vec<mpsc::UnboundedSender<DomainEvent>>>>,
    cancel: CancellationToken,
    log: Logger,
}

impl Inner {
    fn exponential_backoff(
        &self,
        max_elapsed_time: Option<Duration>,
    ) -> backoff::ExponentialBackoff {
        backoff::ExponentialBackoff {
            current_interval: self.config.backoff_initial(),
            initial_interval: self.config.backoff_initial(),
            max_interval: self.config.backoff_ceiling(),
            max_elapsed_time,
            ..Default::default()
        }
    }

    fn dispatch(&self, event: DaemonEvent) {
        let mut subscribers = self.subscribers.lock().unwrap();
        match subscribers.get_mut(&event.domain) {
            Some(queues) => {
                queues.retain(|tx| {
                    tx.send(DomainEvent::Daemon(event.kind.clone())).is_ok()
                });
            }
            None => {
                debug!(self.log, "dropping event for unwatched domain";
                       "domain" => &event.domain,
                       "event" => ?event.kind);
            }
        }
    }

    fn broadcast(&self, event: DomainEvent) {
        let mut subscribers = self.subscribers.lock().unwrap();
        for queues in subscribers.values_mut() {
            queues.retain(|tx| tx.send(event.clone()).is_ok());
        }
    }

    /// Connects, retrying until a connection is made or the manager is
    /// cancelled. Only the delay between attempts is capped.
    async fn reconnect(&self) -> Option<DaemonLink> {
        let mut backoff = self.exponential_backoff(None);
        let mut attempt = 0u64;
        loop {
            if self.cancel.is_cancelled() {
                return None;
            }

            attempt += 1;
            match self.connector.connect().await {
                Ok(link) => {
                    info!(self.log, "reconnected to virtualization daemon";
                          "attempts" => attempt);
                    return Some(link);
                }
                Err(e) => {
                    let delay = backoff
                        .next_backoff()
                        .unwrap_or(self.config.backoff_ceiling());
                    warn!(self.log, "reconnect attempt failed";
                          "attempt" => attempt,
                          "error" => %e,
                          "retry_in" => ?delay);
                    tokio::select! {
                        _ = self.cancel.cancelled() => return None,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
    }
}

/// Forwards events from the current link and replaces the link when it
/// drops.
async fn supervise(inner: Arc<Inner>, mut events: mpsc::UnboundedReceiver<DaemonEvent>) {
    let mut generation = inner
        .link
        .borrow()
        .as_ref()
        .map(|l| l.generation)
        .unwrap_or(0);

    loop {
        let event = tokio::select! {
            _ = inner.cancel.cancelled() => break,
            event = events.recv() => event,
        };

        if let Some(event) = event {
            inner.dispatch(event);
            continue;
        }

        warn!(inner.log, "lost connection to virtualization daemon";
              "generation" => generation);
        inner.link.send_replace(None);
        inner.broadcast(DomainEvent::ConnectionLost);

        let Some(link) = inner.reconnect().await else {
            break;
        };

        generation += 1;
        events = link.events;
        inner
            .link
            .send_replace(Some(Link { daemon: link.daemon, generation }));
        inner.broadcast(DomainEvent::Reconnected { generation });
    }

    inner.link.send_replace(None);
    info!(inner.log, "connection supervisor exiting");
}

/// The process's connection to the virtualization daemon. Cloning yields
/// another reference to the same connection.
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<Inner>,
    supervisor: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl ConnectionManager {
    /// Establishes the first connection, retrying for up to the configured
    /// retry budget.
    pub async fn connect(
        connector: Arc<dyn Connector>,
        config: ConnectionConfig,
        log: Logger,
    ) -> Result<Self, ConnectionError> {
        let (link_tx, _) = watch::channel(None);
        let inner = Arc::new(Inner {
            connector,
            config,
            link: link_tx,
            subscribers: Mutex::new(HashMap::new()),
            cancel: CancellationToken::new(),
            log,
        });

        let budget = inner.config.retry_budget();
        let connect_once = || async {
            inner.connector.connect().await.map_err(|e| {
                if e.is_retryable() {
                    debug!(inner.log, "initial connection attempt failed";
                           "error" => %e);
                    backoff::Error::transient(e)
                } else {
                    backoff::Error::permanent(e)
                }
            })
        };

        let link = backoff::future::retry(
            inner.exponential_backoff(Some(budget)),
            connect_once,
        )
        .await
        .map_err(|e| {
            error!(inner.log, "failed to connect to virtualization daemon";
                   "error" => %e);
            if e.is_retryable() {
                ConnectionError::Unavailable(budget, e)
            } else {
                ConnectionError::Daemon(e)
            }
        })?;

        info!(inner.log, "connected to virtualization daemon");
        inner
            .link
            .send_replace(Some(Link { daemon: link.daemon, generation: 1 }));
        let supervisor = tokio::spawn(supervise(inner.clone(), link.events));

        Ok(Self { inner, supervisor: Arc::new(Mutex::new(Some(supervisor))) })
    }

    /// Returns an ordered queue of the events for domain `name`.
    pub fn subscribe(&self, name: &str) -> DomainEventRx {
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner
            .subscribers
            .lock()
            .unwrap()
            .entry(name.to_owned())
            .or_default()
            .push(tx);
        rx
    }

    /// The current connection generation, or `None` while disconnected.
    pub fn generation(&self) -> Option<u64> {
        self.inner.link.borrow().as_ref().map(|l| l.generation)
    }

    pub fn is_current(&self, handle: &DomainHandle) -> bool {
        self.generation() == Some(handle.generation)
    }

    /// Runs `op` against the current link.
    ///
    /// Failures that prove the request was never delivered are retried with
    /// backoff, within the configured retry budget, once a link is available
    /// again. Every other failure is returned unchanged, so an operation
    /// that may have taken effect is never sent twice.
    pub async fn with_connection<T, F, Fut>(
        &self,
        mut op: F,
    ) -> Result<T, ConnectionError>
    where
        F: FnMut(Link) -> Fut,
        Fut: Future<Output = Result<T, DaemonError>>,
    {
        if self.inner.cancel.is_cancelled() {
            return Err(ConnectionError::ShuttingDown);
        }

        let budget = self.inner.config.retry_budget();
        let attempt = || {
            let link = self.inner.link.borrow().clone();
            let fut = link.map(&mut op);
            async move {
                let Some(fut) = fut else {
                    return Err(backoff::Error::transient(
                        DaemonError::NotConnected,
                    ));
                };
                fut.await.map_err(|e| {
                    if e.is_retryable() {
                        backoff::Error::transient(e)
                    } else {
                        backoff::Error::permanent(e)
                    }
                })
            }
        };

        backoff::future::retry(
            self.inner.exponential_backoff(Some(budget)),
            attempt,
        )
        .await
        .map_err(|e| {
            if e.is_retryable() {
                ConnectionError::Unavailable(budget, e)
            } else {
                ConnectionError::Daemon(e)
            }
        })
    }

    /// Runs `op` on the domain `handle` refers to.
    ///
    /// Waits up to the retry budget for a link. A handle acquired on an
    /// earlier connection fails with [`DaemonError::StaleHandle`] without
    /// reaching the daemon. Nothing is retried.
    pub async fn with_domain<T, F, Fut>(
        &self,
        handle: &DomainHandle,
        op: F,
    ) -> Result<T, ConnectionError>
    where
        F: FnOnce(Arc<dyn Daemon>, String) -> Fut,
        Fut: Future<Output = Result<T, DaemonError>>,
    {
        let link = self.wait_for_link().await?;
        if link.generation != handle.generation {
            return Err(DaemonError::StaleHandle(handle.generation).into());
        }

        Ok(op(link.daemon, handle.name.clone()).await?)
    }

    /// Looks up domain `name` and returns a handle to it on the current
    /// connection along with the daemon's view of it.
    pub async fn acquire(
        &self,
        name: &str,
    ) -> Result<(DomainHandle, DomainInfo), ConnectionError> {
        self.with_connection(|link| async move {
            let info = link.daemon.lookup_by_name(name).await?;
            let handle = DomainHandle {
                name: name.to_owned(),
                uuid: info.uuid,
                generation: link.generation,
            };
            Ok((handle, info))
        })
        .await
    }

    /// Defines domain `name` and returns a handle to it.
    pub async fn define(
        &self,
        name: &str,
        definition: &str,
    ) -> Result<DomainHandle, ConnectionError> {
        self.with_connection(|link| async move {
            let uuid = link.daemon.define(name, definition).await?;
            Ok(DomainHandle {
                name: name.to_owned(),
                uuid,
                generation: link.generation,
            })
        })
        .await
    }

    async fn wait_for_link(&self) -> Result<Link, ConnectionError> {
        let budget = self.inner.config.retry_budget();
        let mut rx = self.inner.link.subscribe();
        let wait = async {
            rx.wait_for(|link| link.is_some()).await.ok().and_then(|l| l.clone())
        };

        tokio::select! {
            _ = self.inner.cancel.cancelled() => Err(ConnectionError::ShuttingDown),
            res = tokio::time::timeout(budget, wait) => match res {
                Ok(Some(link)) => Ok(link),
                Ok(None) => Err(ConnectionError::ShuttingDown),
                Err(_) => Err(ConnectionError::Unavailable(
                    budget,
                    DaemonError::NotConnected,
                )),
            },
        }
    }

    /// Stops reconnecting and event delivery. Subscribers' queues close.
    pub async fn shutdown(&self) {
        self.inner.cancel.cancel();
        let supervisor = self.supervisor.lock().unwrap().take();
        if let Some(task) = supervisor {
            if let Err(e) = task.await {
                error!(self.inner.log, "connection supervisor panicked";
                       "error" => %e);
            }
        }
        self.inner.subscribers.lock().unwrap().clear();
    }
}
