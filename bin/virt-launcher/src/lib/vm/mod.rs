// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Implements the [`Vm`] type, which owns one daemon-side domain for the life
//! of the launcher process.
//!
//! # Structure
//!
//! A `Vm` is a thin front end. Callers' requests go through an
//! [`request_queue::ExternalRequestQueue`] that admits at most one lifecycle
//! operation at a time and refuses requests that make no sense in the
//! domain's current state. Admitted requests are carried out by a single
//! state driver task, which is also the only consumer of the domain's daemon
//! events. Because one task both issues commands and observes their effects,
//! the driver can confirm every command against the daemon's events (or, if
//! none arrive, against a fresh read of the domain's state) before it reports
//! success.
//!
//! The driver publishes the domain's confirmed state through a watch channel
//! (see [`state_publisher`]) and tells the guest agent poller when the domain
//! is running and which agent connection it is talking to.
//!
//! # Shutdown
//!
//! [`Vm::stop`] stops the driver and the poller. It does not touch the
//! domain; callers that want the domain gone must shut it down and tear it
//! down first.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use domain_api_types::guest::{
    CategoryReport, GuestMetadataCategory, GuestMetadataReport,
};
use domain_api_types::{
    DomainState, DomainStateMonitorResponse, MigrationPolicy, MigrationTarget,
    PlacementConstraints, VmSpec,
};
use launcher_config_toml::{Config, LifecycleConfig};
use serde_derive::{Deserialize, Serialize};
use slog::{error, info, Logger};
use thiserror::Error;
use tokio::sync::{oneshot, watch, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::connection::{ConnectionError, ConnectionManager};
use crate::daemon::DaemonError;
use crate::guest_agent::{GuestAgentError, GuestAgentPoller, PollerTarget};
use crate::migrate::MigrationOutcome;
use crate::spec::{SpecConverter, ValidationError};

mod request_queue;
mod state_driver;
mod state_publisher;

pub use request_queue::{RequestDeniedReason, RequestKind};

use request_queue::{ExternalRequest, ExternalRequestQueue, QueueOutcome, Reply};
use state_driver::{DriverResources, StateDriver};
use state_publisher::StatePublisher;

pub(crate) type DomainStateTx = watch::Sender<DomainStateMonitorResponse>;
pub type DomainStateRx = watch::Receiver<DomainStateMonitorResponse>;

/// What a successful reconcile did.
#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ReconcileOutcome {
    /// The domain already matched the requested VM. Nothing was sent to the
    /// daemon.
    Unchanged,

    /// The domain did not exist and was defined and started.
    Created,

    /// The domain existed but was not running. It was redefined if its
    /// definition was out of date, then started.
    Started,

    /// The running domain's definition was changed in place.
    LiveUpdated,

    /// The domain was stopped, redefined, and started again.
    Restarted,
}

/// How a shutdown request was satisfied.
#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ShutdownOutcome {
    AlreadyStopped,

    /// The guest shut itself down before the deadline.
    Graceful,

    /// The domain was destroyed.
    Forced,
}

#[derive(Debug, Error)]
pub enum VmError {
    #[error(transparent)]
    Connection(ConnectionError),

    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("cannot {request} a domain that is {state}: {reason}")]
    InvalidState {
        request: RequestKind,
        state: DomainState,
        reason: RequestDeniedReason,
    },

    #[error("another lifecycle operation is in progress")]
    Busy,

    /// The daemon accepted the command but the domain did not reach the
    /// expected state in time.
    #[error("{0} was accepted but not confirmed in time")]
    Timeout(&'static str),

    /// The command may or may not have taken effect and the domain's state
    /// could not be confirmed either way.
    #[error("outcome of {0} is unknown")]
    Unknown(&'static str),

    #[error(transparent)]
    GuestAgent(#[from] GuestAgentError),

    #[error("domain has crashed")]
    Crashed,

    #[error(transparent)]
    Daemon(DaemonError),

    #[error("no migration is in progress")]
    NoMigrationInProgress,

    #[error("the domain's state driver has stopped")]
    StateDriverGone,
}

impl From<ConnectionError> for VmError {
    fn from(e: ConnectionError) -> Self {
        match e {
            ConnectionError::Daemon(e) => Self::Daemon(e),
            other => Self::Connection(other),
        }
    }
}

fn deny_error(
    request: RequestKind,
    state: DomainState,
    reason: RequestDeniedReason,
) -> VmError {
    match reason {
        RequestDeniedReason::Busy => VmError::Busy,
        RequestDeniedReason::Crashed => VmError::Crashed,
        RequestDeniedReason::DriverStopped => VmError::StateDriverGone,
        reason => VmError::InvalidState { request, state, reason },
    }
}

/// A launcher's handle to its domain.
pub struct Vm {
    name: String,
    queue: Arc<Mutex<ExternalRequestQueue>>,
    wake: Arc<Notify>,
    state_rx: DomainStateRx,
    poller: Arc<GuestAgentPoller>,

    /// Cancels the migration currently in flight, if there is one.
    migration_cancel: Mutex<Option<CancellationToken>>,

    stop: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    config: LifecycleConfig,
    log: Logger,
}

impl Vm {
    /// Takes ownership of domain `name`.
    ///
    /// If the daemon already has a domain with this name it is adopted as
    /// is: nothing is redefined, started, or stopped until a request asks
    /// for it.
    pub async fn launch(
        name: &str,
        conn: ConnectionManager,
        converter: Arc<SpecConverter>,
        config: &Config,
        log: &Logger,
    ) -> Result<Arc<Self>, VmError> {
        let log = log.new(slog::o!(
            "component" => "vm",
            "domain" => name.to_owned(),
        ));

        // Subscribe before reading the domain's state so that no event
        // emitted after the read is missed.
        let events = conn.subscribe(name);

        let (poller_tx, poller_rx) = watch::channel(PollerTarget::default());
        let poller = GuestAgentPoller::new(
            conn.clone(),
            config.guest_agent.clone(),
            poller_rx,
            log.new(slog::o!("component" => "guest_agent")),
        );

        let (publisher, state_rx) =
            StatePublisher::new(&log, DomainState::Unknown);
        let queue = Arc::new(Mutex::new(ExternalRequestQueue::new(
            DomainState::Unknown,
            log.clone(),
        )));
        let wake = Arc::new(Notify::new());
        let stop = CancellationToken::new();

        let mut driver = StateDriver::new(DriverResources {
            name: name.to_owned(),
            conn,
            converter,
            config: config.lifecycle.clone(),
            queue: queue.clone(),
            wake: wake.clone(),
            events,
            publisher,
            poller_target: poller_tx,
            poller: poller.clone(),
            stop: stop.clone(),
            log: log.clone(),
        });
        driver.adopt().await?;

        let mut tasks = vec![tokio::spawn(driver.run())];
        if config.guest_agent.enabled {
            tasks.push(poller.start(stop.child_token()));
        } else {
            info!(log, "guest agent polling disabled");
        }

        Ok(Arc::new(Self {
            name: name.to_owned(),
            queue,
            wake,
            state_rx,
            poller,
            migration_cancel: Mutex::new(None),
            stop,
            tasks: Mutex::new(tasks),
            config: config.lifecycle.clone(),
            log,
        }))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The domain's most recently confirmed state.
    pub fn state(&self) -> DomainState {
        self.state_rx.borrow().state
    }

    /// A receiver that sees every published state change.
    pub fn state_watch(&self) -> DomainStateRx {
        self.state_rx.clone()
    }

    /// Makes the domain match `spec` and run.
    pub async fn reconcile(
        &self,
        spec: VmSpec,
        placement: PlacementConstraints,
    ) -> Result<ReconcileOutcome, VmError> {
        let spec = Box::new(spec);
        let outcome = self
            .submit(|reply| ExternalRequest::Reconcile { spec, placement, reply })
            .await?;
        Ok(outcome.unwrap_or(ReconcileOutcome::Unchanged))
    }

    pub async fn pause(&self) -> Result<(), VmError> {
        self.submit(|reply| ExternalRequest::Pause { reply }).await?;
        Ok(())
    }

    pub async fn resume(&self) -> Result<(), VmError> {
        self.submit(|reply| ExternalRequest::Resume { reply }).await?;
        Ok(())
    }

    /// Stops the domain. A graceful shutdown that has not completed within
    /// `deadline` (or the configured default) is escalated to a destroy.
    pub async fn shutdown(
        &self,
        graceful: bool,
        deadline: Option<Duration>,
    ) -> Result<ShutdownOutcome, VmError> {
        let deadline = deadline.unwrap_or(self.config.shutdown_deadline());
        let outcome = self
            .submit(|reply| ExternalRequest::Shutdown { graceful, deadline, reply })
            .await?;
        Ok(outcome.unwrap_or(ShutdownOutcome::AlreadyStopped))
    }

    /// Migrates the domain to another host and waits for the migration to
    /// finish. The outcome is returned as a value; `Err` means the migration
    /// never started.
    pub async fn migrate(
        &self,
        target: MigrationTarget,
        policy: MigrationPolicy,
    ) -> Result<MigrationOutcome, VmError> {
        let cancel = CancellationToken::new();
        {
            let mut slot = self.migration_cancel.lock().unwrap();
            if slot.is_some() {
                return Err(VmError::Busy);
            }
            *slot = Some(cancel.clone());
        }

        let result = self
            .submit(|reply| ExternalRequest::Migrate {
                target,
                policy,
                cancel,
                reply,
            })
            .await;
        self.migration_cancel.lock().unwrap().take();

        Ok(result?.unwrap_or(MigrationOutcome::Cancelled))
    }

    /// Asks the daemon to abort the migration in progress. The migration's
    /// caller sees the result.
    pub fn cancel_migration(&self) -> Result<(), VmError> {
        match self.migration_cancel.lock().unwrap().as_ref() {
            Some(cancel) => {
                info!(self.log, "migration cancellation requested");
                cancel.cancel();
                Ok(())
            }
            None => Err(VmError::NoMigrationInProgress),
        }
    }

    /// Undefines the domain. The domain must not be running.
    pub async fn teardown(&self) -> Result<(), VmError> {
        self.submit(|reply| ExternalRequest::Teardown { reply }).await?;
        Ok(())
    }

    /// The most recent guest metadata. Values are marked advisory unless the
    /// domain is running.
    pub fn guest_metadata(&self) -> GuestMetadataReport {
        self.poller.report()
    }

    /// Polls one guest metadata category immediately.
    pub async fn poll_guest(
        &self,
        category: GuestMetadataCategory,
    ) -> Result<CategoryReport, VmError> {
        Ok(self.poller.poll(category).await?)
    }

    /// Stops the state driver and the guest agent poller. Requests that are
    /// still queued fail with [`VmError::StateDriverGone`].
    pub async fn stop(&self) {
        self.stop.cancel();
        let tasks = std::mem::take(&mut *self.tasks.lock().unwrap());
        for task in tasks {
            if let Err(e) = task.await {
                error!(self.log, "VM task panicked"; "error" => %e);
            }
        }
        self.queue.lock().unwrap().close();
    }

    /// Queues a request and waits for its result. Returns `None` if the
    /// request was ignored because the domain is already where it asks to
    /// be.
    async fn submit<T>(
        &self,
        make_request: impl FnOnce(Reply<T>) -> ExternalRequest,
    ) -> Result<Option<T>, VmError> {
        let (tx, rx) = oneshot::channel();
        let request = make_request(tx);
        let kind = request.kind();

        let outcome = {
            let mut queue = self.queue.lock().unwrap();
            let state = queue.state();
            queue
                .try_queue(request)
                .map_err(|reason| deny_error(kind, state, reason))
        }?;

        match outcome {
            QueueOutcome::Ignored => Ok(None),
            QueueOutcome::Enqueued => {
                self.wake.notify_one();
                let result = rx.await.map_err(|_| VmError::StateDriverGone)?;
                result.map(Some)
            }
        }
    }
}

#[cfg(test)]
mod test {
    use domain_api_types::guest::CategoryStatus;
    use domain_api_types::spec::{Firmware, UpdatePolicy};
    use domain_api_types::MigrationState;
    use launcher_config_toml::{ConnectionConfig, GuestAgentConfig};

    use super::*;
    use crate::daemon::sim::{Fault, SimConnector, SimulatedDaemon};
    use crate::daemon::{DomainEventKind, RawDomainState, ShutoffReason};
    use crate::migrate::MigrateError;
    use crate::spec::test::{test_placement, test_spec};

    fn logger() -> Logger {
        Logger::root(slog::Discard, slog::o!())
    }

    fn test_config() -> Config {
        Config {
            connection: ConnectionConfig {
                backoff_initial_ms: 5,
                backoff_ceiling_ms: 20,
                retry_budget_ms: 2_000,
                request_timeout_ms: 1_000,
                ..Default::default()
            },
            lifecycle: LifecycleConfig {
                confirm_timeout_ms: 100,
                shutdown_deadline_ms: 200,
                migration_progress_interval_ms: 20,
                migration_deadline_ms: 5_000,
            },
            guest_agent: GuestAgentConfig {
                enabled: false,
                poll_interval_ms: 20,
                command_timeout_ms: 50,
            },
        }
    }

    struct Fixture {
        sim: Arc<SimulatedDaemon>,
        conn: ConnectionManager,
        vm: Arc<Vm>,
    }

    impl Fixture {
        async fn new() -> Self {
            Self::with_config(test_config()).await
        }

        async fn with_config(config: Config) -> Self {
            let sim = SimulatedDaemon::new(logger());
            Self::on_sim(sim, config).await
        }

        async fn on_sim(sim: Arc<SimulatedDaemon>, config: Config) -> Self {
            let connector: Arc<SimConnector> = Arc::new(sim.connector());
            let conn = ConnectionManager::connect(
                connector,
                config.connection.clone(),
                logger(),
            )
            .await
            .unwrap();
            let vm = Vm::launch(
                "vm0",
                conn.clone(),
                Arc::new(SpecConverter::new()),
                &config,
                &logger(),
            )
            .await
            .unwrap();
            Self { sim, conn, vm }
        }

        async fn running(&self) {
            let outcome = self
                .vm
                .reconcile(test_spec("vm0"), test_placement())
                .await
                .unwrap();
            assert_eq!(outcome, ReconcileOutcome::Created);
            assert_eq!(self.vm.state(), DomainState::Running);
        }

        fn mutating_methods(&self) -> Vec<&'static str> {
            self.sim.mutating_calls().iter().map(|c| c.method).collect()
        }

        async fn wait_for_state(&self, state: DomainState) {
            let mut rx = self.vm.state_watch();
            tokio::time::timeout(
                Duration::from_secs(5),
                rx.wait_for(|s| s.state == state),
            )
            .await
            .unwrap()
            .unwrap();
        }

        async fn wait_for_migration(&self, state: MigrationState) {
            let mut rx = self.vm.state_watch();
            tokio::time::timeout(
                Duration::from_secs(5),
                rx.wait_for(|s| s.migration.as_ref().map(|m| m.state) == Some(state)),
            )
            .await
            .unwrap()
            .unwrap();
        }

        async fn finish(self) {
            self.vm.stop().await;
            self.conn.shutdown().await;
        }
    }

    fn migration_target() -> MigrationTarget {
        MigrationTarget {
            uri: "qemu+tls://dst.example/system".to_owned(),
            migrate_uri: None,
        }
    }

    #[tokio::test]
    async fn reconcile_creates_two_vcpu_domain() {
        let fx = Fixture::new().await;
        assert_eq!(fx.vm.state(), DomainState::Absent);
        fx.running().await;

        assert_eq!(fx.mutating_methods(), vec!["define", "start"]);
        let xml = fx.sim.domain_definition("vm0").unwrap();
        assert!(xml.contains(">2</vcpu>"), "{xml}");
        assert_eq!(fx.sim.domain_state("vm0"), Some(RawDomainState::Running));
        fx.finish().await;
    }

    #[tokio::test]
    async fn repeated_reconcile_sends_nothing() {
        let fx = Fixture::new().await;
        fx.running().await;
        fx.sim.clear_calls();

        for _ in 0..3 {
            let outcome = fx
                .vm
                .reconcile(test_spec("vm0"), test_placement())
                .await
                .unwrap();
            assert_eq!(outcome, ReconcileOutcome::Unchanged);
        }
        assert!(fx.sim.lifecycle_calls().is_empty());
        fx.finish().await;
    }

    #[tokio::test]
    async fn reconcile_rejects_mismatched_name() {
        let fx = Fixture::new().await;
        let err = fx
            .vm
            .reconcile(test_spec("vm1"), test_placement())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            VmError::Validation(ValidationError::NameMismatch { .. })
        ));
        assert!(fx.sim.mutating_calls().is_empty());
        fx.finish().await;
    }

    #[tokio::test]
    async fn launch_adopts_existing_domain() {
        let sim = SimulatedDaemon::new(logger());
        let xml = SpecConverter::new()
            .convert(&test_spec("vm0"), &test_placement())
            .unwrap()
            .render();
        sim.insert_domain("vm0", RawDomainState::Running, &xml);

        let fx = Fixture::on_sim(sim, test_config()).await;
        assert_eq!(fx.vm.state(), DomainState::Running);

        let outcome = fx
            .vm
            .reconcile(test_spec("vm0"), test_placement())
            .await
            .unwrap();
        assert_eq!(outcome, ReconcileOutcome::Unchanged);
        assert!(fx.sim.mutating_calls().is_empty());
        fx.finish().await;
    }

    #[tokio::test]
    async fn concurrent_request_is_busy() {
        let fx = Fixture::new().await;
        fx.running().await;
        fx.sim.set_guest_honors_shutdown(false);

        let vm = fx.vm.clone();
        let shutdown = tokio::spawn(async move {
            vm.shutdown(true, Some(Duration::from_millis(300))).await
        });
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(matches!(fx.vm.pause().await, Err(VmError::Busy)));
        assert!(matches!(
            fx.vm.reconcile(test_spec("vm0"), test_placement()).await,
            Err(VmError::Busy)
        ));

        assert_eq!(shutdown.await.unwrap().unwrap(), ShutdownOutcome::Forced);
        assert_eq!(fx.vm.state(), DomainState::Shutoff);
        fx.finish().await;
    }

    #[tokio::test]
    async fn graceful_shutdown_then_teardown() {
        let fx = Fixture::new().await;
        fx.running().await;

        let outcome = fx.vm.shutdown(true, None).await.unwrap();
        assert_eq!(outcome, ShutdownOutcome::Graceful);
        assert_eq!(fx.vm.state(), DomainState::Shutoff);
        assert!(!fx.mutating_methods().contains(&"destroy"));

        let outcome = fx.vm.shutdown(true, None).await.unwrap();
        assert_eq!(outcome, ShutdownOutcome::AlreadyStopped);

        fx.vm.teardown().await.unwrap();
        assert_eq!(fx.vm.state(), DomainState::Absent);
        assert_eq!(fx.sim.domain_state("vm0"), None);

        // Tearing down an absent domain is a no-op.
        fx.vm.teardown().await.unwrap();
        fx.finish().await;
    }

    #[tokio::test]
    async fn teardown_refuses_running_domain() {
        let fx = Fixture::new().await;
        fx.running().await;
        let err = fx.vm.teardown().await.unwrap_err();
        assert!(matches!(
            err,
            VmError::InvalidState {
                request: RequestKind::Teardown,
                reason: RequestDeniedReason::DomainActive,
                ..
            }
        ));
        fx.finish().await;
    }

    #[tokio::test]
    async fn unresponsive_guest_is_destroyed_at_deadline() {
        let fx = Fixture::new().await;
        fx.running().await;
        fx.sim.set_guest_honors_shutdown(false);

        let outcome = fx.vm.shutdown(true, None).await.unwrap();
        assert_eq!(outcome, ShutdownOutcome::Forced);
        assert_eq!(
            fx.sim.domain_state("vm0"),
            Some(RawDomainState::Shutoff(ShutoffReason::Destroyed))
        );
        let methods = fx.mutating_methods();
        assert_eq!(&methods[methods.len() - 2..], &["shutdown", "destroy"]);
        fx.finish().await;
    }

    #[tokio::test]
    async fn pause_and_resume() {
        let fx = Fixture::new().await;
        fx.running().await;

        fx.vm.pause().await.unwrap();
        assert_eq!(fx.vm.state(), DomainState::Paused);

        // Already paused: ignored without reaching the daemon.
        fx.sim.clear_calls();
        fx.vm.pause().await.unwrap();
        assert!(fx.sim.calls().is_empty());

        // An unchanged spec leaves a paused domain paused.
        let outcome = fx
            .vm
            .reconcile(test_spec("vm0"), test_placement())
            .await
            .unwrap();
        assert_eq!(outcome, ReconcileOutcome::Unchanged);
        assert_eq!(fx.vm.state(), DomainState::Paused);

        assert!(matches!(
            fx.vm.migrate(migration_target(), MigrationPolicy::default()).await,
            Err(VmError::InvalidState { reason: RequestDeniedReason::NotRunning, .. })
        ));

        fx.vm.resume().await.unwrap();
        assert_eq!(fx.vm.state(), DomainState::Running);
        fx.finish().await;
    }

    #[tokio::test]
    async fn crashed_domain_is_not_restarted() {
        let fx = Fixture::new().await;
        fx.running().await;
        fx.sim.crash("vm0");
        fx.wait_for_state(DomainState::Crashed).await;
        fx.sim.clear_calls();

        assert!(matches!(
            fx.vm.reconcile(test_spec("vm0"), test_placement()).await,
            Err(VmError::Crashed)
        ));
        assert!(matches!(fx.vm.pause().await, Err(VmError::Crashed)));
        assert!(fx.sim.mutating_calls().is_empty());

        // Crashed domains can still be cleaned up.
        fx.vm.teardown().await.unwrap();
        assert_eq!(fx.mutating_methods(), vec!["destroy", "undefine"]);
        assert_eq!(fx.vm.state(), DomainState::Absent);
        fx.finish().await;
    }

    #[tokio::test]
    async fn reconnect_refreshes_without_redefining() {
        let fx = Fixture::new().await;
        fx.running().await;
        fx.sim.clear_calls();

        fx.sim.disconnect();
        tokio::time::timeout(Duration::from_secs(5), async {
            while fx.conn.generation() != Some(2) {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        let outcome = fx
            .vm
            .reconcile(test_spec("vm0"), test_placement())
            .await
            .unwrap();
        assert_eq!(outcome, ReconcileOutcome::Unchanged);
        assert_eq!(fx.vm.state(), DomainState::Running);
        assert!(fx.sim.mutating_calls().is_empty());

        // Commands go out on the new connection.
        fx.vm.pause().await.unwrap();
        let pause: Vec<_> = fx
            .sim
            .mutating_calls()
            .into_iter()
            .filter(|c| c.method == "pause")
            .collect();
        assert_eq!(pause.len(), 1);
        assert_eq!(pause[0].session, 2);
        fx.finish().await;
    }

    #[tokio::test]
    async fn lost_reply_is_confirmed_by_reading_state() {
        let fx = Fixture::new().await;
        fx.running().await;
        fx.sim.set_emit_events(false);

        fx.sim.inject_fault("pause", Fault::LoseReply(DaemonError::Timeout));
        fx.vm.pause().await.unwrap();
        assert_eq!(fx.vm.state(), DomainState::Paused);
        fx.finish().await;
    }

    #[tokio::test]
    async fn undelivered_ambiguous_command_is_unknown() {
        let fx = Fixture::new().await;
        fx.running().await;
        fx.sim.set_emit_events(false);

        fx.sim.inject_fault(
            "pause",
            Fault::Reject(DaemonError::Disconnected("reset".to_owned())),
        );
        assert!(matches!(fx.vm.pause().await, Err(VmError::Unknown("pause"))));
        assert_eq!(fx.sim.domain_state("vm0"), Some(RawDomainState::Running));
        assert_eq!(fx.vm.state(), DomainState::Running);
        assert_eq!(
            fx.mutating_methods().iter().filter(|m| **m == "pause").count(),
            1
        );
        fx.finish().await;
    }

    #[tokio::test]
    async fn live_or_restart_prefers_live_update() {
        let fx = Fixture::new().await;
        fx.running().await;
        fx.sim.clear_calls();

        let mut spec = test_spec("vm0");
        spec.memory_mib = 4096;
        let outcome =
            fx.vm.reconcile(spec.clone(), test_placement()).await.unwrap();
        assert_eq!(outcome, ReconcileOutcome::LiveUpdated);
        assert_eq!(fx.mutating_methods(), vec!["live_update"]);

        // The daemon refuses this one live, so the domain is restarted.
        fx.sim.set_live_update_predicate(|_| false);
        fx.sim.clear_calls();
        spec.memory_mib = 8192;
        let outcome = fx.vm.reconcile(spec, test_placement()).await.unwrap();
        assert_eq!(outcome, ReconcileOutcome::Restarted);
        assert_eq!(
            fx.mutating_methods(),
            vec!["live_update", "shutdown", "define", "start"]
        );
        assert_eq!(fx.vm.state(), DomainState::Running);
        fx.finish().await;
    }

    #[tokio::test]
    async fn live_only_refuses_restart() {
        let fx = Fixture::new().await;
        fx.running().await;
        fx.sim.clear_calls();

        let mut spec = test_spec("vm0");
        spec.update_policy = UpdatePolicy::LiveOnly;
        spec.firmware = Firmware::Bios;
        let err = fx.vm.reconcile(spec, test_placement()).await.unwrap_err();
        assert!(matches!(
            err,
            VmError::Validation(ValidationError::LiveUpdateUnsupported(_))
        ));
        assert!(fx.sim.mutating_calls().is_empty());
        assert_eq!(fx.vm.state(), DomainState::Running);
        fx.finish().await;
    }

    #[tokio::test]
    async fn restart_policy_never_updates_live() {
        let fx = Fixture::new().await;
        fx.running().await;
        fx.sim.clear_calls();

        let mut spec = test_spec("vm0");
        spec.update_policy = UpdatePolicy::Restart;
        spec.memory_mib = 4096;
        let outcome = fx.vm.reconcile(spec, test_placement()).await.unwrap();
        assert_eq!(outcome, ReconcileOutcome::Restarted);
        assert!(!fx.mutating_methods().contains(&"live_update"));
        assert!(fx
            .sim
            .domain_definition("vm0")
            .unwrap()
            .contains("<memory unit='MiB'>4096</memory>"));
        fx.finish().await;
    }

    #[tokio::test]
    async fn completed_migration_leaves_domain_absent() {
        let mut config = test_config();
        config.guest_agent.enabled = true;
        let fx = Fixture::with_config(config).await;
        fx.running().await;
        fx.vm
            .poll_guest(GuestMetadataCategory::Hostname)
            .await
            .unwrap();

        let vm = fx.vm.clone();
        let migration = tokio::spawn(async move {
            vm.migrate(migration_target(), MigrationPolicy::default()).await
        });
        fx.wait_for_migration(MigrationState::Active).await;
        assert!(matches!(fx.vm.state(), DomainState::Migrating(_)));
        assert!(matches!(fx.vm.pause().await, Err(VmError::Busy)));

        fx.sim.complete_migration("vm0");
        let outcome = migration.await.unwrap().unwrap();
        assert_eq!(outcome, MigrationOutcome::Completed);
        assert_eq!(fx.vm.state(), DomainState::Absent);

        let published = fx.vm.state_watch().borrow().clone();
        let status = published.migration.unwrap();
        assert_eq!(status.state, MigrationState::Completed);
        assert_eq!(status.target, "qemu+tls://dst.example/system");

        let report = fx.vm.guest_metadata();
        assert!(report.categories.values().all(|r| r.value.is_none()));
        assert!(report
            .categories
            .values()
            .all(|r| r.status == CategoryStatus::NeverPolled));
        fx.finish().await;
    }

    #[tokio::test]
    async fn migrated_domain_is_not_recreated() {
        let fx = Fixture::new().await;
        fx.running().await;

        let vm = fx.vm.clone();
        let migration = tokio::spawn(async move {
            vm.migrate(migration_target(), MigrationPolicy::default()).await
        });
        fx.wait_for_migration(MigrationState::Active).await;
        fx.sim.complete_migration("vm0");
        assert_eq!(
            migration.await.unwrap().unwrap(),
            MigrationOutcome::Completed
        );
        assert_eq!(fx.vm.state(), DomainState::Absent);
        fx.sim.clear_calls();

        assert!(matches!(
            fx.vm.reconcile(test_spec("vm0"), test_placement()).await,
            Err(VmError::InvalidState {
                reason: RequestDeniedReason::MigratedAway,
                ..
            })
        ));
        assert!(matches!(
            fx.vm.pause().await,
            Err(VmError::InvalidState {
                reason: RequestDeniedReason::MigratedAway,
                ..
            })
        ));
        assert!(matches!(
            fx.vm.migrate(migration_target(), MigrationPolicy::default()).await,
            Err(VmError::InvalidState {
                reason: RequestDeniedReason::MigratedAway,
                ..
            })
        ));
        fx.vm.teardown().await.unwrap();
        fx.vm.shutdown(false, None).await.unwrap();

        assert!(fx.mutating_methods().is_empty());
        assert_eq!(
            fx.sim.domain_state("vm0"),
            Some(RawDomainState::Shutoff(ShutoffReason::Migrated))
        );
        assert_eq!(fx.vm.state(), DomainState::Absent);
        fx.finish().await;
    }

    #[tokio::test]
    async fn migration_by_another_client_blocks_recreation() {
        let fx = Fixture::new().await;
        fx.running().await;

        fx.sim.set_domain_state(
            "vm0",
            RawDomainState::Shutoff(ShutoffReason::Migrated),
            DomainEventKind::Stopped(ShutoffReason::Migrated),
        );
        fx.wait_for_state(DomainState::Absent).await;
        fx.sim.clear_calls();

        assert!(matches!(
            fx.vm.reconcile(test_spec("vm0"), test_placement()).await,
            Err(VmError::InvalidState {
                reason: RequestDeniedReason::MigratedAway,
                ..
            })
        ));
        assert!(fx.mutating_methods().is_empty());
        fx.finish().await;
    }

    #[tokio::test]
    async fn daemon_abort_cancels_migration() {
        let fx = Fixture::new().await;
        fx.running().await;

        let vm = fx.vm.clone();
        let migration = tokio::spawn(async move {
            vm.migrate(migration_target(), MigrationPolicy::default()).await
        });
        fx.wait_for_migration(MigrationState::Active).await;

        fx.sim.abort_migration("vm0");
        let outcome = migration.await.unwrap().unwrap();
        assert_eq!(outcome, MigrationOutcome::Cancelled);
        assert_eq!(fx.vm.state(), DomainState::Running);
        assert!(matches!(
            fx.vm.cancel_migration(),
            Err(VmError::NoMigrationInProgress)
        ));
        fx.finish().await;
    }

    #[tokio::test]
    async fn cancelled_migration_is_aborted() {
        let fx = Fixture::new().await;
        fx.running().await;

        let vm = fx.vm.clone();
        let migration = tokio::spawn(async move {
            vm.migrate(migration_target(), MigrationPolicy::default()).await
        });
        fx.wait_for_migration(MigrationState::Active).await;

        fx.vm.cancel_migration().unwrap();
        let outcome = migration.await.unwrap().unwrap();
        assert_eq!(outcome, MigrationOutcome::Cancelled);
        assert!(fx.mutating_methods().contains(&"migrate_abort"));
        assert_eq!(fx.vm.state(), DomainState::Running);
        fx.finish().await;
    }

    #[tokio::test]
    async fn migration_deadline_fails_migration() {
        let mut config = test_config();
        config.lifecycle.migration_deadline_ms = 100;
        let fx = Fixture::with_config(config).await;
        fx.running().await;

        let outcome = fx
            .vm
            .migrate(migration_target(), MigrationPolicy::default())
            .await
            .unwrap();
        assert_eq!(
            outcome,
            MigrationOutcome::Failed(MigrateError::DeadlineExceeded(
                Duration::from_millis(100)
            ))
        );
        assert!(fx.mutating_methods().contains(&"migrate_abort"));
        assert_eq!(fx.vm.state(), DomainState::Running);

        let status = fx.vm.state_watch().borrow().clone().migration.unwrap();
        assert_eq!(status.state, MigrationState::Failed);
        assert!(status.error.is_some());
        fx.finish().await;
    }

    #[tokio::test]
    async fn migration_job_failure_is_reported() {
        let fx = Fixture::new().await;
        fx.running().await;

        let vm = fx.vm.clone();
        let migration = tokio::spawn(async move {
            vm.migrate(migration_target(), MigrationPolicy::default()).await
        });
        fx.wait_for_migration(MigrationState::Active).await;

        fx.sim.fail_migration("vm0", "target refused connection");
        let outcome = migration.await.unwrap().unwrap();
        assert_eq!(
            outcome,
            MigrationOutcome::Failed(MigrateError::JobFailed(
                "target refused connection".to_owned()
            ))
        );
        assert_eq!(fx.vm.state(), DomainState::Running);
        fx.finish().await;
    }

    #[tokio::test]
    async fn stopped_vm_refuses_requests() {
        let fx = Fixture::new().await;
        fx.vm.stop().await;
        assert!(matches!(
            fx.vm.reconcile(test_spec("vm0"), test_placement()).await,
            Err(VmError::StateDriverGone)
        ));
        fx.conn.shutdown().await;
    }

    #[tokio::test]
    async fn guest_metadata_follows_domain_state() {
        let mut config = test_config();
        config.guest_agent.enabled = true;
        let fx = Fixture::with_config(config).await;

        assert!(matches!(
            fx.vm.poll_guest(GuestMetadataCategory::OsInfo).await,
            Err(VmError::GuestAgent(GuestAgentError::NotRunning))
        ));

        fx.running().await;
        let report =
            fx.vm.poll_guest(GuestMetadataCategory::OsInfo).await.unwrap();
        assert_eq!(report.status, CategoryStatus::Fresh);
        let report = fx.vm.guest_metadata();
        assert!(!report.categories[&GuestMetadataCategory::OsInfo].advisory);

        fx.vm.pause().await.unwrap();
        let report = fx.vm.guest_metadata();
        let os = &report.categories[&GuestMetadataCategory::OsInfo];
        assert!(os.advisory);
        assert!(os.value.is_some());
        fx.finish().await;
    }

    #[tokio::test]
    async fn agent_reconnect_renegotiates_capabilities() {
        let mut config = test_config();
        config.guest_agent.enabled = true;
        let fx = Fixture::with_config(config).await;
        fx.running().await;

        fx.vm.poll_guest(GuestMetadataCategory::OsInfo).await.unwrap();
        fx.vm.poll_guest(GuestMetadataCategory::Hostname).await.unwrap();
        assert_eq!(fx.sim.agent_command_count("guest-info"), 1);

        fx.sim.restart_agent("vm0");
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                fx.vm
                    .poll_guest(GuestMetadataCategory::OsInfo)
                    .await
                    .unwrap();
                if fx.sim.agent_command_count("guest-info") > 1 {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        // One negotiation per agent connection, not per poll.
        fx.vm.poll_guest(GuestMetadataCategory::Hostname).await.unwrap();
        assert_eq!(fx.sim.agent_command_count("guest-info"), 2);
        fx.finish().await;
    }
}
