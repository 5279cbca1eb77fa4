// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The task that carries out a VM's lifecycle requests.
//!
//! The driver is the only reader of its domain's event queue. Between
//! requests it folds events into the domain's published state. While a
//! request is running, the request's own waits consume the events, so a
//! command and the events that confirm it are always seen by the same code.
//!
//! Every command goes through [`StateDriver::issue`], which classifies the
//! daemon's answer as acknowledged or ambiguous, and is then confirmed:
//! first by waiting for an event showing the expected state, and if none
//! arrives in time, by reading the domain's state directly. A command is
//! never resent after an ambiguous failure.

use std::future::Future;
use std::sync::{Arc, Mutex};

use domain_api_types::spec::UpdatePolicy;
use domain_api_types::{
    DomainState, MigrateRole, MigrationPolicy, MigrationStatus,
    MigrationTarget, PlacementConstraints, VmSpec,
};
use launcher_config_toml::LifecycleConfig;
use slog::{debug, error, info, warn, Logger};
use tokio::sync::{watch, Notify};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::connection::{
    ConnectionError, ConnectionManager, DomainEvent, DomainEventRx,
    DomainHandle,
};
use crate::daemon::{
    Daemon, DaemonError, DomainEventKind, DomainInfo, JobInfo,
    RawDomainState, ShutoffReason,
};
use crate::guest_agent::{GuestAgentPoller, PollerTarget};
use crate::migrate::{
    AbortReason, MigrateError, MigrationOutcome, MigrationSession,
};
use crate::spec::{
    DefinitionChange, DomainDefinition, SpecConverter, ValidationError,
};

use super::request_queue::{
    ExternalRequest, ExternalRequestQueue, Reply, RequestDeniedReason,
    RequestKind,
};
use super::state_publisher::{ExternalStateUpdate, StatePublisher};
use super::{ReconcileOutcome, ShutdownOutcome, VmError};

/// How many times a command is sent when the handle it was sent on turns
/// out to be stale.
const COMMAND_ATTEMPTS: usize = 3;

/// Whether the daemon confirmed that it received a command.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Delivery {
    Acknowledged,

    /// The connection failed or timed out after the command was sent. The
    /// command may or may not have taken effect.
    Ambiguous,
}

/// The definition most recently applied to the domain.
struct Applied {
    xml: String,

    /// The structured form, if this process produced the definition. A
    /// definition read back from the daemon has none.
    definition: Option<DomainDefinition>,
}

/// Maps a daemon state to the launcher's vocabulary.
fn state_from_raw(raw: RawDomainState) -> DomainState {
    match raw {
        RawDomainState::NoState => DomainState::Unknown,
        RawDomainState::Running | RawDomainState::Blocked => {
            DomainState::Running
        }
        RawDomainState::Paused(_) => DomainState::Paused,
        RawDomainState::Shutdown => DomainState::ShuttingDown,
        RawDomainState::Shutoff(ShutoffReason::Unknown) => DomainState::Defined,
        RawDomainState::Shutoff(ShutoffReason::Migrated) => DomainState::Absent,
        RawDomainState::Shutoff(ShutoffReason::Crashed)
        | RawDomainState::Crashed => DomainState::Crashed,
        RawDomainState::Shutoff(_) => DomainState::Shutoff,
        RawDomainState::PmSuspended => DomainState::PmSuspended,
    }
}

fn is_stopped(state: DomainState) -> bool {
    matches!(
        state,
        DomainState::Shutoff | DomainState::Defined | DomainState::Absent
    )
}

/// The reason a request that needs a running or paused domain cannot run in
/// `state`.
fn inactive_reason(
    state: DomainState,
    otherwise: RequestDeniedReason,
) -> RequestDeniedReason {
    match state {
        DomainState::Crashed => RequestDeniedReason::Crashed,
        DomainState::Migrating(_) => RequestDeniedReason::MigrationInProgress,
        DomainState::ShuttingDown => RequestDeniedReason::ShutdownInProgress,
        _ => otherwise,
    }
}

/// Everything a driver needs, handed over by [`super::Vm::launch`].
pub(super) struct DriverResources {
    pub name: String,
    pub conn: ConnectionManager,
    pub converter: Arc<SpecConverter>,
    pub config: LifecycleConfig,
    pub queue: Arc<Mutex<ExternalRequestQueue>>,
    pub wake: Arc<Notify>,
    pub events: DomainEventRx,
    pub publisher: StatePublisher,
    pub poller_target: watch::Sender<PollerTarget>,
    pub poller: Arc<GuestAgentPoller>,
    pub stop: CancellationToken,
    pub log: Logger,
}

pub(super) struct StateDriver {
    name: String,
    conn: ConnectionManager,
    converter: Arc<SpecConverter>,
    config: LifecycleConfig,
    queue: Arc<Mutex<ExternalRequestQueue>>,
    wake: Arc<Notify>,
    events: DomainEventRx,
    events_closed: bool,
    publisher: StatePublisher,
    poller_target: watch::Sender<PollerTarget>,
    poller: Arc<GuestAgentPoller>,

    /// The handle commands are sent on. Cleared whenever it may be stale.
    handle: Option<DomainHandle>,

    /// The domain's confirmed state.
    state: DomainState,

    /// Set when events may have been missed, so the next request must read
    /// the domain's state before acting on it.
    needs_refresh: bool,

    applied: Option<Applied>,

    /// Bumped whenever the guest agent may have reconnected.
    agent_epoch: u64,

    stop: CancellationToken,
    log: Logger,
}

impl StateDriver {
    pub(super) fn new(resources: DriverResources) -> Self {
        let DriverResources {
            name,
            conn,
            converter,
            config,
            queue,
            wake,
            events,
            publisher,
            poller_target,
            poller,
            stop,
            log,
        } = resources;

        Self {
            name,
            conn,
            converter,
            config,
            queue,
            wake,
            events,
            events_closed: false,
            publisher,
            poller_target,
            poller,
            handle: None,
            state: DomainState::Unknown,
            needs_refresh: true,
            applied: None,
            agent_epoch: 0,
            stop,
            log,
        }
    }

    /// Reads the domain's current state, adopting it if it exists.
    pub(super) async fn adopt(&mut self) -> Result<(), VmError> {
        self.refresh().await?;
        match self.handle.as_ref() {
            Some(handle) => info!(self.log, "adopted existing domain";
                                  "uuid" => %handle.uuid,
                                  "state" => %self.state),
            None => info!(self.log, "no existing domain"),
        }
        Ok(())
    }

    pub(super) async fn run(mut self) {
        info!(self.log, "state driver started"; "state" => %self.state);

        loop {
            let request = self.queue.lock().unwrap().pop();
            if let Some(request) = request {
                self.handle_external_request(request).await;
                continue;
            }

            tokio::select! {
                biased;

                _ = self.stop.cancelled() => break,
                event = self.events.recv(), if !self.events_closed => {
                    match event {
                        Some(event) => self.handle_event(event).await,
                        None => {
                            info!(self.log, "domain event queue closed");
                            self.events_closed = true;
                        }
                    }
                }
                _ = self.wake.notified() => {}
            }
        }

        self.queue.lock().unwrap().close();
        info!(self.log, "state driver exiting");
    }

    async fn handle_external_request(&mut self, request: ExternalRequest) {
        let kind = request.kind();
        info!(self.log, "handling external request"; "request" => ?request);

        match request {
            ExternalRequest::Reconcile { spec, placement, reply } => {
                let result = self.reconcile(&spec, &placement).await;
                self.respond(kind, reply, result);
            }
            ExternalRequest::Pause { reply } => {
                let result = self.pause().await;
                self.respond(kind, reply, result);
            }
            ExternalRequest::Resume { reply } => {
                let result = self.resume().await;
                self.respond(kind, reply, result);
            }
            ExternalRequest::Shutdown { graceful, deadline, reply } => {
                let result = self.shutdown(graceful, deadline).await;
                self.respond(kind, reply, result);
            }
            ExternalRequest::Migrate { target, policy, cancel, reply } => {
                let result = self.migrate(target, policy, cancel).await;
                self.respond(kind, reply, result);
            }
            ExternalRequest::Teardown { reply } => {
                let result = self.teardown().await;
                self.respond(kind, reply, result);
            }
        }
    }

    fn respond<T: std::fmt::Debug>(
        &mut self,
        kind: RequestKind,
        reply: Reply<T>,
        result: Result<T, VmError>,
    ) {
        match &result {
            Ok(outcome) => info!(self.log, "request completed";
                                 "request" => %kind,
                                 "outcome" => ?outcome,
                                 "state" => %self.state),
            Err(e) => warn!(self.log, "request failed";
                            "request" => %kind,
                            "error" => %e,
                            "state" => %self.state),
        }

        // Complete before replying so that a caller who issues another
        // request as soon as it has this reply does not see the queue busy.
        self.queue.lock().unwrap().complete();
        let _ = reply.send(result);
    }

    fn invalid(&self, request: RequestKind, reason: RequestDeniedReason) -> VmError {
        VmError::InvalidState { request, state: self.state, reason }
    }

    async fn handle_event(&mut self, event: DomainEvent) {
        match event {
            DomainEvent::Daemon(kind) => self.apply_daemon_event(kind),
            DomainEvent::ConnectionLost => {
                warn!(self.log, "daemon connection lost";
                      "last_state" => %self.state);
                self.handle = None;
                self.needs_refresh = true;
                self.update_poller();
            }
            DomainEvent::Reconnected { generation } => {
                info!(self.log, "daemon connection restored; refreshing";
                      "generation" => generation);
                self.agent_epoch += 1;
                if let Err(e) = self.refresh().await {
                    warn!(self.log, "failed to refresh domain after reconnect";
                          "error" => %e);
                }
            }
        }
    }

    fn apply_daemon_event(&mut self, kind: DomainEventKind) {
        debug!(self.log, "domain event"; "event" => ?kind);

        let next = match kind {
            DomainEventKind::Defined => {
                (self.state == DomainState::Absent).then_some(DomainState::Defined)
            }
            DomainEventKind::Undefined => {
                self.handle = None;
                self.applied = None;
                Some(DomainState::Absent)
            }
            DomainEventKind::Started | DomainEventKind::Resumed => {
                Some(DomainState::Running)
            }
            DomainEventKind::Suspended(_) => Some(DomainState::Paused),
            DomainEventKind::ShuttingDown => Some(DomainState::ShuttingDown),
            DomainEventKind::Stopped(ShutoffReason::Crashed)
            | DomainEventKind::Crashed => Some(DomainState::Crashed),
            DomainEventKind::Stopped(ShutoffReason::Migrated) => {
                self.handle = None;
                self.applied = None;
                self.queue.lock().unwrap().mark_migrated_away();
                Some(DomainState::Absent)
            }
            DomainEventKind::Stopped(_) => Some(DomainState::Shutoff),
            DomainEventKind::PmSuspended => Some(DomainState::PmSuspended),
            DomainEventKind::AgentLifecycle { connected } => {
                info!(self.log, "guest agent connection changed";
                      "connected" => connected);
                if connected {
                    self.agent_epoch += 1;
                    self.update_poller();
                }
                None
            }
            DomainEventKind::JobCompleted
            | DomainEventKind::JobFailed { .. }
            | DomainEventKind::JobCancelled => None,
        };

        if let Some(state) = next {
            self.observe(state);
        }
    }

    /// Records a confirmed state and publishes it.
    fn observe(&mut self, state: DomainState) {
        if state == self.state {
            return;
        }

        info!(self.log, "domain state changed";
              "from" => %self.state,
              "to" => %state);
        self.state = state;
        self.queue.lock().unwrap().notify_state_change(state);
        self.publisher.update(ExternalStateUpdate::Domain(state));
        self.update_poller();
    }

    fn observe_migration(&mut self, state: DomainState, status: MigrationStatus) {
        self.state = state;
        self.queue.lock().unwrap().notify_state_change(state);
        self.publisher.update(ExternalStateUpdate::Complete(state, status));
        self.update_poller();
    }

    fn update_poller(&mut self) {
        let target = PollerTarget {
            handle: self.handle.clone(),
            running: self.state == DomainState::Running,
            epoch: self.agent_epoch,
        };
        self.poller_target.send_if_modified(|current| {
            if *current == target {
                false
            } else {
                *current = target;
                true
            }
        });
    }

    async fn lookup(
        &self,
    ) -> Result<Option<(DomainHandle, DomainInfo)>, VmError> {
        match self.conn.acquire(&self.name).await {
            Ok(found) => Ok(Some(found)),
            Err(ConnectionError::Daemon(DaemonError::NoSuchDomain(_))) => {
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Reads the domain's state from the daemon and takes a fresh handle to
    /// it. Never changes the domain.
    async fn refresh(&mut self) -> Result<(), VmError> {
        let found = match self.lookup().await {
            Ok(found) => found,
            Err(e) => {
                self.needs_refresh = true;
                return Err(e);
            }
        };

        match found {
            Some((handle, info)) => {
                let state = state_from_raw(info.state);
                self.needs_refresh = state == DomainState::Unknown;
                if self.applied.is_none() {
                    self.applied =
                        Some(Applied { xml: info.definition, definition: None });
                }
                self.handle = Some(handle);
                self.observe(state);
            }
            None => {
                self.needs_refresh = false;
                self.handle = None;
                self.applied = None;
                self.observe(DomainState::Absent);
            }
        }

        // The handle may have changed even if the state did not.
        self.update_poller();
        Ok(())
    }

    async fn refresh_if_needed(&mut self) -> Result<(), VmError> {
        if self.needs_refresh || self.state == DomainState::Unknown {
            self.refresh().await?;
        }
        Ok(())
    }

    /// Returns a handle valid on the current connection, looking the domain
    /// up again if necessary. Does not publish anything.
    async fn current_handle(&mut self) -> Result<DomainHandle, VmError> {
        if let Some(handle) =
            self.handle.as_ref().filter(|h| self.conn.is_current(h))
        {
            return Ok(handle.clone());
        }

        match self.lookup().await? {
            Some((handle, _)) => {
                self.handle = Some(handle.clone());
                Ok(handle)
            }
            None => {
                Err(VmError::Daemon(DaemonError::NoSuchDomain(self.name.clone())))
            }
        }
    }

    /// Sends a command to the domain.
    ///
    /// A command refused because its handle was stale, or because the
    /// connection was down when it was sent, was never delivered and is sent
    /// again on a fresh handle. An ambiguous failure is reported as
    /// [`Delivery::Ambiguous`] for the caller to confirm.
    async fn issue<F, Fut>(
        &mut self,
        what: &'static str,
        op: F,
    ) -> Result<Delivery, VmError>
    where
        F: Fn(Arc<dyn Daemon>, String) -> Fut,
        Fut: Future<Output = Result<(), DaemonError>>,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let handle = self.current_handle().await?;
            match self.conn.with_domain(&handle, &op).await {
                Ok(()) => return Ok(Delivery::Acknowledged),
                Err(ConnectionError::Daemon(
                    e @ (DaemonError::StaleHandle(_) | DaemonError::NotConnected),
                )) if attempt < COMMAND_ATTEMPTS => {
                    debug!(self.log, "command not delivered; retrying";
                           "command" => what,
                           "attempt" => attempt,
                           "error" => %e);
                    self.handle = None;
                }
                Err(ConnectionError::Daemon(e)) if e.is_ambiguous() => {
                    warn!(self.log, "command outcome unknown";
                          "command" => what,
                          "error" => %e);
                    return Ok(Delivery::Ambiguous);
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Waits until `done` holds for the domain's state, handling events as
    /// they arrive. Returns false at the deadline.
    ///
    /// Fails with [`VmError::Crashed`] if the domain crashes while waiting.
    async fn wait_for<F>(
        &mut self,
        deadline: Instant,
        done: F,
    ) -> Result<bool, VmError>
    where
        F: Fn(DomainState) -> bool,
    {
        let was_crashed = self.state == DomainState::Crashed;
        loop {
            if done(self.state) {
                return Ok(true);
            }
            if !was_crashed && self.state == DomainState::Crashed {
                return Err(VmError::Crashed);
            }
            if self.events_closed {
                return Ok(false);
            }

            let event = tokio::select! {
                _ = self.stop.cancelled() => return Ok(false),
                event = tokio::time::timeout_at(deadline, self.events.recv()) => event,
            };

            match event {
                Err(_) => return Ok(false),
                Ok(None) => {
                    self.events_closed = true;
                    return Ok(false);
                }
                Ok(Some(event)) => self.handle_event(event).await,
            }
        }
    }

    /// Confirms that a command moved the domain into a state satisfying
    /// `done`.
    async fn confirm<F>(
        &mut self,
        what: &'static str,
        delivery: Delivery,
        done: F,
    ) -> Result<(), VmError>
    where
        F: Fn(DomainState) -> bool,
    {
        let was_crashed = self.state == DomainState::Crashed;
        let deadline = Instant::now() + self.config.confirm_timeout();
        if self.wait_for(deadline, &done).await? {
            return Ok(());
        }

        debug!(self.log, "no confirming event; reading domain state";
               "command" => what);
        if let Err(e) = self.refresh().await {
            error!(self.log, "cannot read domain state";
                   "command" => what,
                   "error" => %e);
            self.observe(DomainState::Unknown);
            return Err(VmError::Unknown(what));
        }

        if done(self.state) {
            return Ok(());
        }
        if !was_crashed && self.state == DomainState::Crashed {
            return Err(VmError::Crashed);
        }

        self.needs_refresh = true;
        warn!(self.log, "command not confirmed";
              "command" => what,
              "delivery" => ?delivery,
              "state" => %self.state);
        match delivery {
            Delivery::Acknowledged => Err(VmError::Timeout(what)),
            Delivery::Ambiguous => Err(VmError::Unknown(what)),
        }
    }

    /// Confirms that the daemon holds definition `xml`. Definition changes
    /// emit no state change, so an ambiguous delivery is checked by reading
    /// the definition back.
    async fn confirm_definition(
        &mut self,
        what: &'static str,
        delivery: Delivery,
        xml: &str,
    ) -> Result<(), VmError> {
        if delivery == Delivery::Acknowledged {
            return Ok(());
        }

        let current = match self.lookup().await {
            Ok(found) => found.map(|(_, info)| info.definition),
            Err(e) => {
                error!(self.log, "cannot read domain definition";
                       "command" => what,
                       "error" => %e);
                self.needs_refresh = true;
                return Err(VmError::Unknown(what));
            }
        };

        if current.as_deref() == Some(xml) {
            Ok(())
        } else {
            self.needs_refresh = true;
            Err(VmError::Unknown(what))
        }
    }

    fn is_applied(&self, xml: &str) -> bool {
        self.applied.as_ref().is_some_and(|a| a.xml == xml)
    }

    async fn reconcile(
        &mut self,
        spec: &VmSpec,
        placement: &PlacementConstraints,
    ) -> Result<ReconcileOutcome, VmError> {
        if spec.name != self.name {
            return Err(ValidationError::NameMismatch {
                expected: self.name.clone(),
                found: spec.name.clone(),
            }
            .into());
        }

        let definition = self.converter.convert(spec, placement)?;
        let xml = definition.render();
        self.refresh_if_needed().await?;

        if self.queue.lock().unwrap().is_migrated_away() {
            return Err(self.invalid(
                RequestKind::Reconcile,
                RequestDeniedReason::MigratedAway,
            ));
        }

        match self.state {
            DomainState::Crashed => Err(VmError::Crashed),
            DomainState::Absent => {
                self.define(&xml, &definition).await?;
                self.start().await?;
                Ok(ReconcileOutcome::Created)
            }
            DomainState::Defined | DomainState::Shutoff => {
                if !self.is_applied(&xml) {
                    self.define(&xml, &definition).await?;
                }
                self.start().await?;
                Ok(ReconcileOutcome::Started)
            }
            DomainState::Running
            | DomainState::Paused
            | DomainState::PmSuspended => {
                if self.is_applied(&xml) {
                    return Ok(ReconcileOutcome::Unchanged);
                }
                self.update_active(spec.update_policy, &xml, &definition).await
            }
            DomainState::ShuttingDown => Err(self.invalid(
                RequestKind::Reconcile,
                RequestDeniedReason::ShutdownInProgress,
            )),
            DomainState::Migrating(_) => Err(self.invalid(
                RequestKind::Reconcile,
                RequestDeniedReason::MigrationInProgress,
            )),
            DomainState::Unknown => Err(VmError::Unknown("reconcile")),
        }
    }

    /// Applies a new definition to an active domain according to `policy`.
    async fn update_active(
        &mut self,
        policy: UpdatePolicy,
        xml: &str,
        definition: &DomainDefinition,
    ) -> Result<ReconcileOutcome, VmError> {
        let changes = match self.applied.as_ref().and_then(|a| a.definition.as_ref()) {
            Some(old) => old.diff(definition),
            None => vec![DefinitionChange::Unknown],
        };
        let may_apply_live = changes.iter().all(DefinitionChange::may_apply_live);
        info!(self.log, "domain definition out of date";
              "changes" => ?changes,
              "policy" => ?policy);

        match policy {
            UpdatePolicy::Restart => self.restart(xml, definition).await,
            UpdatePolicy::LiveOnly => {
                if !may_apply_live {
                    return Err(ValidationError::LiveUpdateUnsupported(changes).into());
                }
                match self.live_update(xml, definition, &changes).await {
                    Err(VmError::Daemon(DaemonError::Unsupported(_))) => {
                        Err(ValidationError::LiveUpdateUnsupported(changes).into())
                    }
                    other => other,
                }
            }
            UpdatePolicy::LiveOrRestart => {
                if may_apply_live {
                    match self.live_update(xml, definition, &changes).await {
                        Err(VmError::Daemon(DaemonError::Unsupported(reason))) => {
                            info!(self.log, "live update refused; restarting";
                                  "reason" => reason);
                        }
                        other => return other,
                    }
                }
                self.restart(xml, definition).await
            }
        }
    }

    async fn live_update(
        &mut self,
        xml: &str,
        definition: &DomainDefinition,
        changes: &[DefinitionChange],
    ) -> Result<ReconcileOutcome, VmError> {
        let delivery = self
            .issue("live_update", |daemon, name| {
                let xml = xml.to_owned();
                let changes = changes.to_vec();
                async move { daemon.live_update(&name, &xml, &changes).await }
            })
            .await?;
        self.confirm_definition("live_update", delivery, xml).await?;

        self.applied = Some(Applied {
            xml: xml.to_owned(),
            definition: Some(definition.clone()),
        });
        Ok(ReconcileOutcome::LiveUpdated)
    }

    async fn restart(
        &mut self,
        xml: &str,
        definition: &DomainDefinition,
    ) -> Result<ReconcileOutcome, VmError> {
        let graceful = self.state == DomainState::Running;
        let outcome =
            self.shutdown(graceful, self.config.shutdown_deadline()).await?;
        debug!(self.log, "domain stopped for restart"; "outcome" => ?outcome);

        self.define(xml, definition).await?;
        self.start().await?;
        Ok(ReconcileOutcome::Restarted)
    }

    async fn define(
        &mut self,
        xml: &str,
        definition: &DomainDefinition,
    ) -> Result<(), VmError> {
        let delivery = match self.conn.define(&self.name, xml).await {
            Ok(handle) => {
                self.handle = Some(handle);
                Delivery::Acknowledged
            }
            Err(ConnectionError::Daemon(e)) if e.is_ambiguous() => {
                warn!(self.log, "define outcome unknown"; "error" => %e);
                Delivery::Ambiguous
            }
            Err(e) => return Err(e.into()),
        };
        self.confirm_definition("define", delivery, xml).await?;

        self.applied = Some(Applied {
            xml: xml.to_owned(),
            definition: Some(definition.clone()),
        });
        Ok(())
    }

    async fn start(&mut self) -> Result<(), VmError> {
        let delivery = self
            .issue("start", |daemon, name| async move { daemon.start(&name).await })
            .await?;
        self.confirm("start", delivery, |s| s == DomainState::Running).await
    }

    async fn pause(&mut self) -> Result<(), VmError> {
        self.refresh_if_needed().await?;
        match self.state {
            DomainState::Paused => return Ok(()),
            DomainState::Running => {}
            state => {
                return Err(self.invalid(
                    RequestKind::Pause,
                    inactive_reason(state, RequestDeniedReason::NotRunning),
                ))
            }
        }

        let delivery = self
            .issue("pause", |daemon, name| async move { daemon.pause(&name).await })
            .await?;
        self.confirm("pause", delivery, |s| s == DomainState::Paused).await
    }

    async fn resume(&mut self) -> Result<(), VmError> {
        self.refresh_if_needed().await?;
        match self.state {
            DomainState::Running => return Ok(()),
            DomainState::Paused => {}
            state => {
                return Err(self.invalid(
                    RequestKind::Resume,
                    inactive_reason(state, RequestDeniedReason::NotPaused),
                ))
            }
        }

        let delivery = self
            .issue("resume", |daemon, name| async move { daemon.resume(&name).await })
            .await?;
        self.confirm("resume", delivery, |s| s == DomainState::Running).await
    }

    async fn shutdown(
        &mut self,
        graceful: bool,
        deadline: std::time::Duration,
    ) -> Result<ShutdownOutcome, VmError> {
        self.refresh_if_needed().await?;
        if is_stopped(self.state) {
            return Ok(ShutdownOutcome::AlreadyStopped);
        }
        if let DomainState::Migrating(_) = self.state {
            return Err(self.invalid(
                RequestKind::Shutdown,
                RequestDeniedReason::MigrationInProgress,
            ));
        }

        // Paused and suspended guests cannot act on a shutdown request, so
        // they are always stopped by force.
        if graceful
            && matches!(
                self.state,
                DomainState::Running | DomainState::ShuttingDown
            )
        {
            if self.state == DomainState::Running {
                let delivery = self
                    .issue("shutdown", |daemon, name| async move {
                        daemon.shutdown(&name).await
                    })
                    .await?;
                debug!(self.log, "shutdown requested"; "delivery" => ?delivery);
            }

            if self.wait_for(Instant::now() + deadline, is_stopped).await? {
                return Ok(ShutdownOutcome::Graceful);
            }

            // Re-read in case the stop event was lost.
            self.refresh().await?;
            if is_stopped(self.state) {
                return Ok(ShutdownOutcome::Graceful);
            }
            warn!(self.log, "guest did not shut down in time; destroying";
                  "deadline" => ?deadline,
                  "state" => %self.state);
        }

        self.destroy().await
    }

    async fn destroy(&mut self) -> Result<ShutdownOutcome, VmError> {
        let delivery = match self
            .issue("destroy", |daemon, name| async move {
                daemon.destroy(&name).await
            })
            .await
        {
            Ok(delivery) => delivery,
            Err(VmError::Daemon(DaemonError::OperationInvalid(reason))) => {
                // The domain may have stopped on its own since it was last
                // read.
                self.refresh().await?;
                if is_stopped(self.state) {
                    return Ok(ShutdownOutcome::AlreadyStopped);
                }
                return Err(VmError::Daemon(DaemonError::OperationInvalid(
                    reason,
                )));
            }
            Err(e) => return Err(e),
        };

        self.confirm("destroy", delivery, is_stopped).await?;
        Ok(ShutdownOutcome::Forced)
    }

    async fn teardown(&mut self) -> Result<(), VmError> {
        self.refresh_if_needed().await?;
        match self.state {
            DomainState::Absent => return Ok(()),
            DomainState::Unknown => return Err(VmError::Unknown("teardown")),
            DomainState::Crashed => {
                let outcome = self.destroy().await?;
                debug!(self.log, "crashed domain stopped"; "outcome" => ?outcome);
            }
            state if state.is_active() => {
                return Err(self.invalid(
                    RequestKind::Teardown,
                    RequestDeniedReason::DomainActive,
                ))
            }
            _ => {}
        }

        let result = self
            .issue("undefine", |daemon, name| async move {
                daemon.undefine(&name).await
            })
            .await;
        match result {
            Ok(delivery) => {
                self.confirm("undefine", delivery, |s| s == DomainState::Absent)
                    .await?
            }
            Err(VmError::Daemon(DaemonError::NoSuchDomain(_))) => {
                self.refresh().await?
            }
            Err(e) => return Err(e),
        }

        self.handle = None;
        self.applied = None;
        self.update_poller();
        self.poller.clear().await;
        Ok(())
    }

    async fn job_info(&mut self) -> Result<JobInfo, VmError> {
        let handle = self.current_handle().await?;
        Ok(self
            .conn
            .with_domain(&handle, |daemon, name| async move {
                daemon.job_info(&name).await
            })
            .await?)
    }

    async fn migrate(
        &mut self,
        target: MigrationTarget,
        policy: MigrationPolicy,
        cancel: CancellationToken,
    ) -> Result<MigrationOutcome, VmError> {
        self.refresh_if_needed().await?;
        if self.state != DomainState::Running {
            return Err(self.invalid(
                RequestKind::Migrate,
                inactive_reason(self.state, RequestDeniedReason::NotRunning),
            ));
        }

        let mut session =
            MigrationSession::new(target, policy, self.config.migration_deadline());
        info!(self.log, "starting outgoing migration";
              "migration_id" => %session.id,
              "target" => &session.target.uri,
              "timeout" => ?session.timeout);
        self.observe_migration(
            DomainState::Migrating(MigrateRole::Source),
            session.status(),
        );

        let outcome = if cancel.is_cancelled() {
            MigrationOutcome::Cancelled
        } else {
            let target = session.target.clone();
            let policy = session.policy.clone();
            let started = self
                .issue("migrate_start", move |daemon, name| {
                    let target = target.clone();
                    let policy = policy.clone();
                    async move { daemon.migrate_start(&name, &target, &policy).await }
                })
                .await;

            match started {
                Ok(Delivery::Acknowledged) => {
                    self.monitor_migration(&mut session, &cancel).await
                }
                Ok(Delivery::Ambiguous) => match self.job_info().await {
                    Ok(job) if job.active => {
                        self.monitor_migration(&mut session, &cancel).await
                    }
                    _ => MigrationOutcome::Failed(MigrateError::StartFailed(
                        "daemon did not confirm the migration job".to_owned(),
                    )),
                },
                Err(e) => {
                    MigrationOutcome::Failed(MigrateError::StartFailed(e.to_string()))
                }
            }
        };

        self.finish_migration(&mut session, &outcome).await;
        Ok(outcome)
    }

    /// Follows a started migration job until it ends.
    async fn monitor_migration(
        &mut self,
        session: &mut MigrationSession,
        cancel: &CancellationToken,
    ) -> MigrationOutcome {
        let mut progress =
            tokio::time::interval(self.config.migration_progress_interval());
        progress.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let aborting = session.abort.is_some();

            // Events come first: an event already queued says more about
            // how the job ended than a progress sample taken after it.
            tokio::select! {
                biased;

                event = self.events.recv(), if !self.events_closed => {
                    let Some(event) = event else {
                        self.events_closed = true;
                        return MigrationOutcome::Failed(MigrateError::OutcomeLost);
                    };
                    if let Some(outcome) = self.migration_event(session, event).await {
                        return outcome;
                    }
                }
                _ = cancel.cancelled(), if !aborting => {
                    self.abort_migration(session, AbortReason::Requested).await;
                }
                _ = tokio::time::sleep_until(session.deadline), if !aborting => {
                    warn!(self.log, "migration deadline passed";
                          "migration_id" => %session.id,
                          "timeout" => ?session.timeout);
                    self.abort_migration(session, AbortReason::Deadline).await;
                }
                _ = progress.tick() => {
                    if let Some(outcome) = self.sample_migration(session).await {
                        return outcome;
                    }
                }
            }
        }
    }

    /// Maps an event received during a migration to the migration's outcome,
    /// if the event ends it.
    async fn migration_event(
        &mut self,
        session: &mut MigrationSession,
        event: DomainEvent,
    ) -> Option<MigrationOutcome> {
        let kind = match event {
            DomainEvent::Daemon(kind) => kind,
            DomainEvent::ConnectionLost => {
                warn!(self.log, "daemon connection lost during migration";
                      "migration_id" => %session.id);
                self.handle = None;
                self.needs_refresh = true;
                return None;
            }
            DomainEvent::Reconnected { generation } => {
                info!(self.log, "daemon connection restored during migration";
                      "generation" => generation);
                self.agent_epoch += 1;
                return self.recheck_migration(session).await;
            }
        };

        match kind {
            DomainEventKind::JobCompleted
            | DomainEventKind::Stopped(ShutoffReason::Migrated) => {
                Some(MigrationOutcome::Completed)
            }
            DomainEventKind::JobFailed { message } => {
                Some(MigrationOutcome::Failed(MigrateError::JobFailed(message)))
            }
            DomainEventKind::JobCancelled => Some(session.cancelled_outcome()),
            DomainEventKind::Crashed
            | DomainEventKind::Stopped(ShutoffReason::Crashed) => {
                Some(MigrationOutcome::Failed(MigrateError::DomainCrashed))
            }
            DomainEventKind::Stopped(reason) => {
                Some(MigrationOutcome::Failed(MigrateError::JobFailed(format!(
                    "domain stopped during migration ({:?})",
                    reason
                ))))
            }
            other => {
                debug!(self.log, "event during migration"; "event" => ?other);
                None
            }
        }
    }

    /// Samples the job's progress. A job that is no longer active has ended
    /// without an event, so its outcome is worked out from the domain.
    async fn sample_migration(
        &mut self,
        session: &mut MigrationSession,
    ) -> Option<MigrationOutcome> {
        match self.job_info().await {
            Ok(job) if job.active => {
                if session.record_progress(&job) {
                    self.publisher
                        .update(ExternalStateUpdate::Migration(session.status()));
                }
                None
            }
            Ok(_) => {
                debug!(self.log, "migration job no longer active";
                       "migration_id" => %session.id);
                self.recheck_migration(session).await
            }
            Err(e) => {
                debug!(self.log, "failed to sample migration progress";
                       "error" => %e);
                None
            }
        }
    }

    /// Works out how a migration stands from the domain's state, for when
    /// its events may have been lost.
    async fn recheck_migration(
        &mut self,
        session: &mut MigrationSession,
    ) -> Option<MigrationOutcome> {
        let info = match self.lookup().await {
            Ok(Some((handle, info))) => {
                self.handle = Some(handle);
                info
            }
            Ok(None) => return Some(MigrationOutcome::Completed),
            Err(e) => {
                warn!(self.log, "failed to look up migrating domain";
                      "error" => %e);
                return None;
            }
        };

        match info.state {
            RawDomainState::Shutoff(ShutoffReason::Migrated) => {
                Some(MigrationOutcome::Completed)
            }
            RawDomainState::Crashed
            | RawDomainState::Shutoff(ShutoffReason::Crashed) => {
                Some(MigrationOutcome::Failed(MigrateError::DomainCrashed))
            }
            RawDomainState::Shutoff(reason) => {
                Some(MigrationOutcome::Failed(MigrateError::JobFailed(format!(
                    "domain stopped during migration ({:?})",
                    reason
                ))))
            }
            _ => match self.job_info().await {
                Ok(job) if job.active => {
                    if session.record_progress(&job) {
                        self.publisher.update(ExternalStateUpdate::Migration(
                            session.status(),
                        ));
                    }
                    None
                }
                Ok(_) if session.abort.is_some() => {
                    Some(session.cancelled_outcome())
                }
                Ok(_) => {
                    Some(MigrationOutcome::Failed(MigrateError::OutcomeLost))
                }
                Err(e) => {
                    warn!(self.log, "failed to read migration job";
                          "error" => %e);
                    None
                }
            },
        }
    }

    async fn abort_migration(
        &mut self,
        session: &mut MigrationSession,
        reason: AbortReason,
    ) {
        if !session.begin_abort(reason) {
            return;
        }

        info!(self.log, "aborting migration";
              "migration_id" => %session.id,
              "reason" => ?reason);
        self.publisher
            .update(ExternalStateUpdate::Migration(session.status()));

        let result = self
            .issue("migrate_abort", |daemon, name| async move {
                daemon.migrate_abort(&name).await
            })
            .await;
        if let Err(e) = result {
            // The job may already have ended; its outcome still arrives as
            // an event or shows up in the next sample.
            warn!(self.log, "failed to abort migration job"; "error" => %e);
        }
    }

    async fn finish_migration(
        &mut self,
        session: &mut MigrationSession,
        outcome: &MigrationOutcome,
    ) {
        session.finish(outcome);
        let status = session.status();

        match outcome {
            MigrationOutcome::Completed => {
                info!(self.log, "migration completed";
                      "migration_id" => %session.id,
                      "target" => &session.target.uri);
                self.handle = None;
                self.applied = None;
                self.queue.lock().unwrap().mark_migrated_away();
                self.observe_migration(DomainState::Absent, status);
                self.poller.clear().await;
            }
            MigrationOutcome::Failed(MigrateError::DomainCrashed) => {
                error!(self.log, "domain crashed during migration";
                       "migration_id" => %session.id);
                self.observe_migration(DomainState::Crashed, status);
            }
            outcome => {
                warn!(self.log, "migration did not complete";
                      "migration_id" => %session.id,
                      "outcome" => ?outcome);
                self.publisher.update(ExternalStateUpdate::Migration(status));
                self.restore_after_migration().await;
            }
        }
    }

    /// Brings the domain back to running after a migration out of it failed
    /// or was cancelled.
    async fn restore_after_migration(&mut self) {
        if let Err(e) = self.refresh().await {
            error!(self.log, "cannot read domain state after migration";
                   "error" => %e);
            self.observe(DomainState::Unknown);
            return;
        }

        if self.state != DomainState::Paused {
            return;
        }

        info!(self.log, "resuming domain paused by migration");
        let result = match self
            .issue("resume", |daemon, name| async move {
                daemon.resume(&name).await
            })
            .await
        {
            Ok(delivery) => {
                self.confirm("resume", delivery, |s| s == DomainState::Running)
                    .await
            }
            Err(e) => Err(e),
        };
        if let Err(e) = result {
            error!(self.log, "failed to resume domain after migration";
                   "error" => %e);
        }
    }
}
