// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! An in-process virtualization daemon.
//!
//! The simulated daemon keeps a table of domains and emits the same events a
//! real daemon would, synchronously with the command that caused them. It
//! records every command it receives and lets callers inject failures, drop
//! the connection, and drive migration jobs and the guest agent by hand.

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use domain_api_types::{MigrationPolicy, MigrationTarget};
use serde_json::json;
use slog::{debug, info, Logger};
use tokio::sync::mpsc;
use uuid::Uuid;

use super::{
    Connector, Daemon, DaemonError, DaemonEvent, DaemonLink, DomainEventKind,
    DomainInfo, JobInfo, PauseReason, RawDomainState, ShutoffReason,
};
use crate::spec::DefinitionChange;

/// Commands that change daemon-side state.
const MUTATING_METHODS: &[&str] = &[
    "define",
    "undefine",
    "start",
    "pause",
    "resume",
    "shutdown",
    "destroy",
    "live_update",
    "migrate_start",
    "migrate_abort",
];

/// A command the simulated daemon received.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SimCall {
    pub session: u64,
    pub method: &'static str,
    pub domain: Option<String>,
}

impl SimCall {
    pub fn is_mutating(&self) -> bool {
        MUTATING_METHODS.contains(&self.method)
    }
}

/// A failure to inject into the next call of a given method.
#[derive(Clone, Debug)]
pub enum Fault {
    /// Fail the call without acting on it.
    Reject(DaemonError),

    /// Act on the call and then fail it, as if the reply had been lost.
    LoseReply(DaemonError),
}

struct SimDomain {
    uuid: Uuid,
    state: RawDomainState,
    definition: String,
    job: Option<JobInfo>,
    agent_connected: bool,
}

impl SimDomain {
    fn is_active(&self) -> bool {
        !matches!(
            self.state,
            RawDomainState::Shutoff(_) | RawDomainState::NoState
        )
    }
}

struct GuestAgentSim {
    present: bool,
    version: String,
    supported: BTreeSet<String>,
    responses: BTreeMap<String, serde_json::Value>,
    hanging: BTreeSet<String>,
    failing: BTreeSet<String>,
    counts: BTreeMap<String, usize>,
}

impl Default for GuestAgentSim {
    fn default() -> Self {
        let responses = default_agent_responses();
        let mut supported: BTreeSet<String> =
            responses.keys().cloned().collect();
        supported.insert("guest-info".to_owned());
        supported.insert("guest-ping".to_owned());
        Self {
            present: true,
            version: "8.2.0".to_owned(),
            supported,
            responses,
            hanging: BTreeSet::new(),
            failing: BTreeSet::new(),
            counts: BTreeMap::new(),
        }
    }
}

type LiveUpdatePredicate = Box<dyn Fn(&DefinitionChange) -> bool + Send>;

struct SimState {
    next_session: u64,
    active_session: Option<(u64, mpsc::UnboundedSender<DaemonEvent>)>,
    refuse_connections: bool,
    emit_events: bool,
    guest_honors_shutdown: bool,
    live_update_supported: LiveUpdatePredicate,
    domains: BTreeMap<String, SimDomain>,
    calls: Vec<SimCall>,
    faults: HashMap<&'static str, VecDeque<Fault>>,
    agent: GuestAgentSim,
}

impl SimState {
    fn emit(&mut self, domain: &str, kind: DomainEventKind) {
        if !self.emit_events {
            return;
        }

        if let Some((_, tx)) = &self.active_session {
            let _ = tx.send(DaemonEvent { domain: domain.to_owned(), kind });
        }
    }

    fn domain_mut(&mut self, name: &str) -> Result<&mut SimDomain, DaemonError> {
        self.domains
            .get_mut(name)
            .ok_or_else(|| DaemonError::NoSuchDomain(name.to_owned()))
    }
}

pub struct SimulatedDaemon {
    state: Mutex<SimState>,
    log: Logger,
}

impl SimulatedDaemon {
    pub fn new(log: Logger) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(SimState {
                next_session: 1,
                active_session: None,
                refuse_connections: false,
                emit_events: true,
                guest_honors_shutdown: true,
                live_update_supported: Box::new(|c| c.may_apply_live()),
                domains: BTreeMap::new(),
                calls: Vec::new(),
                faults: HashMap::new(),
                agent: GuestAgentSim::default(),
            }),
            log,
        })
    }

    pub fn connector(self: &Arc<Self>) -> SimConnector {
        SimConnector(self.clone())
    }

    /// Drops the active connection. Its event stream ends and commands sent
    /// on it fail with `NotConnected`.
    pub fn disconnect(&self) {
        let mut state = self.state.lock().unwrap();
        if let Some((session, _)) = state.active_session.take() {
            info!(self.log, "simulated daemon dropping connection";
                  "session" => session);
        }
    }

    pub fn set_refuse_connections(&self, refuse: bool) {
        self.state.lock().unwrap().refuse_connections = refuse;
    }

    pub fn set_emit_events(&self, emit: bool) {
        self.state.lock().unwrap().emit_events = emit;
    }

    /// Controls whether guests stop when asked to shut down.
    pub fn set_guest_honors_shutdown(&self, honors: bool) {
        self.state.lock().unwrap().guest_honors_shutdown = honors;
    }

    pub fn set_live_update_predicate<F>(&self, f: F)
    where
        F: Fn(&DefinitionChange) -> bool + Send + 'static,
    {
        self.state.lock().unwrap().live_update_supported = Box::new(f);
    }

    /// Queues a fault for the next call of `method`.
    pub fn inject_fault(&self, method: &'static str, fault: Fault) {
        self.state
            .lock()
            .unwrap()
            .faults
            .entry(method)
            .or_default()
            .push_back(fault);
    }

    pub fn calls(&self) -> Vec<SimCall> {
        self.state.lock().unwrap().calls.clone()
    }

    /// Calls other than guest agent commands, which the poller issues on its
    /// own schedule.
    pub fn lifecycle_calls(&self) -> Vec<SimCall> {
        self.calls()
            .into_iter()
            .filter(|c| c.method != "guest_agent_command")
            .collect()
    }

    pub fn mutating_calls(&self) -> Vec<SimCall> {
        self.calls().into_iter().filter(SimCall::is_mutating).collect()
    }

    pub fn clear_calls(&self) {
        self.state.lock().unwrap().calls.clear();
    }

    pub fn domain_state(&self, name: &str) -> Option<RawDomainState> {
        self.state.lock().unwrap().domains.get(name).map(|d| d.state)
    }

    pub fn domain_definition(&self, name: &str) -> Option<String> {
        self.state
            .lock()
            .unwrap()
            .domains
            .get(name)
            .map(|d| d.definition.clone())
    }

    /// Adds a domain as if another process had defined it.
    pub fn insert_domain(
        &self,
        name: &str,
        state: RawDomainState,
        definition: &str,
    ) {
        let mut sim = self.state.lock().unwrap();
        let agent_connected = state == RawDomainState::Running;
        sim.domains.insert(
            name.to_owned(),
            SimDomain {
                uuid: uuid_from_definition(definition),
                state,
                definition: definition.to_owned(),
                job: None,
                agent_connected,
            },
        );
    }

    /// Changes a domain's state from outside the launcher, emitting `kind`.
    pub fn set_domain_state(
        &self,
        name: &str,
        state: RawDomainState,
        kind: DomainEventKind,
    ) {
        let mut sim = self.state.lock().unwrap();
        if let Some(dom) = sim.domains.get_mut(name) {
            dom.state = state;
            dom.job = None;
        }
        sim.emit(name, kind);
    }

    pub fn crash(&self, name: &str) {
        self.set_domain_state(
            name,
            RawDomainState::Crashed,
            DomainEventKind::Crashed,
        );
    }

    pub fn set_job_progress(&self, name: &str, info: JobInfo) {
        if let Some(dom) = self.state.lock().unwrap().domains.get_mut(name) {
            if dom.job.is_some() {
                dom.job = Some(info);
            }
        }
    }

    /// Finishes the domain's outgoing migration successfully.
    pub fn complete_migration(&self, name: &str) {
        let mut sim = self.state.lock().unwrap();
        if let Some(dom) = sim.domains.get_mut(name) {
            dom.job = None;
            dom.state = RawDomainState::Shutoff(ShutoffReason::Migrated);
            dom.agent_connected = false;
        }
        sim.emit(name, DomainEventKind::JobCompleted);
        sim.emit(name, DomainEventKind::Stopped(ShutoffReason::Migrated));
    }

    pub fn fail_migration(&self, name: &str, message: &str) {
        let mut sim = self.state.lock().unwrap();
        if let Some(dom) = sim.domains.get_mut(name) {
            dom.job = None;
        }
        sim.emit(
            name,
            DomainEventKind::JobFailed { message: message.to_owned() },
        );
    }

    /// Aborts the domain's migration job on the daemon's own initiative.
    pub fn abort_migration(&self, name: &str) {
        let mut sim = self.state.lock().unwrap();
        if let Some(dom) = sim.domains.get_mut(name) {
            dom.job = None;
        }
        sim.emit(name, DomainEventKind::JobCancelled);
    }

    pub fn set_agent_present(&self, present: bool) {
        self.state.lock().unwrap().agent.present = present;
    }

    /// Replaces the set of commands the guest agent reports as supported.
    pub fn set_agent_supported(&self, commands: &[&str]) {
        self.state.lock().unwrap().agent.supported =
            commands.iter().map(|c| c.to_string()).collect();
    }

    pub fn set_agent_response(&self, command: &str, value: serde_json::Value) {
        self.state
            .lock()
            .unwrap()
            .agent
            .responses
            .insert(command.to_owned(), value);
    }

    /// Makes `command` never answer, so callers hit their own timeout.
    pub fn set_agent_hang(&self, command: &str, hang: bool) {
        let agent = &mut self.state.lock().unwrap().agent;
        if hang {
            agent.hanging.insert(command.to_owned());
        } else {
            agent.hanging.remove(command);
        }
    }

    pub fn set_agent_fail(&self, command: &str, fail: bool) {
        let agent = &mut self.state.lock().unwrap().agent;
        if fail {
            agent.failing.insert(command.to_owned());
        } else {
            agent.failing.remove(command);
        }
    }

    pub fn agent_command_count(&self, command: &str) -> usize {
        self.state
            .lock()
            .unwrap()
            .agent
            .counts
            .get(command)
            .copied()
            .unwrap_or(0)
    }

    /// Simulates the guest agent restarting inside the guest.
    pub fn restart_agent(&self, name: &str) {
        let mut sim = self.state.lock().unwrap();
        sim.emit(name, DomainEventKind::AgentLifecycle { connected: false });
        sim.emit(name, DomainEventKind::AgentLifecycle { connected: true });
    }

    /// Records a call and applies any queued fault. Returns the fault that
    /// should be reported after the call takes effect, if any.
    fn begin(
        &self,
        state: &mut SimState,
        session: u64,
        method: &'static str,
        domain: Option<&str>,
    ) -> Result<Option<DaemonError>, DaemonError> {
        match &state.active_session {
            Some((active, _)) if *active == session => {}
            _ => return Err(DaemonError::NotConnected),
        }

        debug!(self.log, "simulated daemon call";
               "method" => method,
               "domain" => domain.unwrap_or("-"));
        state.calls.push(SimCall {
            session,
            method,
            domain: domain.map(str::to_owned),
        });

        match state.faults.get_mut(method).and_then(|q| q.pop_front()) {
            Some(Fault::Reject(e)) => Err(e),
            Some(Fault::LoseReply(e)) => Ok(Some(e)),
            None => Ok(None),
        }
    }
}

fn finish<T>(value: T, lost: Option<DaemonError>) -> Result<T, DaemonError> {
    match lost {
        Some(e) => Err(e),
        None => Ok(value),
    }
}

fn uuid_from_definition(definition: &str) -> Uuid {
    definition
        .split_once("<uuid>")
        .and_then(|(_, rest)| rest.split_once("</uuid>"))
        .and_then(|(id, _)| Uuid::parse_str(id.trim()).ok())
        .unwrap_or_else(Uuid::new_v4)
}

fn default_agent_responses() -> BTreeMap<String, serde_json::Value> {
    BTreeMap::from([
        (
            "guest-get-osinfo".to_owned(),
            json!({
                "id": "ubuntu",
                "name": "Ubuntu",
                "pretty-name": "Ubuntu 22.04.4 LTS",
                "version": "22.04.4 LTS (Jammy Jellyfish)",
                "version-id": "22.04",
                "kernel-release": "5.15.0-105-generic",
                "kernel-version": "#115-Ubuntu SMP",
                "machine": "x86_64"
            }),
        ),
        (
            "guest-get-fsinfo".to_owned(),
            json!([{
                "name": "vda1",
                "mountpoint": "/",
                "type": "ext4",
                "used-bytes": 2147483648u64,
                "total-bytes": 10737418240u64
            }]),
        ),
        (
            "guest-network-get-interfaces".to_owned(),
            json!([{
                "name": "eth0",
                "hardware-address": "52:54:00:12:34:56",
                "ip-addresses": [{
                    "ip-address-type": "ipv4",
                    "ip-address": "10.0.0.15",
                    "prefix": 24
                }]
            }]),
        ),
        (
            "guest-get-users".to_owned(),
            json!([{ "user": "root", "login-time": 1700000000.5 }]),
        ),
        (
            "guest-get-load".to_owned(),
            json!({ "load1": 0.25, "load5": 0.1, "load15": 0.05 }),
        ),
        ("guest-get-host-name".to_owned(), json!({ "host-name": "vm0" })),
        (
            "guest-get-timezone".to_owned(),
            json!({ "zone": "UTC", "offset": 0 }),
        ),
    ])
}

/// Connects to a [`SimulatedDaemon`].
#[derive(Clone)]
pub struct SimConnector(Arc<SimulatedDaemon>);

#[async_trait]
impl Connector for SimConnector {
    async fn connect(&self) -> Result<DaemonLink, DaemonError> {
        let mut state = self.0.state.lock().unwrap();
        if state.refuse_connections {
            return Err(DaemonError::NotConnected);
        }

        let session = state.next_session;
        state.next_session += 1;
        let (tx, rx) = mpsc::unbounded_channel();
        state.active_session = Some((session, tx));
        info!(self.0.log, "simulated daemon accepted connection";
              "session" => session);

        Ok(DaemonLink {
            daemon: Arc::new(SimSession { sim: self.0.clone(), session }),
            events: rx,
        })
    }
}

/// One connection's view of the simulated daemon.
struct SimSession {
    sim: Arc<SimulatedDaemon>,
    session: u64,
}

#[async_trait]
impl Daemon for SimSession {
    async fn lookup_by_name(
        &self,
        name: &str,
    ) -> Result<DomainInfo, DaemonError> {
        let mut state = self.sim.state.lock().unwrap();
        let lost = self.sim.begin(
            &mut state,
            self.session,
            "lookup_by_name",
            Some(name),
        )?;
        let dom = state.domain_mut(name)?;
        let info = DomainInfo {
            uuid: dom.uuid,
            state: dom.state,
            definition: dom.definition.clone(),
        };
        finish(info, lost)
    }

    async fn define(
        &self,
        name: &str,
        definition: &str,
    ) -> Result<Uuid, DaemonError> {
        let mut state = self.sim.state.lock().unwrap();
        let lost =
            self.sim.begin(&mut state, self.session, "define", Some(name))?;
        if !definition.starts_with("<domain") {
            return Err(DaemonError::InvalidDefinition(
                "document is not a domain definition".to_owned(),
            ));
        }

        let uuid = match state.domains.get_mut(name) {
            Some(dom) => {
                dom.definition = definition.to_owned();
                dom.uuid
            }
            None => {
                let uuid = uuid_from_definition(definition);
                state.domains.insert(
                    name.to_owned(),
                    SimDomain {
                        uuid,
                        state: RawDomainState::Shutoff(ShutoffReason::Unknown),
                        definition: definition.to_owned(),
                        job: None,
                        agent_connected: false,
                    },
                );
                uuid
            }
        };
        state.emit(name, DomainEventKind::Defined);
        finish(uuid, lost)
    }

    async fn undefine(&self, name: &str) -> Result<(), DaemonError> {
        let mut state = self.sim.state.lock().unwrap();
        let lost =
            self.sim.begin(&mut state, self.session, "undefine", Some(name))?;
        if state.domain_mut(name)?.is_active() {
            return Err(DaemonError::OperationInvalid(
                "domain is still active".to_owned(),
            ));
        }
        state.domains.remove(name);
        state.emit(name, DomainEventKind::Undefined);
        finish((), lost)
    }

    async fn start(&self, name: &str) -> Result<(), DaemonError> {
        let mut state = self.sim.state.lock().unwrap();
        let lost =
            self.sim.begin(&mut state, self.session, "start", Some(name))?;
        let agent_present = state.agent.present;
        let dom = state.domain_mut(name)?;
        if dom.is_active() {
            return Err(DaemonError::OperationInvalid(
                "domain is already active".to_owned(),
            ));
        }
        dom.state = RawDomainState::Running;
        dom.agent_connected = agent_present;
        state.emit(name, DomainEventKind::Started);
        if agent_present {
            state.emit(
                name,
                DomainEventKind::AgentLifecycle { connected: true },
            );
        }
        finish((), lost)
    }

    async fn pause(&self, name: &str) -> Result<(), DaemonError> {
        let mut state = self.sim.state.lock().unwrap();
        let lost =
            self.sim.begin(&mut state, self.session, "pause", Some(name))?;
        let dom = state.domain_mut(name)?;
        if dom.state != RawDomainState::Running {
            return Err(DaemonError::OperationInvalid(
                "domain is not running".to_owned(),
            ));
        }
        dom.state = RawDomainState::Paused(PauseReason::User);
        state.emit(name, DomainEventKind::Suspended(PauseReason::User));
        finish((), lost)
    }

    async fn resume(&self, name: &str) -> Result<(), DaemonError> {
        let mut state = self.sim.state.lock().unwrap();
        let lost =
            self.sim.begin(&mut state, self.session, "resume", Some(name))?;
        let dom = state.domain_mut(name)?;
        if !matches!(dom.state, RawDomainState::Paused(_)) {
            return Err(DaemonError::OperationInvalid(
                "domain is not paused".to_owned(),
            ));
        }
        dom.state = RawDomainState::Running;
        state.emit(name, DomainEventKind::Resumed);
        finish((), lost)
    }

    async fn shutdown(&self, name: &str) -> Result<(), DaemonError> {
        let mut state = self.sim.state.lock().unwrap();
        let lost =
            self.sim.begin(&mut state, self.session, "shutdown", Some(name))?;
        let honors = state.guest_honors_shutdown;
        let dom = state.domain_mut(name)?;
        if !dom.is_active() {
            return Err(DaemonError::OperationInvalid(
                "domain is not running".to_owned(),
            ));
        }
        if honors {
            dom.state = RawDomainState::Shutoff(ShutoffReason::Shutdown);
            dom.agent_connected = false;
            state.emit(name, DomainEventKind::ShuttingDown);
            state.emit(name, DomainEventKind::Stopped(ShutoffReason::Shutdown));
        }
        finish((), lost)
    }

    async fn destroy(&self, name: &str) -> Result<(), DaemonError> {
        let mut state = self.sim.state.lock().unwrap();
        let lost =
            self.sim.begin(&mut state, self.session, "destroy", Some(name))?;
        let dom = state.domain_mut(name)?;
        if !dom.is_active() {
            return Err(DaemonError::OperationInvalid(
                "domain is not running".to_owned(),
            ));
        }
        dom.state = RawDomainState::Shutoff(ShutoffReason::Destroyed);
        dom.agent_connected = false;
        dom.job = None;
        state.emit(name, DomainEventKind::Stopped(ShutoffReason::Destroyed));
        finish((), lost)
    }

    async fn live_update(
        &self,
        name: &str,
        definition: &str,
        changes: &[DefinitionChange],
    ) -> Result<(), DaemonError> {
        let mut state = self.sim.state.lock().unwrap();
        let lost = self.sim.begin(
            &mut state,
            self.session,
            "live_update",
            Some(name),
        )?;
        let unsupported: Vec<&DefinitionChange> = changes
            .iter()
            .filter(|c| !(state.live_update_supported)(c))
            .collect();
        if !unsupported.is_empty() {
            return Err(DaemonError::Unsupported(format!(
                "cannot change {:?} while running",
                unsupported
            )));
        }

        let dom = state.domain_mut(name)?;
        if !dom.is_active() {
            return Err(DaemonError::OperationInvalid(
                "domain is not running".to_owned(),
            ));
        }
        dom.definition = definition.to_owned();
        finish((), lost)
    }

    async fn migrate_start(
        &self,
        name: &str,
        target: &MigrationTarget,
        _policy: &MigrationPolicy,
    ) -> Result<(), DaemonError> {
        let mut state = self.sim.state.lock().unwrap();
        let lost = self.sim.begin(
            &mut state,
            self.session,
            "migrate_start",
            Some(name),
        )?;
        let dom = state.domain_mut(name)?;
        if dom.state != RawDomainState::Running {
            return Err(DaemonError::OperationInvalid(
                "domain is not running".to_owned(),
            ));
        }
        if dom.job.is_some() {
            return Err(DaemonError::OperationInvalid(
                "domain already has an active job".to_owned(),
            ));
        }
        dom.job = Some(JobInfo {
            active: true,
            data_total: 1 << 30,
            data_remaining: 1 << 30,
            ..Default::default()
        });
        info!(self.sim.log, "simulated migration started";
              "domain" => name, "target" => &target.uri);
        finish((), lost)
    }

    async fn migrate_abort(&self, name: &str) -> Result<(), DaemonError> {
        let mut state = self.sim.state.lock().unwrap();
        let lost = self.sim.begin(
            &mut state,
            self.session,
            "migrate_abort",
            Some(name),
        )?;
        let dom = state.domain_mut(name)?;
        if dom.job.take().is_none() {
            return Err(DaemonError::OperationInvalid(
                "domain has no active job".to_owned(),
            ));
        }
        state.emit(name, DomainEventKind::JobCancelled);
        finish((), lost)
    }

    async fn job_info(&self, name: &str) -> Result<JobInfo, DaemonError> {
        let mut state = self.sim.state.lock().unwrap();
        let lost =
            self.sim.begin(&mut state, self.session, "job_info", Some(name))?;
        let info = state.domain_mut(name)?.job.unwrap_or_default();
        finish(info, lost)
    }

    async fn guest_agent_command(
        &self,
        name: &str,
        command: &str,
        _arguments: serde_json::Value,
        timeout: Duration,
    ) -> Result<serde_json::Value, DaemonError> {
        let reply = {
            let mut state = self.sim.state.lock().unwrap();
            let lost = self.sim.begin(
                &mut state,
                self.session,
                "guest_agent_command",
                Some(name),
            )?;
            let dom = state.domain_mut(name)?;
            if dom.state != RawDomainState::Running || !dom.agent_connected {
                return Err(DaemonError::AgentUnavailable);
            }

            let agent = &mut state.agent;
            *agent.counts.entry(command.to_owned()).or_default() += 1;

            if agent.hanging.contains(command) {
                None
            } else if command == "guest-info" {
                let supported: Vec<_> = agent
                    .supported
                    .iter()
                    .map(|c| json!({ "name": c, "enabled": true }))
                    .collect();
                Some(finish(
                    json!({
                        "version": agent.version,
                        "supported_commands": supported,
                    }),
                    lost,
                ))
            } else if !agent.supported.contains(command) {
                Some(Err(DaemonError::AgentCommandFailed {
                    command: command.to_owned(),
                    message: format!("The command {} has not been found", command),
                }))
            } else if agent.failing.contains(command) {
                Some(Err(DaemonError::AgentCommandFailed {
                    command: command.to_owned(),
                    message: "Guest agent command failed".to_owned(),
                }))
            } else {
                let value = agent
                    .responses
                    .get(command)
                    .cloned()
                    .unwrap_or(serde_json::Value::Null);
                Some(finish(value, lost))
            }
        };

        match reply {
            Some(result) => result,
            None => {
                tokio::time::sleep(timeout).await;
                Err(DaemonError::Timeout)
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn logger() -> Logger {
        Logger::root(slog::Discard, slog::o!())
    }

    const DEF: &str =
        "<domain type='kvm'>\n  <uuid>7b4d2c8e-1f1a-4c1e-9d3f-0a2b3c4d5e6f</uuid>\n</domain>";

    #[tokio::test]
    async fn lifecycle_emits_events() {
        let sim = SimulatedDaemon::new(logger());
        let DaemonLink { daemon, mut events } =
            sim.connector().connect().await.unwrap();

        let uuid = daemon.define("vm0", DEF).await.unwrap();
        assert_eq!(uuid.to_string(), "7b4d2c8e-1f1a-4c1e-9d3f-0a2b3c4d5e6f");
        daemon.start("vm0").await.unwrap();
        daemon.pause("vm0").await.unwrap();

        let kinds: Vec<_> = std::iter::from_fn(|| events.try_recv().ok())
            .map(|e| e.kind)
            .collect();
        assert_eq!(
            kinds,
            vec![
                DomainEventKind::Defined,
                DomainEventKind::Started,
                DomainEventKind::AgentLifecycle { connected: true },
                DomainEventKind::Suspended(PauseReason::User),
            ]
        );
        assert_eq!(
            sim.domain_state("vm0"),
            Some(RawDomainState::Paused(PauseReason::User))
        );
        assert_eq!(sim.mutating_calls().len(), 3);
    }

    #[tokio::test]
    async fn disconnect_invalidates_session() {
        let sim = SimulatedDaemon::new(logger());
        let DaemonLink { daemon, mut events } =
            sim.connector().connect().await.unwrap();
        sim.disconnect();

        assert_eq!(events.recv().await, None);
        assert_eq!(
            daemon.lookup_by_name("vm0").await,
            Err(DaemonError::NotConnected)
        );

        sim.set_refuse_connections(true);
        assert!(sim.connector().connect().await.is_err());
        sim.set_refuse_connections(false);
        let link = sim.connector().connect().await.unwrap();
        assert_eq!(
            link.daemon.lookup_by_name("vm0").await,
            Err(DaemonError::NoSuchDomain("vm0".to_owned()))
        );
    }

    #[tokio::test]
    async fn lost_reply_still_acts() {
        let sim = SimulatedDaemon::new(logger());
        let link = sim.connector().connect().await.unwrap();
        link.daemon.define("vm0", DEF).await.unwrap();

        sim.inject_fault("start", Fault::LoseReply(DaemonError::Timeout));
        assert_eq!(link.daemon.start("vm0").await, Err(DaemonError::Timeout));
        assert_eq!(sim.domain_state("vm0"), Some(RawDomainState::Running));

        sim.inject_fault(
            "pause",
            Fault::Reject(DaemonError::Disconnected("reset".to_owned())),
        );
        assert!(link.daemon.pause("vm0").await.is_err());
        assert_eq!(sim.domain_state("vm0"), Some(RawDomainState::Running));
    }

    #[tokio::test]
    async fn guest_agent_capabilities() {
        let sim = SimulatedDaemon::new(logger());
        let link = sim.connector().connect().await.unwrap();
        link.daemon.define("vm0", DEF).await.unwrap();
        link.daemon.start("vm0").await.unwrap();
        sim.set_agent_supported(&["guest-info", "guest-get-osinfo"]);

        let timeout = Duration::from_millis(50);
        let info = link
            .daemon
            .guest_agent_command("vm0", "guest-info", json!({}), timeout)
            .await
            .unwrap();
        assert_eq!(info["supported_commands"].as_array().unwrap().len(), 2);

        let err = link
            .daemon
            .guest_agent_command("vm0", "guest-get-fsinfo", json!({}), timeout)
            .await
            .unwrap_err();
        assert!(matches!(err, DaemonError::AgentCommandFailed { .. }));

        sim.set_agent_hang("guest-get-osinfo", true);
        assert_eq!(
            link.daemon
                .guest_agent_command("vm0", "guest-get-osinfo", json!({}), timeout)
                .await,
            Err(DaemonError::Timeout)
        );
        assert_eq!(sim.agent_command_count("guest-get-osinfo"), 1);
    }
}
