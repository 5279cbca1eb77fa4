// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Helper types for publishing domain states to the launcher's callers.

use domain_api_types::{DomainState, DomainStateMonitorResponse, MigrationStatus};
use slog::info;

use super::{DomainStateRx, DomainStateTx};

pub(super) enum ExternalStateUpdate {
    Domain(DomainState),
    Migration(MigrationStatus),
    Complete(DomainState, MigrationStatus),
}

pub(super) struct StatePublisher {
    tx: DomainStateTx,
    log: slog::Logger,
}

impl StatePublisher {
    pub(super) fn new(
        log: &slog::Logger,
        initial_state: DomainState,
    ) -> (Self, DomainStateRx) {
        let (tx, rx) = tokio::sync::watch::channel(DomainStateMonitorResponse {
            gen: 1,
            state: initial_state,
            migration: None,
        });
        (Self { tx, log: log.clone() }, rx)
    }

    pub(super) fn state(&self) -> DomainState {
        self.tx.borrow().state
    }

    /// Publishes `update`. Updates that change nothing are dropped so that
    /// every generation number marks a real change.
    pub(super) fn update(&mut self, update: ExternalStateUpdate) {
        let (domain_state, migration_state) = match update {
            ExternalStateUpdate::Domain(s) => (Some(s), None),
            ExternalStateUpdate::Migration(m) => (None, Some(m)),
            ExternalStateUpdate::Complete(s, m) => (Some(s), Some(m)),
        };

        let DomainStateMonitorResponse {
            state: old_state,
            migration: old_migration,
            gen: old_gen,
        } = self.tx.borrow().clone();

        let state = domain_state.unwrap_or(old_state);
        let migration = migration_state.or(old_migration.clone());
        if state == old_state && migration == old_migration {
            return;
        }

        let gen = old_gen + 1;
        info!(self.log, "publishing new domain state";
              "gen" => gen,
              "state" => %state,
              "migration" => ?migration.as_ref().map(|m| m.state));

        let _ = self.tx.send(DomainStateMonitorResponse { gen, state, migration });
    }
}

#[cfg(test)]
mod test {
    use domain_api_types::{
        MigrateRole, MigrationProgress, MigrationState,
    };
    use uuid::Uuid;

    use super::*;

    fn logger() -> slog::Logger {
        slog::Logger::root(slog::Discard, slog::o!())
    }

    #[test]
    fn generation_counts_real_changes() {
        let (mut publisher, rx) = StatePublisher::new(&logger(), DomainState::Absent);
        assert_eq!(rx.borrow().gen, 1);

        publisher.update(ExternalStateUpdate::Domain(DomainState::Absent));
        assert_eq!(rx.borrow().gen, 1);

        publisher.update(ExternalStateUpdate::Domain(DomainState::Defined));
        publisher.update(ExternalStateUpdate::Domain(DomainState::Running));
        assert_eq!(rx.borrow().gen, 3);
        assert_eq!(publisher.state(), DomainState::Running);

        let status = MigrationStatus {
            id: Uuid::new_v4(),
            role: MigrateRole::Source,
            state: MigrationState::Sync,
            target: "qemu+tls://dst/system".to_owned(),
            progress: MigrationProgress::default(),
            error: None,
        };
        publisher.update(ExternalStateUpdate::Complete(
            DomainState::Migrating(MigrateRole::Source),
            status.clone(),
        ));
        let published = rx.borrow().clone();
        assert_eq!(published.gen, 4);
        assert_eq!(published.migration, Some(status.clone()));

        // The migration record outlives the migration.
        publisher.update(ExternalStateUpdate::Domain(DomainState::Running));
        assert_eq!(rx.borrow().migration, Some(status));
    }
}
