//! Polling loop
//!
//! Fires on a fixed interval, fetches one batch of activity summaries for
//! every tracked account, and fans out one reconciliation task per account.
//! The tracked-account list is cached here and only re-read from the store
//! when a `ControlMessage::AccountListChanged` arrives on the control channel
//! (or when a previous re-read failed).

use chrono::{DateTime, Utc};
use playtime_core::config::PollerConfig;
use playtime_core::{
    AccountActivitySource, AccountId, ControlMessage, SessionStore, SourceError,
};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::{JoinError, JoinSet};
use tokio::time::{interval, Duration, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use super::reconcile::{truncate_to_minute, ReconcileError, ReconcileOutcome, Reconciler};

pub type AccountResult = (AccountId, Result<ReconcileOutcome, ReconcileError>);

/// Summary of one tick's dispatch, for logging and tests.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickReport {
    pub accounts: usize,
    pub dispatched: usize,
    pub skipped: usize,
}

pub struct Poller {
    reconciler: Reconciler,
    store: Arc<dyn SessionStore>,
    source: Arc<dyn AccountActivitySource>,
    interval: Duration,
}

impl Poller {
    pub fn new(
        store: Arc<dyn SessionStore>,
        source: Arc<dyn AccountActivitySource>,
        config: &PollerConfig,
    ) -> Self {
        Self {
            reconciler: Reconciler::new(
                store.clone(),
                source.clone(),
                config.drift_threshold_minutes,
            ),
            store,
            source,
            interval: Duration::from_secs(config.interval_seconds),
        }
    }

    pub fn with_interval(mut self, period: Duration) -> Self {
        self.interval = period;
        self
    }

    /// Run until `cancel` fires, then wait for every in-flight account task.
    pub async fn run(self, mut control: mpsc::Receiver<ControlMessage>, cancel: CancellationToken) {
        let mut ticker = interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let mut accounts: Vec<AccountId> = Vec::new();
        let mut stale = true;
        let mut control_open = true;
        let mut tasks: JoinSet<AccountResult> = JoinSet::new();

        tracing::info!(
            interval_secs = self.interval.as_secs(),
            source = self.source.name(),
            "Poller started"
        );

        loop {
            tokio::select! {
                biased;

                _ = cancel.cancelled() => break,

                _ = ticker.tick() => {
                    if stale {
                        stale = !self.refresh(&mut accounts).await;
                    }
                    if !tasks.is_empty() {
                        tracing::warn!(
                            stragglers = tasks.len(),
                            "Account updates from a previous tick are still running"
                        );
                    }

                    let now = truncate_to_minute(Utc::now());
                    match self.run_tick(&accounts, now, &mut tasks, &cancel).await {
                        Ok(report) => {
                            tracing::debug!(
                                accounts = report.accounts,
                                dispatched = report.dispatched,
                                skipped = report.skipped,
                                "Tick dispatched"
                            );
                        }
                        Err(e) => {
                            tracing::warn!(error = %e, "Failed to fetch activity summaries, skipping tick");
                        }
                    }
                }

                msg = control.recv(), if control_open => match msg {
                    Some(ControlMessage::AccountListChanged) => {
                        stale = !self.refresh(&mut accounts).await;
                    }
                    Some(ControlMessage::Unknown) => {
                        tracing::warn!("Ignoring unrecognised control message");
                    }
                    None => {
                        tracing::debug!("Control channel closed");
                        control_open = false;
                    }
                },

                Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                    log_joined(joined);
                }
            }
        }

        if !tasks.is_empty() {
            tracing::info!(in_flight = tasks.len(), "Waiting for in-flight account updates");
        }
        while let Some(joined) = tasks.join_next().await {
            log_joined(joined);
        }
        tracing::info!("Poller stopped");
    }

    /// One timer fire: batch summaries for `accounts`, then spawn one
    /// reconciliation per account into `tasks`.
    ///
    /// A summaries failure dispatches nothing. Public for unit testing.
    pub async fn run_tick(
        &self,
        accounts: &[AccountId],
        now: DateTime<Utc>,
        tasks: &mut JoinSet<AccountResult>,
        cancel: &CancellationToken,
    ) -> Result<TickReport, SourceError> {
        let mut report = TickReport {
            accounts: accounts.len(),
            ..TickReport::default()
        };
        if accounts.is_empty() {
            return Ok(report);
        }

        let mut summaries = tokio::select! {
            _ = cancel.cancelled() => return Ok(report),
            result = self.source.batch_summaries(accounts) => result?,
        };

        for &account in accounts {
            let Some(summary) = summaries.remove(&account) else {
                tracing::error!(account = %account, "No activity summary returned for account");
                report.skipped += 1;
                continue;
            };

            let reconciler = self.reconciler.clone();
            let cancel = cancel.clone();
            tasks.spawn(async move {
                let result = reconciler
                    .reconcile_account(account, &summary, now, &cancel)
                    .await;
                (account, result)
            });
            report.dispatched += 1;
        }

        Ok(report)
    }

    /// Replace the cached account list. Returns false (cache unchanged) on failure.
    async fn refresh(&self, accounts: &mut Vec<AccountId>) -> bool {
        match self.store.tracked_accounts().await {
            Ok(fresh) => {
                tracing::info!(count = fresh.len(), "Tracked accounts loaded");
                *accounts = fresh;
                true
            }
            Err(e) => {
                tracing::warn!(error = %e, "Failed to load tracked accounts, will retry next tick");
                false
            }
        }
    }
}

fn log_joined(joined: Result<AccountResult, JoinError>) {
    match joined {
        Ok((account, result)) => log_result(account, &result),
        Err(e) if e.is_panic() => {
            tracing::error!(error = %e, "Account update task panicked");
        }
        Err(e) => {
            tracing::warn!(error = %e, "Account update task aborted");
        }
    }
}

fn log_result(account: AccountId, result: &Result<ReconcileOutcome, ReconcileError>) {
    match result {
        Ok(outcome) => tracing::debug!(account = %account, outcome = ?outcome, "Account updated"),
        Err(ReconcileError::AccountMismatch { expected, found }) => tracing::error!(
            account = %account,
            expected = %expected,
            found = %found,
            "Summary belongs to a different account, skipping"
        ),
        Err(ReconcileError::Cancelled) => {
            tracing::debug!(account = %account, "Account update cancelled")
        }
        Err(e) => tracing::warn!(
            account = %account,
            error = %e,
            "Account update failed, will retry next tick"
        ),
    }
}

// ============================================================================
// TESTS
// ============================================================================
