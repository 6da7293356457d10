//! Session reconciliation: one decision step per account per tick
//!
//! The only ground truth is the platform's cumulative "minutes played"
//! counter, which moves in whole minutes and can lag behind reality. Each
//! step compares the account's fresh `ActivitySummary` with its open
//! `ActiveSession` rows and either opens, keeps, or closes them:
//!
//! | summary                    | open rows          | action                         |
//! |----------------------------|--------------------|--------------------------------|
//! | not public                 | any                | release all at baseline, now   |
//! | not playing                | none               | nothing                        |
//! | not playing                | some               | close each (or defer if the    |
//! |                            |                    | counter has not moved yet)     |
//! | playing T                  | row for T          | nothing                        |
//! | playing T                  | no row for T       | open T with counter baseline   |
//!
//! An open row is its own retry state: a deferred close is simply looked at
//! again on the next tick.
//!
//! Drift: when the wall-clock duration exceeds the counter delta by more than
//! the threshold, the account was playing before we saw it (or polling was
//! interrupted), so the end boundary is taken from the counter instead.

use chrono::{DateTime, Duration, DurationRound, Utc};
use playtime_core::{
    AccountActivitySource, AccountId, ActiveSession, ActivitySummary, OwnedGame, Session,
    SessionStore, SourceError, StoreError, TitleId, TitleInfo,
};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

pub const DEFAULT_DRIFT_THRESHOLD_MINUTES: i64 = 3;

// ============================================================================
// PUBLIC API
// ============================================================================

/// What a single account update did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// Not playing and nothing open.
    Idle,
    /// Still playing a title that already has an open row.
    Continued { title: TitleId },
    Opened { session: ActiveSession },
    Closed {
        closed: Vec<Session>,
        deferred: Vec<TitleId>,
    },
    /// Profile is not public; every open row was released without a counter read.
    Released { sessions: Vec<Session> },
}

#[derive(Error, Debug)]
pub enum ReconcileError {
    #[error("activity source error: {0}")]
    Source(#[from] SourceError),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("summary for account {found} returned when {expected} was requested")]
    AccountMismatch { expected: AccountId, found: AccountId },

    #[error("account update cancelled")]
    Cancelled,
}

/// Verdict for one open session when the account is no longer in game.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseDecision {
    /// Counter has not caught up yet; keep the row open.
    Defer,
    Close {
        ended_at: DateTime<Utc>,
        playtime_at_end: u32,
        /// `ended_at` was derived from the counter instead of `now`.
        corrected: bool,
    },
}

/// Whole minutes, wall clock, sign dropped. Half a minute rounds up.
pub fn round_minutes(elapsed: Duration) -> i64 {
    (elapsed.num_seconds().abs() + 30) / 60
}

pub fn truncate_to_minute(at: DateTime<Utc>) -> DateTime<Utc> {
    at.duration_trunc(Duration::minutes(1)).unwrap_or(at)
}

/// Decide how to close `session` given the counter now reads `owned_playtime`.
pub fn close_decision(
    session: &ActiveSession,
    owned_playtime: u32,
    now: DateTime<Utc>,
    drift_threshold_minutes: i64,
) -> CloseDecision {
    let steam_delta = i64::from(owned_playtime) - i64::from(session.baseline_playtime);
    if steam_delta == 0 {
        return CloseDecision::Defer;
    }

    let server_elapsed = round_minutes(now - session.started_at);

    if server_elapsed - steam_delta > drift_threshold_minutes {
        // A regressed counter (negative delta) pins the end to the start.
        CloseDecision::Close {
            ended_at: session.started_at + Duration::minutes(steam_delta.max(0)),
            playtime_at_end: owned_playtime,
            corrected: true,
        }
    } else {
        CloseDecision::Close {
            ended_at: now.max(session.started_at),
            playtime_at_end: owned_playtime,
            corrected: false,
        }
    }
}

/// Close at `now` without a counter reading; duration is whatever was counted.
pub fn release_decision(session: &ActiveSession, now: DateTime<Utc>) -> CloseDecision {
    CloseDecision::Close {
        ended_at: now.max(session.started_at),
        playtime_at_end: session.baseline_playtime,
        corrected: false,
    }
}

/// Per-account state machine. Cheap to clone; one clone per spawned task.
#[derive(Clone)]
pub struct Reconciler {
    store: Arc<dyn SessionStore>,
    source: Arc<dyn AccountActivitySource>,
    drift_threshold_minutes: i64,
}

impl Reconciler {
    pub fn new(
        store: Arc<dyn SessionStore>,
        source: Arc<dyn AccountActivitySource>,
        drift_threshold_minutes: i64,
    ) -> Self {
        Self {
            store,
            source,
            drift_threshold_minutes,
        }
    }

    /// Run one decision step for `account`.
    ///
    /// Source calls are abandoned when `cancel` fires; store writes that
    /// have started always run to completion.
    pub async fn reconcile_account(
        &self,
        account: AccountId,
        summary: &ActivitySummary,
        now: DateTime<Utc>,
        cancel: &CancellationToken,
    ) -> Result<ReconcileOutcome, ReconcileError> {
        if summary.account != account {
            return Err(ReconcileError::AccountMismatch {
                expected: account,
                found: summary.account,
            });
        }

        let active = self.store.list_active(account).await?;

        if !summary.visibility.is_public() {
            tracing::debug!(account = %account, visibility = ?summary.visibility, "Profile is not public");
            return self.release_all(account, active, now).await;
        }

        if !summary.is_playing() {
            if active.is_empty() {
                tracing::debug!(account = %account, "Not in game, nothing to update");
                return Ok(ReconcileOutcome::Idle);
            }
            return self.close_all(account, active, now, cancel).await;
        }

        let title = summary.current_title;
        if let Some(open) = active.iter().find(|s| s.title == title) {
            tracing::debug!(
                account = %account,
                title = %title,
                since = %open.started_at,
                "Already playing"
            );
            return Ok(ReconcileOutcome::Continued { title });
        }

        self.open(account, title, now, cancel).await
    }

    async fn release_all(
        &self,
        account: AccountId,
        active: Vec<ActiveSession>,
        now: DateTime<Utc>,
    ) -> Result<ReconcileOutcome, ReconcileError> {
        tracing::debug!(account = %account, open = active.len(), "Releasing open sessions");
        let sessions = release_sessions(self.store.as_ref(), &active, now).await?;
        Ok(ReconcileOutcome::Released { sessions })
    }

    async fn close_all(
        &self,
        account: AccountId,
        active: Vec<ActiveSession>,
        now: DateTime<Utc>,
        cancel: &CancellationToken,
    ) -> Result<ReconcileOutcome, ReconcileError> {
        let titles: Vec<TitleId> = active.iter().map(|s| s.title).collect();

        let owned = match self.owned_playtime(account, &titles, cancel).await {
            Ok(games) => games,
            Err(ReconcileError::Source(SourceError::EmptyResult)) => {
                tracing::warn!(
                    account = %account,
                    titles = ?titles,
                    "Account owns none of the open titles, closing at baseline"
                );
                HashMap::new()
            }
            Err(e) => return Err(e),
        };

        let mut closed = Vec::new();
        let mut deferred = Vec::new();

        for open in active {
            let playtime = owned.get(&open.title).map(|g| g.playtime_forever);
            let decision = match playtime {
                Some(minutes) => {
                    close_decision(&open, minutes, now, self.drift_threshold_minutes)
                }
                None => release_decision(&open, now),
            };

            let CloseDecision::Close {
                ended_at,
                playtime_at_end,
                corrected,
            } = decision
            else {
                tracing::debug!(
                    account = %account,
                    title = %open.title,
                    "No playtime difference yet, deferring close to next tick"
                );
                deferred.push(open.title);
                continue;
            };

            if corrected {
                tracing::warn!(
                    account = %account,
                    title = %open.title,
                    baseline = open.baseline_playtime,
                    playtime = ?playtime,
                    server_minutes = round_minutes(now - open.started_at),
                    "Significant playtime drift, using platform counter for session end"
                );
            }

            if let Some(session) =
                finish(self.store.as_ref(), &open, ended_at, playtime_at_end).await?
            {
                tracing::info!(
                    account = %account,
                    title = %session.title,
                    minutes = session.duration_minutes(),
                    "Closed session"
                );
                closed.push(session);
            }
        }

        Ok(ReconcileOutcome::Closed { closed, deferred })
    }

    async fn open(
        &self,
        account: AccountId,
        title: TitleId,
        now: DateTime<Utc>,
        cancel: &CancellationToken,
    ) -> Result<ReconcileOutcome, ReconcileError> {
        let game: Option<OwnedGame> = match self.owned_playtime(account, &[title], cancel).await {
            Ok(mut games) => games.remove(&title),
            Err(ReconcileError::Source(SourceError::EmptyResult)) => None,
            Err(e) => return Err(e),
        };

        let baseline_playtime = match &game {
            Some(g) => g.playtime_forever,
            None => {
                tracing::warn!(
                    account = %account,
                    title = %title,
                    "Title not among owned games, baseline playtime will be 0"
                );
                0
            }
        };

        if let Some(g) = game.filter(|g| !g.name.is_empty()) {
            let info = TitleInfo {
                title,
                name: g.name,
            };
            if let Err(e) = self.store.upsert_title(&info).await {
                tracing::warn!(title = %title, error = %e, "Failed to cache title metadata");
            }
        }

        let session = ActiveSession {
            account,
            title,
            started_at: truncate_to_minute(now),
            baseline_playtime,
        };

        match self.store.open_session(&session).await {
            Ok(()) => {
                tracing::info!(
                    account = %account,
                    title = %title,
                    baseline = baseline_playtime,
                    "Started new session"
                );
                Ok(ReconcileOutcome::Opened { session })
            }
            Err(StoreError::Conflict { .. }) => {
                tracing::warn!(
                    account = %account,
                    title = %title,
                    "Session was opened by an overlapping update"
                );
                Ok(ReconcileOutcome::Continued { title })
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn owned_playtime(
        &self,
        account: AccountId,
        titles: &[TitleId],
        cancel: &CancellationToken,
    ) -> Result<HashMap<TitleId, OwnedGame>, ReconcileError> {
        tokio::select! {
            _ = cancel.cancelled() => Err(ReconcileError::Cancelled),
            result = self.source.owned_playtime(account, titles) => Ok(result?),
        }
    }
}

/// Close every session in `active` at its baseline, ending at `now`.
///
/// Used when the counter cannot be read: a non-public profile, or an
/// account that is no longer tracked. Stops at the first store error; rows
/// not yet finished stay open.
pub async fn release_sessions(
    store: &dyn SessionStore,
    active: &[ActiveSession],
    now: DateTime<Utc>,
) -> Result<Vec<Session>, StoreError> {
    let mut sessions = Vec::with_capacity(active.len());
    for open in active {
        let CloseDecision::Close {
            ended_at,
            playtime_at_end,
            ..
        } = release_decision(open, now)
        else {
            continue;
        };
        if let Some(session) = finish(store, open, ended_at, playtime_at_end).await? {
            tracing::info!(
                account = %session.account,
                title = %session.title,
                minutes = session.duration_minutes(),
                "Released session at baseline"
            );
            sessions.push(session);
        }
    }
    Ok(sessions)
}

/// Swap `open` for its finished record in one store operation.
/// `None` when an overlapping update already finished it.
async fn finish(
    store: &dyn SessionStore,
    open: &ActiveSession,
    ended_at: DateTime<Utc>,
    playtime_at_end: u32,
) -> Result<Option<Session>, StoreError> {
    let session = Session {
        account: open.account,
        title: open.title,
        started_at: open.started_at,
        ended_at: ended_at.max(open.started_at),
        playtime_forever_at_end: playtime_at_end,
    };

    match store.finish_session(&session).await {
        Ok(true) => Ok(Some(session)),
        Ok(false) => {
            tracing::warn!(
                account = %open.account,
                title = %open.title,
                "Active session already closed by an overlapping update"
            );
            Ok(None)
        }
        Err(e) => {
            tracing::error!(
                account = %open.account,
                title = %open.title,
                error = %e,
                "Failed to finish session, it stays open for the next tick"
            );
            Err(e)
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================
