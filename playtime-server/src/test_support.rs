//! In-memory collaborators for unit tests (no DB, no HTTP).

use async_trait::async_trait;
use chrono::Utc;
use playtime_core::{
    AccountActivitySource, AccountId, ActiveSession, ActivitySummary, OwnedGame, Session,
    SessionStore, SourceError, StoreError, TitleId, TitleInfo, TrackedAccount, Visibility,
};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

// ----------------------------------------------------------------------------
// MemoryStore
// ----------------------------------------------------------------------------

#[derive(Default)]
struct StoreState {
    accounts: Vec<TrackedAccount>,
    active: HashMap<(AccountId, TitleId), ActiveSession>,
    finished: Vec<Session>,
    titles: HashMap<TitleId, TitleInfo>,
}

#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<StoreState>,
    write_delay: Option<Duration>,
    fail_reads: AtomicBool,
    fail_next_finish: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every write sleeps first, so a write can be caught in flight.
    pub fn with_write_delay(delay: Duration) -> Self {
        Self {
            write_delay: Some(delay),
            ..Self::default()
        }
    }

    pub fn fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    /// The next `finish_session` fails before touching any state.
    pub fn fail_next_finish(&self) {
        self.fail_next_finish.store(true, Ordering::SeqCst);
    }

    pub fn seed_active(&self, session: ActiveSession) {
        let mut state = self.state.lock().unwrap();
        state
            .active
            .insert((session.account, session.title), session);
    }

    pub fn active_count(&self) -> usize {
        self.state.lock().unwrap().active.len()
    }

    pub fn finished(&self) -> Vec<Session> {
        self.state.lock().unwrap().finished.clone()
    }

    pub fn cached_title(&self, title: TitleId) -> Option<TitleInfo> {
        self.state.lock().unwrap().titles.get(&title).cloned()
    }

    async fn delay_write(&self) {
        if let Some(delay) = self.write_delay {
            tokio::time::sleep(delay).await;
        }
    }

    fn check_read(&self) -> Result<(), StoreError> {
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(StoreError::Database(sqlx::Error::PoolTimedOut));
        }
        Ok(())
    }
}

#[async_trait]
impl SessionStore for MemoryStore {
    async fn tracked_accounts(&self) -> Result<Vec<AccountId>, StoreError> {
        self.check_read()?;
        Ok(self
            .state
            .lock()
            .unwrap()
            .accounts
            .iter()
            .map(|a| a.account)
            .collect())
    }

    async fn add_account(
        &self,
        account: AccountId,
        username: Option<&str>,
    ) -> Result<bool, StoreError> {
        self.delay_write().await;
        let mut state = self.state.lock().unwrap();
        if state.accounts.iter().any(|a| a.account == account) {
            return Ok(false);
        }
        state.accounts.push(TrackedAccount {
            account,
            username: username.map(str::to_string),
            added_at: Utc::now(),
        });
        Ok(true)
    }

    async fn remove_account(&self, account: AccountId) -> Result<bool, StoreError> {
        self.delay_write().await;
        let mut state = self.state.lock().unwrap();
        let before = state.accounts.len();
        state.accounts.retain(|a| a.account != account);
        Ok(state.accounts.len() != before)
    }

    async fn list_accounts(&self) -> Result<Vec<TrackedAccount>, StoreError> {
        self.check_read()?;
        Ok(self.state.lock().unwrap().accounts.clone())
    }

    async fn open_session(&self, session: &ActiveSession) -> Result<(), StoreError> {
        self.delay_write().await;
        let mut state = self.state.lock().unwrap();
        let key = (session.account, session.title);
        if state.active.contains_key(&key) {
            return Err(StoreError::Conflict {
                account: session.account,
                title: session.title,
            });
        }
        state.active.insert(key, session.clone());
        Ok(())
    }

    async fn close_session(
        &self,
        account: AccountId,
        title: TitleId,
    ) -> Result<Option<ActiveSession>, StoreError> {
        self.delay_write().await;
        Ok(self.state.lock().unwrap().active.remove(&(account, title)))
    }

    async fn list_active(&self, account: AccountId) -> Result<Vec<ActiveSession>, StoreError> {
        self.check_read()?;
        let state = self.state.lock().unwrap();
        let mut sessions: Vec<ActiveSession> = state
            .active
            .values()
            .filter(|s| s.account == account)
            .cloned()
            .collect();
        sessions.sort_by_key(|s| (s.started_at, s.title));
        Ok(sessions)
    }

    async fn append_finished(&self, session: &Session) -> Result<(), StoreError> {
        self.delay_write().await;
        self.state.lock().unwrap().finished.push(session.clone());
        Ok(())
    }

    async fn finish_session(&self, finished: &Session) -> Result<bool, StoreError> {
        self.delay_write().await;
        if self.fail_next_finish.swap(false, Ordering::SeqCst) {
            return Err(StoreError::Database(sqlx::Error::PoolTimedOut));
        }
        let mut state = self.state.lock().unwrap();
        let key = (finished.account, finished.title);
        match state.active.get(&key) {
            Some(open) if open.started_at == finished.started_at => {
                state.active.remove(&key);
                state.finished.push(finished.clone());
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn finished_sessions(&self, account: AccountId) -> Result<Vec<Session>, StoreError> {
        self.check_read()?;
        let mut sessions: Vec<Session> = self
            .state
            .lock()
            .unwrap()
            .finished
            .iter()
            .filter(|s| s.account == account)
            .cloned()
            .collect();
        sessions.sort_by_key(|s| s.started_at);
        Ok(sessions)
    }

    async fn upsert_title(&self, info: &TitleInfo) -> Result<(), StoreError> {
        self.delay_write().await;
        self.state
            .lock()
            .unwrap()
            .titles
            .insert(info.title, info.clone());
        Ok(())
    }

    async fn title_info(&self, title: TitleId) -> Result<Option<TitleInfo>, StoreError> {
        self.check_read()?;
        Ok(self.cached_title(title))
    }

    async fn ping(&self) -> Result<String, StoreError> {
        self.check_read()?;
        Ok("memory".to_string())
    }
}

// ----------------------------------------------------------------------------
// ScriptedSource
// ----------------------------------------------------------------------------

#[derive(Default)]
pub struct ScriptedSource {
    summaries: Mutex<HashMap<AccountId, ActivitySummary>>,
    owned: Mutex<HashMap<(AccountId, TitleId), OwnedGame>>,
    failing_accounts: Mutex<HashSet<AccountId>>,
    fail_summaries: AtomicBool,
    summary_calls: AtomicUsize,
    owned_calls: AtomicUsize,
    requested: Mutex<Vec<Vec<AccountId>>>,
}

impl ScriptedSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_playing(&self, account: AccountId, title: TitleId) {
        self.set_summary(account, summary(account, Visibility::Public, title));
    }

    pub fn set_idle(&self, account: AccountId) {
        self.set_summary(account, summary(account, Visibility::Public, TitleId::NONE));
    }

    /// Register `summary` under `key`, even if `summary.account` differs.
    pub fn set_summary(&self, key: AccountId, summary: ActivitySummary) {
        self.summaries.lock().unwrap().insert(key, summary);
    }

    pub fn set_playtime(&self, account: AccountId, title: TitleId, minutes: u32) {
        self.owned.lock().unwrap().insert(
            (account, title),
            OwnedGame {
                title,
                name: String::new(),
                playtime_forever: minutes,
            },
        );
    }

    pub fn set_owned_game(&self, account: AccountId, game: OwnedGame) {
        self.owned.lock().unwrap().insert((account, game.title), game);
    }

    pub fn fail_owned_for(&self, account: AccountId) {
        self.failing_accounts.lock().unwrap().insert(account);
    }

    pub fn fail_summaries(&self, fail: bool) {
        self.fail_summaries.store(fail, Ordering::SeqCst);
    }

    pub fn summary_calls(&self) -> usize {
        self.summary_calls.load(Ordering::SeqCst)
    }

    pub fn owned_calls(&self) -> usize {
        self.owned_calls.load(Ordering::SeqCst)
    }

    pub fn requested(&self) -> Vec<Vec<AccountId>> {
        self.requested.lock().unwrap().clone()
    }
}

pub fn summary(account: AccountId, visibility: Visibility, title: TitleId) -> ActivitySummary {
    ActivitySummary {
        account,
        visibility,
        current_title: title,
        persona_name: None,
    }
}

#[async_trait]
impl AccountActivitySource for ScriptedSource {
    async fn batch_summaries(
        &self,
        accounts: &[AccountId],
    ) -> Result<HashMap<AccountId, ActivitySummary>, SourceError> {
        self.summary_calls.fetch_add(1, Ordering::SeqCst);
        self.requested.lock().unwrap().push(accounts.to_vec());

        if self.fail_summaries.load(Ordering::SeqCst) {
            return Err(SourceError::Api {
                status: 503,
                message: "unavailable".to_string(),
            });
        }

        let summaries = self.summaries.lock().unwrap();
        Ok(accounts
            .iter()
            .filter_map(|a| summaries.get(a).map(|s| (*a, s.clone())))
            .collect())
    }

    async fn owned_playtime(
        &self,
        account: AccountId,
        titles: &[TitleId],
    ) -> Result<HashMap<TitleId, OwnedGame>, SourceError> {
        self.owned_calls.fetch_add(1, Ordering::SeqCst);

        if self.failing_accounts.lock().unwrap().contains(&account) {
            return Err(SourceError::Api {
                status: 500,
                message: "boom".to_string(),
            });
        }

        let owned = self.owned.lock().unwrap();
        let games: HashMap<TitleId, OwnedGame> = titles
            .iter()
            .filter_map(|t| owned.get(&(account, *t)).map(|g| (*t, g.clone())))
            .collect();

        if games.is_empty() {
            return Err(SourceError::EmptyResult);
        }
        Ok(games)
    }

    fn name(&self) -> &str {
        "scripted"
    }
}
