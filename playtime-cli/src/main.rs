//! playtime-cli: operator CLI for the playtime tracker HTTP API
//!
//! # Subcommands
//! - `status`                                  server and store health
//! - `accounts list`                           tracked accounts
//! - `accounts add <id> [--username <name>]`   start tracking
//! - `accounts remove <id>`                    stop tracking
//! - `sessions <id> [--json]`                  finished sessions
//! - `active <id> [--json]`                    open sessions
//! - `refresh`                                 ask the poller to re-read the account list

use clap::{Parser, Subcommand};
use serde::Deserialize;

const DEFAULT_SERVER: &str = "http://127.0.0.1:8767";

// ============================================================================
// CLI Definition
// ============================================================================

#[derive(Debug, Parser)]
#[command(name = "playtime-cli", version, about = "Playtime tracker operator CLI")]
struct Cli {
    /// Playtime HTTP server URL (overrides PLAYTIME_HTTP_URL env var)
    #[arg(long, env = "PLAYTIME_HTTP_URL", default_value = DEFAULT_SERVER)]
    server: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Show server status
    Status,

    /// Manage tracked accounts
    Accounts {
        #[command(subcommand)]
        action: AccountAction,
    },

    /// List finished sessions for an account
    Sessions {
        account_id: String,
        #[arg(long)]
        json: bool,
    },

    /// List open sessions for an account
    Active {
        account_id: String,
        #[arg(long)]
        json: bool,
    },

    /// Ask the poller to reload the tracked-account list
    Refresh,
}

#[derive(Debug, Subcommand)]
enum AccountAction {
    List,
    Add {
        account_id: String,
        #[arg(long)]
        username: Option<String>,
    },
    Remove {
        account_id: String,
    },
}

// ============================================================================
// API Response Types
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct TrackedAccount {
    pub account: String,
    pub username: Option<String>,
    pub added_at: String,
}

#[derive(Debug, Deserialize)]
pub struct AccountsResponse {
    pub accounts: Vec<TrackedAccount>,
    pub count: usize,
}

#[derive(Debug, Deserialize)]
pub struct SessionRecord {
    pub title: u32,
    pub started_at: String,
    pub ended_at: String,
    pub playtime_forever_at_end: u32,
}

#[derive(Debug, Deserialize)]
pub struct SessionsResponse {
    pub account_id: String,
    pub sessions: Vec<SessionRecord>,
    pub count: usize,
    pub total_minutes: i64,
}

#[derive(Debug, Deserialize)]
pub struct ActiveRecord {
    pub title: u32,
    pub started_at: String,
    pub baseline_playtime: u32,
}

#[derive(Debug, Deserialize)]
pub struct ActiveResponse {
    pub account_id: String,
    pub active: Vec<ActiveRecord>,
    pub count: usize,
}

// ============================================================================
// Formatting
// ============================================================================

/// `95` -> `1h 35m`, `7` -> `7m`.
pub fn format_minutes(minutes: i64) -> String {
    let minutes = minutes.max(0);
    if minutes >= 60 {
        format!("{}h {:02}m", minutes / 60, minutes % 60)
    } else {
        format!("{}m", minutes)
    }
}

pub fn render_accounts(resp: &AccountsResponse) -> Vec<String> {
    if resp.accounts.is_empty() {
        return vec!["No tracked accounts".to_string()];
    }
    resp.accounts
        .iter()
        .map(|a| {
            format!(
                "{:<20} {:<24} since {}",
                a.account,
                a.username.as_deref().unwrap_or("-"),
                a.added_at
            )
        })
        .collect()
}

pub fn render_sessions(resp: &SessionsResponse) -> Vec<String> {
    let mut lines: Vec<String> = resp
        .sessions
        .iter()
        .map(|s| {
            format!(
                "app {:<10} {} -> {}  (counter {})",
                s.title, s.started_at, s.ended_at, s.playtime_forever_at_end
            )
        })
        .collect();
    lines.push(format!(
        "{} session(s) for {}, {} total",
        resp.count,
        resp.account_id,
        format_minutes(resp.total_minutes)
    ));
    lines
}

pub fn render_active(resp: &ActiveResponse) -> Vec<String> {
    if resp.active.is_empty() {
        return vec![format!("{} is not in a tracked session", resp.account_id)];
    }
    resp.active
        .iter()
        .map(|s| {
            format!(
                "app {:<10} since {}  (baseline {})",
                s.title, s.started_at, s.baseline_playtime
            )
        })
        .collect()
}

// ============================================================================
// HTTP Client Calls
// ============================================================================

struct Api {
    client: reqwest::blocking::Client,
    server: String,
}

impl Api {
    fn new(server: &str) -> anyhow::Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(std::time::Duration::from_secs(10))
            .build()?;
        Ok(Self {
            client,
            server: server.trim_end_matches('/').to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.server, path)
    }

    fn send(&self, req: reqwest::blocking::RequestBuilder) -> anyhow::Result<serde_json::Value> {
        let resp = req
            .send()
            .map_err(|e| anyhow::anyhow!("cannot reach {}: {}", self.server, e))?;
        let status = resp.status();
        let body: serde_json::Value = resp.json().unwrap_or_default();
        if !status.is_success() {
            let msg = body["error"].as_str().unwrap_or("no details");
            anyhow::bail!("server returned {}: {}", status, msg);
        }
        Ok(body)
    }

    fn get(&self, path: &str) -> anyhow::Result<serde_json::Value> {
        self.send(self.client.get(self.url(path)))
    }
}

fn do_status(api: &Api) -> anyhow::Result<()> {
    let body = api.get("/health")?;
    println!("Playtime server: {}", body["status"].as_str().unwrap_or("unknown"));
    println!("Version:         {}", body["version"].as_str().unwrap_or("?"));
    println!("Store:           {}", body["store"].as_str().unwrap_or("?"));
    Ok(())
}

fn do_accounts(api: &Api, action: AccountAction) -> anyhow::Result<()> {
    match action {
        AccountAction::List => {
            let resp: AccountsResponse = serde_json::from_value(api.get("/accounts")?)?;
            for line in render_accounts(&resp) {
                println!("{}", line);
            }
        }
        AccountAction::Add {
            account_id,
            username,
        } => {
            let body = serde_json::json!({
                "account_id": account_id,
                "username": username,
            });
            let resp = api.send(api.client.post(api.url("/accounts")).json(&body))?;
            if resp["added"].as_bool().unwrap_or(false) {
                println!("Now tracking {}", account_id);
            } else {
                println!("{} was already tracked", account_id);
            }
        }
        AccountAction::Remove { account_id } => {
            let path = format!("/accounts/{}", account_id);
            let resp = api.send(api.client.delete(api.url(&path)))?;
            println!("Stopped tracking {}", account_id);
            let released = resp["released"].as_u64().unwrap_or(0);
            if released > 0 {
                println!("Closed {} open session(s) at their baseline", released);
            }
        }
    }
    Ok(())
}

fn do_sessions(api: &Api, account_id: &str, json: bool) -> anyhow::Result<()> {
    let body = api.get(&format!("/accounts/{}/sessions", account_id))?;
    if json {
        println!("{}", serde_json::to_string_pretty(&body)?);
        return Ok(());
    }
    let resp: SessionsResponse = serde_json::from_value(body)?;
    for line in render_sessions(&resp) {
        println!("{}", line);
    }
    Ok(())
}

fn do_active(api: &Api, account_id: &str, json: bool) -> anyhow::Result<()> {
    let body = api.get(&format!("/accounts/{}/active", account_id))?;
    if json {
        println!("{}", serde_json::to_string_pretty(&body)?);
        return Ok(());
    }
    let resp: ActiveResponse = serde_json::from_value(body)?;
    for line in render_active(&resp) {
        println!("{}", line);
    }
    Ok(())
}

fn do_refresh(api: &Api) -> anyhow::Result<()> {
    let body = serde_json::json!({ "kind": "account_list_changed" });
    api.send(api.client.post(api.url("/control")).json(&body))?;
    println!("Refresh requested");
    Ok(())
}

// ============================================================================
// Main
// ============================================================================

fn main() {
    let cli = Cli::parse();

    let result = Api::new(&cli.server).and_then(|api| match cli.command {
        Commands::Status => do_status(&api),
        Commands::Accounts { action } => do_accounts(&api, action),
        Commands::Sessions { account_id, json } => do_sessions(&api, &account_id, json),
        Commands::Active { account_id, json } => do_active(&api, &account_id, json),
        Commands::Refresh => do_refresh(&api),
    });

    if let Err(e) = result {
        eprintln!("playtime-cli: {}", e);
        std::process::exit(1);
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_minutes() {
        assert_eq!(format_minutes(0), "0m");
        assert_eq!(format_minutes(59), "59m");
        assert_eq!(format_minutes(60), "1h 00m");
        assert_eq!(format_minutes(95), "1h 35m");
        assert_eq!(format_minutes(-5), "0m");
    }

    #[test]
    fn test_sessions_response_parses_server_shape() {
        let body = serde_json::json!({
            "account_id": "76561198000000001",
            "count": 1,
            "total_minutes": 75,
            "sessions": [{
                "account": "76561198000000001",
                "title": 570,
                "started_at": "2024-11-28T12:00:00Z",
                "ended_at": "2024-11-28T13:15:00Z",
                "playtime_forever_at_end": 4200
            }]
        });

        let resp: SessionsResponse = serde_json::from_value(body).unwrap();
        let lines = render_sessions(&resp);
        assert_eq!(lines.len(), 2);
        assert!(lines[0].contains("570"));
        assert!(lines[1].ends_with("1h 15m total"));
        assert!(lines[1].contains("76561198000000001"));
    }

    #[test]
    fn test_render_empty_accounts() {
        let resp = AccountsResponse {
            accounts: vec![],
            count: 0,
        };
        assert_eq!(render_accounts(&resp), vec!["No tracked accounts".to_string()]);
    }

    #[test]
    fn test_render_account_without_username() {
        let resp = AccountsResponse {
            accounts: vec![TrackedAccount {
                account: "76561198000000001".to_string(),
                username: None,
                added_at: "2024-11-28T12:00:00Z".to_string(),
            }],
            count: 1,
        };
        let lines = render_accounts(&resp);
        assert!(lines[0].starts_with("76561198000000001"));
        assert!(lines[0].contains(" - "));
    }

    #[test]
    fn test_render_idle_account() {
        let resp = ActiveResponse {
            account_id: "7".to_string(),
            active: vec![],
            count: 0,
        };
        assert_eq!(render_active(&resp), vec!["7 is not in a tracked session".to_string()]);
    }

    #[test]
    fn test_cli_parses_account_add() {
        let cli = Cli::try_parse_from([
            "playtime-cli",
            "--server",
            "http://localhost:1",
            "accounts",
            "add",
            "76561198000000001",
            "--username",
            "alice",
        ])
        .unwrap();
        assert_eq!(cli.server, "http://localhost:1");
        match cli.command {
            Commands::Accounts {
                action: AccountAction::Add { account_id, username },
            } => {
                assert_eq!(account_id, "76561198000000001");
                assert_eq!(username.as_deref(), Some("alice"));
            }
            other => panic!("Unexpected command: {:?}", other),
        }
    }
}
