// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! PostgreSQL implementations of the database collaborator traits.
//!
//! - Service control goes through `pg_ctl` against the configured data
//!   directory.
//! - SQL uses short-lived `sqlx` connections (one per call). The agent runs
//!   a handful of queries per tick, so pooling buys nothing.
//! - Clones run `pg_basebackup` with streamed WAL.
//!
//! WAL function names changed in PostgreSQL 10 (`xlog` → `wal`,
//! `location` → `lsn`). Queries are built for the configured version.

use crate::config::AgentConfig;
use crate::database::{
    BackupRequest, BaseBackup, DatabaseControl, Lsn, PeerEndpoint, PeerProbe, ReplicationCredentials,
};
use crate::error::{AgentError, Result};
use crate::substrate::BoxFuture;
use sqlx::postgres::{PgConnectOptions, PgConnection};
use sqlx::{ConnectOptions, Connection, Row};
use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, info, warn};

/// Default directory of the local server's unix socket.
const SOCKET_DIR: &str = "/var/run/postgresql";

/// Exit status of `pg_ctl status` when no server is running.
const PG_CTL_NOT_RUNNING: i32 = 3;

/// Connection timeout for probes against peers.
const PEER_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Version-specific names of the WAL inspection functions.
struct WalFunctions {
    receive: &'static str,
    replay: &'static str,
    current: &'static str,
}

fn wal_functions(config: &AgentConfig) -> WalFunctions {
    if config.has_version("10") {
        WalFunctions {
            receive: "pg_last_wal_receive_lsn()",
            replay: "pg_last_wal_replay_lsn()",
            current: "pg_current_wal_lsn()",
        }
    } else {
        WalFunctions {
            receive: "pg_last_xlog_receive_location()",
            replay: "pg_last_xlog_replay_location()",
            current: "pg_current_xlog_location()",
        }
    }
}

fn parse_optional_lsn(raw: Option<String>) -> Result<Option<Lsn>> {
    raw.map(|s| s.parse()).transpose()
}

/// Quote an SQL string literal.
fn quote_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

/// Quote an SQL identifier.
fn quote_ident(value: &str) -> String {
    format!("\"{}\"", value.replace('"', "\"\""))
}

/// Run a PostgreSQL binary, returning its exit code and captured stderr.
async fn run_tool(program: &Path, args: &[String]) -> Result<(i32, String)> {
    debug!(program = %program.display(), ?args, "Running PostgreSQL tool");
    let output = Command::new(program)
        .args(args)
        .current_dir("/tmp")
        .stdin(Stdio::null())
        .output()
        .await
        .map_err(|e| AgentError::io(format!("run {}", program.display()), e))?;
    let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
    Ok((output.status.code().unwrap_or(-1), stderr))
}

/// Local instance controlled through `pg_ctl` and the unix socket.
pub struct PgControl {
    config: Arc<AgentConfig>,
}

impl PgControl {
    pub fn new(config: Arc<AgentConfig>) -> Self {
        Self { config }
    }

    fn pg_ctl(&self) -> std::path::PathBuf {
        self.config.bin_dir().join("pg_ctl")
    }

    fn data_dir_arg(&self) -> String {
        self.config.paths.data_dir.to_string_lossy().to_string()
    }

    async fn pg_ctl_checked(&self, action: &str, extra: &[&str]) -> Result<()> {
        let mut args = vec![action.to_string(), "-D".to_string(), self.data_dir_arg()];
        args.extend(extra.iter().map(|s| s.to_string()));
        let (code, stderr) = run_tool(&self.pg_ctl(), &args).await?;
        if code != 0 {
            return Err(AgentError::database_msg(
                format!("pg_ctl {}", action),
                format!("exit status {}: {}", code, stderr),
            ));
        }
        Ok(())
    }

    async fn connect(&self) -> Result<PgConnection> {
        PgConnectOptions::new()
            .host(SOCKET_DIR)
            .port(self.config.port)
            .username("postgres")
            .database("postgres")
            .connect()
            .await
            .map_err(|e| AgentError::database("connect", e))
    }

    async fn query_optional_lsn(&self, operation: &str, function: &str) -> Result<Option<Lsn>> {
        let mut conn = self.connect().await?;
        let raw: Option<String> = sqlx::query_scalar(&format!("SELECT {}::text", function))
            .fetch_one(&mut conn)
            .await
            .map_err(|e| AgentError::database(operation, e))?;
        parse_optional_lsn(raw)
    }
}

impl DatabaseControl for PgControl {
    fn is_running(&self) -> BoxFuture<'_, bool> {
        Box::pin(async move {
            let args = vec!["status".to_string(), "-D".to_string(), self.data_dir_arg()];
            let (code, stderr) = run_tool(&self.pg_ctl(), &args).await?;
            match code {
                0 => Ok(true),
                PG_CTL_NOT_RUNNING => Ok(false),
                // No data directory at all
                4 => Ok(false),
                other => Err(AgentError::database_msg(
                    "pg_ctl status",
                    format!("exit status {}: {}", other, stderr),
                )),
            }
        })
    }

    fn is_in_recovery(&self) -> BoxFuture<'_, bool> {
        Box::pin(async move {
            let mut conn = self.connect().await?;
            let in_recovery: bool = sqlx::query_scalar("SELECT pg_is_in_recovery()")
                .fetch_one(&mut conn)
                .await
                .map_err(|e| AgentError::database("pg_is_in_recovery", e))?;
            Ok(in_recovery)
        })
    }

    fn start(&self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            info!(data_dir = %self.data_dir_arg(), "Starting PostgreSQL");
            self.pg_ctl_checked("start", &["-w", "-t", "120"]).await
        })
    }

    fn stop(&self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            info!(data_dir = %self.data_dir_arg(), "Stopping PostgreSQL");
            self.pg_ctl_checked("stop", &["-w", "-m", "fast"]).await
        })
    }

    fn reload(&self) -> BoxFuture<'_, ()> {
        Box::pin(async move { self.pg_ctl_checked("reload", &[]).await })
    }

    fn promote(&self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            info!("Requesting promotion to primary");
            self.pg_ctl_checked("promote", &[]).await
        })
    }

    fn drop_cluster(&self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            let data_dir = &self.config.paths.data_dir;
            warn!(data_dir = %data_dir.display(), "Dropping local cluster");
            match tokio::fs::remove_dir_all(data_dir).await {
                Ok(()) => Ok(()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
                Err(e) => Err(AgentError::io("drop cluster", e)),
            }
        })
    }

    fn received_position(&self) -> BoxFuture<'_, Option<Lsn>> {
        Box::pin(async move {
            let functions = wal_functions(&self.config);
            self.query_optional_lsn("wal receive position", functions.receive)
                .await
        })
    }

    fn replayed_position(&self) -> BoxFuture<'_, Option<Lsn>> {
        Box::pin(async move {
            let functions = wal_functions(&self.config);
            self.query_optional_lsn("wal replay position", functions.replay)
                .await
        })
    }

    fn ensure_replication_user(&self, credentials: ReplicationCredentials) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            let mut conn = self.connect().await?;
            let exists: bool =
                sqlx::query_scalar("SELECT EXISTS (SELECT 1 FROM pg_roles WHERE rolname = $1)")
                    .bind(&credentials.username)
                    .fetch_one(&mut conn)
                    .await
                    .map_err(|e| AgentError::database("check replication role", e))?;

            // Role DDL cannot take bind parameters.
            let verb = if exists { "ALTER" } else { "CREATE" };
            let statement = format!(
                "{} ROLE {} WITH LOGIN REPLICATION PASSWORD {}",
                verb,
                quote_ident(&credentials.username),
                quote_literal(&credentials.password)
            );
            sqlx::query(&statement)
                .execute(&mut conn)
                .await
                .map_err(|e| AgentError::database("ensure replication role", e))?;
            conn.close().await.map_err(|e| AgentError::database("close", e))?;

            if !exists {
                info!(role = %credentials.username, "Created replication role");
            }
            Ok(())
        })
    }
}

/// Probes peers over TCP as the replication role.
pub struct PgPeerProbe {
    config: Arc<AgentConfig>,
}

impl PgPeerProbe {
    pub fn new(config: Arc<AgentConfig>) -> Self {
        Self { config }
    }

    async fn connect(&self, peer: &PeerEndpoint, credentials: &ReplicationCredentials) -> Result<PgConnection> {
        let options = PgConnectOptions::new()
            .host(&peer.host)
            .port(peer.port)
            .username(&credentials.username)
            .password(&credentials.password)
            .database("postgres");
        match tokio::time::timeout(PEER_CONNECT_TIMEOUT, options.connect()).await {
            Ok(Ok(conn)) => Ok(conn),
            Ok(Err(e)) => Err(AgentError::PeerConnection {
                unit: peer.unit.to_string(),
                message: e.to_string(),
            }),
            Err(_) => Err(AgentError::PeerConnection {
                unit: peer.unit.to_string(),
                message: format!("connect timed out after {:?}", PEER_CONNECT_TIMEOUT),
            }),
        }
    }

    async fn query_lsn(&self, peer: &PeerEndpoint, credentials: &ReplicationCredentials, sql: &str) -> Result<Lsn> {
        let mut conn = self.connect(peer, credentials).await?;
        let raw: Option<String> = sqlx::query_scalar(sql)
            .fetch_one(&mut conn)
            .await
            .map_err(|e| AgentError::PeerConnection {
                unit: peer.unit.to_string(),
                message: e.to_string(),
            })?;
        match parse_optional_lsn(raw)? {
            Some(lsn) => Ok(lsn),
            None => Err(AgentError::PeerConnection {
                unit: peer.unit.to_string(),
                message: "no WAL position reported".to_string(),
            }),
        }
    }
}

impl PeerProbe for PgPeerProbe {
    fn replayed_position(&self, peer: PeerEndpoint, credentials: ReplicationCredentials) -> BoxFuture<'_, Lsn> {
        Box::pin(async move {
            let functions = wal_functions(&self.config);
            let sql = format!("SELECT {}::text", functions.replay);
            self.query_lsn(&peer, &credentials, &sql).await
        })
    }

    fn wal_position(&self, peer: PeerEndpoint, credentials: ReplicationCredentials) -> BoxFuture<'_, Lsn> {
        Box::pin(async move {
            let functions = wal_functions(&self.config);
            let sql = format!(
                "SELECT CASE WHEN pg_is_in_recovery() THEN greatest({}, {}) ELSE {} END::text",
                functions.receive, functions.replay, functions.current
            );
            self.query_lsn(&peer, &credentials, &sql).await
        })
    }

    fn is_replicating(
        &self,
        upstream: PeerEndpoint,
        credentials: ReplicationCredentials,
        client_host: String,
    ) -> BoxFuture<'_, bool> {
        Box::pin(async move {
            let mut conn = self.connect(&upstream, &credentials).await?;
            let row = sqlx::query(
                "SELECT COUNT(*) AS streaming FROM pg_stat_replication \
                 WHERE host(client_addr) = $1 AND state = 'streaming'",
            )
            .bind(&client_host)
            .fetch_one(&mut conn)
            .await
            .map_err(|e| AgentError::PeerConnection {
                unit: upstream.unit.to_string(),
                message: e.to_string(),
            })?;
            let streaming: i64 = row.try_get("streaming").map_err(|e| AgentError::PeerConnection {
                unit: upstream.unit.to_string(),
                message: e.to_string(),
            })?;
            Ok(streaming > 0)
        })
    }
}

/// Clones with `pg_basebackup`.
pub struct PgBaseBackup {
    config: Arc<AgentConfig>,
}

impl PgBaseBackup {
    pub fn new(config: Arc<AgentConfig>) -> Self {
        Self { config }
    }

    fn args(&self, request: &BackupRequest) -> Vec<String> {
        let mut args = vec![
            "-D".to_string(),
            request.target_dir.to_string_lossy().to_string(),
            "-h".to_string(),
            request.upstream.host.clone(),
            "-p".to_string(),
            request.upstream.port.to_string(),
            format!("--username={}", request.credentials.username),
            "--checkpoint=fast".to_string(),
            "--no-password".to_string(),
        ];
        if self.config.has_version("10") {
            args.push("--wal-method=stream".to_string());
        } else {
            args.push("--xlog-method=stream".to_string());
        }
        args
    }
}

impl BaseBackup for PgBaseBackup {
    fn run(&self, request: BackupRequest) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            let program = self.config.bin_dir().join("pg_basebackup");
            let args = self.args(&request);
            info!(upstream = %request.upstream.unit, host = %request.upstream.host, "Running base backup");

            let output = Command::new(&program)
                .args(&args)
                .env("PGPASSWORD", &request.credentials.password)
                .current_dir("/tmp")
                .stdin(Stdio::null())
                .output()
                .await
                .map_err(|e| AgentError::io("run pg_basebackup", e))?;

            if !output.status.success() {
                let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
                return Err(AgentError::BackupFailed {
                    upstream: request.upstream.unit.to_string(),
                    message: format!("{}: {}", output.status, stderr),
                });
            }
            Ok(())
        })
    }
}
