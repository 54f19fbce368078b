//! SQLite-backed repository for applications, hosts, instances, domains,
//! secrets, deployment history, runs, artifacts, and settings.

use rusqlite::{Connection, OptionalExtension, params};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::crypto::SecretCipher;
use crate::error::{Error, Result};

const MIGRATION_SQL: &str = include_str!("../migrations/001_init.sql");

/// Host name values that select the local transport.
pub const LOCALHOST_NAMES: [&str; 3] = ["localhost", "127.0.0.1", "local"];

/// Generate a prefix-rendered UUID such as `app_6f2c…`.
pub fn new_id(prefix: &str) -> String {
    format!("{}_{}", prefix, Uuid::new_v4().simple())
}

#[derive(Debug, Clone)]
/// Application row.
pub struct AppRow {
    pub id: String,
    pub name: String,
    pub created_at: String,
}

#[derive(Debug, Clone)]
/// Host row; credentials are decrypted on read.
pub struct HostRow {
    pub id: String,
    pub name: String,
    pub address: String,
    pub port: u16,
    pub username: String,
    pub password: Option<String>,
    pub private_key: Option<String>,
    pub host_public_key: Option<String>,
    pub status: String,
    pub architecture: Option<String>,
    pub initialized_at: Option<String>,
}

impl HostRow {
    /// Whether deploys to this host run on the server's own machine.
    pub fn is_local(&self) -> bool {
        LOCALHOST_NAMES.contains(&self.name.as_str())
    }
}

#[derive(Debug, Clone)]
/// Instance row: one (application, host) slot.
pub struct InstanceRow {
    pub id: String,
    pub application_id: String,
    pub host_id: String,
    pub status: String,
    pub active_port: u16,
    pub previous_active_port: u16,
}

#[derive(Debug, Clone)]
/// Domain row bound to an instance.
pub struct DomainRow {
    pub id: String,
    pub instance_id: String,
    pub hostname: String,
    pub is_primary: bool,
}

#[derive(Debug, Clone)]
/// Deployment history row.
pub struct HistoryRow {
    pub id: String,
    pub instance_id: String,
    pub version: String,
    pub release_path: Option<String>,
    pub port: u16,
    pub status: String,
    pub log_output: String,
    pub git_commit_sha: Option<String>,
    pub created_at: String,
    pub deployed_at: Option<String>,
}

#[derive(Debug, Clone)]
/// Deployment run row: one live port on an instance.
pub struct RunRow {
    pub id: String,
    pub instance_id: String,
    pub version: String,
    pub git_commit_sha: Option<String>,
    pub release_path: String,
    pub port: u16,
    pub status: String,
}

#[derive(Debug, Clone)]
/// Build artifact row in the content-addressed cache index.
pub struct ArtifactRow {
    pub id: String,
    pub application_id: String,
    pub version: String,
    pub git_commit_sha: Option<String>,
    pub md5_hash: String,
    pub local_path: String,
    pub created_at: String,
}

/// Outcome of the atomic cutover transaction.
#[derive(Debug, Clone)]
pub struct CutoverResult {
    pub run_id: String,
    pub old_port: u16,
    pub new_port: u16,
}

/// Repository wrapper with migrations and typed accessors.
pub struct Repository {
    conn: Connection,
    cipher: Arc<dyn SecretCipher>,
}

impl Repository {
    /// Open or create the database at a path.
    pub fn open(path: &Path, cipher: Arc<dyn SecretCipher>) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        migrate(&conn)?;
        Ok(Self { conn, cipher })
    }

    /// Open an in-memory database (tests).
    pub fn open_in_memory(cipher: Arc<dyn SecretCipher>) -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        migrate(&conn)?;
        Ok(Self { conn, cipher })
    }

    // ----- applications -----

    /// Create a new application.
    pub fn create_app(&self, name: &str) -> Result<AppRow> {
        let id = new_id("app");
        let now = now_rfc3339();
        self.conn.execute(
            "INSERT INTO applications(id, name, created_at) VALUES(?1, ?2, ?3)",
            params![id, name, now],
        )?;
        Ok(AppRow {
            id,
            name: name.to_string(),
            created_at: now,
        })
    }

    /// Find an application by name.
    pub fn get_app_by_name(&self, name: &str) -> Result<AppRow> {
        self.conn
            .query_row(
                "SELECT id, name, created_at FROM applications WHERE name = ?1",
                params![name],
                app_from_row,
            )
            .optional()?
            .ok_or_else(|| Error::AppNotFound(name.to_string()))
    }

    /// Get an application by name, creating it if absent.
    pub fn ensure_app(&self, name: &str) -> Result<AppRow> {
        match self.get_app_by_name(name) {
            Ok(app) => Ok(app),
            Err(Error::AppNotFound(_)) => self.create_app(name),
            Err(err) => Err(err),
        }
    }

    /// List all applications.
    pub fn list_apps(&self) -> Result<Vec<AppRow>> {
        let mut stmt = self
            .conn
            .prepare("SELECT id, name, created_at FROM applications ORDER BY name ASC")?;
        let rows = stmt.query_map([], app_from_row)?;
        Ok(rows.filter_map(std::result::Result::ok).collect())
    }

    // ----- hosts -----

    /// Register a host; credentials are encrypted before they touch disk.
    #[allow(clippy::too_many_arguments)]
    pub fn create_host(
        &self,
        name: &str,
        address: &str,
        port: u16,
        username: &str,
        password: Option<&str>,
        private_key: Option<&str>,
    ) -> Result<HostRow> {
        let id = new_id("ssh");
        let now = now_rfc3339();
        let sealed_password = password
            .map(|value| self.cipher.encrypt(value.as_bytes()))
            .transpose()?;
        let sealed_key = private_key
            .map(|value| self.cipher.encrypt(value.as_bytes()))
            .transpose()?;
        self.conn.execute(
            "INSERT INTO hosts(id, name, address, port, username, password, private_key, status, created_at)
             VALUES(?1, ?2, ?3, ?4, ?5, ?6, ?7, 'new', ?8)",
            params![id, name, address, port, username, sealed_password, sealed_key, now],
        )?;
        self.get_host_by_name(name)
    }

    /// Find a host by name; credentials come back decrypted.
    pub fn get_host_by_name(&self, name: &str) -> Result<HostRow> {
        let row = self
            .conn
            .query_row(
                "SELECT id, name, address, port, username, password, private_key,
                        host_public_key, status, architecture, initialized_at
                 FROM hosts WHERE name = ?1",
                params![name],
                raw_host_from_row,
            )
            .optional()?
            .ok_or_else(|| Error::HostNotFound(name.to_string()))?;
        self.unseal_host(row)
    }

    /// Get a host by id.
    pub fn get_host(&self, id: &str) -> Result<HostRow> {
        let row = self
            .conn
            .query_row(
                "SELECT id, name, address, port, username, password, private_key,
                        host_public_key, status, architecture, initialized_at
                 FROM hosts WHERE id = ?1",
                params![id],
                raw_host_from_row,
            )
            .optional()?
            .ok_or_else(|| Error::HostNotFound(id.to_string()))?;
        self.unseal_host(row)
    }

    /// List all hosts (credentials omitted).
    pub fn list_hosts(&self) -> Result<Vec<HostRow>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, name, address, port, username, NULL, NULL,
                    host_public_key, status, architecture, initialized_at
             FROM hosts ORDER BY name ASC",
        )?;
        let rows = stmt.query_map([], raw_host_from_row)?;
        Ok(rows
            .filter_map(std::result::Result::ok)
            .map(|row| row.into_plain())
            .collect())
    }

    /// Pin the host public key captured on first connect.
    pub fn update_host_key(&self, host_id: &str, public_key: &str) -> Result<()> {
        self.conn.execute(
            "UPDATE hosts SET host_public_key = ?1 WHERE id = ?2",
            params![public_key, host_id],
        )?;
        Ok(())
    }

    /// Clear the pinned key for a deliberate host re-key.
    pub fn clear_host_key(&self, host_id: &str) -> Result<()> {
        self.conn.execute(
            "UPDATE hosts SET host_public_key = NULL WHERE id = ?1",
            params![host_id],
        )?;
        Ok(())
    }

    /// Rotate stored credentials in place.
    pub fn update_host_credentials(
        &self,
        host_id: &str,
        password: Option<&str>,
        private_key: Option<&str>,
    ) -> Result<()> {
        let sealed_password = password
            .map(|value| self.cipher.encrypt(value.as_bytes()))
            .transpose()?;
        let sealed_key = private_key
            .map(|value| self.cipher.encrypt(value.as_bytes()))
            .transpose()?;
        self.conn.execute(
            "UPDATE hosts SET password = ?1, private_key = ?2 WHERE id = ?3",
            params![sealed_password, sealed_key, host_id],
        )?;
        Ok(())
    }

    /// Mark the one-time runtime prep as done.
    pub fn set_host_initialized(&self, host_id: &str, architecture: Option<&str>) -> Result<()> {
        self.conn.execute(
            "UPDATE hosts SET initialized_at = ?1, architecture = ?2, status = 'ready'
             WHERE id = ?3",
            params![now_rfc3339(), architecture, host_id],
        )?;
        Ok(())
    }

    fn unseal_host(&self, row: RawHostRow) -> Result<HostRow> {
        let password = row
            .password
            .as_deref()
            .map(|sealed| self.decrypt_text(sealed))
            .transpose()?;
        let private_key = row
            .private_key
            .as_deref()
            .map(|sealed| self.decrypt_text(sealed))
            .transpose()?;
        let mut host = row.into_plain();
        host.password = password;
        host.private_key = private_key;
        Ok(host)
    }

    fn decrypt_text(&self, sealed: &str) -> Result<String> {
        let bytes = self.cipher.decrypt(sealed)?;
        String::from_utf8(bytes).map_err(|_| Error::Crypto("secret is not UTF-8".to_string()))
    }

    // ----- instances -----

    /// Get the instance for an (application, host) pair.
    pub fn get_instance(&self, app: &AppRow, host: &HostRow) -> Result<InstanceRow> {
        self.conn
            .query_row(
                "SELECT id, application_id, host_id, status, active_port, previous_active_port
                 FROM instances WHERE application_id = ?1 AND host_id = ?2",
                params![app.id, host.id],
                instance_from_row,
            )
            .optional()?
            .ok_or_else(|| Error::InstanceNotFound {
                app: app.name.clone(),
                host: host.name.clone(),
            })
    }

    /// Get an instance by id.
    pub fn get_instance_by_id(&self, id: &str) -> Result<InstanceRow> {
        self.conn
            .query_row(
                "SELECT id, application_id, host_id, status, active_port, previous_active_port
                 FROM instances WHERE id = ?1",
                params![id],
                instance_from_row,
            )
            .optional()?
            .ok_or_else(|| Error::InstanceNotFound {
                app: id.to_string(),
                host: String::new(),
            })
    }

    /// Link an application to a host, creating the instance slot if absent.
    pub fn link_instance(&self, app: &AppRow, host: &HostRow) -> Result<InstanceRow> {
        match self.get_instance(app, host) {
            Ok(instance) => Ok(instance),
            Err(Error::InstanceNotFound { .. }) => {
                let id = new_id("inst");
                self.conn.execute(
                    "INSERT INTO instances(id, application_id, host_id, status, created_at)
                     VALUES(?1, ?2, ?3, 'linked', ?4)",
                    params![id, app.id, host.id, now_rfc3339()],
                )?;
                self.get_instance(app, host)
            }
            Err(err) => Err(err),
        }
    }

    /// Idempotently create application, localhost host, and instance in one
    /// transaction, for same-machine deployments.
    pub fn ensure_localhost_instance(&mut self, app_name: &str) -> Result<InstanceRow> {
        let tx = self.conn.transaction()?;
        let now = now_rfc3339();
        let app_id: Option<String> = tx
            .query_row(
                "SELECT id FROM applications WHERE name = ?1",
                params![app_name],
                |row| row.get(0),
            )
            .optional()?;
        let app_id = match app_id {
            Some(id) => id,
            None => {
                let id = new_id("app");
                tx.execute(
                    "INSERT INTO applications(id, name, created_at) VALUES(?1, ?2, ?3)",
                    params![id, app_name, now],
                )?;
                id
            }
        };
        let host_id: Option<String> = tx
            .query_row(
                "SELECT id FROM hosts WHERE name = 'localhost'",
                [],
                |row| row.get(0),
            )
            .optional()?;
        let host_id = match host_id {
            Some(id) => id,
            None => {
                let id = new_id("ssh");
                // The pseudo-host carries no usable SSH credentials and is
                // born initialized; it exists for routing only.
                tx.execute(
                    "INSERT INTO hosts(id, name, address, port, username, status, initialized_at, created_at)
                     VALUES(?1, 'localhost', '127.0.0.1', 22, 'root', 'ready', ?2, ?2)",
                    params![id, now],
                )?;
                id
            }
        };
        let instance_id: Option<String> = tx
            .query_row(
                "SELECT id FROM instances WHERE application_id = ?1 AND host_id = ?2",
                params![app_id, host_id],
                |row| row.get(0),
            )
            .optional()?;
        if instance_id.is_none() {
            let id = new_id("inst");
            tx.execute(
                "INSERT INTO instances(id, application_id, host_id, status, created_at)
                 VALUES(?1, ?2, ?3, 'linked', ?4)",
                params![id, app_id, host_id, now],
            )?;
        }
        tx.commit()?;
        let app = self.get_app_by_name(app_name)?;
        let host = self.get_host_by_name("localhost")?;
        self.get_instance(&app, &host)
    }

    /// Update instance status only; ports are touched by the cutover.
    pub fn set_instance_status(&self, instance_id: &str, status: &str) -> Result<()> {
        self.conn.execute(
            "UPDATE instances SET status = ?1 WHERE id = ?2",
            params![status, instance_id],
        )?;
        Ok(())
    }

    // ----- secrets -----

    /// List secret keys for an application.
    pub fn list_secret_keys(&self, app_id: &str) -> Result<Vec<String>> {
        let mut stmt = self.conn.prepare(
            "SELECT key FROM secrets WHERE application_id = ?1 ORDER BY key ASC",
        )?;
        let rows = stmt.query_map(params![app_id], |row| row.get(0))?;
        Ok(rows.filter_map(std::result::Result::ok).collect())
    }

    /// Decrypt all secrets for an application into memory.
    pub fn get_secrets_map(&self, app_id: &str) -> Result<BTreeMap<String, String>> {
        let mut stmt = self.conn.prepare(
            "SELECT key, value FROM secrets WHERE application_id = ?1 ORDER BY key ASC",
        )?;
        let rows = stmt.query_map(params![app_id], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;
        let mut map = BTreeMap::new();
        for row in rows {
            let (key, sealed) = row?;
            map.insert(key, self.decrypt_text(&sealed)?);
        }
        Ok(map)
    }

    /// Upsert a secret; the value is encrypted before the statement runs.
    pub fn set_secret(&self, app_id: &str, key: &str, value: &str) -> Result<()> {
        let sealed = self.cipher.encrypt(value.as_bytes())?;
        let now = now_rfc3339();
        self.conn.execute(
            "INSERT INTO secrets(id, application_id, key, value, created_at, updated_at)
             VALUES(?1, ?2, ?3, ?4, ?5, ?5)
             ON CONFLICT(application_id, key)
             DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
            params![new_id("env"), app_id, key, sealed, now],
        )?;
        Ok(())
    }

    /// Remove a secret.
    pub fn unset_secret(&self, app_id: &str, key: &str) -> Result<()> {
        self.conn.execute(
            "DELETE FROM secrets WHERE application_id = ?1 AND key = ?2",
            params![app_id, key],
        )?;
        Ok(())
    }

    // ----- deployment history -----

    /// Create a pending history record for a deployment attempt.
    pub fn create_history(
        &self,
        instance_id: &str,
        version: &str,
        git_commit_sha: Option<&str>,
    ) -> Result<HistoryRow> {
        let id = new_id("dpl");
        self.conn.execute(
            "INSERT INTO deployment_history(id, instance_id, version, git_commit_sha, status, created_at)
             VALUES(?1, ?2, ?3, ?4, 'pending', ?5)",
            params![id, instance_id, version, git_commit_sha, now_rfc3339()],
        )?;
        self.get_history(&id)
    }

    /// Get a history row by id.
    pub fn get_history(&self, id: &str) -> Result<HistoryRow> {
        Ok(self.conn.query_row(
            "SELECT id, instance_id, version, release_path, port, status, log_output,
                    git_commit_sha, created_at, deployed_at
             FROM deployment_history WHERE id = ?1",
            params![id],
            history_from_row,
        )?)
    }

    /// Append a line to the deployment log.
    pub fn append_history_log(&self, id: &str, line: &str) -> Result<()> {
        self.conn.execute(
            "UPDATE deployment_history
             SET log_output = log_output || ?1 || char(10)
             WHERE id = ?2",
            params![line, id],
        )?;
        Ok(())
    }

    /// Set a terminal (or intermediate) history status.
    pub fn set_history_status(&self, id: &str, status: &str) -> Result<()> {
        self.conn.execute(
            "UPDATE deployment_history SET status = ?1 WHERE id = ?2",
            params![status, id],
        )?;
        Ok(())
    }

    /// List recent history for an instance, newest first.
    pub fn list_history(&self, instance_id: &str, limit: u32) -> Result<Vec<HistoryRow>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, instance_id, version, release_path, port, status, log_output,
                    git_commit_sha, created_at, deployed_at
             FROM deployment_history
             WHERE instance_id = ?1
             ORDER BY created_at DESC, rowid DESC
             LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![instance_id, limit], history_from_row)?;
        Ok(rows.filter_map(std::result::Result::ok).collect())
    }

    /// The atomic cutover: in one transaction mark history success, insert
    /// the new active run, demote the prior run to standby, and swap the
    /// instance ports.
    pub fn record_successful_deployment(
        &mut self,
        history_id: &str,
        port: u16,
        release_path: &str,
        git_commit_sha: Option<&str>,
    ) -> Result<CutoverResult> {
        let tx = self.conn.transaction()?;
        let now = now_rfc3339();

        let (instance_id, version): (String, String) = tx.query_row(
            "SELECT instance_id, version FROM deployment_history WHERE id = ?1",
            params![history_id],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;
        let old_port: u16 = tx.query_row(
            "SELECT active_port FROM instances WHERE id = ?1",
            params![instance_id],
            |row| row.get(0),
        )?;

        tx.execute(
            "UPDATE deployment_history
             SET status = 'success', port = ?1, release_path = ?2, deployed_at = ?3
             WHERE id = ?4",
            params![port, release_path, now, history_id],
        )?;

        let run_id = new_id("run");
        tx.execute(
            "INSERT INTO deployment_runs(id, instance_id, version, git_commit_sha,
                                         release_path, port, status, created_at, updated_at)
             VALUES(?1, ?2, ?3, ?4, ?5, ?6, 'active', ?7, ?7)",
            params![run_id, instance_id, version, git_commit_sha, release_path, port, now],
        )?;
        if old_port > 0 {
            tx.execute(
                "UPDATE deployment_runs SET status = 'standby', updated_at = ?1
                 WHERE instance_id = ?2 AND port = ?3 AND status IN ('active', 'running')",
                params![now, instance_id, old_port],
            )?;
        }
        tx.execute(
            "UPDATE instances
             SET previous_active_port = ?1, active_port = ?2, status = 'running'
             WHERE id = ?3",
            params![old_port, port, instance_id],
        )?;
        tx.commit()?;
        Ok(CutoverResult {
            run_id,
            old_port,
            new_port: port,
        })
    }

    /// Manual rollback commit: swap the port columns and flip the run
    /// statuses, in one transaction.
    pub fn record_rollback(&mut self, instance_id: &str) -> Result<CutoverResult> {
        let tx = self.conn.transaction()?;
        let now = now_rfc3339();
        let (active, previous): (u16, u16) = tx.query_row(
            "SELECT active_port, previous_active_port FROM instances WHERE id = ?1",
            params![instance_id],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;
        tx.execute(
            "UPDATE deployment_runs SET status = 'standby', updated_at = ?1
             WHERE instance_id = ?2 AND port = ?3 AND status = 'active'",
            params![now, instance_id, active],
        )?;
        tx.execute(
            "UPDATE deployment_runs SET status = 'active', updated_at = ?1
             WHERE instance_id = ?2 AND port = ?3 AND status = 'standby'",
            params![now, instance_id, previous],
        )?;
        let run_id: String = tx.query_row(
            "SELECT id FROM deployment_runs WHERE instance_id = ?1 AND port = ?2 AND status = 'active'
             ORDER BY created_at DESC, rowid DESC LIMIT 1",
            params![instance_id, previous],
            |row| row.get(0),
        )?;
        tx.execute(
            "UPDATE instances SET active_port = ?1, previous_active_port = ?2 WHERE id = ?3",
            params![previous, active, instance_id],
        )?;
        tx.commit()?;
        Ok(CutoverResult {
            run_id,
            old_port: active,
            new_port: previous,
        })
    }

    // ----- deployment runs -----

    /// Fetch the run fronting a port, if any.
    pub fn get_run_by_port(&self, instance_id: &str, port: u16) -> Result<Option<RunRow>> {
        Ok(self
            .conn
            .query_row(
                "SELECT id, instance_id, version, git_commit_sha, release_path, port, status
                 FROM deployment_runs
                 WHERE instance_id = ?1 AND port = ?2
                 ORDER BY created_at DESC, rowid DESC LIMIT 1",
                params![instance_id, port],
                run_from_row,
            )
            .optional()?)
    }

    /// Update a run's status.
    pub fn update_run_status(&self, run_id: &str, status: &str) -> Result<()> {
        self.conn.execute(
            "UPDATE deployment_runs SET status = ?1, updated_at = ?2 WHERE id = ?3",
            params![status, now_rfc3339(), run_id],
        )?;
        Ok(())
    }

    /// List all runs for an instance, newest first.
    pub fn list_runs(&self, instance_id: &str) -> Result<Vec<RunRow>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, instance_id, version, git_commit_sha, release_path, port, status
             FROM deployment_runs WHERE instance_id = ?1 ORDER BY created_at DESC, rowid DESC",
        )?;
        let rows = stmt.query_map(params![instance_id], run_from_row)?;
        Ok(rows.filter_map(std::result::Result::ok).collect())
    }

    /// Runs whose port is neither active nor previous for their instance.
    pub fn list_stale_runs(&self, instance_id: &str) -> Result<Vec<RunRow>> {
        let mut stmt = self.conn.prepare(
            "SELECT r.id, r.instance_id, r.version, r.git_commit_sha, r.release_path,
                    r.port, r.status
             FROM deployment_runs r
             JOIN instances i ON i.id = r.instance_id
             WHERE r.instance_id = ?1
               AND r.port != i.active_port
               AND r.port != i.previous_active_port
               AND r.status != 'stopped'",
        )?;
        let rows = stmt.query_map(params![instance_id], run_from_row)?;
        Ok(rows.filter_map(std::result::Result::ok).collect())
    }

    // ----- domains -----

    /// Domains for an instance, primary first.
    pub fn list_domains(&self, instance_id: &str) -> Result<Vec<DomainRow>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, instance_id, hostname, is_primary
             FROM domains WHERE instance_id = ?1
             ORDER BY is_primary DESC, created_at ASC",
        )?;
        let rows = stmt.query_map(params![instance_id], domain_from_row)?;
        Ok(rows.filter_map(std::result::Result::ok).collect())
    }

    /// Bind a hostname to an instance.
    pub fn add_domain(&self, instance_id: &str, hostname: &str, is_primary: bool) -> Result<DomainRow> {
        let id = new_id("dom");
        self.conn.execute(
            "INSERT INTO domains(id, instance_id, hostname, is_primary, created_at)
             VALUES(?1, ?2, ?3, ?4, ?5)",
            params![id, instance_id, hostname, is_primary, now_rfc3339()],
        )?;
        self.get_domain_by_hostname(hostname)
    }

    /// Find a domain by hostname.
    pub fn get_domain_by_hostname(&self, hostname: &str) -> Result<DomainRow> {
        self.conn
            .query_row(
                "SELECT id, instance_id, hostname, is_primary FROM domains WHERE hostname = ?1",
                params![hostname],
                domain_from_row,
            )
            .optional()?
            .ok_or_else(|| Error::DomainNotFound(hostname.to_string()))
    }

    /// Mark a domain primary, clearing its siblings in the same transaction.
    pub fn set_primary_domain(&mut self, domain_id: &str) -> Result<()> {
        let tx = self.conn.transaction()?;
        let instance_id: String = tx.query_row(
            "SELECT instance_id FROM domains WHERE id = ?1",
            params![domain_id],
            |row| row.get(0),
        )?;
        tx.execute(
            "UPDATE domains SET is_primary = 0 WHERE instance_id = ?1",
            params![instance_id],
        )?;
        tx.execute(
            "UPDATE domains SET is_primary = 1 WHERE id = ?1",
            params![domain_id],
        )?;
        tx.commit()?;
        Ok(())
    }

    /// Remove a domain binding.
    pub fn remove_domain(&self, domain_id: &str) -> Result<()> {
        self.conn
            .execute("DELETE FROM domains WHERE id = ?1", params![domain_id])?;
        Ok(())
    }

    // ----- build artifacts -----

    /// Register a built tarball in the cache index.
    pub fn add_artifact(
        &self,
        app_id: &str,
        version: &str,
        git_commit_sha: Option<&str>,
        md5_hash: &str,
        local_path: &str,
    ) -> Result<ArtifactRow> {
        let id = new_id("art");
        self.conn.execute(
            "INSERT INTO build_artifacts(id, application_id, version, git_commit_sha,
                                         md5_hash, local_path, created_at)
             VALUES(?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![id, app_id, version, git_commit_sha, md5_hash, local_path, now_rfc3339()],
        )?;
        self.conn
            .query_row(
                "SELECT id, application_id, version, git_commit_sha, md5_hash, local_path, created_at
                 FROM build_artifacts WHERE id = ?1",
                params![id],
                artifact_from_row,
            )
            .map_err(Error::from)
    }

    /// Look up by MD5 prefix; ambiguous prefixes are an error.
    pub fn find_artifact_by_md5_prefix(&self, app_id: &str, prefix: &str) -> Result<ArtifactRow> {
        let pattern = format!("{}%", prefix);
        let mut stmt = self.conn.prepare(
            "SELECT id, application_id, version, git_commit_sha, md5_hash, local_path, created_at
             FROM build_artifacts
             WHERE application_id = ?1 AND md5_hash LIKE ?2
             ORDER BY created_at DESC, rowid DESC",
        )?;
        let rows = stmt.query_map(params![app_id, pattern], artifact_from_row)?;
        let matches: Vec<ArtifactRow> = rows.filter_map(std::result::Result::ok).collect();
        let distinct: std::collections::BTreeSet<&str> =
            matches.iter().map(|artifact| artifact.md5_hash.as_str()).collect();
        match distinct.len() {
            0 => Err(Error::ArtifactNotFound(prefix.to_string())),
            1 => Ok(matches.into_iter().next().expect("non-empty matches")),
            _ => Err(Error::AmbiguousArtifact(prefix.to_string())),
        }
    }

    /// Look up by full git SHA (suffix-sensitive; dirty SHAs never match clean rows).
    pub fn find_artifact_by_git_sha(&self, app_id: &str, sha: &str) -> Result<ArtifactRow> {
        self.conn
            .query_row(
                "SELECT id, application_id, version, git_commit_sha, md5_hash, local_path, created_at
                 FROM build_artifacts
                 WHERE application_id = ?1 AND git_commit_sha = ?2
                 ORDER BY created_at DESC, rowid DESC LIMIT 1",
                params![app_id, sha],
                artifact_from_row,
            )
            .optional()?
            .ok_or_else(|| Error::ArtifactNotFound(sha.to_string()))
    }

    /// Look up by exact version, newest first.
    pub fn find_artifact_by_version(&self, app_id: &str, version: &str) -> Result<ArtifactRow> {
        self.conn
            .query_row(
                "SELECT id, application_id, version, git_commit_sha, md5_hash, local_path, created_at
                 FROM build_artifacts
                 WHERE application_id = ?1 AND version = ?2
                 ORDER BY created_at DESC, rowid DESC LIMIT 1",
                params![app_id, version],
                artifact_from_row,
            )
            .optional()?
            .ok_or_else(|| Error::ArtifactNotFound(version.to_string()))
    }

    /// All artifacts for an application, newest first.
    pub fn list_artifacts(&self, app_id: &str) -> Result<Vec<ArtifactRow>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, application_id, version, git_commit_sha, md5_hash, local_path, created_at
             FROM build_artifacts WHERE application_id = ?1 ORDER BY created_at DESC, rowid DESC",
        )?;
        let rows = stmt.query_map(params![app_id], artifact_from_row)?;
        Ok(rows.filter_map(std::result::Result::ok).collect())
    }

    // ----- system settings -----

    /// Read an untyped setting.
    pub fn get_setting(&self, key: &str) -> Result<Option<String>> {
        Ok(self
            .conn
            .query_row(
                "SELECT value FROM system_settings WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()?)
    }

    /// Write an untyped setting.
    pub fn set_setting(&self, key: &str, value: &str) -> Result<()> {
        self.conn.execute(
            "INSERT INTO system_settings(key, value, updated_at) VALUES(?1, ?2, ?3)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
            params![key, value, now_rfc3339()],
        )?;
        Ok(())
    }
}

struct RawHostRow {
    id: String,
    name: String,
    address: String,
    port: u16,
    username: String,
    password: Option<String>,
    private_key: Option<String>,
    host_public_key: Option<String>,
    status: String,
    architecture: Option<String>,
    initialized_at: Option<String>,
}

impl RawHostRow {
    fn into_plain(self) -> HostRow {
        HostRow {
            id: self.id,
            name: self.name,
            address: self.address,
            port: self.port,
            username: self.username,
            password: None,
            private_key: None,
            host_public_key: self.host_public_key,
            status: self.status,
            architecture: self.architecture,
            initialized_at: self.initialized_at,
        }
    }
}

fn app_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<AppRow> {
    Ok(AppRow {
        id: row.get(0)?,
        name: row.get(1)?,
        created_at: row.get(2)?,
    })
}

fn raw_host_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawHostRow> {
    Ok(RawHostRow {
        id: row.get(0)?,
        name: row.get(1)?,
        address: row.get(2)?,
        port: row.get(3)?,
        username: row.get(4)?,
        password: row.get(5)?,
        private_key: row.get(6)?,
        host_public_key: row.get(7)?,
        status: row.get(8)?,
        architecture: row.get(9)?,
        initialized_at: row.get(10)?,
    })
}

fn instance_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<InstanceRow> {
    Ok(InstanceRow {
        id: row.get(0)?,
        application_id: row.get(1)?,
        host_id: row.get(2)?,
        status: row.get(3)?,
        active_port: row.get(4)?,
        previous_active_port: row.get(5)?,
    })
}

fn domain_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<DomainRow> {
    Ok(DomainRow {
        id: row.get(0)?,
        instance_id: row.get(1)?,
        hostname: row.get(2)?,
        is_primary: row.get(3)?,
    })
}

fn history_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<HistoryRow> {
    Ok(HistoryRow {
        id: row.get(0)?,
        instance_id: row.get(1)?,
        version: row.get(2)?,
        release_path: row.get(3)?,
        port: row.get(4)?,
        status: row.get(5)?,
        log_output: row.get(6)?,
        git_commit_sha: row.get(7)?,
        created_at: row.get(8)?,
        deployed_at: row.get(9)?,
    })
}

fn run_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RunRow> {
    Ok(RunRow {
        id: row.get(0)?,
        instance_id: row.get(1)?,
        version: row.get(2)?,
        git_commit_sha: row.get(3)?,
        release_path: row.get(4)?,
        port: row.get(5)?,
        status: row.get(6)?,
    })
}

fn artifact_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<ArtifactRow> {
    Ok(ArtifactRow {
        id: row.get(0)?,
        application_id: row.get(1)?,
        version: row.get(2)?,
        git_commit_sha: row.get(3)?,
        md5_hash: row.get(4)?,
        local_path: row.get(5)?,
        created_at: row.get(6)?,
    })
}

fn migrate(conn: &Connection) -> Result<()> {
    conn.execute_batch(MIGRATION_SQL)?;
    let exists: Option<i64> = conn
        .query_row(
            "SELECT version FROM schema_migrations WHERE version = 1",
            [],
            |row| row.get(0),
        )
        .optional()?;
    if exists.is_none() {
        conn.execute(
            "INSERT INTO schema_migrations(version, applied_at) VALUES(1, ?1)",
            params![now_rfc3339()],
        )?;
    }
    Ok(())
}

/// RFC3339 timestamp for row bookkeeping.
pub fn now_rfc3339() -> String {
    let fmt = time::format_description::well_known::Rfc3339;
    OffsetDateTime::now_utc()
        .format(&fmt)
        .unwrap_or_else(|_| "1970-01-01T00:00:00Z".to_string())
}
