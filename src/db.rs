use std::collections::HashMap;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result};
use rusqlite::{Connection, ToSql, params, params_from_iter};

use crate::models::*;

/// Async-safe handle to the tracker database.
///
/// Wraps `TrackerDb` behind `Arc<Mutex>` and runs all access on tokio's
/// blocking thread pool via `spawn_blocking`, preventing synchronous SQLite
/// I/O from tying up async worker threads.
#[derive(Clone)]
pub struct DbHandle {
    inner: Arc<std::sync::Mutex<TrackerDb>>,
}

impl DbHandle {
    pub fn new(db: TrackerDb) -> Self {
        Self {
            inner: Arc::new(std::sync::Mutex::new(db)),
        }
    }

    /// Run a closure with access to the database on a blocking thread.
    /// All data passed into `f` must be owned (`'static`).
    pub async fn call<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&TrackerDb) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let db = self.inner.clone();
        tokio::task::spawn_blocking(move || {
            let guard = db
                .lock()
                .map_err(|e| anyhow::anyhow!("DB lock poisoned: {}", e))?;
            f(&guard)
        })
        .await
        .context("DB task panicked")?
    }

    /// Acquire the database mutex synchronously. Used for startup
    /// initialization and tests; must not be called from a hot async path.
    pub fn lock_sync(&self) -> Result<std::sync::MutexGuard<'_, TrackerDb>> {
        self.inner
            .lock()
            .map_err(|e| anyhow::anyhow!("DB lock poisoned: {}", e))
    }
}

/// Fields accepted when inserting an issue.
pub struct NewIssue {
    pub title: String,
    pub description: String,
    pub severity: IssueSeverity,
    pub tags: Option<String>,
    pub file_path: Option<String>,
    pub file_name: Option<String>,
    pub reporter_id: i64,
}

/// Partial update for an issue. `assignee_id` uses a nested Option so a
/// patch can distinguish "leave unchanged" (None) from "clear" (Some(None)).
#[derive(Default)]
pub struct IssuePatch {
    pub title: Option<String>,
    pub description: Option<String>,
    pub severity: Option<IssueSeverity>,
    pub status: Option<IssueStatus>,
    pub tags: Option<String>,
    pub assignee_id: Option<Option<i64>>,
}

impl IssuePatch {
    /// Names of the fields this patch touches, for permission checks.
    pub fn field_names(&self) -> Vec<&'static str> {
        let mut fields = Vec::new();
        if self.title.is_some() {
            fields.push("title");
        }
        if self.description.is_some() {
            fields.push("description");
        }
        if self.severity.is_some() {
            fields.push("severity");
        }
        if self.status.is_some() {
            fields.push("status");
        }
        if self.tags.is_some() {
            fields.push("tags");
        }
        if self.assignee_id.is_some() {
            fields.push("assignee_id");
        }
        fields
    }
}

/// Partial update for a user account (admin only at the API layer).
#[derive(Default)]
pub struct UserPatch {
    pub full_name: Option<String>,
    pub role: Option<Role>,
    pub is_active: Option<bool>,
}

/// Filters for the issue list endpoint. `skip`/`limit` are applied after
/// the filters; `limit` is already clamped by the caller.
#[derive(Default)]
pub struct IssueFilter {
    pub reporter_id: Option<i64>,
    pub status: Option<IssueStatus>,
    pub severity: Option<IssueSeverity>,
    pub search: Option<String>,
    pub skip: i64,
    pub limit: i64,
}

impl IssueFilter {
    /// WHERE clauses and bound parameters shared by the count and page
    /// queries.
    fn where_clause(&self) -> (String, Vec<Box<dyn ToSql>>) {
        let mut clauses: Vec<String> = Vec::new();
        let mut values: Vec<Box<dyn ToSql>> = Vec::new();

        if let Some(reporter_id) = self.reporter_id {
            clauses.push(format!("reporter_id = ?{}", values.len() + 1));
            values.push(Box::new(reporter_id));
        }
        if let Some(status) = self.status {
            clauses.push(format!("status = ?{}", values.len() + 1));
            values.push(Box::new(status.as_str()));
        }
        if let Some(severity) = self.severity {
            clauses.push(format!("severity = ?{}", values.len() + 1));
            values.push(Box::new(severity.as_str()));
        }
        if let Some(search) = &self.search {
            clauses.push(format!(
                "(title LIKE ?{} COLLATE NOCASE OR description LIKE ?{} COLLATE NOCASE)",
                values.len() + 1,
                values.len() + 2
            ));
            let pattern = format!("%{}%", search);
            values.push(Box::new(pattern.clone()));
            values.push(Box::new(pattern));
        }

        if clauses.is_empty() {
            (String::new(), values)
        } else {
            (format!(" WHERE {}", clauses.join(" AND ")), values)
        }
    }
}

pub struct TrackerDb {
    conn: Connection,
}

impl TrackerDb {
    /// Open (or create) a SQLite database at the given path and run migrations.
    pub fn new(path: &Path) -> Result<Self> {
        let conn = Connection::open(path).context("Failed to open SQLite database")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    /// Create an in-memory SQLite database (for testing).
    pub fn new_in_memory() -> Result<Self> {
        let conn =
            Connection::open_in_memory().context("Failed to open in-memory SQLite database")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    /// Trivial liveness query for the health endpoint.
    pub fn ping(&self) -> Result<()> {
        self.conn
            .query_row("SELECT 1", [], |_| Ok(()))
            .context("Database ping failed")?;
        Ok(())
    }

    fn init(&self) -> Result<()> {
        self.conn
            .execute_batch("PRAGMA foreign_keys = ON;")
            .context("Failed to enable foreign keys")?;
        self.run_migrations().context("Failed to run migrations")?;
        Ok(())
    }

    fn run_migrations(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "
                CREATE TABLE IF NOT EXISTS users (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    email TEXT NOT NULL UNIQUE,
                    password_hash TEXT NOT NULL,
                    full_name TEXT NOT NULL,
                    role TEXT NOT NULL DEFAULT 'REPORTER',
                    is_active INTEGER NOT NULL DEFAULT 1,
                    created_at TEXT NOT NULL DEFAULT (datetime('now')),
                    updated_at TEXT NOT NULL DEFAULT (datetime('now'))
                );

                CREATE TABLE IF NOT EXISTS issues (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    title TEXT NOT NULL,
                    description TEXT NOT NULL DEFAULT '',
                    severity TEXT NOT NULL DEFAULT 'MEDIUM',
                    status TEXT NOT NULL DEFAULT 'OPEN',
                    tags TEXT,
                    file_path TEXT,
                    file_name TEXT,
                    reporter_id INTEGER NOT NULL REFERENCES users(id),
                    assignee_id INTEGER REFERENCES users(id),
                    created_at TEXT NOT NULL DEFAULT (datetime('now')),
                    updated_at TEXT NOT NULL DEFAULT (datetime('now'))
                );

                CREATE INDEX IF NOT EXISTS idx_issues_reporter ON issues(reporter_id);
                CREATE INDEX IF NOT EXISTS idx_issues_status ON issues(status);
                CREATE INDEX IF NOT EXISTS idx_issues_severity ON issues(severity);
                ",
            )
            .context("Failed to create tables")?;
        Ok(())
    }

    // ── User CRUD ─────────────────────────────────────────────────────

    /// Insert a user. Returns `None` when the email is already registered.
    /// The duplicate check and insert run under the handle's mutex, so
    /// there is no window between them.
    pub fn create_user(
        &self,
        email: &str,
        password_hash: &str,
        full_name: &str,
        role: Role,
    ) -> Result<Option<User>> {
        let exists: bool = self
            .conn
            .query_row(
                "SELECT COUNT(*) > 0 FROM users WHERE email = ?1",
                params![email],
                |row| row.get(0),
            )
            .context("Failed to check for existing email")?;
        if exists {
            return Ok(None);
        }

        self.conn
            .execute(
                "INSERT INTO users (email, password_hash, full_name, role) VALUES (?1, ?2, ?3, ?4)",
                params![email, password_hash, full_name, role.as_str()],
            )
            .context("Failed to insert user")?;
        let id = self.conn.last_insert_rowid();
        Ok(Some(
            self.get_user(id)?.context("User not found after insert")?,
        ))
    }

    pub fn get_user(&self, id: i64) -> Result<Option<User>> {
        let mut stmt = self
            .conn
            .prepare(&format!("{} WHERE id = ?1", USER_SELECT))
            .context("Failed to prepare get_user")?;
        let mut rows = stmt
            .query_map(params![id], user_row)
            .context("Failed to query user")?;
        match rows.next() {
            Some(row) => Ok(Some(row.context("Failed to read user row")?.into_user()?)),
            None => Ok(None),
        }
    }

    /// Fetch a user together with their credential hash, for login.
    pub fn get_user_auth(&self, email: &str) -> Result<Option<(User, String)>> {
        let mut stmt = self
            .conn
            .prepare(&format!(
                "{}, password_hash FROM users WHERE email = ?1",
                USER_COLUMNS
            ))
            .context("Failed to prepare get_user_auth")?;
        let mut rows = stmt
            .query_map(params![email], |row| {
                Ok((user_row(row)?, row.get::<_, String>(7)?))
            })
            .context("Failed to query user credentials")?;
        match rows.next() {
            Some(row) => {
                let (r, hash) = row.context("Failed to read user row")?;
                Ok(Some((r.into_user()?, hash)))
            }
            None => Ok(None),
        }
    }

    pub fn list_users(&self) -> Result<Vec<User>> {
        let mut stmt = self
            .conn
            .prepare(&format!("{} ORDER BY id", USER_SELECT))
            .context("Failed to prepare list_users")?;
        let rows = stmt
            .query_map([], user_row)
            .context("Failed to query users")?;
        let mut users = Vec::new();
        for row in rows {
            users.push(row.context("Failed to read user row")?.into_user()?);
        }
        Ok(users)
    }

    /// Apply a partial update. Returns `None` when the user does not exist.
    pub fn update_user(&self, id: i64, patch: &UserPatch) -> Result<Option<User>> {
        if self.get_user(id)?.is_none() {
            return Ok(None);
        }

        // unchecked_transaction keeps the per-field updates atomic.
        // Safety: DbHandle's Mutex already guarantees single-threaded access.
        let tx = self
            .conn
            .unchecked_transaction()
            .context("Failed to begin transaction")?;

        if let Some(name) = &patch.full_name {
            tx.execute(
                "UPDATE users SET full_name = ?1, updated_at = datetime('now') WHERE id = ?2",
                params![name, id],
            )
            .context("Failed to update user full_name")?;
        }
        if let Some(role) = patch.role {
            tx.execute(
                "UPDATE users SET role = ?1, updated_at = datetime('now') WHERE id = ?2",
                params![role.as_str(), id],
            )
            .context("Failed to update user role")?;
        }
        if let Some(active) = patch.is_active {
            tx.execute(
                "UPDATE users SET is_active = ?1, updated_at = datetime('now') WHERE id = ?2",
                params![active as i64, id],
            )
            .context("Failed to update user is_active")?;
        }

        tx.commit().context("Failed to commit user update")?;
        self.get_user(id)
    }

    // ── Issue CRUD ────────────────────────────────────────────────────

    pub fn create_issue(&self, new: &NewIssue) -> Result<Issue> {
        self.conn
            .execute(
                "INSERT INTO issues (title, description, severity, tags, file_path, file_name, reporter_id)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    new.title,
                    new.description,
                    new.severity.as_str(),
                    new.tags,
                    new.file_path,
                    new.file_name,
                    new.reporter_id
                ],
            )
            .context("Failed to insert issue")?;
        let id = self.conn.last_insert_rowid();
        self.get_issue(id)?.context("Issue not found after insert")
    }

    pub fn get_issue(&self, id: i64) -> Result<Option<Issue>> {
        let mut stmt = self
            .conn
            .prepare(&format!("{} WHERE id = ?1", ISSUE_SELECT))
            .context("Failed to prepare get_issue")?;
        let mut rows = stmt
            .query_map(params![id], issue_row)
            .context("Failed to query issue")?;
        match rows.next() {
            Some(row) => Ok(Some(row.context("Failed to read issue row")?.into_issue()?)),
            None => Ok(None),
        }
    }

    /// List issues matching the filter, newest first, plus the total count
    /// before pagination.
    pub fn list_issues(&self, filter: &IssueFilter) -> Result<(Vec<Issue>, i64)> {
        let (where_sql, values) = filter.where_clause();

        let total: i64 = self
            .conn
            .query_row(
                &format!("SELECT COUNT(*) FROM issues{}", where_sql),
                params_from_iter(values.iter().map(|v| v.as_ref())),
                |row| row.get(0),
            )
            .context("Failed to count issues")?;

        let sql = format!(
            "{}{} ORDER BY created_at DESC, id DESC LIMIT ?{} OFFSET ?{}",
            ISSUE_SELECT,
            where_sql,
            values.len() + 1,
            values.len() + 2
        );
        let mut page_values = values;
        page_values.push(Box::new(filter.limit));
        page_values.push(Box::new(filter.skip));

        let mut stmt = self
            .conn
            .prepare(&sql)
            .context("Failed to prepare list_issues")?;
        let rows = stmt
            .query_map(
                params_from_iter(page_values.iter().map(|v| v.as_ref())),
                issue_row,
            )
            .context("Failed to query issues")?;
        let mut issues = Vec::new();
        for row in rows {
            issues.push(row.context("Failed to read issue row")?.into_issue()?);
        }
        Ok((issues, total))
    }

    /// Apply a partial update. Returns `None` when the issue does not exist.
    /// `reporter_id` is never updatable.
    pub fn update_issue(&self, id: i64, patch: &IssuePatch) -> Result<Option<Issue>> {
        if self.get_issue(id)?.is_none() {
            return Ok(None);
        }

        let tx = self
            .conn
            .unchecked_transaction()
            .context("Failed to begin transaction")?;

        if let Some(t) = &patch.title {
            tx.execute(
                "UPDATE issues SET title = ?1, updated_at = datetime('now') WHERE id = ?2",
                params![t, id],
            )
            .context("Failed to update issue title")?;
        }
        if let Some(d) = &patch.description {
            tx.execute(
                "UPDATE issues SET description = ?1, updated_at = datetime('now') WHERE id = ?2",
                params![d, id],
            )
            .context("Failed to update issue description")?;
        }
        if let Some(s) = patch.severity {
            tx.execute(
                "UPDATE issues SET severity = ?1, updated_at = datetime('now') WHERE id = ?2",
                params![s.as_str(), id],
            )
            .context("Failed to update issue severity")?;
        }
        if let Some(s) = patch.status {
            tx.execute(
                "UPDATE issues SET status = ?1, updated_at = datetime('now') WHERE id = ?2",
                params![s.as_str(), id],
            )
            .context("Failed to update issue status")?;
        }
        if let Some(t) = &patch.tags {
            tx.execute(
                "UPDATE issues SET tags = ?1, updated_at = datetime('now') WHERE id = ?2",
                params![t, id],
            )
            .context("Failed to update issue tags")?;
        }
        if let Some(assignee) = patch.assignee_id {
            tx.execute(
                "UPDATE issues SET assignee_id = ?1, updated_at = datetime('now') WHERE id = ?2",
                params![assignee, id],
            )
            .context("Failed to update issue assignee")?;
        }

        tx.commit().context("Failed to commit issue update")?;
        self.get_issue(id)
    }

    /// Delete an issue, returning the deleted row so callers can clean up
    /// attachments and announce the deletion. `None` when it did not exist.
    pub fn delete_issue(&self, id: i64) -> Result<Option<Issue>> {
        let issue = match self.get_issue(id)? {
            Some(i) => i,
            None => return Ok(None),
        };
        self.conn
            .execute("DELETE FROM issues WHERE id = ?1", params![id])
            .context("Failed to delete issue")?;
        Ok(Some(issue))
    }

    /// Active maintainers and admins together with how many unresolved
    /// issues each currently has assigned. Input for assignee suggestions.
    pub fn assignment_candidates(&self) -> Result<Vec<(User, i64)>> {
        let mut stmt = self
            .conn
            .prepare(&format!(
                "{}, (SELECT COUNT(*) FROM issues
                      WHERE assignee_id = users.id AND status != 'DONE')
                 FROM users
                 WHERE is_active = 1 AND role IN ('MAINTAINER', 'ADMIN')
                 ORDER BY id",
                USER_COLUMNS
            ))
            .context("Failed to prepare assignment_candidates")?;
        let rows = stmt
            .query_map([], |row| Ok((user_row(row)?, row.get::<_, i64>(7)?)))
            .context("Failed to query assignment candidates")?;
        let mut candidates = Vec::new();
        for row in rows {
            let (r, open_assigned) = row.context("Failed to read candidate row")?;
            candidates.push((r.into_user()?, open_assigned));
        }
        Ok(candidates)
    }

    // ── Dashboard queries ─────────────────────────────────────────────

    /// Aggregate counts plus the most recently touched issues. When
    /// `reporter_scope` is set, every aggregation is restricted to that
    /// reporter's issues.
    pub fn dashboard_stats(&self, reporter_scope: Option<i64>) -> Result<DashboardStats> {
        let (scope_sql, scope_and_sql) = match reporter_scope {
            Some(_) => (" WHERE reporter_id = ?1", " AND reporter_id = ?1"),
            None => ("", ""),
        };
        let scope_params: Vec<Box<dyn ToSql>> = match reporter_scope {
            Some(id) => vec![Box::new(id)],
            None => vec![],
        };
        let bind = || params_from_iter(scope_params.iter().map(|v| v.as_ref()));

        let total_issues: i64 = self
            .conn
            .query_row(
                &format!("SELECT COUNT(*) FROM issues{}", scope_sql),
                bind(),
                |row| row.get(0),
            )
            .context("Failed to count issues")?;

        let mut by_status: HashMap<String, i64> = HashMap::new();
        let mut stmt = self
            .conn
            .prepare(&format!(
                "SELECT status, COUNT(*) FROM issues{} GROUP BY status",
                scope_sql
            ))
            .context("Failed to prepare status counts")?;
        let rows = stmt
            .query_map(bind(), |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
            })
            .context("Failed to query status counts")?;
        for row in rows {
            let (status, count) = row.context("Failed to read status count row")?;
            by_status.insert(status, count);
        }
        let count_for = |s: IssueStatus| by_status.get(s.as_str()).copied().unwrap_or(0);

        // Severity counts cover unresolved issues only.
        let mut issues_by_severity = std::collections::BTreeMap::new();
        for severity in IssueSeverity::ALL {
            issues_by_severity.insert(severity.as_str().to_string(), 0);
        }
        let mut stmt = self
            .conn
            .prepare(&format!(
                "SELECT severity, COUNT(*) FROM issues WHERE status != 'DONE'{} GROUP BY severity",
                scope_and_sql
            ))
            .context("Failed to prepare severity counts")?;
        let rows = stmt
            .query_map(bind(), |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
            })
            .context("Failed to query severity counts")?;
        for row in rows {
            let (severity, count) = row.context("Failed to read severity count row")?;
            issues_by_severity.insert(severity, count);
        }

        let mut stmt = self
            .conn
            .prepare(&format!(
                "{}{} ORDER BY updated_at DESC, id DESC LIMIT 10",
                ISSUE_SELECT, scope_sql
            ))
            .context("Failed to prepare recent activity")?;
        let rows = stmt
            .query_map(bind(), issue_row)
            .context("Failed to query recent activity")?;
        let mut recent_activity = Vec::new();
        for row in rows {
            recent_activity.push(row.context("Failed to read issue row")?.into_issue()?);
        }

        Ok(DashboardStats {
            total_issues,
            open_issues: count_for(IssueStatus::Open),
            triaged_issues: count_for(IssueStatus::Triaged),
            in_progress_issues: count_for(IssueStatus::InProgress),
            done_issues: count_for(IssueStatus::Done),
            issues_by_severity,
            recent_activity,
        })
    }

    /// Per-day created/resolved counts for the trailing `days` calendar days
    /// (today included), oldest first, zero-filled for quiet days. Resolved
    /// means moved to DONE, bucketed by the day of the last update.
    pub fn daily_counts(&self, days: i64, reporter_scope: Option<i64>) -> Result<Vec<DailyStat>> {
        let today = chrono::Utc::now().date_naive();
        let start = today - chrono::Duration::days(days - 1);
        let start_str = start.format("%Y-%m-%d").to_string();

        let (scope_and_sql, scope_params): (&str, Vec<Box<dyn ToSql>>) = match reporter_scope {
            Some(id) => (" AND reporter_id = ?2", vec![Box::new(id)]),
            None => ("", vec![]),
        };

        let bucket = |column: &str, status_filter: &str| -> Result<HashMap<String, i64>> {
            let sql = format!(
                "SELECT date({col}), COUNT(*) FROM issues
                 WHERE date({col}) >= ?1{status}{scope}
                 GROUP BY date({col})",
                col = column,
                status = status_filter,
                scope = scope_and_sql
            );
            let mut stmt = self.conn.prepare(&sql).context("Failed to prepare daily counts")?;
            let mut values: Vec<&dyn ToSql> = vec![&start_str];
            for v in &scope_params {
                values.push(v.as_ref());
            }
            let rows = stmt
                .query_map(params_from_iter(values), |row| {
                    Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
                })
                .context("Failed to query daily counts")?;
            let mut map = HashMap::new();
            for row in rows {
                let (date, count) = row.context("Failed to read daily count row")?;
                map.insert(date, count);
            }
            Ok(map)
        };

        let created = bucket("created_at", "")?;
        let resolved = bucket("updated_at", " AND status = 'DONE'")?;

        let mut stats = Vec::with_capacity(days as usize);
        for offset in (0..days).rev() {
            let date = (today - chrono::Duration::days(offset))
                .format("%Y-%m-%d")
                .to_string();
            stats.push(DailyStat {
                created_count: created.get(&date).copied().unwrap_or(0),
                resolved_count: resolved.get(&date).copied().unwrap_or(0),
                date,
            });
        }
        Ok(stats)
    }
}

// ── Internal row helpers ──────────────────────────────────────────────

const USER_COLUMNS: &str =
    "SELECT id, email, full_name, role, is_active, created_at, updated_at";
const USER_SELECT: &str =
    "SELECT id, email, full_name, role, is_active, created_at, updated_at FROM users";
const ISSUE_SELECT: &str = "SELECT id, title, description, severity, status, tags, file_path, file_name, reporter_id, assignee_id, created_at, updated_at FROM issues";

/// Intermediate row struct for reading users from SQLite before converting
/// the role string into a typed value.
struct UserRow {
    id: i64,
    email: String,
    full_name: String,
    role: String,
    is_active: i64,
    created_at: String,
    updated_at: String,
}

fn user_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<UserRow> {
    Ok(UserRow {
        id: row.get(0)?,
        email: row.get(1)?,
        full_name: row.get(2)?,
        role: row.get(3)?,
        is_active: row.get(4)?,
        created_at: row.get(5)?,
        updated_at: row.get(6)?,
    })
}

impl UserRow {
    fn into_user(self) -> Result<User> {
        let role = Role::from_str(&self.role)
            .map_err(|e| anyhow::anyhow!(e))
            .context("Failed to parse user role")?;
        Ok(User {
            id: self.id,
            email: self.email,
            full_name: self.full_name,
            role,
            is_active: self.is_active != 0,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

/// Intermediate row struct for issues.
struct IssueRow {
    id: i64,
    title: String,
    description: String,
    severity: String,
    status: String,
    tags: Option<String>,
    file_path: Option<String>,
    file_name: Option<String>,
    reporter_id: i64,
    assignee_id: Option<i64>,
    created_at: String,
    updated_at: String,
}

fn issue_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<IssueRow> {
    Ok(IssueRow {
        id: row.get(0)?,
        title: row.get(1)?,
        description: row.get(2)?,
        severity: row.get(3)?,
        status: row.get(4)?,
        tags: row.get(5)?,
        file_path: row.get(6)?,
        file_name: row.get(7)?,
        reporter_id: row.get(8)?,
        assignee_id: row.get(9)?,
        created_at: row.get(10)?,
        updated_at: row.get(11)?,
    })
}

impl IssueRow {
    fn into_issue(self) -> Result<Issue> {
        let severity = IssueSeverity::from_str(&self.severity)
            .map_err(|e| anyhow::anyhow!(e))
            .context("Failed to parse issue severity")?;
        let status = IssueStatus::from_str(&self.status)
            .map_err(|e| anyhow::anyhow!(e))
            .context("Failed to parse issue status")?;
        Ok(Issue {
            id: self.id,
            title: self.title,
            description: self.description,
            severity,
            status,
            tags: self.tags,
            file_path: self.file_path,
            file_name: self.file_name,
            reporter_id: self.reporter_id,
            assignee_id: self.assignee_id,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

// ── Tests ─────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn test_db() -> TrackerDb {
        TrackerDb::new_in_memory().unwrap()
    }

    fn add_user(db: &TrackerDb, email: &str, role: Role) -> User {
        db.create_user(email, "hash", "Test User", role)
            .unwrap()
            .expect("email should be free")
    }

    fn add_issue(db: &TrackerDb, title: &str, reporter_id: i64) -> Issue {
        db.create_issue(&NewIssue {
            title: title.to_string(),
            description: format!("{} description", title),
            severity: IssueSeverity::Medium,
            tags: None,
            file_path: None,
            file_name: None,
            reporter_id,
        })
        .unwrap()
    }

    #[test]
    fn test_migrations_create_tables() -> Result<()> {
        let db = test_db();
        let table_count: i32 = db.conn.query_row(
            "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name IN ('users', 'issues')",
            [],
            |row| row.get(0),
        )?;
        assert_eq!(table_count, 2, "Expected both tables to exist");
        Ok(())
    }

    #[test]
    fn test_create_user_and_fetch() {
        let db = test_db();
        let user = add_user(&db, "a@example.com", Role::Reporter);
        assert!(user.id > 0);
        assert!(user.is_active);
        assert_eq!(user.role, Role::Reporter);

        let fetched = db.get_user(user.id).unwrap().expect("user should exist");
        assert_eq!(fetched.email, "a@example.com");
    }

    #[test]
    fn test_duplicate_email_returns_none() {
        let db = test_db();
        add_user(&db, "dup@example.com", Role::Reporter);
        let second = db
            .create_user("dup@example.com", "other", "Other", Role::Admin)
            .unwrap();
        assert!(second.is_none());
    }

    #[test]
    fn test_get_user_auth_returns_hash() {
        let db = test_db();
        add_user(&db, "login@example.com", Role::Maintainer);
        let (user, hash) = db
            .get_user_auth("login@example.com")
            .unwrap()
            .expect("user should exist");
        assert_eq!(user.email, "login@example.com");
        assert_eq!(hash, "hash");
        assert!(db.get_user_auth("missing@example.com").unwrap().is_none());
    }

    #[test]
    fn test_update_user_role_and_deactivate() {
        let db = test_db();
        let user = add_user(&db, "promote@example.com", Role::Reporter);
        let updated = db
            .update_user(
                user.id,
                &UserPatch {
                    role: Some(Role::Maintainer),
                    is_active: Some(false),
                    ..Default::default()
                },
            )
            .unwrap()
            .expect("user should exist");
        assert_eq!(updated.role, Role::Maintainer);
        assert!(!updated.is_active);

        assert!(db.update_user(9999, &UserPatch::default()).unwrap().is_none());
    }

    #[test]
    fn test_create_issue_defaults() {
        let db = test_db();
        let reporter = add_user(&db, "r@example.com", Role::Reporter);
        let issue = add_issue(&db, "Broken login", reporter.id);
        assert!(issue.id > 0);
        assert_eq!(issue.status, IssueStatus::Open);
        assert_eq!(issue.severity, IssueSeverity::Medium);
        assert_eq!(issue.reporter_id, reporter.id);
        assert!(issue.assignee_id.is_none());
        assert!(!issue.created_at.is_empty());
    }

    #[test]
    fn test_list_issues_filters_by_reporter_and_status() {
        let db = test_db();
        let a = add_user(&db, "a@example.com", Role::Reporter);
        let b = add_user(&db, "b@example.com", Role::Reporter);
        let i1 = add_issue(&db, "one", a.id);
        add_issue(&db, "two", a.id);
        add_issue(&db, "three", b.id);
        db.update_issue(
            i1.id,
            &IssuePatch {
                status: Some(IssueStatus::Done),
                ..Default::default()
            },
        )
        .unwrap();

        let (mine, total) = db
            .list_issues(&IssueFilter {
                reporter_id: Some(a.id),
                skip: 0,
                limit: 50,
                ..Default::default()
            })
            .unwrap();
        assert_eq!(total, 2);
        assert_eq!(mine.len(), 2);
        assert!(mine.iter().all(|i| i.reporter_id == a.id));

        let (done, total) = db
            .list_issues(&IssueFilter {
                status: Some(IssueStatus::Done),
                skip: 0,
                limit: 50,
                ..Default::default()
            })
            .unwrap();
        assert_eq!(total, 1);
        assert_eq!(done[0].id, i1.id);
    }

    #[test]
    fn test_list_issues_search_is_case_insensitive() {
        let db = test_db();
        let r = add_user(&db, "r@example.com", Role::Reporter);
        add_issue(&db, "Crash on UPLOAD", r.id);
        add_issue(&db, "Slow dashboard", r.id);

        let (hits, total) = db
            .list_issues(&IssueFilter {
                search: Some("upload".to_string()),
                skip: 0,
                limit: 50,
                ..Default::default()
            })
            .unwrap();
        assert_eq!(total, 1);
        assert_eq!(hits[0].title, "Crash on UPLOAD");
    }

    #[test]
    fn test_list_issues_pagination_keeps_total() {
        let db = test_db();
        let r = add_user(&db, "r@example.com", Role::Reporter);
        for n in 0..7 {
            add_issue(&db, &format!("issue {}", n), r.id);
        }
        let (page, total) = db
            .list_issues(&IssueFilter {
                skip: 5,
                limit: 3,
                ..Default::default()
            })
            .unwrap();
        assert_eq!(total, 7);
        assert_eq!(page.len(), 2);
    }

    #[test]
    fn test_update_issue_patch_and_assignee_clear() {
        let db = test_db();
        let r = add_user(&db, "r@example.com", Role::Reporter);
        let m = add_user(&db, "m@example.com", Role::Maintainer);
        let issue = add_issue(&db, "needs triage", r.id);

        let updated = db
            .update_issue(
                issue.id,
                &IssuePatch {
                    status: Some(IssueStatus::Triaged),
                    severity: Some(IssueSeverity::High),
                    assignee_id: Some(Some(m.id)),
                    ..Default::default()
                },
            )
            .unwrap()
            .expect("issue should exist");
        assert_eq!(updated.status, IssueStatus::Triaged);
        assert_eq!(updated.severity, IssueSeverity::High);
        assert_eq!(updated.assignee_id, Some(m.id));
        assert_eq!(updated.reporter_id, r.id);

        let cleared = db
            .update_issue(
                issue.id,
                &IssuePatch {
                    assignee_id: Some(None),
                    ..Default::default()
                },
            )
            .unwrap()
            .unwrap();
        assert!(cleared.assignee_id.is_none());

        assert!(db.update_issue(9999, &IssuePatch::default()).unwrap().is_none());
    }

    #[test]
    fn test_all_status_transitions_accepted() {
        let db = test_db();
        let r = add_user(&db, "r@example.com", Role::Reporter);
        let issue = add_issue(&db, "status walk", r.id);

        for from in IssueStatus::ALL {
            for to in IssueStatus::ALL {
                db.update_issue(
                    issue.id,
                    &IssuePatch {
                        status: Some(from),
                        ..Default::default()
                    },
                )
                .unwrap();
                let moved = db
                    .update_issue(
                        issue.id,
                        &IssuePatch {
                            status: Some(to),
                            ..Default::default()
                        },
                    )
                    .unwrap()
                    .unwrap();
                assert_eq!(moved.status, to, "{} -> {}", from, to);
            }
        }
    }

    #[test]
    fn test_delete_issue_returns_row() {
        let db = test_db();
        let r = add_user(&db, "r@example.com", Role::Reporter);
        let issue = add_issue(&db, "short lived", r.id);

        let deleted = db.delete_issue(issue.id).unwrap().expect("row returned");
        assert_eq!(deleted.id, issue.id);
        assert!(db.get_issue(issue.id).unwrap().is_none());
        assert!(db.delete_issue(issue.id).unwrap().is_none());
    }

    #[test]
    fn test_dashboard_stats_counts_and_severity_excludes_done() {
        let db = test_db();
        let r = add_user(&db, "r@example.com", Role::Reporter);
        let i1 = add_issue(&db, "one", r.id);
        let i2 = add_issue(&db, "two", r.id);
        add_issue(&db, "three", r.id);
        db.update_issue(
            i1.id,
            &IssuePatch {
                status: Some(IssueStatus::Done),
                severity: Some(IssueSeverity::Critical),
                ..Default::default()
            },
        )
        .unwrap();
        db.update_issue(
            i2.id,
            &IssuePatch {
                severity: Some(IssueSeverity::High),
                ..Default::default()
            },
        )
        .unwrap();

        let stats = db.dashboard_stats(None).unwrap();
        assert_eq!(stats.total_issues, 3);
        assert_eq!(stats.open_issues, 2);
        assert_eq!(stats.done_issues, 1);
        // The CRITICAL issue is DONE, so it does not appear here.
        assert_eq!(stats.issues_by_severity["CRITICAL"], 0);
        assert_eq!(stats.issues_by_severity["HIGH"], 1);
        assert_eq!(stats.issues_by_severity["MEDIUM"], 1);
        assert_eq!(stats.issues_by_severity["LOW"], 0);
        assert!(stats.recent_activity.len() <= 10);
        assert!(!stats.recent_activity.is_empty());
    }

    #[test]
    fn test_dashboard_stats_reporter_scope() {
        let db = test_db();
        let a = add_user(&db, "a@example.com", Role::Reporter);
        let b = add_user(&db, "b@example.com", Role::Reporter);
        add_issue(&db, "mine", a.id);
        add_issue(&db, "theirs", b.id);
        add_issue(&db, "also theirs", b.id);

        let scoped = db.dashboard_stats(Some(a.id)).unwrap();
        assert_eq!(scoped.total_issues, 1);
        assert_eq!(scoped.recent_activity.len(), 1);
        assert_eq!(scoped.recent_activity[0].reporter_id, a.id);
    }

    #[test]
    fn test_assignment_candidates_workload_and_filtering() {
        let db = test_db();
        let r = add_user(&db, "r@example.com", Role::Reporter);
        let m = add_user(&db, "m@example.com", Role::Maintainer);
        let a = add_user(&db, "a@example.com", Role::Admin);
        let inactive = add_user(&db, "gone@example.com", Role::Maintainer);
        db.update_user(
            inactive.id,
            &UserPatch {
                is_active: Some(false),
                ..Default::default()
            },
        )
        .unwrap();

        let i1 = add_issue(&db, "one", r.id);
        let i2 = add_issue(&db, "two", r.id);
        db.update_issue(
            i1.id,
            &IssuePatch {
                assignee_id: Some(Some(m.id)),
                ..Default::default()
            },
        )
        .unwrap();
        // A resolved issue no longer counts toward workload.
        db.update_issue(
            i2.id,
            &IssuePatch {
                assignee_id: Some(Some(m.id)),
                status: Some(IssueStatus::Done),
                ..Default::default()
            },
        )
        .unwrap();

        let candidates = db.assignment_candidates().unwrap();
        let ids: Vec<i64> = candidates.iter().map(|(u, _)| u.id).collect();
        assert_eq!(ids, vec![m.id, a.id]);
        assert_eq!(candidates[0].1, 1);
        assert_eq!(candidates[1].1, 0);
    }

    #[test]
    fn test_daily_counts_zero_filled_oldest_first() {
        let db = test_db();
        let r = add_user(&db, "r@example.com", Role::Reporter);
        let issue = add_issue(&db, "today", r.id);
        db.update_issue(
            issue.id,
            &IssuePatch {
                status: Some(IssueStatus::Done),
                ..Default::default()
            },
        )
        .unwrap();

        let stats = db.daily_counts(7, None).unwrap();
        assert_eq!(stats.len(), 7);
        for pair in stats.windows(2) {
            assert!(pair[0].date < pair[1].date);
        }
        // Everything happened "now", so only the last (today) bucket is hot.
        let today = stats.last().unwrap();
        assert_eq!(today.created_count, 1);
        assert_eq!(today.resolved_count, 1);
        assert!(stats[..6].iter().all(|s| s.created_count == 0 && s.resolved_count == 0));
    }

    #[test]
    fn test_issue_patch_field_names() {
        let patch = IssuePatch {
            title: Some("t".to_string()),
            status: Some(IssueStatus::Done),
            ..Default::default()
        };
        assert_eq!(patch.field_names(), vec!["title", "status"]);
        assert!(IssuePatch::default().field_names().is_empty());
    }
}
