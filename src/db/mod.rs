//! Persistent store: users and access-control policies, backed by two CSV
//! tables under `<root>/.fly`, guarded by a single reader/writer lock.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tokio::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

const VERSION: &str = "1";

#[derive(Debug, Error)]
pub enum Error {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("csv error: {0}")]
    Csv(#[from] csv::Error),
    #[error("corrupted FlyDB table: {0}")]
    Corrupt(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("already exists: {0}")]
    Exists(String),
    #[error("unexpected FlyDB version: {0}")]
    Version(String),
}

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct User {
    pub username: String,
    /// bcrypt hash, stored verbatim as it appears in the CSV column.
    pub password: String,
    pub chroot: String,
    pub admin: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verb {
    Allow,
    Deny,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Read,
    Write,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Policy {
    pub name: String,
    pub verb: Verb,
    pub action: Action,
    /// Empty means "all users" (written as `*`).
    pub users: Vec<String>,
    pub paths: Vec<String>,
}

struct Inner {
    dir: PathBuf,
    users: HashMap<String, User>,
    policies: HashMap<String, Policy>,
}

pub struct Handle {
    inner: RwLock<Inner>,
}

pub struct Txn<'a> {
    guard: RwLockWriteGuard<'a, Inner>,
}

pub struct RTxn<'a> {
    guard: RwLockReadGuard<'a, Inner>,
}

fn validate_username(username: &str) -> bool {
    let mut chars = username.chars();
    let first_ok = matches!(chars.next(), Some(c) if c == '_' || c.is_ascii_lowercase());
    if !first_ok || username.len() > 32 {
        return false;
    }
    username
        .chars()
        .skip(1)
        .all(|c| c == '_' || c == '-' || c.is_ascii_lowercase() || c.is_ascii_digit())
}

pub fn validate_username_pub(username: &str) -> bool {
    validate_username(username)
}

impl Handle {
    pub async fn open(dir: impl Into<PathBuf>) -> Result<Handle> {
        let dir = dir.into();
        let fly_dir = dir.join(".fly");
        let version_path = fly_dir.join("version");

        if version_path.exists() {
            let version = tokio::fs::read_to_string(&version_path).await?;
            if version.trim() != VERSION {
                return Err(Error::Version(version.trim().to_string()));
            }

            let users = read_users(&dir).await?;
            let policies = read_policies(&dir).await?;

            Ok(Handle { inner: RwLock::new(Inner { dir, users, policies }) })
        } else {
            tokio::fs::create_dir_all(&fly_dir).await?;
            tokio::fs::write(&version_path, format!("{VERSION}\n")).await?;

            let inner = Inner { dir, users: HashMap::new(), policies: HashMap::new() };
            write_users(&inner.dir, &inner.users).await?;
            write_policies(&inner.dir, &inner.policies).await?;

            Ok(Handle { inner: RwLock::new(inner) })
        }
    }

    pub async fn txn(&self) -> Txn<'_> {
        Txn { guard: self.inner.write().await }
    }

    pub async fn rtxn(&self) -> RTxn<'_> {
        RTxn { guard: self.inner.read().await }
    }
}

impl<'a> RTxn<'a> {
    pub fn find_user(&self, username: &str) -> Option<User> {
        self.guard.users.get(username).cloned()
    }

    pub fn num_users(&self) -> usize {
        self.guard.users.len()
    }

    pub fn fetch_all_users(&self) -> Vec<User> {
        self.guard.users.values().cloned().collect()
    }

    pub fn fetch_all_policies(&self) -> Vec<Policy> {
        self.guard.policies.values().cloned().collect()
    }

    /// Policies that govern `path` for `username` under `action`, matching
    /// by path prefix and explicit user membership (or wildcard).
    pub fn get_policies(&self, path: &str, username: &str, action: Action) -> Vec<Policy> {
        self.guard
            .policies
            .values()
            .filter(|p| matches_policy(path, username, action, p))
            .cloned()
            .collect()
    }
}

impl<'a> Txn<'a> {
    pub fn find_user(&self, username: &str) -> Option<User> {
        self.guard.users.get(username).cloned()
    }

    pub fn num_users(&self) -> usize {
        self.guard.users.len()
    }

    pub async fn add_user(&mut self, user: User) -> Result<()> {
        if self.guard.users.contains_key(&user.username) {
            return Err(Error::Exists(user.username));
        }
        self.guard.users.insert(user.username.clone(), user);
        write_users(&self.guard.dir, &self.guard.users).await
    }

    pub async fn update_user(&mut self, username: &str, f: impl FnOnce(&mut User)) -> Result<()> {
        let user = self
            .guard
            .users
            .get_mut(username)
            .ok_or_else(|| Error::NotFound(username.to_string()))?;
        f(user);
        write_users(&self.guard.dir, &self.guard.users).await
    }

    pub async fn delete_user(&mut self, username: &str) -> Result<()> {
        if self.guard.users.remove(username).is_none() {
            return Err(Error::NotFound(username.to_string()));
        }
        write_users(&self.guard.dir, &self.guard.users).await
    }

    pub async fn put_access_policy(&mut self, policy: Policy) -> Result<()> {
        self.guard.policies.insert(policy.name.clone(), policy);
        write_policies(&self.guard.dir, &self.guard.policies).await
    }

    pub async fn delete_access_policy(&mut self, name: &str) -> Result<()> {
        if self.guard.policies.remove(name).is_none() {
            return Err(Error::NotFound(name.to_string()));
        }
        write_policies(&self.guard.dir, &self.guard.policies).await
    }

    pub fn fetch_all_policies(&self) -> Vec<Policy> {
        self.guard.policies.values().cloned().collect()
    }
}

fn matches_policy(path: &str, username: &str, action: Action, policy: &Policy) -> bool {
    policy.action == action && matches_path(path, policy) && matches_user(username, policy)
}

fn matches_path(path: &str, policy: &Policy) -> bool {
    policy.paths.iter().any(|prefix| path.starts_with(prefix.as_str()))
}

/// An empty `users` list means the policy applies to every user, matching
/// the `*` wildcard the CSV table writes for unrestricted rules.
fn matches_user(username: &str, policy: &Policy) -> bool {
    policy.users.is_empty() || policy.users.iter().any(|u| u == username)
}

async fn read_users(dir: &Path) -> Result<HashMap<String, User>> {
    let path = dir.join(".fly/users.csv");
    let text = tokio::fs::read_to_string(&path).await?;
    let mut reader = csv::ReaderBuilder::new().has_headers(true).from_reader(text.as_bytes());
    let mut users = HashMap::new();

    for record in reader.records() {
        let record = record?;
        if record.len() != 4 {
            return Err(Error::Corrupt(format!("expected 4 fields, got {}", record.len())));
        }

        let username = record[0].to_string();
        if !validate_username(&username) {
            return Err(Error::Corrupt(format!("invalid username: {username}")));
        }

        let admin = match &record[3] {
            "0" => false,
            "1" => true,
            other => return Err(Error::Corrupt(format!("invalid admin bit: {other}"))),
        };

        users.insert(
            username.clone(),
            User { username, password: record[1].to_string(), chroot: record[2].to_string(), admin },
        );
    }

    Ok(users)
}

async fn write_users(dir: &Path, users: &HashMap<String, User>) -> Result<()> {
    let tmp_path = dir.join(".fly/users.csv~");
    let final_path = dir.join(".fly/users.csv");

    let mut writer = csv::Writer::from_writer(vec![]);
    writer.write_record(["username", "password", "chroot", "admin"])?;
    for user in users.values() {
        writer.write_record([
            user.username.as_str(),
            user.password.as_str(),
            user.chroot.as_str(),
            if user.admin { "1" } else { "0" },
        ])?;
    }
    let bytes = writer.into_inner().map_err(|e| Error::Csv(e.into_error()))?;

    tokio::fs::write(&tmp_path, bytes).await?;
    tokio::fs::rename(&tmp_path, &final_path).await?;
    Ok(())
}

async fn read_policies(dir: &Path) -> Result<HashMap<String, Policy>> {
    let path = dir.join(".fly/acp.csv");
    let text = tokio::fs::read_to_string(&path).await?;
    let mut reader = csv::ReaderBuilder::new().has_headers(true).from_reader(text.as_bytes());
    let mut policies = HashMap::new();

    for (line_num, record) in reader.records().enumerate() {
        let record = record?;
        if record.len() != 5 {
            return Err(Error::Corrupt(format!("expected 5 fields at line {}", line_num + 1)));
        }

        let name = record[0].trim();
        if name.is_empty() {
            return Err(Error::Corrupt(format!("missing ACP name at line {}", line_num + 1)));
        }

        let verb = match &record[1] {
            "ALLOW" => Verb::Allow,
            "DENY" => Verb::Deny,
            other => return Err(Error::Corrupt(format!("invalid verb {other} at line {}", line_num + 1))),
        };

        let action = match &record[2] {
            "R" => Action::Read,
            "W" => Action::Write,
            other => return Err(Error::Corrupt(format!("invalid action {other} at line {}", line_num + 1))),
        };

        let users = parse_policy_users(&record[3]);
        let paths = parse_policy_paths(&record[4], line_num + 1)?;

        policies.insert(name.to_string(), Policy { name: name.to_string(), verb, action, users, paths });
    }

    Ok(policies)
}

async fn write_policies(dir: &Path, policies: &HashMap<String, Policy>) -> Result<()> {
    let tmp_path = dir.join(".fly/acp.csv~");
    let final_path = dir.join(".fly/acp.csv");

    let mut writer = csv::Writer::from_writer(vec![]);
    writer.write_record(["rule", "verb", "action", "users", "paths"])?;
    for policy in policies.values() {
        let user_list = if policy.users.is_empty() { "*".to_string() } else { policy.users.join(":") };
        let verb = match policy.verb {
            Verb::Allow => "ALLOW",
            Verb::Deny => "DENY",
        };
        let action = match policy.action {
            Action::Read => "R",
            Action::Write => "W",
        };
        let paths = policy.paths.iter().map(|p| sanitize_path(p)).collect::<Vec<_>>().join(":");

        writer.write_record([policy.name.as_str(), verb, action, user_list.as_str(), paths.as_str()])?;
    }
    let bytes = writer.into_inner().map_err(|e| Error::Csv(e.into_error()))?;

    tokio::fs::write(&tmp_path, bytes).await?;
    tokio::fs::rename(&tmp_path, &final_path).await?;
    Ok(())
}

fn sanitize_path(p: &str) -> String {
    p.replace('%', "%25").replace(':', "%3A")
}

fn parse_policy_users(s: &str) -> Vec<String> {
    if s == "*" {
        Vec::new()
    } else {
        s.split(':').map(|s| s.to_string()).collect()
    }
}

fn parse_policy_paths(s: &str, line_num: usize) -> Result<Vec<String>> {
    s.split(':')
        .map(|p| percent_decode(p).ok_or_else(|| Error::Corrupt(format!("invalid path {p} at line {line_num}"))))
        .collect()
}

fn percent_decode(s: &str) -> Option<String> {
    let mut out = String::with_capacity(s.len());
    let mut chars = s.chars();
    while let Some(c) = chars.next() {
        if c == '%' {
            let hi = chars.next()?;
            let lo = chars.next()?;
            let byte = u8::from_str_radix(&format!("{hi}{lo}"), 16).ok()?;
            out.push(byte as char);
        } else {
            out.push(c);
        }
    }
    Some(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validates_usernames() {
        assert!(validate_username("alice"));
        assert!(validate_username("_sys-1"));
        assert!(!validate_username("Alice"));
        assert!(!validate_username("1alice"));
        assert!(!validate_username(""));
    }

    #[test]
    fn wildcard_user_matches_anyone() {
        let policy = Policy {
            name: "p".into(),
            verb: Verb::Allow,
            action: Action::Read,
            users: vec![],
            paths: vec!["/".into()],
        };
        assert!(matches_user("anyone", &policy));
    }

    #[test]
    fn path_prefix_matching() {
        let policy = Policy {
            name: "p".into(),
            verb: Verb::Allow,
            action: Action::Read,
            users: vec![],
            paths: vec!["/public".into()],
        };
        assert!(matches_path("/public/file.txt", &policy));
        assert!(!matches_path("/private/file.txt", &policy));
    }

    #[tokio::test]
    async fn opens_bootstraps_and_persists_users() {
        let tmp = tempfile::tempdir().unwrap();
        let handle = Handle::open(tmp.path()).await.unwrap();

        {
            let mut txn = handle.txn().await;
            txn.add_user(User {
                username: "alice".into(),
                password: "hash".into(),
                chroot: "/".into(),
                admin: true,
            })
            .await
            .unwrap();
        }

        let reopened = Handle::open(tmp.path()).await.unwrap();
        let rtxn = reopened.rtxn().await;
        assert_eq!(rtxn.num_users(), 1);
        assert!(rtxn.find_user("alice").unwrap().admin);
    }
}
