//! The command dispatch table: decodes each incoming command array, checks
//! its own arity and argument types, applies whatever admin/auth
//! precondition it needs, and produces the reply value.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tracing::{debug, error};

use crate::crypto;
use crate::db::{self, Action, Verb};
use crate::session::{CommandHandler, Session, StreamDirection};
use crate::vfs;
use crate::wire::Value;

/// Per-connection state that survives across commands: the authenticated
/// user (if any) and whether the server is still in single-user
/// bootstrap mode.
#[derive(Default)]
pub struct SessionInfo {
    username: Option<String>,
    user: Option<db::User>,
    single_user: bool,
}

pub struct Handler {
    pub db: Arc<db::Handle>,
    pub root: PathBuf,
    pub token_key: Option<[u8; crypto::KEY_LEN]>,
    info: SessionInfo,
}

impl Handler {
    pub fn new(db: Arc<db::Handle>, root: PathBuf, token_key: Option<[u8; crypto::KEY_LEN]>) -> Handler {
        Handler { db, root, token_key, info: SessionInfo::default() }
    }

    async fn update(&mut self) {
        let rtxn = self.db.rtxn().await;
        self.info.single_user = rtxn.num_users() == 0;

        let Some(username) = &self.info.username else { return };

        if rtxn.find_user(username).is_none() {
            self.info.user = None;
            self.info.username = None;
        }
    }

    async fn change_user(&mut self, session: &Arc<Session>, username: &str) {
        let rtxn = self.db.rtxn().await;

        match rtxn.find_user(username) {
            Some(user) => {
                self.info.username = Some(username.to_string());
                self.info.user = Some(user);
            }
            None => {
                error!(username, "tried to change to a non-existing user");
                session.shutdown();
            }
        }
    }

    fn checks_admin(&self) -> bool {
        self.info.user.as_ref().is_some_and(|u| u.admin)
    }

    async fn resolve(&self, vpath: &str, action: Action) -> vfs::Result<PathBuf> {
        if self.info.single_user {
            return vfs::resolve_single_user(vpath, &self.root);
        }

        let user = self.info.user.as_ref().ok_or(vfs::Error::Denied)?;
        let rtxn = self.db.rtxn().await;
        vfs::resolve(vpath, user, action, &rtxn, &self.root)
    }

    async fn dispatch_inner(&mut self, session: &Arc<Session>, name: &str, args: &[Value]) -> Value {
        match name.to_ascii_uppercase().as_str() {
            "PING" => cmd_ping(args),
            "WHOAMI" => cmd_whoami(&self.info),
            "AUTH" => self.cmd_auth(session, args).await,
            "TOKEN" => self.cmd_token(args),
            "MKDIR" => self.cmd_mkdir(args).await,
            "TOUCH" => self.cmd_touch(args).await,
            "DEL" => self.cmd_del(args).await,
            "MOVE" => self.cmd_move(args).await,
            "COPY" => self.cmd_copy(session, args).await,
            "LIST" => self.cmd_list(args).await,
            "STREAM" => self.cmd_stream(session, args).await,
            "CLOSE" => self.cmd_close(session, args).await,
            "LISTUSER" => self.cmd_listuser(args).await,
            "SHOWUSER" => self.cmd_showuser(args).await,
            "ADDUSER" => self.cmd_adduser(session, args).await,
            "RMUSER" => self.cmd_rmuser(args).await,
            "SETPWD" => self.cmd_setpwd(args).await,
            "SETADM" => self.cmd_setadm(args).await,
            "CHROOT" => self.cmd_chroot(args).await,
            "LISTACP" => self.cmd_listacp(args).await,
            "PUTACP" => self.cmd_putacp(args).await,
            "RMACP" => self.cmd_rmacp(args).await,
            other => Value::error("CMD", format!("Unknown command '{other}'")),
        }
    }

    async fn cmd_auth(&mut self, session: &Arc<Session>, args: &[Value]) -> Value {
        let Some(auth_type) = args.first().and_then(Value::as_str) else {
            return arg_error("AUTH", "at least 1 argument");
        };

        match auth_type {
            "PWD" => self.cmd_auth_pwd(session, args).await,
            "TOK" => self.cmd_auth_tok(session, args).await,
            other => Value::error("ARG", format!("Unsupported AUTH type: {other}")),
        }
    }

    async fn cmd_auth_pwd(&mut self, session: &Arc<Session>, args: &[Value]) -> Value {
        if args.len() != 3 {
            return Value::error("ARG", "Password authentication requires a username and a password");
        }
        let (Some(username), Some(password)) = (args[1].as_str(), args[2].as_str()) else {
            return Value::error("ARG", "Username and password must be strings");
        };

        let rtxn = self.db.rtxn().await;
        let ok = rtxn.find_user(username).is_some_and(|u| crypto::verify_password(password, &u.password));
        drop(rtxn);

        if !ok {
            return Value::error("DENIED", "Authentication failed");
        }

        self.change_user(session, username).await;
        Value::ok()
    }

    async fn cmd_auth_tok(&mut self, session: &Arc<Session>, args: &[Value]) -> Value {
        if args.len() != 2 {
            return Value::error("ARG", "Token authentication requires a token");
        }
        let Some(token) = args[1].as_str() else {
            return Value::error("ARG", "Token should be a string");
        };

        let Some(key) = &self.token_key else {
            return Value::error("ERROR", "Token authentication is not supported at this time");
        };

        match verify_token(token, key) {
            Some(username) => {
                self.change_user(session, &username).await;
                Value::ok()
            }
            None => Value::error("DENIED", "Authentication failed"),
        }
    }

    fn cmd_token(&self, _args: &[Value]) -> Value {
        if self.info.single_user {
            return Value::error("ILLEGAL", "Cannot create an authentication token in single-user mode");
        }
        let Some(username) = &self.info.username else {
            return Value::error("DENIED", "Cannot create an authentication token without being authenticated");
        };
        let Some(key) = &self.token_key else {
            return Value::error("ERROR", "Token authentication is not supported at this time");
        };

        let expiry = OffsetDateTime::now_utc() + time::Duration::minutes(5);
        let expiry_text = match expiry.format(&Rfc3339) {
            Ok(t) => t,
            Err(_) => return Value::error("ERROR", "An unexpected error occurred"),
        };

        let payload = Value::Array(vec![Value::Str(username.clone()), Value::Str(expiry_text)]);
        let plaintext = payload.to_bytes();

        match crypto::aes_encrypt(&plaintext, key) {
            Ok(ciphertext) => Value::Str(crypto::encode_token(&ciphertext)),
            Err(_) => Value::error("ERROR", "An unexpected error occurred"),
        }
    }

    async fn cmd_mkdir(&self, args: &[Value]) -> Value {
        let vpath = match single_path_arg(args, "MKDIR") {
            Ok(p) => p,
            Err(e) => return e,
        };

        let real = match self.resolve(&vpath, Action::Write).await {
            Ok(p) => p,
            Err(e) => return vfs_error(e),
        };

        match tokio::fs::create_dir_all(&real).await {
            Ok(()) => Value::ok(),
            Err(err) => {
                debug!(error = %err, "could not create folder");
                Value::error("ERR", "Unexpected error occurred")
            }
        }
    }

    async fn cmd_touch(&self, args: &[Value]) -> Value {
        let vpath = match single_path_arg(args, "TOUCH") {
            Ok(p) => p,
            Err(e) => return e,
        };

        let real = match self.resolve(&vpath, Action::Write).await {
            Ok(p) => p,
            Err(e) => return vfs_error(e),
        };

        if let Err(err) = touch_file(&real).await {
            debug!(error = %err, "could not touch file");
            return Value::error("ERR", "Unexpected error occurred");
        }
        Value::ok()
    }

    async fn cmd_del(&self, args: &[Value]) -> Value {
        let vpath = match single_path_arg(args, "DEL") {
            Ok(p) => p,
            Err(e) => return e,
        };

        let real = match self.resolve(&vpath, Action::Write).await {
            Ok(p) => p,
            Err(e) => return vfs_error(e),
        };

        let meta = match tokio::fs::metadata(&real).await {
            Ok(m) => m,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Value::error("NOTFOUND", "No such file or directory")
            }
            Err(_) => return Value::error("ERR", "Unexpected error occurred"),
        };

        let result = if meta.is_dir() { tokio::fs::remove_dir_all(&real).await } else { tokio::fs::remove_file(&real).await };

        match result {
            Ok(()) => Value::ok(),
            Err(_) => Value::error("ERR", "Unexpected error occurred"),
        }
    }

    async fn cmd_move(&self, args: &[Value]) -> Value {
        if args.len() != 2 {
            return arg_error("MOVE", "exactly 2 arguments");
        }
        let (Some(src_raw), Some(dst_raw)) = (args[0].as_str(), args[1].as_str()) else {
            return Value::error("ARG", "Source and destination should be strings");
        };

        let src = normalize_slashes(src_raw);
        let dst = normalize_slashes(dst_raw);

        let real_src = match self.resolve(&src, Action::Write).await {
            Ok(p) => p,
            Err(e) => return vfs_error(e),
        };
        let real_dst = match self.resolve(&dst, Action::Write).await {
            Ok(p) => p,
            Err(e) => return vfs_error(e),
        };

        match tokio::fs::rename(&real_src, &real_dst).await {
            Ok(()) => Value::ok(),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Value::error("NOTFOUND", "No such file or directory"),
            Err(_) => Value::error("ERR", "Unexpected error occurred"),
        }
    }

    async fn cmd_copy(&self, session: &Arc<Session>, args: &[Value]) -> Value {
        if args.len() != 2 {
            return arg_error("COPY", "exactly 2 arguments");
        }
        let (Some(src_raw), Some(dst_raw)) = (args[0].as_str(), args[1].as_str()) else {
            return Value::error("ARG", "Source and destination should be strings");
        };

        let src = normalize_slashes(src_raw);
        let dst = normalize_slashes(dst_raw);

        let real_src = match self.resolve(&src, Action::Read).await {
            Ok(p) => p,
            Err(e) => return vfs_error(e),
        };
        let real_dst = match self.resolve(&dst, Action::Write).await {
            Ok(p) => p,
            Err(e) => return vfs_error(e),
        };

        let meta = match tokio::fs::metadata(&real_src).await {
            Ok(m) => m,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Value::error("NOTFOUND", "No such file or directory")
            }
            Err(err) => {
                debug!(error = %err, "could not stat file");
                return Value::error("ERROR", "An unexpected error occurred");
            }
        };

        if !meta.is_file() {
            return Value::error("ARG", "Source should be a regular file");
        }

        let dst_tmp = tmp_sibling(&real_dst);
        let direction = StreamDirection::Copy { src: real_src, dst_tmp, dst_final: real_dst };

        match session.open_stream(direction).await {
            Some(id) => Value::Integer(id as i64),
            None => Value::error("TOOMANY", "Too many open streams"),
        }
    }

    async fn cmd_list(&self, args: &[Value]) -> Value {
        let vpath = match single_path_arg(args, "LIST") {
            Ok(p) => p,
            Err(e) => return e,
        };

        let real = match self.resolve(&vpath, Action::Read).await {
            Ok(p) => p,
            Err(e) => return vfs_error(e),
        };

        let meta = match tokio::fs::metadata(&real).await {
            Ok(m) => m,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Value::error("NOTFOUND", "No such file or directory")
            }
            Err(_) => return Value::error("ERR", "Unexpected error occurred"),
        };

        let mut rows = Vec::new();
        let mut cols = 0usize;

        if meta.is_dir() {
            let mut entries = match tokio::fs::read_dir(&real).await {
                Ok(e) => e,
                Err(_) => return Value::error("ERR", "Unexpected error occurred"),
            };

            loop {
                let entry = match entries.next_entry().await {
                    Ok(Some(e)) => e,
                    Ok(None) => break,
                    Err(_) => return Value::error("ERR", "Unexpected error occurred"),
                };
                let full_path = entry.path();
                if is_reserved(&full_path, &self.root) {
                    continue;
                }
                let Ok(info) = entry.metadata().await else {
                    return Value::error("ERR", "Unexpected error occurred");
                };
                if let Some(row) = list_row(&info, &full_path) {
                    Value::table_push_row(&mut cols, &mut rows, row);
                }
            }
        } else if let Some(row) = list_row(&meta, &real) {
            Value::table_push_row(&mut cols, &mut rows, row);
        }

        Value::Table { cols, rows }
    }

    async fn cmd_stream(&self, session: &Arc<Session>, args: &[Value]) -> Value {
        if args.len() != 2 {
            return arg_error("STREAM", "exactly 2 arguments");
        }
        let (Some(mode), Some(raw_path)) = (args[0].as_str(), args[1].as_str()) else {
            return Value::error("ARG", "Mode and path should be strings");
        };

        if mode != "W" && mode != "R" {
            return Value::error("ARG", format!("Unsupported mode: {mode}"));
        }

        let vpath = normalize_slashes(raw_path);
        let writing = mode == "W";
        let action = if writing { Action::Write } else { Action::Read };

        let real = match self.resolve(&vpath, action).await {
            Ok(p) => p,
            Err(e) => return vfs_error(e),
        };

        let direction = if writing {
            StreamDirection::Write { tmp_path: tmp_sibling(&real), final_path: real }
        } else {
            StreamDirection::Read { path: real }
        };

        match session.open_stream(direction).await {
            Some(id) => Value::Integer(id as i64),
            None => Value::error("TOOMANY", "Too many open streams"),
        }
    }

    async fn cmd_close(&self, session: &Arc<Session>, args: &[Value]) -> Value {
        if args.len() != 1 {
            return arg_error("CLOSE", "exactly one argument");
        }
        let Some(id) = args[0].as_integer() else {
            return Value::error("ARG", "Command CLOSE expects an integer as first argument");
        };
        let id = match u32::try_from(id) {
            Ok(id) => id,
            Err(_) => return Value::error("ARG", "Stream is already closed"),
        };

        if session.close_stream(id).await {
            Value::ok()
        } else {
            Value::error("ARG", "Stream is already closed")
        }
    }

    async fn cmd_listuser(&self, _args: &[Value]) -> Value {
        if self.info.single_user {
            return Value::error("ILLEGAL", "Cannot manage users in single-user mode");
        }
        if !self.checks_admin() {
            return Value::error("DENIED", "You are not allowed to manage users");
        }

        let rtxn = self.db.rtxn().await;
        let names = rtxn.fetch_all_users().into_iter().map(|u| Value::Str(u.username)).collect();
        Value::Array(names)
    }

    async fn cmd_showuser(&self, args: &[Value]) -> Value {
        if args.len() != 1 {
            return arg_error("SHOWUSER", "exactly 1 argument");
        }
        let Some(username) = args[0].as_str() else {
            return Value::error("ARG", "Username should be a string");
        };
        if self.info.single_user {
            return Value::error("ILLEGAL", "Cannot manage users in single-user mode");
        }
        if !self.checks_admin() {
            return Value::error("DENIED", "You are not allowed to manage users.");
        }

        let rtxn = self.db.rtxn().await;
        let Some(user) = rtxn.find_user(username) else {
            return Value::error("NOTFOUND", "User not found");
        };

        Value::Map(vec![
            ("username".to_string(), Value::Str(user.username)),
            ("chroot".to_string(), Value::Str(user.chroot)),
            ("admin".to_string(), Value::Bool(user.admin)),
        ])
    }

    async fn cmd_adduser(&mut self, session: &Arc<Session>, args: &[Value]) -> Value {
        if args.len() != 2 {
            return arg_error("ADDUSER", "exactly 2 arguments");
        }
        if !self.info.single_user && !self.checks_admin() {
            return Value::error("DENIED", "You are not allowed to manage users");
        }
        let (Some(username), Some(password)) = (args[0].as_str(), args[1].as_str()) else {
            return Value::error("ARG", "Username and password should be strings");
        };

        if password.is_empty() {
            return Value::error("ARG", "Password cannot be empty");
        }
        if username.is_empty() {
            return Value::error("ARG", "Minimum username length is 1");
        }
        if username.len() > 32 {
            return Value::error("ARG", "Maximum username length is 32");
        }
        if !db::validate_username_pub(username) {
            return Value::error("ARG", "Invalid username");
        }

        let hash = match crypto::hash_password(password) {
            Ok(h) => h,
            Err(err) => {
                error!(%err, "unexpected error while generating hash");
                return Value::error("ERR", "Unexpected error while generating hash");
            }
        };

        let new_user =
            db::User { username: username.to_string(), password: hash, chroot: String::new(), admin: self.info.single_user };

        let mut txn = self.db.txn().await;
        let result = txn.add_user(new_user.clone()).await;
        drop(txn);

        match result {
            Ok(()) => {}
            Err(db::Error::Exists(_)) => return Value::error("EXISTS", "Already exists"),
            Err(err) => panic!("failed to create user: {err}"),
        }

        if self.info.single_user {
            self.change_user(session, &new_user.username).await;
        }

        Value::ok()
    }

    async fn cmd_rmuser(&self, args: &[Value]) -> Value {
        if args.len() != 1 {
            return arg_error("RMUSER", "exactly 1 argument");
        }
        if self.info.single_user {
            return Value::error("ILLEGAL", "Cannot manage users in single-user mode");
        }
        if !self.checks_admin() {
            return Value::error("DENIED", "You are not allowed to manage users.");
        }
        let Some(username) = args[0].as_str() else {
            return Value::error("ARG", "Username should be a string");
        };

        let mut txn = self.db.txn().await;
        match txn.delete_user(username).await {
            Ok(()) => Value::ok(),
            Err(db::Error::NotFound(_)) => Value::error("NOTFOUND", "User not found"),
            Err(err) => panic!("failed to delete user: {err}"),
        }
    }

    async fn cmd_setpwd(&self, args: &[Value]) -> Value {
        if args.len() != 2 {
            return arg_error("SETPWD", "exactly 2 arguments");
        }
        let (Some(username), Some(password)) = (args[0].as_str(), args[1].as_str()) else {
            return Value::error("ARG", "Username and password should be strings");
        };
        if password.is_empty() {
            return Value::error("ARG", "Password cannot be empty");
        }

        let hash = match crypto::hash_password(password) {
            Ok(h) => h,
            Err(err) => {
                error!(%err, "unexpected error while generating hash");
                return Value::error("ERR", "Unexpected error while generating hash");
            }
        };

        if self.info.single_user {
            return Value::error("ILLEGAL", "Cannot manage users in single-user mode");
        }
        let self_service = self.info.username.as_deref() == Some(username);
        if !self_service && !self.checks_admin() {
            return Value::error("DENIED", "You are not allowed to manage users.");
        }

        let mut txn = self.db.txn().await;
        match txn.update_user(username, |u| u.password = hash).await {
            Ok(()) => Value::ok(),
            Err(db::Error::NotFound(_)) => Value::error("NOTFOUND", "User not found"),
            Err(err) => panic!("failed to update user: {err}"),
        }
    }

    async fn cmd_setadm(&self, args: &[Value]) -> Value {
        if args.len() != 2 {
            return arg_error("SETADM", "exactly 2 arguments");
        }
        let Some(username) = args[0].as_str() else {
            return Value::error("ARG", "Username should be a string");
        };
        let admin = match &args[1] {
            Value::Bool(b) => *b,
            other => return Value::error("ARG", format!("Admin bit should be a boolean, got {}", other.name())),
        };

        if self.info.single_user {
            return Value::error("ILLEGAL", "Cannot manage users in single-user mode");
        }
        if !self.checks_admin() {
            return Value::error("DENIED", "You are not allowed to manage users.");
        }

        let mut txn = self.db.txn().await;
        match txn.update_user(username, |u| u.admin = admin).await {
            Ok(()) => Value::ok(),
            Err(db::Error::NotFound(_)) => Value::error("NOTFOUND", "User not found"),
            Err(err) => panic!("failed to update user: {err}"),
        }
    }

    async fn cmd_chroot(&self, args: &[Value]) -> Value {
        if args.len() != 2 {
            return arg_error("CHROOT", "exactly 2 arguments");
        }
        let (Some(username), Some(chroot)) = (args[0].as_str(), args[1].as_str()) else {
            return Value::error("ARG", "Username and chroot path should be strings");
        };

        if self.info.single_user {
            return Value::error("ILLEGAL", "Cannot manage users in single-user mode");
        }
        if !self.checks_admin() {
            return Value::error("DENIED", "You are not allowed to manage users.");
        }

        let real = match vfs::resolve_single_user(chroot, &self.root) {
            Ok(p) => p,
            Err(_) => return Value::error("ARG", "Invalid path"),
        };

        if let Err(err) = tokio::fs::create_dir_all(&real).await {
            debug!(error = %err, "could not create folder");
            return Value::error("ERR", "Unexpected error occurred");
        }

        let mut txn = self.db.txn().await;
        match txn.update_user(username, |u| u.chroot = chroot.to_string()).await {
            Ok(()) => Value::ok(),
            Err(db::Error::NotFound(_)) => Value::error("NOTFOUND", "User not found"),
            Err(err) => panic!("failed to update user: {err}"),
        }
    }

    async fn cmd_listacp(&self, _args: &[Value]) -> Value {
        if self.info.single_user {
            return Value::error("ILLEGAL", "Cannot manage ACPs in single-user mode");
        }
        if !self.checks_admin() {
            return Value::error("DENIED", "You are not allowed to manage users");
        }

        let rtxn = self.db.rtxn().await;
        let policies = rtxn.fetch_all_policies();
        drop(rtxn);

        let mut cols = 0usize;
        let mut rows = Vec::new();
        for p in policies {
            let row = vec![
                Value::Str(p.name),
                Value::Str(verb_str(p.verb).to_string()),
                Value::Str(action_str(p.action).to_string()),
                Value::Array(p.users.into_iter().map(Value::Str).collect()),
                Value::Array(p.paths.into_iter().map(Value::Str).collect()),
            ];
            Value::table_push_row(&mut cols, &mut rows, row);
        }

        Value::Table { cols, rows }
    }

    async fn cmd_putacp(&self, args: &[Value]) -> Value {
        if args.len() != 5 {
            return arg_error("PUTACP", "exactly 5 arguments");
        }
        if self.info.single_user {
            return Value::error("ILLEGAL", "Cannot manage ACPs in single-user mode");
        }
        if !self.checks_admin() {
            return Value::error("DENIED", "You are not allowed to manage users");
        }

        let Some(name) = args[0].as_str() else {
            return Value::error("ARG", "Name should be a string");
        };
        if name.trim().is_empty() {
            return Value::error("ARG", "Name is missing");
        }

        let verb = match args[1].as_str() {
            Some("ALLOW") => Verb::Allow,
            Some("DENY") => Verb::Deny,
            Some(other) => return Value::error("ARG", format!("Verb should be ALLOW or DENY, got {other}")),
            None => return Value::error("ARG", "Verb should be a string"),
        };

        let action = match args[2].as_str() {
            Some("R") => Action::Read,
            Some("W") => Action::Write,
            Some(other) => return Value::error("ARG", format!("Action should be R or W, got {other}")),
            None => return Value::error("ARG", "Action should be a string"),
        };

        let Some(users) = args[3].as_array() else {
            return Value::error("ARG", "User parameter should be an array");
        };
        if users.is_empty() {
            return Value::error("ARG", "At least one user must be specified");
        }
        let mut user_names = Vec::with_capacity(users.len());
        for u in users {
            match u.as_str() {
                Some(s) => user_names.push(s.to_string()),
                None => return Value::error("ARG", format!("Usernames must be strings, got {}", u.name())),
            }
        }

        let Some(paths) = args[4].as_array() else {
            return Value::error("ARG", "Path parameter should be an array");
        };
        if paths.is_empty() {
            return Value::error("ARG", "At least one path must be specified");
        }
        let mut path_list = Vec::with_capacity(paths.len());
        for p in paths {
            match p.as_str() {
                Some(s) => path_list.push(normalize_slashes(s)),
                None => return Value::error("ARG", format!("Paths must be strings, got {}", p.name())),
            }
        }

        let policy =
            db::Policy { name: name.to_string(), verb, action, users: user_names, paths: path_list };

        let mut txn = self.db.txn().await;
        if let Err(err) = txn.put_access_policy(policy).await {
            panic!("failed to create policy: {err}");
        }

        Value::ok()
    }

    async fn cmd_rmacp(&self, args: &[Value]) -> Value {
        if args.len() != 1 {
            return arg_error("RMACP", "exactly 1 argument");
        }
        if self.info.single_user {
            return Value::error("ILLEGAL", "Cannot manage ACPs in single-user mode");
        }
        if !self.checks_admin() {
            return Value::error("DENIED", "You are not allowed to manage users");
        }
        let Some(name) = args[0].as_str() else {
            return Value::error("ARG", "Name should be a string");
        };

        let mut txn = self.db.txn().await;
        match txn.delete_access_policy(name).await {
            Ok(()) => Value::ok(),
            Err(db::Error::NotFound(_)) => Value::error("NOTFOUND", "Policy not found"),
            Err(err) => panic!("failed to delete policy: {err}"),
        }
    }
}

#[async_trait]
impl CommandHandler for Handler {
    async fn dispatch(&mut self, session: &Arc<Session>, command: Vec<Value>) -> Value {
        self.update().await;

        let Some(name) = command.first().and_then(Value::as_str).map(str::to_string) else {
            return Value::error("PROTO", "commands must be a non-empty array with a string command name");
        };

        self.dispatch_inner(session, &name, &command[1..]).await
    }
}

fn cmd_ping(args: &[Value]) -> Value {
    let _ = args;
    Value::Str("PONG".to_string())
}

fn cmd_whoami(info: &SessionInfo) -> Value {
    match &info.username {
        Some(u) => Value::Str(u.clone()),
        None => Value::Null,
    }
}

fn arg_error(cmd: &str, expects: &str) -> Value {
    Value::error("ARG", format!("Command {cmd} expects {expects}"))
}

/// Checks that `args` holds exactly one string, the shape MKDIR, TOUCH,
/// DEL and LIST all share. `Ok` carries the normalized virtual path;
/// `Err` carries the reply to send back as-is.
fn single_path_arg(args: &[Value], cmd: &str) -> Result<String, Value> {
    if args.len() != 1 {
        return Err(arg_error(cmd, "exactly one argument"));
    }
    match args[0].as_str() {
        Some(s) => Ok(normalize_slashes(s)),
        None => Err(Value::error("ARG", format!("Path should be a string, got {}", args[0].name()))),
    }
}

fn vfs_error(err: vfs::Error) -> Value {
    match err {
        vfs::Error::Denied => Value::error("DENIED", "Access denied"),
        vfs::Error::Invalid | vfs::Error::Reserved => Value::error("NOTFOUND", "No such file or directory"),
    }
}

fn normalize_slashes(raw: &str) -> String {
    format!("/{}", raw.trim_matches('/'))
}

fn tmp_sibling(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".part");
    path.with_file_name(name)
}

fn is_reserved(path: &Path, root: &Path) -> bool {
    path.starts_with(root.join(".fly"))
}

fn list_row(info: &std::fs::Metadata, full_path: &Path) -> Option<Vec<Value>> {
    let name = full_path.file_name()?.to_string_lossy().to_string();

    let (ftype, fsize) = if info.is_dir() {
        ("D", Value::Null)
    } else if info.is_file() {
        ("F", Value::Integer(info.len() as i64))
    } else {
        return None;
    };

    let modified = info.modified().ok()?;
    let modified: OffsetDateTime = modified.into();
    let modified_text = modified.format(&Rfc3339).ok()?;

    Some(vec![Value::Str(ftype.to_string()), Value::Str(name), fsize, Value::Str(modified_text)])
}

async fn touch_file(path: &Path) -> std::io::Result<()> {
    let now = std::time::SystemTime::now();
    match filetime_touch(path, now).await {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            tokio::fs::File::create(path).await?;
            Ok(())
        }
        Err(err) => Err(err),
    }
}

/// Updates mtime by reopening the file for append, which is enough to
/// bump its modification time without needing a dedicated syscall crate.
async fn filetime_touch(path: &Path, _now: std::time::SystemTime) -> std::io::Result<()> {
    tokio::fs::OpenOptions::new().append(true).open(path).await?;
    Ok(())
}

fn verb_str(v: Verb) -> &'static str {
    match v {
        Verb::Allow => "ALLOW",
        Verb::Deny => "DENY",
    }
}

fn action_str(a: Action) -> &'static str {
    match a {
        Action::Read => "R",
        Action::Write => "W",
    }
}

fn verify_token(token: &str, key: &[u8; crypto::KEY_LEN]) -> Option<String> {
    let decoded = crypto::decode_token(token).ok()?;
    let decrypted = crypto::aes_decrypt(&decoded, key).ok()?;

    let mut reader = std::io::Cursor::new(decrypted);
    let value = read_value_sync(&mut reader)?;

    let Value::Array(items) = value else { return None };
    if items.len() != 2 {
        return None;
    }
    let Value::Str(username) = &items[0] else { return None };
    let Value::Str(expiry) = &items[1] else { return None };

    let expiry = OffsetDateTime::parse(expiry, &Rfc3339).ok()?;
    if OffsetDateTime::now_utc() > expiry {
        return None;
    }

    Some(username.clone())
}

/// A tiny blocking re-parse of a value already fully buffered in memory,
/// used only for decoding the payload embedded in an auth token.
fn read_value_sync(cursor: &mut std::io::Cursor<Vec<u8>>) -> Option<Value> {
    use std::io::Read;

    fn read_line(cursor: &mut std::io::Cursor<Vec<u8>>) -> Option<Vec<u8>> {
        let mut line = Vec::new();
        let mut byte = [0u8; 1];
        loop {
            if cursor.read(&mut byte).ok()? == 0 {
                return if line.is_empty() { None } else { Some(line) };
            }
            if byte[0] == b'\n' {
                return Some(line);
            }
            line.push(byte[0]);
        }
    }

    let mut tag = [0u8; 1];
    cursor.read(&mut tag).ok()?;

    match tag[0] {
        b'+' => {
            let line = read_line(cursor)?;
            Some(Value::Str(String::from_utf8(line).ok()?))
        }
        b'*' => {
            let line = read_line(cursor)?;
            let n: usize = std::str::from_utf8(&line).ok()?.parse().ok()?;
            let mut values = Vec::with_capacity(n);
            for _ in 0..n {
                values.push(read_value_sync(cursor)?);
            }
            Some(Value::Array(values))
        }
        _ => None,
    }
}
