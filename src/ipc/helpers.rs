//! Shared handler plumbing: the early-return error carrier plus the param
//! and acting-user lookups every method starts with.

use std::str::FromStr;

use chrono::{SecondsFormat, Utc};
use rusqlite::Connection;
use rust_decimal::Decimal;

use crate::db::{self, UserRow};
use crate::ipc::error::err;
use crate::ipc::types::{AppState, Request};

pub struct HandlerErr {
    pub code: &'static str,
    pub message: String,
    pub details: Option<serde_json::Value>,
}

impl HandlerErr {
    pub fn new(code: &'static str, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            details: None,
        }
    }

    pub fn response(self, id: &str) -> serde_json::Value {
        err(id, self.code, self.message, self.details)
    }
}

pub fn db_err(e: rusqlite::Error) -> HandlerErr {
    HandlerErr::new("db_query_failed", e.to_string())
}

/// Unique-constraint breaches come back as a distinct code so callers can
/// tell "name already taken" from a real storage failure.
pub fn insert_err(e: rusqlite::Error, what: &str) -> HandlerErr {
    if is_unique_violation(&e) {
        HandlerErr::new("conflict", format!("{what} already exists"))
    } else {
        HandlerErr::new("db_insert_failed", e.to_string())
    }
}

pub fn is_unique_violation(e: &rusqlite::Error) -> bool {
    matches!(
        e,
        rusqlite::Error::SqliteFailure(f, _)
            if f.code == rusqlite::ErrorCode::ConstraintViolation
    )
}

pub fn require_db(state: &AppState) -> Result<&Connection, HandlerErr> {
    state
        .db
        .as_ref()
        .ok_or_else(|| HandlerErr::new("no_workspace", "select a workspace first"))
}

pub fn param_str<'a>(req: &'a Request, key: &str) -> Result<&'a str, HandlerErr> {
    req.params
        .get(key)
        .and_then(|v| v.as_str())
        .filter(|s| !s.trim().is_empty())
        .ok_or_else(|| HandlerErr::new("bad_params", format!("missing {key}")))
}

pub fn opt_param_str<'a>(req: &'a Request, key: &str) -> Option<&'a str> {
    req.params
        .get(key)
        .and_then(|v| v.as_str())
        .filter(|s| !s.trim().is_empty())
}

/// Scores and coefficients arrive as JSON numbers or strings; either way the
/// literal text is what gets parsed, exactly.
pub fn decimal_value(v: &serde_json::Value) -> Option<Decimal> {
    match v {
        serde_json::Value::Number(n) => Decimal::from_str(&n.to_string()).ok(),
        serde_json::Value::String(s) => Decimal::from_str(s.trim()).ok(),
        _ => None,
    }
}

pub fn now_utc() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Resolve `params.userId` to the acting user. The caller is trusted to name
/// the user; there is no authentication here.
pub fn acting_user(conn: &Connection, req: &Request) -> Result<UserRow, HandlerErr> {
    let user_id = param_str(req, "userId")?;
    db::get_user(conn, user_id)
        .map_err(|e| HandlerErr::new("db_query_failed", e.to_string()))?
        .ok_or_else(|| HandlerErr::new("not_found", format!("user {user_id} not found")))
}

pub fn require_principal(conn: &Connection, req: &Request) -> Result<UserRow, HandlerErr> {
    let user = acting_user(conn, req)?;
    if user.role != "principal" {
        return Err(HandlerErr::new("forbidden", "principal role required"));
    }
    Ok(user)
}
