//! Account creation. Credential state is a collaborator's concern; this
//! only records the account row, links taught subjects, and hands a welcome
//! message to the mail queue.

use rusqlite::OptionalExtension;
use serde_json::json;
use uuid::Uuid;

use crate::ipc::error::ok;
use crate::ipc::helpers::{
    db_err, insert_err, now_utc, opt_param_str, param_str, require_db, require_principal,
    HandlerErr,
};
use crate::ipc::types::{AppState, Request};
use crate::mailer::EmailJob;

fn users_create(state: &AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let conn = require_db(state)?;
    let role = param_str(req, "role")?;

    let user_count: i64 = conn
        .query_row("SELECT COUNT(*) FROM users", [], |r| r.get(0))
        .map_err(db_err)?;
    if user_count == 0 {
        // Fresh workspace: the first account is the principal and needs no
        // acting user to vouch for it.
        if role != "principal" {
            return Err(HandlerErr::new(
                "bad_params",
                "the first account in a workspace must be the principal",
            ));
        }
    } else {
        require_principal(conn, req)?;
        if !["teacher", "student", "parent"].contains(&role) {
            return Err(HandlerErr::new("bad_params", "invalid role"));
        }
    }

    let email = param_str(req, "email")?.trim().to_ascii_lowercase();
    let first_name = opt_param_str(req, "firstName").unwrap_or("").trim().to_string();
    let last_name = opt_param_str(req, "lastName").unwrap_or("").trim().to_string();
    if first_name.is_empty() && last_name.is_empty() {
        return Err(HandlerErr::new("bad_params", "a name is required"));
    }

    let department_id = opt_param_str(req, "departmentId");
    if let Some(did) = department_id {
        let found: Option<i64> = conn
            .query_row("SELECT 1 FROM departments WHERE id = ?", [did], |r| r.get(0))
            .optional()
            .map_err(db_err)?;
        if found.is_none() {
            return Err(HandlerErr::new(
                "not_found",
                format!("department {did} not found"),
            ));
        }
    }

    let subject_ids: Vec<String> = req
        .params
        .get("subjectIds")
        .and_then(|v| v.as_array())
        .map(|arr| {
            arr.iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect()
        })
        .unwrap_or_default();
    if !subject_ids.is_empty() && role != "teacher" {
        return Err(HandlerErr::new(
            "bad_params",
            "only teachers carry taught subjects",
        ));
    }
    for sid in &subject_ids {
        let found: Option<i64> = conn
            .query_row("SELECT 1 FROM subjects WHERE id = ?", [sid.as_str()], |r| {
                r.get(0)
            })
            .optional()
            .map_err(db_err)?;
        if found.is_none() {
            return Err(HandlerErr::new(
                "not_found",
                format!("subject {sid} not found"),
            ));
        }
    }

    let id = Uuid::new_v4().to_string();
    let tx = conn.unchecked_transaction().map_err(db_err)?;
    tx.execute(
        "INSERT INTO users(id, email, first_name, last_name, role, department_id, created_at)
         VALUES(?, ?, ?, ?, ?, ?, ?)",
        (
            &id,
            &email,
            &first_name,
            &last_name,
            role,
            department_id,
            now_utc(),
        ),
    )
    .map_err(|e| insert_err(e, "email"))?;
    for sid in &subject_ids {
        tx.execute(
            "INSERT INTO user_subjects(user_id, subject_id) VALUES(?, ?)",
            (&id, sid),
        )
        .map_err(|e| insert_err(e, "taught subject link"))?;
    }
    tx.commit().map_err(db_err)?;

    let full_name = format!("{first_name} {last_name}").trim().to_string();
    state.mailer.enqueue(EmailJob {
        to: email.clone(),
        subject: "Welcome to the school portal".to_string(),
        body: format!("Hello {full_name}, your {role} account is ready."),
    });

    Ok(json!({
        "id": id,
        "email": email,
        "name": full_name,
        "role": role,
    }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let result = match req.method.as_str() {
        "users.create" => users_create(state, req),
        _ => return None,
    };
    Some(match result {
        Ok(v) => ok(&req.id, v),
        Err(e) => e.response(&req.id),
    })
}
