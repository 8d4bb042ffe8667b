//! The `marks.importFile` driver. Param checks run on the request loop;
//! file reading, validation and the atomic commit run on a worker thread
//! with its own connection so a large sheet never blocks other requests.

use rusqlite::OptionalExtension;
use serde_json::json;
use std::path::PathBuf;

use crate::db;
use crate::import::{self, ImportError, ImportOutcome};
use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{acting_user, db_err, opt_param_str, param_str, require_db, HandlerErr};
use crate::ipc::types::{AppState, Request};

struct ImportParams {
    workspace: PathBuf,
    acting: db::UserRow,
    path: PathBuf,
    term_id: String,
    assignment_id: Option<String>,
}

fn check_params(state: &AppState, req: &Request) -> Result<ImportParams, HandlerErr> {
    let conn = require_db(state)?;
    let workspace = state
        .workspace
        .clone()
        .ok_or_else(|| HandlerErr::new("no_workspace", "select a workspace first"))?;

    let acting = acting_user(conn, req)?;
    if acting.role != "principal" && acting.role != "teacher" {
        return Err(HandlerErr::new(
            "forbidden",
            "mark entry requires a teacher or principal",
        ));
    }

    let path = PathBuf::from(param_str(req, "path")?);
    let term_id = param_str(req, "termId")?.to_string();
    let term_found: Option<i64> = conn
        .query_row("SELECT 1 FROM terms WHERE id = ?", [term_id.as_str()], |r| {
            r.get(0)
        })
        .optional()
        .map_err(db_err)?;
    if term_found.is_none() {
        return Err(HandlerErr::new(
            "not_found",
            format!("term {term_id} not found"),
        ));
    }

    let assignment_id = opt_param_str(req, "assignmentId").map(str::to_string);
    if let Some(aid) = assignment_id.as_deref() {
        let assignment_term: Option<String> = conn
            .query_row(
                "SELECT term_id FROM subject_assignments WHERE id = ?",
                [aid],
                |r| r.get(0),
            )
            .optional()
            .map_err(db_err)?;
        match assignment_term {
            None => {
                return Err(HandlerErr::new(
                    "not_found",
                    format!("assignment {aid} not found"),
                ))
            }
            Some(t) if t != term_id => {
                return Err(HandlerErr::new(
                    "bad_params",
                    "assignment is not part of the target term",
                ))
            }
            Some(_) => {}
        }
    }

    Ok(ImportParams {
        workspace,
        acting,
        path,
        term_id,
        assignment_id,
    })
}

fn handle_import_file(state: &AppState, req: &Request) -> serde_json::Value {
    let params = match check_params(state, req) {
        Ok(p) => p,
        Err(e) => return e.response(&req.id),
    };

    let worker = std::thread::spawn(move || -> Result<ImportOutcome, ImportError> {
        let conn = db::open_existing(&params.workspace).map_err(ImportError::Storage)?;
        import::run_import(
            &conn,
            &params.acting,
            &params.path,
            &params.term_id,
            params.assignment_id.as_deref(),
        )
    });

    match worker.join() {
        Ok(Ok(ImportOutcome::Committed(summary))) => ok(
            &req.id,
            json!({
                "success": true,
                "created": summary.created,
                "updated": summary.updated,
                "skipped": summary.skipped,
            }),
        ),
        Ok(Ok(ImportOutcome::Rejected(report))) => ok(
            &req.id,
            json!({
                "success": false,
                "errors": report.errors,
                "totalErrors": report.total_errors,
                "preview": {
                    "toCreate": report.to_create,
                    "toUpdate": report.to_update,
                },
                "skipped": report.skipped,
            }),
        ),
        Ok(Err(ImportError::MalformedInput(message))) => {
            err(&req.id, "malformed_input", message, None)
        }
        Ok(Err(ImportError::Storage(e))) => err(
            &req.id,
            "db_error",
            "Database error",
            Some(json!({ "detail": e.to_string() })),
        ),
        Err(_) => err(&req.id, "internal", "import worker panicked", None),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "marks.importFile" => Some(handle_import_file(state, req)),
        _ => None,
    }
}
