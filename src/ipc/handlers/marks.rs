//! Mark listing and the array upsert endpoint. The upsert path funnels
//! through the same planner and committer as the file import, so uniqueness,
//! derivation and provenance behave identically on both.

use rusqlite::types::Value as SqlValue;
use rusqlite::{params_from_iter, Connection};
use rust_decimal::Decimal;
use serde_json::json;
use std::collections::{HashMap, HashSet};

use crate::import::{
    fetch_existing_marks, plan_batch, truncate_comment, AssignmentRef, ScopeMemo, ValidRow,
};
use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{
    acting_user, db_err, decimal_value, opt_param_str, require_db, HandlerErr,
};
use crate::ipc::types::{AppState, Request};

fn marks_list(state: &AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let conn = require_db(state)?;
    let user = acting_user(conn, req)?;

    let mut sql = String::from(
        "SELECT m.id, m.student_id, m.subject_assignment_id, sub.code, m.score, m.total_mark,
                m.comment, m.entered_by, m.entered_at, m.modified_by, m.modified_at
         FROM marks m
         JOIN subject_assignments a ON a.id = m.subject_assignment_id
         JOIN subjects sub ON sub.id = a.subject_id
         JOIN students st ON st.id = m.student_id",
    );
    let mut clauses: Vec<String> = Vec::new();
    let mut binds: Vec<String> = Vec::new();

    match user.role.as_str() {
        "principal" => {}
        "teacher" => {
            clauses.push("a.teacher_id = ?".to_string());
            binds.push(user.id.clone());
        }
        "student" => {
            clauses.push("st.user_id = ?".to_string());
            binds.push(user.id.clone());
        }
        // Parents have no mark visibility in this core.
        _ => return Ok(json!({ "marks": [] })),
    }
    if let Some(term_id) = opt_param_str(req, "termId") {
        clauses.push("a.term_id = ?".to_string());
        binds.push(term_id.to_string());
    }
    if !clauses.is_empty() {
        sql.push_str(" WHERE ");
        sql.push_str(&clauses.join(" AND "));
    }
    sql.push_str(" ORDER BY sub.code, st.registration_number");

    let mut stmt = conn.prepare(&sql).map_err(db_err)?;
    let marks = stmt
        .query_map(params_from_iter(binds), |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "studentId": r.get::<_, String>(1)?,
                "assignmentId": r.get::<_, String>(2)?,
                "subjectCode": r.get::<_, String>(3)?,
                "score": r.get::<_, String>(4)?,
                "totalMark": r.get::<_, String>(5)?,
                "comment": r.get::<_, String>(6)?,
                "enteredBy": r.get::<_, Option<String>>(7)?,
                "enteredAt": r.get::<_, String>(8)?,
                "modifiedBy": r.get::<_, Option<String>>(9)?,
                "modifiedAt": r.get::<_, Option<String>>(10)?,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(db_err)?;
    Ok(json!({ "marks": marks }))
}

fn in_placeholders(n: usize) -> String {
    std::iter::repeat_n("?", n).collect::<Vec<_>>().join(",")
}

fn fetch_assignment_refs(
    conn: &Connection,
    ids: &HashSet<String>,
) -> Result<HashMap<String, AssignmentRef>, HandlerErr> {
    let mut out = HashMap::new();
    if ids.is_empty() {
        return Ok(out);
    }
    let sql = format!(
        "SELECT a.id, a.subject_id, sub.code, a.department_id, d.name, a.teacher_id,
                sub.coefficient, sub.max_score
         FROM subject_assignments a
         JOIN subjects sub ON sub.id = a.subject_id
         JOIN departments d ON d.id = a.department_id
         WHERE a.id IN ({})",
        in_placeholders(ids.len())
    );
    let binds: Vec<SqlValue> = ids.iter().map(|i| SqlValue::Text(i.clone())).collect();
    let mut stmt = conn.prepare(&sql).map_err(db_err)?;
    let rows = stmt
        .query_map(params_from_iter(binds), |r| {
            Ok((
                r.get::<_, String>(0)?,
                r.get::<_, String>(1)?,
                r.get::<_, String>(2)?,
                r.get::<_, String>(3)?,
                r.get::<_, String>(4)?,
                r.get::<_, Option<String>>(5)?,
                r.get::<_, String>(6)?,
                r.get::<_, String>(7)?,
            ))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(db_err)?;
    for (id, subject_id, code, department_id, department_name, teacher_id, coeff, max) in rows {
        let coefficient = coeff.parse::<Decimal>().map_err(|_| {
            HandlerErr::new("db_query_failed", format!("bad coefficient for {id}"))
        })?;
        let max_score = max
            .parse::<Decimal>()
            .map_err(|_| HandlerErr::new("db_query_failed", format!("bad max score for {id}")))?;
        out.insert(
            id.clone(),
            AssignmentRef {
                id,
                subject_id,
                subject_code: code,
                department_id,
                department_name,
                teacher_id,
                coefficient,
                max_score,
            },
        );
    }
    Ok(out)
}

fn fetch_student_ids(
    conn: &Connection,
    ids: &HashSet<String>,
) -> Result<HashSet<String>, HandlerErr> {
    let mut out = HashSet::new();
    if ids.is_empty() {
        return Ok(out);
    }
    let sql = format!(
        "SELECT id FROM students WHERE id IN ({})",
        in_placeholders(ids.len())
    );
    let binds: Vec<SqlValue> = ids.iter().map(|i| SqlValue::Text(i.clone())).collect();
    let mut stmt = conn.prepare(&sql).map_err(db_err)?;
    let rows = stmt
        .query_map(params_from_iter(binds), |r| r.get::<_, String>(0))
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(db_err)?;
    out.extend(rows);
    Ok(out)
}

fn marks_bulk_upsert(state: &AppState, req: &Request) -> serde_json::Value {
    let conn = match require_db(state) {
        Ok(c) => c,
        Err(e) => return e.response(&req.id),
    };
    let user = match acting_user(conn, req) {
        Ok(u) => u,
        Err(e) => return e.response(&req.id),
    };
    if user.role != "principal" && user.role != "teacher" {
        return err(&req.id, "forbidden", "mark entry requires a teacher or principal", None);
    }
    let Some(items) = req.params.get("items").and_then(|v| v.as_array()) else {
        return err(&req.id, "bad_params", "missing items[]", None);
    };

    // One pass to gather ids, one query per table; items then validate
    // against the in-memory maps only.
    let mut student_ids: HashSet<String> = HashSet::new();
    let mut assignment_ids: HashSet<String> = HashSet::new();
    for item in items {
        if let Some(sid) = item.get("studentId").and_then(|v| v.as_str()) {
            student_ids.insert(sid.to_string());
        }
        if let Some(aid) = item.get("assignmentId").and_then(|v| v.as_str()) {
            assignment_ids.insert(aid.to_string());
        }
    }
    let known_students = match fetch_student_ids(conn, &student_ids) {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    let assignments = match fetch_assignment_refs(conn, &assignment_ids) {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };

    let mut scope = ScopeMemo::new(conn, &user);
    let mut valid: Vec<ValidRow> = Vec::new();
    let mut errors: Vec<serde_json::Value> = Vec::new();
    fn reject(row: usize, message: String, errors: &mut Vec<serde_json::Value>) {
        let mut obj = serde_json::Map::new();
        obj.insert(format!("row {row}"), serde_json::Value::String(message));
        errors.push(serde_json::Value::Object(obj));
    }

    for (i, item) in items.iter().enumerate() {
        let row = i + 1;
        let Some(obj) = item.as_object() else {
            reject(row, "item must be an object".to_string(), &mut errors);
            continue;
        };
        let Some(student_id) = obj.get("studentId").and_then(|v| v.as_str()) else {
            reject(row, "missing studentId".to_string(), &mut errors);
            continue;
        };
        let Some(assignment_id) = obj.get("assignmentId").and_then(|v| v.as_str()) else {
            reject(row, "missing assignmentId".to_string(), &mut errors);
            continue;
        };
        if !known_students.contains(student_id) {
            reject(row, format!("student {student_id} not found"), &mut errors);
            continue;
        }
        let Some(assignment) = assignments.get(assignment_id) else {
            reject(
                row,
                format!("assignment {assignment_id} not found"),
                &mut errors,
            );
            continue;
        };
        let Some(score) = obj.get("score").and_then(decimal_value) else {
            reject(row, "score is not a number".to_string(), &mut errors);
            continue;
        };
        if score < Decimal::ZERO || score > assignment.max_score {
            reject(
                row,
                format!("score {score} out of range (0-{})", assignment.max_score),
                &mut errors,
            );
            continue;
        }
        let allowed = match scope.allows(assignment) {
            Ok(v) => v,
            Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
        };
        if !allowed {
            reject(
                row,
                format!(
                    "not allowed to enter marks for {} in {}",
                    assignment.subject_code, assignment.department_name
                ),
                &mut errors,
            );
            continue;
        }
        let comment = obj.get("comment").and_then(|v| v.as_str()).unwrap_or("");
        valid.push(ValidRow {
            student_id: student_id.to_string(),
            assignment_id: assignment_id.to_string(),
            coefficient: assignment.coefficient,
            score,
            comment: truncate_comment(comment.trim()),
        });
    }

    let existing = match fetch_existing_marks(conn, &valid) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let plan = plan_batch(&valid, &existing);
    let (created, updated) = match crate::import::commit(conn, &user.id, &plan) {
        Ok(v) => v,
        Err(e) => {
            return err(
                &req.id,
                "db_error",
                "Database error",
                Some(json!({ "detail": e.to_string() })),
            )
        }
    };

    if errors.is_empty() {
        ok(
            &req.id,
            json!({ "created": created, "updated": updated, "errors": [] }),
        )
    } else {
        // Valid items are already committed; the error envelope still
        // carries the counts so the caller knows what landed.
        err(
            &req.id,
            "validation_failed",
            format!("{} item(s) failed validation", errors.len()),
            Some(json!({ "created": created, "updated": updated, "errors": errors })),
        )
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "marks.list" => Some(match marks_list(state, req) {
            Ok(v) => ok(&req.id, v),
            Err(e) => e.response(&req.id),
        }),
        "marks.bulkUpsert" => Some(marks_bulk_upsert(state, req)),
        _ => None,
    }
}
