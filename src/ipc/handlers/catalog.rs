//! Classroom, department, subject and assignment setup.

use rusqlite::{Connection, OptionalExtension};
use rust_decimal::Decimal;
use serde_json::json;
use std::collections::HashMap;
use uuid::Uuid;

use crate::ipc::error::ok;
use crate::ipc::helpers::{
    db_err, decimal_value, insert_err, opt_param_str, param_str, require_db, require_principal,
    HandlerErr,
};
use crate::ipc::types::{AppState, Request};

fn row_exists(conn: &Connection, sql: &str, id: &str) -> Result<bool, HandlerErr> {
    conn.query_row(sql, [id], |r| r.get::<_, i64>(0))
        .optional()
        .map(|v| v.is_some())
        .map_err(db_err)
}

fn classrooms_create(state: &AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let conn = require_db(state)?;
    require_principal(conn, req)?;
    let name = param_str(req, "name")?.trim().to_string();
    let id = Uuid::new_v4().to_string();
    conn.execute("INSERT INTO class_rooms(id, name) VALUES(?, ?)", (&id, &name))
        .map_err(|e| insert_err(e, "classroom"))?;
    Ok(json!({ "id": id, "name": name }))
}

fn classrooms_list(state: &AppState) -> Result<serde_json::Value, HandlerErr> {
    let conn = require_db(state)?;
    let mut stmt = conn
        .prepare("SELECT id, name FROM class_rooms ORDER BY name")
        .map_err(db_err)?;
    let rooms = stmt
        .query_map([], |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "name": r.get::<_, String>(1)?,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(db_err)?;
    Ok(json!({ "classRooms": rooms }))
}

fn departments_create(state: &AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let conn = require_db(state)?;
    require_principal(conn, req)?;
    let name = param_str(req, "name")?.trim().to_string();
    let slug = param_str(req, "slug")?.trim().to_ascii_lowercase();
    let class_room_ids: Vec<String> = req
        .params
        .get("classRoomIds")
        .and_then(|v| v.as_array())
        .map(|arr| {
            arr.iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect()
        })
        .ok_or_else(|| HandlerErr::new("bad_params", "missing classRoomIds[]"))?;
    if class_room_ids.is_empty() {
        return Err(HandlerErr::new(
            "bad_params",
            "a department spans at least one classroom",
        ));
    }
    for cid in &class_room_ids {
        if !row_exists(conn, "SELECT 1 FROM class_rooms WHERE id = ?", cid)? {
            return Err(HandlerErr::new(
                "not_found",
                format!("classroom {cid} not found"),
            ));
        }
    }

    let id = Uuid::new_v4().to_string();
    let tx = conn
        .unchecked_transaction()
        .map_err(db_err)?;
    tx.execute(
        "INSERT INTO departments(id, name, slug) VALUES(?, ?, ?)",
        (&id, &name, &slug),
    )
    .map_err(|e| insert_err(e, "department slug"))?;
    for cid in &class_room_ids {
        tx.execute(
            "INSERT INTO department_class_rooms(department_id, class_room_id) VALUES(?, ?)",
            (&id, cid),
        )
        .map_err(|e| insert_err(e, "department classroom link"))?;
    }
    tx.commit().map_err(db_err)?;
    Ok(json!({ "id": id, "slug": slug }))
}

fn departments_list(state: &AppState) -> Result<serde_json::Value, HandlerErr> {
    let conn = require_db(state)?;

    let mut rooms_by_dept: HashMap<String, Vec<serde_json::Value>> = HashMap::new();
    let mut stmt = conn
        .prepare(
            "SELECT dc.department_id, c.id, c.name
             FROM department_class_rooms dc
             JOIN class_rooms c ON c.id = dc.class_room_id
             ORDER BY c.name",
        )
        .map_err(db_err)?;
    let links = stmt
        .query_map([], |r| {
            Ok((
                r.get::<_, String>(0)?,
                r.get::<_, String>(1)?,
                r.get::<_, String>(2)?,
            ))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(db_err)?;
    for (dept_id, room_id, room_name) in links {
        rooms_by_dept
            .entry(dept_id)
            .or_default()
            .push(json!({ "id": room_id, "name": room_name }));
    }

    let mut stmt = conn
        .prepare("SELECT id, name, slug FROM departments ORDER BY name")
        .map_err(db_err)?;
    let departments = stmt
        .query_map([], |r| {
            Ok((
                r.get::<_, String>(0)?,
                r.get::<_, String>(1)?,
                r.get::<_, String>(2)?,
            ))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(db_err)?
        .into_iter()
        .map(|(id, name, slug)| {
            let rooms = rooms_by_dept.remove(&id).unwrap_or_default();
            json!({ "id": id, "name": name, "slug": slug, "classRooms": rooms })
        })
        .collect::<Vec<_>>();
    Ok(json!({ "departments": departments }))
}

fn subjects_create(state: &AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let conn = require_db(state)?;
    require_principal(conn, req)?;
    let name = param_str(req, "name")?.trim().to_string();
    // Codes are stored case-normalized so spreadsheet lookups can match.
    let code = param_str(req, "code")?.trim().to_ascii_uppercase();

    let coefficient = req
        .params
        .get("coefficient")
        .and_then(decimal_value)
        .ok_or_else(|| HandlerErr::new("bad_params", "coefficient must be a number"))?;
    let max_score = req
        .params
        .get("maxScore")
        .and_then(decimal_value)
        .ok_or_else(|| HandlerErr::new("bad_params", "maxScore must be a number"))?;
    if coefficient <= Decimal::ZERO {
        return Err(HandlerErr::new("bad_params", "coefficient must be > 0"));
    }
    if max_score <= Decimal::ZERO {
        return Err(HandlerErr::new("bad_params", "maxScore must be > 0"));
    }

    let id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO subjects(id, name, code, coefficient, max_score) VALUES(?, ?, ?, ?, ?)",
        (
            &id,
            &name,
            &code,
            coefficient.normalize().to_string(),
            max_score.normalize().to_string(),
        ),
    )
    .map_err(|e| insert_err(e, "subject code"))?;
    Ok(json!({ "id": id, "code": code }))
}

fn subjects_list(state: &AppState) -> Result<serde_json::Value, HandlerErr> {
    let conn = require_db(state)?;
    let mut stmt = conn
        .prepare("SELECT id, name, code, coefficient, max_score FROM subjects ORDER BY code")
        .map_err(db_err)?;
    let subjects = stmt
        .query_map([], |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "name": r.get::<_, String>(1)?,
                "code": r.get::<_, String>(2)?,
                "coefficient": r.get::<_, String>(3)?,
                "maxScore": r.get::<_, String>(4)?,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(db_err)?;
    Ok(json!({ "subjects": subjects }))
}

fn assignments_create(state: &AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let conn = require_db(state)?;
    require_principal(conn, req)?;
    let subject_id = param_str(req, "subjectId")?;
    let department_id = param_str(req, "departmentId")?;
    let term_id = param_str(req, "termId")?;
    let teacher_id = opt_param_str(req, "teacherId");

    if !row_exists(conn, "SELECT 1 FROM subjects WHERE id = ?", subject_id)? {
        return Err(HandlerErr::new(
            "not_found",
            format!("subject {subject_id} not found"),
        ));
    }
    if !row_exists(conn, "SELECT 1 FROM departments WHERE id = ?", department_id)? {
        return Err(HandlerErr::new(
            "not_found",
            format!("department {department_id} not found"),
        ));
    }
    if !row_exists(conn, "SELECT 1 FROM terms WHERE id = ?", term_id)? {
        return Err(HandlerErr::new(
            "not_found",
            format!("term {term_id} not found"),
        ));
    }
    if let Some(tid) = teacher_id {
        let role: Option<String> = conn
            .query_row("SELECT role FROM users WHERE id = ?", [tid], |r| r.get(0))
            .optional()
            .map_err(db_err)?;
        match role.as_deref() {
            None => {
                return Err(HandlerErr::new(
                    "not_found",
                    format!("teacher {tid} not found"),
                ))
            }
            Some("teacher") => {}
            Some(_) => {
                return Err(HandlerErr::new(
                    "bad_params",
                    "assigned user is not a teacher",
                ))
            }
        }
        let teaches: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM user_subjects WHERE user_id = ? AND subject_id = ?",
                [tid, subject_id],
                |r| r.get(0),
            )
            .map_err(db_err)?;
        if teaches == 0 {
            return Err(HandlerErr::new(
                "bad_params",
                "teacher does not teach this subject",
            ));
        }
    }

    let id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO subject_assignments(id, subject_id, department_id, term_id, teacher_id)
         VALUES(?, ?, ?, ?, ?)",
        (&id, subject_id, department_id, term_id, teacher_id),
    )
    .map_err(|e| insert_err(e, "assignment for subject, department and term"))?;
    Ok(json!({ "id": id }))
}

fn assignments_list(state: &AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let conn = require_db(state)?;
    let mut sql = String::from(
        "SELECT a.id, a.subject_id, s.code, s.name, a.department_id, d.name,
                a.term_id, t.name, a.teacher_id
         FROM subject_assignments a
         JOIN subjects s ON s.id = a.subject_id
         JOIN departments d ON d.id = a.department_id
         JOIN terms t ON t.id = a.term_id
         JOIN academic_years y ON y.id = t.academic_year_id",
    );
    let mut clauses: Vec<&str> = Vec::new();
    let mut binds: Vec<String> = Vec::new();
    if let Some(term_id) = opt_param_str(req, "termId") {
        clauses.push("a.term_id = ?");
        binds.push(term_id.to_string());
    }
    if let Some(teacher_id) = opt_param_str(req, "teacherId") {
        clauses.push("a.teacher_id = ?");
        binds.push(teacher_id.to_string());
    }
    if !clauses.is_empty() {
        sql.push_str(" WHERE ");
        sql.push_str(&clauses.join(" AND "));
    }
    sql.push_str(" ORDER BY y.start_date, t.term_number, d.name, s.code");

    let mut stmt = conn.prepare(&sql).map_err(db_err)?;
    let assignments = stmt
        .query_map(rusqlite::params_from_iter(binds), |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "subjectId": r.get::<_, String>(1)?,
                "subjectCode": r.get::<_, String>(2)?,
                "subjectName": r.get::<_, String>(3)?,
                "departmentId": r.get::<_, String>(4)?,
                "departmentName": r.get::<_, String>(5)?,
                "termId": r.get::<_, String>(6)?,
                "termName": r.get::<_, String>(7)?,
                "teacherId": r.get::<_, Option<String>>(8)?,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(db_err)?;
    Ok(json!({ "assignments": assignments }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let result = match req.method.as_str() {
        "classrooms.create" => classrooms_create(state, req),
        "classrooms.list" => classrooms_list(state),
        "departments.create" => departments_create(state, req),
        "departments.list" => departments_list(state),
        "subjects.create" => subjects_create(state, req),
        "subjects.list" => subjects_list(state),
        "assignments.create" => assignments_create(state, req),
        "assignments.list" => assignments_list(state, req),
        _ => return None,
    };
    Some(match result {
        Ok(v) => ok(&req.id, v),
        Err(e) => e.response(&req.id),
    })
}
