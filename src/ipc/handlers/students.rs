use rusqlite::OptionalExtension;
use serde_json::json;
use uuid::Uuid;

use crate::ipc::error::ok;
use crate::ipc::helpers::{
    db_err, insert_err, opt_param_str, param_str, require_db, require_principal, HandlerErr,
};
use crate::ipc::types::{AppState, Request};

fn students_create(state: &AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let conn = require_db(state)?;
    require_principal(conn, req)?;
    // `userId` names the acting principal; the student's own account comes
    // in as `studentUserId`.
    let student_user_id = param_str(req, "studentUserId")?;
    let registration_number = param_str(req, "registrationNumber")?.trim().to_string();
    let department_id = param_str(req, "departmentId")?;
    let class_room_id = param_str(req, "classRoomId")?;

    let role: Option<String> = conn
        .query_row(
            "SELECT role FROM users WHERE id = ?",
            [student_user_id],
            |r| r.get(0),
        )
        .optional()
        .map_err(db_err)?;
    match role.as_deref() {
        None => {
            return Err(HandlerErr::new(
                "not_found",
                format!("user {student_user_id} not found"),
            ))
        }
        Some("student") => {}
        Some(_) => {
            return Err(HandlerErr::new(
                "bad_params",
                "linked account must have the student role",
            ))
        }
    }
    for (sql, id, what) in [
        (
            "SELECT 1 FROM departments WHERE id = ?",
            department_id,
            "department",
        ),
        (
            "SELECT 1 FROM class_rooms WHERE id = ?",
            class_room_id,
            "classroom",
        ),
    ] {
        let found: Option<i64> = conn
            .query_row(sql, [id], |r| r.get(0))
            .optional()
            .map_err(db_err)?;
        if found.is_none() {
            return Err(HandlerErr::new(
                "not_found",
                format!("{what} {id} not found"),
            ));
        }
    }

    let id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO students(id, user_id, registration_number, department_id, current_class_id)
         VALUES(?, ?, ?, ?, ?)",
        (
            &id,
            student_user_id,
            &registration_number,
            department_id,
            class_room_id,
        ),
    )
    .map_err(|e| insert_err(e, "student registration"))?;
    Ok(json!({ "id": id, "registrationNumber": registration_number }))
}

fn students_list(state: &AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let conn = require_db(state)?;
    let mut sql = String::from(
        "SELECT s.id, s.registration_number, s.department_id, s.current_class_id,
                u.first_name, u.last_name
         FROM students s JOIN users u ON u.id = s.user_id",
    );
    let mut binds: Vec<String> = Vec::new();
    if let Some(department_id) = opt_param_str(req, "departmentId") {
        sql.push_str(" WHERE s.department_id = ?");
        binds.push(department_id.to_string());
    }
    sql.push_str(" ORDER BY s.registration_number");

    let mut stmt = conn.prepare(&sql).map_err(db_err)?;
    let students = stmt
        .query_map(rusqlite::params_from_iter(binds), |r| {
            let first: String = r.get(4)?;
            let last: String = r.get(5)?;
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "registrationNumber": r.get::<_, String>(1)?,
                "departmentId": r.get::<_, String>(2)?,
                "classRoomId": r.get::<_, String>(3)?,
                "fullName": format!("{first} {last}").trim().to_string(),
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(db_err)?;
    Ok(json!({ "students": students }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let result = match req.method.as_str() {
        "students.create" => students_create(state, req),
        "students.list" => students_list(state, req),
        _ => return None,
    };
    Some(match result {
        Ok(v) => ok(&req.id, v),
        Err(e) => e.response(&req.id),
    })
}
