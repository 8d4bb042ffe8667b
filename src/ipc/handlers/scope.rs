//! Hierarchical teacher scope: Year -> Term -> Class -> Department -> the
//! assignments a teacher may enter marks for. Built with explicit ordered
//! maps in one pass over the assignment rows.

use serde_json::json;
use std::collections::{BTreeMap, BTreeSet, HashMap};

use crate::db;
use crate::ipc::error::ok;
use crate::ipc::helpers::{acting_user, db_err, param_str, require_db, HandlerErr};
use crate::ipc::types::{AppState, Request};

type DeptMap = BTreeMap<String, Vec<serde_json::Value>>;
type ClassMap = BTreeMap<String, DeptMap>;
type TermMap = BTreeMap<String, ClassMap>;
type ScopeTree = BTreeMap<String, TermMap>;

fn scope_get(state: &AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let conn = require_db(state)?;
    let acting = acting_user(conn, req)?;
    let teacher_id = param_str(req, "teacherId")?;

    let teacher = db::get_user(conn, teacher_id)
        .map_err(|e| HandlerErr::new("db_query_failed", e.to_string()))?
        .filter(|u| u.role == "teacher")
        .ok_or_else(|| HandlerErr::new("not_found", format!("teacher {teacher_id} not found")))?;

    // A teacher sees their own scope; otherwise only the principal may look.
    if acting.id != teacher.id && acting.role != "principal" {
        return Err(HandlerErr::new(
            "forbidden",
            "scope is visible to the principal or the teacher themselves",
        ));
    }

    let mut rooms_by_dept: HashMap<String, Vec<String>> = HashMap::new();
    let mut stmt = conn
        .prepare(
            "SELECT dc.department_id, c.name
             FROM department_class_rooms dc
             JOIN class_rooms c ON c.id = dc.class_room_id
             ORDER BY c.name",
        )
        .map_err(db_err)?;
    let links = stmt
        .query_map([], |r| Ok((r.get::<_, String>(0)?, r.get::<_, String>(1)?)))
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(db_err)?;
    for (dept_id, room_name) in links {
        rooms_by_dept.entry(dept_id).or_default().push(room_name);
    }

    let mut stmt = conn
        .prepare(
            "SELECT a.id, y.name, t.name, a.department_id, d.name,
                    s.code, s.name, s.coefficient, s.max_score
             FROM subject_assignments a
             JOIN terms t ON t.id = a.term_id
             JOIN academic_years y ON y.id = t.academic_year_id
             JOIN departments d ON d.id = a.department_id
             JOIN subjects s ON s.id = a.subject_id
             WHERE a.teacher_id = ?
             ORDER BY y.start_date, t.term_number, d.name, s.code",
        )
        .map_err(db_err)?;
    let rows = stmt
        .query_map([teacher_id], |r| {
            Ok((
                r.get::<_, String>(0)?,
                r.get::<_, String>(1)?,
                r.get::<_, String>(2)?,
                r.get::<_, String>(3)?,
                r.get::<_, String>(4)?,
                r.get::<_, String>(5)?,
                r.get::<_, String>(6)?,
                r.get::<_, String>(7)?,
                r.get::<_, String>(8)?,
            ))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(db_err)?;

    let mut scope: ScopeTree = BTreeMap::new();
    let mut seen_classes: BTreeSet<String> = BTreeSet::new();
    let mut seen_departments: BTreeSet<String> = BTreeSet::new();
    let mut seen_subjects: BTreeSet<String> = BTreeSet::new();
    let total_assignments = rows.len();

    for (id, year, term, dept_id, dept_name, code, subject_name, coefficient, max_score) in rows {
        seen_departments.insert(dept_name.clone());
        seen_subjects.insert(code.clone());
        let entry = json!({
            "assignmentId": id,
            "subjectCode": code,
            "subjectName": subject_name,
            "coefficient": coefficient,
            "maxScore": max_score,
        });
        let class_names = rooms_by_dept.get(&dept_id).cloned().unwrap_or_default();
        for class_name in class_names {
            scope
                .entry(year.clone())
                .or_default()
                .entry(term.clone())
                .or_default()
                .entry(class_name.clone())
                .or_default()
                .entry(dept_name.clone())
                .or_default()
                .push(entry.clone());
            seen_classes.insert(class_name);
        }
    }

    Ok(json!({
        "teacher": {
            "id": teacher.id,
            "fullName": teacher.full_name(),
        },
        "scope": serde_json::to_value(&scope)
            .map_err(|e| HandlerErr::new("internal", e.to_string()))?,
        "summary": {
            "totalAssignments": total_assignments,
            "uniqueSubjects": seen_subjects.len(),
            "classes": seen_classes,
            "departments": seen_departments,
        },
    }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let result = match req.method.as_str() {
        "scope.get" => scope_get(state, req),
        _ => return None,
    };
    Some(match result {
        Ok(v) => ok(&req.id, v),
        Err(e) => e.response(&req.id),
    })
}
