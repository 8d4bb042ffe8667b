//! Academic year and term setup. Principal-gated mutations; the
//! current-flag singleton lives in `db::set_current_*`, never here.

use chrono::NaiveDate;
use rusqlite::OptionalExtension;
use serde_json::json;
use uuid::Uuid;

use crate::db;
use crate::ipc::error::ok;
use crate::ipc::helpers::{
    db_err, insert_err, opt_param_str, param_str, require_db, require_principal, HandlerErr,
};
use crate::ipc::types::{AppState, Request};

fn parse_date(req: &Request, key: &str) -> Result<NaiveDate, HandlerErr> {
    let s = param_str(req, key)?;
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .map_err(|_| HandlerErr::new("bad_params", format!("{key} must be YYYY-MM-DD")))
}

fn date_range(req: &Request) -> Result<(NaiveDate, NaiveDate), HandlerErr> {
    let start = parse_date(req, "startDate")?;
    let end = parse_date(req, "endDate")?;
    if start >= end {
        return Err(HandlerErr::new(
            "bad_params",
            "startDate must fall before endDate",
        ));
    }
    Ok((start, end))
}

fn years_create(state: &AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let conn = require_db(state)?;
    require_principal(conn, req)?;
    let name = param_str(req, "name")?.trim().to_string();
    let (start, end) = date_range(req)?;

    let id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO academic_years(id, name, start_date, end_date) VALUES(?, ?, ?, ?)",
        (&id, &name, start.to_string(), end.to_string()),
    )
    .map_err(|e| insert_err(e, "academic year"))?;
    Ok(json!({ "id": id, "name": name }))
}

fn years_list(state: &AppState) -> Result<serde_json::Value, HandlerErr> {
    let conn = require_db(state)?;
    let mut stmt = conn
        .prepare(
            "SELECT id, name, start_date, end_date, is_current
             FROM academic_years ORDER BY start_date",
        )
        .map_err(db_err)?;
    let years = stmt
        .query_map([], |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "name": r.get::<_, String>(1)?,
                "startDate": r.get::<_, String>(2)?,
                "endDate": r.get::<_, String>(3)?,
                "isCurrent": r.get::<_, i64>(4)? != 0,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(db_err)?;
    Ok(json!({ "years": years }))
}

fn years_set_current(state: &AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let conn = require_db(state)?;
    require_principal(conn, req)?;
    let id = param_str(req, "id")?;
    let flipped = db::set_current_academic_year(conn, id)
        .map_err(|e| HandlerErr::new("db_query_failed", e.to_string()))?;
    if !flipped {
        return Err(HandlerErr::new(
            "not_found",
            format!("academic year {id} not found"),
        ));
    }
    let name: String = conn
        .query_row("SELECT name FROM academic_years WHERE id = ?", [id], |r| {
            r.get(0)
        })
        .map_err(db_err)?;
    Ok(json!({ "currentYear": name }))
}

fn terms_create(state: &AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let conn = require_db(state)?;
    require_principal(conn, req)?;
    let year_id = param_str(req, "academicYearId")?;
    let term_number = req
        .params
        .get("termNumber")
        .and_then(|v| v.as_i64())
        .ok_or_else(|| HandlerErr::new("bad_params", "missing termNumber"))?;
    if !(1..=3).contains(&term_number) {
        return Err(HandlerErr::new("bad_params", "termNumber must be 1, 2 or 3"));
    }
    let name = param_str(req, "name")?.trim().to_string();
    let (start, end) = date_range(req)?;

    let year_exists: Option<String> = conn
        .query_row("SELECT id FROM academic_years WHERE id = ?", [year_id], |r| {
            r.get(0)
        })
        .optional()
        .map_err(db_err)?;
    if year_exists.is_none() {
        return Err(HandlerErr::new(
            "not_found",
            format!("academic year {year_id} not found"),
        ));
    }

    let id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO terms(id, academic_year_id, term_number, name, start_date, end_date)
         VALUES(?, ?, ?, ?, ?, ?)",
        (
            &id,
            year_id,
            term_number,
            &name,
            start.to_string(),
            end.to_string(),
        ),
    )
    .map_err(|e| insert_err(e, "term number for this academic year"))?;
    Ok(json!({ "id": id, "name": name }))
}

fn terms_list(state: &AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let conn = require_db(state)?;
    let mut sql = String::from(
        "SELECT t.id, t.academic_year_id, t.term_number, t.name, t.start_date, t.end_date,
                t.is_current
         FROM terms t JOIN academic_years y ON y.id = t.academic_year_id",
    );
    let mut binds: Vec<String> = Vec::new();
    if let Some(year_id) = opt_param_str(req, "academicYearId") {
        sql.push_str(" WHERE t.academic_year_id = ?");
        binds.push(year_id.to_string());
    }
    sql.push_str(" ORDER BY y.start_date, t.term_number");

    let mut stmt = conn.prepare(&sql).map_err(db_err)?;
    let terms = stmt
        .query_map(rusqlite::params_from_iter(binds), |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "academicYearId": r.get::<_, String>(1)?,
                "termNumber": r.get::<_, i64>(2)?,
                "name": r.get::<_, String>(3)?,
                "startDate": r.get::<_, String>(4)?,
                "endDate": r.get::<_, String>(5)?,
                "isCurrent": r.get::<_, i64>(6)? != 0,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(db_err)?;
    Ok(json!({ "terms": terms }))
}

fn terms_set_current(state: &AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let conn = require_db(state)?;
    require_principal(conn, req)?;
    let id = param_str(req, "id")?;
    let flipped = db::set_current_term(conn, id)
        .map_err(|e| HandlerErr::new("db_query_failed", e.to_string()))?;
    if !flipped {
        return Err(HandlerErr::new("not_found", format!("term {id} not found")));
    }
    let (term_name, year_name): (String, String) = conn
        .query_row(
            "SELECT t.name, y.name FROM terms t
             JOIN academic_years y ON y.id = t.academic_year_id
             WHERE t.id = ?",
            [id],
            |r| Ok((r.get(0)?, r.get(1)?)),
        )
        .map_err(db_err)?;
    Ok(json!({ "currentTerm": term_name, "academicYear": year_name }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let result = match req.method.as_str() {
        "years.create" => years_create(state, req),
        "years.list" => years_list(state),
        "years.setCurrent" => years_set_current(state, req),
        "terms.create" => terms_create(state, req),
        "terms.list" => terms_list(state, req),
        "terms.setCurrent" => terms_set_current(state, req),
        _ => return None,
    };
    Some(match result {
        Ok(v) => ok(&req.id, v),
        Err(e) => e.response(&req.id),
    })
}
