//! Bulk mark reconciliation: turn a spreadsheet of scores into a consistent
//! batch of mark creates/updates, or a per-row rejection report. Both the
//! file import and the array upsert endpoint drive the same validate → plan
//! → commit stages, so the uniqueness and provenance rules live here once.

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::str::FromStr;

use chrono::{SecondsFormat, Utc};
use rusqlite::types::Value as SqlValue;
use rusqlite::{params_from_iter, Connection};
use rust_decimal::Decimal;
use thiserror::Error;
use uuid::Uuid;

use crate::auth;
use crate::db::UserRow;
use crate::tabular::Sheet;

pub const REQUIRED_COLUMNS: [&str; 5] = [
    "student_number",
    "subject_name",
    "subject_code",
    "score",
    "comment",
];
pub const MAX_COMMENT_CHARS: usize = 500;
pub const MAX_REPORTED_ROW_ERRORS: usize = 50;

/// Why one row was rejected. Row errors accumulate across the batch; they
/// never abort validation of sibling rows.
#[derive(Debug, Error)]
pub enum RowError {
    #[error("student {0} not found")]
    StudentNotFound(String),
    #[error("subject code {0} not found")]
    SubjectNotFound(String),
    #[error("score '{0}' is not a number")]
    ScoreNotNumeric(String),
    #[error("score {score} out of range (0-{max})")]
    OutOfRange { score: Decimal, max: Decimal },
    #[error("no assignment for {code} in {department} this term")]
    NoAssignment { code: String, department: String },
    #[error("not allowed to enter marks for {code} in {department}")]
    Forbidden { code: String, department: String },
}

/// Whole-batch failures. `MalformedInput` fires before any row is looked at;
/// `Storage` means the atomic commit (or a lookup under it) failed and
/// nothing was persisted.
#[derive(Debug, Error)]
pub enum ImportError {
    #[error("{0}")]
    MalformedInput(String),
    #[error("database error during import")]
    Storage(#[source] anyhow::Error),
}

#[derive(Debug, Clone)]
pub struct StudentRef {
    pub id: String,
    pub registration_number: String,
    pub department_id: String,
    pub department_name: String,
}

#[derive(Debug, Clone)]
pub struct SubjectRef {
    pub code: String,
    pub coefficient: Decimal,
    pub max_score: Decimal,
}

#[derive(Debug, Clone)]
pub struct AssignmentRef {
    pub id: String,
    pub subject_id: String,
    pub subject_code: String,
    pub department_id: String,
    pub department_name: String,
    pub teacher_id: Option<String>,
    pub coefficient: Decimal,
    pub max_score: Decimal,
}

/// Reference data for one batch, fetched up front so validation never goes
/// back to the database per row.
#[derive(Debug, Default)]
pub struct Catalog {
    /// Keyed by registration number.
    pub students: HashMap<String, StudentRef>,
    /// Keyed by upper-cased subject code.
    pub subjects: HashMap<String, SubjectRef>,
    /// Keyed by (subject code, department id), scoped to the batch's term.
    pub assignments: HashMap<(String, String), AssignmentRef>,
}

/// One data row lifted out of the sheet, still untyped. `line` is 1-indexed
/// over the whole sheet including the header, so the first data row is
/// line 2 -- the number a human sees in their spreadsheet program.
#[derive(Debug, Clone)]
pub struct RawRow {
    pub line: usize,
    pub student_number: String,
    pub subject_code: String,
    pub score: String,
    pub comment: String,
}

#[derive(Debug)]
pub struct NormalizedSheet {
    pub rows: Vec<RawRow>,
    /// Rows dropped for missing required cells. Not row errors: they do not
    /// gate the commit.
    pub skipped: usize,
}

/// Map the sheet onto the required columns and split off structurally
/// unusable rows. Header matching is case-insensitive.
pub fn normalize_sheet(sheet: &Sheet) -> Result<NormalizedSheet, ImportError> {
    let mut col_index: HashMap<String, usize> = HashMap::new();
    for (i, h) in sheet.headers.iter().enumerate() {
        col_index.entry(h.trim().to_ascii_lowercase()).or_insert(i);
    }

    let missing: Vec<&str> = REQUIRED_COLUMNS
        .iter()
        .filter(|c| !col_index.contains_key(**c))
        .copied()
        .collect();
    if !missing.is_empty() {
        return Err(ImportError::MalformedInput(format!(
            "missing columns: {}",
            missing.join(", ")
        )));
    }

    let cell = |row: &[String], name: &str| -> String {
        col_index
            .get(name)
            .and_then(|&i| row.get(i))
            .map(|c| c.trim().to_string())
            .unwrap_or_default()
    };

    let mut rows = Vec::new();
    let mut skipped = 0usize;
    for (i, raw) in sheet.rows.iter().enumerate() {
        if raw.iter().all(|c| c.trim().is_empty()) {
            // Trailing blank lines are not data at all.
            continue;
        }
        let student_number = cell(raw, "student_number");
        let subject_code = cell(raw, "subject_code").to_ascii_uppercase();
        let score = cell(raw, "score");
        if student_number.is_empty() || subject_code.is_empty() || score.is_empty() {
            skipped += 1;
            continue;
        }
        rows.push(RawRow {
            line: i + 2,
            student_number,
            subject_code,
            score,
            comment: cell(raw, "comment"),
        });
    }
    Ok(NormalizedSheet { rows, skipped })
}

fn in_placeholders(n: usize) -> String {
    std::iter::repeat_n("?", n).collect::<Vec<_>>().join(",")
}

/// Bulk pre-fetch of every student, subject and term-scoped assignment the
/// batch references. One query per table regardless of row count.
pub fn load_catalog(
    conn: &Connection,
    term_id: &str,
    assignment_id: Option<&str>,
    student_numbers: &HashSet<String>,
    subject_codes: &HashSet<String>,
) -> anyhow::Result<Catalog> {
    let mut catalog = Catalog::default();

    if !student_numbers.is_empty() {
        let sql = format!(
            "SELECT s.id, s.registration_number, s.department_id, d.name
             FROM students s JOIN departments d ON d.id = s.department_id
             WHERE s.registration_number IN ({})",
            in_placeholders(student_numbers.len())
        );
        let binds: Vec<SqlValue> = student_numbers
            .iter()
            .map(|n| SqlValue::Text(n.clone()))
            .collect();
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(binds), |r| {
            Ok(StudentRef {
                id: r.get(0)?,
                registration_number: r.get(1)?,
                department_id: r.get(2)?,
                department_name: r.get(3)?,
            })
        })?;
        for s in rows {
            let s = s?;
            catalog.students.insert(s.registration_number.clone(), s);
        }
    }

    if !subject_codes.is_empty() {
        let sql = format!(
            "SELECT code, coefficient, max_score FROM subjects WHERE code IN ({})",
            in_placeholders(subject_codes.len())
        );
        let binds: Vec<SqlValue> = subject_codes
            .iter()
            .map(|c| SqlValue::Text(c.clone()))
            .collect();
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(binds), |r| {
            Ok((
                r.get::<_, String>(0)?,
                r.get::<_, String>(1)?,
                r.get::<_, String>(2)?,
            ))
        })?;
        for row in rows {
            let (code, coefficient, max_score) = row?;
            let subject = SubjectRef {
                code,
                coefficient: parse_stored_decimal(&coefficient)?,
                max_score: parse_stored_decimal(&max_score)?,
            };
            catalog.subjects.insert(subject.code.clone(), subject);
        }

        let mut sql = format!(
            "SELECT a.id, a.subject_id, sub.code, a.department_id, d.name, a.teacher_id,
                    sub.coefficient, sub.max_score
             FROM subject_assignments a
             JOIN subjects sub ON sub.id = a.subject_id
             JOIN departments d ON d.id = a.department_id
             WHERE a.term_id = ? AND sub.code IN ({})",
            in_placeholders(subject_codes.len())
        );
        let mut binds: Vec<SqlValue> = vec![SqlValue::Text(term_id.to_string())];
        binds.extend(subject_codes.iter().map(|c| SqlValue::Text(c.clone())));
        if let Some(aid) = assignment_id {
            sql.push_str(" AND a.id = ?");
            binds.push(SqlValue::Text(aid.to_string()));
        }
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(binds), |r| {
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
        })?;
        for row in rows {
            let (id, subject_id, code, department_id, department_name, teacher_id, coeff, max) =
                row?;
            let a = AssignmentRef {
                id,
                subject_id,
                subject_code: code.clone(),
                department_id: department_id.clone(),
                department_name,
                teacher_id,
                coefficient: parse_stored_decimal(&coeff)?,
                max_score: parse_stored_decimal(&max)?,
            };
            catalog.assignments.insert((code, department_id), a);
        }
    }

    Ok(catalog)
}

fn parse_stored_decimal(text: &str) -> anyhow::Result<Decimal> {
    Decimal::from_str(text).map_err(|e| anyhow::anyhow!("bad decimal '{}' in store: {}", text, e))
}

/// Memoizes scope decisions per (subject, department) pair so a
/// thousand-row batch asks each question once.
pub struct ScopeMemo<'a> {
    conn: &'a Connection,
    user: &'a UserRow,
    cache: HashMap<(String, String), bool>,
}

impl<'a> ScopeMemo<'a> {
    pub fn new(conn: &'a Connection, user: &'a UserRow) -> Self {
        Self {
            conn,
            user,
            cache: HashMap::new(),
        }
    }

    /// Batches are pinned to one term, so on top of the general scope check
    /// a teacher must be the assignee on the term-scoped assignment itself.
    pub fn allows(&mut self, assignment: &AssignmentRef) -> anyhow::Result<bool> {
        let key = (
            assignment.subject_id.clone(),
            assignment.department_id.clone(),
        );
        if let Some(&v) = self.cache.get(&key) {
            return Ok(v);
        }
        let mut allowed = auth::can_edit_marks(
            self.conn,
            self.user,
            &assignment.subject_id,
            &assignment.department_id,
        )?;
        if allowed && self.user.role == "teacher" {
            allowed = assignment.teacher_id.as_deref() == Some(self.user.id.as_str());
        }
        self.cache.insert(key, allowed);
        Ok(allowed)
    }
}

/// A row that passed every check, ready for planning.
#[derive(Debug, Clone)]
pub struct ValidRow {
    pub student_id: String,
    pub assignment_id: String,
    pub coefficient: Decimal,
    pub score: Decimal,
    pub comment: String,
}

#[derive(Debug)]
pub enum RowOutcome {
    Valid(ValidRow),
    Rejected { line: usize, reason: RowError },
}

/// Validate one row against the pre-fetched catalog. Row-local: shared state
/// is never mutated, and a reject here says nothing about sibling rows.
pub fn validate_row(
    raw: &RawRow,
    catalog: &Catalog,
    scope: &mut ScopeMemo,
) -> anyhow::Result<RowOutcome> {
    let rejected = |reason| {
        Ok(RowOutcome::Rejected {
            line: raw.line,
            reason,
        })
    };

    let Some(student) = catalog.students.get(&raw.student_number) else {
        return rejected(RowError::StudentNotFound(raw.student_number.clone()));
    };
    let Some(subject) = catalog.subjects.get(&raw.subject_code) else {
        return rejected(RowError::SubjectNotFound(raw.subject_code.clone()));
    };

    let Ok(score) = Decimal::from_str(&raw.score) else {
        return rejected(RowError::ScoreNotNumeric(raw.score.clone()));
    };
    if score < Decimal::ZERO || score > subject.max_score {
        return rejected(RowError::OutOfRange {
            score,
            max: subject.max_score,
        });
    }

    let key = (raw.subject_code.clone(), student.department_id.clone());
    let Some(assignment) = catalog.assignments.get(&key) else {
        return rejected(RowError::NoAssignment {
            code: raw.subject_code.clone(),
            department: student.department_name.clone(),
        });
    };

    if !scope.allows(assignment)? {
        return rejected(RowError::Forbidden {
            code: raw.subject_code.clone(),
            department: student.department_name.clone(),
        });
    }

    Ok(RowOutcome::Valid(ValidRow {
        student_id: student.id.clone(),
        assignment_id: assignment.id.clone(),
        coefficient: subject.coefficient,
        score,
        comment: truncate_comment(&raw.comment),
    }))
}

pub fn truncate_comment(comment: &str) -> String {
    comment.chars().take(MAX_COMMENT_CHARS).collect()
}

/// One write the committer will apply. `total_mark` is derived here so the
/// committer is a pure apply step.
#[derive(Debug, Clone)]
pub struct MarkWrite {
    pub mark_id: String,
    pub student_id: String,
    pub assignment_id: String,
    pub score: Decimal,
    pub total_mark: Decimal,
    pub comment: String,
}

#[derive(Debug, Default)]
pub struct Plan {
    pub creates: Vec<MarkWrite>,
    pub updates: Vec<MarkWrite>,
}

/// Which marks already exist for the batch's keys, fetched as one query.
pub fn fetch_existing_marks(
    conn: &Connection,
    rows: &[ValidRow],
) -> anyhow::Result<HashMap<(String, String), String>> {
    let mut existing = HashMap::new();
    if rows.is_empty() {
        return Ok(existing);
    }
    let student_ids: HashSet<&str> = rows.iter().map(|r| r.student_id.as_str()).collect();
    let assignment_ids: HashSet<&str> = rows.iter().map(|r| r.assignment_id.as_str()).collect();

    let sql = format!(
        "SELECT id, student_id, subject_assignment_id FROM marks
         WHERE student_id IN ({}) AND subject_assignment_id IN ({})",
        in_placeholders(student_ids.len()),
        in_placeholders(assignment_ids.len())
    );
    let mut binds: Vec<SqlValue> = Vec::with_capacity(student_ids.len() + assignment_ids.len());
    binds.extend(student_ids.iter().map(|s| SqlValue::Text(s.to_string())));
    binds.extend(assignment_ids.iter().map(|s| SqlValue::Text(s.to_string())));

    let mut stmt = conn.prepare(&sql)?;
    let found = stmt.query_map(params_from_iter(binds), |r| {
        Ok((
            r.get::<_, String>(0)?,
            r.get::<_, String>(1)?,
            r.get::<_, String>(2)?,
        ))
    })?;
    for row in found {
        let (id, student_id, assignment_id) = row?;
        existing.insert((student_id, assignment_id), id);
    }
    Ok(existing)
}

/// Partition validated rows into creates and updates. Duplicate
/// (student, assignment) keys collapse to the later row, matching what a
/// human means when they correct a value further down the sheet.
pub fn plan_batch(rows: &[ValidRow], existing: &HashMap<(String, String), String>) -> Plan {
    let mut order: Vec<(String, String)> = Vec::new();
    let mut latest: HashMap<(String, String), &ValidRow> = HashMap::new();
    for row in rows {
        let key = (row.student_id.clone(), row.assignment_id.clone());
        if latest.insert(key.clone(), row).is_none() {
            order.push(key);
        }
    }

    let mut plan = Plan::default();
    for key in order {
        let row = latest[&key];
        let write = MarkWrite {
            mark_id: existing
                .get(&key)
                .cloned()
                .unwrap_or_else(|| Uuid::new_v4().to_string()),
            student_id: row.student_id.clone(),
            assignment_id: row.assignment_id.clone(),
            score: row.score.normalize(),
            total_mark: (row.score * row.coefficient).normalize(),
            comment: row.comment.clone(),
        };
        if existing.contains_key(&key) {
            plan.updates.push(write);
        } else {
            plan.creates.push(write);
        }
    }
    plan
}

/// Apply the plan in one transaction. Every write stamps
/// `entered_by = acting user`; the first write for a key stamps `entered_at`
/// and leaves the modified pair NULL, every later write (the update path, or
/// a create that hits the conflict safety net) sets `modified_by` and
/// `modified_at` while `entered_at` stays untouched.
pub fn commit(
    conn: &Connection,
    acting_user_id: &str,
    plan: &Plan,
) -> anyhow::Result<(usize, usize)> {
    let tx = conn.unchecked_transaction()?;
    let now = Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true);
    {
        let mut insert = tx.prepare(
            "INSERT INTO marks(id, student_id, subject_assignment_id, score, total_mark,
                               comment, entered_by, entered_at)
             VALUES(?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(student_id, subject_assignment_id) DO UPDATE SET
               score = excluded.score,
               total_mark = excluded.total_mark,
               comment = excluded.comment,
               entered_by = excluded.entered_by,
               modified_by = excluded.entered_by,
               modified_at = excluded.entered_at",
        )?;
        for m in &plan.creates {
            insert.execute((
                &m.mark_id,
                &m.student_id,
                &m.assignment_id,
                m.score.to_string(),
                m.total_mark.to_string(),
                &m.comment,
                acting_user_id,
                &now,
            ))?;
        }

        let mut update = tx.prepare(
            "UPDATE marks SET score = ?, total_mark = ?, comment = ?,
                              entered_by = ?, modified_by = ?, modified_at = ?
             WHERE id = ?",
        )?;
        for m in &plan.updates {
            update.execute((
                m.score.to_string(),
                m.total_mark.to_string(),
                &m.comment,
                acting_user_id,
                acting_user_id,
                &now,
                &m.mark_id,
            ))?;
        }
    }
    tx.commit()?;
    Ok((plan.creates.len(), plan.updates.len()))
}

#[derive(Debug)]
pub struct ImportSummary {
    pub created: usize,
    pub updated: usize,
    pub skipped: usize,
}

#[derive(Debug)]
pub struct ValidationReport {
    /// Human-readable "Row N: reason" strings, capped at
    /// `MAX_REPORTED_ROW_ERRORS`.
    pub errors: Vec<String>,
    pub total_errors: usize,
    pub to_create: usize,
    pub to_update: usize,
    pub skipped: usize,
}

#[derive(Debug)]
pub enum ImportOutcome {
    Committed(ImportSummary),
    Rejected(ValidationReport),
}

/// Top-level driver for a file import. Storage is only touched for reads
/// until every row has validated clean; a single row error downgrades the
/// whole run to a counts-only preview.
pub fn run_import(
    conn: &Connection,
    acting: &UserRow,
    path: &Path,
    term_id: &str,
    assignment_id: Option<&str>,
) -> Result<ImportOutcome, ImportError> {
    let sheet =
        crate::tabular::read_table(path).map_err(|e| ImportError::MalformedInput(e.to_string()))?;
    let NormalizedSheet { rows, skipped } = normalize_sheet(&sheet)?;

    let student_numbers: HashSet<String> =
        rows.iter().map(|r| r.student_number.clone()).collect();
    let subject_codes: HashSet<String> = rows.iter().map(|r| r.subject_code.clone()).collect();
    let catalog = load_catalog(conn, term_id, assignment_id, &student_numbers, &subject_codes)
        .map_err(ImportError::Storage)?;

    let mut scope = ScopeMemo::new(conn, acting);
    let mut valid: Vec<ValidRow> = Vec::new();
    let mut errors: Vec<String> = Vec::new();
    for raw in &rows {
        match validate_row(raw, &catalog, &mut scope).map_err(ImportError::Storage)? {
            RowOutcome::Valid(v) => valid.push(v),
            RowOutcome::Rejected { line, reason } => errors.push(format!("Row {line}: {reason}")),
        }
    }

    let existing = fetch_existing_marks(conn, &valid).map_err(ImportError::Storage)?;
    let plan = plan_batch(&valid, &existing);

    if !errors.is_empty() {
        let total_errors = errors.len();
        errors.truncate(MAX_REPORTED_ROW_ERRORS);
        tracing::warn!(
            total_errors,
            to_create = plan.creates.len(),
            to_update = plan.updates.len(),
            "mark import rejected by validation"
        );
        return Ok(ImportOutcome::Rejected(ValidationReport {
            errors,
            total_errors,
            to_create: plan.creates.len(),
            to_update: plan.updates.len(),
            skipped,
        }));
    }

    let (created, updated) = commit(conn, &acting.id, &plan).map_err(ImportError::Storage)?;
    tracing::info!(
        created,
        updated,
        skipped,
        user = %acting.id,
        "mark import committed"
    );
    Ok(ImportOutcome::Committed(ImportSummary {
        created,
        updated,
        skipped,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;

    fn dec(s: &str) -> Decimal {
        Decimal::from_str(s).unwrap()
    }

    fn sheet(headers: &[&str], rows: &[&[&str]]) -> Sheet {
        Sheet {
            headers: headers.iter().map(|s| s.to_string()).collect(),
            rows: rows
                .iter()
                .map(|r| r.iter().map(|s| s.to_string()).collect())
                .collect(),
        }
    }

    #[test]
    fn normalize_rejects_missing_columns() {
        let s = sheet(&["student_number", "score"], &[]);
        let err = normalize_sheet(&s).unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("missing columns"), "{msg}");
        assert!(msg.contains("subject_code"), "{msg}");
    }

    #[test]
    fn normalize_is_header_case_insensitive_and_counts_skips() {
        let s = sheet(
            &["Student_Number", "SUBJECT_NAME", "Subject_Code", "Score", "Comment"],
            &[
                &["S001", "Circuits", "elec101", "17.5", " ok "],
                &["", "Circuits", "ELEC101", "12", ""],
                &["S002", "Circuits", "ELEC101", "", ""],
                &["", "", "", "", ""],
            ],
        );
        let n = normalize_sheet(&s).unwrap();
        assert_eq!(n.rows.len(), 1);
        assert_eq!(n.skipped, 2);
        let row = &n.rows[0];
        assert_eq!(row.line, 2);
        assert_eq!(row.subject_code, "ELEC101");
        assert_eq!(row.comment, "ok");
    }

    fn seeded_workspace() -> (Connection, UserRow, UserRow) {
        let dir = std::env::temp_dir().join(format!("marksd-import-{}", Uuid::new_v4()));
        let conn = db::open_db(&dir).expect("open db");
        let now = "2025-09-01T00:00:00Z";

        conn.execute_batch(
            "INSERT INTO departments(id, name, slug) VALUES('d1', 'Electricity', 'electricity');
             INSERT INTO class_rooms(id, name) VALUES('c1', 'Form 1');
             INSERT INTO department_class_rooms(department_id, class_room_id) VALUES('d1', 'c1');
             INSERT INTO subjects(id, name, code, coefficient, max_score)
               VALUES('sub1', 'Circuits', 'ELEC101', '2.5', '20');
             INSERT INTO academic_years(id, name, start_date, end_date)
               VALUES('y1', '2025/2026', '2025-09-01', '2026-06-30');
             INSERT INTO terms(id, academic_year_id, term_number, name, start_date, end_date)
               VALUES('t1', 'y1', 1, 'Term 1', '2025-09-01', '2025-12-15');",
        )
        .unwrap();
        for (id, role) in [("u-p", "principal"), ("u-t", "teacher"), ("u-s1", "student")] {
            conn.execute(
                "INSERT INTO users(id, email, first_name, last_name, role, created_at)
                 VALUES(?, ?, 'A', 'B', ?, ?)",
                (id, format!("{id}@school.test"), role, now),
            )
            .unwrap();
        }
        conn.execute(
            "INSERT INTO user_subjects(user_id, subject_id) VALUES('u-t', 'sub1')",
            [],
        )
        .unwrap();
        conn.execute(
            "INSERT INTO subject_assignments(id, subject_id, department_id, term_id, teacher_id)
             VALUES('a1', 'sub1', 'd1', 't1', 'u-t')",
            [],
        )
        .unwrap();
        conn.execute(
            "INSERT INTO students(id, user_id, registration_number, department_id, current_class_id)
             VALUES('st1', 'u-s1', 'S001', 'd1', 'c1')",
            [],
        )
        .unwrap();

        let principal = db::get_user(&conn, "u-p").unwrap().unwrap();
        let teacher = db::get_user(&conn, "u-t").unwrap().unwrap();
        (conn, principal, teacher)
    }

    fn raw(line: usize, number: &str, code: &str, score: &str, comment: &str) -> RawRow {
        RawRow {
            line,
            student_number: number.to_string(),
            subject_code: code.to_string(),
            score: score.to_string(),
            comment: comment.to_string(),
        }
    }

    fn catalog_for(conn: &Connection) -> Catalog {
        let numbers: HashSet<String> = ["S001", "S999"].iter().map(|s| s.to_string()).collect();
        let codes: HashSet<String> = ["ELEC101", "NOPE9"].iter().map(|s| s.to_string()).collect();
        load_catalog(conn, "t1", None, &numbers, &codes).unwrap()
    }

    #[test]
    fn validator_resolves_and_bounds_scores() {
        let (conn, _, teacher) = seeded_workspace();
        let catalog = catalog_for(&conn);
        let mut scope = ScopeMemo::new(&conn, &teacher);

        // Exactly max_score passes.
        let ok = validate_row(&raw(2, "S001", "ELEC101", "20", "top"), &catalog, &mut scope)
            .unwrap();
        let RowOutcome::Valid(v) = ok else {
            panic!("expected valid row");
        };
        assert_eq!(v.score, dec("20"));
        assert_eq!(v.coefficient, dec("2.5"));

        // A hair over max_score is rejected and the message names the bound.
        let over = validate_row(
            &raw(3, "S001", "ELEC101", "20.01", ""),
            &catalog,
            &mut scope,
        )
        .unwrap();
        let RowOutcome::Rejected { line, reason } = over else {
            panic!("expected reject");
        };
        assert_eq!(line, 3);
        assert!(matches!(reason, RowError::OutOfRange { .. }));
        assert!(reason.to_string().contains("0-20"), "{reason}");

        let negative =
            validate_row(&raw(4, "S001", "ELEC101", "-1", ""), &catalog, &mut scope).unwrap();
        assert!(matches!(
            negative,
            RowOutcome::Rejected {
                reason: RowError::OutOfRange { .. },
                ..
            }
        ));

        let garbled =
            validate_row(&raw(5, "S001", "ELEC101", "abc", ""), &catalog, &mut scope).unwrap();
        assert!(matches!(
            garbled,
            RowOutcome::Rejected {
                reason: RowError::ScoreNotNumeric(_),
                ..
            }
        ));

        let unknown_student =
            validate_row(&raw(6, "S999", "ELEC101", "10", ""), &catalog, &mut scope).unwrap();
        assert!(matches!(
            unknown_student,
            RowOutcome::Rejected {
                reason: RowError::StudentNotFound(_),
                ..
            }
        ));

        let unknown_subject =
            validate_row(&raw(7, "S001", "NOPE9", "10", ""), &catalog, &mut scope).unwrap();
        assert!(matches!(
            unknown_subject,
            RowOutcome::Rejected {
                reason: RowError::SubjectNotFound(_),
                ..
            }
        ));
    }

    #[test]
    fn validator_requires_term_scoped_assignment_and_scope() {
        let (conn, _, teacher) = seeded_workspace();

        // Same subject, later term: no assignment exists there.
        conn.execute(
            "INSERT INTO terms(id, academic_year_id, term_number, name, start_date, end_date)
             VALUES('t2', 'y1', 2, 'Term 2', '2026-01-05', '2026-03-30')",
            [],
        )
        .unwrap();
        let numbers: HashSet<String> = [String::from("S001")].into_iter().collect();
        let codes: HashSet<String> = [String::from("ELEC101")].into_iter().collect();
        let catalog = load_catalog(&conn, "t2", None, &numbers, &codes).unwrap();
        let mut scope = ScopeMemo::new(&conn, &teacher);
        let out = validate_row(&raw(2, "S001", "ELEC101", "10", ""), &catalog, &mut scope)
            .unwrap();
        assert!(matches!(
            out,
            RowOutcome::Rejected {
                reason: RowError::NoAssignment { .. },
                ..
            }
        ));

        // A different teacher on the term's assignment is out of scope even
        // though they teach the subject elsewhere.
        conn.execute(
            "INSERT INTO users(id, email, first_name, last_name, role, created_at)
             VALUES('u-t2', 'other@school.test', 'C', 'D', 'teacher', '2025-09-01T00:00:00Z')",
            [],
        )
        .unwrap();
        conn.execute(
            "INSERT INTO user_subjects(user_id, subject_id) VALUES('u-t2', 'sub1')",
            [],
        )
        .unwrap();
        let other = db::get_user(&conn, "u-t2").unwrap().unwrap();
        let catalog = load_catalog(&conn, "t1", None, &numbers, &codes).unwrap();
        let mut scope = ScopeMemo::new(&conn, &other);
        let out = validate_row(&raw(2, "S001", "ELEC101", "10", ""), &catalog, &mut scope)
            .unwrap();
        assert!(matches!(
            out,
            RowOutcome::Rejected {
                reason: RowError::Forbidden { .. },
                ..
            }
        ));
    }

    #[test]
    fn comment_truncates_on_char_boundary() {
        let long: String = "é".repeat(MAX_COMMENT_CHARS + 40);
        let cut = truncate_comment(&long);
        assert_eq!(cut.chars().count(), MAX_COMMENT_CHARS);
    }

    #[test]
    fn planner_dedupes_last_row_wins() {
        let rows = vec![
            ValidRow {
                student_id: "st1".into(),
                assignment_id: "a1".into(),
                coefficient: dec("2.5"),
                score: dec("10"),
                comment: "first".into(),
            },
            ValidRow {
                student_id: "st1".into(),
                assignment_id: "a1".into(),
                coefficient: dec("2.5"),
                score: dec("15"),
                comment: "corrected".into(),
            },
        ];
        let plan = plan_batch(&rows, &HashMap::new());
        assert_eq!(plan.creates.len(), 1);
        assert!(plan.updates.is_empty());
        assert_eq!(plan.creates[0].score, dec("15"));
        assert_eq!(plan.creates[0].comment, "corrected");
        // Exact decimal derivation, no float drift.
        assert_eq!(plan.creates[0].total_mark, dec("37.5"));
    }

    #[test]
    fn planner_routes_existing_keys_to_updates() {
        let rows = vec![ValidRow {
            student_id: "st1".into(),
            assignment_id: "a1".into(),
            coefficient: dec("2"),
            score: dec("8"),
            comment: String::new(),
        }];
        let mut existing = HashMap::new();
        existing.insert(("st1".to_string(), "a1".to_string()), "m-old".to_string());
        let plan = plan_batch(&rows, &existing);
        assert!(plan.creates.is_empty());
        assert_eq!(plan.updates.len(), 1);
        assert_eq!(plan.updates[0].mark_id, "m-old");
        assert_eq!(plan.updates[0].total_mark, dec("16"));
    }

    fn mark_row(conn: &Connection, student: &str, assignment: &str) -> (String, String, Option<String>, String, Option<String>) {
        conn.query_row(
            "SELECT score, total_mark, modified_by, entered_at, modified_at
             FROM marks WHERE student_id = ? AND subject_assignment_id = ?",
            [student, assignment],
            |r| {
                Ok((
                    r.get(0)?,
                    r.get(1)?,
                    r.get(2)?,
                    r.get(3)?,
                    r.get(4)?,
                ))
            },
        )
        .unwrap()
    }

    #[test]
    fn commit_stamps_provenance_once_then_tracks_modification() {
        let (conn, _, teacher) = seeded_workspace();
        let rows = vec![ValidRow {
            student_id: "st1".into(),
            assignment_id: "a1".into(),
            coefficient: dec("2.5"),
            score: dec("14"),
            comment: "solid".into(),
        }];
        let plan = plan_batch(&rows, &HashMap::new());
        let (created, updated) = commit(&conn, &teacher.id, &plan).unwrap();
        assert_eq!((created, updated), (1, 0));

        let (score, total, modified_by, entered_at, modified_at) = mark_row(&conn, "st1", "a1");
        assert_eq!(score, "14");
        assert_eq!(total, "35");
        assert!(modified_by.is_none());
        assert!(modified_at.is_none());

        // Second pass over the same key becomes an update with modification
        // provenance; entered_at never moves.
        let rows = vec![ValidRow {
            student_id: "st1".into(),
            assignment_id: "a1".into(),
            coefficient: dec("2.5"),
            score: dec("16"),
            comment: "better".into(),
        }];
        let existing = fetch_existing_marks(&conn, &rows).unwrap();
        let plan = plan_batch(&rows, &existing);
        let (created, updated) = commit(&conn, &teacher.id, &plan).unwrap();
        assert_eq!((created, updated), (0, 1));

        let (score, total, modified_by, entered_at_after, modified_at) =
            mark_row(&conn, "st1", "a1");
        assert_eq!(score, "16");
        assert_eq!(total, "40");
        assert_eq!(modified_by.as_deref(), Some(teacher.id.as_str()));
        assert!(modified_at.is_some());
        assert_eq!(entered_at_after, entered_at);

        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM marks", [], |r| r.get(0))
            .unwrap();
        assert_eq!(count, 1);
    }

    #[test]
    fn commit_upsert_absorbs_race_between_plan_and_write() {
        let (conn, _, teacher) = seeded_workspace();

        // Planned as a create against an empty table...
        let rows = vec![ValidRow {
            student_id: "st1".into(),
            assignment_id: "a1".into(),
            coefficient: dec("2.5"),
            score: dec("12"),
            comment: String::new(),
        }];
        let plan = plan_batch(&rows, &HashMap::new());

        // ...but a concurrent single-row write lands first.
        conn.execute(
            "INSERT INTO marks(id, student_id, subject_assignment_id, score, total_mark,
                               comment, entered_by, entered_at)
             VALUES('m-race', 'st1', 'a1', '5', '12.5', '', 'u-p', '2025-10-01T00:00:00Z')",
            [],
        )
        .unwrap();

        commit(&conn, &teacher.id, &plan).unwrap();

        let (score, total, modified_by, entered_at, _) = mark_row(&conn, "st1", "a1");
        assert_eq!(score, "12");
        assert_eq!(total, "30");
        assert_eq!(modified_by.as_deref(), Some(teacher.id.as_str()));
        assert_eq!(entered_at, "2025-10-01T00:00:00Z");
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM marks", [], |r| r.get(0))
            .unwrap();
        assert_eq!(count, 1);
    }

    #[test]
    fn run_import_rejects_whole_batch_on_any_row_error() {
        let (conn, _, teacher) = seeded_workspace();
        let dir = std::env::temp_dir().join(format!("marksd-import-file-{}", Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("marks.csv");
        std::fs::write(
            &path,
            "student_number,subject_name,subject_code,score,comment\n\
             S001,Circuits,ELEC101,15,fine\n\
             S404,Circuits,ELEC101,10,ghost\n",
        )
        .unwrap();

        let out = run_import(&conn, &teacher, &path, "t1", None).unwrap();
        let ImportOutcome::Rejected(report) = out else {
            panic!("expected rejection");
        };
        assert_eq!(report.total_errors, 1);
        assert_eq!(report.errors.len(), 1);
        assert!(report.errors[0].starts_with("Row 3:"), "{}", report.errors[0]);
        assert_eq!(report.to_create, 1);
        assert_eq!(report.to_update, 0);

        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM marks", [], |r| r.get(0))
            .unwrap();
        assert_eq!(count, 0, "validation gate must keep storage untouched");
    }

    #[test]
    fn run_import_commits_and_is_idempotent() {
        let (conn, _, teacher) = seeded_workspace();
        let dir = std::env::temp_dir().join(format!("marksd-import-ok-{}", Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("marks.csv");
        std::fs::write(
            &path,
            "student_number,subject_name,subject_code,score,comment\n\
             S001,Circuits,ELEC101,15,steady\n",
        )
        .unwrap();

        let out = run_import(&conn, &teacher, &path, "t1", None).unwrap();
        let ImportOutcome::Committed(summary) = out else {
            panic!("expected commit");
        };
        assert_eq!(summary.created, 1);
        assert_eq!(summary.updated, 0);

        let again = run_import(&conn, &teacher, &path, "t1", None).unwrap();
        let ImportOutcome::Committed(summary) = again else {
            panic!("expected commit");
        };
        assert_eq!(summary.created, 0);
        assert_eq!(summary.updated, 1);

        let (score, total, _, _, _) = mark_row(&conn, "st1", "a1");
        assert_eq!(score, "15");
        assert_eq!(total, "37.5");
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM marks", [], |r| r.get(0))
            .unwrap();
        assert_eq!(count, 1);
    }

    #[test]
    fn run_import_fails_fast_on_bad_file() {
        let (conn, _, teacher) = seeded_workspace();
        let err = run_import(
            &conn,
            &teacher,
            Path::new("/nonexistent/marks.pdf"),
            "t1",
            None,
        )
        .unwrap_err();
        assert!(matches!(err, ImportError::MalformedInput(_)));
    }
}
