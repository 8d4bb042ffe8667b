use rusqlite::{Connection, OptionalExtension};
use std::path::Path;

pub const DB_FILE: &str = "marks.sqlite3";

pub fn open_db(workspace: &Path) -> anyhow::Result<Connection> {
    std::fs::create_dir_all(workspace)?;
    let db_path = workspace.join(DB_FILE);
    let conn = Connection::open(db_path)?;
    init_schema(&conn)?;
    Ok(conn)
}

/// Open a second connection to an already-selected workspace. The import
/// committer uses this from its worker thread; SQLite serializes the writes.
pub fn open_existing(workspace: &Path) -> anyhow::Result<Connection> {
    let conn = Connection::open(workspace.join(DB_FILE))?;
    conn.execute("PRAGMA foreign_keys = ON", [])?;
    conn.busy_timeout(std::time::Duration::from_secs(5))?;
    Ok(conn)
}

fn init_schema(conn: &Connection) -> anyhow::Result<()> {
    conn.execute("PRAGMA foreign_keys = ON", [])?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS departments(
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            slug TEXT NOT NULL UNIQUE
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS class_rooms(
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS department_class_rooms(
            department_id TEXT NOT NULL,
            class_room_id TEXT NOT NULL,
            PRIMARY KEY(department_id, class_room_id),
            FOREIGN KEY(department_id) REFERENCES departments(id),
            FOREIGN KEY(class_room_id) REFERENCES class_rooms(id)
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS users(
            id TEXT PRIMARY KEY,
            email TEXT NOT NULL UNIQUE,
            first_name TEXT NOT NULL,
            last_name TEXT NOT NULL,
            role TEXT NOT NULL CHECK(role IN ('principal','teacher','student','parent')),
            department_id TEXT,
            created_at TEXT NOT NULL,
            FOREIGN KEY(department_id) REFERENCES departments(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_users_role ON users(role)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS subjects(
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            code TEXT NOT NULL UNIQUE,
            coefficient TEXT NOT NULL,
            max_score TEXT NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS user_subjects(
            user_id TEXT NOT NULL,
            subject_id TEXT NOT NULL,
            PRIMARY KEY(user_id, subject_id),
            FOREIGN KEY(user_id) REFERENCES users(id),
            FOREIGN KEY(subject_id) REFERENCES subjects(id)
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS academic_years(
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL UNIQUE,
            start_date TEXT NOT NULL,
            end_date TEXT NOT NULL,
            is_current INTEGER NOT NULL DEFAULT 0
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS terms(
            id TEXT PRIMARY KEY,
            academic_year_id TEXT NOT NULL,
            term_number INTEGER NOT NULL CHECK(term_number IN (1, 2, 3)),
            name TEXT NOT NULL,
            start_date TEXT NOT NULL,
            end_date TEXT NOT NULL,
            is_current INTEGER NOT NULL DEFAULT 0,
            UNIQUE(academic_year_id, term_number),
            FOREIGN KEY(academic_year_id) REFERENCES academic_years(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_terms_year ON terms(academic_year_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS subject_assignments(
            id TEXT PRIMARY KEY,
            subject_id TEXT NOT NULL,
            department_id TEXT NOT NULL,
            term_id TEXT NOT NULL,
            teacher_id TEXT,
            UNIQUE(subject_id, department_id, term_id),
            FOREIGN KEY(subject_id) REFERENCES subjects(id),
            FOREIGN KEY(department_id) REFERENCES departments(id),
            FOREIGN KEY(term_id) REFERENCES terms(id),
            FOREIGN KEY(teacher_id) REFERENCES users(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_assignments_term ON subject_assignments(term_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_assignments_teacher ON subject_assignments(teacher_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS students(
            id TEXT PRIMARY KEY,
            user_id TEXT NOT NULL UNIQUE,
            registration_number TEXT NOT NULL UNIQUE,
            department_id TEXT NOT NULL,
            current_class_id TEXT NOT NULL,
            FOREIGN KEY(user_id) REFERENCES users(id),
            FOREIGN KEY(department_id) REFERENCES departments(id),
            FOREIGN KEY(current_class_id) REFERENCES class_rooms(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_students_department ON students(department_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS marks(
            id TEXT PRIMARY KEY,
            student_id TEXT NOT NULL,
            subject_assignment_id TEXT NOT NULL,
            score TEXT NOT NULL,
            total_mark TEXT NOT NULL,
            comment TEXT NOT NULL DEFAULT '',
            entered_by TEXT,
            entered_at TEXT NOT NULL,
            modified_by TEXT,
            modified_at TEXT,
            UNIQUE(student_id, subject_assignment_id),
            FOREIGN KEY(student_id) REFERENCES students(id),
            FOREIGN KEY(subject_assignment_id) REFERENCES subject_assignments(id),
            FOREIGN KEY(entered_by) REFERENCES users(id),
            FOREIGN KEY(modified_by) REFERENCES users(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_marks_student ON marks(student_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_marks_assignment ON marks(subject_assignment_id)",
        [],
    )?;

    Ok(())
}

/// Flip the current academic year to `year_id`. Clear-all then set-one in a
/// single transaction so at most one row ever carries the flag.
/// Returns false without clearing anything when the id does not resolve.
pub fn set_current_academic_year(conn: &Connection, year_id: &str) -> anyhow::Result<bool> {
    let tx = conn.unchecked_transaction()?;
    let exists: Option<String> = tx
        .query_row("SELECT id FROM academic_years WHERE id = ?", [year_id], |r| {
            r.get(0)
        })
        .optional()?;
    if exists.is_none() {
        return Ok(false);
    }
    tx.execute(
        "UPDATE academic_years SET is_current = 0 WHERE is_current = 1",
        [],
    )?;
    tx.execute(
        "UPDATE academic_years SET is_current = 1 WHERE id = ?",
        [year_id],
    )?;
    tx.commit()?;
    Ok(true)
}

/// Same singleton capability for terms.
pub fn set_current_term(conn: &Connection, term_id: &str) -> anyhow::Result<bool> {
    let tx = conn.unchecked_transaction()?;
    let exists: Option<String> = tx
        .query_row("SELECT id FROM terms WHERE id = ?", [term_id], |r| r.get(0))
        .optional()?;
    if exists.is_none() {
        return Ok(false);
    }
    tx.execute("UPDATE terms SET is_current = 0 WHERE is_current = 1", [])?;
    tx.execute("UPDATE terms SET is_current = 1 WHERE id = ?", [term_id])?;
    tx.commit()?;
    Ok(true)
}

#[derive(Debug, Clone)]
pub struct UserRow {
    pub id: String,
    pub first_name: String,
    pub last_name: String,
    pub role: String,
}

impl UserRow {
    pub fn full_name(&self) -> String {
        format!("{} {}", self.first_name, self.last_name)
            .trim()
            .to_string()
    }
}

pub fn get_user(conn: &Connection, user_id: &str) -> anyhow::Result<Option<UserRow>> {
    let row = conn
        .query_row(
            "SELECT id, first_name, last_name, role FROM users WHERE id = ?",
            [user_id],
            |r| {
                Ok(UserRow {
                    id: r.get(0)?,
                    first_name: r.get(1)?,
                    last_name: r.get(2)?,
                    role: r.get(3)?,
                })
            },
        )
        .optional()?;
    Ok(row)
}
