use rusqlite::Connection;

use crate::db::UserRow;

/// Decide whether `user` may write marks for `subject_id` within
/// `department_id`. Pure read, no side effects.
///
/// Principals may always write. Teachers may write iff the subject is in
/// their taught set and some assignment binds (subject, department, them)
/// for any term. Term pinning for bulk imports is the orchestrator's job:
/// its assignment map is already scoped to the batch's target term.
/// Students and parents never get write access.
pub fn can_edit_marks(
    conn: &Connection,
    user: &UserRow,
    subject_id: &str,
    department_id: &str,
) -> anyhow::Result<bool> {
    match user.role.as_str() {
        "principal" => Ok(true),
        "teacher" => {
            let teaches: i64 = conn.query_row(
                "SELECT COUNT(*) FROM user_subjects WHERE user_id = ? AND subject_id = ?",
                [&user.id, &subject_id.to_string()],
                |r| r.get(0),
            )?;
            if teaches == 0 {
                return Ok(false);
            }
            let assigned: i64 = conn.query_row(
                "SELECT COUNT(*) FROM subject_assignments
                 WHERE subject_id = ? AND department_id = ? AND teacher_id = ?",
                [subject_id, department_id, user.id.as_str()],
                |r| r.get(0),
            )?;
            Ok(assigned > 0)
        }
        _ => Ok(false),
    }
}
