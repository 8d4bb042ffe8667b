use serde_json::json;
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::time::{SystemTime, UNIX_EPOCH};

fn temp_dir(prefix: &str) -> PathBuf {
    let p = std::env::temp_dir().join(format!(
        "{}-{}",
        prefix,
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock")
            .as_nanos()
    ));
    std::fs::create_dir_all(&p).expect("create temp dir");
    p
}

fn spawn_sidecar() -> (Child, ChildStdin, BufReader<ChildStdout>) {
    let exe = env!("CARGO_BIN_EXE_marksd");
    let mut child = Command::new(exe)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn marksd");
    let stdin = child.stdin.take().expect("child stdin");
    let stdout = child.stdout.take().expect("child stdout");
    (child, stdin, BufReader::new(stdout))
}

fn request(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let payload = json!({
        "id": id,
        "method": method,
        "params": params,
    });
    writeln!(stdin, "{}", payload).expect("write request");
    stdin.flush().expect("flush request");

    let mut line = String::new();
    reader.read_line(&mut line).expect("read response line");
    assert!(!line.trim().is_empty(), "empty response for {}", method);
    let value: serde_json::Value = serde_json::from_str(line.trim()).expect("parse response json");
    assert_eq!(value.get("id").and_then(|v| v.as_str()), Some(id));
    value
}

fn request_ok(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let value = request(stdin, reader, id, method, params);
    assert!(
        value.get("ok").and_then(|v| v.as_bool()).unwrap_or(false),
        "{} failed: {}",
        method,
        value
    );
    value.get("result").cloned().unwrap_or_else(|| json!({}))
}

fn field(v: &serde_json::Value, key: &str) -> String {
    v.get(key)
        .and_then(|x| x.as_str())
        .unwrap_or_else(|| panic!("missing {key} in {v}"))
        .to_string()
}

struct School {
    principal: String,
    electricity_teacher: String,
    term: String,
}

/// Two subjects in one department, each bound to its own teacher for the
/// term: ELEC101 (coefficient 2) and BLD101 (coefficient 1), both out of 20.
fn seed_school(stdin: &mut ChildStdin, reader: &mut BufReader<ChildStdout>) -> School {
    let principal = field(
        &request_ok(
            stdin,
            reader,
            "s1",
            "users.create",
            json!({ "role": "principal", "email": "head@school.test", "firstName": "Ada", "lastName": "Head" }),
        ),
        "id",
    );
    let year = field(
        &request_ok(
            stdin,
            reader,
            "s2",
            "years.create",
            json!({
                "userId": principal,
                "name": "2025/2026",
                "startDate": "2025-09-01",
                "endDate": "2026-06-30"
            }),
        ),
        "id",
    );
    let term = field(
        &request_ok(
            stdin,
            reader,
            "s3",
            "terms.create",
            json!({
                "userId": principal,
                "academicYearId": year,
                "termNumber": 1,
                "name": "Term 1",
                "startDate": "2025-09-01",
                "endDate": "2025-12-15"
            }),
        ),
        "id",
    );
    let room = field(
        &request_ok(
            stdin,
            reader,
            "s4",
            "classrooms.create",
            json!({ "userId": principal, "name": "Form 1" }),
        ),
        "id",
    );
    let dept = field(
        &request_ok(
            stdin,
            reader,
            "s5",
            "departments.create",
            json!({
                "userId": principal,
                "name": "Electricity",
                "slug": "electricity",
                "classRoomIds": [room]
            }),
        ),
        "id",
    );

    let mut teacher_ids = Vec::new();
    for (i, (code, name, coefficient, email)) in [
        ("ELEC101", "Circuits", 2, "jane@school.test"),
        ("BLD101", "Masonry", 1, "mo@school.test"),
    ]
    .iter()
    .enumerate()
    {
        let subject = field(
            &request_ok(
                stdin,
                reader,
                &format!("s6-{i}"),
                "subjects.create",
                json!({
                    "userId": principal,
                    "name": name,
                    "code": code,
                    "coefficient": coefficient,
                    "maxScore": 20
                }),
            ),
            "id",
        );
        let teacher = field(
            &request_ok(
                stdin,
                reader,
                &format!("s7-{i}"),
                "users.create",
                json!({
                    "userId": principal,
                    "role": "teacher",
                    "email": email,
                    "firstName": "Teach",
                    "lastName": code,
                    "departmentId": dept,
                    "subjectIds": [subject]
                }),
            ),
            "id",
        );
        let _ = request_ok(
            stdin,
            reader,
            &format!("s8-{i}"),
            "assignments.create",
            json!({
                "userId": principal,
                "subjectId": subject,
                "departmentId": dept,
                "termId": term,
                "teacherId": teacher
            }),
        );
        teacher_ids.push(teacher);
    }

    let student_user = field(
        &request_ok(
            stdin,
            reader,
            "s9",
            "users.create",
            json!({
                "userId": principal,
                "role": "student",
                "email": "s001@school.test",
                "firstName": "Kid",
                "lastName": "One"
            }),
        ),
        "id",
    );
    let _ = request_ok(
        stdin,
        reader,
        "s10",
        "students.create",
        json!({
            "userId": principal,
            "studentUserId": student_user,
            "registrationNumber": "S001",
            "departmentId": dept,
            "classRoomId": room
        }),
    );

    School {
        principal,
        electricity_teacher: teacher_ids.remove(0),
        term,
    }
}

#[test]
fn foreign_subject_rows_reject_while_own_rows_still_validate() {
    let workspace = temp_dir("marksd-scope");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let school = seed_school(&mut stdin, &mut reader);

    let csv_path = workspace.join("two-subjects.csv");
    std::fs::write(
        &csv_path,
        "student_number,subject_name,subject_code,score,comment\n\
         S001,Circuits,ELEC101,15,mine\n\
         S001,Masonry,BLD101,11,not mine\n",
    )
    .expect("write csv");

    // The electricity teacher is out of scope for the masonry row; the
    // whole batch gates, but their own row still validates into the preview.
    let report = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "marks.importFile",
        json!({
            "userId": school.electricity_teacher,
            "path": csv_path.to_string_lossy(),
            "termId": school.term
        }),
    );
    assert_eq!(report["success"], json!(false));
    assert_eq!(report["totalErrors"], json!(1));
    let message = report["errors"][0].as_str().expect("error message");
    assert!(message.starts_with("Row 3:"), "{message}");
    assert!(message.contains("BLD101"), "{message}");
    assert_eq!(report["preview"]["toCreate"], json!(1));

    let listed = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "marks.list",
        json!({ "userId": school.principal }),
    );
    assert_eq!(listed["marks"].as_array().map(Vec::len), Some(0));

    // The principal is in scope everywhere; the same file commits whole.
    let summary = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "marks.importFile",
        json!({
            "userId": school.principal,
            "path": csv_path.to_string_lossy(),
            "termId": school.term
        }),
    );
    assert_eq!(summary["success"], json!(true));
    assert_eq!(summary["created"], json!(2));

    let listed = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "marks.list",
        json!({ "userId": school.principal }),
    );
    assert_eq!(listed["marks"].as_array().map(Vec::len), Some(2));
}

#[test]
fn later_duplicate_row_wins_within_one_file() {
    let workspace = temp_dir("marksd-lastwins");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let school = seed_school(&mut stdin, &mut reader);

    let csv_path = workspace.join("corrected.csv");
    std::fs::write(
        &csv_path,
        "student_number,subject_name,subject_code,score,comment\n\
         S001,Circuits,ELEC101,10,first guess\n\
         S001,Circuits,ELEC101,16.5,corrected below\n",
    )
    .expect("write csv");

    let summary = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "marks.importFile",
        json!({
            "userId": school.electricity_teacher,
            "path": csv_path.to_string_lossy(),
            "termId": school.term
        }),
    );
    assert_eq!(summary["success"], json!(true));
    assert_eq!(summary["created"], json!(1), "duplicate keys collapse");

    let listed = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "marks.list",
        json!({ "userId": school.principal }),
    );
    let marks = listed["marks"].as_array().expect("marks");
    assert_eq!(marks.len(), 1);
    assert_eq!(field(&marks[0], "score"), "16.5");
    assert_eq!(field(&marks[0], "totalMark"), "33");
    assert_eq!(field(&marks[0], "comment"), "corrected below");
}
