use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use chrono::{Datelike, Utc};
use rusqlite::types::Value;
use rusqlite::{params_from_iter, Connection, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

struct HandlerErr {
    code: &'static str,
    message: String,
    details: Option<serde_json::Value>,
}

impl HandlerErr {
    fn new(code: &'static str, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            details: None,
        }
    }

    fn response(self, id: &str) -> serde_json::Value {
        err(id, self.code, self.message, self.details)
    }
}

fn db_query_err(e: rusqlite::Error) -> HandlerErr {
    HandlerErr::new("db_query_failed", e.to_string())
}

fn get_required_str(params: &serde_json::Value, key: &str) -> Result<String, HandlerErr> {
    let value = params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|s| s.trim().to_string())
        .ok_or_else(|| HandlerErr::new("bad_params", format!("missing {}", key)))?;
    if value.is_empty() {
        return Err(HandlerErr::new(
            "bad_params",
            format!("{} must not be empty", key),
        ));
    }
    Ok(value)
}

fn now_utc() -> String {
    Utc::now().format("%Y-%m-%dT%H:%M:%SZ").to_string()
}

fn random_digits(len: u32) -> u64 {
    // Uuid v4 is the crate's randomness source; fold it into an n-digit
    // number with a non-zero leading digit.
    let span = 10u64.pow(len);
    let floor = span / 10;
    floor + (Uuid::new_v4().as_u128() as u64) % (span - floor)
}

fn generate_unique_code(
    conn: &Connection,
    column: &str,
    prefix: &str,
    digits: u32,
) -> Result<String, HandlerErr> {
    let sql = format!("SELECT 1 FROM students WHERE {} = ?", column);
    loop {
        let candidate = format!("{}{}", prefix, random_digits(digits));
        let exists: Option<i64> = conn
            .query_row(&sql, [&candidate], |r| r.get(0))
            .optional()
            .map_err(db_query_err)?;
        if exists.is_none() {
            return Ok(candidate);
        }
    }
}

fn student_json(
    id: String,
    student_name: String,
    stream: String,
    college_roll_number: String,
    exam_roll_number: String,
    exam_code: String,
    created_at: String,
    updated_at: Option<String>,
) -> serde_json::Value {
    json!({
        "id": id,
        "studentName": student_name,
        "stream": stream,
        "collegeRollNumber": college_roll_number,
        "examRollNumber": exam_roll_number,
        "examCode": exam_code,
        "createdAt": created_at,
        "updatedAt": updated_at,
    })
}

const STUDENT_COLUMNS: &str = "id, student_name, stream, college_roll_number, \
     exam_roll_number, exam_code, created_at, updated_at";

fn row_to_student(r: &rusqlite::Row) -> rusqlite::Result<serde_json::Value> {
    Ok(student_json(
        r.get(0)?,
        r.get(1)?,
        r.get(2)?,
        r.get(3)?,
        r.get(4)?,
        r.get(5)?,
        r.get(6)?,
        r.get(7)?,
    ))
}

fn students_create(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let student_name = get_required_str(params, "studentName")?;
    let stream = get_required_str(params, "stream")?;
    let college_roll_number = get_required_str(params, "collegeRollNumber")?;

    let taken: Option<i64> = conn
        .query_row(
            "SELECT 1 FROM students WHERE college_roll_number = ?",
            [&college_roll_number],
            |r| r.get(0),
        )
        .optional()
        .map_err(db_query_err)?;
    if taken.is_some() {
        return Err(HandlerErr {
            code: "conflict",
            message: "college roll number already registered".to_string(),
            details: Some(json!({ "collegeRollNumber": college_roll_number })),
        });
    }

    // Exam roll is the two-digit year plus four random digits; the exam code
    // is a bare six-digit number. Both retry until unique.
    let year_prefix = format!("{:02}", Utc::now().year() % 100);
    let exam_roll_number = generate_unique_code(conn, "exam_roll_number", &year_prefix, 4)?;
    let exam_code = generate_unique_code(conn, "exam_code", "", 6)?;

    let student_id = Uuid::new_v4().to_string();
    let created_at = now_utc();
    conn.execute(
        "INSERT INTO students(
           id, student_name, stream, college_roll_number,
           exam_roll_number, exam_code, created_at, updated_at
         ) VALUES(?, ?, ?, ?, ?, ?, ?, ?)",
        (
            &student_id,
            &student_name,
            &stream,
            &college_roll_number,
            &exam_roll_number,
            &exam_code,
            &created_at,
            &created_at,
        ),
    )
    .map_err(|e| HandlerErr {
        code: "db_insert_failed",
        message: e.to_string(),
        details: Some(json!({ "table": "students" })),
    })?;

    log::info!(
        "student created: {} (roll {})",
        student_id,
        college_roll_number
    );
    Ok(json!({
        "studentId": student_id,
        "examRollNumber": exam_roll_number,
        "examCode": exam_code,
    }))
}

fn students_list(
    conn: &Connection,
    _params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let mut stmt = conn
        .prepare(&format!(
            "SELECT {} FROM students ORDER BY college_roll_number",
            STUDENT_COLUMNS
        ))
        .map_err(db_query_err)?;
    let students: Vec<serde_json::Value> = stmt
        .query_map([], row_to_student)
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(db_query_err)?;
    Ok(json!({ "students": students }))
}

fn students_get(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let student_id = get_required_str(params, "studentId")?;
    let student = conn
        .query_row(
            &format!("SELECT {} FROM students WHERE id = ?", STUDENT_COLUMNS),
            [&student_id],
            row_to_student,
        )
        .optional()
        .map_err(db_query_err)?;
    let Some(student) = student else {
        return Err(HandlerErr::new("not_found", "student not found"));
    };
    Ok(json!({ "student": student }))
}

fn students_update(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let student_id = get_required_str(params, "studentId")?;
    let Some(patch) = params.get("patch").and_then(|v| v.as_object()) else {
        return Err(HandlerErr::new("bad_params", "missing/invalid patch"));
    };

    let exists: Option<i64> = conn
        .query_row("SELECT 1 FROM students WHERE id = ?", [&student_id], |r| {
            r.get(0)
        })
        .optional()
        .map_err(db_query_err)?;
    if exists.is_none() {
        return Err(HandlerErr::new("not_found", "student not found"));
    }

    let mut set_parts: Vec<String> = Vec::new();
    let mut bind_values: Vec<Value> = Vec::new();

    let mut patch_str = |key: &str, column: &str| -> Result<(), HandlerErr> {
        let Some(v) = patch.get(key) else {
            return Ok(());
        };
        let Some(s) = v.as_str() else {
            return Err(HandlerErr::new(
                "bad_params",
                format!("patch.{} must be a string", key),
            ));
        };
        let s = s.trim().to_string();
        if s.is_empty() {
            return Err(HandlerErr::new(
                "bad_params",
                format!("{} must not be empty", key),
            ));
        }
        set_parts.push(format!("{} = ?", column));
        bind_values.push(Value::Text(s));
        Ok(())
    };
    patch_str("studentName", "student_name")?;
    patch_str("stream", "stream")?;
    patch_str("collegeRollNumber", "college_roll_number")?;

    if let Some(v) = patch.get("collegeRollNumber").and_then(|v| v.as_str()) {
        let roll = v.trim();
        let taken: Option<i64> = conn
            .query_row(
                "SELECT 1 FROM students WHERE college_roll_number = ? AND id != ?",
                (roll, &student_id),
                |r| r.get(0),
            )
            .optional()
            .map_err(db_query_err)?;
        if taken.is_some() {
            return Err(HandlerErr {
                code: "conflict",
                message: "college roll number already registered".to_string(),
                details: Some(json!({ "collegeRollNumber": roll })),
            });
        }
    }

    // Exam roll number and exam code are assigned once and never patched.
    for frozen in ["examRollNumber", "examCode"] {
        if patch.contains_key(frozen) {
            return Err(HandlerErr::new(
                "bad_params",
                format!("{} cannot be updated", frozen),
            ));
        }
    }

    if set_parts.is_empty() {
        return Err(HandlerErr::new("bad_params", "patch has no known fields"));
    }

    set_parts.push("updated_at = ?".to_string());
    bind_values.push(Value::Text(now_utc()));
    bind_values.push(Value::Text(student_id.clone()));

    let sql = format!(
        "UPDATE students SET {} WHERE id = ?",
        set_parts.join(", ")
    );
    conn.execute(&sql, params_from_iter(bind_values))
        .map_err(|e| HandlerErr {
            code: "db_update_failed",
            message: e.to_string(),
            details: Some(json!({ "table": "students" })),
        })?;

    students_get(conn, &json!({ "studentId": student_id }))
}

fn students_delete(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let student_id = get_required_str(params, "studentId")?;

    let result_count: i64 = conn
        .query_row(
            "SELECT COUNT(*) FROM results WHERE student_id = ?",
            [&student_id],
            |r| r.get(0),
        )
        .map_err(db_query_err)?;
    if result_count > 0 {
        return Err(HandlerErr {
            code: "conflict",
            message: "student has published results; delete them first".to_string(),
            details: Some(json!({ "resultCount": result_count })),
        });
    }

    let changed = conn
        .execute("DELETE FROM students WHERE id = ?", [&student_id])
        .map_err(|e| HandlerErr {
            code: "db_delete_failed",
            message: e.to_string(),
            details: Some(json!({ "table": "students" })),
        })?;
    if changed == 0 {
        return Err(HandlerErr::new("not_found", "student not found"));
    }

    Ok(json!({ "deleted": true }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "students.create" | "students.list" | "students.get" | "students.update"
        | "students.delete" => {}
        _ => return None,
    }

    let Some(conn) = state.db.as_ref() else {
        return Some(err(&req.id, "no_workspace", "select a workspace first", None));
    };

    let outcome = match req.method.as_str() {
        "students.create" => students_create(conn, &req.params),
        "students.list" => students_list(conn, &req.params),
        "students.get" => students_get(conn, &req.params),
        "students.update" => students_update(conn, &req.params),
        "students.delete" => students_delete(conn, &req.params),
        _ => return None,
    };

    Some(match outcome {
        Ok(result) => ok(&req.id, result),
        Err(e) => e.response(&req.id),
    })
}
