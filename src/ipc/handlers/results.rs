use crate::grading::{self, SubjectInput};
use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use chrono::Utc;
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

/// Engine errors cross the wire as `validation_failed`, message verbatim,
/// engine code folded into details.
fn validation_err(e: grading::ValidationError) -> HandlerErr {
    let mut details = e.details.unwrap_or_else(|| json!({}));
    details["code"] = json!(e.code);
    HandlerErr {
        code: "validation_failed",
        message: e.message,
        details: Some(details),
    }
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

fn parse_program_type(raw: &str) -> Result<String, HandlerErr> {
    match raw {
        "UNDERGRADUATE" | "POSTGRADUATE" => Ok(raw.to_string()),
        _ => Err(HandlerErr::new(
            "bad_params",
            "programType must be UNDERGRADUATE or POSTGRADUATE",
        )),
    }
}

fn parse_semester(v: Option<&serde_json::Value>) -> Result<i64, HandlerErr> {
    let semester = v
        .and_then(|v| v.as_i64())
        .ok_or_else(|| HandlerErr::new("bad_params", "semester must be an integer"))?;
    if semester < 1 {
        return Err(HandlerErr::new("bad_params", "semester must be at least 1"));
    }
    Ok(semester)
}

struct StudentRef {
    student_name: String,
    college_roll_number: String,
}

fn load_student(conn: &Connection, student_id: &str) -> Result<StudentRef, HandlerErr> {
    let row = conn
        .query_row(
            "SELECT student_name, college_roll_number FROM students WHERE id = ?",
            [student_id],
            |r| {
                Ok(StudentRef {
                    student_name: r.get(0)?,
                    college_roll_number: r.get(1)?,
                })
            },
        )
        .optional()
        .map_err(db_query_err)?;
    row.ok_or_else(|| HandlerErr::new("not_found", "student not found"))
}

fn subject_rows_json(conn: &Connection, result_id: &str) -> Result<Vec<serde_json::Value>, HandlerErr> {
    let mut stmt = conn
        .prepare(
            "SELECT subject_name, theory, internal, practical, total_marks,
                    obtained_marks, credit, grade, grade_point, result
             FROM result_subjects
             WHERE result_id = ?
             ORDER BY idx",
        )
        .map_err(db_query_err)?;
    stmt.query_map([result_id], |r| {
        let subject_name: String = r.get(0)?;
        let theory: f64 = r.get(1)?;
        let internal: f64 = r.get(2)?;
        let practical: f64 = r.get(3)?;
        let total_marks: f64 = r.get(4)?;
        let obtained_marks: f64 = r.get(5)?;
        let credit: f64 = r.get(6)?;
        let grade: String = r.get(7)?;
        let grade_point: i64 = r.get(8)?;
        let result: String = r.get(9)?;
        Ok(json!({
            "subjectName": subject_name,
            "marks": { "theory": theory, "internal": internal, "practical": practical },
            "totalMarks": total_marks,
            "obtainedMarks": obtained_marks,
            "credit": credit,
            "grade": grade,
            "gradePoint": grade_point,
            "result": result,
        }))
    })
    .and_then(|it| it.collect::<Result<Vec<_>, _>>())
    .map_err(db_query_err)
}

fn fetch_result_doc(
    conn: &Connection,
    result_id: &str,
) -> Result<Option<serde_json::Value>, HandlerErr> {
    let row = conn
        .query_row(
            "SELECT id, student_id, student_name, roll_number, program_type, batch,
                    stream, semester, academic_year, total_credits, total_marks,
                    obtained_marks, percentage, cgpa, result, remarks, published_at
             FROM results
             WHERE id = ?",
            [result_id],
            |r| {
                let id: String = r.get(0)?;
                let student_id: String = r.get(1)?;
                let student_name: String = r.get(2)?;
                let roll_number: String = r.get(3)?;
                let program_type: String = r.get(4)?;
                let batch: String = r.get(5)?;
                let stream: String = r.get(6)?;
                let semester: i64 = r.get(7)?;
                let academic_year: String = r.get(8)?;
                let total_credits: f64 = r.get(9)?;
                let total_marks: f64 = r.get(10)?;
                let obtained_marks: f64 = r.get(11)?;
                let percentage: f64 = r.get(12)?;
                let cgpa: f64 = r.get(13)?;
                let result: String = r.get(14)?;
                let remarks: String = r.get(15)?;
                let published_at: String = r.get(16)?;
                Ok(json!({
                    "id": id,
                    "studentId": student_id,
                    "studentName": student_name,
                    "rollNumber": roll_number,
                    "programType": program_type,
                    "batch": batch,
                    "stream": stream,
                    "semester": semester,
                    "academicYear": academic_year,
                    "totalCredits": total_credits,
                    "totalMarks": total_marks,
                    "obtainedMarks": obtained_marks,
                    "percentage": percentage,
                    "cgpa": cgpa,
                    "result": result,
                    "remarks": remarks,
                    "publishedAt": published_at,
                }))
            },
        )
        .optional()
        .map_err(db_query_err)?;

    let Some(mut doc) = row else {
        return Ok(None);
    };
    doc["subjects"] = json!(subject_rows_json(conn, result_id)?);
    Ok(Some(doc))
}

fn load_subject_inputs(conn: &Connection, result_id: &str) -> Result<Vec<SubjectInput>, HandlerErr> {
    let mut stmt = conn
        .prepare(
            "SELECT subject_name, theory, internal, practical, credit
             FROM result_subjects
             WHERE result_id = ?
             ORDER BY idx",
        )
        .map_err(db_query_err)?;
    stmt.query_map([result_id], |r| {
        Ok(SubjectInput {
            subject_name: r.get(0)?,
            marks: grading::Marks {
                theory: r.get(1)?,
                internal: r.get(2)?,
                practical: r.get(3)?,
            },
            credit: r.get(4)?,
        })
    })
    .and_then(|it| it.collect::<Result<Vec<_>, _>>())
    .map_err(db_query_err)
}

fn insert_subject_rows(
    conn: &Connection,
    result_id: &str,
    summary: &grading::ResultSummary,
) -> Result<(), HandlerErr> {
    for (idx, s) in summary.subjects.iter().enumerate() {
        conn.execute(
            "INSERT INTO result_subjects(
               id, result_id, idx, subject_name, theory, internal, practical,
               total_marks, obtained_marks, credit, grade, grade_point, result
             ) VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            (
                Uuid::new_v4().to_string(),
                result_id,
                idx as i64,
                &s.subject_name,
                s.marks.theory,
                s.marks.internal,
                s.marks.practical,
                s.total_marks,
                s.obtained_marks,
                s.credit,
                s.grade.as_str(),
                s.grade_point,
                s.result.as_str(),
            ),
        )
        .map_err(|e| HandlerErr {
            code: "db_insert_failed",
            message: e.to_string(),
            details: Some(json!({ "table": "result_subjects" })),
        })?;
    }
    Ok(())
}

fn results_publish(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let student_id = get_required_str(params, "studentId")?;
    let program_type = parse_program_type(&get_required_str(params, "programType")?)?;
    let batch = get_required_str(params, "batch")?;
    let stream = get_required_str(params, "stream")?;
    let academic_year = get_required_str(params, "academicYear")?;
    let semester = parse_semester(params.get("semester"))?;

    let student = load_student(conn, &student_id)?;

    // Aggregates come from the engine alone; client-sent values are ignored.
    let subjects = grading::parse_subjects(params.get("subjects")).map_err(validation_err)?;
    let summary = grading::compute_result(&subjects).map_err(validation_err)?;

    let existing: Option<String> = conn
        .query_row(
            "SELECT id FROM results WHERE student_id = ? AND semester = ?",
            (&student_id, semester),
            |r| r.get(0),
        )
        .optional()
        .map_err(db_query_err)?;
    if existing.is_some() {
        return Err(HandlerErr {
            code: "conflict",
            message: "result already published for this semester".to_string(),
            details: Some(json!({ "studentId": student_id, "semester": semester })),
        });
    }

    let tx = conn
        .unchecked_transaction()
        .map_err(|e| HandlerErr::new("db_tx_failed", e.to_string()))?;

    let result_id = Uuid::new_v4().to_string();
    let published_at = Utc::now().format("%Y-%m-%dT%H:%M:%SZ").to_string();
    tx.execute(
        "INSERT INTO results(
           id, student_id, student_name, roll_number, program_type, batch,
           stream, semester, academic_year, total_credits, total_marks,
           obtained_marks, percentage, cgpa, result, remarks, published_at
         ) VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        rusqlite::params![
            &result_id,
            &student_id,
            &student.student_name,
            &student.college_roll_number,
            &program_type,
            &batch,
            &stream,
            semester,
            &academic_year,
            summary.total_credits,
            summary.total_marks,
            summary.obtained_marks,
            summary.percentage,
            summary.cgpa,
            summary.result.as_str(),
            &summary.remarks,
            &published_at,
        ],
    )
    .map_err(|e| HandlerErr {
        code: "db_insert_failed",
        message: e.to_string(),
        details: Some(json!({ "table": "results" })),
    })?;
    insert_subject_rows(&tx, &result_id, &summary)?;
    tx.commit()
        .map_err(|e| HandlerErr::new("db_tx_failed", e.to_string()))?;

    log::info!(
        "result published: student {} semester {} -> {} ({}%)",
        student_id,
        semester,
        summary.result.as_str(),
        summary.percentage
    );

    let doc = fetch_result_doc(conn, &result_id)?
        .ok_or_else(|| HandlerErr::new("db_query_failed", "result vanished after insert"))?;
    Ok(json!({ "result": doc }))
}

fn results_list(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let mut where_parts: Vec<&str> = Vec::new();
    let mut bind_values: Vec<Value> = Vec::new();

    if let Some(v) = params.get("programType").and_then(|v| v.as_str()) {
        where_parts.push("program_type = ?");
        bind_values.push(Value::Text(parse_program_type(v.trim())?));
    }
    if let Some(v) = params.get("batch").and_then(|v| v.as_str()) {
        where_parts.push("batch = ?");
        bind_values.push(Value::Text(v.trim().to_string()));
    }
    if let Some(v) = params.get("stream").and_then(|v| v.as_str()) {
        where_parts.push("stream = ?");
        bind_values.push(Value::Text(v.trim().to_string()));
    }
    if let Some(v) = params.get("semester") {
        if !v.is_null() {
            where_parts.push("semester = ?");
            bind_values.push(Value::Integer(parse_semester(Some(v))?));
        }
    }

    let where_sql = if where_parts.is_empty() {
        String::new()
    } else {
        format!(" WHERE {}", where_parts.join(" AND "))
    };
    let sql = format!(
        "SELECT id FROM results{} ORDER BY roll_number, semester",
        where_sql
    );

    let mut stmt = conn.prepare(&sql).map_err(db_query_err)?;
    let ids: Vec<String> = stmt
        .query_map(params_from_iter(bind_values), |r| r.get(0))
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(db_query_err)?;

    let mut results = Vec::with_capacity(ids.len());
    for id in &ids {
        if let Some(doc) = fetch_result_doc(conn, id)? {
            results.push(doc);
        }
    }
    Ok(json!({ "count": results.len(), "results": results }))
}

fn results_get(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let result_id = get_required_str(params, "resultId")?;
    let Some(doc) = fetch_result_doc(conn, &result_id)? else {
        return Err(HandlerErr::new("not_found", "result not found"));
    };
    Ok(json!({ "result": doc }))
}

fn results_for_student(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let student_id = get_required_str(params, "studentId")?;
    load_student(conn, &student_id)?;

    let mut stmt = conn
        .prepare("SELECT id FROM results WHERE student_id = ? ORDER BY semester")
        .map_err(db_query_err)?;
    let ids: Vec<String> = stmt
        .query_map([&student_id], |r| r.get(0))
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(db_query_err)?;

    let mut results = Vec::with_capacity(ids.len());
    for id in &ids {
        if let Some(doc) = fetch_result_doc(conn, id)? {
            results.push(doc);
        }
    }
    Ok(json!({ "count": results.len(), "results": results }))
}

struct ExistingResult {
    student_id: String,
    program_type: String,
    batch: String,
    stream: String,
    semester: i64,
    academic_year: String,
}

fn results_update(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let result_id = get_required_str(params, "resultId")?;
    let Some(patch) = params.get("patch").and_then(|v| v.as_object()) else {
        return Err(HandlerErr::new("bad_params", "missing/invalid patch"));
    };

    let existing = conn
        .query_row(
            "SELECT student_id, program_type, batch, stream, semester, academic_year
             FROM results
             WHERE id = ?",
            [&result_id],
            |r| {
                Ok(ExistingResult {
                    student_id: r.get(0)?,
                    program_type: r.get(1)?,
                    batch: r.get(2)?,
                    stream: r.get(3)?,
                    semester: r.get(4)?,
                    academic_year: r.get(5)?,
                })
            },
        )
        .optional()
        .map_err(db_query_err)?;
    let Some(existing) = existing else {
        return Err(HandlerErr::new("not_found", "result not found"));
    };

    let patch_string = |key: &str, current: &str| -> Result<String, HandlerErr> {
        match patch.get(key) {
            None => Ok(current.to_string()),
            Some(v) => {
                let Some(s) = v.as_str() else {
                    return Err(HandlerErr::new(
                        "bad_params",
                        format!("patch.{} must be a string", key),
                    ));
                };
                let s = s.trim();
                if s.is_empty() {
                    return Err(HandlerErr::new(
                        "bad_params",
                        format!("{} must not be empty", key),
                    ));
                }
                Ok(s.to_string())
            }
        }
    };

    let program_type = match patch.get("programType") {
        None => existing.program_type.clone(),
        Some(_) => parse_program_type(&patch_string("programType", &existing.program_type)?)?,
    };
    let batch = patch_string("batch", &existing.batch)?;
    let stream = patch_string("stream", &existing.stream)?;
    let academic_year = patch_string("academicYear", &existing.academic_year)?;
    let semester = match patch.get("semester") {
        None => existing.semester,
        Some(v) => parse_semester(Some(v))?,
    };

    if semester != existing.semester {
        let taken: Option<String> = conn
            .query_row(
                "SELECT id FROM results WHERE student_id = ? AND semester = ? AND id != ?",
                (&existing.student_id, semester, &result_id),
                |r| r.get(0),
            )
            .optional()
            .map_err(db_query_err)?;
        if taken.is_some() {
            return Err(HandlerErr {
                code: "conflict",
                message: "result already published for this semester".to_string(),
                details: Some(json!({
                    "studentId": existing.student_id,
                    "semester": semester,
                })),
            });
        }
    }

    // Every edit re-runs the engine over the full subject list; derived
    // fields are rewritten wholesale, never patched individually.
    let subjects = match patch.get("subjects") {
        Some(raw) => grading::parse_subjects(Some(raw)).map_err(validation_err)?,
        None => load_subject_inputs(conn, &result_id)?,
    };
    let summary = grading::compute_result(&subjects).map_err(validation_err)?;

    let tx = conn
        .unchecked_transaction()
        .map_err(|e| HandlerErr::new("db_tx_failed", e.to_string()))?;

    tx.execute(
        "UPDATE results SET
           program_type = ?, batch = ?, stream = ?, semester = ?, academic_year = ?,
           total_credits = ?, total_marks = ?, obtained_marks = ?, percentage = ?,
           cgpa = ?, result = ?, remarks = ?
         WHERE id = ?",
        rusqlite::params![
            &program_type,
            &batch,
            &stream,
            semester,
            &academic_year,
            summary.total_credits,
            summary.total_marks,
            summary.obtained_marks,
            summary.percentage,
            summary.cgpa,
            summary.result.as_str(),
            &summary.remarks,
            &result_id,
        ],
    )
    .map_err(|e| HandlerErr {
        code: "db_update_failed",
        message: e.to_string(),
        details: Some(json!({ "table": "results" })),
    })?;
    tx.execute(
        "DELETE FROM result_subjects WHERE result_id = ?",
        [&result_id],
    )
    .map_err(|e| HandlerErr {
        code: "db_delete_failed",
        message: e.to_string(),
        details: Some(json!({ "table": "result_subjects" })),
    })?;
    insert_subject_rows(&tx, &result_id, &summary)?;
    tx.commit()
        .map_err(|e| HandlerErr::new("db_tx_failed", e.to_string()))?;

    let doc = fetch_result_doc(conn, &result_id)?
        .ok_or_else(|| HandlerErr::new("db_query_failed", "result vanished after update"))?;
    Ok(json!({ "result": doc }))
}

fn results_delete(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let result_id = get_required_str(params, "resultId")?;

    let tx = conn
        .unchecked_transaction()
        .map_err(|e| HandlerErr::new("db_tx_failed", e.to_string()))?;
    tx.execute(
        "DELETE FROM result_subjects WHERE result_id = ?",
        [&result_id],
    )
    .map_err(|e| HandlerErr {
        code: "db_delete_failed",
        message: e.to_string(),
        details: Some(json!({ "table": "result_subjects" })),
    })?;
    let changed = tx
        .execute("DELETE FROM results WHERE id = ?", [&result_id])
        .map_err(|e| HandlerErr {
            code: "db_delete_failed",
            message: e.to_string(),
            details: Some(json!({ "table": "results" })),
        })?;
    tx.commit()
        .map_err(|e| HandlerErr::new("db_tx_failed", e.to_string()))?;

    if changed == 0 {
        return Err(HandlerErr::new("not_found", "result not found"));
    }
    Ok(json!({ "deleted": true }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "results.publish" | "results.list" | "results.get" | "results.forStudent"
        | "results.update" | "results.delete" => {}
        _ => return None,
    }

    let Some(conn) = state.db.as_ref() else {
        return Some(err(&req.id, "no_workspace", "select a workspace first", None));
    };

    let outcome = match req.method.as_str() {
        "results.publish" => results_publish(conn, &req.params),
        "results.list" => results_list(conn, &req.params),
        "results.get" => results_get(conn, &req.params),
        "results.forStudent" => results_for_student(conn, &req.params),
        "results.update" => results_update(conn, &req.params),
        "results.delete" => results_delete(conn, &req.params),
        _ => return None,
    };

    Some(match outcome {
        Ok(result) => ok(&req.id, result),
        Err(e) => e.response(&req.id),
    })
}
