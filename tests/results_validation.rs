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
    let exe = env!("CARGO_BIN_EXE_resultsd");
    let mut child = Command::new(exe)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn resultsd");
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

fn setup(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    workspace: &std::path::Path,
) -> String {
    let _ = request_ok(
        stdin,
        reader,
        "setup-ws",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    request_ok(
        stdin,
        reader,
        "setup-student",
        "students.create",
        json!({
            "studentName": "Vikram Singh",
            "stream": "Botany",
            "collegeRollNumber": "BO-001"
        }),
    )
    .get("studentId")
    .and_then(|v| v.as_str())
    .expect("studentId")
    .to_string()
}

fn publish_with_subjects(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    student_id: &str,
    subjects: serde_json::Value,
) -> serde_json::Value {
    request(
        stdin,
        reader,
        id,
        "results.publish",
        json!({
            "studentId": student_id,
            "programType": "UNDERGRADUATE",
            "batch": "2024",
            "stream": "Botany",
            "semester": 1,
            "academicYear": "2024-25",
            "subjects": subjects
        }),
    )
}

fn error_of(value: &serde_json::Value) -> (&str, &str) {
    let error = value.get("error").expect("error object");
    (
        error.get("code").and_then(|v| v.as_str()).unwrap_or(""),
        error.get("message").and_then(|v| v.as_str()).unwrap_or(""),
    )
}

#[test]
fn out_of_range_theory_is_rejected_with_subject_and_field() {
    let workspace = temp_dir("resultsd-validate-theory");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let student_id = setup(&mut stdin, &mut reader, &workspace);

    let resp = publish_with_subjects(
        &mut stdin,
        &mut reader,
        "1",
        &student_id,
        json!([
            {
                "subjectName": "Plant Physiology",
                "marks": { "theory": 71, "internal": 0, "practical": 0 },
                "credit": 4
            }
        ]),
    );
    let (code, message) = error_of(&resp);
    assert_eq!(code, "validation_failed");
    assert!(message.contains("Plant Physiology"), "message: {}", message);
    assert!(message.contains("theory"), "message: {}", message);
    let details = resp
        .get("error")
        .and_then(|e| e.get("details"))
        .expect("details");
    assert_eq!(details.get("field").and_then(|v| v.as_str()), Some("theory"));

    // Nothing was persisted.
    let mine = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "results.forStudent",
        json!({ "studentId": student_id }),
    );
    assert_eq!(mine.get("count").and_then(|v| v.as_i64()), Some(0));

    let _ = child.kill();
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn internal_practical_and_credit_ranges_are_enforced() {
    let workspace = temp_dir("resultsd-validate-ranges");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let student_id = setup(&mut stdin, &mut reader, &workspace);

    let cases = [
        json!([{ "subjectName": "A", "marks": { "theory": 10, "internal": 21, "practical": 0 }, "credit": 4 }]),
        json!([{ "subjectName": "A", "marks": { "theory": 10, "internal": 5, "practical": 11 }, "credit": 4 }]),
        json!([{ "subjectName": "A", "marks": { "theory": -1, "internal": 5, "practical": 0 }, "credit": 4 }]),
        json!([{ "subjectName": "A", "marks": { "theory": 10, "internal": 5, "practical": 0 }, "credit": -2 }]),
    ];
    for (i, subjects) in cases.iter().enumerate() {
        let resp = publish_with_subjects(
            &mut stdin,
            &mut reader,
            &format!("case-{}", i),
            &student_id,
            subjects.clone(),
        );
        let (code, _) = error_of(&resp);
        assert_eq!(code, "validation_failed", "case {} got {}", i, resp);
    }

    let _ = child.kill();
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn empty_subject_list_is_rejected() {
    let workspace = temp_dir("resultsd-validate-empty");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let student_id = setup(&mut stdin, &mut reader, &workspace);

    let resp = publish_with_subjects(&mut stdin, &mut reader, "1", &student_id, json!([]));
    let (code, message) = error_of(&resp);
    assert_eq!(code, "validation_failed");
    assert!(message.contains("at least one subject"), "message: {}", message);

    let _ = child.kill();
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn missing_marks_object_is_rejected_but_absent_components_default_to_zero() {
    let workspace = temp_dir("resultsd-validate-marks");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let student_id = setup(&mut stdin, &mut reader, &workspace);

    let resp = publish_with_subjects(
        &mut stdin,
        &mut reader,
        "1",
        &student_id,
        json!([{ "subjectName": "Ecology", "credit": 4 }]),
    );
    let (code, message) = error_of(&resp);
    assert_eq!(code, "validation_failed");
    assert!(message.contains("marks"), "message: {}", message);

    // A zero score is a real score: absent components read as 0 and the
    // subject grades F rather than being rejected.
    let resp = publish_with_subjects(
        &mut stdin,
        &mut reader,
        "2",
        &student_id,
        json!([{ "subjectName": "Ecology", "marks": { "theory": 30 }, "credit": 4 }]),
    );
    assert!(
        resp.get("ok").and_then(|v| v.as_bool()).unwrap_or(false),
        "partial marks should publish: {}",
        resp
    );
    let result = resp
        .get("result")
        .and_then(|r| r.get("result"))
        .expect("result doc");
    assert_eq!(
        result.get("obtainedMarks").and_then(|v| v.as_f64()),
        Some(30.0)
    );
    assert_eq!(result.get("result").and_then(|v| v.as_str()), Some("FAIL"));

    let _ = child.kill();
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn bad_request_envelope_is_rejected_before_grading() {
    let workspace = temp_dir("resultsd-validate-envelope");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let student_id = setup(&mut stdin, &mut reader, &workspace);

    let bad_program = request(
        &mut stdin,
        &mut reader,
        "1",
        "results.publish",
        json!({
            "studentId": student_id,
            "programType": "DIPLOMA",
            "batch": "2024",
            "stream": "Botany",
            "semester": 1,
            "academicYear": "2024-25",
            "subjects": [
                { "subjectName": "A", "marks": { "theory": 10 }, "credit": 1 }
            ]
        }),
    );
    let (code, _) = error_of(&bad_program);
    assert_eq!(code, "bad_params");

    let bad_semester = request(
        &mut stdin,
        &mut reader,
        "2",
        "results.publish",
        json!({
            "studentId": student_id,
            "programType": "UNDERGRADUATE",
            "batch": "2024",
            "stream": "Botany",
            "semester": 0,
            "academicYear": "2024-25",
            "subjects": [
                { "subjectName": "A", "marks": { "theory": 10 }, "credit": 1 }
            ]
        }),
    );
    let (code, _) = error_of(&bad_semester);
    assert_eq!(code, "bad_params");

    let ghost = request(
        &mut stdin,
        &mut reader,
        "3",
        "results.publish",
        json!({
            "studentId": "no-such-student",
            "programType": "UNDERGRADUATE",
            "batch": "2024",
            "stream": "Botany",
            "semester": 1,
            "academicYear": "2024-25",
            "subjects": [
                { "subjectName": "A", "marks": { "theory": 10 }, "credit": 1 }
            ]
        }),
    );
    let (code, _) = error_of(&ghost);
    assert_eq!(code, "not_found");

    let _ = child.kill();
    let _ = std::fs::remove_dir_all(workspace);
}
