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
    let exe = env!("CARGO_BIN_EXE_exambookd");
    let mut child = Command::new(exe)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .env_remove("EXAMBOOKD_WORKSPACE")
        .spawn()
        .expect("spawn exambookd");
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

fn error_code(value: &serde_json::Value) -> String {
    value
        .get("error")
        .and_then(|e| e.get("code"))
        .and_then(|v| v.as_str())
        .unwrap_or("")
        .to_string()
}

fn spawn_sidecar_with_workspace(
    workspace: &std::path::Path,
) -> (Child, ChildStdin, BufReader<ChildStdout>) {
    let exe = env!("CARGO_BIN_EXE_exambookd");
    let mut child = Command::new(exe)
        .arg("--workspace")
        .arg(workspace)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn exambookd");
    let stdin = child.stdin.take().expect("child stdin");
    let stdout = child.stdout.take().expect("child stdout");
    (child, stdin, BufReader::new(stdout))
}

#[test]
fn protocol_errors_are_reported_not_fatal() {
    let (mut child, mut stdin, mut reader) = spawn_sidecar();

    writeln!(stdin, "this is not json").expect("write garbage");
    stdin.flush().expect("flush");
    let mut line = String::new();
    reader.read_line(&mut line).expect("read bad_json response");
    let value: serde_json::Value = serde_json::from_str(line.trim()).expect("parse json");
    assert_eq!(error_code(&value), "bad_json");

    let health = request_ok(&mut stdin, &mut reader, "1", "health", json!({}));
    assert!(health.get("workspacePath").map(|v| v.is_null()).unwrap_or(false));

    let unknown = request(&mut stdin, &mut reader, "2", "grades.frobnicate", json!({}));
    assert_eq!(error_code(&unknown), "not_implemented");

    let no_ws = request(
        &mut stdin,
        &mut reader,
        "3",
        "marks.list",
        json!({ "schoolId": "sch-1" }),
    );
    assert_eq!(error_code(&no_ws), "no_workspace");

    let scale = request_ok(&mut stdin, &mut reader, "4", "grading.scale", json!({}));
    let bands = scale.get("bands").and_then(|v| v.as_array()).cloned().unwrap_or_default();
    assert_eq!(bands.len(), 6);
    assert_eq!(bands[0].get("grade").and_then(|v| v.as_str()), Some("A+"));
    assert_eq!(bands[0].get("minPercent").and_then(|v| v.as_f64()), Some(80.0));

    drop(stdin);
    let _ = child.wait();
}

#[test]
fn grading_setup_defaults_validation_and_persistence() {
    let workspace = temp_dir("exambook-setup");
    {
        let (mut child, mut stdin, mut reader) = spawn_sidecar();
        let _ = request_ok(
            &mut stdin,
            &mut reader,
            "1",
            "workspace.select",
            json!({ "path": workspace.to_string_lossy() }),
        );
        let defaults = request_ok(&mut stdin, &mut reader, "2", "setup.get", json!({}));
        assert_eq!(
            defaults.get("grading").cloned(),
            Some(json!({
                "summaryPassPolicy": "subjectThreshold",
                "rankTiePolicy": "positional",
                "defaultSortBy": "rank",
                "defaultSortOrder": "asc"
            }))
        );

        let bad = request(
            &mut stdin,
            &mut reader,
            "3",
            "setup.update",
            json!({ "section": "grading", "patch": { "rankTiePolicy": "dense" } }),
        );
        assert_eq!(error_code(&bad), "bad_params");
        let bad_section = request(
            &mut stdin,
            &mut reader,
            "4",
            "setup.update",
            json!({ "section": "printer", "patch": {} }),
        );
        assert_eq!(error_code(&bad_section), "bad_params");

        let _ = request_ok(
            &mut stdin,
            &mut reader,
            "5",
            "setup.update",
            json!({
                "section": "grading",
                "patch": { "defaultSortBy": "name", "defaultSortOrder": "desc" }
            }),
        );
        drop(stdin);
        let _ = child.wait();
    }

    // The saved section survives a restart; the workspace comes from the flag.
    let (mut child, mut stdin, mut reader) = spawn_sidecar_with_workspace(&workspace);
    let health = request_ok(&mut stdin, &mut reader, "1", "health", json!({}));
    assert!(health.get("workspacePath").and_then(|v| v.as_str()).is_some());
    let saved = request_ok(&mut stdin, &mut reader, "2", "setup.get", json!({}));
    assert_eq!(
        saved.pointer("/grading/defaultSortBy").and_then(|v| v.as_str()),
        Some("name")
    );
    assert_eq!(
        saved.pointer("/grading/defaultSortOrder").and_then(|v| v.as_str()),
        Some("desc")
    );
    assert_eq!(
        saved.pointer("/grading/rankTiePolicy").and_then(|v| v.as_str()),
        Some("positional")
    );

    drop(stdin);
    let _ = child.wait();
}

#[test]
fn marks_upsert_rejects_bad_batches_and_clears_stale_grades() {
    let workspace = temp_dir("exambook-marks-upsert");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );

    let good = json!({
        "studentId": "s1", "studentName": "Mina", "className": "3",
        "examName": "Quiz", "subject": "Math", "obtainedMarks": 45, "totalMarks": 50
    });
    let bad = json!({
        "studentId": "s1", "studentName": "Mina", "className": "3",
        "examName": "Quiz", "subject": "English", "obtainedMarks": 10, "totalMarks": 0
    });
    let rejected = request(
        &mut stdin,
        &mut reader,
        "2",
        "marks.upsert",
        json!({ "schoolId": "sch-1", "records": [good.clone(), bad] }),
    );
    assert_eq!(error_code(&rejected), "bad_params");
    assert_eq!(
        rejected.pointer("/error/details/index").and_then(|v| v.as_u64()),
        Some(1)
    );
    let empty = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "marks.list",
        json!({ "schoolId": "sch-1" }),
    );
    assert_eq!(empty.get("marks").cloned(), Some(json!([])));

    let first = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "marks.upsert",
        json!({ "schoolId": "sch-1", "records": [good] }),
    );
    let mark_id = first
        .pointer("/markIds/0")
        .and_then(|v| v.as_str())
        .expect("mark id")
        .to_string();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "grading.recalculate",
        json!({ "schoolId": "sch-1", "examName": "Quiz", "className": "3" }),
    );
    let graded = request_ok(&mut stdin, &mut reader, "6", "marks.list", json!({ "schoolId": "sch-1" }));
    assert_eq!(graded.pointer("/marks/0/grade").and_then(|v| v.as_str()), Some("A+"));
    assert_eq!(graded.pointer("/marks/0/percentage").and_then(|v| v.as_f64()), Some(90.0));

    // Re-entering the mark keeps the record id and drops the old grade.
    let changed = json!({
        "studentId": "s1", "studentName": "Mina", "className": "3",
        "examName": "Quiz", "subject": "Math", "obtainedMarks": 10, "totalMarks": 50
    });
    let second = request_ok(
        &mut stdin,
        &mut reader,
        "7",
        "marks.upsert",
        json!({ "schoolId": "sch-1", "records": [changed] }),
    );
    assert_eq!(
        second.pointer("/markIds/0").and_then(|v| v.as_str()),
        Some(mark_id.as_str())
    );
    let listed = request_ok(&mut stdin, &mut reader, "8", "marks.list", json!({ "schoolId": "sch-1" }));
    assert_eq!(listed.pointer("/marks/0/obtainedMarks").and_then(|v| v.as_f64()), Some(10.0));
    assert!(listed.pointer("/marks/0/grade").map(|v| v.is_null()).unwrap_or(false));

    drop(stdin);
    let _ = child.wait();
}

#[test]
fn roster_and_exam_catalog_round_trip() {
    let workspace = temp_dir("exambook-roster-exams");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );

    let created = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "roster.upsert",
        json!({
            "schoolId": "sch-1",
            "students": [
                { "name": "Generated Id", "className": "4" },
                { "studentId": "fixed", "name": "Fixed Id", "className": "4", "rollNo": "12" },
                { "studentId": "elsewhere", "name": "Other", "className": "5" }
            ]
        }),
    );
    assert_eq!(created.get("upserted").and_then(|v| v.as_u64()), Some(3));

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "roster.upsert",
        json!({
            "schoolId": "sch-1",
            "students": [{ "studentId": "fixed", "name": "Renamed", "className": "4", "rollNo": "12" }]
        }),
    );
    let class4 = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "roster.list",
        json!({ "schoolId": "sch-1", "className": "4" }),
    );
    let students = class4.get("students").and_then(|v| v.as_array()).cloned().unwrap_or_default();
    assert_eq!(students.len(), 2);
    assert_eq!(students[1].get("name").and_then(|v| v.as_str()), Some("Renamed"));
    assert_eq!(students[1].get("rollNo").and_then(|v| v.as_str()), Some("12"));

    let stolen = request(
        &mut stdin,
        &mut reader,
        "5",
        "roster.upsert",
        json!({
            "schoolId": "sch-2",
            "students": [{ "studentId": "fixed", "name": "Intruder", "className": "4" }]
        }),
    );
    assert_eq!(error_code(&stolen), "bad_params");

    let exam = request_ok(
        &mut stdin,
        &mut reader,
        "6",
        "exams.create",
        json!({ "schoolId": "sch-1", "name": "Term 1" }),
    );
    let exam_id = exam.get("examId").and_then(|v| v.as_str()).expect("examId").to_string();
    let dup = request(
        &mut stdin,
        &mut reader,
        "7",
        "exams.create",
        json!({ "schoolId": "sch-1", "name": "Term 1" }),
    );
    assert_eq!(error_code(&dup), "conflict");

    let set = request_ok(
        &mut stdin,
        &mut reader,
        "8",
        "exams.subjects.set",
        json!({ "examId": exam_id, "subjects": ["Bangla", "Math", "Bangla", " English "] }),
    );
    assert_eq!(set.get("subjects").cloned(), Some(json!(["Bangla", "Math", "English"])));

    let listed = request_ok(
        &mut stdin,
        &mut reader,
        "9",
        "exams.list",
        json!({ "schoolId": "sch-1" }),
    );
    assert_eq!(
        listed.pointer("/exams/0/subjects").cloned(),
        Some(json!(["Bangla", "Math", "English"]))
    );

    let unknown = request(
        &mut stdin,
        &mut reader,
        "10",
        "exams.subjects.set",
        json!({ "examId": "nope", "subjects": [] }),
    );
    assert_eq!(error_code(&unknown), "not_found");

    drop(stdin);
    let _ = child.wait();
}

#[test]
fn moving_a_student_appends_them_to_the_new_class() {
    let workspace = temp_dir("exambook-roster-move");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "roster.upsert",
        json!({
            "schoolId": "sch-1",
            "students": [
                { "studentId": "p", "name": "Parvez", "className": "4" },
                { "studentId": "q", "name": "Quazi", "className": "4" },
                { "studentId": "r", "name": "Rupa", "className": "5" },
                { "studentId": "s", "name": "Sumi", "className": "5" }
            ]
        }),
    );
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "marks.upsert",
        json!({
            "schoolId": "sch-1",
            "records": [{
                "studentId": "p", "studentName": "Parvez", "className": "4",
                "examName": "Quiz", "subject": "Math", "obtainedMarks": 40, "totalMarks": 50
            }]
        }),
    );

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "roster.upsert",
        json!({
            "schoolId": "sch-1",
            "students": [{ "studentId": "p", "name": "Parvez", "className": "5" }]
        }),
    );
    let class5 = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "roster.list",
        json!({ "schoolId": "sch-1", "className": "5" }),
    );
    let order: Vec<String> = class5
        .get("students")
        .and_then(|v| v.as_array())
        .cloned()
        .unwrap_or_default()
        .iter()
        .map(|s| s.get("studentId").and_then(|v| v.as_str()).unwrap_or("").to_string())
        .collect();
    assert_eq!(order, vec!["r", "s", "p"]);

    let class4 = request_ok(
        &mut stdin,
        &mut reader,
        "6",
        "roster.list",
        json!({ "schoolId": "sch-1", "className": "4" }),
    );
    assert_eq!(
        class4.pointer("/students/0/studentId").and_then(|v| v.as_str()),
        Some("q")
    );

    // Marks stay with the class they were entered under.
    let old_marks = request_ok(
        &mut stdin,
        &mut reader,
        "7",
        "marks.list",
        json!({ "schoolId": "sch-1", "className": "4" }),
    );
    assert_eq!(
        old_marks.pointer("/marks/0/studentId").and_then(|v| v.as_str()),
        Some("p")
    );

    drop(stdin);
    let _ = child.wait();
}
