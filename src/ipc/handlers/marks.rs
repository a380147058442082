use crate::ipc::error::{err, ok, rejected_item};
use crate::ipc::helpers::{db_conn, optional_str, query_failed, required_str};
use crate::ipc::types::{AppState, Request};
use crate::store::{MarkStore, SqliteMarkStore};
use serde_json::json;
use uuid::Uuid;

const MARKS_UPSERT_MAX_RECORDS: usize = 5000;

#[derive(Debug)]
struct MarkInput {
    student_id: String,
    student_name: String,
    class_name: String,
    exam_name: String,
    subject: String,
    obtained_marks: Option<f64>,
    total_marks: f64,
}

fn parse_mark(i: usize, v: &serde_json::Value) -> Result<MarkInput, String> {
    let Some(obj) = v.as_object() else {
        return Err(format!("records[{}] must be an object", i));
    };
    let text = |key: &str| -> Result<String, String> {
        obj.get(key)
            .and_then(|v| v.as_str())
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .ok_or_else(|| format!("records[{}] missing {}", i, key))
    };

    let student_id = text("studentId")?;
    let class_name = text("className")?;
    let exam_name = text("examName")?;
    let subject = text("subject")?;
    let student_name = obj
        .get("studentName")
        .and_then(|v| v.as_str())
        .map(|s| s.trim().to_string())
        .unwrap_or_default();

    // Blank cells arrive as null and are kept as a blank script.
    let obtained_marks = match obj.get("obtainedMarks") {
        None => None,
        Some(v) if v.is_null() => None,
        Some(v) => {
            let Some(n) = v.as_f64() else {
                return Err(format!("records[{}].obtainedMarks must be a number or null", i));
            };
            Some(n)
        }
    };
    let Some(total_marks) = obj.get("totalMarks").and_then(|v| v.as_f64()) else {
        return Err(format!("records[{}] missing totalMarks", i));
    };

    if !(total_marks.is_finite() && total_marks > 0.0) {
        return Err(format!("records[{}].totalMarks must be > 0", i));
    }
    if let Some(n) = obtained_marks {
        if !n.is_finite() || n < 0.0 {
            return Err(format!("records[{}].obtainedMarks must be >= 0", i));
        }
        if n > total_marks {
            return Err(format!(
                "records[{}].obtainedMarks must not exceed totalMarks",
                i
            ));
        }
    }

    Ok(MarkInput {
        student_id,
        student_name,
        class_name,
        exam_name,
        subject,
        obtained_marks,
        total_marks,
    })
}

fn handle_marks_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let school_id = match required_str(req, "schoolId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let exam_name = optional_str(req, "examName");
    let class_name = optional_str(req, "className");

    let marks = match SqliteMarkStore::new(conn).fetch_marks(&school_id) {
        Ok(v) => v,
        Err(e) => return query_failed(req, e),
    };
    let marks: Vec<_> = marks
        .into_iter()
        .filter(|m| exam_name.as_ref().map(|e| &m.exam_name == e).unwrap_or(true))
        .filter(|m| class_name.as_ref().map(|c| &m.class_name == c).unwrap_or(true))
        .collect();
    ok(&req.id, json!({ "marks": marks }))
}

fn handle_marks_upsert(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let school_id = match required_str(req, "schoolId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let Some(records_arr) = req.params.get("records").and_then(|v| v.as_array()) else {
        return err(&req.id, "bad_params", "missing records[]", None);
    };
    if records_arr.len() > MARKS_UPSERT_MAX_RECORDS {
        return err(
            &req.id,
            "bad_params",
            format!(
                "marks payload exceeds max records: {} > {}",
                records_arr.len(),
                MARKS_UPSERT_MAX_RECORDS
            ),
            Some(json!({ "limit": MARKS_UPSERT_MAX_RECORDS })),
        );
    }

    let mut inputs = Vec::with_capacity(records_arr.len());
    for (i, v) in records_arr.iter().enumerate() {
        match parse_mark(i, v) {
            Ok(m) => inputs.push(m),
            Err(msg) => return rejected_item(&req.id, msg, i),
        }
    }

    let tx = match conn.unchecked_transaction() {
        Ok(t) => t,
        Err(e) => return err(&req.id, "db_tx_failed", e.to_string(), None),
    };
    let now = chrono::Utc::now().to_rfc3339();
    let mut mark_ids: Vec<String> = Vec::with_capacity(inputs.len());
    for m in &inputs {
        // Changed raw marks invalidate any earlier grading of the record.
        let mark_id: Result<String, _> = tx.query_row(
            "INSERT INTO marks(id, school_id, student_id, student_name, class_name, exam_name,
                               subject, obtained_marks, total_marks, percentage, grade, gpa, updated_at)
             VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, NULL, NULL, NULL, ?)
             ON CONFLICT(school_id, student_id, exam_name, subject) DO UPDATE SET
               student_name = excluded.student_name,
               class_name = excluded.class_name,
               obtained_marks = excluded.obtained_marks,
               total_marks = excluded.total_marks,
               percentage = NULL,
               grade = NULL,
               gpa = NULL,
               updated_at = excluded.updated_at
             RETURNING id",
            (
                Uuid::new_v4().to_string(),
                &school_id,
                &m.student_id,
                &m.student_name,
                &m.class_name,
                &m.exam_name,
                &m.subject,
                m.obtained_marks,
                m.total_marks,
                &now,
            ),
            |r| r.get(0),
        );
        match mark_id {
            Ok(id) => mark_ids.push(id),
            Err(e) => {
                let _ = tx.rollback();
                return err(
                    &req.id,
                    "db_insert_failed",
                    e.to_string(),
                    Some(json!({ "table": "marks" })),
                );
            }
        }
    }
    if let Err(e) = tx.commit() {
        return err(&req.id, "db_commit_failed", e.to_string(), None);
    }

    tracing::debug!(school_id = %school_id, count = mark_ids.len(), "marks upserted");
    ok(
        &req.id,
        json!({ "upserted": mark_ids.len(), "markIds": mark_ids }),
    )
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "marks.list" => Some(handle_marks_list(state, req)),
        "marks.upsert" => Some(handle_marks_upsert(state, req)),
        _ => None,
    }
}
