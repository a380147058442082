use crate::ipc::error::{err, ok, rejected_item};
use crate::ipc::helpers::{db_conn, optional_str, query_failed, required_str};
use crate::ipc::types::{AppState, Request};
use crate::store::{MarkStore, SqliteMarkStore};
use serde_json::json;
use uuid::Uuid;

const ROSTER_UPSERT_MAX_STUDENTS: usize = 2000;

struct StudentInput {
    student_id: Option<String>,
    name: String,
    class_name: String,
    roll_no: Option<String>,
}

fn parse_student(i: usize, v: &serde_json::Value) -> Result<StudentInput, String> {
    let Some(obj) = v.as_object() else {
        return Err(format!("students[{}] must be an object", i));
    };
    let text = |key: &str| {
        obj.get(key)
            .and_then(|v| v.as_str())
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
    };
    let Some(name) = text("name") else {
        return Err(format!("students[{}] missing name", i));
    };
    let Some(class_name) = text("className") else {
        return Err(format!("students[{}] missing className", i));
    };
    Ok(StudentInput {
        student_id: text("studentId"),
        name,
        class_name,
        roll_no: text("rollNo"),
    })
}

fn handle_roster_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let school_id = match required_str(req, "schoolId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let class_name = optional_str(req, "className");

    let roster = match SqliteMarkStore::new(conn).fetch_roster(&school_id) {
        Ok(v) => v,
        Err(e) => return query_failed(req, e),
    };
    let students: Vec<_> = roster
        .into_iter()
        .filter(|s| class_name.as_ref().map(|c| &s.class_name == c).unwrap_or(true))
        .collect();
    ok(&req.id, json!({ "students": students }))
}

fn handle_roster_upsert(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let school_id = match required_str(req, "schoolId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let Some(students_arr) = req.params.get("students").and_then(|v| v.as_array()) else {
        return err(&req.id, "bad_params", "missing students[]", None);
    };
    if students_arr.len() > ROSTER_UPSERT_MAX_STUDENTS {
        return err(
            &req.id,
            "bad_params",
            format!(
                "roster payload exceeds max students: {} > {}",
                students_arr.len(),
                ROSTER_UPSERT_MAX_STUDENTS
            ),
            None,
        );
    }

    let mut inputs = Vec::with_capacity(students_arr.len());
    for (i, v) in students_arr.iter().enumerate() {
        match parse_student(i, v) {
            Ok(s) => inputs.push(s),
            Err(msg) => return rejected_item(&req.id, msg, i),
        }
    }

    let tx = match conn.unchecked_transaction() {
        Ok(t) => t,
        Err(e) => return err(&req.id, "db_tx_failed", e.to_string(), None),
    };
    let now = chrono::Utc::now().to_rfc3339();
    let mut student_ids: Vec<String> = Vec::with_capacity(inputs.len());
    for s in inputs {
        let student_id = s
            .student_id
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let next_sort: Result<i64, _> = tx.query_row(
            "SELECT COALESCE(MAX(sort_order), -1) + 1 FROM students WHERE school_id = ? AND class_name = ?",
            (&school_id, &s.class_name),
            |r| r.get(0),
        );
        let next_sort = match next_sort {
            Ok(v) => v,
            Err(e) => {
                let _ = tx.rollback();
                return query_failed(req, e);
            }
        };
        // A student moving class goes to the end of the new class. Their
        // marks keep the class they were entered under.
        let written = tx.execute(
            "INSERT INTO students(id, school_id, name, class_name, roll_no, sort_order, updated_at)
             VALUES(?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET
               name = excluded.name,
               sort_order = CASE
                 WHEN students.class_name = excluded.class_name THEN students.sort_order
                 ELSE excluded.sort_order
               END,
               class_name = excluded.class_name,
               roll_no = excluded.roll_no,
               updated_at = excluded.updated_at
             WHERE students.school_id = excluded.school_id",
            (
                &student_id,
                &school_id,
                &s.name,
                &s.class_name,
                &s.roll_no,
                next_sort,
                &now,
            ),
        );
        match written {
            Ok(0) => {
                let _ = tx.rollback();
                return err(
                    &req.id,
                    "bad_params",
                    "studentId belongs to another school",
                    Some(json!({ "studentId": student_id })),
                );
            }
            Ok(_) => {}
            Err(e) => {
                let _ = tx.rollback();
                return err(
                    &req.id,
                    "db_insert_failed",
                    e.to_string(),
                    Some(json!({ "table": "students" })),
                );
            }
        }
        student_ids.push(student_id);
    }
    if let Err(e) = tx.commit() {
        return err(&req.id, "db_commit_failed", e.to_string(), None);
    }

    ok(
        &req.id,
        json!({ "upserted": student_ids.len(), "studentIds": student_ids }),
    )
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "roster.list" => Some(handle_roster_list(state, req)),
        "roster.upsert" => Some(handle_roster_upsert(state, req)),
        _ => None,
    }
}
