use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{db_conn, query_failed, required_str};
use crate::ipc::types::{AppState, Request};
use crate::store::{MarkStore, SqliteMarkStore};
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use std::collections::HashSet;
use uuid::Uuid;

fn parse_subjects(req: &Request) -> Result<Option<Vec<String>>, serde_json::Value> {
    let Some(raw) = req.params.get("subjects") else {
        return Ok(None);
    };
    if raw.is_null() {
        return Ok(None);
    }
    let Some(arr) = raw.as_array() else {
        return Err(err(&req.id, "bad_params", "subjects must be an array", None));
    };
    let mut seen: HashSet<String> = HashSet::new();
    let mut subjects = Vec::with_capacity(arr.len());
    for (i, v) in arr.iter().enumerate() {
        let Some(s) = v.as_str().map(str::trim).filter(|s| !s.is_empty()) else {
            return Err(err(
                &req.id,
                "bad_params",
                format!("subjects[{}] must be a non-empty string", i),
                None,
            ));
        };
        // Keep first occurrence; the catalog is a set with display order.
        if seen.insert(s.to_string()) {
            subjects.push(s.to_string());
        }
    }
    Ok(Some(subjects))
}

fn replace_subjects(conn: &Connection, exam_id: &str, subjects: &[String]) -> rusqlite::Result<()> {
    let tx = conn.unchecked_transaction()?;
    tx.execute("DELETE FROM exam_subjects WHERE exam_id = ?", [exam_id])?;
    for (i, s) in subjects.iter().enumerate() {
        tx.execute(
            "INSERT INTO exam_subjects(exam_id, subject, sort_order) VALUES(?, ?, ?)",
            (exam_id, s, i as i64),
        )?;
    }
    tx.commit()
}

fn handle_exams_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let school_id = match required_str(req, "schoolId") {
        Ok(v) => v,
        Err(e) => return e,
    };

    let mut stmt = match conn.prepare("SELECT id, name FROM exams WHERE school_id = ? ORDER BY name") {
        Ok(s) => s,
        Err(e) => return query_failed(req, e),
    };
    let exams: Vec<(String, String)> = match stmt
        .query_map([&school_id], |r| Ok((r.get(0)?, r.get(1)?)))
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
    {
        Ok(v) => v,
        Err(e) => return query_failed(req, e),
    };

    let store = SqliteMarkStore::new(conn);
    let mut out = Vec::with_capacity(exams.len());
    for (exam_id, name) in exams {
        let subjects = match store.fetch_exam_subjects(&exam_id) {
            Ok(v) => v,
            Err(e) => return query_failed(req, e),
        };
        out.push(json!({ "examId": exam_id, "name": name, "subjects": subjects }));
    }
    ok(&req.id, json!({ "exams": out }))
}

fn handle_exams_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let school_id = match required_str(req, "schoolId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let name = match required_str(req, "name") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let subjects = match parse_subjects(req) {
        Ok(v) => v.unwrap_or_default(),
        Err(e) => return e,
    };

    let existing: Option<String> = match conn
        .query_row(
            "SELECT id FROM exams WHERE school_id = ? AND name = ?",
            (&school_id, &name),
            |r| r.get(0),
        )
        .optional()
    {
        Ok(v) => v,
        Err(e) => return query_failed(req, e),
    };
    if let Some(exam_id) = existing {
        return err(
            &req.id,
            "conflict",
            "exam with this name already exists",
            Some(json!({ "examId": exam_id })),
        );
    }

    let exam_id = Uuid::new_v4().to_string();
    if let Err(e) = conn.execute(
        "INSERT INTO exams(id, school_id, name) VALUES(?, ?, ?)",
        (&exam_id, &school_id, &name),
    ) {
        return err(
            &req.id,
            "db_insert_failed",
            e.to_string(),
            Some(json!({ "table": "exams" })),
        );
    }
    if let Err(e) = replace_subjects(conn, &exam_id, &subjects) {
        return err(
            &req.id,
            "db_insert_failed",
            e.to_string(),
            Some(json!({ "table": "exam_subjects" })),
        );
    }
    ok(&req.id, json!({ "examId": exam_id }))
}

fn handle_exam_subjects_set(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let exam_id = match required_str(req, "examId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let subjects = match parse_subjects(req) {
        Ok(Some(v)) => v,
        Ok(None) => return err(&req.id, "bad_params", "missing subjects[]", None),
        Err(e) => return e,
    };

    let exists: Option<i64> = match conn
        .query_row("SELECT 1 FROM exams WHERE id = ?", [&exam_id], |r| r.get(0))
        .optional()
    {
        Ok(v) => v,
        Err(e) => return query_failed(req, e),
    };
    if exists.is_none() {
        return err(&req.id, "not_found", "exam not found", None);
    }

    if let Err(e) = replace_subjects(conn, &exam_id, &subjects) {
        return err(&req.id, "db_update_failed", e.to_string(), None);
    }
    ok(&req.id, json!({ "examId": exam_id, "subjects": subjects }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "exams.list" => Some(handle_exams_list(state, req)),
        "exams.create" => Some(handle_exams_create(state, req)),
        "exams.subjects.set" => Some(handle_exam_subjects_set(state, req)),
        _ => None,
    }
}
