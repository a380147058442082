use crate::grading::{recalculate_exam_grades, ExamClassFilter, MarkRecord};
use crate::ipc::error::{err, ok};
use crate::ipc::handlers::setup::{load_grading_settings, GradingSettings};
use crate::ipc::helpers::{db_conn, query_failed, required_str};
use crate::ipc::types::{AppState, Request};
use crate::ranking::{build_pivot, subject_stats, PivotQuery, RosterEntry, SortKey, SortOrder};
use crate::store::{self, MarkStore, SqliteMarkStore};
use rusqlite::Connection;
use serde_json::json;

/// Roster, marks and subject catalog for one exam+class, as the builders expect them.
struct ExamClassView {
    roster: Vec<RosterEntry>,
    marks: Vec<MarkRecord>,
    catalog: Vec<String>,
}

fn load_exam_class_view(
    conn: &Connection,
    req: &Request,
    school_id: &str,
    exam_id: &str,
    class_name: &str,
) -> Result<ExamClassView, serde_json::Value> {
    let exam_name = match store::exam_name(conn, school_id, exam_id) {
        Ok(Some(v)) => v,
        Ok(None) => return Err(err(&req.id, "not_found", "exam not found", None)),
        Err(e) => return Err(query_failed(req, e)),
    };

    let store = SqliteMarkStore::new(conn);
    let filter = ExamClassFilter {
        exam_name,
        class_name: class_name.to_string(),
    };
    let roster = store
        .fetch_roster(school_id)
        .map_err(|e| query_failed(req, e))?
        .into_iter()
        .filter(|s| s.class_name == class_name)
        .collect();
    let marks = store
        .fetch_marks(school_id)
        .map_err(|e| query_failed(req, e))?
        .into_iter()
        .filter(|m| filter.matches(m))
        .collect();
    let catalog = store
        .fetch_exam_subjects(exam_id)
        .map_err(|e| query_failed(req, e))?;

    Ok(ExamClassView {
        roster,
        marks,
        catalog,
    })
}

fn parse_pivot_query(req: &Request, settings: &GradingSettings) -> Result<PivotQuery, serde_json::Value> {
    let mut query = PivotQuery {
        sort_by: settings.default_sort_by,
        sort_order: settings.default_sort_order,
        ..PivotQuery::default()
    };
    let Some(raw) = req.params.get("query") else {
        return Ok(query);
    };
    if raw.is_null() {
        return Ok(query);
    }
    let Some(obj) = raw.as_object() else {
        return Err(err(&req.id, "bad_params", "query must be an object", None));
    };

    let text = |key: &str| {
        obj.get(key)
            .and_then(|v| v.as_str())
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
    };
    query.search_name = text("searchName");
    query.roll_no = text("rollNo");
    if let Some(s) = text("sortBy") {
        query.sort_by = SortKey::parse(&s).ok_or_else(|| {
            err(
                &req.id,
                "bad_params",
                "query.sortBy must be one of: rank, studentId, name",
                None,
            )
        })?;
    }
    if let Some(s) = text("sortOrder") {
        query.sort_order = SortOrder::parse(&s).ok_or_else(|| {
            err(
                &req.id,
                "bad_params",
                "query.sortOrder must be one of: asc, desc",
                None,
            )
        })?;
    }
    Ok(query)
}

fn handle_grading_recalculate(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let school_id = match required_str(req, "schoolId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let exam_name = match required_str(req, "examName") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let class_name = match required_str(req, "className") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let settings = match load_grading_settings(conn) {
        Ok(v) => v,
        Err(e) => return query_failed(req, e),
    };

    let filter = ExamClassFilter {
        exam_name,
        class_name,
    };
    let store = SqliteMarkStore::new(conn);
    match recalculate_exam_grades(&store, &school_id, &filter, settings.summary_pass_policy) {
        Ok(summary) => ok(
            &req.id,
            json!({
                "summary": summary,
                "summaryPassPolicy": settings.summary_pass_policy.as_str()
            }),
        ),
        Err(e) => query_failed(req, e),
    }
}

fn handle_results_pivot(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let school_id = match required_str(req, "schoolId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let exam_id = match required_str(req, "examId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let class_name = match required_str(req, "className") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let settings = match load_grading_settings(conn) {
        Ok(v) => v,
        Err(e) => return query_failed(req, e),
    };
    let query = match parse_pivot_query(req, &settings) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let view = match load_exam_class_view(conn, req, &school_id, &exam_id, &class_name) {
        Ok(v) => v,
        Err(e) => return e,
    };

    let table = build_pivot(
        &view.roster,
        &view.marks,
        &view.catalog,
        settings.rank_tie_policy,
        &query,
    );
    ok(
        &req.id,
        json!({
            "subjects": table.subjects,
            "rows": table.rows,
            "rankTiePolicy": settings.rank_tie_policy.as_str(),
            "query": query
        }),
    )
}

fn handle_results_subject_stats(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let school_id = match required_str(req, "schoolId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let exam_id = match required_str(req, "examId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let class_name = match required_str(req, "className") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let view = match load_exam_class_view(conn, req, &school_id, &exam_id, &class_name) {
        Ok(v) => v,
        Err(e) => return e,
    };

    let stats = subject_stats(&view.roster, &view.marks, &view.catalog);
    ok(&req.id, json!({ "subjects": stats }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "grading.recalculate" => Some(handle_grading_recalculate(state, req)),
        "results.pivot" => Some(handle_results_pivot(state, req)),
        "results.subjectStats" => Some(handle_results_subject_stats(state, req)),
        _ => None,
    }
}
