use crate::db;
use crate::grading::SummaryPassPolicy;
use crate::ipc::error::{err, ok};
use crate::ipc::helpers::db_conn;
use crate::ipc::types::{AppState, Request};
use crate::ranking::{RankTiePolicy, SortKey, SortOrder};
use serde_json::{json, Map, Value};

const GRADING_KEY: &str = "setup.grading";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GradingSettings {
    pub summary_pass_policy: SummaryPassPolicy,
    pub rank_tie_policy: RankTiePolicy,
    pub default_sort_by: SortKey,
    pub default_sort_order: SortOrder,
}

impl GradingSettings {
    fn to_json(self) -> Value {
        json!({
            "summaryPassPolicy": self.summary_pass_policy.as_str(),
            "rankTiePolicy": self.rank_tie_policy.as_str(),
            "defaultSortBy": self.default_sort_by.as_str(),
            "defaultSortOrder": self.default_sort_order.as_str()
        })
    }

    fn apply_field(&mut self, key: &str, v: &Value) -> Result<(), String> {
        let s = v
            .as_str()
            .map(str::trim)
            .ok_or_else(|| format!("{} must be string", key))?;
        match key {
            "summaryPassPolicy" => {
                self.summary_pass_policy = SummaryPassPolicy::parse(s).ok_or_else(|| {
                    "summaryPassPolicy must be one of: subjectThreshold, legacyAverage".to_string()
                })?;
            }
            "rankTiePolicy" => {
                self.rank_tie_policy = RankTiePolicy::parse(s).ok_or_else(|| {
                    "rankTiePolicy must be one of: positional, competition".to_string()
                })?;
            }
            "defaultSortBy" => {
                self.default_sort_by = SortKey::parse(s).ok_or_else(|| {
                    "defaultSortBy must be one of: rank, studentId, name".to_string()
                })?;
            }
            "defaultSortOrder" => {
                self.default_sort_order = SortOrder::parse(s)
                    .ok_or_else(|| "defaultSortOrder must be one of: asc, desc".to_string())?;
            }
            _ => return Err(format!("unknown grading field: {}", key)),
        }
        Ok(())
    }

    fn apply_patch(&mut self, patch: &Map<String, Value>) -> Result<(), String> {
        for (k, v) in patch {
            self.apply_field(k, v)?;
        }
        Ok(())
    }
}

pub fn load_grading_settings(conn: &rusqlite::Connection) -> anyhow::Result<GradingSettings> {
    let mut current = GradingSettings::default();
    if let Some(saved) = db::settings_get_json(conn, GRADING_KEY)? {
        if let Some(saved_obj) = saved.as_object() {
            // Field by field: one bad historical value must not reset the rest.
            for (k, v) in saved_obj {
                if let Err(msg) = current.apply_field(k, v) {
                    tracing::warn!(field = %k, %msg, "ignoring saved grading setting");
                }
            }
        }
    }
    Ok(current)
}

fn handle_setup_get(state: &mut AppState, req: &Request) -> Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    match load_grading_settings(conn) {
        Ok(grading) => ok(&req.id, json!({ "grading": grading.to_json() })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_setup_update(state: &mut AppState, req: &Request) -> Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let Some(section) = req.params.get("section").and_then(|v| v.as_str()) else {
        return err(&req.id, "bad_params", "missing section", None);
    };
    if section != "grading" {
        return err(
            &req.id,
            "bad_params",
            "unknown section",
            Some(json!({ "section": section })),
        );
    }
    let Some(patch_obj) = req.params.get("patch").and_then(|v| v.as_object()) else {
        return err(&req.id, "bad_params", "patch must be an object", None);
    };

    let mut current = match load_grading_settings(conn) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if let Err(msg) = current.apply_patch(patch_obj) {
        return err(&req.id, "bad_params", msg, None);
    }
    if let Err(e) = db::settings_set_json(conn, GRADING_KEY, &current.to_json()) {
        return err(&req.id, "db_update_failed", e.to_string(), None);
    }
    ok(&req.id, json!({ "ok": true }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<Value> {
    match req.method.as_str() {
        "setup.get" => Some(handle_setup_get(state, req)),
        "setup.update" => Some(handle_setup_update(state, req)),
        _ => None,
    }
}
