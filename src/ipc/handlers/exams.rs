use crate::allocation::{AllocationStore, EligibilityProvider};
use crate::ipc::error::ok;
use crate::ipc::helpers::{get_required_str, require_db, require_exam, HandlerErr};
use crate::ipc::types::{AppState, Request};
use crate::store::{now_rfc3339, SqliteWorkspace};
use rusqlite::OptionalExtension;
use serde_json::json;
use std::collections::{HashMap, HashSet};
use tracing::info;
use uuid::Uuid;

fn handle_exams_list(state: &mut AppState) -> Result<serde_json::Value, HandlerErr> {
    let Some(conn) = state.db.as_ref() else {
        return Ok(json!({ "exams": [] }));
    };

    // Correlated subqueries avoid double-counting across the two child tables.
    let mut stmt = conn
        .prepare(
            "SELECT
               e.id,
               e.title,
               e.exam_date,
               e.allocation_state,
               e.allocated_at,
               e.locked_at,
               (SELECT COUNT(*) FROM exam_eligibility el WHERE el.exam_id = e.id) AS eligible_count,
               (SELECT COUNT(*) FROM seat_assignments sa WHERE sa.exam_id = e.id) AS seated_count
             FROM exams e
             ORDER BY e.exam_date IS NULL, e.exam_date, e.title, e.id",
        )
        .map_err(|e| HandlerErr::db("db_query_failed", e))?;
    let exams = stmt
        .query_map([], |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "title": r.get::<_, String>(1)?,
                "examDate": r.get::<_, Option<String>>(2)?,
                "state": r.get::<_, String>(3)?,
                "allocatedAt": r.get::<_, Option<String>>(4)?,
                "lockedAt": r.get::<_, Option<String>>(5)?,
                "eligibleCount": r.get::<_, i64>(6)?,
                "seatedCount": r.get::<_, i64>(7)?,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(|e| HandlerErr::db("db_query_failed", e))?;

    Ok(json!({ "exams": exams }))
}

fn handle_exams_create(state: &mut AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let conn = require_db(state)?;
    let title = get_required_str(&req.params, "title")?;
    let exam_date = req
        .params
        .get("examDate")
        .and_then(|v| v.as_str())
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty());
    if let Some(d) = exam_date.as_deref() {
        if chrono::NaiveDate::parse_from_str(d, "%Y-%m-%d").is_err() {
            return Err(HandlerErr::new("bad_params", "examDate must be YYYY-MM-DD")
                .with_details(json!({ "examDate": d })));
        }
    }

    let exam_id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO exams(id, title, exam_date, allocation_state, created_at)
         VALUES(?, ?, ?, 'unallocated', ?)",
        (&exam_id, &title, &exam_date, now_rfc3339()),
    )
    .map_err(|e| HandlerErr::db("db_insert_failed", e).with_details(json!({ "table": "exams" })))?;

    Ok(json!({
        "examId": exam_id,
        "title": title,
        "examDate": exam_date,
        "state": "unallocated"
    }))
}

fn handle_exams_delete(state: &mut AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let conn = require_db(state)?;
    let exam_id = get_required_str(&req.params, "examId")?;

    state.exam_locks.run_exclusive(&exam_id, || -> Result<serde_json::Value, HandlerErr> {
        require_exam(conn, &exam_id)?;

        let tx = conn
            .unchecked_transaction()
            .map_err(|e| HandlerErr::db("db_tx_failed", e))?;
        // Dependency order; there is no ON DELETE CASCADE.
        for table in ["seat_assignments", "hall_allocations", "exam_eligibility"] {
            tx.execute(&format!("DELETE FROM {table} WHERE exam_id = ?"), [&exam_id])
                .map_err(|e| {
                    HandlerErr::db("db_delete_failed", e).with_details(json!({ "table": table }))
                })?;
        }
        tx.execute("DELETE FROM exams WHERE id = ?", [&exam_id])
            .map_err(|e| {
                HandlerErr::db("db_delete_failed", e).with_details(json!({ "table": "exams" }))
            })?;
        tx.commit()
            .map_err(|e| HandlerErr::db("db_commit_failed", e))?;

        info!(exam_id = %exam_id, "exam deleted");
        Ok(json!({ "examId": exam_id, "deleted": true }))
    })
}

fn handle_eligibility_set(state: &mut AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let conn = require_db(state)?;
    let exam_id = get_required_str(&req.params, "examId")?;
    let Some(raw_ids) = req.params.get("studentIds").and_then(|v| v.as_array()) else {
        return Err(HandlerErr::new("bad_params", "missing studentIds"));
    };
    require_exam(conn, &exam_id)?;

    let mut seen = HashSet::new();
    let mut student_ids: Vec<String> = Vec::new();
    for v in raw_ids {
        let Some(id) = v.as_str().map(str::trim).filter(|s| !s.is_empty()) else {
            return Err(HandlerErr::new("bad_params", "studentIds must be non-empty strings"));
        };
        if seen.insert(id.to_string()) {
            student_ids.push(id.to_string());
        }
    }

    let mut unknown: Vec<String> = Vec::new();
    for id in &student_ids {
        let found: Option<i64> = conn
            .query_row("SELECT 1 FROM students WHERE id = ?", [id], |r| r.get(0))
            .optional()
            .map_err(|e| HandlerErr::db("db_query_failed", e))?;
        if found.is_none() {
            unknown.push(id.clone());
        }
    }
    if !unknown.is_empty() {
        return Err(HandlerErr::new("bad_params", "unknown student ids")
            .with_details(json!({ "unknown": unknown })));
    }

    let tx = conn
        .unchecked_transaction()
        .map_err(|e| HandlerErr::db("db_tx_failed", e))?;
    tx.execute("DELETE FROM exam_eligibility WHERE exam_id = ?", [&exam_id])
        .map_err(|e| HandlerErr::db("db_delete_failed", e))?;
    for id in &student_ids {
        tx.execute(
            "INSERT INTO exam_eligibility(exam_id, student_id) VALUES(?, ?)",
            (&exam_id, id),
        )
        .map_err(|e| {
            HandlerErr::db("db_insert_failed", e)
                .with_details(json!({ "table": "exam_eligibility" }))
        })?;
    }
    tx.commit()
        .map_err(|e| HandlerErr::db("db_commit_failed", e))?;

    let ws = SqliteWorkspace::new(conn);
    let allocation_state = ws
        .state(&exam_id)
        .map_err(|e| HandlerErr::db("db_query_failed", e))?
        .map(|s| s.as_str());

    Ok(json!({
        "examId": exam_id,
        "eligibleCount": student_ids.len(),
        "state": allocation_state
    }))
}

fn handle_eligibility_list(state: &mut AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let conn = require_db(state)?;
    let exam_id = get_required_str(&req.params, "examId")?;
    require_exam(conn, &exam_id)?;

    let ids = SqliteWorkspace::new(conn)
        .eligible_students(&exam_id)
        .map_err(|e| HandlerErr::db("db_query_failed", e))?;

    let mut stmt = conn
        .prepare(
            "SELECT s.id, s.registration_no, s.display_name
             FROM exam_eligibility e
             JOIN students s ON s.id = e.student_id
             WHERE e.exam_id = ?",
        )
        .map_err(|e| HandlerErr::db("db_query_failed", e))?;
    let by_id: HashMap<String, (String, String)> = stmt
        .query_map([&exam_id], |r| {
            Ok((
                r.get::<_, String>(0)?,
                (r.get::<_, String>(1)?, r.get::<_, String>(2)?),
            ))
        })
        .and_then(|it| it.collect::<Result<HashMap<_, _>, _>>())
        .map_err(|e| HandlerErr::db("db_query_failed", e))?;

    let students: Vec<serde_json::Value> = ids
        .iter()
        .map(|id| {
            let (reg, name) = by_id.get(id).cloned().unwrap_or_default();
            json!({ "studentId": id, "registrationNo": reg, "displayName": name })
        })
        .collect();

    Ok(json!({ "examId": exam_id, "students": students }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let result = match req.method.as_str() {
        "exams.list" => handle_exams_list(state),
        "exams.create" => handle_exams_create(state, req),
        "exams.delete" => handle_exams_delete(state, req),
        "eligibility.set" => handle_eligibility_set(state, req),
        "eligibility.list" => handle_eligibility_list(state, req),
        _ => return None,
    };
    Some(match result {
        Ok(v) => ok(&req.id, v),
        Err(e) => e.response(&req.id),
    })
}
