use crate::ipc::error::ok;
use crate::ipc::helpers::{get_required_i64, get_required_str, require_db, HandlerErr};
use crate::ipc::types::{AppState, Request};
use crate::seating::MAX_ROWS;
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

fn classroom_exists(conn: &Connection, classroom_id: &str) -> Result<bool, HandlerErr> {
    conn.query_row("SELECT 1 FROM classrooms WHERE id = ?", [classroom_id], |r| {
        r.get::<_, i64>(0)
    })
    .optional()
    .map(|v| v.is_some())
    .map_err(|e| HandlerErr::db("db_query_failed", e))
}

fn handle_classrooms_list(state: &mut AppState) -> Result<serde_json::Value, HandlerErr> {
    let Some(conn) = state.db.as_ref() else {
        return Ok(json!({ "classrooms": [] }));
    };

    let mut stmt = conn
        .prepare(
            "SELECT id, name, seat_rows, seat_columns, active
             FROM classrooms
             ORDER BY sort_order, rowid",
        )
        .map_err(|e| HandlerErr::db("db_query_failed", e))?;
    let classrooms = stmt
        .query_map([], |r| {
            let rows: i64 = r.get(2)?;
            let columns: i64 = r.get(3)?;
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "name": r.get::<_, String>(1)?,
                "rows": rows,
                "columns": columns,
                "capacity": rows * columns,
                "active": r.get::<_, i64>(4)? != 0,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(|e| HandlerErr::db("db_query_failed", e))?;

    Ok(json!({ "classrooms": classrooms }))
}

fn handle_classrooms_create(state: &mut AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let conn = require_db(state)?;
    let name = get_required_str(&req.params, "name")?;
    let rows = get_required_i64(&req.params, "rows")?;
    let columns = get_required_i64(&req.params, "columns")?;
    let active = req
        .params
        .get("active")
        .and_then(|v| v.as_bool())
        .unwrap_or(true);

    if !(1..=i64::from(MAX_ROWS)).contains(&rows) {
        return Err(
            HandlerErr::new("bad_params", format!("rows must be between 1 and {}", MAX_ROWS))
                .with_details(json!({ "rows": rows, "maxRows": MAX_ROWS })),
        );
    }
    if columns < 1 || columns > i64::from(u32::MAX) {
        return Err(HandlerErr::new("bad_params", "columns must be at least 1")
            .with_details(json!({ "columns": columns })));
    }

    let sort_order: i64 = conn
        .query_row(
            "SELECT COALESCE(MAX(sort_order), -1) + 1 FROM classrooms",
            [],
            |r| r.get(0),
        )
        .map_err(|e| HandlerErr::db("db_query_failed", e))?;

    let classroom_id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO classrooms(id, name, seat_rows, seat_columns, active, sort_order)
         VALUES(?, ?, ?, ?, ?, ?)",
        (&classroom_id, &name, rows, columns, active as i64, sort_order),
    )
    .map_err(|e| {
        HandlerErr::db("db_insert_failed", e).with_details(json!({ "table": "classrooms" }))
    })?;

    Ok(json!({
        "classroomId": classroom_id,
        "name": name,
        "capacity": rows * columns,
        "active": active
    }))
}

fn handle_classrooms_set_active(
    state: &mut AppState,
    req: &Request,
) -> Result<serde_json::Value, HandlerErr> {
    let conn = require_db(state)?;
    let classroom_id = get_required_str(&req.params, "classroomId")?;
    let active = req
        .params
        .get("active")
        .and_then(|v| v.as_bool())
        .ok_or_else(|| HandlerErr::new("bad_params", "missing active"))?;

    let updated = conn
        .execute(
            "UPDATE classrooms SET active = ? WHERE id = ?",
            (active as i64, &classroom_id),
        )
        .map_err(|e| HandlerErr::db("db_update_failed", e))?;
    if updated == 0 {
        return Err(HandlerErr::new("not_found", "classroom not found"));
    }

    Ok(json!({ "classroomId": classroom_id, "active": active }))
}

fn handle_classrooms_delete(state: &mut AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let conn = require_db(state)?;
    let classroom_id = get_required_str(&req.params, "classroomId")?;

    if !classroom_exists(conn, &classroom_id)? {
        return Err(HandlerErr::new("not_found", "classroom not found"));
    }

    // Persisted plans keep pointing at their halls; deactivate instead.
    let plans: i64 = conn
        .query_row(
            "SELECT COUNT(*) FROM hall_allocations WHERE classroom_id = ?",
            [&classroom_id],
            |r| r.get(0),
        )
        .map_err(|e| HandlerErr::db("db_query_failed", e))?;
    if plans > 0 {
        return Err(HandlerErr::new(
            "in_use",
            "classroom is part of a seating plan; deactivate it instead",
        )
        .with_details(json!({ "plans": plans })));
    }

    conn.execute("DELETE FROM classrooms WHERE id = ?", [&classroom_id])
        .map_err(|e| {
            HandlerErr::db("db_delete_failed", e).with_details(json!({ "table": "classrooms" }))
        })?;

    Ok(json!({ "classroomId": classroom_id, "deleted": true }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let result = match req.method.as_str() {
        "classrooms.list" => handle_classrooms_list(state),
        "classrooms.create" => handle_classrooms_create(state, req),
        "classrooms.setActive" => handle_classrooms_set_active(state, req),
        "classrooms.delete" => handle_classrooms_delete(state, req),
        _ => return None,
    };
    Some(match result {
        Ok(v) => ok(&req.id, v),
        Err(e) => e.response(&req.id),
    })
}
