use crate::ipc::error::ok;
use crate::ipc::helpers::{get_required_str, require_db, HandlerErr};
use crate::ipc::types::{AppState, Request};
use crate::store::now_rfc3339;
use rusqlite::OptionalExtension;
use serde_json::json;
use uuid::Uuid;

fn handle_students_list(state: &mut AppState) -> Result<serde_json::Value, HandlerErr> {
    let Some(conn) = state.db.as_ref() else {
        return Ok(json!({ "students": [] }));
    };

    let mut stmt = conn
        .prepare(
            "SELECT id, registration_no, display_name
             FROM students
             ORDER BY registration_no, id",
        )
        .map_err(|e| HandlerErr::db("db_query_failed", e))?;
    let students = stmt
        .query_map([], |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "registrationNo": r.get::<_, String>(1)?,
                "displayName": r.get::<_, String>(2)?,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(|e| HandlerErr::db("db_query_failed", e))?;

    Ok(json!({ "students": students }))
}

fn handle_students_create(state: &mut AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let conn = require_db(state)?;
    let registration_no = get_required_str(&req.params, "registrationNo")?;
    let display_name = get_required_str(&req.params, "displayName")?;

    let taken: Option<String> = conn
        .query_row(
            "SELECT id FROM students WHERE registration_no = ?",
            [&registration_no],
            |r| r.get(0),
        )
        .optional()
        .map_err(|e| HandlerErr::db("db_query_failed", e))?;
    if let Some(existing) = taken {
        return Err(HandlerErr::new("conflict", "registrationNo already in use")
            .with_details(json!({ "studentId": existing })));
    }

    let student_id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO students(id, registration_no, display_name, created_at) VALUES(?, ?, ?, ?)",
        (&student_id, &registration_no, &display_name, now_rfc3339()),
    )
    .map_err(|e| {
        HandlerErr::db("db_insert_failed", e).with_details(json!({ "table": "students" }))
    })?;

    Ok(json!({
        "studentId": student_id,
        "registrationNo": registration_no,
        "displayName": display_name
    }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let result = match req.method.as_str() {
        "students.list" => handle_students_list(state),
        "students.create" => handle_students_create(state, req),
        _ => return None,
    };
    Some(match result {
        Ok(v) => ok(&req.id, v),
        Err(e) => e.response(&req.id),
    })
}
