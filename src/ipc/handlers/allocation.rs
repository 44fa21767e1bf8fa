use crate::allocation::{AllocationState, ExamAllocation, ExamAllocations};
use crate::export::{seating_plan_csv, SeatRow};
use crate::ipc::error::{allocation_err, err, ok};
use crate::ipc::helpers::{get_required_str, require_db, HandlerErr};
use crate::ipc::types::{AppState, Request};
use crate::seating::HallAllocation;
use crate::store::SqliteWorkspace;
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use std::collections::HashMap;
use std::path::PathBuf;
use tracing::warn;

struct NameBook {
    students: HashMap<String, (String, String)>,
    classrooms: HashMap<String, String>,
}

impl NameBook {
    fn load(conn: &Connection, exam_id: &str) -> Result<Self, HandlerErr> {
        let mut stmt = conn
            .prepare(
                "SELECT s.id, s.registration_no, s.display_name
                 FROM seat_assignments sa
                 JOIN students s ON s.id = sa.student_id
                 WHERE sa.exam_id = ?",
            )
            .map_err(|e| HandlerErr::db("db_query_failed", e))?;
        let students = stmt
            .query_map([exam_id], |r| {
                Ok((
                    r.get::<_, String>(0)?,
                    (r.get::<_, String>(1)?, r.get::<_, String>(2)?),
                ))
            })
            .and_then(|it| it.collect::<Result<HashMap<_, _>, _>>())
            .map_err(|e| HandlerErr::db("db_query_failed", e))?;

        let mut stmt = conn
            .prepare(
                "SELECT c.id, c.name
                 FROM hall_allocations h
                 JOIN classrooms c ON c.id = h.classroom_id
                 WHERE h.exam_id = ?",
            )
            .map_err(|e| HandlerErr::db("db_query_failed", e))?;
        let classrooms = stmt
            .query_map([exam_id], |r| {
                Ok((r.get::<_, String>(0)?, r.get::<_, String>(1)?))
            })
            .and_then(|it| it.collect::<Result<HashMap<_, _>, _>>())
            .map_err(|e| HandlerErr::db("db_query_failed", e))?;

        Ok(Self {
            students,
            classrooms,
        })
    }

    /// The plan is already committed when this runs, so a failed lookup only
    /// costs the display names.
    fn load_or_blank(conn: &Connection, exam_id: &str) -> Self {
        Self::load(conn, exam_id).unwrap_or_else(|e| {
            warn!(exam_id, code = e.code, error = %e.message, "seat names unavailable");
            Self {
                students: HashMap::new(),
                classrooms: HashMap::new(),
            }
        })
    }

    fn student(&self, id: &str) -> (String, String) {
        self.students.get(id).cloned().unwrap_or_default()
    }

    fn classroom(&self, id: &str) -> String {
        self.classrooms.get(id).cloned().unwrap_or_default()
    }
}

fn hall_views(names: &NameBook, halls: &[HallAllocation]) -> Vec<serde_json::Value> {
    halls
        .iter()
        .map(|hall| {
            let seats: Vec<serde_json::Value> = hall
                .assigned_seats
                .iter()
                .map(|seat| {
                    let (registration_no, display_name) = names.student(&seat.student_id);
                    json!({
                        "studentId": seat.student_id,
                        "registrationNo": registration_no,
                        "displayName": display_name,
                        "rowIndex": seat.row_index,
                        "columnIndex": seat.column_index,
                        "seatLabel": seat.seat_label,
                    })
                })
                .collect();
            json!({
                "classroomId": hall.classroom_id,
                "classroomName": names.classroom(&hall.classroom_id),
                "capacity": hall.capacity,
                "occupied": hall.occupied(),
                "seats": seats,
            })
        })
        .collect()
}

fn seated_count(halls: &[HallAllocation]) -> usize {
    halls.iter().map(|h| h.occupied()).sum()
}

fn handle_allocation_run(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match require_db(state) {
        Ok(c) => c,
        Err(e) => return e.response(&req.id),
    };
    let exam_id = match get_required_str(&req.params, "examId") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };

    let ws = SqliteWorkspace::new(conn);
    let engine = ExamAllocations::new(&ws, &ws, &ws, &state.exam_locks);
    let plan = match engine.allocate(&exam_id) {
        Ok(plan) => plan,
        Err(e) => return allocation_err(&req.id, &e),
    };

    let names = NameBook::load_or_blank(conn, &exam_id);
    ok(
        &req.id,
        json!({
            "examId": exam_id,
            "state": AllocationState::Allocated.as_str(),
            "seatedCount": seated_count(&plan),
            "halls": hall_views(&names, &plan),
        }),
    )
}

fn handle_allocation_lock(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match require_db(state) {
        Ok(c) => c,
        Err(e) => return e.response(&req.id),
    };
    let exam_id = match get_required_str(&req.params, "examId") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };

    let ws = SqliteWorkspace::new(conn);
    let engine = ExamAllocations::new(&ws, &ws, &ws, &state.exam_locks);
    match engine.lock(&exam_id) {
        Ok(s) => ok(&req.id, json!({ "examId": exam_id, "state": s.as_str() })),
        Err(e) => allocation_err(&req.id, &e),
    }
}

fn load_plan(
    conn: &Connection,
    state: &AppState,
    req: &Request,
    exam_id: &str,
) -> Result<ExamAllocation, serde_json::Value> {
    let ws = SqliteWorkspace::new(conn);
    ExamAllocations::new(&ws, &ws, &ws, &state.exam_locks)
        .plan(exam_id)
        .map_err(|e| allocation_err(&req.id, &e))
}

fn handle_allocation_get(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match require_db(state) {
        Ok(c) => c,
        Err(e) => return e.response(&req.id),
    };
    let exam_id = match get_required_str(&req.params, "examId") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };

    let plan = match load_plan(conn, state, req, &exam_id) {
        Ok(p) => p,
        Err(resp) => return resp,
    };
    let timestamps: (Option<String>, Option<String>) = match conn.query_row(
        "SELECT allocated_at, locked_at FROM exams WHERE id = ?",
        [&exam_id],
        |r| Ok((r.get(0)?, r.get(1)?)),
    ) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let names = match NameBook::load(conn, &exam_id) {
        Ok(n) => n,
        Err(e) => return e.response(&req.id),
    };

    ok(
        &req.id,
        json!({
            "examId": exam_id,
            "state": plan.state.as_str(),
            "allocatedAt": timestamps.0,
            "lockedAt": timestamps.1,
            "seatedCount": seated_count(&plan.halls),
            "halls": hall_views(&names, &plan.halls),
        }),
    )
}

fn handle_allocation_student_seat(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match require_db(state) {
        Ok(c) => c,
        Err(e) => return e.response(&req.id),
    };
    let (exam_id, student_id) = match (
        get_required_str(&req.params, "examId"),
        get_required_str(&req.params, "studentId"),
    ) {
        (Ok(e), Ok(s)) => (e, s),
        (Err(e), _) | (_, Err(e)) => return e.response(&req.id),
    };

    let plan_state = match load_plan(conn, state, req, &exam_id) {
        Ok(p) => p.state,
        Err(resp) => return resp,
    };
    if plan_state == AllocationState::Unallocated {
        return err(
            &req.id,
            "not_yet_allocated",
            "exam has no seat allocation yet",
            None,
        );
    }

    let seat = conn
        .query_row(
            "SELECT sa.classroom_id, c.name, sa.row_index, sa.column_index, sa.seat_label
             FROM seat_assignments sa
             JOIN classrooms c ON c.id = sa.classroom_id
             WHERE sa.exam_id = ? AND sa.student_id = ?",
            (&exam_id, &student_id),
            |r| {
                Ok(json!({
                    "classroomId": r.get::<_, String>(0)?,
                    "classroomName": r.get::<_, String>(1)?,
                    "rowIndex": r.get::<_, i64>(2)?,
                    "columnIndex": r.get::<_, i64>(3)?,
                    "seatLabel": r.get::<_, String>(4)?,
                }))
            },
        )
        .optional();

    match seat {
        Ok(Some(seat)) => ok(
            &req.id,
            json!({
                "examId": exam_id,
                "studentId": student_id,
                "state": plan_state.as_str(),
                "final": plan_state == AllocationState::Locked,
                "seat": seat,
            }),
        ),
        Ok(None) => err(
            &req.id,
            "not_found",
            "student has no seat for this exam",
            Some(json!({ "studentId": student_id })),
        ),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_allocation_export_csv(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match require_db(state) {
        Ok(c) => c,
        Err(e) => return e.response(&req.id),
    };
    let exam_id = match get_required_str(&req.params, "examId") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    let out_path = match get_required_str(&req.params, "outPath") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };

    let plan = match load_plan(conn, state, req, &exam_id) {
        Ok(p) => p,
        Err(resp) => return resp,
    };
    if plan.state == AllocationState::Unallocated {
        return err(
            &req.id,
            "not_yet_allocated",
            "exam has no seat allocation yet",
            None,
        );
    }
    let names = match NameBook::load(conn, &exam_id) {
        Ok(n) => n,
        Err(e) => return e.response(&req.id),
    };

    let mut rows: Vec<SeatRow> = Vec::new();
    for (i, hall) in plan.halls.iter().enumerate() {
        let classroom_name = names.classroom(&hall.classroom_id);
        for seat in &hall.assigned_seats {
            let (registration_no, student_name) = names.student(&seat.student_id);
            rows.push(SeatRow {
                hall_order: i + 1,
                classroom_id: hall.classroom_id.clone(),
                classroom_name: classroom_name.clone(),
                seat_label: seat.seat_label.clone(),
                row_index: seat.row_index,
                column_index: seat.column_index,
                student_id: seat.student_id.clone(),
                registration_no,
                student_name,
            });
        }
    }

    let out = PathBuf::from(&out_path);
    if let Some(parent) = out.parent() {
        if let Err(e) = std::fs::create_dir_all(parent) {
            return err(
                &req.id,
                "io_failed",
                e.to_string(),
                Some(json!({ "path": out_path })),
            );
        }
    }
    if let Err(e) = std::fs::write(&out, seating_plan_csv(&rows)) {
        return err(
            &req.id,
            "io_failed",
            e.to_string(),
            Some(json!({ "path": out_path })),
        );
    }

    ok(
        &req.id,
        json!({
            "ok": true,
            "rowsExported": rows.len(),
            "path": out_path,
            "state": plan.state.as_str()
        }),
    )
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "allocation.run" => Some(handle_allocation_run(state, req)),
        "allocation.lock" => Some(handle_allocation_lock(state, req)),
        "allocation.get" => Some(handle_allocation_get(state, req)),
        "allocation.studentSeat" => Some(handle_allocation_student_seat(state, req)),
        "allocation.exportCsv" => Some(handle_allocation_export_csv(state, req)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::seating::SeatAssignment;

    fn one_hall() -> Vec<HallAllocation> {
        vec![HallAllocation {
            classroom_id: "c1".to_string(),
            assigned_seats: vec![SeatAssignment {
                student_id: "s1".to_string(),
                hall_id: "c1".to_string(),
                row_index: 1,
                column_index: 1,
                seat_label: "A1".to_string(),
            }],
            capacity: 4,
        }]
    }

    #[test]
    fn committed_plan_renders_without_names_when_lookup_fails() {
        // No schema, so every name query fails.
        let conn = Connection::open_in_memory().expect("open");
        assert!(NameBook::load(&conn, "E1").is_err());

        let names = NameBook::load_or_blank(&conn, "E1");
        let views = hall_views(&names, &one_hall());
        assert_eq!(views.len(), 1);
        assert_eq!(views[0]["classroomId"].as_str(), Some("c1"));
        assert_eq!(views[0]["classroomName"].as_str(), Some(""));
        assert_eq!(views[0]["occupied"].as_u64(), Some(1));
        assert_eq!(views[0]["seats"][0]["seatLabel"].as_str(), Some("A1"));
        assert_eq!(views[0]["seats"][0]["displayName"].as_str(), Some(""));
    }

    #[test]
    fn names_are_joined_from_the_workspace() {
        let conn = Connection::open_in_memory().expect("open");
        conn.execute_batch(
            "CREATE TABLE students(id TEXT, registration_no TEXT, display_name TEXT);
             CREATE TABLE classrooms(id TEXT, name TEXT);
             CREATE TABLE seat_assignments(exam_id TEXT, student_id TEXT);
             CREATE TABLE hall_allocations(exam_id TEXT, classroom_id TEXT);
             INSERT INTO students VALUES('s1', 'R001', 'Ada');
             INSERT INTO classrooms VALUES('c1', 'Main Hall');
             INSERT INTO seat_assignments VALUES('E1', 's1');
             INSERT INTO hall_allocations VALUES('E1', 'c1');",
        )
        .expect("seed");

        let names = NameBook::load_or_blank(&conn, "E1");
        let views = hall_views(&names, &one_hall());
        assert_eq!(views[0]["classroomName"].as_str(), Some("Main Hall"));
        assert_eq!(views[0]["seats"][0]["registrationNo"].as_str(), Some("R001"));
        assert_eq!(views[0]["seats"][0]["displayName"].as_str(), Some("Ada"));
    }
}
