use anyhow::Context;
use rusqlite::Connection;
use std::path::Path;
use tracing::info;

pub const DB_FILE_NAME: &str = "examseat.sqlite3";

pub fn open_db(workspace: &Path) -> anyhow::Result<Connection> {
    std::fs::create_dir_all(workspace).with_context(|| {
        format!("failed to create workspace {}", workspace.to_string_lossy())
    })?;
    let db_path = workspace.join(DB_FILE_NAME);
    let conn = Connection::open(&db_path)
        .with_context(|| format!("failed to open {}", db_path.to_string_lossy()))?;
    conn.execute("PRAGMA foreign_keys = ON", [])?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS students(
            id TEXT PRIMARY KEY,
            registration_no TEXT NOT NULL UNIQUE,
            display_name TEXT NOT NULL,
            created_at TEXT NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS classrooms(
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            seat_rows INTEGER NOT NULL,
            seat_columns INTEGER NOT NULL,
            active INTEGER NOT NULL DEFAULT 1,
            sort_order INTEGER NOT NULL
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_classrooms_active_sort ON classrooms(active, sort_order)",
        [],
    )?;

    // allocation_state is one of unallocated | allocated | locked.
    conn.execute(
        "CREATE TABLE IF NOT EXISTS exams(
            id TEXT PRIMARY KEY,
            title TEXT NOT NULL,
            exam_date TEXT,
            allocation_state TEXT NOT NULL DEFAULT 'unallocated',
            allocated_at TEXT,
            locked_at TEXT,
            created_at TEXT NOT NULL,
            CHECK(allocation_state IN ('unallocated', 'allocated', 'locked'))
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS exam_eligibility(
            exam_id TEXT NOT NULL,
            student_id TEXT NOT NULL,
            PRIMARY KEY(exam_id, student_id),
            FOREIGN KEY(exam_id) REFERENCES exams(id),
            FOREIGN KEY(student_id) REFERENCES students(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_exam_eligibility_student ON exam_eligibility(student_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS hall_allocations(
            exam_id TEXT NOT NULL,
            classroom_id TEXT NOT NULL,
            hall_order INTEGER NOT NULL,
            capacity INTEGER NOT NULL,
            PRIMARY KEY(exam_id, classroom_id),
            UNIQUE(exam_id, hall_order),
            FOREIGN KEY(exam_id) REFERENCES exams(id),
            FOREIGN KEY(classroom_id) REFERENCES classrooms(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_hall_allocations_classroom ON hall_allocations(classroom_id)",
        [],
    )?;

    // The UNIQUE seat constraint backs up the allocator's no-double-booking guarantee.
    conn.execute(
        "CREATE TABLE IF NOT EXISTS seat_assignments(
            exam_id TEXT NOT NULL,
            student_id TEXT NOT NULL,
            classroom_id TEXT NOT NULL,
            row_index INTEGER NOT NULL,
            column_index INTEGER NOT NULL,
            seat_label TEXT NOT NULL,
            PRIMARY KEY(exam_id, student_id),
            UNIQUE(exam_id, classroom_id, row_index, column_index),
            FOREIGN KEY(exam_id, classroom_id) REFERENCES hall_allocations(exam_id, classroom_id),
            FOREIGN KEY(student_id) REFERENCES students(id)
        )",
        [],
    )?;

    info!(path = %db_path.to_string_lossy(), "workspace database ready");
    Ok(conn)
}
