use anyhow::{anyhow, bail, Context};
use chrono::{SecondsFormat, Utc};
use rusqlite::{Connection, OptionalExtension};

use crate::allocation::{
    AllocationState, AllocationStore, ClassroomCatalog, EligibilityProvider, ExamAllocation,
};
use crate::seating::{ClassroomDescriptor, HallAllocation, SeatAssignment};

pub fn now_rfc3339() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// SQLite-backed collaborators for the allocation engine. One value serves as
/// roster source, classroom catalog and plan store.
#[derive(Clone, Copy)]
pub struct SqliteWorkspace<'a> {
    conn: &'a Connection,
}

impl<'a> SqliteWorkspace<'a> {
    pub fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }
}

impl EligibilityProvider for SqliteWorkspace<'_> {
    fn eligible_students(&self, exam_id: &str) -> anyhow::Result<Vec<String>> {
        // Registration number collation keeps repeated runs stable.
        let mut stmt = self.conn.prepare(
            "SELECT e.student_id
             FROM exam_eligibility e
             JOIN students s ON s.id = e.student_id
             WHERE e.exam_id = ?
             ORDER BY s.registration_no, s.id",
        )?;
        let ids = stmt
            .query_map([exam_id], |r| r.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(ids)
    }
}

impl ClassroomCatalog for SqliteWorkspace<'_> {
    fn active_classrooms(&self) -> anyhow::Result<Vec<ClassroomDescriptor>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, seat_rows, seat_columns, active
             FROM classrooms
             WHERE active = 1
             ORDER BY sort_order, rowid",
        )?;
        let rows = stmt
            .query_map([], |r| {
                Ok((
                    r.get::<_, String>(0)?,
                    r.get::<_, i64>(1)?,
                    r.get::<_, i64>(2)?,
                    r.get::<_, i64>(3)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        rows.into_iter()
            .map(|(id, rows, columns, active)| {
                Ok(ClassroomDescriptor {
                    rows: u32::try_from(rows)
                        .with_context(|| format!("classroom {id} has invalid rows {rows}"))?,
                    columns: u32::try_from(columns)
                        .with_context(|| format!("classroom {id} has invalid columns {columns}"))?,
                    active: active != 0,
                    id,
                })
            })
            .collect()
    }
}

impl AllocationStore for SqliteWorkspace<'_> {
    fn state(&self, exam_id: &str) -> anyhow::Result<Option<AllocationState>> {
        let tag: Option<String> = self
            .conn
            .query_row(
                "SELECT allocation_state FROM exams WHERE id = ?",
                [exam_id],
                |r| r.get(0),
            )
            .optional()?;
        tag.map(|t| {
            AllocationState::parse(&t)
                .ok_or_else(|| anyhow!("exam {exam_id} has unknown allocation state {t:?}"))
        })
        .transpose()
    }

    fn load(&self, exam_id: &str) -> anyhow::Result<Option<ExamAllocation>> {
        let Some(state) = self.state(exam_id)? else {
            return Ok(None);
        };

        let mut hall_stmt = self.conn.prepare(
            "SELECT classroom_id, capacity
             FROM hall_allocations
             WHERE exam_id = ?
             ORDER BY hall_order",
        )?;
        let mut halls = hall_stmt
            .query_map([exam_id], |r| {
                Ok(HallAllocation {
                    classroom_id: r.get(0)?,
                    capacity: r.get::<_, i64>(1)? as u64,
                    assigned_seats: Vec::new(),
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;

        let mut seat_stmt = self.conn.prepare(
            "SELECT student_id, classroom_id, row_index, column_index, seat_label
             FROM seat_assignments
             WHERE exam_id = ?
             ORDER BY classroom_id, row_index, column_index",
        )?;
        let seats = seat_stmt
            .query_map([exam_id], |r| {
                Ok(SeatAssignment {
                    student_id: r.get(0)?,
                    hall_id: r.get(1)?,
                    row_index: r.get(2)?,
                    column_index: r.get(3)?,
                    seat_label: r.get(4)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;

        for seat in seats {
            let hall = halls
                .iter_mut()
                .find(|h| h.classroom_id == seat.hall_id)
                .ok_or_else(|| anyhow!("seat {} references unknown hall", seat.seat_label))?;
            hall.assigned_seats.push(seat);
        }

        Ok(Some(ExamAllocation { state, halls }))
    }

    fn save_plan(&self, exam_id: &str, halls: &[HallAllocation]) -> anyhow::Result<()> {
        let tx = self.conn.unchecked_transaction()?;

        tx.execute("DELETE FROM seat_assignments WHERE exam_id = ?", [exam_id])?;
        tx.execute("DELETE FROM hall_allocations WHERE exam_id = ?", [exam_id])?;

        {
            let mut hall_stmt = tx.prepare(
                "INSERT INTO hall_allocations(exam_id, classroom_id, hall_order, capacity)
                 VALUES(?, ?, ?, ?)",
            )?;
            let mut seat_stmt = tx.prepare(
                "INSERT INTO seat_assignments(
                   exam_id, student_id, classroom_id, row_index, column_index, seat_label
                 ) VALUES(?, ?, ?, ?, ?, ?)",
            )?;
            for (order, hall) in halls.iter().enumerate() {
                hall_stmt
                    .execute((exam_id, &hall.classroom_id, order as i64, hall.capacity as i64))
                    .context("failed to write hall allocation")?;
                for seat in &hall.assigned_seats {
                    seat_stmt
                        .execute((
                            exam_id,
                            &seat.student_id,
                            &seat.hall_id,
                            seat.row_index,
                            seat.column_index,
                            &seat.seat_label,
                        ))
                        .context("failed to write seat assignment")?;
                }
            }
        }

        let updated = tx.execute(
            "UPDATE exams
             SET allocation_state = 'allocated', allocated_at = ?, locked_at = NULL
             WHERE id = ? AND allocation_state != 'locked'",
            (now_rfc3339(), exam_id),
        )?;
        if updated != 1 {
            bail!("exam {exam_id} is missing or locked; plan not written");
        }

        tx.commit()?;
        Ok(())
    }

    fn mark_locked(&self, exam_id: &str) -> anyhow::Result<()> {
        let updated = self.conn.execute(
            "UPDATE exams
             SET allocation_state = 'locked', locked_at = ?
             WHERE id = ? AND allocation_state = 'allocated'",
            (now_rfc3339(), exam_id),
        )?;
        if updated != 1 {
            bail!("exam {exam_id} is not in the allocated state");
        }
        Ok(())
    }
}
