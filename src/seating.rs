use serde::Serialize;
use thiserror::Error;

/// Seat labels use one letter per row, so a hall can have at most `A..=Z`.
pub const MAX_ROWS: u32 = 26;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClassroomDescriptor {
    pub id: String,
    pub rows: u32,
    pub columns: u32,
    pub active: bool,
}

impl ClassroomDescriptor {
    pub fn total_capacity(&self) -> u64 {
        u64::from(self.rows) * u64::from(self.columns)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SeatAssignment {
    pub student_id: String,
    pub hall_id: String,
    /// 1-based.
    pub row_index: u32,
    /// 1-based.
    pub column_index: u32,
    pub seat_label: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HallAllocation {
    pub classroom_id: String,
    pub assigned_seats: Vec<SeatAssignment>,
    pub capacity: u64,
}

impl HallAllocation {
    pub fn occupied(&self) -> usize {
        self.assigned_seats.len()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SeatingError {
    #[error("{count} eligible student(s) could not be seated")]
    CapacityShortfall { count: usize },
    #[error("classroom {classroom_id} has {rows} rows; seat labels support at most {max}", max = MAX_ROWS)]
    UnsupportedLayout { classroom_id: String, rows: u32 },
}

/// `row 1 = A`, so (2, 3) is `B3`. Callers must have checked `row_index <= MAX_ROWS`.
pub fn seat_label(row_index: u32, column_index: u32) -> String {
    debug_assert!((1..=MAX_ROWS).contains(&row_index));
    let letter = char::from(b'A' + (row_index - 1) as u8);
    format!("{letter}{column_index}")
}

/// Seats `students` in order across `classrooms`, largest hall first.
///
/// Halls are filled row-major (row 1 left to right, then row 2, ...). Equal
/// capacities keep the order they were given in. Halls that end up empty are
/// not part of the plan. Either every student gets exactly one seat or the
/// whole attempt fails; a partial plan is never returned.
pub fn allocate_seats(
    students: &[String],
    classrooms: &[ClassroomDescriptor],
) -> Result<Vec<HallAllocation>, SeatingError> {
    let mut halls: Vec<&ClassroomDescriptor> = classrooms.iter().filter(|c| c.active).collect();

    if let Some(hall) = halls.iter().find(|c| c.rows > MAX_ROWS) {
        return Err(SeatingError::UnsupportedLayout {
            classroom_id: hall.id.clone(),
            rows: hall.rows,
        });
    }

    // sort_by is stable: ties stay in catalog order.
    halls.sort_by(|a, b| b.total_capacity().cmp(&a.total_capacity()));

    let mut remaining = students.iter().peekable();
    let mut plan: Vec<HallAllocation> = Vec::new();

    for hall in halls {
        if remaining.peek().is_none() {
            break;
        }

        let mut seats: Vec<SeatAssignment> = Vec::new();
        'rows: for row_index in 1..=hall.rows {
            for column_index in 1..=hall.columns {
                let Some(student_id) = remaining.next() else {
                    break 'rows;
                };
                seats.push(SeatAssignment {
                    student_id: student_id.clone(),
                    hall_id: hall.id.clone(),
                    row_index,
                    column_index,
                    seat_label: seat_label(row_index, column_index),
                });
            }
        }

        if !seats.is_empty() {
            plan.push(HallAllocation {
                classroom_id: hall.id.clone(),
                assigned_seats: seats,
                capacity: hall.total_capacity(),
            });
        }
    }

    let unseated = remaining.count();
    if unseated > 0 {
        return Err(SeatingError::CapacityShortfall { count: unseated });
    }

    Ok(plan)
}
