#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SeatRow {
    pub hall_order: usize,
    pub classroom_id: String,
    pub classroom_name: String,
    pub seat_label: String,
    pub row_index: u32,
    pub column_index: u32,
    pub student_id: String,
    pub registration_no: String,
    pub student_name: String,
}

fn csv_quote(s: &str) -> String {
    if s.contains(',') || s.contains('"') || s.contains('\n') || s.contains('\r') {
        format!("\"{}\"", s.replace('"', "\"\""))
    } else {
        s.to_string()
    }
}

/// One line per seated student, in plan order.
pub fn seating_plan_csv(rows: &[SeatRow]) -> String {
    let mut csv = String::from(
        "hall_order,classroom_id,classroom_name,seat_label,row_index,column_index,student_id,registration_no,student_name\n",
    );
    for r in rows {
        csv.push_str(&format!(
            "{},{},{},{},{},{},{},{},{}\n",
            r.hall_order,
            csv_quote(&r.classroom_id),
            csv_quote(&r.classroom_name),
            csv_quote(&r.seat_label),
            r.row_index,
            r.column_index,
            csv_quote(&r.student_id),
            csv_quote(&r.registration_no),
            csv_quote(&r.student_name),
        ));
    }
    csv
}
