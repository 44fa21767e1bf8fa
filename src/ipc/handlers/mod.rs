pub mod allocation;
pub mod classrooms;
pub mod core;
pub mod exams;
pub mod students;
