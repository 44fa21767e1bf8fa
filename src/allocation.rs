use dashmap::DashMap;
use serde_json::json;
use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::seating::{self, ClassroomDescriptor, HallAllocation, SeatingError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocationState {
    Unallocated,
    Allocated,
    Locked,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Allocate,
    Lock,
}

impl AllocationState {
    pub fn as_str(self) -> &'static str {
        match self {
            AllocationState::Unallocated => "unallocated",
            AllocationState::Allocated => "allocated",
            AllocationState::Locked => "locked",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "unallocated" => Some(AllocationState::Unallocated),
            "allocated" => Some(AllocationState::Allocated),
            "locked" => Some(AllocationState::Locked),
            _ => None,
        }
    }

    /// The whole transition table. Anything not listed as `Ok` is rejected.
    pub fn apply(self, transition: Transition) -> Result<AllocationState, AllocationError> {
        use AllocationState::*;
        match (self, transition) {
            (Unallocated, Transition::Allocate) | (Allocated, Transition::Allocate) => {
                Ok(Allocated)
            }
            (Locked, Transition::Allocate) => Err(AllocationError::AlreadyLocked),
            (Unallocated, Transition::Lock) => Err(AllocationError::NotYetAllocated),
            (Allocated, Transition::Lock) | (Locked, Transition::Lock) => Ok(Locked),
        }
    }
}

#[derive(Debug, Error)]
pub enum AllocationError {
    #[error("exam not found: {0}")]
    ExamNotFound(String),
    #[error("seat allocation is locked and can no longer change")]
    AlreadyLocked,
    #[error("exam has no seat allocation to lock yet")]
    NotYetAllocated,
    #[error("no eligible students for this exam")]
    NoEligibleStudents,
    #[error("no active classrooms available")]
    NoClassroomsAvailable,
    #[error("{count} eligible student(s) exceed the available seat capacity")]
    CapacityShortfall { count: usize },
    #[error("classroom {classroom_id} has {rows} rows; at most {max} are supported", max = seating::MAX_ROWS)]
    UnsupportedLayout { classroom_id: String, rows: u32 },
    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

impl From<SeatingError> for AllocationError {
    fn from(e: SeatingError) -> Self {
        match e {
            SeatingError::CapacityShortfall { count } => AllocationError::CapacityShortfall { count },
            SeatingError::UnsupportedLayout { classroom_id, rows } => {
                AllocationError::UnsupportedLayout { classroom_id, rows }
            }
        }
    }
}

impl AllocationError {
    /// Stable wire code for the IPC error envelope.
    pub fn code(&self) -> &'static str {
        match self {
            AllocationError::ExamNotFound(_) => "not_found",
            AllocationError::AlreadyLocked => "already_locked",
            AllocationError::NotYetAllocated => "not_yet_allocated",
            AllocationError::NoEligibleStudents => "no_eligible_students",
            AllocationError::NoClassroomsAvailable => "no_classrooms_available",
            AllocationError::CapacityShortfall { .. } => "capacity_shortfall",
            AllocationError::UnsupportedLayout { .. } => "unsupported_layout",
            AllocationError::Storage(_) => "storage_failed",
        }
    }

    pub fn details(&self) -> Option<serde_json::Value> {
        match self {
            AllocationError::ExamNotFound(exam_id) => Some(json!({ "examId": exam_id })),
            AllocationError::CapacityShortfall { count } => Some(json!({ "shortfall": count })),
            AllocationError::UnsupportedLayout { classroom_id, rows } => Some(json!({
                "classroomId": classroom_id,
                "rows": rows,
                "maxRows": seating::MAX_ROWS,
            })),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExamAllocation {
    pub state: AllocationState,
    pub halls: Vec<HallAllocation>,
}

/// Students cleared to sit an exam, in seating order. The order must be stable
/// across calls for the same data.
pub trait EligibilityProvider {
    fn eligible_students(&self, exam_id: &str) -> anyhow::Result<Vec<String>>;
}

/// Active classrooms in catalog order. Need not be sorted by capacity.
pub trait ClassroomCatalog {
    fn active_classrooms(&self) -> anyhow::Result<Vec<ClassroomDescriptor>>;
}

pub trait AllocationStore {
    /// `None` when the exam does not exist.
    fn state(&self, exam_id: &str) -> anyhow::Result<Option<AllocationState>>;
    fn load(&self, exam_id: &str) -> anyhow::Result<Option<ExamAllocation>>;
    /// Replaces the plan and sets the state to `Allocated`, all or nothing.
    fn save_plan(&self, exam_id: &str, halls: &[HallAllocation]) -> anyhow::Result<()>;
    /// Writes only the state tag.
    fn mark_locked(&self, exam_id: &str) -> anyhow::Result<()>;
}

/// One exclusive section per exam id. Different exams never contend.
#[derive(Debug, Default)]
pub struct ExamLocks {
    sections: DashMap<String, Arc<Mutex<()>>>,
}

impl ExamLocks {
    pub fn run_exclusive<T>(&self, exam_id: &str, f: impl FnOnce() -> T) -> T {
        // Clone the Arc out so the map shard is released before blocking.
        let section = self
            .sections
            .entry(exam_id.to_string())
            .or_default()
            .clone();
        let _guard = section.lock().unwrap_or_else(PoisonError::into_inner);
        f()
    }
}

pub struct ExamAllocations<'a, E: ?Sized, C: ?Sized, S: ?Sized> {
    eligibility: &'a E,
    catalog: &'a C,
    store: &'a S,
    locks: &'a ExamLocks,
}

impl<'a, E, C, S> ExamAllocations<'a, E, C, S>
where
    E: EligibilityProvider + ?Sized,
    C: ClassroomCatalog + ?Sized,
    S: AllocationStore + ?Sized,
{
    pub fn new(eligibility: &'a E, catalog: &'a C, store: &'a S, locks: &'a ExamLocks) -> Self {
        Self {
            eligibility,
            catalog,
            store,
            locks,
        }
    }

    pub fn allocate(&self, exam_id: &str) -> Result<Vec<HallAllocation>, AllocationError> {
        self.current_state(exam_id)?.apply(Transition::Allocate)?;

        // Collaborator lookups may block; keep them outside the exam's section.
        let roster = self.eligibility.eligible_students(exam_id)?;
        let fetched = roster.len();
        let mut seen = HashSet::new();
        let students: Vec<String> = roster
            .into_iter()
            .filter(|id| seen.insert(id.clone()))
            .collect();
        if students.len() != fetched {
            warn!(
                exam_id,
                duplicates = fetched - students.len(),
                "eligibility roster repeated students; keeping first occurrence"
            );
        }
        if students.is_empty() {
            return Err(AllocationError::NoEligibleStudents);
        }

        let mut classrooms = self.catalog.active_classrooms()?;
        classrooms.retain(|c| c.active);
        if classrooms.is_empty() {
            return Err(AllocationError::NoClassroomsAvailable);
        }

        self.locks.run_exclusive(exam_id, || -> Result<_, AllocationError> {
            // The exam may have been locked while the roster was fetched.
            let next = self.current_state(exam_id)?.apply(Transition::Allocate)?;

            let plan = seating::allocate_seats(&students, &classrooms).map_err(|e| {
                warn!(exam_id, error = %e, "seat allocation rejected");
                AllocationError::from(e)
            })?;

            self.store.save_plan(exam_id, &plan)?;
            info!(
                exam_id,
                students = students.len(),
                halls = plan.len(),
                state = next.as_str(),
                "seat allocation committed"
            );
            Ok(plan)
        })
    }

    pub fn lock(&self, exam_id: &str) -> Result<AllocationState, AllocationError> {
        self.locks.run_exclusive(exam_id, || -> Result<_, AllocationError> {
            let current = self.current_state(exam_id)?;
            let next = current.apply(Transition::Lock)?;
            if current == AllocationState::Locked {
                debug!(exam_id, "exam already locked");
                return Ok(next);
            }
            self.store.mark_locked(exam_id)?;
            info!(exam_id, "seat allocation locked");
            Ok(next)
        })
    }

    /// Reads need no exclusive section: plan writes are atomic in the store.
    pub fn plan(&self, exam_id: &str) -> Result<ExamAllocation, AllocationError> {
        self.store
            .load(exam_id)?
            .ok_or_else(|| AllocationError::ExamNotFound(exam_id.to_string()))
    }

    fn current_state(&self, exam_id: &str) -> Result<AllocationState, AllocationError> {
        self.store
            .state(exam_id)?
            .ok_or_else(|| AllocationError::ExamNotFound(exam_id.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct Roster(Mutex<HashMap<String, Vec<String>>>);

    impl Roster {
        fn with(exam_id: &str, n: usize) -> Self {
            let students = (1..=n).map(|i| format!("S{i}")).collect();
            Self(Mutex::new(HashMap::from([(exam_id.to_string(), students)])))
        }

        fn set(&self, exam_id: &str, students: Vec<String>) {
            self.0.lock().unwrap().insert(exam_id.to_string(), students);
        }
    }

    impl EligibilityProvider for Roster {
        fn eligible_students(&self, exam_id: &str) -> anyhow::Result<Vec<String>> {
            Ok(self.0.lock().unwrap().get(exam_id).cloned().unwrap_or_default())
        }
    }

    struct Catalog(Mutex<Vec<ClassroomDescriptor>>);

    impl Catalog {
        fn of(rooms: &[(&str, u32, u32)]) -> Self {
            Self(Mutex::new(
                rooms
                    .iter()
                    .map(|(id, rows, columns)| ClassroomDescriptor {
                        id: id.to_string(),
                        rows: *rows,
                        columns: *columns,
                        active: true,
                    })
                    .collect(),
            ))
        }

        fn replace(&self, other: Catalog) {
            *self.0.lock().unwrap() = other.0.into_inner().unwrap();
        }
    }

    impl ClassroomCatalog for Catalog {
        fn active_classrooms(&self) -> anyhow::Result<Vec<ClassroomDescriptor>> {
            Ok(self.0.lock().unwrap().clone())
        }
    }

    #[derive(Default)]
    struct MemoryStore {
        exams: Mutex<HashMap<String, ExamAllocation>>,
        writers: AtomicUsize,
        max_writers: AtomicUsize,
        write_delay: Option<Duration>,
    }

    impl MemoryStore {
        fn with_exam(exam_id: &str) -> Self {
            let store = Self::default();
            store.exams.lock().unwrap().insert(
                exam_id.to_string(),
                ExamAllocation {
                    state: AllocationState::Unallocated,
                    halls: Vec::new(),
                },
            );
            store
        }
    }

    impl AllocationStore for MemoryStore {
        fn state(&self, exam_id: &str) -> anyhow::Result<Option<AllocationState>> {
            Ok(self.exams.lock().unwrap().get(exam_id).map(|e| e.state))
        }

        fn load(&self, exam_id: &str) -> anyhow::Result<Option<ExamAllocation>> {
            Ok(self.exams.lock().unwrap().get(exam_id).cloned())
        }

        fn save_plan(&self, exam_id: &str, halls: &[HallAllocation]) -> anyhow::Result<()> {
            let writers = self.writers.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_writers.fetch_max(writers, Ordering::SeqCst);
            if let Some(delay) = self.write_delay {
                std::thread::sleep(delay);
            }
            self.exams.lock().unwrap().insert(
                exam_id.to_string(),
                ExamAllocation {
                    state: AllocationState::Allocated,
                    halls: halls.to_vec(),
                },
            );
            self.writers.fetch_sub(1, Ordering::SeqCst);
            Ok(())
        }

        fn mark_locked(&self, exam_id: &str) -> anyhow::Result<()> {
            let mut exams = self.exams.lock().unwrap();
            let exam = exams
                .get_mut(exam_id)
                .ok_or_else(|| anyhow::anyhow!("missing exam {exam_id}"))?;
            exam.state = AllocationState::Locked;
            Ok(())
        }
    }

    fn seat_labels(plan: &[HallAllocation]) -> Vec<(String, String, String)> {
        plan.iter()
            .flat_map(|h| h.assigned_seats.iter())
            .map(|s| (s.student_id.clone(), s.hall_id.clone(), s.seat_label.clone()))
            .collect()
    }

    #[test]
    fn transition_table_matches_lifecycle() {
        use AllocationState::*;
        assert_eq!(Unallocated.apply(Transition::Allocate).unwrap(), Allocated);
        assert_eq!(Allocated.apply(Transition::Allocate).unwrap(), Allocated);
        assert_eq!(Allocated.apply(Transition::Lock).unwrap(), Locked);
        assert_eq!(Locked.apply(Transition::Lock).unwrap(), Locked);
        assert!(matches!(
            Locked.apply(Transition::Allocate),
            Err(AllocationError::AlreadyLocked)
        ));
        assert!(matches!(
            Unallocated.apply(Transition::Lock),
            Err(AllocationError::NotYetAllocated)
        ));
    }

    #[test]
    fn state_tags_roundtrip_through_text() {
        for s in [
            AllocationState::Unallocated,
            AllocationState::Allocated,
            AllocationState::Locked,
        ] {
            assert_eq!(AllocationState::parse(s.as_str()), Some(s));
        }
        assert_eq!(AllocationState::parse("LOCKED"), None);
    }

    #[test]
    fn allocate_persists_plan_and_marks_allocated() {
        let roster = Roster::with("E1", 5);
        let catalog = Catalog::of(&[("H1", 2, 3)]);
        let store = MemoryStore::with_exam("E1");
        let locks = ExamLocks::default();
        let engine = ExamAllocations::new(&roster, &catalog, &store, &locks);

        let plan = engine.allocate("E1").expect("allocate");
        assert_eq!(plan[0].occupied(), 5);
        assert_eq!(plan[0].capacity, 6);

        let saved = engine.plan("E1").expect("plan");
        assert_eq!(saved.state, AllocationState::Allocated);
        assert_eq!(saved.halls, plan);
    }

    #[test]
    fn rerun_while_allocated_replaces_plan() {
        let roster = Roster::with("E1", 3);
        let catalog = Catalog::of(&[("H1", 2, 2)]);
        let store = MemoryStore::with_exam("E1");
        let locks = ExamLocks::default();
        let engine = ExamAllocations::new(&roster, &catalog, &store, &locks);

        engine.allocate("E1").expect("first");
        catalog.replace(Catalog::of(&[("H1", 2, 2), ("H2", 3, 3)]));
        let second = engine.allocate("E1").expect("second");

        assert_eq!(second[0].classroom_id, "H2");
        assert_eq!(store.load("E1").unwrap().unwrap().halls, second);
    }

    #[test]
    fn shortfall_keeps_previous_plan() {
        let roster = Roster::with("E1", 4);
        let catalog = Catalog::of(&[("H1", 2, 2)]);
        let store = MemoryStore::with_exam("E1");
        let locks = ExamLocks::default();
        let engine = ExamAllocations::new(&roster, &catalog, &store, &locks);

        let first = engine.allocate("E1").expect("first");
        roster.set("E1", (1..=5).map(|i| format!("S{i}")).collect());

        let err = engine.allocate("E1").expect_err("shortfall");
        assert!(matches!(err, AllocationError::CapacityShortfall { count: 1 }));
        assert_eq!(err.code(), "capacity_shortfall");
        assert_eq!(err.details(), Some(json!({ "shortfall": 1 })));

        let saved = engine.plan("E1").expect("plan");
        assert_eq!(saved.state, AllocationState::Allocated);
        assert_eq!(saved.halls, first);
    }

    #[test]
    fn shortfall_on_first_run_persists_nothing() {
        let roster = Roster::with("E1", 5);
        let catalog = Catalog::of(&[("H1", 2, 2)]);
        let store = MemoryStore::with_exam("E1");
        let locks = ExamLocks::default();
        let engine = ExamAllocations::new(&roster, &catalog, &store, &locks);

        let err = engine.allocate("E1").expect_err("shortfall");
        assert!(matches!(err, AllocationError::CapacityShortfall { count: 1 }));
        let saved = engine.plan("E1").expect("plan");
        assert_eq!(saved.state, AllocationState::Unallocated);
        assert!(saved.halls.is_empty());
    }

    #[test]
    fn empty_inputs_are_reported() {
        let store = MemoryStore::with_exam("E1");
        let locks = ExamLocks::default();

        let nobody = Roster::with("E1", 0);
        let catalog = Catalog::of(&[("H1", 2, 2)]);
        let err = ExamAllocations::new(&nobody, &catalog, &store, &locks)
            .allocate("E1")
            .expect_err("no students");
        assert!(matches!(err, AllocationError::NoEligibleStudents));

        let roster = Roster::with("E1", 3);
        let empty = Catalog::of(&[]);
        let err = ExamAllocations::new(&roster, &empty, &store, &locks)
            .allocate("E1")
            .expect_err("no rooms");
        assert!(matches!(err, AllocationError::NoClassroomsAvailable));
        assert_eq!(store.state("E1").unwrap(), Some(AllocationState::Unallocated));
    }

    #[test]
    fn duplicate_roster_entries_are_seated_once() {
        let roster = Roster::with("E1", 0);
        roster.set("E1", vec!["S1".into(), "S2".into(), "S1".into()]);
        let catalog = Catalog::of(&[("H1", 1, 3)]);
        let store = MemoryStore::with_exam("E1");
        let locks = ExamLocks::default();

        let plan = ExamAllocations::new(&roster, &catalog, &store, &locks)
            .allocate("E1")
            .expect("allocate");
        assert_eq!(plan[0].occupied(), 2);
    }

    #[test]
    fn lock_requires_allocation_and_is_idempotent() {
        let roster = Roster::with("E1", 2);
        let catalog = Catalog::of(&[("H1", 1, 2)]);
        let store = MemoryStore::with_exam("E1");
        let locks = ExamLocks::default();
        let engine = ExamAllocations::new(&roster, &catalog, &store, &locks);

        let err = engine.lock("E1").expect_err("not allocated");
        assert!(matches!(err, AllocationError::NotYetAllocated));
        assert_eq!(err.code(), "not_yet_allocated");

        let plan = engine.allocate("E1").expect("allocate");
        assert_eq!(engine.lock("E1").expect("lock"), AllocationState::Locked);
        assert_eq!(engine.lock("E1").expect("lock again"), AllocationState::Locked);

        let err = engine.allocate("E1").expect_err("locked");
        assert!(matches!(err, AllocationError::AlreadyLocked));
        let saved = engine.plan("E1").expect("plan");
        assert_eq!(saved.state, AllocationState::Locked);
        assert_eq!(saved.halls, plan);
    }

    #[test]
    fn unknown_exam_is_not_found() {
        let roster = Roster::with("E1", 1);
        let catalog = Catalog::of(&[("H1", 1, 1)]);
        let store = MemoryStore::with_exam("E1");
        let locks = ExamLocks::default();
        let engine = ExamAllocations::new(&roster, &catalog, &store, &locks);

        assert!(matches!(
            engine.allocate("nope"),
            Err(AllocationError::ExamNotFound(_))
        ));
        assert!(matches!(engine.lock("nope"), Err(AllocationError::ExamNotFound(_))));
    }

    #[test]
    fn unsupported_layout_is_surfaced_with_details() {
        let roster = Roster::with("E1", 1);
        let catalog = Catalog::of(&[("tall", 30, 2)]);
        let store = MemoryStore::with_exam("E1");
        let locks = ExamLocks::default();

        let err = ExamAllocations::new(&roster, &catalog, &store, &locks)
            .allocate("E1")
            .expect_err("unsupported");
        assert_eq!(err.code(), "unsupported_layout");
        assert_eq!(
            err.details(),
            Some(json!({ "classroomId": "tall", "rows": 30, "maxRows": 26 }))
        );
    }

    #[test]
    fn concurrent_allocations_for_one_exam_never_overlap() {
        let roster = Roster::with("E1", 30);
        let catalog = Catalog::of(&[("H1", 4, 5), ("H2", 3, 5)]);
        let store = MemoryStore {
            write_delay: Some(Duration::from_millis(5)),
            ..MemoryStore::with_exam("E1")
        };
        let locks = ExamLocks::default();
        let engine = ExamAllocations::new(&roster, &catalog, &store, &locks);

        let engine = &engine;
        let plans: Vec<Vec<HallAllocation>> = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..8)
                .map(|_| scope.spawn(move || engine.allocate("E1").expect("allocate")))
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        assert_eq!(store.max_writers.load(Ordering::SeqCst), 1);
        for plan in &plans {
            assert_eq!(seat_labels(plan), seat_labels(&plans[0]));
        }
        assert_eq!(engine.plan("E1").unwrap().halls, plans[0]);
    }

    #[test]
    fn racing_lock_and_allocate_leave_consistent_state() {
        let roster = Roster::with("E1", 6);
        let catalog = Catalog::of(&[("H1", 2, 3)]);
        let store = MemoryStore {
            write_delay: Some(Duration::from_millis(2)),
            ..MemoryStore::with_exam("E1")
        };
        let locks = ExamLocks::default();
        let engine = ExamAllocations::new(&roster, &catalog, &store, &locks);
        engine.allocate("E1").expect("seed allocation");

        std::thread::scope(|scope| {
            for i in 0..6 {
                let engine = &engine;
                scope.spawn(move || {
                    if i % 2 == 0 {
                        let _ = engine.allocate("E1");
                    } else {
                        engine.lock("E1").expect("lock");
                    }
                });
            }
        });

        let saved = engine.plan("E1").expect("plan");
        assert_eq!(saved.state, AllocationState::Locked);
        assert_eq!(saved.halls[0].occupied(), 6);
        assert!(matches!(
            engine.allocate("E1"),
            Err(AllocationError::AlreadyLocked)
        ));
    }
}
