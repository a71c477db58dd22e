use crate::access::{self, Role};
use crate::cache::QueryKey;
use crate::calc::{self, StudentReport};
use crate::ipc::error::HandlerErr;
use crate::ipc::handlers::classes::require_class_visible;
use crate::ipc::helpers::{
    enrolled_students, get_optional_str, get_required_f64, get_required_str, is_enrolled,
    list_assignments, list_grades, load_assignment, load_class, now_rfc3339, parent_ids_of,
    teaches_student, with_ctx, AssignmentRow, ClassRow, GradeRow, UserRow,
};
use crate::ipc::types::{AppState, CachedReport, Ctx, Request};
use crate::optimistic::Optimistic;
use rusqlite::Connection;
use serde::Serialize;
use serde_json::json;
use uuid::Uuid;

/// Teacher-facing grade table for one class: roster, active assignments,
/// recorded grades and the per-student reports computed from them.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClassGradebook {
    pub class: ClassRow,
    pub students: Vec<UserRow>,
    pub assignments: Vec<AssignmentRow>,
    pub grades: Vec<GradeRow>,
    pub reports: Vec<StudentReport>,
}

impl ClassGradebook {
    pub fn load(conn: &Connection, class: ClassRow) -> Result<Self, HandlerErr> {
        let students = enrolled_students(conn, &class.id)?;
        let assignments = list_assignments(conn, &class.id, false)?;
        let grades: Vec<GradeRow> = list_grades(conn, Some(&class.id), None)?
            .into_iter()
            .filter(|g| assignments.iter().any(|a| a.id == g.assignment_id))
            .collect();
        let mut book = ClassGradebook {
            class,
            students,
            assignments,
            grades,
            reports: Vec::new(),
        };
        book.recompute_all();
        Ok(book)
    }

    fn calc_inputs(&self) -> (Vec<calc::Assignment>, Vec<calc::Grade>) {
        (
            self.assignments.iter().map(AssignmentRow::to_calc).collect(),
            self.grades.iter().map(GradeRow::to_calc).collect(),
        )
    }

    fn recompute_all(&mut self) {
        let (assignments, grades) = self.calc_inputs();
        self.reports = self
            .students
            .iter()
            .map(|s| calc::student_report(&s.id, &assignments, &grades))
            .collect();
    }

    fn recompute_student(&mut self, student_id: &str) {
        let (assignments, grades) = self.calc_inputs();
        let report = calc::student_report(student_id, &assignments, &grades);
        match self.reports.iter_mut().find(|r| r.student_id == student_id) {
            Some(existing) => *existing = report,
            None => self.reports.push(report),
        }
    }

    /// Upserts by (student, assignment), keeping an existing row id.
    pub fn apply_grade(&mut self, grade: GradeRow) {
        let student_id = grade.student_id.clone();
        match self
            .grades
            .iter_mut()
            .find(|g| g.student_id == grade.student_id && g.assignment_id == grade.assignment_id)
        {
            Some(existing) => {
                existing.points = grade.points;
                existing.total_points = grade.total_points;
                existing.percentage = grade.percentage;
                existing.updated_at = grade.updated_at;
            }
            None => self.grades.push(grade),
        }
        self.recompute_student(&student_id);
    }
}

fn write_grade(conn: &Connection, grade: &GradeRow) -> Result<GradeRow, HandlerErr> {
    conn.execute(
        "INSERT INTO grades(id, student_id, assignment_id, class_id, points, total_points, percentage, updated_at)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?)
         ON CONFLICT(student_id, assignment_id) DO UPDATE SET
           class_id = excluded.class_id,
           points = excluded.points,
           total_points = excluded.total_points,
           percentage = excluded.percentage,
           updated_at = excluded.updated_at",
        (
            &grade.id,
            &grade.student_id,
            &grade.assignment_id,
            &grade.class_id,
            grade.points,
            grade.total_points,
            grade.percentage,
            &grade.updated_at,
        ),
    )
    .map_err(|e| HandlerErr::db("db_update_failed", e).with_details(json!({ "table": "grades" })))?;

    list_grades(conn, Some(&grade.class_id), Some(&grade.student_id))?
        .into_iter()
        .find(|g| g.assignment_id == grade.assignment_id)
        .ok_or_else(|| HandlerErr::new("db_update_failed", "grade missing after upsert"))
}

fn grades_upsert(ctx: &mut Ctx<'_>, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let p = access::require_session(ctx.session)?;
    let class_id = get_required_str(params, "classId")?;
    let student_id = get_required_str(params, "studentId")?;
    let assignment_id = get_required_str(params, "assignmentId")?;
    let points = get_required_f64(params, "points")?;

    let class = load_class(ctx.conn, &class_id)?;
    access::can_write_class(p, &class.teacher_id)?;
    if !is_enrolled(ctx.conn, &class_id, &student_id)? {
        return Err(HandlerErr::not_found("student in class"));
    }
    let assignment = load_assignment(ctx.conn, &assignment_id)?;
    if assignment.class_id != class_id {
        return Err(HandlerErr::bad_params("assignment belongs to another class"));
    }
    if !assignment.is_active() {
        return Err(HandlerErr::new("conflict", "assignment is archived"));
    }
    // Scores above the total are accepted (extra credit); negatives are not.
    if points < 0.0 {
        return Err(HandlerErr::bad_params("points must be >= 0"));
    }
    let percentage = calc::grade_percentage(points, Some(assignment.total_points))?;

    let pending = GradeRow {
        id: Uuid::new_v4().to_string(),
        student_id: student_id.clone(),
        assignment_id: assignment_id.clone(),
        class_id: class_id.clone(),
        points,
        total_points: assignment.total_points,
        percentage,
        updated_at: now_rfc3339(),
    };

    let conn = ctx.conn;
    let key = QueryKey::ClassReport(class_id.clone());
    let stored = match ctx.cache.remove(&key) {
        Some(CachedReport::Class(book)) => {
            let mut tentative = Optimistic::new(book);
            let result = tentative.run(
                |b| b.apply_grade(pending.clone()),
                |_| write_grade(conn, &pending),
            );
            if result.is_err() {
                tracing::warn!(class_id = %class_id, "grade write failed; cached gradebook reverted");
            }
            ctx.cache.insert(key, CachedReport::Class(tentative.into_inner()));
            result?
        }
        Some(other) => {
            ctx.cache.insert(key, other);
            write_grade(conn, &pending)?
        }
        None => write_grade(conn, &pending)?,
    };
    ctx.cache.invalidate_where(|k| k.class_id() == class_id && k.student_id() == Some(student_id.as_str()));

    let assignments: Vec<calc::Assignment> = list_assignments(conn, &class_id, false)?
        .iter()
        .map(AssignmentRow::to_calc)
        .collect();
    let grades: Vec<calc::Grade> = list_grades(conn, Some(&class_id), Some(&student_id))?
        .iter()
        .map(GradeRow::to_calc)
        .collect();
    let report = calc::student_report(&student_id, &assignments, &grades);

    tracing::info!(
        class_id = %class_id,
        student_id = %student_id,
        assignment_id = %assignment_id,
        points,
        percentage,
        "grade recorded"
    );
    Ok(json!({ "grade": stored, "report": report }))
}

fn grades_list(ctx: &mut Ctx<'_>, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let p = access::require_session(ctx.session)?;
    let class_id = get_required_str(params, "classId")?;
    let class = load_class(ctx.conn, &class_id)?;
    require_class_visible(ctx.conn, p, &class)?;

    let requested = get_optional_str(params, "studentId")?;
    let student_filter = match p.role {
        Role::Admin | Role::Teacher => requested,
        Role::Student => Some(requested.unwrap_or_else(|| p.user_id.clone())),
        Role::Parent => Some(
            requested.ok_or_else(|| HandlerErr::bad_params("missing studentId"))?,
        ),
    };
    if let Some(sid) = &student_filter {
        let parents = parent_ids_of(ctx.conn, sid)?;
        let teaches = p.role == Role::Teacher && teaches_student(ctx.conn, &p.user_id, sid)?;
        access::can_read_student(p, sid, &parents, teaches)?;
    }

    let grades = list_grades(ctx.conn, Some(&class_id), student_filter.as_deref())?;
    Ok(json!({ "grades": grades }))
}

fn grades_report(ctx: &mut Ctx<'_>, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let p = access::require_session(ctx.session)?;
    let class_id = get_required_str(params, "classId")?;
    let class = load_class(ctx.conn, &class_id)?;
    access::can_read_class_records(p, &class.teacher_id)?;

    let key = QueryKey::ClassReport(class_id);
    let (book, cached) = match ctx.cache.get(&key) {
        Some(CachedReport::Class(book)) => (book.clone(), true),
        _ => {
            let book = ClassGradebook::load(ctx.conn, class)?;
            ctx.cache.insert(key, CachedReport::Class(book.clone()));
            (book, false)
        }
    };

    let mut out = serde_json::to_value(&book)
        .map_err(|e| HandlerErr::new("internal", e.to_string()))?;
    out["cached"] = json!(cached);
    Ok(out)
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "grades.list" => Some(with_ctx(state, req, grades_list)),
        "grades.upsert" => Some(with_ctx(state, req, grades_upsert)),
        "grades.report" => Some(with_ctx(state, req, grades_report)),
        _ => None,
    }
}
