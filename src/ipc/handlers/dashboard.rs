use crate::access::{self, Principal, Role};
use crate::cache::QueryKey;
use crate::calc::{self, AttendanceSummary, StudentReport};
use crate::ipc::error::HandlerErr;
use crate::ipc::helpers::{
    attendance_window_start, children_of, day_key, enrolled_students, get_optional_str,
    get_required_str, is_enrolled, list_assignments, list_attendance, list_classes, list_grades,
    load_class, load_user_with_role, parent_ids_of, with_ctx, AssignmentRow, AttendanceQuery,
    AttendanceRow, ClassRow, ClassScope, GradeRow,
};
use crate::ipc::types::{AppState, CachedReport, Ctx, Request};
use chrono::NaiveDate;
use rusqlite::Connection;
use serde::Serialize;
use serde_json::json;
use std::collections::{BTreeMap, BTreeSet};

/// One student's view of one class. Attendance covers the whole history.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StudentClassView {
    pub class: ClassRow,
    pub assignments: Vec<AssignmentRow>,
    pub grades: Vec<GradeRow>,
    pub report: StudentReport,
    pub attendance: AttendanceSummary,
    pub attendance_records: Vec<AttendanceRow>,
}

impl StudentClassView {
    pub fn load(conn: &Connection, class: ClassRow, student_id: &str) -> Result<Self, HandlerErr> {
        let assignments = list_assignments(conn, &class.id, false)?;
        let grades: Vec<GradeRow> = list_grades(conn, Some(&class.id), Some(student_id))?
            .into_iter()
            .filter(|g| assignments.iter().any(|a| a.id == g.assignment_id))
            .collect();
        let attendance_records = list_attendance(
            conn,
            AttendanceQuery {
                class_id: Some(&class.id),
                student_id: Some(student_id),
                ..Default::default()
            },
        )?;

        let calc_assignments: Vec<calc::Assignment> = assignments.iter().map(AssignmentRow::to_calc).collect();
        let calc_grades: Vec<calc::Grade> = grades.iter().map(GradeRow::to_calc).collect();
        let calc_records: Vec<calc::AttendanceRecord> =
            attendance_records.iter().map(AttendanceRow::to_calc).collect();

        Ok(StudentClassView {
            report: calc::student_report(student_id, &calc_assignments, &calc_grades),
            attendance: calc::attendance_breakdown(&calc_records),
            class,
            assignments,
            grades,
            attendance_records,
        })
    }
}

fn cached_student_view(
    ctx: &mut Ctx<'_>,
    class: ClassRow,
    student_id: &str,
) -> Result<serde_json::Value, HandlerErr> {
    let key = QueryKey::StudentReport {
        class_id: class.id.clone(),
        student_id: student_id.to_string(),
    };
    let (view, cached) = match ctx.cache.get(&key) {
        Some(CachedReport::Student(view)) => (view.clone(), true),
        _ => {
            let view = StudentClassView::load(ctx.conn, class, student_id)?;
            ctx.cache.insert(key, CachedReport::Student(view.clone()));
            (view, false)
        }
    };
    let mut out = serde_json::to_value(&view).map_err(|e| HandlerErr::new("internal", e.to_string()))?;
    out["cached"] = json!(cached);
    Ok(out)
}

fn final_grade_in(conn: &Connection, class_id: &str, student_id: &str) -> Result<i64, HandlerErr> {
    let assignments: Vec<calc::Assignment> = list_assignments(conn, class_id, false)?
        .iter()
        .map(AssignmentRow::to_calc)
        .collect();
    let grades: Vec<calc::Grade> = list_grades(conn, Some(class_id), Some(student_id))?
        .iter()
        .map(GradeRow::to_calc)
        .collect();
    Ok(calc::final_grade(student_id, &assignments, &grades))
}

fn windowed_records(
    conn: &Connection,
    class_id: Option<&str>,
    student_id: Option<&str>,
    from: NaiveDate,
) -> Result<Vec<calc::AttendanceRecord>, HandlerErr> {
    Ok(list_attendance(
        conn,
        AttendanceQuery {
            class_id,
            student_id,
            from: Some(from),
            to: None,
        },
    )?
    .iter()
    .map(AttendanceRow::to_calc)
    .collect())
}

fn dashboard_admin(ctx: &mut Ctx<'_>, _params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    access::require_role(ctx.session, Role::Admin)?;
    let mut breakdown: BTreeMap<&'static str, i64> = Role::ALL.iter().map(|r| (r.as_str(), 0)).collect();
    let rows: Vec<(String, i64)> = {
        let mut stmt = ctx.conn.prepare("SELECT role, COUNT(*) FROM users GROUP BY role")?;
        let rows = stmt
            .query_map([], |r| Ok((r.get(0)?, r.get(1)?)))
            .and_then(|it| it.collect::<Result<Vec<_>, _>>())?;
        rows
    };
    for (role, n) in rows {
        let role = role.parse::<Role>().map_err(|e| HandlerErr::db("db_query_failed", e))?;
        breakdown.insert(role.as_str(), n);
    }
    let total_users: i64 = breakdown.values().sum();
    let total_classes: i64 = ctx.conn.query_row("SELECT COUNT(*) FROM classes", [], |r| r.get(0))?;
    let active_assignments: i64 = ctx.conn.query_row(
        "SELECT COUNT(*) FROM assignments WHERE status = 'active'",
        [],
        |r| r.get(0),
    )?;

    Ok(json!({
        "totalUsers": total_users,
        "roleBreakdown": breakdown,
        "totalClasses": total_classes,
        "activeAssignments": active_assignments,
    }))
}

fn dashboard_teacher(ctx: &mut Ctx<'_>, _params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let p = access::require_role(ctx.session, Role::Teacher)?;
    let window_start = attendance_window_start(ctx.conn)?;
    let classes = list_classes(ctx.conn, ClassScope::TaughtBy(&p.user_id))?;

    let mut students: BTreeSet<String> = BTreeSet::new();
    let mut finals: Vec<f64> = Vec::new();
    let mut records: Vec<calc::AttendanceRecord> = Vec::new();
    let mut active_assignments = 0usize;
    let mut per_class: Vec<serde_json::Value> = Vec::with_capacity(classes.len());

    for class in &classes {
        let assignments = list_assignments(ctx.conn, &class.id, false)?;
        active_assignments += assignments.len();
        let calc_assignments: Vec<calc::Assignment> = assignments.iter().map(AssignmentRow::to_calc).collect();
        let calc_grades: Vec<calc::Grade> = list_grades(ctx.conn, Some(&class.id), None)?
            .iter()
            .map(GradeRow::to_calc)
            .collect();

        let roster = enrolled_students(ctx.conn, &class.id)?;
        let class_finals: Vec<f64> = roster
            .iter()
            .map(|s| calc::final_grade(&s.id, &calc_assignments, &calc_grades) as f64)
            .collect();
        let class_records = windowed_records(ctx.conn, Some(&class.id), None, window_start)?;

        per_class.push(json!({
            "classId": class.id,
            "name": class.name,
            "studentCount": roster.len(),
            "averageGrade": calc::mean_rounded(&class_finals),
            "attendanceRate": calc::attendance_rate(&class_records),
        }));
        students.extend(roster.into_iter().map(|s| s.id));
        finals.extend(class_finals);
        records.extend(class_records);
    }

    Ok(json!({
        "totalStudents": students.len(),
        "totalClasses": classes.len(),
        "activeAssignments": active_assignments,
        "averageGrade": calc::mean_rounded(&finals),
        "attendanceRate": calc::attendance_rate(&records),
        "windowStart": day_key(window_start),
        "classes": per_class,
    }))
}

fn dashboard_student(ctx: &mut Ctx<'_>, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let p = access::require_role(ctx.session, Role::Student)?;

    // With a classId the student gets the full (cached) class view.
    if let Some(class_id) = get_optional_str(params, "classId")? {
        let class = load_class(ctx.conn, &class_id)?;
        if !is_enrolled(ctx.conn, &class_id, &p.user_id)? {
            return Err(HandlerErr::new("forbidden", "not enrolled in this class"));
        }
        return cached_student_view(ctx, class, &p.user_id);
    }

    let window_start = attendance_window_start(ctx.conn)?;
    let classes = list_classes(ctx.conn, ClassScope::AttendedBy(&p.user_id))?;
    let mut out: Vec<serde_json::Value> = Vec::with_capacity(classes.len());
    for class in &classes {
        let records = windowed_records(ctx.conn, Some(&class.id), Some(&p.user_id), window_start)?;
        out.push(json!({
            "classId": class.id,
            "name": class.name,
            "subject": class.subject,
            "teacherName": class.teacher_name,
            "finalGrade": final_grade_in(ctx.conn, &class.id, &p.user_id)?,
            "attendanceRate": calc::attendance_rate(&records),
        }));
    }
    Ok(json!({ "classes": out, "windowStart": day_key(window_start) }))
}

fn dashboard_parent(ctx: &mut Ctx<'_>, _params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let p = access::require_role(ctx.session, Role::Parent)?;
    let window_start = attendance_window_start(ctx.conn)?;
    let children = children_of(ctx.conn, &p.user_id)?;

    let mut grade_averages: Vec<f64> = Vec::with_capacity(children.len());
    let mut attendance_rates: Vec<f64> = Vec::with_capacity(children.len());
    let mut out: Vec<serde_json::Value> = Vec::with_capacity(children.len());
    for child in &children {
        let snapshots: Vec<calc::PointsSnapshot> = list_grades(ctx.conn, None, Some(&child.id))?
            .iter()
            .map(GradeRow::snapshot)
            .collect();
        let average = calc::overall_points_average(&snapshots);
        let records = windowed_records(ctx.conn, None, Some(&child.id), window_start)?;
        let rate = calc::attendance_rate(&records);
        let classes = list_classes(ctx.conn, ClassScope::AttendedBy(&child.id))?;

        grade_averages.push(average);
        attendance_rates.push(rate as f64);
        out.push(json!({
            "id": child.id,
            "name": child.name,
            "averageGrade": calc::round_half_up(average),
            "attendanceRate": rate,
            "classes": classes,
        }));
    }

    Ok(json!({
        "children": out,
        "stats": {
            "childrenCount": children.len(),
            "averageGrade": calc::mean_rounded(&grade_averages),
            "averageAttendance": calc::mean_rounded(&attendance_rates),
        },
        "windowStart": day_key(window_start),
    }))
}

fn require_child(ctx: &Ctx<'_>, p: &Principal, child_id: &str) -> Result<(), HandlerErr> {
    load_user_with_role(ctx.conn, child_id, Role::Student)?;
    let parents = parent_ids_of(ctx.conn, child_id)?;
    access::can_read_student(p, child_id, &parents, false)?;
    Ok(())
}

fn parent_child_class(ctx: &mut Ctx<'_>, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let p = access::require_role(ctx.session, Role::Parent)?;
    let child_id = get_required_str(params, "childId")?;
    let class_id = get_required_str(params, "classId")?;
    require_child(ctx, p, &child_id)?;

    let class = load_class(ctx.conn, &class_id)?;
    if !is_enrolled(ctx.conn, &class_id, &child_id)? {
        return Err(HandlerErr::not_found("student in class"));
    }
    cached_student_view(ctx, class, &child_id)
}

fn parent_child(ctx: &mut Ctx<'_>, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let p = access::require_role(ctx.session, Role::Parent)?;
    let child_id = get_required_str(params, "childId")?;
    let child = load_user_with_role(ctx.conn, &child_id, Role::Student)?;
    let parents = parent_ids_of(ctx.conn, &child_id)?;
    access::can_read_student(p, &child_id, &parents, false)?;

    let classes = list_classes(ctx.conn, ClassScope::AttendedBy(&child_id))?;
    let mut averages: Vec<f64> = Vec::with_capacity(classes.len());
    let mut out: Vec<serde_json::Value> = Vec::with_capacity(classes.len());
    for class in &classes {
        let assignments: Vec<calc::Assignment> = list_assignments(ctx.conn, &class.id, false)?
            .iter()
            .map(AssignmentRow::to_calc)
            .collect();
        let grades: Vec<calc::Grade> = list_grades(ctx.conn, Some(&class.id), Some(&child_id))?
            .iter()
            .map(GradeRow::to_calc)
            .collect();
        let average = calc::class_points_average(&child_id, &assignments, &grades);
        averages.push(average as f64);
        out.push(json!({
            "classId": class.id,
            "name": class.name,
            "subject": class.subject,
            "teacherName": class.teacher_name,
            "averageGrade": average,
        }));
    }

    Ok(json!({
        "child": { "id": child.id, "name": child.name, "email": child.email },
        "classes": out,
        "overallStats": {
            "totalClasses": classes.len(),
            "averageGrade": calc::mean_rounded(&averages),
        },
    }))
}

fn parent_attendance(ctx: &mut Ctx<'_>, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let p = access::require_role(ctx.session, Role::Parent)?;
    let window_start = attendance_window_start(ctx.conn)?;

    let children = match get_optional_str(params, "childId")? {
        Some(child_id) => {
            require_child(ctx, p, &child_id)?;
            children_of(ctx.conn, &p.user_id)?
                .into_iter()
                .filter(|c| c.id == child_id)
                .collect()
        }
        None => children_of(ctx.conn, &p.user_id)?,
    };

    let mut out: Vec<serde_json::Value> = Vec::with_capacity(children.len());
    for child in &children {
        let mut classes: Vec<serde_json::Value> = Vec::new();
        for class in list_classes(ctx.conn, ClassScope::AttendedBy(&child.id))? {
            let records = windowed_records(ctx.conn, Some(&class.id), Some(&child.id), window_start)?;
            classes.push(json!({
                "classId": class.id,
                "name": class.name,
                "summary": calc::attendance_breakdown(&records),
            }));
        }
        let all = windowed_records(ctx.conn, None, Some(&child.id), window_start)?;
        out.push(json!({
            "id": child.id,
            "name": child.name,
            "summary": calc::attendance_breakdown(&all),
            "classes": classes,
        }));
    }
    Ok(json!({ "children": out, "windowStart": day_key(window_start) }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "dashboard.admin" => Some(with_ctx(state, req, dashboard_admin)),
        "dashboard.teacher" => Some(with_ctx(state, req, dashboard_teacher)),
        "dashboard.student" => Some(with_ctx(state, req, dashboard_student)),
        "dashboard.parent" => Some(with_ctx(state, req, dashboard_parent)),
        "parent.child" => Some(with_ctx(state, req, parent_child)),
        "parent.childClass" => Some(with_ctx(state, req, parent_child_class)),
        "parent.attendance" => Some(with_ctx(state, req, parent_attendance)),
        _ => None,
    }
}
