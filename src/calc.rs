use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use thiserror::Error;

/// Assignment categories with a fixed share of the final grade.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Category {
    #[serde(rename = "Unit Test")]
    UnitTest,
    #[serde(rename = "Seatwork")]
    Seatwork,
    #[serde(rename = "Term Test")]
    TermTest,
    #[serde(rename = "Homework")]
    Homework,
    #[serde(rename = "Research")]
    Research,
    #[serde(rename = "Participation")]
    Participation,
}

impl Category {
    /// Weight-table order. Weights sum to 1.0.
    pub const ALL: [Category; 6] = [
        Category::UnitTest,
        Category::Seatwork,
        Category::TermTest,
        Category::Homework,
        Category::Research,
        Category::Participation,
    ];

    pub fn weight(self) -> f64 {
        match self {
            Category::UnitTest => 0.25,
            Category::Seatwork => 0.25,
            Category::TermTest => 0.25,
            Category::Homework => 0.10,
            Category::Research => 0.10,
            Category::Participation => 0.05,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Category::UnitTest => "Unit Test",
            Category::Seatwork => "Seatwork",
            Category::TermTest => "Term Test",
            Category::Homework => "Homework",
            Category::Research => "Research",
            Category::Participation => "Participation",
        }
    }

    pub fn parse(raw: &str) -> Option<Category> {
        let t = raw.trim();
        Category::ALL
            .into_iter()
            .find(|c| c.as_str().eq_ignore_ascii_case(t))
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AttendanceStatus {
    Present,
    Absent,
    Late,
}

impl AttendanceStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            AttendanceStatus::Present => "present",
            AttendanceStatus::Absent => "absent",
            AttendanceStatus::Late => "late",
        }
    }

    pub fn parse(raw: &str) -> Option<AttendanceStatus> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "present" => Some(AttendanceStatus::Present),
            "absent" => Some(AttendanceStatus::Absent),
            "late" => Some(AttendanceStatus::Late),
            _ => None,
        }
    }

    /// Late arrivals count as attended.
    pub fn counts_as_attended(self) -> bool {
        matches!(self, AttendanceStatus::Present | AttendanceStatus::Late)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Assignment {
    pub id: String,
    pub category: Category,
    pub total_points: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Grade {
    pub student_id: String,
    pub assignment_id: String,
    pub points: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttendanceRecord {
    pub student_id: String,
    pub class_id: String,
    pub date: NaiveDate,
    pub status: AttendanceStatus,
}

/// Stored grade row as seen by dashboards: earned points plus the total-points
/// snapshot taken when the grade was written.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PointsSnapshot {
    pub points: f64,
    pub total_points: f64,
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum CalcError {
    #[error("total points missing")]
    MissingTotal,
    #[error("total points must be positive (got {0})")]
    NonPositiveTotal(f64),
}

impl CalcError {
    pub fn code(&self) -> &'static str {
        "calc_failed"
    }
}

/// JS-compatible rounding: halves go up (`Math.round`).
pub fn round_half_up(x: f64) -> i64 {
    (x + 0.5).floor() as i64
}

/// Raw percentage for a single score. A zero or missing total is an upstream
/// data error, never a default.
pub fn grade_percentage(points: f64, total_points: Option<f64>) -> Result<i64, CalcError> {
    let Some(total) = total_points else {
        return Err(CalcError::MissingTotal);
    };
    if !total.is_finite() || total <= 0.0 {
        return Err(CalcError::NonPositiveTotal(total));
    }
    Ok(round_half_up(points / total * 100.0))
}

fn grades_for_student<'a>(student_id: &str, grades: &'a [Grade]) -> HashMap<&'a str, &'a Grade> {
    grades
        .iter()
        .filter(|g| g.student_id == student_id)
        .map(|g| (g.assignment_id.as_str(), g))
        .collect()
}

fn category_percent_from(
    by_assignment: &HashMap<&str, &Grade>,
    category: Category,
    assignments: &[Assignment],
) -> f64 {
    let mut in_category = assignments.iter().filter(|a| a.category == category).peekable();
    if in_category.peek().is_none() {
        return 100.0;
    }

    let mut earned = 0.0_f64;
    let mut possible = 0.0_f64;
    for a in in_category {
        // Ungraded work neither helps nor hurts.
        let Some(g) = by_assignment.get(a.id.as_str()) else {
            continue;
        };
        earned += g.points;
        possible += a.total_points;
    }

    if possible == 0.0 {
        100.0
    } else {
        earned / possible * 100.0
    }
}

/// Unrounded category percentage. Empty or fully ungraded categories give 100.
pub fn category_percent(
    student_id: &str,
    category: Category,
    assignments: &[Assignment],
    grades: &[Grade],
) -> f64 {
    let by_assignment = grades_for_student(student_id, grades);
    category_percent_from(&by_assignment, category, assignments)
}

pub fn category_grade(
    student_id: &str,
    category: Category,
    assignments: &[Assignment],
    grades: &[Grade],
) -> i64 {
    round_half_up(category_percent(student_id, category, assignments, grades))
}

/// Weighted final grade over every category in the weight table. Categories
/// without assignments still contribute `100 * weight`.
pub fn final_grade(student_id: &str, assignments: &[Assignment], grades: &[Grade]) -> i64 {
    let by_assignment = grades_for_student(student_id, grades);
    let weighted_sum: f64 = Category::ALL
        .iter()
        .map(|c| category_percent_from(&by_assignment, *c, assignments) * c.weight())
        .sum();
    round_half_up(weighted_sum)
}

pub fn attendance_rate(records: &[AttendanceRecord]) -> i64 {
    attendance_breakdown(records).rate
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AttendanceSummary {
    pub present: usize,
    pub late: usize,
    pub absent: usize,
    pub total: usize,
    pub rate: i64,
}

pub fn attendance_breakdown(records: &[AttendanceRecord]) -> AttendanceSummary {
    let mut out = AttendanceSummary::default();
    for r in records {
        match r.status {
            AttendanceStatus::Present => out.present += 1,
            AttendanceStatus::Late => out.late += 1,
            AttendanceStatus::Absent => out.absent += 1,
        }
    }
    out.total = records.len();
    let attended = records
        .iter()
        .filter(|r| r.status.counts_as_attended())
        .count();
    out.rate = if out.total == 0 {
        0
    } else {
        round_half_up(attended as f64 / out.total as f64 * 100.0)
    };
    out
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CategoryGradeRow {
    pub category: Category,
    pub weight: f64,
    pub grade: i64,
    pub assignment_count: usize,
    pub graded_count: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StudentReport {
    pub student_id: String,
    pub categories: Vec<CategoryGradeRow>,
    pub final_grade: i64,
}

/// Per-category grades in weight-table order plus the final grade.
pub fn student_report(student_id: &str, assignments: &[Assignment], grades: &[Grade]) -> StudentReport {
    let graded: Vec<&str> = grades
        .iter()
        .filter(|g| g.student_id == student_id)
        .map(|g| g.assignment_id.as_str())
        .collect();
    let categories = Category::ALL
        .iter()
        .map(|c| {
            let in_category: Vec<&Assignment> =
                assignments.iter().filter(|a| a.category == *c).collect();
            let graded_count = in_category
                .iter()
                .filter(|a| graded.contains(&a.id.as_str()))
                .count();
            CategoryGradeRow {
                category: *c,
                weight: c.weight(),
                grade: category_grade(student_id, *c, assignments, grades),
                assignment_count: in_category.len(),
                graded_count,
            }
        })
        .collect();

    StudentReport {
        student_id: student_id.to_string(),
        categories,
        final_grade: final_grade(student_id, assignments, grades),
    }
}

/// Raw points ratio across every stored grade, ignoring categories.
/// No grades at all gives 0.
pub fn overall_points_average(grades: &[PointsSnapshot]) -> f64 {
    let (earned, possible) = grades
        .iter()
        .fold((0.0_f64, 0.0_f64), |(e, p), g| (e + g.points, p + g.total_points));
    if possible > 0.0 {
        earned / possible * 100.0
    } else {
        0.0
    }
}

/// Points earned over points possible across every listed assignment of one
/// class, ignoring categories. Ungraded assignments count as zero earned.
/// No assignments gives 0.
pub fn class_points_average(student_id: &str, assignments: &[Assignment], grades: &[Grade]) -> i64 {
    let by_assignment = grades_for_student(student_id, grades);
    let possible: f64 = assignments.iter().map(|a| a.total_points).sum();
    if possible <= 0.0 {
        return 0;
    }
    let earned: f64 = assignments
        .iter()
        .filter_map(|a| by_assignment.get(a.id.as_str()))
        .map(|g| g.points)
        .sum();
    round_half_up(earned / possible * 100.0)
}

pub fn mean_rounded(values: &[f64]) -> i64 {
    if values.is_empty() {
        return 0;
    }
    round_half_up(values.iter().sum::<f64>() / values.len() as f64)
}

#[cfg(test)]
mod tests {
    use super::*;

    const STUDENT: &str = "stu-1";

    fn assignment(id: &str, category: Category, total_points: f64) -> Assignment {
        Assignment {
            id: id.to_string(),
            category,
            total_points,
        }
    }

    fn grade(assignment_id: &str, points: f64) -> Grade {
        Grade {
            student_id: STUDENT.to_string(),
            assignment_id: assignment_id.to_string(),
            points,
        }
    }

    fn record(status: AttendanceStatus) -> AttendanceRecord {
        AttendanceRecord {
            student_id: STUDENT.to_string(),
            class_id: "class-1".to_string(),
            date: NaiveDate::from_ymd_opt(2024, 9, 3).expect("date"),
            status,
        }
    }

    #[test]
    fn weights_sum_to_one() {
        let total: f64 = Category::ALL.iter().map(|c| c.weight()).sum();
        assert!((total - 1.0).abs() < 1e-12);
    }

    #[test]
    fn category_parse_accepts_display_names() {
        assert_eq!(Category::parse("Unit Test"), Some(Category::UnitTest));
        assert_eq!(Category::parse("term test"), Some(Category::TermTest));
        assert_eq!(Category::parse("Quiz"), None);
        let json = serde_json::to_string(&Category::TermTest).expect("serialize");
        assert_eq!(json, "\"Term Test\"");
    }

    #[test]
    fn attendance_rate_empty_is_zero() {
        assert_eq!(attendance_rate(&[]), 0);
    }

    #[test]
    fn attendance_rate_counts_late_as_attended() {
        use AttendanceStatus::*;
        let half = [record(Present), record(Present), record(Absent), record(Absent)];
        assert_eq!(attendance_rate(&half), 50);

        let mixed = [record(Present), record(Late), record(Late), record(Absent)];
        assert_eq!(attendance_rate(&mixed), 75);

        let summary = attendance_breakdown(&mixed);
        assert_eq!(summary.present, 1);
        assert_eq!(summary.late, 2);
        assert_eq!(summary.absent, 1);
        assert_eq!(summary.total, 4);
    }

    #[test]
    fn attendance_rate_rounds_half_up() {
        use AttendanceStatus::*;
        // 2/3 -> 66.67 -> 67; 1/8 -> 12.5 -> 13
        assert_eq!(attendance_rate(&[record(Present), record(Late), record(Absent)]), 67);
        let mut eighth = vec![record(Present)];
        eighth.extend(std::iter::repeat_with(|| record(Absent)).take(7));
        assert_eq!(attendance_rate(&eighth), 13);
    }

    #[test]
    fn empty_category_defaults_to_full_credit() {
        assert_eq!(category_grade(STUDENT, Category::Homework, &[], &[]), 100);
    }

    #[test]
    fn only_graded_assignments_count() {
        let assignments = [
            assignment("hw1", Category::Homework, 10.0),
            assignment("hw2", Category::Homework, 10.0),
        ];
        let grades = [grade("hw1", 8.0)];
        assert_eq!(category_grade(STUDENT, Category::Homework, &assignments, &grades), 80);
    }

    #[test]
    fn fully_ungraded_category_defaults_to_full_credit() {
        let assignments = [assignment("hw1", Category::Homework, 10.0)];
        assert_eq!(category_grade(STUDENT, Category::Homework, &assignments, &[]), 100);
    }

    #[test]
    fn other_students_grades_are_ignored() {
        let assignments = [assignment("hw1", Category::Homework, 10.0)];
        let grades = [Grade {
            student_id: "someone-else".to_string(),
            assignment_id: "hw1".to_string(),
            points: 2.0,
        }];
        assert_eq!(category_grade(STUDENT, Category::Homework, &assignments, &grades), 100);
    }

    #[test]
    fn final_grade_without_assignments_is_full_credit() {
        assert_eq!(final_grade(STUDENT, &[], &[]), 100);
    }

    #[test]
    fn final_grade_weights_homework_at_ten_percent() {
        let assignments = [assignment("hw1", Category::Homework, 10.0)];
        let grades = [grade("hw1", 5.0)];
        assert_eq!(final_grade(STUDENT, &assignments, &grades), 95);
    }

    #[test]
    fn final_grade_uses_unrounded_category_percentages() {
        // Each test category sits at 12.5%: 3 * 3.125 + 25 = 34.375 -> 34.
        // Rounding the categories first would give 3 * 13 * 0.25 + 25 = 34.75 -> 35.
        let assignments = [
            assignment("ut", Category::UnitTest, 8.0),
            assignment("sw", Category::Seatwork, 8.0),
            assignment("tt", Category::TermTest, 8.0),
        ];
        let grades = [grade("ut", 1.0), grade("sw", 1.0), grade("tt", 1.0)];
        assert_eq!(category_grade(STUDENT, Category::UnitTest, &assignments, &grades), 13);
        assert_eq!(final_grade(STUDENT, &assignments, &grades), 34);
    }

    #[test]
    fn over_scoring_is_not_clamped() {
        let assignments = [assignment("ut", Category::UnitTest, 50.0)];
        let grades = [grade("ut", 60.0)];
        assert_eq!(category_grade(STUDENT, Category::UnitTest, &assignments, &grades), 120);
        assert_eq!(final_grade(STUDENT, &assignments, &grades), 105);
    }

    #[test]
    fn repeated_calls_are_identical() {
        let assignments = [
            assignment("hw1", Category::Homework, 10.0),
            assignment("ut1", Category::UnitTest, 50.0),
        ];
        let grades = [grade("hw1", 7.0), grade("ut1", 41.0)];
        let records = [record(AttendanceStatus::Late), record(AttendanceStatus::Absent)];

        let first = (
            category_grade(STUDENT, Category::UnitTest, &assignments, &grades),
            final_grade(STUDENT, &assignments, &grades),
            attendance_rate(&records),
        );
        let second = (
            category_grade(STUDENT, Category::UnitTest, &assignments, &grades),
            final_grade(STUDENT, &assignments, &grades),
            attendance_rate(&records),
        );
        assert_eq!(first, second);
    }

    #[test]
    fn grade_percentage_boundaries() {
        assert_eq!(grade_percentage(0.0, Some(100.0)), Ok(0));
        assert_eq!(grade_percentage(100.0, Some(100.0)), Ok(100));
        assert_eq!(grade_percentage(8.0, Some(10.0)), Ok(80));
    }

    #[test]
    fn grade_percentage_rejects_zero_or_missing_total() {
        assert_eq!(grade_percentage(5.0, None), Err(CalcError::MissingTotal));
        assert_eq!(grade_percentage(5.0, Some(0.0)), Err(CalcError::NonPositiveTotal(0.0)));
        assert!(grade_percentage(5.0, Some(f64::NAN)).is_err());
    }

    #[test]
    fn grade_percentage_tracks_exact_ratio() {
        for total in [7.0_f64, 10.0, 35.0, 60.0, 100.0] {
            let mut p = 0.0;
            while p <= total {
                let pct = grade_percentage(p, Some(total)).expect("positive total");
                let exact = p / total * 100.0;
                assert!((pct as f64 - exact).abs() <= 1.0, "{p}/{total} -> {pct}");
                p += 1.0;
            }
        }
    }

    #[test]
    fn student_report_lists_every_category_in_weight_order() {
        let assignments = [
            assignment("hw1", Category::Homework, 10.0),
            assignment("hw2", Category::Homework, 10.0),
        ];
        let grades = [grade("hw1", 5.0)];
        let report = student_report(STUDENT, &assignments, &grades);
        let order: Vec<Category> = report.categories.iter().map(|c| c.category).collect();
        assert_eq!(order, Category::ALL.to_vec());

        let hw = &report.categories[3];
        assert_eq!(hw.grade, 50);
        assert_eq!(hw.assignment_count, 2);
        assert_eq!(hw.graded_count, 1);
        assert_eq!(report.final_grade, 95);
    }

    #[test]
    fn class_points_average_counts_ungraded_work_as_zero() {
        let assignments = [
            assignment("hw1", Category::Homework, 10.0),
            assignment("ut1", Category::UnitTest, 30.0),
        ];
        let grades = [grade("hw1", 8.0)];
        // 8 / 40
        assert_eq!(class_points_average(STUDENT, &assignments, &grades), 20);
        assert_eq!(class_points_average(STUDENT, &[], &grades), 0);
    }

    #[test]
    fn overall_points_average_ignores_categories() {
        let grades = [
            PointsSnapshot { points: 8.0, total_points: 10.0 },
            PointsSnapshot { points: 30.0, total_points: 50.0 },
        ];
        // 38 / 60
        assert!((overall_points_average(&grades) - 63.333_333).abs() < 1e-3);
        assert_eq!(overall_points_average(&[]), 0.0);
        assert_eq!(mean_rounded(&[]), 0);
        assert_eq!(mean_rounded(&[80.0, 85.0]), 83);
    }
}
