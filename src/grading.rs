use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::store::MarkStore;

/// Share of the paper a student must reach to pass a subject.
pub const PASS_PERCENT: f64 = 33.0;

/// Legacy summary rule: average percentage a student needs to count as a pass.
pub const LEGACY_SUMMARY_PASS_AVERAGE: f64 = 40.0;

/// Legacy summary rule: raw marks every subject must reach, whatever the paper total.
pub const LEGACY_SUMMARY_SUBJECT_MIN: f64 = 33.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Grade {
    #[serde(rename = "A+")]
    APlus,
    #[serde(rename = "A")]
    A,
    #[serde(rename = "A-")]
    AMinus,
    #[serde(rename = "B")]
    B,
    #[serde(rename = "C")]
    C,
    #[serde(rename = "D")]
    D,
    #[serde(rename = "F")]
    F,
}

impl Grade {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::APlus => "A+",
            Self::A => "A",
            Self::AMinus => "A-",
            Self::B => "B",
            Self::C => "C",
            Self::D => "D",
            Self::F => "F",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim() {
            "A+" => Some(Self::APlus),
            "A" => Some(Self::A),
            "A-" => Some(Self::AMinus),
            "B" => Some(Self::B),
            "C" => Some(Self::C),
            "D" => Some(Self::D),
            "F" => Some(Self::F),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GradeBand {
    pub min_percent: f64,
    pub grade: Grade,
    pub gpa: f64,
}

/// Highest threshold first; the first band the percentage reaches wins.
pub const GRADE_SCALE: [GradeBand; 6] = [
    GradeBand { min_percent: 80.0, grade: Grade::APlus, gpa: 5.0 },
    GradeBand { min_percent: 70.0, grade: Grade::A, gpa: 4.0 },
    GradeBand { min_percent: 60.0, grade: Grade::AMinus, gpa: 3.5 },
    GradeBand { min_percent: 50.0, grade: Grade::B, gpa: 3.0 },
    GradeBand { min_percent: 40.0, grade: Grade::C, gpa: 2.0 },
    GradeBand { min_percent: 33.0, grade: Grade::D, gpa: 1.0 },
];

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct GradePoint {
    pub grade: Grade,
    pub gpa: f64,
}

pub const FAIL_POINT: GradePoint = GradePoint {
    grade: Grade::F,
    gpa: 0.0,
};

pub fn grade_for_percentage(percent: f64) -> GradePoint {
    GRADE_SCALE
        .iter()
        .find(|band| percent >= band.min_percent)
        .map(|band| GradePoint {
            grade: band.grade,
            gpa: band.gpa,
        })
        .unwrap_or(FAIL_POINT)
}

/// Half-up rounding to 2 decimals, used for every stored or displayed percentage/GPA.
pub fn round_off_2_decimals(x: f64) -> f64 {
    ((100.0 * x) + 0.5).floor() / 100.0
}

pub fn round_off_1_decimal(x: f64) -> f64 {
    ((10.0 * x) + 0.5).floor() / 10.0
}

/// Minimum obtained marks needed to pass a paper out of `total_marks`.
///
/// 100-mark papers need 33 and 50-mark papers need 17; every other total
/// needs `ceil(total * 33%)`, which agrees with both fixed cases.
pub fn pass_threshold(total_marks: f64) -> f64 {
    if total_marks == 100.0 {
        33.0
    } else if total_marks == 50.0 {
        17.0
    } else {
        (total_marks * PASS_PERCENT / 100.0).ceil()
    }
}

/// Per-subject pass test. Zero or missing marks are a blank script and fail.
pub fn subject_passes(obtained_marks: Option<f64>, total_marks: f64) -> bool {
    match obtained_marks {
        None => false,
        Some(v) if v == 0.0 => false,
        Some(v) => v >= pass_threshold(total_marks),
    }
}

pub fn raw_percentage(obtained_marks: Option<f64>, total_marks: f64) -> f64 {
    if total_marks > 0.0 {
        100.0 * obtained_marks.unwrap_or(0.0) / total_marks
    } else {
        0.0
    }
}

/// One student's score in one subject of one exam.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MarkRecord {
    pub id: String,
    pub student_id: String,
    pub student_name: String,
    pub class_name: String,
    pub exam_name: String,
    pub subject: String,
    pub obtained_marks: Option<f64>,
    pub total_marks: f64,
    /// Written by grading; `None` until the first recalculation.
    pub percentage: Option<f64>,
    pub grade: Option<Grade>,
    pub gpa: Option<f64>,
}

impl MarkRecord {
    pub fn raw_percentage(&self) -> f64 {
        raw_percentage(self.obtained_marks, self.total_marks)
    }

    pub fn passes(&self) -> bool {
        subject_passes(self.obtained_marks, self.total_marks)
    }

    /// Records with a non-positive or non-finite total cannot be aggregated.
    pub fn is_well_formed(&self) -> bool {
        self.total_marks.is_finite() && self.total_marks > 0.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MarkUpdate {
    pub grade: Grade,
    pub gpa: f64,
    pub percentage: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SummaryPassPolicy {
    /// A student passes iff no subject fails the per-subject threshold test.
    #[default]
    SubjectThreshold,
    /// Average percentage >= 40 and every subject's raw obtained marks >= 33.
    LegacyAverage,
}

impl SummaryPassPolicy {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::SubjectThreshold => "subjectThreshold",
            Self::LegacyAverage => "legacyAverage",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "subjectthreshold" => Some(Self::SubjectThreshold),
            "legacyaverage" => Some(Self::LegacyAverage),
            _ => None,
        }
    }
}

/// Outcome of grading one student's subject records for one exam.
#[derive(Debug, Clone, PartialEq)]
pub struct StudentGrading {
    pub student_id: String,
    pub has_failing_subject: bool,
    /// Mean of the raw subject percentages, unrounded.
    pub average_percentage: f64,
    /// Applied to every subject record of the student.
    pub update: MarkUpdate,
    pub summary_pass: bool,
}

/// Grades one student from their well-formed records of a single exam.
///
/// A single failing subject forces F / 0.00 onto every subject record; the
/// stored percentage is always the plain average of the raw percentages.
pub fn grade_student(
    student_id: &str,
    records: &[&MarkRecord],
    policy: SummaryPassPolicy,
) -> StudentGrading {
    let has_failing_subject = records.iter().any(|r| !r.passes());
    let average_percentage = if records.is_empty() {
        0.0
    } else {
        records.iter().map(|r| r.raw_percentage()).sum::<f64>() / records.len() as f64
    };

    let point = if has_failing_subject {
        FAIL_POINT
    } else {
        grade_for_percentage(average_percentage)
    };

    let summary_pass = match policy {
        SummaryPassPolicy::SubjectThreshold => !has_failing_subject && !records.is_empty(),
        SummaryPassPolicy::LegacyAverage => {
            !records.is_empty()
                && average_percentage >= LEGACY_SUMMARY_PASS_AVERAGE
                && records
                    .iter()
                    .all(|r| r.obtained_marks.unwrap_or(0.0) >= LEGACY_SUMMARY_SUBJECT_MIN)
        }
    };

    StudentGrading {
        student_id: student_id.to_string(),
        has_failing_subject,
        average_percentage,
        update: MarkUpdate {
            grade: point.grade,
            gpa: point.gpa,
            percentage: round_off_2_decimals(average_percentage),
        },
        summary_pass,
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExamClassFilter {
    pub exam_name: String,
    pub class_name: String,
}

impl ExamClassFilter {
    pub fn matches(&self, record: &MarkRecord) -> bool {
        record.exam_name == self.exam_name && record.class_name == self.class_name
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GradingSummary {
    pub total_students: usize,
    pub pass_count: usize,
    pub fail_count: usize,
    /// Percent of students counted as pass, 1 decimal.
    pub pass_rate: f64,
    pub updated_count: usize,
    /// Records skipped because their total marks were not positive.
    pub excluded_count: usize,
    pub failed_update_count: usize,
}

/// Regrades every student with marks in one exam+class and writes the
/// grade/gpa/percentage back through the store.
///
/// Updates are best-effort: a failed write is logged and skipped, and the
/// batch carries on. Concurrent runs for the same exam+class can interleave
/// writes, so callers must serialise them.
pub fn recalculate_exam_grades<S: MarkStore + ?Sized>(
    store: &S,
    school_id: &str,
    filter: &ExamClassFilter,
    policy: SummaryPassPolicy,
) -> anyhow::Result<GradingSummary> {
    let marks = store.fetch_marks(school_id)?;

    let mut summary = GradingSummary::default();
    let mut by_student: BTreeMap<&str, Vec<&MarkRecord>> = BTreeMap::new();
    for record in marks.iter().filter(|r| filter.matches(r)) {
        if !record.is_well_formed() {
            tracing::warn!(
                mark_id = %record.id,
                student_id = %record.student_id,
                subject = %record.subject,
                total_marks = record.total_marks,
                "excluding mark record with non-positive total marks"
            );
            summary.excluded_count += 1;
            continue;
        }
        by_student
            .entry(record.student_id.as_str())
            .or_default()
            .push(record);
    }

    for (student_id, records) in &by_student {
        let graded = grade_student(student_id, records, policy);
        if graded.summary_pass {
            summary.pass_count += 1;
        } else {
            summary.fail_count += 1;
        }

        for record in records {
            match store.update_mark(&record.id, &graded.update) {
                Ok(()) => summary.updated_count += 1,
                Err(e) => {
                    tracing::warn!(
                        mark_id = %record.id,
                        student_id = %student_id,
                        error = %e,
                        "failed to persist grade; skipping record"
                    );
                    summary.failed_update_count += 1;
                }
            }
        }
    }

    summary.total_students = by_student.len();
    summary.pass_rate = if summary.total_students > 0 {
        round_off_1_decimal(100.0 * summary.pass_count as f64 / summary.total_students as f64)
    } else {
        0.0
    };

    tracing::info!(
        school_id,
        exam = %filter.exam_name,
        class = %filter.class_name,
        students = summary.total_students,
        passed = summary.pass_count,
        failed = summary.fail_count,
        updated = summary.updated_count,
        excluded = summary.excluded_count,
        "grading recalculated"
    );

    Ok(summary)
}
