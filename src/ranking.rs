use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use crate::grading::{
    grade_for_percentage, round_off_2_decimals, subject_passes, Grade, MarkRecord,
};

/// A student enrolled in a class, whether or not they sat the exam.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RosterEntry {
    pub student_id: String,
    pub name: String,
    pub class_name: String,
    pub roll_no: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubjectCell {
    pub obtained_marks: Option<f64>,
    pub total_marks: f64,
    /// Stored percentage, or the raw one if the record was never graded.
    pub percentage: f64,
    /// `None` until grading has run for the record.
    pub grade: Option<Grade>,
    /// Stored gpa, or the scale value of the raw percentage if ungraded.
    pub gpa: f64,
    #[serde(skip)]
    pub passes: bool,
}

impl SubjectCell {
    fn from_record(record: &MarkRecord) -> Self {
        let raw = record.raw_percentage();
        Self {
            obtained_marks: record.obtained_marks,
            total_marks: record.total_marks,
            percentage: record.percentage.unwrap_or(raw),
            grade: record.grade,
            gpa: record.gpa.unwrap_or_else(|| grade_for_percentage(raw).gpa),
            passes: subject_passes(record.obtained_marks, record.total_marks),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "camelCase")]
pub enum Completeness {
    Complete,
    /// At least one expected subject has no record; the student fails unranked.
    Incomplete { missing: Vec<String> },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StudentExamResult {
    pub student_id: String,
    pub student_name: String,
    pub class_name: String,
    pub roll_no: Option<String>,
    pub subjects: BTreeMap<String, SubjectCell>,
    pub total_obtained_marks: f64,
    pub total_possible_marks: f64,
    pub average_percentage: f64,
    #[serde(rename = "averageGPA")]
    pub average_gpa: f64,
    pub overall_grade: Grade,
    pub is_pass: bool,
    /// 1-based class position; 0 for students with incomplete results.
    pub rank: u32,
    pub completeness: Completeness,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RankTiePolicy {
    /// Rank is the position in the sorted list; equal totals get different ranks.
    #[default]
    Positional,
    /// Equal totals share a rank and the next rank skips ("1, 1, 3").
    Competition,
}

impl RankTiePolicy {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Positional => "positional",
            Self::Competition => "competition",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "positional" => Some(Self::Positional),
            "competition" => Some(Self::Competition),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SortKey {
    StudentId,
    #[default]
    Rank,
    Name,
}

impl SortKey {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::StudentId => "studentId",
            Self::Rank => "rank",
            Self::Name => "name",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "studentid" | "id" => Some(Self::StudentId),
            "rank" => Some(Self::Rank),
            "name" => Some(Self::Name),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SortOrder {
    #[default]
    Asc,
    Desc,
}

impl SortOrder {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Asc => "asc",
            Self::Desc => "desc",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "asc" => Some(Self::Asc),
            "desc" => Some(Self::Desc),
            _ => None,
        }
    }
}

/// Display filters and ordering. Applied after ranking, so filtered views keep class ranks.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PivotQuery {
    pub search_name: Option<String>,
    pub roll_no: Option<String>,
    pub sort_by: SortKey,
    pub sort_order: SortOrder,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PivotTable {
    pub subjects: Vec<String>,
    pub rows: Vec<StudentExamResult>,
}

/// The exam's catalog subjects, or the subjects seen in `marks` when the catalog is empty.
///
/// Callers pass only the well-formed records of enrolled students, so a
/// stray or malformed record cannot add an expected subject.
pub fn expected_subjects<'a>(
    catalog: &[String],
    marks: impl IntoIterator<Item = &'a MarkRecord>,
) -> Vec<String> {
    if !catalog.is_empty() {
        return catalog.to_vec();
    }
    marks
        .into_iter()
        .map(|m| m.subject.clone())
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

fn seed_row(student: &RosterEntry) -> StudentExamResult {
    StudentExamResult {
        student_id: student.student_id.clone(),
        student_name: student.name.clone(),
        class_name: student.class_name.clone(),
        roll_no: student.roll_no.clone(),
        subjects: BTreeMap::new(),
        total_obtained_marks: 0.0,
        total_possible_marks: 0.0,
        average_percentage: 0.0,
        average_gpa: 0.0,
        overall_grade: Grade::F,
        is_pass: false,
        rank: 0,
        completeness: Completeness::Complete,
    }
}

fn aggregate_row(row: &mut StudentExamResult, expected: &[String]) {
    let missing: Vec<String> = expected
        .iter()
        .filter(|s| !row.subjects.contains_key(*s))
        .cloned()
        .collect();

    row.total_obtained_marks = row
        .subjects
        .values()
        .map(|c| c.obtained_marks.unwrap_or(0.0))
        .sum();
    row.total_possible_marks = row.subjects.values().map(|c| c.total_marks).sum();
    let count = row.subjects.len();
    if count > 0 {
        let pct_sum: f64 = row.subjects.values().map(|c| c.percentage).sum();
        row.average_percentage = round_off_2_decimals(pct_sum / count as f64);
    }

    // No recorded subject at all is incomplete even when nothing is expected.
    if !missing.is_empty() || row.subjects.is_empty() {
        row.completeness = Completeness::Incomplete { missing };
        row.average_gpa = 0.0;
        row.overall_grade = Grade::F;
        row.is_pass = false;
        row.rank = 0;
        return;
    }

    row.completeness = Completeness::Complete;
    if count > 0 {
        let gpa_sum: f64 = row.subjects.values().map(|c| c.gpa).sum();
        row.average_gpa = round_off_2_decimals(gpa_sum / count as f64);
        row.overall_grade = grade_for_percentage(row.average_percentage).grade;
        row.is_pass = row.subjects.values().all(|c| c.passes);
    }
}

/// Ranks complete rows by total obtained marks, highest first. Sorting is
/// stable, so equal totals keep roster order.
fn assign_ranks(rows: &mut [StudentExamResult], policy: RankTiePolicy) {
    rows.sort_by(|a, b| {
        b.total_obtained_marks
            .partial_cmp(&a.total_obtained_marks)
            .unwrap_or(Ordering::Equal)
    });
    let mut prev_total: Option<f64> = None;
    let mut prev_rank = 0_u32;
    for (i, row) in rows.iter_mut().enumerate() {
        let position = (i + 1) as u32;
        row.rank = match policy {
            RankTiePolicy::Positional => position,
            RankTiePolicy::Competition => {
                if prev_total == Some(row.total_obtained_marks) {
                    prev_rank
                } else {
                    position
                }
            }
        };
        prev_total = Some(row.total_obtained_marks);
        prev_rank = row.rank;
    }
}

fn matches_query(row: &StudentExamResult, query: &PivotQuery) -> bool {
    let name_ok = query
        .search_name
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|needle| {
            row.student_name
                .to_lowercase()
                .contains(&needle.to_lowercase())
        })
        .unwrap_or(true);
    let roll_ok = query
        .roll_no
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|needle| {
            let needle = needle.to_lowercase();
            let roll = row.roll_no.as_deref().unwrap_or(&row.student_id);
            roll.to_lowercase().contains(&needle)
        })
        .unwrap_or(true);
    name_ok && roll_ok
}

fn display_order(
    a: &StudentExamResult,
    b: &StudentExamResult,
    key: SortKey,
    order: SortOrder,
) -> Ordering {
    let directed = |ord: Ordering| match order {
        SortOrder::Asc => ord,
        SortOrder::Desc => ord.reverse(),
    };
    match key {
        SortKey::StudentId => directed(a.student_id.cmp(&b.student_id)),
        SortKey::Name => directed(
            a.student_name
                .to_lowercase()
                .cmp(&b.student_name.to_lowercase()),
        ),
        // Unranked rows sort after every ranked one in either direction.
        SortKey::Rank => (a.rank == 0)
            .cmp(&(b.rank == 0))
            .then_with(|| directed(a.rank.cmp(&b.rank))),
    }
}

/// Builds one result row per roster student for an exam+class.
///
/// `marks` should already be restricted to the exam and class. Records of
/// students outside the roster, records with non-positive totals and records
/// for subjects outside the expected set are ignored. When nothing usable is
/// left the table has no rows.
pub fn build_pivot(
    roster: &[RosterEntry],
    marks: &[MarkRecord],
    catalog: &[String],
    tie_policy: RankTiePolicy,
    query: &PivotQuery,
) -> PivotTable {
    let index: HashMap<&str, usize> = roster
        .iter()
        .enumerate()
        .map(|(i, s)| (s.student_id.as_str(), i))
        .collect();
    let enrolled: Vec<&MarkRecord> = marks
        .iter()
        .filter(|m| m.is_well_formed() && index.contains_key(m.student_id.as_str()))
        .collect();
    let subjects = expected_subjects(catalog, enrolled.iter().copied());
    let usable: Vec<&MarkRecord> = {
        let expected: HashSet<&str> = subjects.iter().map(String::as_str).collect();
        enrolled
            .into_iter()
            .filter(|m| expected.contains(m.subject.as_str()))
            .collect()
    };
    if usable.is_empty() {
        return PivotTable {
            subjects,
            rows: Vec::new(),
        };
    }

    let mut rows: Vec<StudentExamResult> = roster.iter().map(seed_row).collect();
    for record in usable {
        let Some(&i) = index.get(record.student_id.as_str()) else {
            continue;
        };
        rows[i]
            .subjects
            .insert(record.subject.clone(), SubjectCell::from_record(record));
    }

    for row in rows.iter_mut() {
        aggregate_row(row, &subjects);
    }

    let (mut ranked, unranked): (Vec<_>, Vec<_>) = rows
        .into_iter()
        .partition(|r| r.completeness == Completeness::Complete);
    assign_ranks(&mut ranked, tie_policy);
    ranked.extend(unranked);

    let mut rows: Vec<StudentExamResult> = ranked
        .into_iter()
        .filter(|r| matches_query(r, query))
        .collect();
    rows.sort_by(|a, b| display_order(a, b, query.sort_by, query.sort_order));

    PivotTable { subjects, rows }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubjectStats {
    pub subject: String,
    pub recorded_count: usize,
    pub blank_count: usize,
    pub pass_count: usize,
    pub fail_count: usize,
    pub highest_marks: Option<f64>,
    pub lowest_marks: Option<f64>,
    pub average_percentage: f64,
}

/// Class-level figures per expected subject over the roster's well-formed records.
/// Records for subjects outside the expected set are not counted.
pub fn subject_stats(
    roster: &[RosterEntry],
    marks: &[MarkRecord],
    catalog: &[String],
) -> Vec<SubjectStats> {
    let enrolled: BTreeSet<&str> = roster.iter().map(|s| s.student_id.as_str()).collect();
    let usable: Vec<&MarkRecord> = marks
        .iter()
        .filter(|m| m.is_well_formed() && enrolled.contains(m.student_id.as_str()))
        .collect();

    expected_subjects(catalog, usable.iter().copied())
        .into_iter()
        .map(|subject| {
            let records: Vec<&&MarkRecord> =
                usable.iter().filter(|m| m.subject == subject).collect();
            let pass_count = records.iter().filter(|m| m.passes()).count();
            let blank_count = records
                .iter()
                .filter(|m| m.obtained_marks.unwrap_or(0.0) == 0.0)
                .count();
            let obtained: Vec<f64> = records
                .iter()
                .map(|m| m.obtained_marks.unwrap_or(0.0))
                .collect();
            let average_percentage = if records.is_empty() {
                0.0
            } else {
                round_off_2_decimals(
                    records.iter().map(|m| m.raw_percentage()).sum::<f64>() / records.len() as f64,
                )
            };
            SubjectStats {
                recorded_count: records.len(),
                blank_count,
                pass_count,
                fail_count: records.len() - pass_count,
                highest_marks: obtained.iter().copied().reduce(f64::max),
                lowest_marks: obtained.iter().copied().reduce(f64::min),
                average_percentage,
                subject,
            }
        })
        .collect()
}
