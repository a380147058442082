use rusqlite::{Connection, OptionalExtension};

use crate::grading::{Grade, MarkRecord, MarkUpdate};
use crate::ranking::RosterEntry;

/// Collaborator calls the grading engine needs from whatever holds the marks.
pub trait MarkStore {
    /// Every mark record of a school, unfiltered.
    fn fetch_marks(&self, school_id: &str) -> anyhow::Result<Vec<MarkRecord>>;
    /// Every enrolled student of a school.
    fn fetch_roster(&self, school_id: &str) -> anyhow::Result<Vec<RosterEntry>>;
    /// Expected subjects of an exam; may be empty.
    fn fetch_exam_subjects(&self, exam_id: &str) -> anyhow::Result<Vec<String>>;
    fn update_mark(&self, mark_id: &str, update: &MarkUpdate) -> anyhow::Result<()>;
}

pub struct SqliteMarkStore<'a> {
    conn: &'a Connection,
}

impl<'a> SqliteMarkStore<'a> {
    pub fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }
}

impl MarkStore for SqliteMarkStore<'_> {
    fn fetch_marks(&self, school_id: &str) -> anyhow::Result<Vec<MarkRecord>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, student_id, student_name, class_name, exam_name, subject,
                    obtained_marks, total_marks, percentage, grade, gpa
             FROM marks
             WHERE school_id = ?
             ORDER BY class_name, exam_name, student_id, subject",
        )?;
        let rows = stmt
            .query_map([school_id], |r| {
                let grade: Option<String> = r.get(9)?;
                Ok(MarkRecord {
                    id: r.get(0)?,
                    student_id: r.get(1)?,
                    student_name: r.get(2)?,
                    class_name: r.get(3)?,
                    exam_name: r.get(4)?,
                    subject: r.get(5)?,
                    obtained_marks: r.get(6)?,
                    total_marks: r.get(7)?,
                    percentage: r.get(8)?,
                    // Unknown letters from older rows read as ungraded.
                    grade: grade.as_deref().and_then(Grade::parse),
                    gpa: r.get(10)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    fn fetch_roster(&self, school_id: &str) -> anyhow::Result<Vec<RosterEntry>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, name, class_name, roll_no
             FROM students
             WHERE school_id = ?
             ORDER BY class_name, sort_order",
        )?;
        let rows = stmt
            .query_map([school_id], |r| {
                Ok(RosterEntry {
                    student_id: r.get(0)?,
                    name: r.get(1)?,
                    class_name: r.get(2)?,
                    roll_no: r.get(3)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    fn fetch_exam_subjects(&self, exam_id: &str) -> anyhow::Result<Vec<String>> {
        let mut stmt = self.conn.prepare(
            "SELECT subject FROM exam_subjects WHERE exam_id = ? ORDER BY sort_order",
        )?;
        let rows = stmt
            .query_map([exam_id], |r| r.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    fn update_mark(&self, mark_id: &str, update: &MarkUpdate) -> anyhow::Result<()> {
        let changed = self.conn.execute(
            "UPDATE marks SET grade = ?, gpa = ?, percentage = ?, updated_at = ? WHERE id = ?",
            (
                update.grade.as_str(),
                update.gpa,
                update.percentage,
                chrono::Utc::now().to_rfc3339(),
                mark_id,
            ),
        )?;
        if changed == 0 {
            anyhow::bail!("mark record {} not found", mark_id);
        }
        Ok(())
    }
}

/// Looks up an exam's display name, which is what mark records carry.
pub fn exam_name(conn: &Connection, school_id: &str, exam_id: &str) -> anyhow::Result<Option<String>> {
    let name = conn
        .query_row(
            "SELECT name FROM exams WHERE id = ? AND school_id = ?",
            (exam_id, school_id),
            |r| r.get(0),
        )
        .optional()?;
    Ok(name)
}

#[cfg(test)]
pub mod memory {
    use super::*;
    use std::cell::RefCell;
    use std::collections::{HashMap, HashSet};

    /// In-memory store for engine tests; can be told to reject chosen updates.
    pub struct MemoryStore {
        marks: RefCell<Vec<MarkRecord>>,
        roster: Vec<RosterEntry>,
        subjects: HashMap<String, Vec<String>>,
        failing: HashSet<String>,
    }

    impl MemoryStore {
        pub fn new(marks: Vec<MarkRecord>, roster: Vec<RosterEntry>) -> Self {
            Self {
                marks: RefCell::new(marks),
                roster,
                subjects: HashMap::new(),
                failing: HashSet::new(),
            }
        }

        pub fn with_subjects(mut self, exam_id: &str, subjects: &[&str]) -> Self {
            self.subjects.insert(
                exam_id.to_string(),
                subjects.iter().map(|s| s.to_string()).collect(),
            );
            self
        }

        pub fn failing_updates(mut self, mark_ids: &[&str]) -> Self {
            self.failing = mark_ids.iter().map(|s| s.to_string()).collect();
            self
        }

        pub fn marks(&self) -> Vec<MarkRecord> {
            self.marks.borrow().clone()
        }
    }

    impl MarkStore for MemoryStore {
        fn fetch_marks(&self, _school_id: &str) -> anyhow::Result<Vec<MarkRecord>> {
            Ok(self.marks())
        }

        fn fetch_roster(&self, _school_id: &str) -> anyhow::Result<Vec<RosterEntry>> {
            Ok(self.roster.clone())
        }

        fn fetch_exam_subjects(&self, exam_id: &str) -> anyhow::Result<Vec<String>> {
            Ok(self.subjects.get(exam_id).cloned().unwrap_or_default())
        }

        fn update_mark(&self, mark_id: &str, update: &MarkUpdate) -> anyhow::Result<()> {
            if self.failing.contains(mark_id) {
                anyhow::bail!("simulated write failure for {}", mark_id);
            }
            let mut marks = self.marks.borrow_mut();
            let Some(record) = marks.iter_mut().find(|r| r.id == mark_id) else {
                anyhow::bail!("mark record {} not found", mark_id);
            };
            record.grade = Some(update.grade);
            record.gpa = Some(update.gpa);
            record.percentage = Some(update.percentage);
            Ok(())
        }
    }
}
