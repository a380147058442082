use rusqlite::{Connection, OptionalExtension};
use std::path::Path;

pub fn open_db(workspace: &Path) -> anyhow::Result<Connection> {
    std::fs::create_dir_all(workspace)?;
    let db_path = workspace.join("exambook.sqlite3");
    let conn = Connection::open(db_path)?;
    conn.execute("PRAGMA foreign_keys = ON", [])?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS students(
            id TEXT PRIMARY KEY,
            school_id TEXT NOT NULL,
            name TEXT NOT NULL,
            class_name TEXT NOT NULL,
            roll_no TEXT,
            sort_order INTEGER NOT NULL,
            updated_at TEXT
        )",
        [],
    )?;
    // Older workspaces predate roll numbers.
    ensure_students_roll_no(&conn)?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_students_school_class ON students(school_id, class_name, sort_order)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS exams(
            id TEXT PRIMARY KEY,
            school_id TEXT NOT NULL,
            name TEXT NOT NULL,
            UNIQUE(school_id, name)
        )",
        [],
    )?;
    conn.execute(
        "CREATE TABLE IF NOT EXISTS exam_subjects(
            exam_id TEXT NOT NULL,
            subject TEXT NOT NULL,
            sort_order INTEGER NOT NULL,
            PRIMARY KEY(exam_id, subject),
            FOREIGN KEY(exam_id) REFERENCES exams(id)
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS marks(
            id TEXT PRIMARY KEY,
            school_id TEXT NOT NULL,
            student_id TEXT NOT NULL,
            student_name TEXT NOT NULL,
            class_name TEXT NOT NULL,
            exam_name TEXT NOT NULL,
            subject TEXT NOT NULL,
            obtained_marks REAL,
            total_marks REAL NOT NULL,
            percentage REAL,
            grade TEXT,
            gpa REAL,
            UNIQUE(school_id, student_id, exam_name, subject)
        )",
        [],
    )?;
    ensure_marks_updated_at(&conn)?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_marks_school_exam_class ON marks(school_id, exam_name, class_name)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS settings(
            key TEXT PRIMARY KEY,
            value_json TEXT NOT NULL
        )",
        [],
    )?;

    Ok(conn)
}

fn ensure_students_roll_no(conn: &Connection) -> anyhow::Result<()> {
    if table_has_column(conn, "students", "roll_no")? {
        return Ok(());
    }
    conn.execute("ALTER TABLE students ADD COLUMN roll_no TEXT", [])?;
    Ok(())
}

fn ensure_marks_updated_at(conn: &Connection) -> anyhow::Result<()> {
    if table_has_column(conn, "marks", "updated_at")? {
        return Ok(());
    }
    conn.execute("ALTER TABLE marks ADD COLUMN updated_at TEXT", [])?;
    Ok(())
}

fn table_has_column(conn: &Connection, table: &str, column: &str) -> anyhow::Result<bool> {
    let sql = format!("PRAGMA table_info({})", table);
    let mut stmt = conn.prepare(&sql)?;
    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        let name: String = row.get(1)?;
        if name == column {
            return Ok(true);
        }
    }
    Ok(false)
}

pub fn settings_get_json(conn: &Connection, key: &str) -> anyhow::Result<Option<serde_json::Value>> {
    let raw: Option<String> = conn
        .query_row(
            "SELECT value_json FROM settings WHERE key = ?",
            [key],
            |r| r.get(0),
        )
        .optional()?;
    match raw {
        // A corrupt row reads as unset rather than blocking the caller.
        Some(text) => Ok(serde_json::from_str(&text).ok()),
        None => Ok(None),
    }
}

pub fn settings_set_json(conn: &Connection, key: &str, value: &serde_json::Value) -> anyhow::Result<()> {
    conn.execute(
        "INSERT INTO settings(key, value_json) VALUES(?, ?)
         ON CONFLICT(key) DO UPDATE SET value_json = excluded.value_json",
        (key, serde_json::to_string(value)?),
    )?;
    Ok(())
}
