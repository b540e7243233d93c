use rusqlite::Connection;
use std::path::Path;

pub const DB_FILE: &str = "results.sqlite3";

pub fn open_db(workspace: &Path) -> anyhow::Result<Connection> {
    std::fs::create_dir_all(workspace)?;
    let db_path = workspace.join(DB_FILE);
    let conn = Connection::open(db_path)?;
    conn.execute("PRAGMA foreign_keys = ON", [])?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS students(
            id TEXT PRIMARY KEY,
            student_name TEXT NOT NULL,
            stream TEXT NOT NULL,
            college_roll_number TEXT NOT NULL UNIQUE,
            exam_roll_number TEXT NOT NULL UNIQUE,
            exam_code TEXT NOT NULL UNIQUE,
            created_at TEXT NOT NULL,
            updated_at TEXT
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_students_college_roll ON students(college_roll_number)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS results(
            id TEXT PRIMARY KEY,
            student_id TEXT NOT NULL,
            student_name TEXT NOT NULL,
            roll_number TEXT NOT NULL,
            program_type TEXT NOT NULL,
            batch TEXT NOT NULL,
            stream TEXT NOT NULL,
            semester INTEGER NOT NULL,
            academic_year TEXT NOT NULL,
            total_credits REAL NOT NULL,
            total_marks REAL NOT NULL,
            obtained_marks REAL NOT NULL,
            percentage REAL NOT NULL,
            cgpa REAL NOT NULL,
            result TEXT NOT NULL,
            remarks TEXT NOT NULL DEFAULT '',
            published_at TEXT NOT NULL,
            FOREIGN KEY(student_id) REFERENCES students(id),
            UNIQUE(student_id, semester)
        )",
        [],
    )?;
    ensure_results_remarks(&conn)?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_results_student ON results(student_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_results_cohort ON results(batch, stream, semester)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS result_subjects(
            id TEXT PRIMARY KEY,
            result_id TEXT NOT NULL,
            idx INTEGER NOT NULL,
            subject_name TEXT NOT NULL,
            theory REAL NOT NULL,
            internal REAL NOT NULL,
            practical REAL NOT NULL,
            total_marks REAL NOT NULL,
            obtained_marks REAL NOT NULL,
            credit REAL NOT NULL,
            grade TEXT NOT NULL,
            grade_point INTEGER NOT NULL,
            result TEXT NOT NULL,
            FOREIGN KEY(result_id) REFERENCES results(id),
            UNIQUE(result_id, idx)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_result_subjects_result ON result_subjects(result_id)",
        [],
    )?;

    Ok(conn)
}

// Workspaces created before the remarks column existed must keep opening.
fn ensure_results_remarks(conn: &Connection) -> anyhow::Result<()> {
    if table_has_column(conn, "results", "remarks")? {
        return Ok(());
    }
    conn.execute(
        "ALTER TABLE results ADD COLUMN remarks TEXT NOT NULL DEFAULT ''",
        [],
    )?;
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
