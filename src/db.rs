use rusqlite::{Connection, OptionalExtension};
use std::path::Path;

pub const DB_FILE_NAME: &str = "reportcard.sqlite3";

pub fn open_db(workspace: &Path) -> anyhow::Result<Connection> {
    std::fs::create_dir_all(workspace)?;
    let db_path = workspace.join(DB_FILE_NAME);
    let conn = Connection::open(db_path)?;
    conn.execute("PRAGMA foreign_keys = ON", [])?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS classes(
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            level TEXT NOT NULL,
            track TEXT NOT NULL DEFAULT '*'
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS students(
            id TEXT PRIMARY KEY,
            class_id TEXT NOT NULL,
            last_name TEXT NOT NULL,
            first_name TEXT NOT NULL,
            track TEXT,
            active INTEGER NOT NULL DEFAULT 1,
            sort_order INTEGER NOT NULL,
            updated_at TEXT,
            FOREIGN KEY(class_id) REFERENCES classes(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_students_class_sort ON students(class_id, sort_order)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS subjects(
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL UNIQUE,
            sort_order INTEGER NOT NULL
        )",
        [],
    )?;

    // Track '*' applies to every track of the level.
    conn.execute(
        "CREATE TABLE IF NOT EXISTS subject_coefficients(
            subject_id TEXT NOT NULL,
            level TEXT NOT NULL,
            track TEXT NOT NULL,
            coefficient REAL NOT NULL,
            PRIMARY KEY(subject_id, level, track),
            FOREIGN KEY(subject_id) REFERENCES subjects(id)
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS evaluations(
            id TEXT PRIMARY KEY,
            class_id TEXT NOT NULL,
            subject_id TEXT NOT NULL,
            year TEXT NOT NULL,
            period INTEGER NOT NULL,
            idx INTEGER NOT NULL,
            title TEXT NOT NULL,
            kind TEXT NOT NULL,
            coefficient REAL NOT NULL DEFAULT 1,
            weight_percent REAL NOT NULL DEFAULT 100,
            max_score REAL NOT NULL DEFAULT 20,
            status TEXT NOT NULL DEFAULT 'planned',
            FOREIGN KEY(class_id) REFERENCES classes(id),
            FOREIGN KEY(subject_id) REFERENCES subjects(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_evaluations_period ON evaluations(class_id, year, period)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS grades(
            id TEXT PRIMARY KEY,
            evaluation_id TEXT NOT NULL,
            student_id TEXT NOT NULL,
            raw_score REAL,
            absent INTEGER NOT NULL DEFAULT 0,
            weighted_score REAL,
            letter TEXT NOT NULL,
            updated_at TEXT,
            FOREIGN KEY(evaluation_id) REFERENCES evaluations(id),
            FOREIGN KEY(student_id) REFERENCES students(id),
            UNIQUE(evaluation_id, student_id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_grades_student ON grades(student_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS report_cards(
            id TEXT PRIMARY KEY,
            student_id TEXT NOT NULL,
            class_id TEXT NOT NULL,
            year TEXT NOT NULL,
            period INTEGER NOT NULL,
            level TEXT NOT NULL,
            track TEXT NOT NULL,
            total_points REAL NOT NULL,
            total_coefficients REAL NOT NULL,
            overall_average REAL NOT NULL,
            incomplete INTEGER NOT NULL,
            class_size INTEGER NOT NULL DEFAULT 0,
            class_average REAL NOT NULL DEFAULT 0,
            top_average REAL NOT NULL DEFAULT 0,
            bottom_average REAL NOT NULL DEFAULT 0,
            rank INTEGER NOT NULL DEFAULT 0,
            status TEXT NOT NULL,
            updated_at TEXT,
            FOREIGN KEY(student_id) REFERENCES students(id),
            FOREIGN KEY(class_id) REFERENCES classes(id),
            UNIQUE(student_id, class_id, year, period)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_report_cards_period ON report_cards(class_id, year, period)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS report_card_subjects(
            report_card_id TEXT NOT NULL,
            position INTEGER NOT NULL,
            subject_id TEXT NOT NULL,
            name TEXT NOT NULL,
            coefficient REAL NOT NULL,
            average REAL NOT NULL,
            points REAL NOT NULL,
            evaluations_json TEXT NOT NULL,
            PRIMARY KEY(report_card_id, position),
            FOREIGN KEY(report_card_id) REFERENCES report_cards(id)
        )",
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

pub fn settings_get_json(conn: &Connection, key: &str) -> anyhow::Result<Option<serde_json::Value>> {
    let raw: Option<String> = conn
        .query_row(
            "SELECT value_json FROM settings WHERE key = ?",
            [key],
            |r| r.get(0),
        )
        .optional()?;
    match raw {
        Some(s) => Ok(Some(serde_json::from_str(&s)?)),
        None => Ok(None),
    }
}

pub fn settings_set_json(
    conn: &Connection,
    key: &str,
    value: &serde_json::Value,
) -> anyhow::Result<()> {
    conn.execute(
        "INSERT INTO settings(key, value_json) VALUES(?, ?)
         ON CONFLICT(key) DO UPDATE SET value_json = excluded.value_json",
        (key, serde_json::to_string(value)?),
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{SystemTime, UNIX_EPOCH};

    fn temp_dir(prefix: &str) -> std::path::PathBuf {
        let p = std::env::temp_dir().join(format!(
            "{}-{}",
            prefix,
            SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .expect("clock")
                .as_nanos()
        ));
        std::fs::create_dir_all(&p).expect("create temp dir");
        p
    }

    #[test]
    fn open_is_repeatable_and_settings_roundtrip() {
        let ws = temp_dir("reportcardd-db");
        {
            let conn = open_db(&ws).expect("first open");
            settings_set_json(&conn, "grading", &serde_json::json!({ "scale": 10.0 }))
                .expect("set");
        }
        let conn = open_db(&ws).expect("second open");
        let v = settings_get_json(&conn, "grading").expect("get");
        assert_eq!(v, Some(serde_json::json!({ "scale": 10.0 })));
        assert_eq!(settings_get_json(&conn, "missing").expect("get"), None);
    }
}
