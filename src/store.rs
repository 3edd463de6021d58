//! SQLite reads and writes behind the report-card lifecycle.
//!
//! Grade rows carry derived fields (`weighted_score`, `letter`); every write
//! path in here re-derives them through `scoring::score` first.

use crate::calc::{
    CardStatus, ClassInputs, EvaluationDef, EvaluationKind, EvaluationStatus, GradeInput,
    PeriodKey, ReportCard, StudentInput, SubjectDef, SubjectEntry,
};
use crate::coeff::{CoefficientRow, CoefficientTable};
use crate::error::{CalcError, CalcResult};
use crate::scoring::{self, LetterGrade};
use chrono::Utc;
use rusqlite::{Connection, OptionalExtension, Row};
use serde::Serialize;
use std::collections::HashMap;
use uuid::Uuid;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClassRow {
    pub id: String,
    pub name: String,
    pub level: String,
    pub track: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StudentRow {
    pub id: String,
    pub last_name: String,
    pub first_name: String,
    pub display_name: String,
    /// Effective track: the student's own, or the class default.
    pub track: String,
    pub active: bool,
    pub sort_order: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredGrade {
    pub evaluation_id: String,
    pub student_id: String,
    pub raw_score: Option<f64>,
    pub absent: bool,
    pub weighted_score: Option<f64>,
    pub letter: LetterGrade,
}

fn now() -> String {
    Utc::now().to_rfc3339()
}

pub fn load_class(conn: &Connection, class_id: &str) -> CalcResult<ClassRow> {
    conn.query_row(
        "SELECT id, name, level, track FROM classes WHERE id = ?",
        [class_id],
        |r| {
            Ok(ClassRow {
                id: r.get(0)?,
                name: r.get(1)?,
                level: r.get(2)?,
                track: r.get(3)?,
            })
        },
    )
    .optional()?
    .ok_or_else(|| CalcError::NotFound("class".into()))
}

pub fn load_students(conn: &Connection, class: &ClassRow) -> CalcResult<Vec<StudentRow>> {
    let mut stmt = conn.prepare(
        "SELECT id, last_name, first_name, track, active, sort_order
         FROM students
         WHERE class_id = ?
         ORDER BY sort_order, last_name, first_name",
    )?;
    let rows = stmt
        .query_map([&class.id], |r| {
            let last: String = r.get(1)?;
            let first: String = r.get(2)?;
            let track: Option<String> = r.get(3)?;
            Ok(StudentRow {
                id: r.get(0)?,
                display_name: format!("{}, {}", last, first),
                last_name: last,
                first_name: first,
                track: track
                    .filter(|t| !t.trim().is_empty())
                    .unwrap_or_else(|| class.track.clone()),
                active: r.get::<_, i64>(4)? != 0,
                sort_order: r.get(5)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

pub fn load_subjects(conn: &Connection) -> CalcResult<Vec<SubjectDef>> {
    let mut stmt = conn.prepare("SELECT id, name, sort_order FROM subjects ORDER BY sort_order, name")?;
    let rows = stmt
        .query_map([], |r| {
            Ok(SubjectDef {
                id: r.get(0)?,
                name: r.get(1)?,
                sort_order: r.get(2)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

pub fn load_coefficient_rows(conn: &Connection) -> CalcResult<Vec<CoefficientRow>> {
    let mut stmt = conn.prepare(
        "SELECT subject_id, level, track, coefficient
         FROM subject_coefficients
         ORDER BY subject_id, level, track",
    )?;
    let rows = stmt
        .query_map([], |r| {
            Ok(CoefficientRow {
                subject_id: r.get(0)?,
                level: r.get(1)?,
                track: r.get(2)?,
                coefficient: r.get(3)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

pub fn load_coefficients(conn: &Connection) -> CalcResult<CoefficientTable> {
    Ok(CoefficientTable::from_rows(load_coefficient_rows(conn)?))
}

const EVALUATION_COLUMNS: &str =
    "id, subject_id, title, kind, coefficient, weight_percent, max_score, status";

fn evaluation_from_row(r: &Row<'_>) -> rusqlite::Result<EvaluationDef> {
    let kind: String = r.get(3)?;
    let status: String = r.get(7)?;
    Ok(EvaluationDef {
        id: r.get(0)?,
        subject_id: r.get(1)?,
        title: r.get(2)?,
        kind: EvaluationKind::parse(&kind).unwrap_or(EvaluationKind::Exam),
        coefficient: r.get(4)?,
        weight_percent: r.get(5)?,
        max_score: r.get(6)?,
        status: EvaluationStatus::parse(&status).unwrap_or(EvaluationStatus::Planned),
    })
}

pub fn load_evaluations(conn: &Connection, key: &PeriodKey) -> CalcResult<Vec<EvaluationDef>> {
    let sql = format!(
        "SELECT {EVALUATION_COLUMNS}
         FROM evaluations
         WHERE class_id = ? AND year = ? AND period = ?
         ORDER BY idx"
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map((&key.class_id, &key.year, key.period), evaluation_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

pub fn load_evaluation(conn: &Connection, evaluation_id: &str) -> CalcResult<(PeriodKey, EvaluationDef)> {
    let sql = format!(
        "SELECT {EVALUATION_COLUMNS}, class_id, year, period FROM evaluations WHERE id = ?"
    );
    conn.query_row(&sql, [evaluation_id], |r| {
        let def = evaluation_from_row(r)?;
        let key = PeriodKey::new(r.get::<_, String>(8)?, r.get::<_, String>(9)?, r.get(10)?);
        Ok((key, def))
    })
    .optional()?
    .ok_or_else(|| CalcError::NotFound("evaluation".into()))
}

fn load_grades(
    conn: &Connection,
    key: &PeriodKey,
    student_id: Option<&str>,
) -> CalcResult<HashMap<String, Vec<GradeInput>>> {
    let mut stmt = conn.prepare(
        "SELECT g.student_id, g.evaluation_id, g.raw_score, g.absent
         FROM grades g
         JOIN evaluations e ON e.id = g.evaluation_id
         WHERE e.class_id = ? AND e.year = ? AND e.period = ?
           AND (?4 IS NULL OR g.student_id = ?4)
         ORDER BY e.idx",
    )?;
    let rows = stmt
        .query_map((&key.class_id, &key.year, key.period, student_id), |r| {
            Ok((
                r.get::<_, String>(0)?,
                GradeInput {
                    evaluation_id: r.get(1)?,
                    raw_score: r.get(2)?,
                    absent: r.get::<_, i64>(3)? != 0,
                },
            ))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    let mut by_student: HashMap<String, Vec<GradeInput>> = HashMap::new();
    for (sid, g) in rows {
        by_student.entry(sid).or_default().push(g);
    }
    Ok(by_student)
}

/// Inputs for the active students of a class. When `only_student` is set the
/// result holds just that student, who must belong to the class.
pub fn load_class_inputs(
    conn: &Connection,
    key: &PeriodKey,
    only_student: Option<&str>,
) -> CalcResult<ClassInputs> {
    let class = load_class(conn, &key.class_id)?;
    let mut students = load_students(conn, &class)?;
    if let Some(sid) = only_student {
        students.retain(|s| s.id == sid);
        match students.first() {
            None => return Err(CalcError::NotFound("student".into())),
            Some(s) if !s.active => {
                return Err(CalcError::InvalidInput(format!("student {sid} is inactive")))
            }
            Some(_) => {}
        }
    } else {
        students.retain(|s| s.active);
    }

    let mut grades = load_grades(conn, key, only_student)?;
    let students = students
        .into_iter()
        .map(|s| StudentInput {
            grades: grades.remove(&s.id).unwrap_or_default(),
            student_id: s.id,
            display_name: s.display_name,
            level: class.level.clone(),
            track: s.track,
        })
        .collect();

    Ok(ClassInputs {
        key: key.clone(),
        subjects: load_subjects(conn)?,
        evaluations: load_evaluations(conn, key)?,
        students,
    })
}

pub fn upsert_grade(
    conn: &Connection,
    evaluation: &EvaluationDef,
    student_id: &str,
    raw_score: Option<f64>,
    absent: bool,
) -> CalcResult<StoredGrade> {
    let absent = absent || raw_score.is_none();
    let raw_score = if absent { None } else { raw_score };
    if let Some(v) = raw_score {
        if !v.is_finite() || v < 0.0 || v > evaluation.max_score {
            return Err(CalcError::InvalidInput(format!(
                "raw score {v} outside 0..={}",
                evaluation.max_score
            )));
        }
    }
    let scored = scoring::score(raw_score, absent, evaluation.coefficient, evaluation.weight_percent);

    conn.execute(
        "INSERT INTO grades(id, evaluation_id, student_id, raw_score, absent, weighted_score, letter, updated_at)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?)
         ON CONFLICT(evaluation_id, student_id) DO UPDATE SET
           raw_score = excluded.raw_score,
           absent = excluded.absent,
           weighted_score = excluded.weighted_score,
           letter = excluded.letter,
           updated_at = excluded.updated_at",
        (
            Uuid::new_v4().to_string(),
            &evaluation.id,
            student_id,
            raw_score,
            absent as i64,
            scored.weighted_score,
            scored.letter.as_str(),
            now(),
        ),
    )?;

    Ok(StoredGrade {
        evaluation_id: evaluation.id.clone(),
        student_id: student_id.to_string(),
        raw_score,
        absent,
        weighted_score: scored.weighted_score,
        letter: scored.letter,
    })
}

/// Re-derive every grade of an evaluation, after its coefficient or weight
/// changed. Returns the ids of the students whose grades were touched.
pub fn rescore_evaluation(conn: &Connection, evaluation: &EvaluationDef) -> CalcResult<Vec<String>> {
    let grades = list_grades(conn, &evaluation.id)?;
    let mut touched = Vec::with_capacity(grades.len());
    for g in grades {
        upsert_grade(conn, evaluation, &g.student_id, g.raw_score, g.absent)?;
        touched.push(g.student_id);
    }
    Ok(touched)
}

pub fn list_grades(conn: &Connection, evaluation_id: &str) -> CalcResult<Vec<StoredGrade>> {
    let mut stmt = conn.prepare(
        "SELECT g.evaluation_id, g.student_id, g.raw_score, g.absent, g.weighted_score, g.letter
         FROM grades g
         JOIN students s ON s.id = g.student_id
         WHERE g.evaluation_id = ?
         ORDER BY s.sort_order, s.last_name, s.first_name",
    )?;
    let rows = stmt
        .query_map([evaluation_id], |r| {
            let letter: String = r.get(5)?;
            Ok(StoredGrade {
                evaluation_id: r.get(0)?,
                student_id: r.get(1)?,
                raw_score: r.get(2)?,
                absent: r.get::<_, i64>(3)? != 0,
                weighted_score: r.get(4)?,
                letter: LetterGrade::parse(&letter).unwrap_or(LetterGrade::Absent),
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

fn card_id(conn: &Connection, key: &PeriodKey, student_id: &str) -> CalcResult<Option<String>> {
    Ok(conn
        .query_row(
            "SELECT id FROM report_cards
             WHERE student_id = ? AND class_id = ? AND year = ? AND period = ?",
            (student_id, &key.class_id, &key.year, key.period),
            |r| r.get(0),
        )
        .optional()?)
}

/// Write the aggregate part of a card. A new card gets zero placeholders
/// for rank and class stats; an existing one keeps its previous (now stale)
/// values and drops back to draft. Returns the card as stored.
pub fn upsert_card(conn: &Connection, card: &ReportCard) -> CalcResult<ReportCard> {
    let key = card.key();
    let id = match card_id(conn, &key, &card.student_id)? {
        Some(id) => {
            conn.execute(
                "UPDATE report_cards SET
                   level = ?, track = ?, total_points = ?, total_coefficients = ?,
                   overall_average = ?, incomplete = ?, status = ?, updated_at = ?
                 WHERE id = ?",
                (
                    &card.level,
                    &card.track,
                    card.total_points,
                    card.total_coefficients,
                    card.overall_average,
                    card.incomplete as i64,
                    CardStatus::Draft.as_str(),
                    now(),
                    &id,
                ),
            )?;
            conn.execute("DELETE FROM report_card_subjects WHERE report_card_id = ?", [&id])?;
            id
        }
        None => {
            let id = Uuid::new_v4().to_string();
            conn.execute(
                "INSERT INTO report_cards(
                   id, student_id, class_id, year, period, level, track,
                   total_points, total_coefficients, overall_average, incomplete,
                   class_size, class_average, top_average, bottom_average, rank,
                   status, updated_at
                 ) VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 0, 0, 0, 0, 0, ?, ?)",
                (
                    &id,
                    &card.student_id,
                    &key.class_id,
                    &key.year,
                    key.period,
                    &card.level,
                    &card.track,
                    card.total_points,
                    card.total_coefficients,
                    card.overall_average,
                    card.incomplete as i64,
                    CardStatus::Draft.as_str(),
                    now(),
                ),
            )?;
            id
        }
    };

    let mut ins = conn.prepare(
        "INSERT INTO report_card_subjects(
           report_card_id, position, subject_id, name, coefficient, average, points, evaluations_json
         ) VALUES(?, ?, ?, ?, ?, ?, ?, ?)",
    )?;
    for (pos, s) in card.subjects.iter().enumerate() {
        let detail = serde_json::to_string(&s.evaluations)
            .map_err(|e| CalcError::Invariant(format!("cannot encode evaluation detail: {e}")))?;
        ins.execute((
            &id,
            pos as i64,
            &s.subject_id,
            &s.name,
            s.coefficient,
            s.average,
            s.points,
            detail,
        ))?;
    }

    load_card(conn, &key, &card.student_id)?
        .ok_or_else(|| CalcError::Invariant("report card vanished after write".into()))
}

/// Store rank and class stats produced by a ranking pass.
pub fn save_ranking(conn: &Connection, cards: &[ReportCard]) -> CalcResult<()> {
    let mut stmt = conn.prepare(
        "UPDATE report_cards SET
           class_size = ?, class_average = ?, top_average = ?, bottom_average = ?,
           rank = ?, status = ?, updated_at = ?
         WHERE student_id = ? AND class_id = ? AND year = ? AND period = ?",
    )?;
    let ts = now();
    for c in cards {
        let n = stmt.execute((
            c.class_size as i64,
            c.class_average,
            c.top_average,
            c.bottom_average,
            c.rank as i64,
            c.status.as_str(),
            &ts,
            &c.student_id,
            &c.class_id,
            &c.year,
            c.period,
        ))?;
        if n != 1 {
            return Err(CalcError::Invariant(format!(
                "ranking touched {n} rows for student {}",
                c.student_id
            )));
        }
    }
    Ok(())
}

/// Ranked cards computed under a (level, track) coefficient row. Track `*`
/// covers every track of the level.
pub fn ranked_cards_for_coefficient(
    conn: &Connection,
    level: &str,
    track: &str,
) -> CalcResult<Vec<(PeriodKey, String)>> {
    let mut stmt = conn.prepare(
        "SELECT class_id, year, period, student_id
         FROM report_cards
         WHERE level = ?1 AND (?2 = '*' OR track = ?2) AND status = ?3",
    )?;
    let rows = stmt
        .query_map((level, track, CardStatus::Ranked.as_str()), |r| {
            Ok((
                PeriodKey::new(r.get::<_, String>(0)?, r.get::<_, String>(1)?, r.get(2)?),
                r.get::<_, String>(3)?,
            ))
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Move a card back to draft. Returns false when no card exists yet.
pub fn mark_stale(conn: &Connection, key: &PeriodKey, student_id: &str) -> CalcResult<bool> {
    let n = conn.execute(
        "UPDATE report_cards SET status = ?, updated_at = ?
         WHERE student_id = ? AND class_id = ? AND year = ? AND period = ? AND status <> ?",
        (
            CardStatus::Draft.as_str(),
            now(),
            student_id,
            &key.class_id,
            &key.year,
            key.period,
            CardStatus::Draft.as_str(),
        ),
    )?;
    Ok(n > 0)
}

const CARD_SELECT: &str = "SELECT
   rc.id, rc.student_id, s.last_name, s.first_name, rc.class_id, rc.year, rc.period,
   rc.level, rc.track, rc.total_points, rc.total_coefficients, rc.overall_average,
   rc.incomplete, rc.class_size, rc.class_average, rc.top_average, rc.bottom_average,
   rc.rank, rc.status
 FROM report_cards rc
 JOIN students s ON s.id = rc.student_id";

fn card_from_row(r: &Row<'_>) -> rusqlite::Result<(String, ReportCard)> {
    let last: String = r.get(2)?;
    let first: String = r.get(3)?;
    let status: String = r.get(18)?;
    Ok((
        r.get(0)?,
        ReportCard {
            student_id: r.get(1)?,
            display_name: format!("{}, {}", last, first),
            class_id: r.get(4)?,
            year: r.get(5)?,
            period: r.get(6)?,
            level: r.get(7)?,
            track: r.get(8)?,
            subjects: Vec::new(),
            total_points: r.get(9)?,
            total_coefficients: r.get(10)?,
            overall_average: r.get(11)?,
            incomplete: r.get::<_, i64>(12)? != 0,
            class_size: r.get::<_, i64>(13)?.max(0) as usize,
            class_average: r.get(14)?,
            top_average: r.get(15)?,
            bottom_average: r.get(16)?,
            rank: r.get::<_, i64>(17)?.max(0) as usize,
            status: CardStatus::parse(&status).unwrap_or(CardStatus::Draft),
        },
    ))
}

fn load_card_subjects(conn: &Connection, card_id: &str) -> CalcResult<Vec<SubjectEntry>> {
    let mut stmt = conn.prepare(
        "SELECT subject_id, name, coefficient, average, points, evaluations_json
         FROM report_card_subjects
         WHERE report_card_id = ?
         ORDER BY position",
    )?;
    let rows = stmt
        .query_map([card_id], |r| {
            Ok((
                r.get::<_, String>(0)?,
                r.get::<_, String>(1)?,
                r.get::<_, f64>(2)?,
                r.get::<_, f64>(3)?,
                r.get::<_, f64>(4)?,
                r.get::<_, String>(5)?,
            ))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    rows.into_iter()
        .map(|(subject_id, name, coefficient, average, points, detail)| {
            let evaluations = serde_json::from_str(&detail).map_err(|e| {
                CalcError::Invariant(format!("corrupt evaluation detail for {subject_id}: {e}"))
            })?;
            Ok(SubjectEntry {
                subject_id,
                name,
                coefficient,
                average,
                points,
                evaluations,
            })
        })
        .collect()
}

pub fn load_card(conn: &Connection, key: &PeriodKey, student_id: &str) -> CalcResult<Option<ReportCard>> {
    let sql = format!(
        "{CARD_SELECT}
         WHERE rc.student_id = ? AND rc.class_id = ? AND rc.year = ? AND rc.period = ?"
    );
    let row = conn
        .query_row(
            &sql,
            (student_id, &key.class_id, &key.year, key.period),
            card_from_row,
        )
        .optional()?;
    let Some((id, mut card)) = row else {
        return Ok(None);
    };
    card.subjects = load_card_subjects(conn, &id)?;
    Ok(Some(card))
}

/// Cards of the active roster for a class/period, in roster order. Cards
/// left behind by deactivated students are not part of the class.
pub fn load_cards(conn: &Connection, key: &PeriodKey) -> CalcResult<Vec<ReportCard>> {
    let sql = format!(
        "{CARD_SELECT}
         WHERE rc.class_id = ? AND rc.year = ? AND rc.period = ? AND s.active = 1
         ORDER BY s.sort_order, s.last_name, s.first_name"
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map((&key.class_id, &key.year, key.period), card_from_row)?
        .collect::<Result<Vec<_>, _>>()?;

    let mut cards = Vec::with_capacity(rows.len());
    for (id, mut card) in rows {
        card.subjects = load_card_subjects(conn, &id)?;
        cards.push(card);
    }
    Ok(cards)
}
