use crate::calc::{EvaluationDef, EvaluationStatus};
use crate::ipc::error::{calc_err, err, ok};
use crate::ipc::helpers::{db_conn, lifecycle, optional_f64, required_str};
use crate::ipc::types::{AppState, Request};
use crate::scoring;
use crate::store;
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use std::collections::HashSet;

/// Bulk writes are capped so one request cannot hold the class lock forever.
const MAX_BULK_GRADES: usize = 2000;

struct GradeWrite {
    student_id: String,
    raw_score: Option<f64>,
    absent: bool,
}

fn parse_grade_write(
    obj: &serde_json::Value,
    evaluation: &EvaluationDef,
) -> Result<GradeWrite, (String, Option<serde_json::Value>)> {
    let Some(student_id) = obj
        .get("studentId")
        .and_then(|v| v.as_str())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
    else {
        return Err(("missing studentId".to_string(), None));
    };
    let absent = obj.get("absent").and_then(|v| v.as_bool()).unwrap_or(false);
    let raw_score = match obj.get("rawScore") {
        None => None,
        Some(v) if v.is_null() => None,
        Some(v) => match v.as_f64() {
            Some(n) if n.is_finite() => Some(n),
            _ => {
                return Err((
                    "rawScore must be a number".to_string(),
                    Some(json!({ "studentId": student_id, "rawScore": v })),
                ))
            }
        },
    };

    if !absent {
        let Some(score) = raw_score else {
            return Err((
                "rawScore is required unless absent is true".to_string(),
                Some(json!({ "studentId": student_id })),
            ));
        };
        if score < 0.0 || score > evaluation.max_score {
            return Err((
                "rawScore out of range".to_string(),
                Some(json!({
                    "studentId": student_id,
                    "rawScore": score,
                    "maxScore": evaluation.max_score,
                })),
            ));
        }
    }

    Ok(GradeWrite {
        student_id,
        raw_score: if absent { None } else { raw_score },
        absent,
    })
}

fn student_in_class(conn: &Connection, student_id: &str, class_id: &str) -> rusqlite::Result<bool> {
    conn.query_row(
        "SELECT 1 FROM students WHERE id = ? AND class_id = ?",
        (student_id, class_id),
        |r| r.get::<_, i64>(0),
    )
    .optional()
    .map(|v| v.is_some())
}

fn load_gradable_evaluation(
    conn: &Connection,
    req: &Request,
) -> Result<(crate::calc::PeriodKey, EvaluationDef), serde_json::Value> {
    let evaluation_id = required_str(req, "evaluationId")?;
    let (key, evaluation) =
        store::load_evaluation(conn, &evaluation_id).map_err(|e| calc_err(&req.id, e))?;
    if evaluation.status == EvaluationStatus::Cancelled {
        return Err(err(
            &req.id,
            "bad_params",
            "evaluation is cancelled",
            Some(json!({ "evaluationId": evaluation_id })),
        ));
    }
    Ok((key, evaluation))
}

fn handle_grades_upsert(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let (key, evaluation) = match load_gradable_evaluation(conn, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let write = match parse_grade_write(&req.params, &evaluation) {
        Ok(v) => v,
        Err((message, details)) => return err(&req.id, "bad_params", message, details),
    };
    match student_in_class(conn, &write.student_id, &key.class_id) {
        Ok(true) => {}
        Ok(false) => return err(&req.id, "not_found", "student not found in class", None),
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    }

    let grade = match store::upsert_grade(
        conn,
        &evaluation,
        &write.student_id,
        write.raw_score,
        write.absent,
    ) {
        Ok(g) => g,
        Err(e) => return calc_err(&req.id, e),
    };

    let lc = match lifecycle(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let stale = match lc.mark_stale(&key, &write.student_id) {
        Ok(v) => v,
        Err(e) => return calc_err(&req.id, e),
    };
    ok(&req.id, json!({ "grade": grade, "cardMarkedStale": stale }))
}

fn handle_grades_upsert_many(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let (key, evaluation) = match load_gradable_evaluation(conn, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let Some(items) = req.params.get("grades").and_then(|v| v.as_array()) else {
        return err(&req.id, "bad_params", "grades must be an array", None);
    };
    if items.len() > MAX_BULK_GRADES {
        return err(
            &req.id,
            "bad_params",
            "too many grades in one request",
            Some(json!({ "max": MAX_BULK_GRADES, "count": items.len() })),
        );
    }

    let mut writes: Vec<GradeWrite> = Vec::with_capacity(items.len());
    let mut seen: HashSet<String> = HashSet::new();
    for (i, item) in items.iter().enumerate() {
        let write = match parse_grade_write(item, &evaluation) {
            Ok(v) => v,
            Err((message, details)) => {
                return err(
                    &req.id,
                    "bad_params",
                    format!("grades[{}]: {}", i, message),
                    details,
                )
            }
        };
        if !seen.insert(write.student_id.clone()) {
            return err(
                &req.id,
                "bad_params",
                format!("grades[{}]: duplicate studentId", i),
                Some(json!({ "studentId": write.student_id })),
            );
        }
        match student_in_class(conn, &write.student_id, &key.class_id) {
            Ok(true) => {}
            Ok(false) => {
                return err(
                    &req.id,
                    "not_found",
                    format!("grades[{}]: student not found in class", i),
                    Some(json!({ "studentId": write.student_id })),
                )
            }
            Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
        }
        writes.push(write);
    }

    let tx = match conn.unchecked_transaction() {
        Ok(t) => t,
        Err(e) => return err(&req.id, "db_tx_failed", e.to_string(), None),
    };
    let mut stored = Vec::with_capacity(writes.len());
    for w in &writes {
        match store::upsert_grade(&tx, &evaluation, &w.student_id, w.raw_score, w.absent) {
            Ok(g) => stored.push(g),
            Err(e) => return calc_err(&req.id, e),
        }
    }
    if let Err(e) = tx.commit() {
        return err(&req.id, "db_commit_failed", e.to_string(), None);
    }

    let lc = match lifecycle(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let mut stale = 0;
    for w in &writes {
        match lc.mark_stale(&key, &w.student_id) {
            Ok(true) => stale += 1,
            Ok(false) => {}
            Err(e) => return calc_err(&req.id, e),
        }
    }
    tracing::debug!(evaluation_id = %evaluation.id, written = stored.len(), stale, "grades written");
    ok(&req.id, json!({ "grades": stored, "staleCards": stale }))
}

fn handle_grades_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let evaluation_id = match required_str(req, "evaluationId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    if let Err(e) = store::load_evaluation(conn, &evaluation_id) {
        return calc_err(&req.id, e);
    }
    match store::list_grades(conn, &evaluation_id) {
        Ok(grades) => ok(&req.id, json!({ "grades": grades })),
        Err(e) => calc_err(&req.id, e),
    }
}

/// Score without storing anything.
fn handle_grades_preview(_state: &mut AppState, req: &Request) -> serde_json::Value {
    let raw_score = match optional_f64(req, "rawScore") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let absent = req
        .params
        .get("absent")
        .and_then(|v| v.as_bool())
        .unwrap_or(false);
    let coefficient = match optional_f64(req, "coefficient") {
        Ok(v) => v.unwrap_or(1.0),
        Err(e) => return e,
    };
    let weight_percent = match optional_f64(req, "weightPercent") {
        Ok(v) => v.unwrap_or(100.0),
        Err(e) => return e,
    };
    if coefficient < 0.0 || weight_percent < 0.0 {
        return err(
            &req.id,
            "bad_params",
            "coefficient and weightPercent must be >= 0",
            None,
        );
    }
    let scored = scoring::score(raw_score, absent, coefficient, weight_percent);
    ok(
        &req.id,
        json!({
            "weightedScore": scored.weighted_score,
            "letter": scored.letter,
            "passing": scored.is_passing(),
        }),
    )
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "grades.upsert" => Some(handle_grades_upsert(state, req)),
        "grades.upsertMany" => Some(handle_grades_upsert_many(state, req)),
        "grades.list" => Some(handle_grades_list(state, req)),
        "grades.preview" => Some(handle_grades_preview(state, req)),
        _ => None,
    }
}
