use crate::calc::{EvaluationKind, EvaluationStatus, PeriodKey};
use crate::coeff::{normalize_key, CoefficientResolver, ANY_TRACK};
use crate::ipc::error::{calc_err, err, ok};
use crate::ipc::helpers::{db_conn, lifecycle, optional_f64, optional_str, period_key, required_str};
use crate::ipc::types::{AppState, Request};
use crate::store;
use rusqlite::OptionalExtension;
use serde_json::json;
use uuid::Uuid;

fn handle_classes_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let name = match required_str(req, "name") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let level = match required_str(req, "level") {
        Ok(v) => normalize_key(&v),
        Err(e) => return e,
    };
    let track = optional_str(req, "track")
        .map(|t| normalize_key(&t))
        .unwrap_or_else(|| ANY_TRACK.to_string());

    let class_id = Uuid::new_v4().to_string();
    if let Err(e) = conn.execute(
        "INSERT INTO classes(id, name, level, track) VALUES(?, ?, ?, ?)",
        (&class_id, &name, &level, &track),
    ) {
        return err(
            &req.id,
            "db_insert_failed",
            e.to_string(),
            Some(json!({ "table": "classes" })),
        );
    }
    ok(&req.id, json!({ "classId": class_id }))
}

fn handle_classes_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return ok(&req.id, json!({ "classes": [] }));
    };
    let mut stmt = match conn.prepare(
        "SELECT
           c.id,
           c.name,
           c.level,
           c.track,
           (SELECT COUNT(*) FROM students s WHERE s.class_id = c.id AND s.active = 1) AS student_count
         FROM classes c
         ORDER BY c.name",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let classes = match stmt
        .query_map([], |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "name": r.get::<_, String>(1)?,
                "level": r.get::<_, String>(2)?,
                "track": r.get::<_, String>(3)?,
                "studentCount": r.get::<_, i64>(4)?,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    ok(&req.id, json!({ "classes": classes }))
}

fn handle_students_upsert(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let class_id = match required_str(req, "classId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let last_name = match required_str(req, "lastName") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let first_name = match required_str(req, "firstName") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let track = optional_str(req, "track").map(|t| normalize_key(&t));
    let active = req
        .params
        .get("active")
        .and_then(|v| v.as_bool())
        .unwrap_or(true);

    if let Err(e) = store::load_class(conn, &class_id) {
        return calc_err(&req.id, e);
    }

    let student_id = optional_str(req, "studentId").unwrap_or_else(|| Uuid::new_v4().to_string());
    let existing_class: Option<String> = match conn
        .query_row(
            "SELECT class_id FROM students WHERE id = ?",
            [&student_id],
            |r| r.get(0),
        )
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if let Some(other) = existing_class.as_deref() {
        if other != class_id {
            return err(
                &req.id,
                "bad_params",
                "student belongs to another class",
                Some(json!({ "classId": other })),
            );
        }
    }

    let sort_order_req = req.params.get("sortOrder").and_then(|v| v.as_i64());

    let res = if existing_class.is_some() {
        conn.execute(
            "UPDATE students
             SET last_name = ?, first_name = ?, track = ?, active = ?,
                 sort_order = COALESCE(?, sort_order), updated_at = ?
             WHERE id = ?",
            (
                &last_name,
                &first_name,
                track.as_deref(),
                active as i64,
                sort_order_req,
                chrono::Utc::now().to_rfc3339(),
                &student_id,
            ),
        )
    } else {
        let sort_order = match sort_order_req {
            Some(v) => v,
            None => match conn.query_row(
                "SELECT COALESCE(MAX(sort_order), -1) + 1 FROM students WHERE class_id = ?",
                [&class_id],
                |r| r.get::<_, i64>(0),
            ) {
                Ok(v) => v,
                Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
            },
        };
        conn.execute(
            "INSERT INTO students(id, class_id, last_name, first_name, track, active, sort_order, updated_at)
             VALUES(?, ?, ?, ?, ?, ?, ?, ?)",
            (
                &student_id,
                &class_id,
                &last_name,
                &first_name,
                track.as_deref(),
                active as i64,
                sort_order,
                chrono::Utc::now().to_rfc3339(),
            ),
        )
    };
    if let Err(e) = res {
        return err(
            &req.id,
            "db_update_failed",
            e.to_string(),
            Some(json!({ "table": "students" })),
        );
    }
    ok(&req.id, json!({ "studentId": student_id }))
}

fn handle_students_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let class_id = match required_str(req, "classId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let class = match store::load_class(conn, &class_id) {
        Ok(c) => c,
        Err(e) => return calc_err(&req.id, e),
    };
    match store::load_students(conn, &class) {
        Ok(students) => ok(&req.id, json!({ "class": class, "students": students })),
        Err(e) => calc_err(&req.id, e),
    }
}

fn handle_subjects_upsert(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let name = match required_str(req, "name") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let subject_id = optional_str(req, "subjectId").unwrap_or_else(|| Uuid::new_v4().to_string());
    let sort_order = match req.params.get("sortOrder").and_then(|v| v.as_i64()) {
        Some(v) => v,
        None => match conn.query_row(
            "SELECT COALESCE(MAX(sort_order), -1) + 1 FROM subjects",
            [],
            |r| r.get::<_, i64>(0),
        ) {
            Ok(v) => v,
            Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
        },
    };

    if let Err(e) = conn.execute(
        "INSERT INTO subjects(id, name, sort_order) VALUES(?, ?, ?)
         ON CONFLICT(id) DO UPDATE SET name = excluded.name, sort_order = excluded.sort_order",
        (&subject_id, &name, sort_order),
    ) {
        return err(
            &req.id,
            "db_update_failed",
            e.to_string(),
            Some(json!({ "table": "subjects" })),
        );
    }
    ok(&req.id, json!({ "subjectId": subject_id }))
}

fn handle_subjects_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    match store::load_subjects(conn) {
        Ok(subjects) => {
            let rows: Vec<serde_json::Value> = subjects
                .into_iter()
                .map(|s| json!({ "id": s.id, "name": s.name, "sortOrder": s.sort_order }))
                .collect();
            ok(&req.id, json!({ "subjects": rows }))
        }
        Err(e) => calc_err(&req.id, e),
    }
}

fn handle_coefficients_set(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let subject_id = match required_str(req, "subjectId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let level = match required_str(req, "level") {
        Ok(v) => normalize_key(&v),
        Err(e) => return e,
    };
    let track = optional_str(req, "track")
        .map(|t| normalize_key(&t))
        .unwrap_or_else(|| ANY_TRACK.to_string());
    let coefficient = match optional_f64(req, "coefficient") {
        Ok(Some(v)) if v >= 0.0 => v,
        Ok(Some(v)) => {
            return err(
                &req.id,
                "bad_params",
                "coefficient must be >= 0",
                Some(json!({ "coefficient": v })),
            )
        }
        Ok(None) => return err(&req.id, "bad_params", "missing coefficient", None),
        Err(e) => return e,
    };

    let known: Option<i64> = match conn
        .query_row("SELECT 1 FROM subjects WHERE id = ?", [&subject_id], |r| r.get(0))
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if known.is_none() {
        return err(&req.id, "not_found", "subject not found", None);
    }

    if let Err(e) = conn.execute(
        "INSERT INTO subject_coefficients(subject_id, level, track, coefficient) VALUES(?, ?, ?, ?)
         ON CONFLICT(subject_id, level, track) DO UPDATE SET coefficient = excluded.coefficient",
        (&subject_id, &level, &track, coefficient),
    ) {
        return err(
            &req.id,
            "db_update_failed",
            e.to_string(),
            Some(json!({ "table": "subject_coefficients" })),
        );
    }

    // Cards ranked under the old table no longer match it.
    let affected = match store::ranked_cards_for_coefficient(conn, &level, &track) {
        Ok(v) => v,
        Err(e) => return calc_err(&req.id, e),
    };
    let lc = match lifecycle(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let mut stale = 0;
    for (key, student_id) in &affected {
        match lc.mark_stale(key, student_id) {
            Ok(true) => stale += 1,
            Ok(false) => {}
            Err(e) => return calc_err(&req.id, e),
        }
    }
    ok(
        &req.id,
        json!({
            "subjectId": subject_id,
            "level": level,
            "track": track,
            "coefficient": coefficient,
            "staleCards": stale,
        }),
    )
}

fn handle_coefficients_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let level = optional_str(req, "level").map(|l| normalize_key(&l));
    match store::load_coefficient_rows(conn) {
        Ok(rows) => {
            let rows: Vec<serde_json::Value> = rows
                .into_iter()
                .filter(|r| level.as_ref().map(|l| *l == r.level).unwrap_or(true))
                .map(|r| {
                    json!({
                        "subjectId": r.subject_id,
                        "level": r.level,
                        "track": r.track,
                        "coefficient": r.coefficient,
                    })
                })
                .collect();
            ok(&req.id, json!({ "coefficients": rows }))
        }
        Err(e) => calc_err(&req.id, e),
    }
}

fn handle_coefficients_resolve(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let subject_id = match required_str(req, "subjectId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let level = match required_str(req, "level") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let track = optional_str(req, "track").unwrap_or_else(|| ANY_TRACK.to_string());
    match store::load_coefficients(conn) {
        Ok(table) => {
            let coefficient = table.resolve(&subject_id, &level, &track);
            ok(
                &req.id,
                json!({ "coefficient": coefficient, "applicable": coefficient > 0.0 }),
            )
        }
        Err(e) => calc_err(&req.id, e),
    }
}

fn parse_weight_percent(req: &Request) -> Result<Option<f64>, serde_json::Value> {
    match optional_f64(req, "weightPercent")? {
        Some(v) if v > 0.0 && v <= 100.0 => Ok(Some(v)),
        Some(v) => Err(err(
            &req.id,
            "bad_params",
            "weightPercent must be in (0, 100]",
            Some(json!({ "weightPercent": v })),
        )),
        None => Ok(None),
    }
}

fn parse_non_negative(req: &Request, key: &str) -> Result<Option<f64>, serde_json::Value> {
    match optional_f64(req, key)? {
        Some(v) if v >= 0.0 => Ok(Some(v)),
        Some(v) => Err(err(
            &req.id,
            "bad_params",
            format!("{} must be >= 0", key),
            Some(json!({ "value": v })),
        )),
        None => Ok(None),
    }
}

fn parse_max_score(req: &Request) -> Result<Option<f64>, serde_json::Value> {
    match optional_f64(req, "maxScore")? {
        Some(v) if v > 0.0 => Ok(Some(v)),
        Some(v) => Err(err(
            &req.id,
            "bad_params",
            "maxScore must be > 0",
            Some(json!({ "maxScore": v })),
        )),
        None => Ok(None),
    }
}

fn handle_evaluations_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let key = match period_key(req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let subject_id = match required_str(req, "subjectId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let title = match required_str(req, "title") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let kind = match optional_str(req, "kind") {
        None => EvaluationKind::Exam,
        Some(raw) => match EvaluationKind::parse(&raw) {
            Some(k) => k,
            None => {
                return err(
                    &req.id,
                    "bad_params",
                    "kind must be one of: quiz, exam, continuous",
                    Some(json!({ "kind": raw })),
                )
            }
        },
    };
    let status = match optional_str(req, "status") {
        None => EvaluationStatus::Planned,
        Some(raw) => match EvaluationStatus::parse(&raw) {
            Some(s) => s,
            None => {
                return err(
                    &req.id,
                    "bad_params",
                    "status must be one of: planned, ongoing, completed, cancelled",
                    Some(json!({ "status": raw })),
                )
            }
        },
    };
    let coefficient = match parse_non_negative(req, "coefficient") {
        Ok(v) => v.unwrap_or(1.0),
        Err(e) => return e,
    };
    let weight_percent = match parse_weight_percent(req) {
        Ok(v) => v.unwrap_or(100.0),
        Err(e) => return e,
    };
    let max_score = match parse_max_score(req) {
        Ok(v) => v.unwrap_or(state.grading.scale),
        Err(e) => return e,
    };

    if let Err(e) = store::load_class(conn, &key.class_id) {
        return calc_err(&req.id, e);
    }
    let known: Option<i64> = match conn
        .query_row("SELECT 1 FROM subjects WHERE id = ?", [&subject_id], |r| r.get(0))
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if known.is_none() {
        return err(&req.id, "not_found", "subject not found", None);
    }

    let idx: i64 = match conn.query_row(
        "SELECT COALESCE(MAX(idx), -1) + 1 FROM evaluations WHERE class_id = ? AND year = ? AND period = ?",
        (&key.class_id, &key.year, key.period),
        |r| r.get(0),
    ) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let evaluation_id = Uuid::new_v4().to_string();
    if let Err(e) = conn.execute(
        "INSERT INTO evaluations(
           id, class_id, subject_id, year, period, idx, title, kind,
           coefficient, weight_percent, max_score, status
         ) VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        (
            &evaluation_id,
            &key.class_id,
            &subject_id,
            &key.year,
            key.period,
            idx,
            &title,
            kind.as_str(),
            coefficient,
            weight_percent,
            max_score,
            status.as_str(),
        ),
    ) {
        return err(
            &req.id,
            "db_insert_failed",
            e.to_string(),
            Some(json!({ "table": "evaluations" })),
        );
    }
    ok(&req.id, json!({ "evaluationId": evaluation_id }))
}

/// Mark every graded student's card of the evaluation's period as stale.
fn mark_evaluation_stale(
    state: &AppState,
    req: &Request,
    key: &PeriodKey,
    students: &[String],
) -> Result<usize, serde_json::Value> {
    let lc = lifecycle(state, req)?;
    let mut n = 0;
    for sid in students {
        if lc.mark_stale(key, sid).map_err(|e| calc_err(&req.id, e))? {
            n += 1;
        }
    }
    Ok(n)
}

fn handle_evaluations_update(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let evaluation_id = match required_str(req, "evaluationId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let (key, mut evaluation) = match store::load_evaluation(conn, &evaluation_id) {
        Ok(v) => v,
        Err(e) => return calc_err(&req.id, e),
    };

    if let Some(title) = optional_str(req, "title") {
        evaluation.title = title;
    }
    match parse_non_negative(req, "coefficient") {
        Ok(Some(v)) => evaluation.coefficient = v,
        Ok(None) => {}
        Err(e) => return e,
    }
    match parse_weight_percent(req) {
        Ok(Some(v)) => evaluation.weight_percent = v,
        Ok(None) => {}
        Err(e) => return e,
    }
    match parse_max_score(req) {
        Ok(Some(v)) => evaluation.max_score = v,
        Ok(None) => {}
        Err(e) => return e,
    }

    let tx = match conn.unchecked_transaction() {
        Ok(t) => t,
        Err(e) => return err(&req.id, "db_tx_failed", e.to_string(), None),
    };
    if let Err(e) = tx.execute(
        "UPDATE evaluations SET title = ?, coefficient = ?, weight_percent = ?, max_score = ? WHERE id = ?",
        (
            &evaluation.title,
            evaluation.coefficient,
            evaluation.weight_percent,
            evaluation.max_score,
            &evaluation.id,
        ),
    ) {
        return err(
            &req.id,
            "db_update_failed",
            e.to_string(),
            Some(json!({ "table": "evaluations" })),
        );
    }
    // Derived grade fields follow the new coefficient and weight.
    let touched = match store::rescore_evaluation(&tx, &evaluation) {
        Ok(v) => v,
        Err(e) => return calc_err(&req.id, e),
    };
    if let Err(e) = tx.commit() {
        return err(&req.id, "db_commit_failed", e.to_string(), None);
    }

    let stale = match mark_evaluation_stale(state, req, &key, &touched) {
        Ok(n) => n,
        Err(e) => return e,
    };
    ok(
        &req.id,
        json!({ "evaluationId": evaluation.id, "rescored": touched.len(), "staleCards": stale }),
    )
}

fn handle_evaluations_set_status(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let evaluation_id = match required_str(req, "evaluationId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let raw = match required_str(req, "status") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let Some(to) = EvaluationStatus::parse(&raw) else {
        return err(
            &req.id,
            "bad_params",
            "status must be one of: planned, ongoing, completed, cancelled",
            Some(json!({ "status": raw })),
        );
    };
    let (key, evaluation) = match store::load_evaluation(conn, &evaluation_id) {
        Ok(v) => v,
        Err(e) => return calc_err(&req.id, e),
    };
    let next = match evaluation.status.transition(to) {
        Ok(s) => s,
        Err(e) => return calc_err(&req.id, e),
    };
    if next == evaluation.status {
        return ok(
            &req.id,
            json!({ "evaluationId": evaluation_id, "status": next, "staleCards": 0 }),
        );
    }
    if let Err(e) = conn.execute(
        "UPDATE evaluations SET status = ? WHERE id = ?",
        (next.as_str(), &evaluation_id),
    ) {
        return err(&req.id, "db_update_failed", e.to_string(), None);
    }
    tracing::debug!(
        evaluation_id = %evaluation_id,
        from = evaluation.status.as_str(),
        to = next.as_str(),
        "evaluation status changed"
    );

    // Cancelling drops the evaluation from every average it was part of.
    let mut stale = 0;
    if next == EvaluationStatus::Cancelled {
        let students: Vec<String> = match store::list_grades(conn, &evaluation_id) {
            Ok(rows) => rows.into_iter().map(|g| g.student_id).collect(),
            Err(e) => return calc_err(&req.id, e),
        };
        stale = match mark_evaluation_stale(state, req, &key, &students) {
            Ok(n) => n,
            Err(e) => return e,
        };
    }
    ok(
        &req.id,
        json!({ "evaluationId": evaluation_id, "status": next, "staleCards": stale }),
    )
}

fn handle_evaluations_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let key = match period_key(req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    match store::load_evaluations(conn, &key) {
        Ok(evaluations) => {
            let rows: Vec<serde_json::Value> = evaluations
                .into_iter()
                .map(|e| {
                    json!({
                        "id": e.id,
                        "subjectId": e.subject_id,
                        "title": e.title,
                        "kind": e.kind,
                        "coefficient": e.coefficient,
                        "weightPercent": e.weight_percent,
                        "maxScore": e.max_score,
                        "status": e.status,
                    })
                })
                .collect();
            ok(&req.id, json!({ "evaluations": rows }))
        }
        Err(e) => calc_err(&req.id, e),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "classes.create" => Some(handle_classes_create(state, req)),
        "classes.list" => Some(handle_classes_list(state, req)),
        "students.upsert" => Some(handle_students_upsert(state, req)),
        "students.list" => Some(handle_students_list(state, req)),
        "subjects.upsert" => Some(handle_subjects_upsert(state, req)),
        "subjects.list" => Some(handle_subjects_list(state, req)),
        "coefficients.set" => Some(handle_coefficients_set(state, req)),
        "coefficients.list" => Some(handle_coefficients_list(state, req)),
        "coefficients.resolve" => Some(handle_coefficients_resolve(state, req)),
        "evaluations.create" => Some(handle_evaluations_create(state, req)),
        "evaluations.update" => Some(handle_evaluations_update(state, req)),
        "evaluations.setStatus" => Some(handle_evaluations_set_status(state, req)),
        "evaluations.list" => Some(handle_evaluations_list(state, req)),
        _ => None,
    }
}
