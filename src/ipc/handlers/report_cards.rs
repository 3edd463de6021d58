use crate::calc::CardStatus;
use crate::ipc::error::{calc_err, err, ok};
use crate::ipc::helpers::{lifecycle, period_key, required_str};
use crate::ipc::types::{AppState, Request};
use crate::ranking;
use serde_json::json;

fn handle_generate_student(state: &mut AppState, req: &Request) -> serde_json::Value {
    let lc = match lifecycle(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let key = match period_key(req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let student_id = match required_str(req, "studentId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    match lc.generate_student(&key, &student_id) {
        Ok(card) => ok(&req.id, json!({ "reportCard": card })),
        Err(e) => calc_err(&req.id, e),
    }
}

fn handle_generate_class(state: &mut AppState, req: &Request) -> serde_json::Value {
    let lc = match lifecycle(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let key = match period_key(req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let rank_after = req
        .params
        .get("rank")
        .and_then(|v| v.as_bool())
        .unwrap_or(false);

    let generated = match lc.generate_class(&key) {
        Ok(v) => v,
        Err(e) => return calc_err(&req.id, e),
    };
    let cards = if rank_after {
        match lc.rank_class(&key) {
            Ok(v) => v,
            Err(e) => return calc_err(&req.id, e),
        }
    } else {
        generated
    };
    ok(
        &req.id,
        json!({ "ranked": rank_after, "count": cards.len(), "reportCards": cards }),
    )
}

fn handle_rank_class(state: &mut AppState, req: &Request) -> serde_json::Value {
    let lc = match lifecycle(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let key = match period_key(req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    match lc.rank_class(&key) {
        Ok(cards) => {
            let stats = ranking::class_stats(&cards);
            ok(&req.id, json!({ "stats": stats, "reportCards": cards }))
        }
        Err(e) => calc_err(&req.id, e),
    }
}

fn handle_get(state: &mut AppState, req: &Request) -> serde_json::Value {
    let lc = match lifecycle(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let key = match period_key(req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let student_id = match required_str(req, "studentId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    match lc.get_card(&key, &student_id) {
        Ok(Some(card)) => ok(&req.id, json!({ "reportCard": card })),
        Ok(None) => err(
            &req.id,
            "not_found",
            "report card not generated",
            Some(json!({ "studentId": student_id })),
        ),
        Err(e) => calc_err(&req.id, e),
    }
}

fn handle_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let lc = match lifecycle(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let key = match period_key(req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    match lc.list_cards(&key) {
        Ok(mut cards) => {
            // Ranked cards read best first; drafts keep roster order.
            if !cards.is_empty() && cards.iter().all(|c| c.status == CardStatus::Ranked) {
                cards.sort_by_key(|c| c.rank);
            }
            ok(&req.id, json!({ "reportCards": cards }))
        }
        Err(e) => calc_err(&req.id, e),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "reportCards.generateStudent" => Some(handle_generate_student(state, req)),
        "reportCards.generateClass" => Some(handle_generate_class(state, req)),
        "reportCards.rankClass" => Some(handle_rank_class(state, req)),
        "reportCards.get" => Some(handle_get(state, req)),
        "reportCards.list" => Some(handle_list(state, req)),
        _ => None,
    }
}
