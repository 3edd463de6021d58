//! Report card lifecycle: absent -> draft -> ranked.
//!
//! Per-student generation writes a draft. Only a ranking pass makes rank and
//! class statistics valid, and nothing re-ranks on its own; after a batch of
//! grade writes the caller runs `rank_class` once.

use crate::calc::{build_report_card, ClassInputs, PeriodKey, ReportCard, StudentInput};
use crate::coeff::CoefficientResolver;
use crate::config::GradingSettings;
use crate::error::{CalcError, CalcResult};
use crate::ranking;
use crate::store;
use rusqlite::Connection;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// One coarse lock per (class, year, period). Generation and ranking of the
/// same period never interleave.
#[derive(Debug, Default)]
pub struct ClassLocks {
    inner: Mutex<HashMap<PeriodKey, Arc<Mutex<()>>>>,
}

impl ClassLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lock_for(&self, key: &PeriodKey) -> CalcResult<Arc<Mutex<()>>> {
        let mut map = self
            .inner
            .lock()
            .map_err(|_| CalcError::Invariant("class lock registry poisoned".into()))?;
        Ok(map.entry(key.clone()).or_default().clone())
    }

    /// Run `f` while holding the lock for `key`.
    pub fn with_lock<T>(&self, key: &PeriodKey, f: impl FnOnce() -> CalcResult<T>) -> CalcResult<T> {
        let lock = self.lock_for(key)?;
        let _guard = lock
            .lock()
            .map_err(|_| CalcError::Invariant("class lock poisoned".into()))?;
        f()
    }
}

/// Build the cards of every student in `inputs`, spreading students over up
/// to `workers` threads. Output keeps the input student order.
pub fn compute_cards(
    inputs: &ClassInputs,
    resolver: &(dyn CoefficientResolver + Sync),
    settings: &GradingSettings,
) -> CalcResult<Vec<ReportCard>> {
    let students = &inputs.students;
    if students.is_empty() {
        return Ok(Vec::new());
    }

    let build = |s: &StudentInput| {
        build_report_card(
            &inputs.key,
            &inputs.subjects,
            &inputs.evaluations,
            s,
            resolver,
            settings.scale,
        )
    };

    let workers = settings.workers.max(1).min(students.len());
    if workers == 1 {
        return students.iter().map(build).collect();
    }

    let chunk_size = students.len().div_ceil(workers);
    let chunks: Vec<CalcResult<Vec<ReportCard>>> = std::thread::scope(|scope| {
        let handles: Vec<_> = students
            .chunks(chunk_size)
            .map(|chunk| {
                scope.spawn(move || chunk.iter().map(build).collect::<CalcResult<Vec<_>>>())
            })
            .collect();
        handles
            .into_iter()
            .map(|h| {
                h.join()
                    .unwrap_or_else(|_| Err(CalcError::Invariant("card worker panicked".into())))
            })
            .collect()
    });

    let mut cards = Vec::with_capacity(students.len());
    for chunk in chunks {
        cards.extend(chunk?);
    }
    Ok(cards)
}

pub struct ReportCardLifecycle<'a> {
    conn: &'a Connection,
    locks: &'a ClassLocks,
    settings: &'a GradingSettings,
}

impl<'a> ReportCardLifecycle<'a> {
    pub fn new(conn: &'a Connection, locks: &'a ClassLocks, settings: &'a GradingSettings) -> Self {
        Self {
            conn,
            locks,
            settings,
        }
    }

    /// absent|draft|ranked -> draft for one student.
    pub fn generate_student(&self, key: &PeriodKey, student_id: &str) -> CalcResult<ReportCard> {
        self.locks.with_lock(key, || {
            let inputs = store::load_class_inputs(self.conn, key, Some(student_id))?;
            let table = store::load_coefficients(self.conn)?;
            let card = compute_cards(&inputs, &table, self.settings)?
                .into_iter()
                .next()
                .ok_or_else(|| CalcError::NotFound("student".into()))?;

            let tx = self.conn.unchecked_transaction()?;
            let stored = store::upsert_card(&tx, &card)?;
            tx.commit()?;

            tracing::debug!(
                class_id = %key.class_id,
                year = %key.year,
                period = key.period,
                student_id,
                overall_average = stored.overall_average,
                incomplete = stored.incomplete,
                "report card generated"
            );
            Ok(stored)
        })
    }

    /// Regenerate every active student's card. Does not rank.
    pub fn generate_class(&self, key: &PeriodKey) -> CalcResult<Vec<ReportCard>> {
        self.locks.with_lock(key, || {
            let inputs = store::load_class_inputs(self.conn, key, None)?;
            let table = store::load_coefficients(self.conn)?;
            let cards = compute_cards(&inputs, &table, self.settings)?;

            let tx = self.conn.unchecked_transaction()?;
            let mut stored = Vec::with_capacity(cards.len());
            for card in &cards {
                stored.push(store::upsert_card(&tx, card)?);
            }
            tx.commit()?;

            tracing::info!(
                class_id = %key.class_id,
                year = %key.year,
                period = key.period,
                students = stored.len(),
                "class report cards generated"
            );
            Ok(stored)
        })
    }

    /// draft -> ranked for every card of the period. An empty class is a no-op.
    pub fn rank_class(&self, key: &PeriodKey) -> CalcResult<Vec<ReportCard>> {
        self.locks.with_lock(key, || {
            let tx = self.conn.unchecked_transaction()?;
            let cards = store::load_cards(&tx, key)?;
            if cards.is_empty() {
                tracing::info!(class_id = %key.class_id, period = key.period, "nothing to rank");
                return Ok(Vec::new());
            }

            let ranked = ranking::rank_class(cards);
            store::save_ranking(&tx, &ranked)?;
            tx.commit()?;

            tracing::info!(
                class_id = %key.class_id,
                year = %key.year,
                period = key.period,
                class_size = ranked.len(),
                class_average = ranked.first().map(|c| c.class_average).unwrap_or(0.0),
                "class ranked"
            );
            Ok(ranked)
        })
    }

    /// ranked -> draft after a grade write. Returns false if there is no card
    /// yet or it is already a draft.
    pub fn mark_stale(&self, key: &PeriodKey, student_id: &str) -> CalcResult<bool> {
        self.locks.with_lock(key, || {
            let changed = store::mark_stale(self.conn, key, student_id)?;
            if changed {
                tracing::debug!(class_id = %key.class_id, student_id, "report card marked stale");
            }
            Ok(changed)
        })
    }

    pub fn get_card(&self, key: &PeriodKey, student_id: &str) -> CalcResult<Option<ReportCard>> {
        store::load_card(self.conn, key, student_id)
    }

    pub fn list_cards(&self, key: &PeriodKey) -> CalcResult<Vec<ReportCard>> {
        store::load_cards(self.conn, key)
    }
}
