//! A generic ordered-strategy executor.
//!
//! Some device operations have several possible implementations of
//! decreasing preference (e.g. a 64-bit partial read, then a 32-bit one,
//! then reading the whole object). A [`Ladder`] holds those strategies as
//! ordered rungs, runs them against a mutable context until one succeeds,
//! and records `{label, outcome, duration}` for every attempt so the caller
//! can surface exactly what was tried.
//!
//! Rules:
//! * Disabled rungs are skipped entirely and never appear in the log.
//! * The first success wins; its value and the attempt log are returned.
//! * If every enabled rung fails, the *last* rung's error is surfaced.
//! * An error matching the ladder's `fatal_when` predicate aborts the
//!   descent immediately: falling through would mask a real failure (an
//!   object that does not exist is not an unsupported operation).

use core::fmt::Display;
use std::time::{Duration, Instant};

use log::{debug, trace};


/// The outcome of one executed rung.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AttemptOutcome {
    Succeeded,
    /// The rung failed; carries the rendered error for diagnostics.
    Failed(String),
}

/// One executed rung: what ran, how it went, how long it took.
#[derive(Clone, Debug)]
pub struct Attempt {
    pub label: &'static str,
    pub outcome: AttemptOutcome,
    pub elapsed: Duration,
}

impl Attempt {
    pub fn succeeded(&self) -> bool {
        self.outcome == AttemptOutcome::Succeeded
    }
}

/// Why a ladder produced no value.
#[derive(Debug)]
pub enum LadderError<E> {
    /// Every enabled rung failed; carries the last rung's error.
    Exhausted(E),
    /// A rung failed with an error the ladder's `fatal_when` predicate
    /// flagged as final.
    Fatal(E),
    /// No rung was enabled at all.
    NoStrategy,
}

impl<E> LadderError<E> {
    /// The underlying error, when one exists.
    pub fn into_inner(self) -> Option<E> {
        match self {
            LadderError::Exhausted(e) | LadderError::Fatal(e) => Some(e),
            LadderError::NoStrategy => None,
        }
    }
}

/// The result of running a ladder: the value (or terminal error) plus the
/// complete attempt log.
#[derive(Debug)]
pub struct LadderOutcome<T, E> {
    pub result: Result<T, LadderError<E>>,
    pub attempts: Vec<Attempt>,
}

struct Rung<C, T, E> {
    label: &'static str,
    enabled: bool,
    run: Box<dyn FnMut(&mut C) -> Result<T, E> + Send>,
}

/// An ordered list of strategies for one operation.
pub struct Ladder<C, T, E> {
    name: &'static str,
    rungs: Vec<Rung<C, T, E>>,
    fatal_when: Option<Box<dyn Fn(&E) -> bool + Send>>,
}

impl<C, T, E: Display> Ladder<C, T, E> {
    pub fn new(name: &'static str) -> Self {
        Ladder {
            name,
            rungs: Vec::new(),
            fatal_when: None,
        }
    }

    /// Appends an always-enabled rung.
    pub fn rung<F>(self, label: &'static str, run: F) -> Self
    where
        F: FnMut(&mut C) -> Result<T, E> + Send + 'static,
    {
        self.rung_if(true, label, run)
    }

    /// Appends a rung that only participates when `enabled` holds. Policy
    /// flags use this to pick the starting rung.
    pub fn rung_if<F>(mut self, enabled: bool, label: &'static str, run: F) -> Self
    where
        F: FnMut(&mut C) -> Result<T, E> + Send + 'static,
    {
        self.rungs.push(Rung {
            label,
            enabled,
            run: Box::new(run),
        });
        self
    }

    /// Declares which errors abort the descent instead of falling through.
    pub fn fatal_when<F>(mut self, pred: F) -> Self
    where
        F: Fn(&E) -> bool + Send + 'static,
    {
        self.fatal_when = Some(Box::new(pred));
        self
    }

    /// Runs the enabled rungs in order against `ctx`.
    pub fn run(mut self, ctx: &mut C) -> LadderOutcome<T, E> {
        let mut attempts = Vec::new();
        let mut last_err: Option<E> = None;
        for rung in &mut self.rungs {
            if !rung.enabled {
                trace!("{}: skipping disabled rung {}", self.name, rung.label);
                continue;
            }
            let start = Instant::now();
            match (rung.run)(ctx) {
                Ok(value) => {
                    attempts.push(Attempt {
                        label: rung.label,
                        outcome: AttemptOutcome::Succeeded,
                        elapsed: start.elapsed(),
                    });
                    debug!(
                        "{}: rung {} succeeded after {} attempt(s)",
                        self.name,
                        rung.label,
                        attempts.len()
                    );
                    return LadderOutcome {
                        result: Ok(value),
                        attempts,
                    };
                }
                Err(e) => {
                    attempts.push(Attempt {
                        label: rung.label,
                        outcome: AttemptOutcome::Failed(e.to_string()),
                        elapsed: start.elapsed(),
                    });
                    debug!("{}: rung {} failed: {}", self.name, rung.label, e);
                    if self.fatal_when.as_ref().is_some_and(|f| f(&e)) {
                        return LadderOutcome {
                            result: Err(LadderError::Fatal(e)),
                            attempts,
                        };
                    }
                    last_err = Some(e);
                }
            }
        }
        LadderOutcome {
            result: Err(match last_err {
                Some(e) => LadderError::Exhausted(e),
                None => LadderError::NoStrategy,
            }),
            attempts,
        }
    }
}
