use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Condvar, Mutex, PoisonError};
use std::thread;

use anyhow::{Result, anyhow};

type Task<'a> = Box<dyn FnOnce() -> Result<()> + Send + 'a>;

pub struct Unit<'a> {
    pub name: String,
    task: Task<'a>,
}

impl<'a> Unit<'a> {
    pub fn new(name: impl Into<String>, task: impl FnOnce() -> Result<()> + Send + 'a) -> Self {
        Self {
            name: name.into(),
            task: Box::new(task),
        }
    }
}

#[derive(Debug)]
pub struct UnitError {
    pub unit: String,
    pub error: anyhow::Error,
}

/// Counting semaphore. Permits are returned when the guard drops, including
/// during unwinding.
pub struct Admission {
    free: Mutex<usize>,
    released: Condvar,
}

impl Admission {
    pub fn new(slots: usize) -> Self {
        Self {
            free: Mutex::new(slots.max(1)),
            released: Condvar::new(),
        }
    }

    pub fn acquire(&self) -> Permit<'_> {
        let mut free = self.free.lock().unwrap_or_else(PoisonError::into_inner);
        while *free == 0 {
            free = self
                .released
                .wait(free)
                .unwrap_or_else(PoisonError::into_inner);
        }
        *free -= 1;
        Permit { gate: self }
    }
}

pub struct Permit<'a> {
    gate: &'a Admission,
}

impl Drop for Permit<'_> {
    fn drop(&mut self) {
        let mut free = self
            .gate
            .free
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        *free += 1;
        self.gate.released.notify_one();
    }
}

/// Runs every unit to completion, at most `limit` at a time when `parallel`,
/// and returns the failures in submission order.
pub fn run(units: Vec<Unit<'_>>, limit: usize, parallel: bool) -> Vec<UnitError> {
    if !parallel || units.len() <= 1 {
        return run_sequential(units);
    }

    let admission = Admission::new(limit);
    let errors: Mutex<Vec<(usize, UnitError)>> = Mutex::new(Vec::new());

    thread::scope(|scope| {
        for (index, unit) in units.into_iter().enumerate() {
            let admission = &admission;
            let errors = &errors;
            scope.spawn(move || {
                let _permit = admission.acquire();
                tracing::debug!(unit = %unit.name, "unit started");
                if let Err(error) = run_unit(unit.task) {
                    tracing::debug!(unit = %unit.name, error = %error, "unit failed");
                    errors
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .push((
                            index,
                            UnitError {
                                unit: unit.name,
                                error,
                            },
                        ));
                }
            });
        }
    });

    let mut errors = errors.into_inner().unwrap_or_else(PoisonError::into_inner);
    errors.sort_by_key(|(index, _)| *index);
    errors.into_iter().map(|(_, e)| e).collect()
}

fn run_sequential(units: Vec<Unit<'_>>) -> Vec<UnitError> {
    let mut errors = Vec::new();
    for unit in units {
        tracing::debug!(unit = %unit.name, "unit started");
        if let Err(error) = run_unit(unit.task) {
            errors.push(UnitError {
                unit: unit.name,
                error,
            });
        }
    }
    errors
}

fn run_unit(task: Task<'_>) -> Result<()> {
    match catch_unwind(AssertUnwindSafe(task)) {
        Ok(result) => result,
        Err(panic) => {
            let msg = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            Err(anyhow!("unit panicked: {msg}"))
        }
    }
}
