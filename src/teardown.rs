//! Reverse-order release list.
//!
//! Every acquisition step pushes the matching release step. `run` executes
//! them newest first, exactly once, and keeps going when a step fails so a
//! broken unmount never strands the lock or the loop device behind it.

use log::{debug, warn};
use std::fmt::Debug;

pub struct Teardown<A> {
    steps: Vec<A>,
    done: bool,
}

impl<A: Debug> Teardown<A> {
    pub fn new() -> Self {
        Self {
            steps: Vec::new(),
            done: false,
        }
    }

    /// Record a release step. Steps pushed later run earlier.
    pub fn push(&mut self, step: A) {
        self.steps.push(step);
    }

    /// Pending steps, in the order they will run.
    pub fn pending(&self) -> impl Iterator<Item = &A> {
        self.steps.iter().rev()
    }

    pub fn is_done(&self) -> bool {
        self.done
    }

    /// Run every pending step newest first. Returns the failures; they are
    /// also logged. A second call is a no-op.
    pub fn run<F>(&mut self, mut release: F) -> Vec<anyhow::Error>
    where
        F: FnMut(&A) -> anyhow::Result<()>,
    {
        let mut failures = Vec::new();
        if self.done {
            return failures;
        }
        self.done = true;

        while let Some(step) = self.steps.pop() {
            debug!("teardown: {:?}", step);
            if let Err(e) = release(&step) {
                warn!("teardown step {:?} failed: {:#}", step, e);
                failures.push(e);
            }
        }
        failures
    }
}

impl<A: Debug> Default for Teardown<A> {
    fn default() -> Self {
        Self::new()
    }
}
