//! "Choose-your-own-schedule" mode.
//!
//! The driver only knows about a [`SelectionPolicy`]; the terminal-driven
//! selector and the scripted one used by tests both live here.

use std::io::{BufRead, Write};
use std::rc::Rc;

use tessera_ir::FunctionDAG;

use crate::state::State;

/// Picks which state survives an expansion round in interactive mode.
pub trait SelectionPolicy {
    fn select(&mut self, dag: &FunctionDAG, states: &[Rc<State>]) -> usize;
}

/// Prints every state with a numeric label and reads a selection from
/// standard input, re-prompting until the input names a valid index.
#[derive(Debug, Default)]
pub struct StdinSelector;

impl SelectionPolicy for StdinSelector {
    fn select(&mut self, dag: &FunctionDAG, states: &[Rc<State>]) -> usize {
        let mut out = std::io::stdout();
        let _ = writeln!(out, "\n--------------------\nSelect a schedule:");
        for (label, state) in states.iter().enumerate().rev() {
            let _ = writeln!(out, "\n[{label}]:\ncost {:.4}\n{}", state.cost(), state.root.display(dag));
        }

        let stdin = std::io::stdin();
        loop {
            let _ = write!(out, "\nEnter selection: ");
            let _ = out.flush();
            let mut line = String::new();
            match stdin.lock().read_line(&mut line) {
                Ok(0) | Err(_) => {
                    // Closed input: fall back to the best state rather than
                    // spinning on the prompt forever.
                    tracing::warn!("standard input closed during interactive selection, taking state 0");
                    return 0;
                }
                Ok(_) => {}
            }
            if let Ok(choice) = line.trim().parse::<usize>()
                && choice < states.len()
            {
                return choice;
            }
        }
    }
}

/// Replays a fixed sequence of choices, repeating the last one once the
/// sequence runs out. Out-of-range choices clamp to the valid range.
#[derive(Debug, Clone)]
pub struct ScriptedSelector {
    choices: Vec<usize>,
    next: usize,
}

impl ScriptedSelector {
    pub fn new(choices: Vec<usize>) -> Self {
        assert!(!choices.is_empty(), "scripted selector needs at least one choice");
        Self { choices, next: 0 }
    }

    /// Answer every prompt with the same choice.
    pub fn always(choice: usize) -> Self {
        Self::new(vec![choice])
    }
}

impl SelectionPolicy for ScriptedSelector {
    fn select(&mut self, _dag: &FunctionDAG, states: &[Rc<State>]) -> usize {
        let choice = self.choices[self.next.min(self.choices.len() - 1)];
        self.next += 1;
        choice.min(states.len().saturating_sub(1))
    }
}
