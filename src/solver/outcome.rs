//! Folding a solver event stream into the result of one run.

use super::event::SolverEvent;
use crate::store::ProblemType;
use serde::Serialize;

/// What a finished solver run amounts to.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunOutcome {
    pub solved: bool,
    pub problem_type: ProblemType,
    /// Solver-reported milliseconds of the last solution seen.
    pub time_to_solution: Option<f64>,
    pub had_error: bool,
    pub error_message: Option<String>,
    /// Either the solver said it hit the time limit or we killed it for
    /// overrunning.
    pub timed_out: bool,
    /// We killed the solver for overrunning the hard deadline.
    pub hard_timeout: bool,
    /// The run was cut short by a shutdown request.
    pub interrupted: bool,
    pub exit_code: Option<i32>,
    pub events: usize,
    pub malformed_lines: usize,
}

/// How the solver process ended, as seen from outside the event stream.
#[derive(Debug, Clone, Default)]
pub struct ProcessEnding {
    pub exit_code: Option<i32>,
    pub signaled: bool,
    pub hard_timeout: bool,
    pub interrupted: bool,
    /// Last lines of stderr, used when nothing better explains a failure.
    pub stderr_tail: Vec<String>,
}

/// Accumulates the parts of an event stream that decide the outcome.
#[derive(Debug, Default)]
pub struct OutcomeTracker {
    last_solution_time: Option<f64>,
    saw_solution: bool,
    saw_objective: bool,
    optimal: bool,
    conclusive: bool,
    time_limit_marker: bool,
    errors: Vec<String>,
    events: usize,
    malformed_lines: usize,
}

impl OutcomeTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn observe(&mut self, event: &SolverEvent) {
        if let SolverEvent::Malformed { .. } = event {
            self.malformed_lines += 1;
            return;
        }
        self.events += 1;
        match event {
            SolverEvent::Solution { time, .. } => {
                self.saw_solution = true;
                self.saw_objective |= event.has_objective();
                if time.is_some() {
                    self.last_solution_time = *time;
                }
            }
            SolverEvent::Status { .. } => {
                self.optimal |= event.is_optimal();
                self.conclusive |= event.is_conclusive_status();
            }
            SolverEvent::Comment { .. } => {
                self.time_limit_marker |= event.is_time_limit_marker();
            }
            SolverEvent::Error { .. } => {
                if let Some(message) = event.error_message() {
                    self.errors.push(message);
                }
            }
            SolverEvent::Statistics { .. }
            | SolverEvent::Warning { .. }
            | SolverEvent::Unrecognized
            | SolverEvent::Malformed { .. } => {}
        }
    }

    /// Combine the stream with how the process ended.
    ///
    /// A solution seen at any point means solved. Without one, a time-limit
    /// hit or interruption means unsolved, and only a conclusive terminal
    /// status counts as solved.
    pub fn finish(self, ending: ProcessEnding) -> RunOutcome {
        let timed_out = self.time_limit_marker || ending.hard_timeout;
        let solved = if self.saw_solution {
            true
        } else if timed_out || ending.interrupted {
            false
        } else {
            self.conclusive
        };

        let problem_type = if self.optimal || self.saw_objective {
            ProblemType::Opt
        } else if self.saw_solution || self.conclusive {
            ProblemType::Sat
        } else {
            ProblemType::Unknown
        };

        // A non-zero exit after a clean stream is an error only when we did
        // not cause it.
        let abnormal_exit = !ending.hard_timeout
            && !ending.interrupted
            && (ending.signaled || ending.exit_code.is_some_and(|code| code != 0));

        let error_message = if !self.errors.is_empty() {
            Some(self.errors.join("; "))
        } else if abnormal_exit {
            let status = match ending.exit_code {
                Some(code) => format!("solver exited with code {}", code),
                None => "solver was killed by a signal".to_string(),
            };
            Some(match ending.stderr_tail.last() {
                Some(line) => format!("{}: {}", status, line),
                None => status,
            })
        } else {
            None
        };

        RunOutcome {
            solved,
            problem_type,
            time_to_solution: if self.saw_solution {
                self.last_solution_time
            } else {
                None
            },
            had_error: error_message.is_some(),
            error_message,
            timed_out,
            hard_timeout: ending.hard_timeout,
            interrupted: ending.interrupted,
            exit_code: ending.exit_code,
            events: self.events,
            malformed_lines: self.malformed_lines,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(lines: &[&str], ending: ProcessEnding) -> RunOutcome {
        let mut tracker = OutcomeTracker::new();
        for line in lines {
            if let Some(event) = SolverEvent::from_line(line) {
                tracker.observe(&event);
            }
        }
        tracker.finish(ending)
    }

    fn clean_exit() -> ProcessEnding {
        ProcessEnding {
            exit_code: Some(0),
            ..Default::default()
        }
    }

    #[test]
    fn test_solution_then_optimal() {
        let outcome = run(
            &[
                r#"{"type":"solution","output":{},"time":500}"#,
                r#"{"type":"status","status":"OPTIMAL_SOLUTION"}"#,
            ],
            clean_exit(),
        );
        assert!(outcome.solved);
        assert_eq!(outcome.problem_type, ProblemType::Opt);
        assert_eq!(outcome.time_to_solution, Some(500.0));
        assert!(!outcome.had_error);
        assert!(!outcome.timed_out);
    }

    #[test]
    fn test_satisfaction_problem() {
        let outcome = run(
            &[r#"{"type":"solution","output":{"default":"x = 1;"},"time":42}"#],
            clean_exit(),
        );
        assert!(outcome.solved);
        assert_eq!(outcome.problem_type, ProblemType::Sat);
        assert_eq!(outcome.time_to_solution, Some(42.0));
    }

    #[test]
    fn test_last_solution_time_wins() {
        let outcome = run(
            &[
                r#"{"type":"solution","output":{"_objective":9},"time":100}"#,
                r#"{"type":"solution","output":{"_objective":7},"time":350}"#,
                r#"{"type":"comment","comment":"% Time limit exceeded!"}"#,
            ],
            clean_exit(),
        );
        assert!(outcome.solved);
        assert!(outcome.timed_out);
        assert_eq!(outcome.problem_type, ProblemType::Opt);
        assert_eq!(outcome.time_to_solution, Some(350.0));
    }

    #[test]
    fn test_time_limit_without_solution() {
        let outcome = run(
            &[
                r#"{"type":"comment","comment":"% Time limit exceeded!"}"#,
                r#"{"type":"status","status":"UNKNOWN"}"#,
            ],
            clean_exit(),
        );
        assert!(!outcome.solved);
        assert!(outcome.timed_out);
        assert_eq!(outcome.problem_type, ProblemType::Unknown);
        assert_eq!(outcome.time_to_solution, None);
    }

    #[test]
    fn test_unsatisfiable_is_conclusive() {
        let outcome = run(
            &[r#"{"type":"status","status":"UNSATISFIABLE"}"#],
            clean_exit(),
        );
        assert!(outcome.solved);
        assert_eq!(outcome.problem_type, ProblemType::Sat);
        assert_eq!(outcome.time_to_solution, None);
    }

    #[test]
    fn test_hard_timeout_overrides_conclusive_guess() {
        let outcome = run(
            &[r#"{"type":"statistics","statistics":{"nodes":3}}"#],
            ProcessEnding {
                hard_timeout: true,
                signaled: true,
                ..Default::default()
            },
        );
        assert!(!outcome.solved);
        assert!(outcome.timed_out);
        assert!(outcome.hard_timeout);
        // Killing it ourselves is not a solver error.
        assert!(!outcome.had_error);
    }

    #[test]
    fn test_error_event_is_recorded() {
        let outcome = run(
            &[
                r#"{"type":"error","what":"syntax error","message":"unexpected ;"}"#,
                "not json",
            ],
            ProcessEnding {
                exit_code: Some(1),
                ..Default::default()
            },
        );
        assert!(outcome.had_error);
        assert_eq!(
            outcome.error_message.as_deref(),
            Some("syntax error: unexpected ;")
        );
        assert_eq!(outcome.malformed_lines, 1);
        assert_eq!(outcome.events, 1);
    }

    #[test]
    fn test_nonzero_exit_uses_stderr_tail() {
        let outcome = run(
            &[],
            ProcessEnding {
                exit_code: Some(2),
                stderr_tail: vec!["warming up".into(), "segfault in propagator".into()],
                ..Default::default()
            },
        );
        assert!(outcome.had_error);
        let message = outcome.error_message.unwrap();
        assert!(message.contains("code 2"));
        assert!(message.contains("segfault in propagator"));
    }

    #[test]
    fn test_interrupted_run_is_not_an_error() {
        let outcome = run(
            &[],
            ProcessEnding {
                interrupted: true,
                signaled: true,
                ..Default::default()
            },
        );
        assert!(outcome.interrupted);
        assert!(!outcome.solved);
        assert!(!outcome.had_error);
    }
}
