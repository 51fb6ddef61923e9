//! Fractal: a recursive task orchestrator for coding agents.
//!
//! A spec becomes a root task. A planner splits tasks into children (recursively,
//! up to a depth limit) or marks them as leaves; leaves run as bounded parallel
//! worker processes in dependency order; failed attempts are retried, then
//! escalated to a fixer round or a human.
//!
//! - **[`core`]**: Pure logic (task graph, split resolution, roll-up, retry policy).
//!   No I/O, fully testable in isolation.
//! - **[`io`]**: Side effects (task stores, worker processes, decision commands,
//!   config, signals). Each sits behind a trait so tests can substitute fakes.
//!
//! [`orchestrator`] drives both through a single-steppable control loop;
//! [`session`] wires it to `.fractal/` for the CLI commands.

pub mod agents;
pub mod core;
pub mod exit_codes;
pub mod io;
pub mod logging;
pub mod orchestrator;
pub mod pool;
pub mod session;
pub mod task;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
