//! Self-healing code generation.
//!
//! A model writes code for a task, a second role writes adversarial tests, the
//! code runs in an isolated sandbox and failures are diagnosed, distilled into
//! lessons and fed back until the tests pass or the iteration budget runs out.
//!
//! - **[`core`]**: Pure logic (loop state machine, lesson ledger, response
//!   recovery, retry policy). No I/O.
//! - **[`io`]**: Side effects (model processes, sandbox execution, config,
//!   task files, prompt rendering, audit trail).
//! - **[`agents`]**: One module per model role, each a single structured call.
//! - **[`repair_loop`]** drives one task; **[`bench`]** drives many.

pub mod agents;
pub mod bench;
pub mod core;
pub mod exit_codes;
pub mod io;
pub mod logging;
pub mod progress;
pub mod repair_loop;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
