//! Iterative refinement pipeline for a script-driven 3D authoring engine.
//!
//! sceneloop drives an external authoring/rendering engine toward a target
//! appearance (a text description or goal images) through a bounded
//! generate→execute→render→critique loop. The architecture enforces a strict
//! separation:
//!
//! - **[`core`]**: Pure, deterministic logic (outcome taxonomy, rubric
//!   scoring, best-iteration selection). No I/O, fully testable in isolation.
//! - **[`io`]**: Side-effecting operations (config, subprocess execution,
//!   rendering, artifact storage). Isolated behind traits to enable scripted
//!   fakes in tests.
//! - **[`llm`]**: The text/vision model capability used for script generation
//!   and critique, behind a single object-safe trait.
//!
//! [`pipeline`] ties the collaborators together into the session state
//! machine; [`clarify`], [`generator`], and [`critic`] are the stages it
//! drives.

pub mod clarify;
pub mod core;
pub mod critic;
pub mod doctor;
pub mod exit_codes;
pub mod generator;
pub mod io;
pub mod llm;
pub mod logging;
pub mod pipeline;
pub mod session;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
