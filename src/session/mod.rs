//! Session lifecycle management.
//!
//! ```text
//!  ┌─────────────────┐        ┌──────────────┐
//!  │ SessionRegistry │──owns──▶  SessionFsm  │  (one per session)
//!  │  (ID → Arc)     │        │  validated   │
//!  └────────┬────────┘        │  transitions │
//!           │                 └──────▲───────┘
//!           │ snapshot copies        │ watchdog timer
//!           ▼                        │
//!     diagnostics()           forced `timeout`
//! ```
//!
//! - **SessionFsm** — explicit state machine; every state change goes
//!   through `transition`, which validates, records history, and resolves
//!   the completion future exactly once.
//! - **SessionRegistry** — process-wide index of live machines with a
//!   retention sweep for terminal ones.

mod fsm;
mod registry;

pub use fsm::{
    DataPatch, FsmError, FsmSummary, SessionData, SessionFailed, SessionFsm, SessionOutcome,
    SessionResult, SessionState, TransitionRecord, DEFAULT_SESSION_TIMEOUT,
};
pub use registry::{
    RegistryDiagnostics, SessionRegistry, DEFAULT_RETENTION, DEFAULT_SWEEP_INTERVAL,
};
