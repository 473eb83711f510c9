// Session: the experiment state machine and everything the receive path hands off to.
// Block logging, cursor mailbox, completion/stop signals, telemetry routing.
pub mod logger;
pub mod cursor;
pub mod signal;
pub mod router;
pub mod orchestrator;
