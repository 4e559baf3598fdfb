// Session state machine
//
// A session moves Idle -> Starting -> Active -> Stopping -> Ended. The grant
// and revoke steps are handshakes with the access enforcer; while Active a
// driver task periodically debits elapsed time and metered data from the
// subscriber's balance and stops the session when either runs out.

mod accrual;
pub mod handshake;
mod machine;
pub mod record;

pub use handshake::RetryPolicy;
pub use machine::{RecoveryReport, SessionConfig, SessionManager};
pub use record::{EndReason, Session, SessionSnapshot, SessionState};
