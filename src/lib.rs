//! ICMP echo multiplexing: many independent ping connections share one raw
//! socket per address family.
//!
//! ```no_run
//! use muxping::{Multiplexer, MuxConfig, PingError, Probe};
//! use std::time::Duration;
//!
//! # async fn demo() -> Result<(), PingError> {
//! let mux = Multiplexer::new(MuxConfig::default());
//! let handler = |probe: Probe, result: Result<(), PingError>| {
//!     println!("seq={} {:?} {:?}", probe.sequence, probe.rtt(), result);
//! };
//! let conn = mux
//!     .new_conn("127.0.0.1".parse().unwrap(), handler, Duration::from_secs(1))
//!     .await?;
//! mux.send_ping(&conn).await?;
//! mux.close(&conn).await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod dispatch;
pub mod error;
pub mod icmp;
pub mod index;
pub mod mux;
pub mod transport;
pub mod utils;

#[cfg(test)]
pub(crate) mod testing;

pub use config::{DispatchPolicy, ExhaustionPolicy, MuxConfig};
pub use error::{DecodeError, PingError};
pub use icmp::{Family, Probe};
pub use index::ReplyHandler;
pub use mux::{Multiplexer, PingConn, Sent};
