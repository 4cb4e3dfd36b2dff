//! Sturdy Tub
//!
//! Capability-secure remote objects over fingerprint-pinned mutual TLS.
//!
//! A [`Tub`] owns one certificate identity. It dials peers named by
//! `pb://` descriptors, accepts inbound connections, and publishes local
//! objects under names that peers resolve through the bootstrap object.
//! Possession of a reference is the only authority needed to invoke it.
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use sturdy_tub::{FnTarget, Referenceable, Tub, TubIdentity, Value};
//! use sturdy_common::{TubCertPath, TubOptions};
//!
//! # fn main() -> anyhow::Result<()> {
//! let identity = TubIdentity::load(&TubCertPath::new())?;
//! let tub = Tub::new(identity, TubOptions::from_env()?)?;
//! let listener = tub.listen("tcp:0:interface=127.0.0.1")?;
//! tub.set_location("127.0.0.1", listener.local_addr().port());
//!
//! let echo: Arc<dyn Referenceable> = Arc::new(FnTarget::new(|_, args, _| {
//!     Ok(args.into_iter().next().unwrap_or(Value::None))
//! }));
//! println!("{}", tub.register(echo, Some("echo"))?);
//! # Ok(())
//! # }
//! ```

/// Memo of subject-identity verdicts
pub mod cache;

/// Connections, remote references and the per-connection threads
pub mod connection;

/// Outbound call correlation
pub mod dispatcher;

/// Certificate and key loading
pub mod identity;

/// TLS negotiation, fingerprint pinning and subject rules
pub mod negotiator;

/// The trait implemented by objects peers can invoke
pub mod referenceable;

/// Names under which objects are published
pub mod registry;

/// The tub itself: connect, listen, register
pub mod supervisor;

/// Per-connection capability tables
pub mod table;

/// Argument and result values
pub mod value;

pub use cache::{FingerprintCache, TrustDecision};
pub use connection::{Connection, NotifierId, RemoteReference, GET_REFERENCE_BY_NAME};
pub use dispatcher::{CallOutcome, PendingResult};
pub use identity::TubIdentity;
pub use negotiator::{check_subject, Negotiator};
pub use referenceable::{CallContext, FnTarget, Referenceable};
pub use registry::Registry;
pub use supervisor::{Listener, Tub, TubBuilder};
pub use value::Value;
