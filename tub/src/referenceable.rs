use std::fmt;

use sturdy_common::{
    error::RemoteFailure,
    events::ConnectionId,
    fingerprint::Fingerprint,
    schema::RemoteInterface,
    wire::CapabilityMetadata,
};

use crate::value::Value;

/// Who is calling, passed to every invocation.
#[derive(Debug, Clone)]
pub struct CallContext {
    pub connection: ConnectionId,
    /// Fingerprint of the peer that sent the call.
    pub peer:       Fingerprint,
    pub request_id: u64,
}

/// A local object that can be handed to peers and invoked by them.
///
/// Holding a reference is the only authority needed to call it, so an object
/// is reachable exactly by the peers it was given to.
pub trait Referenceable: Send + Sync {
    /// Schema enforced on inbound calls before [`invoke`](Self::invoke).
    /// Objects without one accept any method name and arguments.
    fn interface(&self) -> Option<&RemoteInterface> {
        None
    }

    fn invoke(&self, method: &str, args: Vec<Value>, ctx: &CallContext) -> Result<Value, RemoteFailure>;

    /// What peers learn about this object when it is granted to them.
    fn metadata(&self) -> CapabilityMetadata {
        self.interface()
            .map(RemoteInterface::metadata)
            .unwrap_or_default()
    }
}

/// A [`Referenceable`] backed by a closure.
pub struct FnTarget<F> {
    interface: Option<RemoteInterface>,
    handler:   F,
}

impl<F> FnTarget<F>
where
    F: Fn(&str, Vec<Value>, &CallContext) -> Result<Value, RemoteFailure> + Send + Sync,
{
    pub fn new(handler: F) -> Self {
        Self {
            interface: None,
            handler,
        }
    }

    pub fn with_interface(interface: RemoteInterface, handler: F) -> Self {
        Self {
            interface: Some(interface),
            handler,
        }
    }
}

impl<F> Referenceable for FnTarget<F>
where
    F: Fn(&str, Vec<Value>, &CallContext) -> Result<Value, RemoteFailure> + Send + Sync,
{
    fn interface(&self) -> Option<&RemoteInterface> {
        self.interface.as_ref()
    }

    fn invoke(&self, method: &str, args: Vec<Value>, ctx: &CallContext) -> Result<Value, RemoteFailure> {
        (self.handler)(method, args, ctx)
    }
}

impl<F> fmt::Debug for FnTarget<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnTarget")
            .field("interface", &self.interface.as_ref().map(|i| &i.name))
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use sturdy_common::{
        fingerprint::HashAlgorithm,
        schema::{Constraint, MethodSchema},
    };

    use super::*;

    fn ctx() -> CallContext {
        CallContext {
            connection: ConnectionId::new(),
            peer:       Fingerprint::of_certificate(HashAlgorithm::Sha256, b"peer"),
            request_id: 1,
        }
    }

    #[test]
    fn test_fn_target_dispatches_to_closure() {
        let target = FnTarget::new(|method, args, _ctx| match method {
            "count" => Ok(Value::Int(args.len() as i64)),
            other => Err(RemoteFailure::application(format!("no {other}"))),
        });
        assert!(target.interface().is_none());
        assert_eq!(target.metadata(), CapabilityMetadata::default());
        assert_eq!(
            target
                .invoke("count", vec![Value::None, Value::Bool(true)], &ctx())
                .unwrap(),
            Value::Int(2)
        );
        assert!(target.invoke("other", vec![], &ctx()).is_err());
    }

    #[test]
    fn test_metadata_follows_interface() {
        let iface = RemoteInterface::new("RIEcho").method(
            "echo",
            MethodSchema::new().arg("text", Constraint::text(64)),
        );
        let target = FnTarget::with_interface(iface, |_, mut args, _| Ok(args.remove(0)));
        let meta = target.metadata();
        assert_eq!(meta.interface, "RIEcho");
        assert_eq!(meta.methods, vec!["echo"]);
    }
}
