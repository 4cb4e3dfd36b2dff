use std::env;

use anyhow::{anyhow, Context, Result};
use sturdy_common::{Descriptor, TubCertPath, TubOptions};
use sturdy_tub::{Tub, TubIdentity, Value};

/// Invokes one method on the object named by a descriptor
///
/// Usage: call <pb://descriptor> <method> [text args...]
fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let mut args = env::args().skip(1);
    let descriptor: Descriptor = args
        .next()
        .ok_or_else(|| anyhow!("usage: call <pb://descriptor> <method> [args...]"))?
        .parse()
        .context("Failed to parse descriptor")?;
    let method = args.next().unwrap_or_else(|| "ping".to_string());
    let call_args: Vec<Value> = args.map(Value::from).collect();

    let identity = TubIdentity::load(&TubCertPath::new()).context("Failed to load tub identity")?;
    let tub = Tub::new(identity, TubOptions::from_env()?)?;

    println!("Connecting to {} ...", descriptor.location());
    let reference = tub
        .get_reference(&descriptor)
        .with_context(|| format!("Failed to reach {}", descriptor.name()))?;
    println!(
        "✓ Got {} from {}",
        reference.interface_name(),
        reference.remote_fingerprint().short()
    );

    let result = reference
        .call_remote_and_wait(&method, call_args)
        .with_context(|| format!("{method} failed"))?;
    println!("{method} -> {result:?}");

    tub.shutdown_all();
    Ok(())
}
