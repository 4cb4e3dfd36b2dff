use std::{
    env,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use anyhow::{Context, Result};
use sturdy_common::{Constraint, MethodSchema, RemoteFailure, RemoteInterface, TubCertPath, TubOptions};
use sturdy_tub::{FnTarget, Referenceable, Tub, TubIdentity, Value};
use tracing::{info, warn};

/// Publishes an echo object and serves it until Ctrl+C
fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt::init();

    println!("=== Sturdy Echo Tub ===");

    let cert_path = TubCertPath::new();
    println!("Certificate paths:");
    println!("  - Tub cert: {:?}", cert_path.cert_path);
    println!("  - Tub key: {:?}", cert_path.key_path);

    if !cert_path.cert_path.exists() {
        warn!("Tub certificate not found at {:?}", cert_path.cert_path);
        println!("Please generate certificates first using:");
        println!("  ./scripts/generate_test_certs.sh certs");
        println!("and copy one identity's tub.pem / tub.key.pem into STURDY_CERTS_DIR");
        return Ok(());
    }

    let bind = env::args().nth(1).unwrap_or_else(|| "tcp:8765:interface=127.0.0.1".to_string());
    let identity = TubIdentity::load(&cert_path).context("Failed to load tub identity")?;
    let options = TubOptions::from_env().context("Invalid STURDY_* configuration")?;
    let tub = Tub::new(identity, options).context("Failed to create tub")?;

    let listener = tub
        .listen(&bind)
        .with_context(|| format!("Failed to listen on {bind}"))?;
    let addr = listener.local_addr();
    let host = if addr.ip().is_unspecified() {
        "127.0.0.1".to_string()
    } else {
        addr.ip().to_string()
    };
    tub.set_location(host, addr.port());

    let interface = RemoteInterface::new("RIEcho")
        .method("echo", MethodSchema::new().arg("message", Constraint::text(4096)))
        .method("ping", MethodSchema::new());
    let echo: Arc<dyn Referenceable> = Arc::new(FnTarget::with_interface(interface, |method, args, ctx| {
        info!("{} from {}", method, ctx.peer.short());
        match method {
            "echo" => Ok(args.into_iter().next().unwrap_or(Value::None)),
            "ping" => Ok(Value::from("pong")),
            other => Err(RemoteFailure::application(format!("unsupported method {other}"))),
        }
    }));
    let descriptor = tub.register(echo, Some("echo")).context("Failed to register echo object")?;

    println!("✓ Echo tub listening on {addr}");
    println!("Descriptor: {descriptor}");
    println!("Try it with:");
    println!("  cargo run --example call -- {descriptor} echo hello");
    println!("Press Ctrl+C to stop the tub");

    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();
    ctrlc::set_handler(move || {
        println!("\nReceived Ctrl+C, shutting down gracefully...");
        r.store(false, Ordering::SeqCst);
    })
    .context("Failed to set Ctrl+C handler")?;

    while running.load(Ordering::SeqCst) {
        std::thread::sleep(Duration::from_millis(100));
    }

    tub.shutdown_all();
    println!("✓ Echo tub shutdown completed");
    Ok(())
}
