//! SFTP demo.
//!
//! This example demonstrates how to:
//! - Connect to an SSH server, checking its key against `known_hosts`
//! - Authenticate with a password or `~/.ssh/id_ed25519`
//! - List a directory, create a folder, and write and read files through handles
//! - Copy files with pipelined `put` and `get`
//!
//! Usage:
//!   cargo run --example sftp_demo [user@]host[:port]
//!
//! The password is read from `FERRY_PASSWORD` if set. Set `RUST_LOG=debug`
//! to see the protocol exchange.

use ferry_proto::ssh::auth::{PasswordAuth, PublicKeyAuth};
use ferry_proto::ssh::client::{SshClient, SshClientConfig};
use ferry_proto::ssh::hostkey::Ed25519KeyPair;
use ferry_proto::ssh::known_hosts::StrictHostKeyChecking;
use ferry_proto::ssh::sftp::SftpSession;
use ferry_platform::{FerryError, FerryResult};
use std::env;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

const DEMO_DIR: &str = "demo_sftp_folder";
const LOCAL_README: &str = "README_demo_sftp";
const THIS_FILE: &str = concat!(env!("CARGO_MANIFEST_DIR"), "/examples/sftp_demo.rs");

/// Splits `[user@]host[:port]`.
fn parse_target(target: &str) -> Result<(Option<String>, String, u16), String> {
    let (user, rest) = match target.split_once('@') {
        Some((user, rest)) => (Some(user.to_string()), rest),
        None => (None, target),
    };
    let (host, port) = match rest.rsplit_once(':') {
        Some((host, port)) => (
            host,
            port.parse().map_err(|_| format!("Invalid port '{}'", port))?,
        ),
        None => (rest, 22),
    };
    if host.is_empty() {
        return Err("Hostname required".to_string());
    }
    Ok((user, host.to_string(), port))
}

async fn run_demo(sftp: &SftpSession) -> FerryResult<()> {
    let listing = sftp.listdir(".").await?;
    println!("Dirlist: {:?}", listing);

    match sftp.mkdir(DEMO_DIR, 0o755).await {
        Ok(()) => {}
        Err(FerryError::SftpStatus { .. }) | Err(FerryError::PermissionDenied(_)) => {
            println!("(assuming {}/ already exists)", DEMO_DIR);
        }
        Err(e) => return Err(e),
    }

    let readme = format!("{}/README", DEMO_DIR);
    let mut file = sftp.open(&readme, "w".parse()?).await?;
    file.write(b"This was created by sftp_demo.\n").await?;
    file.close().await?;

    // Copy this file through a handle
    let copy = format!("{}/sftp_demo.rs", DEMO_DIR);
    let data = tokio::fs::read(THIS_FILE).await?;
    let mut file = sftp.open(&copy, "w".parse()?).await?;
    file.write(&data).await?;
    file.close().await?;
    println!("created {}/ on the server", DEMO_DIR);

    // Read the README back through a handle
    let mut file = sftp.open(&readme, "r".parse()?).await?;
    let mut contents = Vec::new();
    loop {
        let chunk = file.read(32 * 1024).await?;
        if chunk.is_empty() {
            break;
        }
        contents.extend_from_slice(&chunk);
    }
    file.close().await?;
    tokio::fs::write(LOCAL_README, &contents).await?;
    println!("copied README back here");

    // The same two copies with pipelined put and get
    let sent = sftp.put(THIS_FILE, &copy).await?;
    let received = sftp.get(&readme, LOCAL_README).await?;
    println!("put {} bytes, got {} bytes", sent, received);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let args: Vec<String> = env::args().collect();
    if args.len() != 2 {
        eprintln!("Usage: {} [user@]host[:port]", args[0]);
        std::process::exit(1);
    }
    let (user, host, port) = match parse_target(&args[1]) {
        Ok(target) => target,
        Err(e) => {
            eprintln!("*** {}", e);
            std::process::exit(1);
        }
    };
    let user = user
        .or_else(|| env::var("USER").ok())
        .or_else(|| env::var("USERNAME").ok())
        .unwrap_or_else(|| "root".to_string());

    let mut config = SshClientConfig::new(&user);
    config.strict_host_key_checking = StrictHostKeyChecking::AcceptNew;
    if let Some(home) = env::var_os("HOME") {
        let key_path = std::path::Path::new(&home).join(".ssh").join("id_ed25519");
        if let Ok(key) = Ed25519KeyPair::load(&key_path) {
            config.auth_methods.push(Box::new(PublicKeyAuth::new(Arc::new(key))));
        }
    }
    if let Ok(password) = env::var("FERRY_PASSWORD") {
        config.auth_methods.push(Box::new(PasswordAuth::new(password)));
    }

    println!("Connecting to {}@{}:{}...", user, host, port);
    let mut client = match SshClient::connect(&host, port, config).await {
        Ok(client) => client,
        Err(e) => {
            eprintln!("*** Caught error: {}", e);
            std::process::exit(1);
        }
    };
    println!("Negotiated {}", client.session().suite());

    let result = match client.sftp().await {
        Ok(sftp) => {
            let result = run_demo(&sftp).await;
            sftp.close().await;
            result
        }
        Err(e) => Err(e),
    };
    client.close().await;

    if let Err(e) = result {
        eprintln!("*** Caught error: {}", e);
        std::process::exit(1);
    }
    Ok(())
}
