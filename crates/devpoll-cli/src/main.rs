//! # devpoll CLI
//!
//! Command-line utilities for encoding, probing a gateway, and debugging.

use anyhow::{bail, Context, Result};
use devpoll_adapter_http::{
    decode_mac_segment, encode_mac_segment, GatewayClient, GatewayClientConfig,
};
use devpoll_core::point::MAX_INSTANCE;
use devpoll_core::{disconnected_marker, CovMode, NetworkIdentity, PointId, ResolveRequest};
use std::env;
use std::time::Duration;

#[tokio::main]
async fn main() -> Result<()> {
    let args: Vec<String> = env::args().collect();

    if args.len() < 2 {
        print_help();
        return Ok(());
    }

    match args[1].as_str() {
        "encode-mac" => {
            if args.len() < 3 {
                eprintln!("Usage: devpoll encode-mac <mac>");
                std::process::exit(1);
            }
            println!("{}", encode_mac_segment(&args[2]));
        }
        "decode-mac" => {
            if args.len() < 3 {
                eprintln!("Usage: devpoll decode-mac <encoded>");
                std::process::exit(1);
            }
            let decoded = decode_mac_segment(&args[2]).context("Failed to decode")?;
            println!("{decoded}");
        }
        "point" => {
            if args.len() < 3 {
                eprintln!("Usage: devpoll point <type:instance>");
                std::process::exit(1);
            }
            let point: PointId = args[2].parse().context("Invalid point")?;
            println!(
                "{point} (type code {}, instance {})",
                point.object_type.code(),
                point.instance
            );
        }
        "marker" => {
            println!("{}", disconnected_marker(&chrono::Local::now()));
        }
        "resolve" => {
            if args.len() < 4 {
                eprintln!("Usage: devpoll resolve <mac> <instance>");
                std::process::exit(1);
            }
            let client = client_from_env()?;
            let request = ResolveRequest {
                identity: identity(&args[2], &args[3])?,
                poll_interval: Duration::from_secs(5),
                cov_mode: CovMode::None,
                cov_lease_minutes: 0,
            };
            let device = client
                .resolve_device(&request)
                .await
                .context("Resolve failed")?;
            println!("{}", serde_json::to_string_pretty(&device)?);
        }
        "read" => {
            if args.len() < 5 {
                eprintln!("Usage: devpoll read <mac> <instance> <point>...");
                std::process::exit(1);
            }
            let client = client_from_env()?;
            let points = args[4..]
                .iter()
                .map(|p| p.parse::<PointId>().with_context(|| format!("Invalid point {p}")))
                .collect::<Result<Vec<_>>>()?;
            let request = ResolveRequest {
                identity: identity(&args[2], &args[3])?,
                poll_interval: Duration::from_secs(5),
                cov_mode: CovMode::None,
                cov_lease_minutes: 0,
            };
            let device = client
                .resolve_device(&request)
                .await
                .context("Resolve failed")?;
            let body = client
                .read_multiple(&device, &points)
                .await
                .context("Read failed")?;
            println!("{}", serde_json::to_string_pretty(&body)?);
        }
        "help" | "--help" | "-h" => {
            print_help();
        }
        cmd => {
            eprintln!("Unknown command: {cmd}");
            print_help();
            std::process::exit(1);
        }
    }

    Ok(())
}

fn identity(mac: &str, instance: &str) -> Result<NetworkIdentity> {
    let instance: u32 = instance
        .parse()
        .with_context(|| format!("Invalid instance number {instance}"))?;
    if instance > MAX_INSTANCE {
        bail!("Instance number {instance} out of range");
    }
    Ok(NetworkIdentity::new(mac, instance))
}

fn client_from_env() -> Result<GatewayClient> {
    let mut config = GatewayClientConfig::default();
    if let Ok(url) = env::var("DEVPOLL_GATEWAY_URL") {
        config.base_url = url;
    }
    if let Ok(token) = env::var("DEVPOLL_BEARER_TOKEN") {
        config.bearer_token = Some(token);
    }
    GatewayClient::new(config).context("Failed to create gateway client")
}

fn print_help() {
    println!(
        r#"devpoll CLI

USAGE:
    devpoll <COMMAND> [OPTIONS]

COMMANDS:
    encode-mac <mac>                 Percent-encode a MAC for use in a URL path
    decode-mac <encoded>             Decode a percent-encoded MAC
    point <type:instance>            Parse and show a point identifier
    marker                           Print a disconnected marker for now
    resolve <mac> <instance>         Resolve a device through the gateway
    read <mac> <instance> <point>... Read present values through the gateway
    help                             Show this help message

ENVIRONMENT:
    DEVPOLL_GATEWAY_URL    Gateway base URL (default http://localhost:8090/api)
    DEVPOLL_BEARER_TOKEN   Bearer token

EXAMPLES:
    devpoll encode-mac "10.0.1.50:47808"
    devpoll read 10.0.1.50:47808 1001 analog-input:1 binary-value:2
"#
    );
}
