//! `agentctl`: a small CLI over the in-guest Guest API
//! (`http://127.0.0.1:7777` by default, overridable via `AEGIS_GUEST_API`).
//!
//! This is what a user's `CMD`-equivalent process shells out to for the
//! handful of operations the Guest API exposes, instead of hand-rolling
//! HTTP calls against the loopback port itself.

use clap::{Parser, Subcommand};
use serde_json::{json, Value};

#[derive(Parser)]
#[command(name = "agentctl", version, about = "Talk to the Aegis Guest API from inside the VM")]
struct Cli {
    /// Base URL of the Guest API.
    #[arg(long, env = "AEGIS_GUEST_API", default_value = "http://127.0.0.1:7777")]
    base_url: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Spawn a child instance (`POST /v1/instances`).
    Spawn {
        /// Command to run in the child, e.g. `-- python3 worker.py`.
        #[arg(trailing_var_arg = true, required = true)]
        command: Vec<String>,
        #[arg(long)]
        image: Option<String>,
        #[arg(long)]
        memory_mb: Option<u32>,
        #[arg(long)]
        vcpus: Option<u32>,
    },
    /// List child instances (`GET /v1/instances`).
    Children,
    /// Stop a child instance (`POST /v1/instances/{id}/stop`).
    Stop { id: String },
    /// Print this instance's own id, state, and endpoints (`GET /v1/self`).
    SelfInfo,
    /// Assert a keepalive lease so the idle policy won't pause/stop this
    /// instance (`POST /v1/self/keepalive`).
    Keepalive {
        #[arg(long, default_value = "agentctl")]
        reason: String,
        #[arg(long, default_value_t = 30)]
        ttl_secs: u64,
    },
    /// Release a previously-asserted keepalive lease.
    KeepaliveRelease,
    /// Request that the primary process be restarted in place.
    Restart,
    /// Expose a guest port through the host (`POST /v1/self/expose`).
    Expose { guest_port: u16 },
    /// Stop exposing a guest port (`DELETE /v1/self/expose/{port}`).
    Unexpose { guest_port: u16 },
    /// Send a tether frame to the host (`POST /v1/tether/send`).
    Tether {
        session_id: String,
        /// JSON payload, e.g. `'{"text":"hi"}'`.
        payload: String,
        #[arg(long, default_value = "message")]
        frame_type: String,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let client = reqwest::Client::new();

    let result = match cli.command {
        Command::Spawn { command, image, memory_mb, vcpus } => {
            post(
                &client,
                &cli.base_url,
                "/v1/instances",
                json!({
                    "command": command,
                    "image": image,
                    "memory_mb": memory_mb,
                    "vcpus": vcpus,
                }),
            )
            .await
        }
        Command::Children => get(&client, &cli.base_url, "/v1/instances").await,
        Command::Stop { id } => post(&client, &cli.base_url, &format!("/v1/instances/{id}/stop"), json!({})).await,
        Command::SelfInfo => get(&client, &cli.base_url, "/v1/self").await,
        Command::Keepalive { reason, ttl_secs } => {
            post(&client, &cli.base_url, "/v1/self/keepalive", json!({"reason": reason, "ttl_secs": ttl_secs})).await
        }
        Command::KeepaliveRelease => delete(&client, &cli.base_url, "/v1/self/keepalive").await,
        Command::Restart => post(&client, &cli.base_url, "/v1/self/restart", json!({})).await,
        Command::Expose { guest_port } => {
            post(&client, &cli.base_url, "/v1/self/expose", json!({"guest_port": guest_port})).await
        }
        Command::Unexpose { guest_port } => {
            delete(&client, &cli.base_url, &format!("/v1/self/expose/{guest_port}")).await
        }
        Command::Tether { session_id, payload, frame_type } => {
            let payload: Value = serde_json::from_str(&payload).unwrap_or(Value::String(payload));
            post(
                &client,
                &cli.base_url,
                "/v1/tether/send",
                json!({"session_id": session_id, "type": frame_type, "payload": payload}),
            )
            .await
        }
    };

    match result {
        Ok(body) => println!("{body}"),
        Err(e) => {
            eprintln!("agentctl: {e}");
            std::process::exit(1);
        }
    }
}

async fn get(client: &reqwest::Client, base_url: &str, path: &str) -> Result<String, String> {
    let resp = client.get(format!("{base_url}{path}")).send().await.map_err(|e| e.to_string())?;
    body_or_error(resp).await
}

async fn post(client: &reqwest::Client, base_url: &str, path: &str, body: Value) -> Result<String, String> {
    let resp = client
        .post(format!("{base_url}{path}"))
        .json(&body)
        .send()
        .await
        .map_err(|e| e.to_string())?;
    body_or_error(resp).await
}

async fn delete(client: &reqwest::Client, base_url: &str, path: &str) -> Result<String, String> {
    let resp = client.delete(format!("{base_url}{path}")).send().await.map_err(|e| e.to_string())?;
    body_or_error(resp).await
}

async fn body_or_error(resp: reqwest::Response) -> Result<String, String> {
    let status = resp.status();
    let text = resp.text().await.unwrap_or_default();
    if status.is_success() {
        Ok(text)
    } else {
        Err(format!("{status}: {text}"))
    }
}
