use std::time::Instant;

use clap::{Args, Parser, Subcommand};
use serde_json::Value;

use rpc_deadlines::config::{ClientConfig, ObservabilityConfig};
use rpc_deadlines::observability::logging;
use rpc_deadlines::server::servant::sleep_payload;
use rpc_deadlines::{Communicator, Proxy, Timeout};

#[derive(Parser)]
#[command(name = "rpc-cli")]
#[command(about = "Drive the deadline test server: invoke operations and control the adapter", long_about = None)]
struct Cli {
    /// Controller base URL.
    #[arg(short, long, default_value = "http://127.0.0.1:12011")]
    controller: String,

    /// Log level for client-side events.
    #[arg(long, default_value = "warn")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct CallArgs {
    /// Proxy string, `<identity>:tcp://host:port[?timeout=ms]`.
    #[arg(short, long, default_value = "timeout:tcp://127.0.0.1:12010")]
    proxy: String,

    /// Connect timeout in ms (-1 = infinite).
    #[arg(long, allow_negative_numbers = true)]
    connect_timeout: Option<i64>,

    /// Idle timeout in ms (-1 = infinite).
    #[arg(long, allow_negative_numbers = true)]
    idle_timeout: Option<i64>,

    /// Invocation timeout in ms (-1 = infinite).
    #[arg(long, allow_negative_numbers = true)]
    invocation_timeout: Option<i64>,
}

#[derive(Subcommand)]
enum Commands {
    /// Ping the remote object
    Ping(CallArgs),
    /// Invoke `op`
    Op(CallArgs),
    /// Invoke `sleep`; the server waits before replying
    Sleep {
        #[command(flatten)]
        call: CallArgs,
        #[arg(long, default_value_t = 1000)]
        ms: u32,
    },
    /// Invoke `sendData` with a payload of the given size
    SendData {
        #[command(flatten)]
        call: CallArgs,
        #[arg(long, default_value_t = 1024 * 1024)]
        size: usize,
    },
    /// Hold the adapter (negative = until resume)
    Hold {
        #[arg(long, default_value_t = -1, allow_negative_numbers = true)]
        ms: i64,
    },
    /// Resume a held adapter
    Resume,
    /// Stop the test server
    Shutdown,
    /// Show adapter state and open connections
    Status,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    logging::init(&ObservabilityConfig {
        log_level: cli.log_level.clone(),
        ..ObservabilityConfig::default()
    });
    let http = reqwest::Client::new();

    match cli.command {
        Commands::Ping(call) => invoke(&call, "ice_ping", Vec::new()).await?,
        Commands::Op(call) => invoke(&call, "op", Vec::new()).await?,
        Commands::Sleep { call, ms } => invoke(&call, "sleep", sleep_payload(ms)).await?,
        Commands::SendData { call, size } => invoke(&call, "sendData", vec![0u8; size]).await?,
        Commands::Hold { ms } => {
            let res = http
                .post(format!("{}/controller/hold", cli.controller))
                .query(&[("ms", ms)])
                .send()
                .await?;
            print_response(res).await?;
        }
        Commands::Resume => {
            let res = http.post(format!("{}/controller/resume", cli.controller)).send().await?;
            print_response(res).await?;
        }
        Commands::Shutdown => {
            let res = http.post(format!("{}/controller/shutdown", cli.controller)).send().await?;
            print_response(res).await?;
        }
        Commands::Status => {
            let res = http.get(format!("{}/controller/status", cli.controller)).send().await?;
            print_response(res).await?;
        }
    }

    Ok(())
}

fn build_proxy(communicator: &Communicator, call: &CallArgs) -> Result<Proxy, Box<dyn std::error::Error>> {
    let mut proxy = communicator.string_to_proxy(&call.proxy)?;
    if let Some(ms) = call.connect_timeout {
        proxy = proxy.with_connect_timeout(Timeout::from_millis(ms)?);
    }
    if let Some(ms) = call.idle_timeout {
        proxy = proxy.with_idle_timeout(Timeout::from_millis(ms)?);
    }
    if let Some(ms) = call.invocation_timeout {
        proxy = proxy.with_invocation_timeout(Timeout::from_millis(ms)?);
    }
    Ok(proxy)
}

async fn invoke(call: &CallArgs, operation: &str, payload: Vec<u8>) -> Result<(), Box<dyn std::error::Error>> {
    let communicator = Communicator::new(ClientConfig::default())?;
    let proxy = build_proxy(&communicator, call)?;

    let started = Instant::now();
    let result = proxy.invoke(operation, payload).await;
    let elapsed = started.elapsed();
    communicator.destroy().await;

    match result {
        Ok(reply) => {
            println!("{} ok ({} bytes) in {:?}", operation, reply.len(), elapsed);
            Ok(())
        }
        Err(e) => {
            eprintln!("{} failed after {:?}: [{}] {}", operation, elapsed, e.kind().as_str(), e);
            Err(e.into())
        }
    }
}

async fn print_response(res: reqwest::Response) -> Result<(), Box<dyn std::error::Error>> {
    let status = res.status();
    if !status.is_success() {
        eprintln!("Error: controller returned status {}", status);
        if let Ok(text) = res.text().await {
            eprintln!("Response: {}", text);
        }
        return Ok(());
    }

    let text = res.text().await?;
    if text.is_empty() {
        println!("{}", status);
        return Ok(());
    }
    let json: Value = serde_json::from_str(&text)?;
    println!("{}", serde_json::to_string_pretty(&json)?);
    Ok(())
}
