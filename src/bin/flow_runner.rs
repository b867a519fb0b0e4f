//! flowkit flow runner
//!
//! Runs one flow definition with the built-in `core` module until it is
//! destroyed by SIGTERM, Ctrl-C, or a control message.
//!
//! The flow runs on an in-process transport. Control messages are read from
//! stdin, one JSON document per line, and delivered to the flow's
//! deployment binding.
//!
//! ```text
//! flow-runner flow.json
//! FLOW_DEFINITION=flow.json LOG_LEVEL=debug flow-runner
//! echo '{"type":"com.flowstudio.deployment.destroy"}' | flow-runner flow.json
//! ```

use std::sync::Arc;

use anyhow::Context;
use flowkit::prelude::*;
use flowkit::transport::DEPLOYMENT_EXCHANGE;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{debug, info, warn, Level};
use tracing_subscriber::FmtSubscriber;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let level: Level = std::env::var("LOG_LEVEL")
        .ok()
        .and_then(|l| l.parse().ok())
        .unwrap_or(Level::INFO);
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .compact()
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let path = std::env::args()
        .nth(1)
        .or_else(|| std::env::var("FLOW_DEFINITION").ok())
        .context("usage: flow-runner <flow.json> (or set FLOW_DEFINITION)")?;
    let json = std::fs::read_to_string(&path)
        .with_context(|| format!("could not read flow definition {}", path))?;
    let flow = FlowDefinition::from_json(&json)
        .with_context(|| format!("invalid flow definition {}", path))?;

    info!(
        path = %path,
        elements = flow.elements.len(),
        connections = flow.connections.len(),
        "Starting flow"
    );

    let transport = Arc::new(MemoryTransport::new());
    let mut builder = FlowApplication::builder()
        .module(core_module()?)
        .flow(flow)
        .transport(transport.clone())
        .config(FlowConfig::from_env().exit_mode(ExitMode::Process))
        .rpc_config(RpcConfig::from_env());

    if let Ok(base_url) = std::env::var("FLOW_API_URL") {
        let token = std::env::var("FLOW_API_TOKEN").unwrap_or_default();
        builder = builder.api(Arc::new(HttpApi::new(base_url, Arc::new(StaticToken::new(token)))));
    }

    let app = builder.build().await?;
    let deployment_id = app.context().deployment_id.unwrap_or_default();
    tokio::spawn(read_control_messages(transport, deployment_id));
    app.run_until_shutdown().await;

    Ok(())
}

/// Deliver each line of stdin to the deployment binding
async fn read_control_messages(transport: Arc<MemoryTransport>, deployment_id: String) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => return,
            Err(e) => {
                warn!(error = %e, "Could not read control messages from stdin");
                return;
            }
        };
        if line.trim().is_empty() {
            continue;
        }

        let body: Value = match serde_json::from_str(&line) {
            Ok(body) => body,
            Err(e) => {
                warn!(error = %e, "Ignoring malformed control message");
                continue;
            }
        };
        match transport
            .deliver(DEPLOYMENT_EXCHANGE, &deployment_id, body)
            .await
        {
            Ok(verdicts) => debug!(?verdicts, "Control message delivered"),
            Err(e) => warn!(error = %e, "Could not deliver control message"),
        }
    }
}
