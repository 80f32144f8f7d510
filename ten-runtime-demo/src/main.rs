//! Demo binary: boots an `App` with a single "echo" extension addon, starts
//! a one-extension graph, sends it a `ping` cmd and prints the result, then
//! waits for a shutdown signal like a long-running deployment would.

#![forbid(unsafe_code)]

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use camino::Utf8PathBuf;
use clap::Parser;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::EnvFilter;

use ten_runtime::addon::{Addon, AddonKind, Instance};
use ten_runtime::error::AddonError;
use ten_runtime::extension::{self, ExtensionImpl, TenEnv};
use ten_runtime::message::{Message, MessageKind};
use ten_runtime::signal::wait_for_shutdown_signal;
use ten_runtime::value::Value;
use ten_runtime::App;
use ten_runtime_protocol::{GraphDescription, Loc, StatusCode};

mod eyre_tracing_error;

#[derive(Parser)]
struct Arguments {
    /// URI this app identifies itself as.
    #[arg(long, default_value = "ten-runtime-demo://local")]
    app_uri: String,

    /// Path to a graph description JSON file; defaults to the bundled
    /// single-extension echo graph.
    #[arg(long)]
    graph: Option<Utf8PathBuf>,
}

/// Echoes back whatever `text` property a `ping` cmd carries.
struct EchoExtension;

impl ExtensionImpl for EchoExtension {
    fn on_cmd(&mut self, ten_env: &mut TenEnv<'_>, cmd: Message) {
        let MessageKind::Cmd { name, id, .. } = &cmd.kind else {
            return;
        };

        let mut result = Message::new_cmd_result(StatusCode::Ok, name.clone(), *id, true, cmd.src.clone());
        if let Ok(text) = cmd.properties.get_path("text") {
            let _ = result.properties.set_path("text", text.clone());
        }
        ten_env.return_result(result);
    }
}

struct EchoAddon;

impl Addon for EchoAddon {
    fn on_create_instance(&self, _instance_name: &str) -> Pin<Box<dyn Future<Output = Result<Instance, AddonError>> + Send>> {
        Box::pin(async { Ok(extension::into_instance(Box::new(EchoExtension))) })
    }

    fn on_destroy_instance(&self, _instance: Instance) -> Pin<Box<dyn Future<Output = ()> + Send>> {
        Box::pin(async {})
    }
}

fn load_graph(path: Option<&Utf8PathBuf>) -> eyre::Result<GraphDescription> {
    let contents = match path {
        Some(path) => std::fs::read_to_string(path)?,
        None => include_str!("../graphs/echo.json").to_owned(),
    };
    Ok(serde_json::from_str(&contents)?)
}

#[tokio::main]
async fn main() -> eyre::Result<()> {
    let args = Arguments::parse();

    eyre::set_hook(Box::new(eyre_tracing_error::Handler::default_with))?;

    tracing::subscriber::set_global_default(
        tracing_subscriber::fmt()
            .with_env_filter(
                EnvFilter::builder()
                    .with_default_directive(LevelFilter::INFO.into())
                    .with_env_var("TEN_RUNTIME_LOG")
                    .from_env()?,
            )
            .with_writer(std::io::stderr)
            .compact()
            .finish()
            .with(tracing_error::ErrorLayer::default()),
    )?;

    let mut app = App::new(&args.app_uri);
    app.registry(AddonKind::Extension)
        .register(AddonKind::Extension, "echo", None, Arc::new(EchoAddon))?;

    let description = load_graph(args.graph.as_ref())?;
    app.start_graph("demo", description).await?;

    if let Some(engine) = app.engine("demo") {
        let mut ping = Message::new_cmd("ping", Loc::default(), vec![Loc::extension("g1", "e1")]);
        ping.properties.set_path("text", Value::String("hello".to_owned()))?;

        match engine.call(ping).await {
            Some(result) => tracing::info!(?result.kind, "ping answered"),
            None => tracing::warn!("engine runloop gone before a result arrived"),
        }
    }

    let command_tx = app.command_sender();
    let app_task = tokio::spawn(app.run());

    wait_for_shutdown_signal(command_tx).await;
    app_task.await?;

    Ok(())
}
