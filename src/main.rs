use std::path::PathBuf;

use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use swankd::{CodingSystem, CommunicationStyle, Runtime, Server, ServerConfig};

#[derive(Parser)]
#[command(name = "swankd")]
#[command(about = "Editor protocol server exposing an interactive evaluator")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    #[arg(long, help = "Config file path")]
    config: Option<PathBuf>,

    #[arg(long, help = "Listen host (overrides config)")]
    host: Option<String>,

    #[arg(long, help = "Listen port, 0 for any free port (overrides config)")]
    port: Option<u16>,

    #[arg(long, help = "Write the bound port to this file")]
    port_file: Option<PathBuf>,

    #[arg(long, value_enum, help = "Communication style")]
    style: Option<CommunicationStyle>,

    #[arg(long, help = "Keep accepting after the first connection")]
    keep_listening: bool,

    #[arg(long, value_enum, help = "Coding system for message payloads")]
    coding_system: Option<CodingSystem>,

    #[arg(long, help = "Shared secret file (overrides config)")]
    secret_file: Option<PathBuf>,

    #[arg(long, help = "Open a dedicated output stream per connection")]
    dedicated_output: bool,

    #[arg(long, help = "Source search path, may be repeated")]
    source_path: Vec<PathBuf>,

    #[arg(long, help = "Output as JSON")]
    json: bool,
}

#[derive(clap::Subcommand)]
enum Commands {
    /// Print the effective configuration.
    ShowConfig,
    GenerateConfig {
        #[arg(long, default_value = "swankd.toml", help = "Config file path")]
        output: PathBuf,
    },
}

impl Cli {
    fn apply(&self, config: &mut ServerConfig) {
        if let Some(host) = &self.host {
            config.host = host.clone();
        }
        if let Some(port) = self.port {
            config.port = port;
        }
        if let Some(path) = &self.port_file {
            config.port_file = Some(path.clone());
        }
        if let Some(style) = self.style {
            config.style = style;
        }
        if let Some(coding) = self.coding_system {
            config.coding_system = coding;
        }
        if let Some(path) = &self.secret_file {
            config.secret_file = Some(path.clone());
        }
        if !self.source_path.is_empty() {
            config.source_paths = self.source_path.clone();
        }
        config.keep_listening |= self.keep_listening;
        config.dedicated_output |= self.dedicated_output;
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = ServerConfig::load_or_default(cli.config.as_deref())?;
    cli.apply(&mut config);

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.log_filter))?;
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    match &cli.command {
        Some(Commands::ShowConfig) => {
            if cli.json {
                println!("{}", serde_json::to_string_pretty(&config)?);
            } else {
                print!("{}", toml::to_string_pretty(&config)?);
            }
            return Ok(());
        }
        Some(Commands::GenerateConfig { output }) => {
            config.save(output)?;
            if cli.json {
                println!("{}", serde_json::json!({"config_file": output}));
            } else {
                println!("Configuration written to {}", output.display());
            }
            return Ok(());
        }
        None => {}
    }

    let runtime = Runtime::builtin(config.source_paths.clone());
    let (port, style, keep_listening) = (config.port, config.style, config.keep_listening);
    let server = Server::new(config, runtime);

    let actual = server.listen(port, style, keep_listening).await?;
    if cli.json {
        println!("{}", serde_json::json!({"port": actual, "style": style.as_str()}));
    } else {
        println!("swankd listening on port {}", actual);
    }

    match style {
        CommunicationStyle::Spawn => {
            server.wait_for_quit().await;
            info!("Quit requested");
        }
        CommunicationStyle::None => info!("Connection served"),
    }
    server.shutdown();
    Ok(())
}
