// ABOUTME: Entry point for the sandchest control plane binary
// ABOUTME: Loads .env, parses flags, installs logging and runs the server until drained

use clap::{Parser, Subcommand};
use std::net::IpAddr;
use std::process;

use sandchest_cli::{logging, server, Config};

#[derive(Parser)]
#[command(name = "sandchest")]
#[command(about = "Sandchest control plane")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the API server, scheduler and background reapers
    Serve {
        /// Listen port (overrides PORT)
        #[arg(long)]
        port: Option<u16>,
        /// Bind address (overrides SANDCHEST_BIND)
        #[arg(long)]
        bind: Option<IpAddr>,
    },
    /// Validate configuration and print the effective settings
    CheckConfig,
}

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let mut config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Configuration error: {}", e);
            process::exit(2);
        }
    };

    match cli.command {
        Commands::Serve { port, bind } => {
            if let Some(port) = port.filter(|p| *p != 0) {
                config.port = port;
            }
            if let Some(bind) = bind {
                config.bind = bind;
            }
            logging::init(config.log_format);

            if let Err(e) = server::run(config).await {
                tracing::error!(error = ?e, "Server exited with an error");
                process::exit(1);
            }
        }
        Commands::CheckConfig => {
            println!("listen:          {}:{}", config.bind, config.port);
            println!("database:        {}", config.database_url);
            println!("coordination:    {:?}", config.coordination);
            println!("object store:    {:?}", config.object_store);
            println!("api keys:        {}", config.api_keys.len());
            println!("internal token:  {}", if config.internal_token.is_some() { "set" } else { "unset" });
            println!("instance id:     {}", config.instance_id);
        }
    }
}
