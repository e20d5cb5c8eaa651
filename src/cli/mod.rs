//! Command-line interface parsing and handling
//!
//! The `mcpool` binary drives a pool for one user at a time, which is enough
//! to probe servers and complete an authorization by hand.

use std::error::Error;
use std::fmt::Write as _;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};

use crate::core::config::data::path_display;
use crate::core::config::PoolConfig;
use crate::core::store::FileStore;
use crate::mcp::pool::{ClientPool, UserTools};

#[derive(Parser, Debug)]
#[command(name = "mcpool")]
#[command(about = "Per-user MCP client pool with OAuth authorization")]
#[command(
    long_about = "mcpool connects a user to every configured MCP server, lists the tools they \
expose and calls them. Servers that need OAuth print an authorization URL; after the browser \
redirect, pass the state and code to 'mcpool callback' to store the token.\n\n\
Environment Variables:\n\
  RUST_LOG          Log filter (defaults to mcpool=info)"
)]
pub struct Args {
    #[command(subcommand)]
    pub command: Commands,

    /// Pool configuration file (TOML)
    #[arg(short = 'c', long, global = true, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Key-value store holding OAuth clients, sessions and tokens
    #[arg(short = 's', long, global = true, value_name = "PATH")]
    pub store: Option<PathBuf>,
}

#[derive(Subcommand, Debug, PartialEq, Eq)]
pub enum Commands {
    /// Connect every configured server for a user and list their tools
    Tools {
        #[arg(short, long)]
        user: String,
    },
    /// Call one tool on behalf of a user
    Call {
        #[arg(short, long)]
        user: String,
        #[arg(short, long)]
        tool: String,
        /// Tool arguments as a JSON object
        #[arg(short, long, value_name = "JSON")]
        args: Option<String>,
    },
    /// Complete an authorization flow with the state and code from the redirect
    Callback {
        #[arg(short, long)]
        user: String,
        #[arg(long)]
        state: String,
        #[arg(long)]
        code: String,
    },
}

pub fn main() -> Result<(), Box<dyn Error>> {
    tokio::runtime::Runtime::new()?.block_on(async_main())
}

async fn async_main() -> Result<(), Box<dyn Error>> {
    let args = Args::parse();

    let config_path = args
        .config
        .or_else(PoolConfig::default_path)
        .ok_or("no config path given and no platform config directory found")?;
    let store_path = args
        .store
        .or_else(PoolConfig::default_store_path)
        .ok_or("no store path given and no platform data directory found")?;
    let config = PoolConfig::load_from_path(&config_path)?;
    tracing::debug!(
        config = %path_display(&config_path),
        store = %path_display(&store_path),
        servers = config.servers.len(),
        "Loaded pool configuration"
    );

    let pool = ClientPool::new(config, Arc::new(FileStore::new(store_path)))?;
    let outcome = run(&pool, args.command).await;
    pool.shutdown().await;
    outcome
}

async fn run(pool: &ClientPool, command: Commands) -> Result<(), Box<dyn Error>> {
    match command {
        Commands::Tools { user } => {
            let tools = pool.get_tools_for_user(&user).await?;
            print!("{}", format_user_tools(&tools));
        }
        Commands::Call { user, tool, args } => {
            let tools = pool.get_tools_for_user(&user).await?;
            let Some(found) = tools.tool(&tool) else {
                if let Some(errors) = &tools.errors {
                    eprintln!("⚠️  {errors}");
                }
                return Err(format!("tool not available for {user}: {tool}").into());
            };
            let result = found.call_json(args.as_deref().unwrap_or("")).await?;
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
        Commands::Callback { user, state, code } => {
            let session = pool.process_oauth_callback(&user, &state, &code).await?;
            println!("✅ Authorized {} for {}", session.server_id, session.user_id);
        }
    }
    Ok(())
}

/// Tools grouped by server, followed by servers that need attention.
pub fn format_user_tools(user_tools: &UserTools) -> String {
    let mut output = String::new();
    let mut current_server: Option<&str> = None;
    let mut tools: Vec<_> = user_tools.tools.iter().collect();
    tools.sort_by(|a, b| (&a.server_name, a.name()).cmp(&(&b.server_name, b.name())));

    for tool in tools {
        if current_server != Some(tool.server_name.as_str()) {
            let _ = writeln!(output, "{}:", tool.server_name);
            current_server = Some(tool.server_name.as_str());
        }
        match tool.description() {
            Some(description) if !description.trim().is_empty() => {
                let _ = writeln!(output, "  {} - {}", tool.name(), description.trim());
            }
            _ => {
                let _ = writeln!(output, "  {}", tool.name());
            }
        }
    }

    if let Some(errors) = &user_tools.errors {
        for auth in &errors.auth_errors {
            let _ = writeln!(
                output,
                "🔐 {} requires authorization: {}",
                auth.server_name, auth.auth_url
            );
        }
        for error in &errors.errors {
            let _ = writeln!(output, "❌ {}: {}", error.server_name, error.message);
        }
    }
    output
}
